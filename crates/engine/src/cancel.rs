//! One-shot "state changed, stop this pass" signal for the outer loop.

use tokio::sync::oneshot;
use tracing::debug;
use trellis_core::ObjectKey;

/// Why a pass was cut short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub reason: String,
}

/// Fires at most once; consumed by `cancel`.
#[derive(Debug)]
pub struct LoopCanceller {
    tx: oneshot::Sender<Cancellation>,
}

impl LoopCanceller {
    pub fn cancel(self, reason: impl Into<String>) {
        let _ = self.tx.send(Cancellation { reason: reason.into() });
    }
}

/// Receiving half, held by the outer loop.
#[derive(Debug)]
pub struct CancelSignal {
    rx: oneshot::Receiver<Cancellation>,
}

impl CancelSignal {
    /// The cancellation, if the pass fired one.
    pub fn fired(&mut self) -> Option<Cancellation> { self.rx.try_recv().ok() }
}

/// Per-pass state handed to an actor: the owner being reconciled and the canceller.
#[derive(Debug)]
pub struct PassContext {
    owner: ObjectKey,
    canceller: Option<LoopCanceller>,
}

impl PassContext {
    pub fn new(owner: ObjectKey) -> (Self, CancelSignal) {
        let (tx, rx) = oneshot::channel();
        (Self { owner, canceller: Some(LoopCanceller { tx }) }, CancelSignal { rx })
    }

    pub fn owner(&self) -> &ObjectKey { &self.owner }

    /// Fire the canceller. Returns false if it already fired this pass.
    pub fn cancel_loop(&mut self, reason: impl Into<String>) -> bool {
        match self.canceller.take() {
            Some(c) => {
                let reason = reason.into();
                debug!(owner = %self.owner, reason = %reason, "cancelling pass");
                c.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self) -> bool { self.canceller.is_none() }
}
