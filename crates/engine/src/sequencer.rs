//! Ordered steps for one owner; at most one write per pass.

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, trace};
use trellis_core::Cluster;

use crate::cancel::PassContext;
use crate::error::{ActorError, BuildError, ReconcileError};
use crate::reconcile::{desired, Builder, ReconcileEngine};
use crate::ActionType;

/// Result of one step that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Changed,
}

impl From<bool> for Outcome {
    fn from(changed: bool) -> Self {
        if changed { Outcome::Changed } else { Outcome::Unchanged }
    }
}

/// Type-erased builder so steps with different object kinds share one list.
#[async_trait]
pub trait ErasedBuilder: Send + Sync {
    async fn run(&self, engine: &ReconcileEngine) -> Result<Outcome, ReconcileError>;

    /// The object this builder would create, serialized.
    fn render(&self) -> Result<serde_json::Value, BuildError>;
}

#[async_trait]
impl<B: Builder + 'static> ErasedBuilder for B {
    async fn run(&self, engine: &ReconcileEngine) -> Result<Outcome, ReconcileError> {
        engine.reconcile(self).await.map(Outcome::from)
    }

    fn render(&self) -> Result<serde_json::Value, BuildError> {
        Ok(serde_json::to_value(desired(self)?)?)
    }
}

type MakeFn = Box<dyn Fn(&Cluster) -> Box<dyn ErasedBuilder> + Send + Sync>;
type GuardFn = Box<dyn Fn(&Cluster) -> bool + Send + Sync>;

fn erase<B, F>(make: F) -> MakeFn
where
    B: Builder + 'static,
    F: Fn(&Cluster) -> B + Send + Sync + 'static,
{
    Box::new(move |c: &Cluster| -> Box<dyn ErasedBuilder> { Box::new(make(c)) })
}

struct Step {
    label: String,
    make: MakeFn,
    guard: Option<GuardFn>,
}

/// Runs its steps in order; stops at the first error or the first write.
pub struct ActionSequencer {
    action: ActionType,
    steps: Vec<Step>,
}

impl ActionSequencer {
    pub fn new(action: ActionType) -> Self { Self { action, steps: Vec::new() } }

    /// Append a step whose builder is made fresh from the owner on every pass.
    pub fn step<B, F>(mut self, label: &str, make: F) -> Self
    where
        B: Builder + 'static,
        F: Fn(&Cluster) -> B + Send + Sync + 'static,
    {
        self.steps.push(Step { label: label.to_string(), make: erase(make), guard: None });
        self
    }

    /// Like `step`, skipped entirely when `guard` is false for the owner.
    pub fn guarded_step<B, F, G>(mut self, label: &str, make: F, guard: G) -> Self
    where
        B: Builder + 'static,
        F: Fn(&Cluster) -> B + Send + Sync + 'static,
        G: Fn(&Cluster) -> bool + Send + Sync + 'static,
    {
        self.steps.push(Step {
            label: label.to_string(),
            make: erase(make),
            guard: Some(Box::new(guard)),
        });
        self
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> { self.steps.iter().map(|s| s.label.as_str()) }

    /// Desired objects per step for `owner`, without touching a store.
    /// Steps whose guard is false render as `None`.
    pub fn render(&self, owner: &Cluster) -> Result<Vec<(String, Option<serde_json::Value>)>, BuildError> {
        let mut out = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let skipped = step.guard.as_ref().is_some_and(|g| !g(owner));
            let rendered = if skipped { None } else { Some((step.make)(owner).render()?) };
            out.push((step.label.clone(), rendered));
        }
        Ok(out)
    }

    /// Reconcile steps in order. On the first change the pass is cancelled and the
    /// remaining steps are left for the next pass.
    pub async fn act(&self, engine: &ReconcileEngine, pass: &mut PassContext, owner: &Cluster) -> Result<(), ActorError> {
        for step in &self.steps {
            if let Some(guard) = &step.guard {
                if !guard(owner) {
                    trace!(action = %self.action, step = %step.label, "guard false, skipping");
                    continue;
                }
            }
            let builder = (step.make)(owner);
            let outcome = builder
                .run(engine)
                .await
                .map_err(|source| ActorError { action: self.action, step: step.label.clone(), source })?;
            if outcome == Outcome::Changed {
                debug!(action = %self.action, step = %step.label, "created/updated, stopping request processing");
                counter!("sequencer_cancel_total", 1u64, "action" => self.action.to_string());
                pass.cancel_loop(format!("created/updated {}", step.label));
                return Ok(());
            }
        }
        Ok(())
    }
}
