//! Trellis engine: converges the objects a database cluster owns.
//!
//! One pass runs each eligible actor once. An actor's sequencer walks its
//! steps in order and reconciles one object per step; the first step that
//! writes cancels the pass, so every pass issues at most one write and the
//! next pass starts from fresh state.

#![forbid(unsafe_code)]

pub mod actor;
pub mod builders;
pub mod cancel;
pub mod error;
pub mod gate;
pub mod reconcile;
pub mod sequencer;

pub use actor::{ActionType, Actor, Deploy};
pub use cancel::{CancelSignal, Cancellation, LoopCanceller, PassContext};
pub use error::{ActorError, BuildError, ReconcileError, Stage};
pub use gate::{ConditionGate, Predicate};
pub use reconcile::{desired, Builder, PersistMode, ReconcileEngine};
pub use sequencer::{ActionSequencer, Outcome};
