//! Actors: condition-gated actions run against one owner per pass.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use trellis_core::{Cluster, ConditionType, Conditions, Feature, FeatureGates};

use crate::builders::{DiscoveryService, DisruptionBudget, PublicService, StatefulSetBuilder};
use crate::cancel::PassContext;
use crate::error::ActorError;
use crate::gate::{ConditionGate, Predicate};
use crate::reconcile::ReconcileEngine;
use crate::sequencer::ActionSequencer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Deploy,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Deploy => f.write_str("Deploy"),
        }
    }
}

#[async_trait]
pub trait Actor: Send + Sync {
    fn action_type(&self) -> ActionType;

    /// Whether this actor is eligible given the owner's conditions.
    fn handles(&self, conds: &Conditions) -> bool;

    async fn act(&self, pass: &mut PassContext, owner: &Cluster) -> Result<(), ActorError>;
}

/// Creates or updates the database's services, statefulset and disruption budget.
pub struct Deploy {
    engine: Arc<ReconcileEngine>,
    gate: ConditionGate,
    sequencer: ActionSequencer,
}

impl Deploy {
    pub fn new(engine: Arc<ReconcileEngine>, gates: &FeatureGates) -> Self {
        Self { engine, gate: Self::gate(gates), sequencer: Self::steps() }
    }

    /// Initialized must be recorded (True or False); with the version validator
    /// on, the version check must also have passed.
    pub fn gate(gates: &FeatureGates) -> ConditionGate {
        ConditionGate::new(Predicate::Any(vec![
            Predicate::is_true(ConditionType::INITIALIZED),
            Predicate::is_false(ConditionType::INITIALIZED),
        ]))
        .require_if(gates.enabled(Feature::VersionValidator), Predicate::is_true(ConditionType::VERSION_CHECKED))
    }

    /// The ordered step list; the budget is only meaningful with more than one node.
    pub fn steps() -> ActionSequencer {
        ActionSequencer::new(ActionType::Deploy)
            .step("discovery service", DiscoveryService::new)
            .step("public service", PublicService::new)
            .step("statefulset", StatefulSetBuilder::new)
            .guarded_step("pod disruption budget", DisruptionBudget::new, |c: &Cluster| c.spec.nodes > 1)
    }

    pub fn sequencer(&self) -> &ActionSequencer { &self.sequencer }
}

#[async_trait]
impl Actor for Deploy {
    fn action_type(&self) -> ActionType { ActionType::Deploy }

    fn handles(&self, conds: &Conditions) -> bool { self.gate.handles(conds) }

    async fn act(&self, pass: &mut PassContext, owner: &Cluster) -> Result<(), ActorError> {
        info!(cluster = %owner.key(), "reconciling resources on deploy action");
        self.sequencer.act(&self.engine, pass, owner).await?;
        if !pass.is_cancelled() {
            info!(cluster = %owner.key(), "deployed database");
        }
        Ok(())
    }
}
