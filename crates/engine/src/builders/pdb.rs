use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use serde_json::json;
use trellis_core::{Cluster, ObjectKey};

use super::{apply_fragment, metadata, Labels};
use crate::error::BuildError;
use crate::reconcile::Builder;

/// Limits voluntary disruptions to `maxUnavailable` nodes (one by default).
#[derive(Debug, Clone)]
pub struct DisruptionBudget {
    cluster: Cluster,
    labels: Labels,
}

impl DisruptionBudget {
    pub fn new(cluster: &Cluster) -> Self { Self { cluster: cluster.clone(), labels: Labels::for_cluster(cluster) } }
}

impl Builder for DisruptionBudget {
    type Object = PodDisruptionBudget;

    fn key(&self) -> ObjectKey { ObjectKey::new(self.cluster.namespace(), self.cluster.disruption_budget_name()) }

    fn build(&self, obj: &mut PodDisruptionBudget) -> Result<(), BuildError> {
        let max_unavailable = self.cluster.spec.max_unavailable.unwrap_or(1);
        if max_unavailable < 1 {
            return Err(BuildError::Invalid(format!("maxUnavailable must be at least 1, got {max_unavailable}")));
        }
        apply_fragment(
            obj,
            json!({
                "metadata": metadata(&self.cluster, &self.labels),
                "spec": {
                    "maxUnavailable": max_unavailable,
                    "selector": { "matchLabels": self.labels.selector() },
                },
            }),
        )
    }
}
