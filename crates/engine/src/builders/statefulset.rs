use k8s_openapi::api::apps::v1::StatefulSet;
use serde_json::{json, Value as Json};
use trellis_core::{Cluster, ObjectKey};

use super::{apply_fragment, metadata, Labels};
use crate::error::BuildError;
use crate::reconcile::Builder;

pub const CONTAINER_NAME: &str = "db";
pub const DATA_VOLUME: &str = "datadir";
const DATA_PATH: &str = "/cockroach/cockroach-data";

/// One pod per node, each with its own data volume.
#[derive(Debug, Clone)]
pub struct StatefulSetBuilder {
    cluster: Cluster,
    labels: Labels,
}

impl StatefulSetBuilder {
    pub fn new(cluster: &Cluster) -> Self { Self { cluster: cluster.clone(), labels: Labels::for_cluster(cluster) } }

    fn container(&self) -> Json {
        let spec = &self.cluster.spec;
        json!({
            "name": CONTAINER_NAME,
            "image": spec.image,
            "imagePullPolicy": "IfNotPresent",
            "ports": [
                { "name": "grpc", "containerPort": spec.grpc_port, "protocol": "TCP" },
                { "name": "http", "containerPort": spec.http_port, "protocol": "TCP" },
            ],
            "volumeMounts": [ { "name": DATA_VOLUME, "mountPath": DATA_PATH } ],
            "readinessProbe": {
                "httpGet": { "path": "/health?ready=1", "port": "http" },
                "initialDelaySeconds": 10,
                "periodSeconds": 5,
                "failureThreshold": 2,
            },
        })
    }

    fn claim_template(&self) -> Json {
        let spec = &self.cluster.spec;
        let mut claim = json!({
            "metadata": { "name": DATA_VOLUME },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": spec.storage } },
            },
        });
        if let Some(class) = &spec.storage_class {
            claim["spec"]["storageClassName"] = json!(class);
        }
        claim
    }
}

impl Builder for StatefulSetBuilder {
    type Object = StatefulSet;

    fn key(&self) -> ObjectKey { ObjectKey::new(self.cluster.namespace(), self.cluster.stateful_set_name()) }

    fn build(&self, obj: &mut StatefulSet) -> Result<(), BuildError> {
        let spec = &self.cluster.spec;
        if spec.nodes < 1 {
            return Err(BuildError::Invalid(format!("nodes must be at least 1, got {}", spec.nodes)));
        }
        if spec.image.is_empty() {
            return Err(BuildError::Invalid("image must not be empty".into()));
        }
        apply_fragment(
            obj,
            json!({
                "metadata": metadata(&self.cluster, &self.labels),
                "spec": {
                    "serviceName": self.cluster.discovery_service_name(),
                    "replicas": spec.nodes,
                    "selector": { "matchLabels": self.labels.selector() },
                    "podManagementPolicy": "Parallel",
                    "updateStrategy": { "type": "RollingUpdate" },
                    "template": {
                        "metadata": { "labels": self.labels.common() },
                        "spec": {
                            "terminationGracePeriodSeconds": 60,
                            "containers": [self.container()],
                        },
                    },
                    "volumeClaimTemplates": [self.claim_template()],
                },
            }),
        )
    }
}
