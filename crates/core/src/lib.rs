//! Trellis core types: owner model, object keys, conditions and feature gates.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod conditions;
pub mod features;

pub use conditions::{ClusterCondition, ConditionStatus, ConditionType, Conditions};
pub use features::{Feature, FeatureGates};

/// API group/version stamped into owner references of managed objects.
pub const OWNER_API_VERSION: &str = "trellis.dev/v1alpha1";
/// Kind of the owning cluster object.
pub const OWNER_KIND: &str = "DbCluster";

/// Default upper bound for the serialized last-applied snapshot (the API server's
/// total annotation budget).
pub const DEFAULT_MAX_ANNOTATION_BYTES: usize = 262_144;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown feature gate: {0}")]
    UnknownFeature(String),
    #[error("invalid feature gate entry '{0}' (expect Name=true|false)")]
    InvalidGate(String),
}

/// Identity of a namespaced object. Never changes across a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn default_grpc_port() -> i32 { 26257 }
fn default_http_port() -> i32 { 8080 }
fn default_storage() -> String { "10Gi".to_string() }

/// Desired state of a database cluster as declared by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub nodes: i32,
    pub image: String,
    #[serde(default = "default_grpc_port")]
    pub grpc_port: i32,
    #[serde(default = "default_http_port")]
    pub http_port: i32,
    /// Requested volume size per node, e.g. `10Gi`.
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Disruption budget; defaults to one unavailable node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(default)]
    pub conditions: Conditions,
}

/// The owner all managed objects are subordinate to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ClusterMeta,
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

impl Cluster {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ClusterSpec) -> Self {
        Self {
            metadata: ClusterMeta { name: name.into(), namespace: namespace.into(), uid: None },
            spec,
            status: ClusterStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey { ObjectKey::new(&self.metadata.namespace, &self.metadata.name) }
    pub fn name(&self) -> &str { &self.metadata.name }
    pub fn namespace(&self) -> &str { &self.metadata.namespace }
    pub fn spec(&self) -> &ClusterSpec { &self.spec }
    pub fn conditions(&self) -> &Conditions { &self.status.conditions }

    /// Headless service used for peer discovery; shares the cluster name.
    pub fn discovery_service_name(&self) -> String { self.metadata.name.clone() }
    pub fn public_service_name(&self) -> String { format!("{}-public", self.metadata.name) }
    pub fn stateful_set_name(&self) -> String { self.metadata.name.clone() }
    pub fn disruption_budget_name(&self) -> String { format!("{}-budget", self.metadata.name) }
}

/// Runtime knobs shared by the engine and the host binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_annotation_bytes: usize,
    pub feature_gates: FeatureGates,
}

impl Default for Config {
    fn default() -> Self {
        Self { max_annotation_bytes: DEFAULT_MAX_ANNOTATION_BYTES, feature_gates: FeatureGates::default() }
    }
}

fn max_annotation_bytes() -> usize {
    std::env::var("TRELLIS_MAX_ANNOTATION_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_ANNOTATION_BYTES)
}

impl Config {
    /// Read `TRELLIS_MAX_ANNOTATION_BYTES` and `TRELLIS_FEATURE_GATES`.
    pub fn from_env() -> Result<Self, CoreError> {
        let feature_gates = match std::env::var("TRELLIS_FEATURE_GATES") {
            Ok(raw) => FeatureGates::parse(&raw)?,
            Err(_) => FeatureGates::default(),
        };
        Ok(Self { max_annotation_bytes: max_annotation_bytes(), feature_gates })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: trellis.dev/v1alpha1
kind: DbCluster
metadata:
  name: db
  namespace: prod
  uid: 6f1c9f3e-0000-0000-0000-000000000001
spec:
  nodes: 3
  image: cockroachdb/cockroach:v23.1.0
status:
  conditions:
    - type: Initialized
      status: "False"
"#;

    #[test]
    fn manifest_fills_defaults() {
        let c: Cluster = serde_yaml::from_str(MANIFEST).expect("parse");
        assert_eq!(c.key(), ObjectKey::new("prod", "db"));
        assert_eq!(c.spec.grpc_port, 26257);
        assert_eq!(c.spec.http_port, 8080);
        assert_eq!(c.spec.storage, "10Gi");
        assert!(c.spec.max_unavailable.is_none());
        assert!(c.conditions().is_false(&ConditionType::INITIALIZED));
    }

    #[test]
    fn derived_names() {
        let c: Cluster = serde_yaml::from_str(MANIFEST).expect("parse");
        assert_eq!(c.discovery_service_name(), "db");
        assert_eq!(c.public_service_name(), "db-public");
        assert_eq!(c.stateful_set_name(), "db");
        assert_eq!(c.disruption_budget_name(), "db-budget");
    }

    #[test]
    fn object_key_display() {
        assert_eq!(ObjectKey::new("ns", "x").to_string(), "ns/x");
    }
}
