use k8s_openapi::api::core::v1::Service;
use serde_json::{json, Value as Json};
use trellis_core::{Cluster, ObjectKey};

use super::{apply_fragment, metadata, Labels};
use crate::error::BuildError;
use crate::reconcile::Builder;

fn ports(cluster: &Cluster) -> Json {
    json!([
        { "name": "grpc", "port": cluster.spec.grpc_port, "targetPort": cluster.spec.grpc_port, "protocol": "TCP" },
        { "name": "http", "port": cluster.spec.http_port, "targetPort": cluster.spec.http_port, "protocol": "TCP" },
    ])
}

/// Headless service the nodes use to find each other.
///
/// Publishes not-ready addresses so peers can join before they pass readiness.
#[derive(Debug, Clone)]
pub struct DiscoveryService {
    cluster: Cluster,
    labels: Labels,
}

impl DiscoveryService {
    pub fn new(cluster: &Cluster) -> Self { Self { cluster: cluster.clone(), labels: Labels::for_cluster(cluster) } }
}

impl Builder for DiscoveryService {
    type Object = Service;

    fn key(&self) -> ObjectKey { ObjectKey::new(self.cluster.namespace(), self.cluster.discovery_service_name()) }

    fn build(&self, obj: &mut Service) -> Result<(), BuildError> {
        let mut meta = metadata(&self.cluster, &self.labels);
        meta["annotations"] = json!({
            "prometheus.io/scrape": "true",
            "prometheus.io/path": "_status/vars",
            "prometheus.io/port": self.cluster.spec.http_port.to_string(),
        });
        apply_fragment(
            obj,
            json!({
                "metadata": meta,
                "spec": {
                    "clusterIP": "None",
                    "publishNotReadyAddresses": true,
                    "ports": ports(&self.cluster),
                    "selector": self.labels.selector(),
                },
            }),
        )
    }
}

/// Client-facing ClusterIP service.
#[derive(Debug, Clone)]
pub struct PublicService {
    cluster: Cluster,
    labels: Labels,
}

impl PublicService {
    pub fn new(cluster: &Cluster) -> Self { Self { cluster: cluster.clone(), labels: Labels::for_cluster(cluster) } }
}

impl Builder for PublicService {
    type Object = Service;

    fn key(&self) -> ObjectKey { ObjectKey::new(self.cluster.namespace(), self.cluster.public_service_name()) }

    fn build(&self, obj: &mut Service) -> Result<(), BuildError> {
        apply_fragment(
            obj,
            json!({
                "metadata": metadata(&self.cluster, &self.labels),
                "spec": {
                    "type": "ClusterIP",
                    "ports": ports(&self.cluster),
                    "selector": self.labels.selector(),
                },
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::desired;
    use trellis_core::ClusterSpec;

    fn cluster() -> Cluster {
        let spec: ClusterSpec = serde_json::from_value(json!({"nodes": 3, "image": "db:1"})).unwrap();
        Cluster::new("prod", "db", spec)
    }

    #[test]
    fn discovery_is_headless() {
        let svc = desired(&DiscoveryService::new(&cluster())).unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("db"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 26257);
        assert_eq!(svc.metadata.annotations.unwrap()["prometheus.io/port"], "8080");
    }

    #[test]
    fn public_keeps_assigned_cluster_ip() {
        let builder = PublicService::new(&cluster());
        assert_eq!(builder.key(), ObjectKey::new("prod", "db-public"));
        let mut live = desired(&builder).unwrap();
        live.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.7".into());
        builder.build(&mut live).unwrap();
        let spec = live.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    }
}
