#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::core::{ApiResource, DynamicObject};
use serde_json::json;
use trellis_apply::LAST_APPLIED_ANNOTATION;
use trellis_core::{Cluster, ClusterSpec, ObjectKey};
use trellis_engine::builders::{PublicService, StatefulSetBuilder};
use trellis_engine::{BuildError, Builder, PersistMode, ReconcileEngine, ReconcileError};
use trellis_kubehub::memory::Op;
use trellis_kubehub::MemoryStore;

fn cluster() -> Cluster {
    let spec: ClusterSpec = serde_json::from_value(json!({"nodes": 3, "image": "db:1"})).unwrap();
    Cluster::new("prod", "db", spec)
}

fn engine(store: &MemoryStore) -> ReconcileEngine { ReconcileEngine::new(Arc::new(store.clone())) }

fn svc() -> ApiResource { ApiResource::erase::<Service>(&()) }
fn cm() -> ApiResource { ApiResource::erase::<ConfigMap>(&()) }

/// Owns the whole `data` map of one config map.
struct Settings {
    key: ObjectKey,
    data: BTreeMap<String, String>,
}

impl Settings {
    fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            key: ObjectKey::new("prod", "settings"),
            data: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }
}

impl Builder for Settings {
    type Object = ConfigMap;
    fn key(&self) -> ObjectKey { self.key.clone() }
    fn build(&self, obj: &mut ConfigMap) -> Result<(), BuildError> {
        obj.data = Some(self.data.clone());
        Ok(())
    }
}

/// Tries to move its object to another name.
struct Renamer;

impl Builder for Renamer {
    type Object = ConfigMap;
    fn key(&self) -> ObjectKey { ObjectKey::new("prod", "settings") }
    fn build(&self, obj: &mut ConfigMap) -> Result<(), BuildError> {
        obj.metadata.name = Some("elsewhere".into());
        Ok(())
    }
}

/// Replaces the whole service spec, never mentioning `clusterIP`.
struct WholesaleService;

impl Builder for WholesaleService {
    type Object = Service;
    fn key(&self) -> ObjectKey { ObjectKey::new("prod", "front") }
    fn build(&self, obj: &mut Service) -> Result<(), BuildError> {
        obj.spec = Some(serde_json::from_value(json!({
            "type": "ClusterIP",
            "ports": [{"name": "http", "port": 80}],
            "selector": {"app": "front"},
        }))?);
        Ok(())
    }
}

fn assign_cluster_ip(obj: &mut DynamicObject) {
    if obj.data["spec"].get("clusterIP").is_none() {
        obj.data["spec"]["clusterIP"] = json!("10.0.0.9");
    }
}

#[tokio::test]
async fn second_run_is_a_noop() {
    let store = MemoryStore::new();
    let engine = engine(&store);
    let builder = PublicService::new(&cluster());

    assert!(engine.reconcile(&builder).await.unwrap());
    let first = store.object(&svc(), &builder.key()).unwrap();
    assert!(first.metadata.annotations.as_ref().unwrap().contains_key(LAST_APPLIED_ANNOTATION));

    store.clear_calls();
    assert!(!engine.reconcile(&builder).await.unwrap());
    assert_eq!(store.writes(), 0);
    let second = store.object(&svc(), &builder.key()).unwrap();
    assert_eq!(first.data["spec"], second.data["spec"]);
    assert_eq!(first.metadata.resource_version, second.metadata.resource_version);
}

#[tokio::test]
async fn identity_change_is_rejected_without_writing() {
    let store = MemoryStore::new();
    let err = engine(&store).reconcile(&Renamer).await.unwrap_err();
    assert!(matches!(err, ReconcileError::IdentityMutation { .. }));
    assert!(!err.is_retryable());
    assert_eq!(store.writes(), 0);
    assert!(store.is_empty());

    engine(&store).reconcile(&Settings::new(&[("a", "1")])).await.unwrap();
    store.clear_calls();
    let err = engine(&store).reconcile(&Renamer).await.unwrap_err();
    assert!(matches!(err, ReconcileError::IdentityMutation { .. }));
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn status_changes_do_not_trigger_writes() {
    let store = MemoryStore::new();
    let engine = engine(&store);
    let builder = StatefulSetBuilder::new(&cluster());
    let sts = ApiResource::erase::<StatefulSet>(&());
    assert!(engine.reconcile(&builder).await.unwrap());

    store.set_status(&sts, &builder.key(), json!({"replicas": 3, "readyReplicas": 1}));
    store.modify(&sts, &builder.key(), |obj| {
        let claim = &mut obj.data["spec"]["volumeClaimTemplates"][0];
        claim["apiVersion"] = json!("v1");
        claim["kind"] = json!("PersistentVolumeClaim");
        claim["status"] = json!({"phase": "Pending"});
    });
    store.clear_calls();
    assert!(!engine.reconcile(&builder).await.unwrap());
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn server_defaults_are_not_fought_over() {
    let store = MemoryStore::new().with_defaulter(&svc(), assign_cluster_ip);
    let engine = engine(&store);
    assert!(engine.reconcile(&WholesaleService).await.unwrap());
    let live = store.object(&svc(), &WholesaleService.key()).unwrap();
    assert_eq!(live.data["spec"]["clusterIP"], "10.0.0.9");

    store.clear_calls();
    assert!(!engine.reconcile(&WholesaleService).await.unwrap());
    assert!(!engine.reconcile(&WholesaleService).await.unwrap());
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn plain_mode_writes_on_any_difference() {
    let store = MemoryStore::new().with_defaulter(&svc(), assign_cluster_ip);
    let engine = engine(&store).with_mode(PersistMode::Plain);
    assert!(engine.reconcile(&WholesaleService).await.unwrap());
    let live = store.object(&svc(), &WholesaleService.key()).unwrap();
    assert!(live.metadata.annotations.is_none());

    // the defaulted clusterIP is not in the desired spec, so plain mode wants it gone
    assert!(engine.reconcile(&WholesaleService).await.unwrap());
}

#[tokio::test]
async fn dropped_field_is_removed_once() {
    let store = MemoryStore::new();
    let engine = engine(&store);
    let key = ObjectKey::new("prod", "settings");
    assert!(engine.reconcile(&Settings::new(&[("a", "1"), ("b", "2")])).await.unwrap());
    assert!(engine.reconcile(&Settings::new(&[("a", "1")])).await.unwrap());

    let live = store.object(&cm(), &key).unwrap();
    assert_eq!(live.data["data"], json!({"a": "1"}));
    store.clear_calls();
    assert!(!engine.reconcile(&Settings::new(&[("a", "1")])).await.unwrap());
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn label_dropped_from_owner_is_removed() {
    let store = MemoryStore::new().with_defaulter(&svc(), assign_cluster_ip);
    let engine = engine(&store);
    let mut owner = cluster();
    owner.spec.additional_labels.insert("team".into(), "storage".into());
    assert!(engine.reconcile(&PublicService::new(&owner)).await.unwrap());
    let key = PublicService::new(&owner).key();
    store.modify(&svc(), &key, |obj| {
        obj.metadata.labels.get_or_insert_with(Default::default).insert("owner".into(), "ops".into());
    });
    assert!(!engine.reconcile(&PublicService::new(&owner)).await.unwrap());

    owner.spec.additional_labels.clear();
    store.clear_calls();
    assert!(engine.reconcile(&PublicService::new(&owner)).await.unwrap());
    assert_eq!(store.writes(), 1);
    let live = store.object(&svc(), &key).unwrap();
    let labels = live.metadata.labels.unwrap();
    assert!(!labels.contains_key("team"));
    assert_eq!(labels["owner"], "ops");
    assert_eq!(labels["app.kubernetes.io/instance"], "db");
    assert_eq!(live.data["spec"]["clusterIP"], "10.0.0.9");

    store.clear_calls();
    assert!(!engine.reconcile(&PublicService::new(&owner)).await.unwrap());
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn plain_mode_keeps_fields_the_builder_stopped_setting() {
    let store = MemoryStore::new();
    let engine = engine(&store).with_mode(PersistMode::Plain);
    let mut owner = cluster();
    owner.spec.additional_labels.insert("team".into(), "storage".into());
    assert!(engine.reconcile(&PublicService::new(&owner)).await.unwrap());

    owner.spec.additional_labels.clear();
    assert!(!engine.reconcile(&PublicService::new(&owner)).await.unwrap());
    let live = store.object(&svc(), &PublicService::new(&owner).key()).unwrap();
    assert_eq!(live.metadata.labels.unwrap()["team"], "storage");
}

#[tokio::test]
async fn conflict_is_surfaced_and_retryable() {
    let store = MemoryStore::new();
    let engine = engine(&store);
    engine.reconcile(&Settings::new(&[("a", "1")])).await.unwrap();

    store.inject_conflicts(1);
    let err = engine.reconcile(&Settings::new(&[("a", "2")])).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(err.is_retryable());
    assert_eq!(err.kind(), "ConfigMap");

    assert!(engine.reconcile(&Settings::new(&[("a", "2")])).await.unwrap());
    let updates = store.calls().iter().filter(|c| c.op == Op::Update).count();
    assert_eq!(updates, 2);
}

#[tokio::test]
async fn oversized_snapshot_fails_before_writing() {
    let store = MemoryStore::new();
    let engine = ReconcileEngine::from_config(
        Arc::new(store.clone()),
        &trellis_core::Config { max_annotation_bytes: 64, ..Default::default() },
    );
    let big = "x".repeat(128);
    let err = engine.reconcile(&Settings::new(&[("blob", big.as_str())])).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Diff { .. }));
    assert!(!err.is_retryable());
    assert_eq!(store.writes(), 0);
}
