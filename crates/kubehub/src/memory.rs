//! In-process object store.
//!
//! Objects are keyed by `(apiVersion/kind, namespace/name)`. Every write bumps a
//! global resourceVersion; updates carrying a stale version are rejected with
//! `Conflict`, like the API server. `status` is owned by the store: updates
//! never change it, only `set_status` does.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject};
use rustc_hash::FxHashMap;
use tracing::debug;
use trellis_core::ObjectKey;

use crate::{key_of, ObjectStore, StoreError};

/// Server-side defaulting hook, applied after every create and update.
pub type Defaulter = Arc<dyn Fn(&mut DynamicObject) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub kind: String,
    pub key: ObjectKey,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<(String, ObjectKey), DynamicObject>,
    rv: u64,
    calls: Vec<Call>,
    conflicts_pending: usize,
}

#[derive(Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    defaulters: Arc<FxHashMap<String, Defaulter>>,
}

fn type_key(resource: &ApiResource) -> String {
    format!("{}/{}", resource.api_version, resource.kind)
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Register a defaulting hook for objects of `resource`'s kind.
    pub fn with_defaulter(mut self, resource: &ApiResource, f: impl Fn(&mut DynamicObject) + Send + Sync + 'static) -> Self {
        let mut map = (*self.defaulters).clone();
        map.insert(type_key(resource), Arc::new(f));
        self.defaulters = Arc::new(map);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `n` updates fail with `Conflict` regardless of resourceVersion.
    pub fn inject_conflicts(&self, n: usize) { self.lock().conflicts_pending = n; }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    /// Number of recorded creates and updates.
    pub fn writes(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.op != Op::Get).count()
    }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    pub fn object(&self, resource: &ApiResource, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(&(type_key(resource), key.clone())).cloned()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    /// Write status the way a workload controller would, bumping resourceVersion.
    pub fn set_status(&self, resource: &ApiResource, key: &ObjectKey, status: serde_json::Value) -> bool {
        let mut inner = self.lock();
        inner.rv += 1;
        let rv = inner.rv.to_string();
        match inner.objects.get_mut(&(type_key(resource), key.clone())) {
            Some(obj) => {
                obj.data["status"] = status;
                obj.metadata.resource_version = Some(rv);
                true
            }
            None => false,
        }
    }

    /// Mutate a stored object out of band, as another writer would.
    pub fn modify(&self, resource: &ApiResource, key: &ObjectKey, f: impl FnOnce(&mut DynamicObject)) -> bool {
        let mut inner = self.lock();
        inner.rv += 1;
        let rv = inner.rv.to_string();
        match inner.objects.get_mut(&(type_key(resource), key.clone())) {
            Some(obj) => {
                f(obj);
                obj.metadata.resource_version = Some(rv);
                true
            }
            None => false,
        }
    }

    fn apply_defaults(&self, resource: &ApiResource, obj: &mut DynamicObject) {
        if let Some(f) = self.defaulters.get(&type_key(resource)) {
            f(obj);
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        let mut inner = self.lock();
        inner.calls.push(Call { op: Op::Get, kind: resource.kind.clone(), key: key.clone() });
        Ok(inner.objects.get(&(type_key(resource), key.clone())).cloned())
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(resource, obj)?;
        let mut stored = obj.clone();
        self.apply_defaults(resource, &mut stored);
        let mut inner = self.lock();
        inner.calls.push(Call { op: Op::Create, kind: resource.kind.clone(), key: key.clone() });
        let slot = (type_key(resource), key.clone());
        if inner.objects.contains_key(&slot) {
            return Err(StoreError::AlreadyExists { kind: resource.kind.clone(), key });
        }
        inner.rv += 1;
        stored.metadata.resource_version = Some(inner.rv.to_string());
        stored.metadata.uid = Some(format!("00000000-0000-0000-0000-{:012}", inner.rv));
        if let Some(data) = stored.data.as_object_mut() {
            data.remove("status");
        }
        debug!(kind = %resource.kind, key = %key, rv = inner.rv, "memory create");
        inner.objects.insert(slot, stored.clone());
        Ok(stored)
    }

    async fn update(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(resource, obj)?;
        let mut stored = obj.clone();
        self.apply_defaults(resource, &mut stored);
        let mut inner = self.lock();
        inner.calls.push(Call { op: Op::Update, kind: resource.kind.clone(), key: key.clone() });
        if inner.conflicts_pending > 0 {
            inner.conflicts_pending -= 1;
            return Err(StoreError::Conflict { kind: resource.kind.clone(), key, message: "injected conflict".into() });
        }
        let slot = (type_key(resource), key.clone());
        let live = match inner.objects.get(&slot) {
            Some(live) => live,
            None => return Err(StoreError::NotFound { kind: resource.kind.clone(), key }),
        };
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if live.metadata.resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict {
                    kind: resource.kind.clone(),
                    key,
                    message: format!(
                        "resourceVersion {} is stale (live {})",
                        rv,
                        live.metadata.resource_version.as_deref().unwrap_or("")
                    ),
                });
            }
        }
        let status = live.data.get("status").cloned();
        stored.metadata.uid = live.metadata.uid.clone();
        if let Some(data) = stored.data.as_object_mut() {
            match status {
                Some(s) => {
                    data.insert("status".into(), s);
                }
                None => {
                    data.remove("status");
                }
            }
        }
        inner.rv += 1;
        stored.metadata.resource_version = Some(inner.rv.to_string());
        debug!(kind = %resource.kind, key = %key, rv = inner.rv, "memory update");
        inner.objects.insert(slot, stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;

    fn svc_resource() -> ApiResource { ApiResource::erase::<Service>(&()) }

    fn svc(name: &str) -> DynamicObject {
        let mut o = DynamicObject::new(name, &svc_resource()).within("ns");
        o.data = serde_json::json!({ "spec": { "type": "ClusterIP" } });
        o
    }

    #[tokio::test]
    async fn create_then_get_assigns_version_and_uid() {
        let store = MemoryStore::new();
        let r = svc_resource();
        let key = ObjectKey::new("ns", "a");
        assert!(store.get(&r, &key).await.unwrap().is_none());
        let created = store.create(&r, &svc("a")).await.unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        assert!(created.metadata.uid.is_some());
        let got = store.get(&r, &key).await.unwrap().unwrap();
        assert_eq!(got.data["spec"]["type"], "ClusterIP");
        assert!(matches!(store.create(&r, &svc("a")).await, Err(StoreError::AlreadyExists { .. })));
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemoryStore::new();
        let r = svc_resource();
        let key = ObjectKey::new("ns", "a");
        let created = store.create(&r, &svc("a")).await.unwrap();
        assert!(store.modify(&r, &key, |o| o.data["spec"]["type"] = "NodePort".into()));
        let err = store.update(&r, &created).await.unwrap_err();
        assert!(err.is_conflict(), "{}", err);
    }

    #[tokio::test]
    async fn update_preserves_status_and_applies_defaults() {
        let r = svc_resource();
        let store = MemoryStore::new().with_defaulter(&r, |o| {
            if o.data["spec"].get("clusterIP").is_none() {
                o.data["spec"]["clusterIP"] = "10.0.0.1".into();
            }
        });
        let key = ObjectKey::new("ns", "a");
        store.create(&r, &svc("a")).await.unwrap();
        assert!(store.set_status(&r, &key, serde_json::json!({ "loadBalancer": {} })));
        let mut live = store.get(&r, &key).await.unwrap().unwrap();
        assert_eq!(live.data["spec"]["clusterIP"], "10.0.0.1");
        live.data["status"] = serde_json::json!({ "bogus": true });
        let updated = store.update(&r, &live).await.unwrap();
        assert_eq!(updated.data["status"], serde_json::json!({ "loadBalancer": {} }));
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let store = MemoryStore::new();
        let r = svc_resource();
        let created = store.create(&r, &svc("a")).await.unwrap();
        store.inject_conflicts(1);
        assert!(store.update(&r, &created).await.unwrap_err().is_conflict());
        assert!(store.update(&r, &created).await.is_ok());
    }
}
