//! Trellis kubehub: the object-store boundary the reconcile engine writes through.
//!
//! `KubeStore` talks to a live API server; `MemoryStore` keeps objects in
//! process and mimics the server behaviors the engine relies on
//! (resourceVersion conflicts, defaulting, status subresource).

#![forbid(unsafe_code)]

use std::time::Instant;

use async_trait::async_trait;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use metrics::histogram;
use tracing::{debug, trace};
use trellis_core::ObjectKey;

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict { kind: String, key: ObjectKey, message: String },
    #[error("invalid {kind} object: {message}")]
    Invalid { kind: String, message: String },
    #[error("kubernetes error on {kind} {key}: {source}")]
    Kube {
        kind: String,
        key: ObjectKey,
        #[source]
        source: kube::Error,
    },
}

impl StoreError {
    /// Whether re-running the pass with fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Invalid { .. })
    }

    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }

    /// Classify a kube client error by API status code.
    pub fn from_kube(kind: &str, key: &ObjectKey, err: kube::Error) -> Self {
        let kind = kind.to_string();
        let key = key.clone();
        match err {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound { kind, key },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                StoreError::AlreadyExists { kind, key }
            }
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict { kind, key, message: resp.message },
            other => StoreError::Kube { kind, key, source: other },
        }
    }
}

/// Identity of a dynamic object as stored in its metadata.
pub fn object_key(obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.as_deref()?;
    let namespace = obj.metadata.namespace.as_deref().unwrap_or_default();
    Some(ObjectKey::new(namespace, name))
}

/// Fetch/create/update for namespaced objects of any kind.
///
/// A missing object is `Ok(None)` from `get`; that is the create path, not an error.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError>;
    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;
    /// Replace the object. Fails with `Conflict` when `metadata.resourceVersion` is stale.
    async fn update(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;
}

pub async fn get_kube_client() -> Result<Client, kube::Error> {
    Client::try_default().await
}

/// API-server backed store.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self, kube::Error> {
        Ok(Self::new(get_kube_client().await?))
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

fn key_of(resource: &ApiResource, obj: &DynamicObject) -> Result<ObjectKey, StoreError> {
    object_key(obj).ok_or_else(|| StoreError::Invalid { kind: resource.kind.clone(), message: "missing metadata.name".into() })
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        let t0 = Instant::now();
        let res = self
            .api(resource, &key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(&resource.kind, key, e));
        histogram!("store_get_ms", t0.elapsed().as_secs_f64() * 1000.0);
        trace!(kind = %resource.kind, key = %key, found = matches!(res, Ok(Some(_))), "store get");
        res
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(resource, obj)?;
        let t0 = Instant::now();
        let res = self
            .api(resource, &key.namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(&resource.kind, &key, e));
        histogram!("store_create_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(kind = %resource.kind, key = %key, ok = res.is_ok(), "store create");
        res
    }

    async fn update(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(resource, obj)?;
        let t0 = Instant::now();
        let res = self
            .api(resource, &key.namespace)
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(&resource.kind, &key, e));
        histogram!("store_update_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(kind = %resource.kind, key = %key, ok = res.is_ok(), "store update");
        res
    }
}
