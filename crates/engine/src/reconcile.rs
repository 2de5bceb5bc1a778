//! Create-or-update of one managed object, guarded by the last-applied annotation.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use kube::core::{ApiResource, DynamicObject};
use kube::Resource;
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, trace};
use trellis_apply::{DiffError, DiffPolicy, LastAppliedAnnotator, PatchMaker};
use trellis_core::{Config, ObjectKey};
use trellis_kubehub::ObjectStore;

use crate::error::{BuildError, ReconcileError, Stage};

/// Produces the desired state of one managed object from the owner.
///
/// `build` receives either a fresh placeholder (name and namespace set) or the
/// live object, and mutates it in place. It must not touch name or namespace.
/// With annotations on, the engine also builds onto a placeholder to learn
/// which fields the builder owns, so `build` must be deterministic.
pub trait Builder: Send + Sync {
    type Object: Resource<DynamicType = ()>
        + Default
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync;

    fn key(&self) -> ObjectKey;

    fn build(&self, obj: &mut Self::Object) -> Result<(), BuildError>;
}

/// How the engine decides an update is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Three-way diff against the last-applied annotation, which is stamped on every
    /// write with the builder's own fields. Fields the builder stops setting are removed.
    #[default]
    Annotating,
    /// Write whenever the mutated object differs from the live one; no annotation.
    /// Without a record of what was applied, fields the builder stops setting stay.
    Plain,
}

/// Reconciles single objects against an object store. Holds no per-pass state,
/// so one engine can serve any number of owners.
#[derive(Clone)]
pub struct ReconcileEngine {
    store: Arc<dyn ObjectStore>,
    patch_maker: PatchMaker,
    policy: Arc<DiffPolicy>,
    mode: PersistMode,
}

fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    let meta = obj.meta();
    ObjectKey::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default())
}

impl ReconcileEngine {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store, patch_maker: PatchMaker::default(), policy: Arc::new(DiffPolicy::standard()), mode: PersistMode::default() }
    }

    pub fn from_config(store: Arc<dyn ObjectStore>, config: &Config) -> Self {
        let annotator = LastAppliedAnnotator::default().with_max_bytes(config.max_annotation_bytes);
        Self::new(store).with_patch_maker(PatchMaker::new(annotator))
    }

    pub fn with_patch_maker(mut self, patch_maker: PatchMaker) -> Self {
        self.patch_maker = patch_maker;
        self
    }

    pub fn with_policy(mut self, policy: DiffPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_mode(mut self, mode: PersistMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> PersistMode { self.mode }

    /// Bring the object `builder` manages to its desired state with at most one write.
    /// Returns whether a create or update was issued.
    pub async fn reconcile<B: Builder + ?Sized>(&self, builder: &B) -> Result<bool, ReconcileError> {
        let t0 = Instant::now();
        let kind = B::Object::kind(&()).into_owned();
        let resource = ApiResource::erase::<B::Object>(&());
        let key = builder.key();

        let res = self.reconcile_inner(builder, &kind, &resource, &key).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.clone());
        match &res {
            Ok(Op::Created) => counter!("reconcile_created_total", 1u64, "kind" => kind.clone()),
            Ok(Op::Updated) => counter!("reconcile_updated_total", 1u64, "kind" => kind.clone()),
            Ok(Op::Noop) => counter!("reconcile_noop_total", 1u64, "kind" => kind.clone()),
            Err(_) => counter!("reconcile_err_total", 1u64, "kind" => kind.clone()),
        }
        res.map(|op| op != Op::Noop)
    }

    async fn reconcile_inner<B: Builder + ?Sized>(
        &self,
        builder: &B,
        kind: &str,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Op, ReconcileError> {
        let live = self.store.get(resource, key).await.map_err(|source| ReconcileError::Store {
            kind: kind.to_string(),
            key: key.clone(),
            stage: Stage::Fetch,
            source,
        })?;
        match live {
            None => self.create(builder, kind, resource, key).await,
            Some(live) => self.update(builder, kind, resource, key, live).await,
        }
    }

    async fn create<B: Builder + ?Sized>(&self, builder: &B, kind: &str, resource: &ApiResource, key: &ObjectKey) -> Result<Op, ReconcileError> {
        let mut obj = placeholder::<B::Object>(key);
        self.mutate(builder, kind, key, &mut obj)?;
        if self.mode == PersistMode::Annotating {
            self.stamp(kind, key, &mut obj)?;
        }
        let dynamic = to_dynamic(kind, key, &obj)?;
        self.store.create(resource, &dynamic).await.map_err(|source| ReconcileError::Store {
            kind: kind.to_string(),
            key: key.clone(),
            stage: Stage::Create,
            source,
        })?;
        debug!(kind = %kind, key = %key, "created");
        Ok(Op::Created)
    }

    async fn update<B: Builder + ?Sized>(
        &self,
        builder: &B,
        kind: &str,
        resource: &ApiResource,
        key: &ObjectKey,
        live: DynamicObject,
    ) -> Result<Op, ReconcileError> {
        let mut obj: B::Object = from_dynamic(kind, key, &live)?;
        let existing = obj.clone();
        self.mutate(builder, kind, key, &mut obj)?;
        let fresh = match self.mode {
            PersistMode::Annotating => {
                let fresh = desired(builder)
                    .map_err(|source| ReconcileError::Build { kind: kind.to_string(), key: key.clone(), source })?;
                obj = self.prune(kind, key, &existing, obj, &fresh)?;
                Some(fresh)
            }
            PersistMode::Plain => None,
        };

        let ignore = self.policy.paths_for(kind);
        let patch = match self.mode {
            PersistMode::Annotating => self.patch_maker.calculate(&existing, &obj, ignore),
            PersistMode::Plain => self.patch_maker.calculate_plain(&existing, &obj, ignore),
        }
        .map_err(|source| ReconcileError::Diff { kind: kind.to_string(), key: key.clone(), source })?;

        if patch.is_empty() {
            trace!(kind = %kind, key = %key, "up to date");
            return Ok(Op::Noop);
        }
        debug!(
            kind = %kind,
            key = %key,
            adds = patch.summary.adds,
            updates = patch.summary.updates,
            removes = patch.summary.removes,
            "drift detected"
        );

        if let Some(fresh) = &fresh {
            self.patch_maker
                .annotator()
                .set_last_applied_from(&mut obj, fresh)
                .map_err(|source| ReconcileError::Diff { kind: kind.to_string(), key: key.clone(), source })?;
        }
        let dynamic = to_dynamic(kind, key, &obj)?;
        self.store.update(resource, &dynamic).await.map_err(|source| ReconcileError::Store {
            kind: kind.to_string(),
            key: key.clone(),
            stage: Stage::Update,
            source,
        })?;
        debug!(kind = %kind, key = %key, "updated");
        Ok(Op::Updated)
    }

    fn mutate<B: Builder + ?Sized>(&self, builder: &B, kind: &str, key: &ObjectKey, obj: &mut B::Object) -> Result<(), ReconcileError> {
        builder
            .build(obj)
            .map_err(|source| ReconcileError::Build { kind: kind.to_string(), key: key.clone(), source })?;
        let actual = key_of(obj);
        if &actual != key {
            return Err(ReconcileError::IdentityMutation { kind: kind.to_string(), expected: key.clone(), actual });
        }
        Ok(())
    }

    /// Drop from `obj` what the last write set and the builder no longer asks for.
    /// Fields the builder never set, server defaults included, are kept.
    fn prune<K: Resource + Serialize + DeserializeOwned>(
        &self,
        kind: &str,
        key: &ObjectKey,
        existing: &K,
        obj: K,
        fresh: &K,
    ) -> Result<K, ReconcileError> {
        let annotator = self.patch_maker.annotator();
        let diff_err = |source: DiffError| ReconcileError::Diff { kind: kind.to_string(), key: key.clone(), source };
        let Some(previous) = annotator.original(existing).map_err(diff_err)? else { return Ok(obj) };
        let wanted = annotator.snapshot(fresh).map_err(diff_err)?;
        let mut v = serde_json::to_value(&obj)
            .map_err(|source| ReconcileError::Convert { kind: kind.to_string(), key: key.clone(), source })?;
        trellis_apply::prune_dropped(&mut v, &previous, &wanted);
        serde_json::from_value(v).map_err(|source| ReconcileError::Convert { kind: kind.to_string(), key: key.clone(), source })
    }

    fn stamp<K: Resource + Serialize>(&self, kind: &str, key: &ObjectKey, obj: &mut K) -> Result<(), ReconcileError> {
        self.patch_maker
            .annotator()
            .set_last_applied(obj)
            .map_err(|source| ReconcileError::Diff { kind: kind.to_string(), key: key.clone(), source })
    }
}

/// An empty object carrying only `key`.
pub fn placeholder<K: Resource + Default>(key: &ObjectKey) -> K {
    let mut obj = K::default();
    let meta = obj.meta_mut();
    meta.name = Some(key.name.clone());
    meta.namespace = Some(key.namespace.clone());
    obj
}

/// What `builder` would create against an empty store.
pub fn desired<B: Builder + ?Sized>(builder: &B) -> Result<B::Object, BuildError> {
    let mut obj = placeholder::<B::Object>(&builder.key());
    builder.build(&mut obj)?;
    Ok(obj)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Created,
    Updated,
    Noop,
}

fn to_dynamic<K: Serialize>(kind: &str, key: &ObjectKey, obj: &K) -> Result<DynamicObject, ReconcileError> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|source| ReconcileError::Convert { kind: kind.to_string(), key: key.clone(), source })
}

fn from_dynamic<K: DeserializeOwned>(kind: &str, key: &ObjectKey, obj: &DynamicObject) -> Result<K, ReconcileError> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|source| ReconcileError::Convert { kind: kind.to_string(), key: key.clone(), source })
}
