//! Last-applied annotation: the snapshot of what this controller last wrote.

use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::trace;
use trellis_core::DEFAULT_MAX_ANNOTATION_BYTES;

use crate::{delete_nulls, kind_of, strip_noisy, DiffError};

pub const LAST_APPLIED_ANNOTATION: &str = "trellis.dev/last-applied";

#[derive(Debug, Clone)]
pub struct LastAppliedAnnotator {
    key: String,
    max_bytes: usize,
}

impl Default for LastAppliedAnnotator {
    fn default() -> Self { Self::new(LAST_APPLIED_ANNOTATION) }
}

impl LastAppliedAnnotator {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), max_bytes: DEFAULT_MAX_ANNOTATION_BYTES }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn key(&self) -> &str { &self.key }

    /// Remove our own annotation from a serialized object, dropping an emptied map.
    pub fn strip_annotation(&self, v: &mut Json) {
        let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
        let now_empty = match meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            Some(annos) => {
                annos.remove(&self.key);
                annos.is_empty()
            }
            None => false,
        };
        if now_empty {
            meta.remove("annotations");
        }
    }

    /// The value that would be stamped for `obj`: the object without our
    /// annotation, status, server bookkeeping or nulls.
    pub fn snapshot<K: Serialize>(&self, obj: &K) -> Result<Json, DiffError> {
        let raw = serde_json::to_value(obj).map_err(|source| DiffError::Serialize { kind: "object".into(), source })?;
        if !raw.is_object() {
            return Err(DiffError::NotAnObject { kind: kind_of(&raw) });
        }
        let mut v = strip_noisy(raw);
        self.strip_annotation(&mut v);
        delete_nulls(&mut v);
        Ok(v)
    }

    /// Serialize the snapshot of `obj` into its last-applied annotation.
    pub fn set_last_applied<K: Resource + Serialize>(&self, obj: &mut K) -> Result<(), DiffError> {
        let snap = self.snapshot(&*obj)?;
        self.stamp(obj, &snap)
    }

    /// Stamp `obj` with the snapshot of `applied`, the fields this controller owns.
    pub fn set_last_applied_from<K: Resource + Serialize>(&self, obj: &mut K, applied: &K) -> Result<(), DiffError> {
        let snap = self.snapshot(applied)?;
        self.stamp(obj, &snap)
    }

    /// `max_bytes` bounds all annotations on the object once ours is written.
    fn stamp<K: Resource>(&self, obj: &mut K, snap: &Json) -> Result<(), DiffError> {
        let kind = kind_of(snap);
        let encoded = serde_json::to_string(snap).map_err(|source| DiffError::Serialize { kind: kind.clone(), source })?;
        let others: usize = obj
            .annotations()
            .iter()
            .filter(|(k, _)| k.as_str() != self.key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        let total = others + self.key.len() + encoded.len();
        if total > self.max_bytes {
            return Err(DiffError::AnnotationTooLarge { kind, size: total, limit: self.max_bytes });
        }
        trace!(kind = %kind, bytes = encoded.len(), total, "stamping last-applied");
        obj.annotations_mut().insert(self.key.clone(), encoded);
        Ok(())
    }

    /// Parse the previously stamped snapshot, if any.
    pub fn original<K: Resource + Serialize>(&self, obj: &K) -> Result<Option<Json>, DiffError> {
        let Some(raw) = obj.annotations().get(&self.key) else { return Ok(None) };
        if raw.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(raw).map(Some).map_err(|source| DiffError::CorruptAnnotation {
            kind: serde_json::to_value(obj).map(|v| kind_of(&v)).unwrap_or_default(),
            source,
        })
    }
}
