//! Three-way merge patch between the last-applied snapshot, the mutated object
//! and the live object.
//!
//! Deletions are only inferred for fields we applied before (present in the
//! snapshot, absent from the mutated object), so fields defaulted by the
//! server are never fought over. Arrays are compared as a whole.

use kube::Resource;
use metrics::counter;
use serde::Serialize;
use serde_json::{Map, Value as Json};
use tracing::trace;

use crate::{delete_nulls, diff_summary, kind_of, DiffError, DiffSummary, IgnorePath, LastAppliedAnnotator};

#[derive(Debug, Clone, PartialEq)]
pub struct PatchResult {
    /// JSON merge patch turning the live object into the mutated one; `{}` when nothing to do.
    pub patch: Json,
    pub summary: DiffSummary,
}

impl PatchResult {
    pub fn is_empty(&self) -> bool {
        self.patch.as_object().map_or(true, |m| m.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatchMaker {
    annotator: LastAppliedAnnotator,
}

impl PatchMaker {
    pub fn new(annotator: LastAppliedAnnotator) -> Self { Self { annotator } }

    pub fn annotator(&self) -> &LastAppliedAnnotator { &self.annotator }

    fn prepare(&self, mut v: Json, ignore: &[&IgnorePath]) -> Json {
        for p in ignore {
            p.strip(&mut v);
        }
        self.annotator.strip_annotation(&mut v);
        delete_nulls(&mut v);
        v
    }

    fn to_object<K: Serialize>(obj: &K) -> Result<Json, DiffError> {
        let v = serde_json::to_value(obj).map_err(|source| DiffError::Serialize { kind: "object".into(), source })?;
        if !v.is_object() {
            return Err(DiffError::NotAnObject { kind: kind_of(&v) });
        }
        Ok(v)
    }

    /// Diff `current` (live, carrying the last-applied annotation) against `modified`.
    pub fn calculate<'p, K, I>(&self, current: &K, modified: &K, ignore: I) -> Result<PatchResult, DiffError>
    where
        K: Resource + Serialize,
        I: IntoIterator<Item = &'p IgnorePath>,
    {
        let ignore: Vec<&IgnorePath> = ignore.into_iter().collect();
        let cur = self.prepare(Self::to_object(current)?, &ignore);
        let modi = self.prepare(Self::to_object(modified)?, &ignore);
        let orig = self.annotator.original(current)?.map(|o| self.prepare(o, &ignore));

        let patch = three_way(orig.as_ref(), &modi, &cur);
        let result = PatchResult { summary: diff_summary(&modi, &cur), patch: Json::Object(patch) };
        counter!("patch_calculated_total", 1u64);
        if result.is_empty() {
            counter!("patch_empty_total", 1u64);
        }
        trace!(kind = %kind_of(&cur), empty = result.is_empty(), has_original = orig.is_some(), "patch calculated");
        Ok(result)
    }

    /// Two-way diff: any field of `current` missing from `modified` counts as a deletion.
    pub fn calculate_plain<'p, K, I>(&self, current: &K, modified: &K, ignore: I) -> Result<PatchResult, DiffError>
    where
        K: Resource + Serialize,
        I: IntoIterator<Item = &'p IgnorePath>,
    {
        let ignore: Vec<&IgnorePath> = ignore.into_iter().collect();
        let cur = self.prepare(Self::to_object(current)?, &ignore);
        let modi = self.prepare(Self::to_object(modified)?, &ignore);
        let patch = three_way(Some(&cur), &modi, &cur);
        Ok(PatchResult { summary: diff_summary(&modi, &cur), patch: Json::Object(patch) })
    }
}

/// JSON merge patch from `current` to `modified`, deleting only keys that `original` had.
pub fn three_way(original: Option<&Json>, modified: &Json, current: &Json) -> Map<String, Json> {
    let empty = Map::new();
    let orig = original.and_then(|o| o.as_object());
    let modi = modified.as_object().unwrap_or(&empty);
    let cur = current.as_object().unwrap_or(&empty);
    merge_objects(orig, modi, cur)
}

fn merge_objects(original: Option<&Map<String, Json>>, modified: &Map<String, Json>, current: &Map<String, Json>) -> Map<String, Json> {
    let mut out = Map::new();
    for (k, mv) in modified {
        match (current.get(k), mv) {
            (Some(cv), _) if cv == mv => {}
            (Some(Json::Object(co)), Json::Object(mo)) => {
                let sub_orig = original.and_then(|o| o.get(k)).and_then(|v| v.as_object());
                let sub = merge_objects(sub_orig, mo, co);
                if !sub.is_empty() {
                    out.insert(k.clone(), Json::Object(sub));
                }
            }
            _ => {
                out.insert(k.clone(), mv.clone());
            }
        }
    }
    if let Some(orig) = original {
        for k in orig.keys() {
            if !modified.contains_key(k) && current.contains_key(k) {
                out.insert(k.clone(), Json::Null);
            }
        }
    }
    out
}
