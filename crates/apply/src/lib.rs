//! Trellis apply: decides whether a mutated object needs a write.
//!
//! - `LastAppliedAnnotator` stamps/reads the serialized snapshot of what we last wrote.
//! - `DiffPolicy` lists field paths each kind ignores when diffing.
//! - `PatchMaker` computes a three-way merge patch (last-applied, mutated, live).

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

pub mod annotate;
pub mod patch;
pub mod policy;

pub use annotate::{LastAppliedAnnotator, LAST_APPLIED_ANNOTATION};
pub use patch::{PatchMaker, PatchResult};
pub use policy::{DiffPolicy, IgnorePath};

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("serializing {kind}: {source}")]
    Serialize {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} did not serialize to a JSON object")]
    NotAnObject { kind: String },
    #[error("corrupt last-applied annotation on {kind}: {source}")]
    CorruptAnnotation {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("last-applied snapshot for {kind} is {size} bytes (limit {limit})")]
    AnnotationTooLarge { kind: String, size: usize, limit: usize },
}

/// Kind tag of a serialized object, for error context.
pub(crate) fn kind_of(v: &Json) -> String {
    v.get("kind").and_then(|k| k.as_str()).unwrap_or("object").to_string()
}

/// Drop server-populated bookkeeping that never participates in a diff.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
            obj.remove("selfLink");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// Remove `null` members recursively; a null field and a missing one mean the same.
pub fn delete_nulls(v: &mut Json) {
    match v {
        Json::Object(map) => {
            map.retain(|_, vv| !vv.is_null());
            for vv in map.values_mut() { delete_nulls(vv); }
        }
        Json::Array(arr) => {
            for vv in arr.iter_mut() { delete_nulls(vv); }
        }
        _ => {}
    }
}

/// Name of a list item: `name`, or `metadata.name` for embedded objects.
pub fn item_name(v: &Json) -> Option<&str> {
    v.get("name")
        .and_then(Json::as_str)
        .or_else(|| v.pointer("/metadata/name").and_then(Json::as_str))
}

/// Remove from `target` every field that `previous` (the last applied state)
/// set and `desired` no longer sets. A dropped map only loses the keys
/// `previous` held and goes away once empty. Named list items are matched by
/// name; other lists are left alone.
pub fn prune_dropped(target: &mut Json, previous: &Json, desired: &Json) {
    match (target, previous, desired) {
        (Json::Object(t), Json::Object(p), Json::Object(d)) => {
            let none = Json::Object(Map::new());
            for (k, pv) in p {
                let Some(tv) = t.get_mut(k) else { continue };
                match d.get(k) {
                    Some(dv) => prune_dropped(tv, pv, dv),
                    None if pv.is_object() && tv.is_object() => {
                        prune_dropped(tv, pv, &none);
                        if tv.as_object().is_some_and(Map::is_empty) {
                            t.remove(k);
                        }
                    }
                    None => {
                        t.remove(k);
                    }
                }
            }
        }
        (Json::Array(t), Json::Array(p), Json::Array(d)) => {
            for pi in p {
                let Some(name) = item_name(pi) else { continue };
                let Some(di) = d.iter().find(|x| item_name(x) == Some(name)) else { continue };
                if let Some(ti) = t.iter_mut().find(|x| item_name(x) == Some(name)) {
                    prune_dropped(ti, pi, di);
                }
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Count differences of `target` relative to `base`. Used for logging why a write happened.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_noisy_prunes_common_fields() {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "uid": "abc",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        assert!(!meta.contains_key("managedFields"));
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("generation"));
        assert!(!meta.contains_key("creationTimestamp"));
        assert!(!meta.contains_key("uid"));
        assert_eq!(meta.get("name").and_then(|v| v.as_str()), Some("x"));
        assert!(!pruned.as_object().unwrap().contains_key("status"));
    }

    #[test]
    fn delete_nulls_recurses() {
        let mut v = serde_json::json!({ "a": null, "b": { "c": null, "d": 1 }, "e": [ { "f": null } ] });
        delete_nulls(&mut v);
        assert_eq!(v, serde_json::json!({ "b": { "d": 1 }, "e": [ {} ] }));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({
            "a": 1,
            "b": { "x": 1 },
            "c": [1, 2, 3]
        });
        let target = serde_json::json!({
            "a": 2,
            "b": { "x": 1, "y": 2 },
            "c": [1, 9],
            "d": true
        });
        let s = diff_summary(&target, &base);
        // b.y and d are adds; a and c[1] are updates; c shrinking by one is a remove
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert!(diff_summary(&base, &base).is_empty());
    }

    #[test]
    fn prune_drops_only_previously_owned_fields() {
        let previous = serde_json::json!({
            "metadata": { "labels": { "app": "db", "team": "storage" } },
            "spec": { "ports": [ { "name": "http", "port": 80, "appProtocol": "http" } ] }
        });
        let desired = serde_json::json!({
            "metadata": { "labels": { "app": "db" } },
            "spec": { "ports": [ { "name": "http", "port": 80 } ] }
        });
        let mut live = serde_json::json!({
            "metadata": { "labels": { "app": "db", "team": "storage" } },
            "spec": {
                "clusterIP": "10.0.0.7",
                "ports": [ { "name": "http", "port": 80, "appProtocol": "http", "protocol": "TCP" } ]
            }
        });
        prune_dropped(&mut live, &previous, &desired);
        assert_eq!(
            live,
            serde_json::json!({
                "metadata": { "labels": { "app": "db" } },
                "spec": { "clusterIP": "10.0.0.7", "ports": [ { "name": "http", "port": 80, "protocol": "TCP" } ] }
            })
        );
    }

    #[test]
    fn prune_keeps_foreign_keys_of_a_dropped_map() {
        let previous = serde_json::json!({ "metadata": { "annotations": { "prometheus.io/scrape": "true" } } });
        let desired = serde_json::json!({ "metadata": { "name": "db" } });
        let mut live = serde_json::json!({
            "metadata": { "name": "db", "annotations": { "prometheus.io/scrape": "true", "owner": "ops" } }
        });
        prune_dropped(&mut live, &previous, &desired);
        assert_eq!(live, serde_json::json!({ "metadata": { "name": "db", "annotations": { "owner": "ops" } } }));

        let mut bare = serde_json::json!({ "metadata": { "name": "db", "annotations": { "prometheus.io/scrape": "true" } } });
        prune_dropped(&mut bare, &previous, &desired);
        assert_eq!(bare, serde_json::json!({ "metadata": { "name": "db" } }));
    }
}
