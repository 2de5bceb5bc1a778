//! Per-kind registry of field paths that never count as a difference.

use rustc_hash::FxHashMap;
use serde_json::Value as Json;

/// Dotted field path. A `*` segment matches every element of an array
/// (or every member of an object); a trailing `*` empties the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnorePath {
    segments: Vec<String>,
}

impl IgnorePath {
    pub fn parse(path: &str) -> Self {
        Self { segments: path.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect() }
    }

    pub fn segments(&self) -> &[String] { &self.segments }

    /// Remove every field this path matches. Missing intermediate fields are fine.
    pub fn strip(&self, v: &mut Json) {
        fn walk(v: &mut Json, segs: &[String]) {
            let (head, rest) = match segs.split_first() {
                Some(x) => x,
                None => return,
            };
            if head == "*" {
                match v {
                    Json::Array(arr) if rest.is_empty() => arr.clear(),
                    Json::Array(arr) => arr.iter_mut().for_each(|item| walk(item, rest)),
                    Json::Object(map) if rest.is_empty() => map.clear(),
                    Json::Object(map) => map.values_mut().for_each(|item| walk(item, rest)),
                    _ => {}
                }
                return;
            }
            if let Some(map) = v.as_object_mut() {
                if rest.is_empty() {
                    map.remove(head.as_str());
                } else if let Some(child) = map.get_mut(head.as_str()) {
                    walk(child, rest);
                }
            }
        }
        walk(v, &self.segments);
    }
}

/// Ignored paths as data: applied to every kind, plus per-kind extras keyed by kind tag.
#[derive(Debug, Clone, Default)]
pub struct DiffPolicy {
    always: Vec<IgnorePath>,
    by_kind: FxHashMap<String, Vec<IgnorePath>>,
}

impl DiffPolicy {
    /// Empty policy; nothing is ignored.
    pub fn new() -> Self { Self::default() }

    /// Status is always ignored. StatefulSets also ignore the type meta and status
    /// the server fills into each volume claim template.
    pub fn standard() -> Self {
        Self::new()
            .ignore_always("status")
            .ignore_for("StatefulSet", "spec.volumeClaimTemplates.*.apiVersion")
            .ignore_for("StatefulSet", "spec.volumeClaimTemplates.*.kind")
            .ignore_for("StatefulSet", "spec.volumeClaimTemplates.*.status")
    }

    pub fn ignore_always(mut self, path: &str) -> Self {
        self.always.push(IgnorePath::parse(path));
        self
    }

    pub fn ignore_for(mut self, kind: &str, path: &str) -> Self {
        self.by_kind.entry(kind.to_string()).or_default().push(IgnorePath::parse(path));
        self
    }

    pub fn paths_for<'a>(&'a self, kind: &str) -> impl Iterator<Item = &'a IgnorePath> + 'a {
        let extra = self.by_kind.get(kind).map(|v| v.as_slice()).unwrap_or(&[]);
        self.always.iter().chain(extra.iter())
    }

    /// Strip every ignored path for `kind` from `v`.
    pub fn strip(&self, kind: &str, v: &mut Json) {
        for p in self.paths_for(kind) {
            p.strip(v);
        }
    }
}
