//! Builders for the objects a database cluster owns.
//!
//! Each builder states only the fields it owns as a JSON fragment and overlays
//! it onto whatever object the engine hands it (a placeholder or the live
//! object). Fields it does not mention, server defaults included, survive.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value as Json};
use trellis_apply::item_name;
use trellis_core::{Cluster, OWNER_API_VERSION, OWNER_KIND};

use crate::error::BuildError;

mod pdb;
mod service;
mod statefulset;

pub use pdb::DisruptionBudget;
pub use service::{DiscoveryService, PublicService};
pub use statefulset::{StatefulSetBuilder, CONTAINER_NAME, DATA_VOLUME};

pub const APP_NAME: &str = "cockroachdb";
pub const COMPONENT: &str = "database";

/// Labels shared by every managed object of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    selector: BTreeMap<String, String>,
    common: BTreeMap<String, String>,
}

impl Labels {
    pub fn for_cluster(cluster: &Cluster) -> Self {
        let mut selector = BTreeMap::new();
        selector.insert("app.kubernetes.io/name".to_string(), APP_NAME.to_string());
        selector.insert("app.kubernetes.io/instance".to_string(), cluster.name().to_string());

        let mut common = cluster.spec.additional_labels.clone();
        common.extend(selector.clone());
        common.insert("app.kubernetes.io/component".to_string(), COMPONENT.to_string());
        Self { selector, common }
    }

    /// Stable subset used to match pods; never includes user labels.
    pub fn selector(&self) -> &BTreeMap<String, String> { &self.selector }

    pub fn common(&self) -> &BTreeMap<String, String> { &self.common }
}

/// Controller reference back to the cluster, or `None` before it has a uid.
pub fn owner_reference(cluster: &Cluster) -> Option<Json> {
    let uid = cluster.metadata.uid.as_deref()?;
    Some(json!({
        "apiVersion": OWNER_API_VERSION,
        "kind": OWNER_KIND,
        "name": cluster.name(),
        "uid": uid,
        "controller": true,
        "blockOwnerDeletion": true,
    }))
}

/// Metadata fragment every builder starts from.
pub(crate) fn metadata(cluster: &Cluster, labels: &Labels) -> Json {
    let mut meta = json!({ "labels": labels.common() });
    if let Some(owner) = owner_reference(cluster) {
        meta["ownerReferences"] = json!([owner]);
    }
    meta
}

fn all_named(items: &[Json]) -> bool { !items.is_empty() && items.iter().all(|i| item_name(i).is_some()) }

/// Overlay `desired` onto `target` in place.
///
/// Objects merge key by key and `null` removes the key. Lists whose items all
/// carry a name (`name` or `metadata.name`) merge by that name: the result
/// holds exactly the desired items in desired order, each overlaid onto the
/// live item of the same name. Any other value replaces the target.
pub fn overlay(target: &mut Json, desired: Json) {
    match (target, desired) {
        (Json::Object(t), Json::Object(d)) => merge_map(t, d),
        (Json::Array(t), Json::Array(d)) if all_named(&d) => {
            let mut live: Vec<Json> = std::mem::take(t);
            for item in d {
                let slot = item_name(&item).and_then(|n| live.iter().position(|l| item_name(l) == Some(n)));
                let mut merged = match slot {
                    Some(i) => live.swap_remove(i),
                    None => Json::Object(Map::new()),
                };
                overlay(&mut merged, item);
                t.push(merged);
            }
        }
        (t, mut d) => {
            trellis_apply::delete_nulls(&mut d);
            *t = d;
        }
    }
}

fn merge_map(t: &mut Map<String, Json>, d: Map<String, Json>) {
    for (k, v) in d {
        if v.is_null() {
            t.remove(&k);
            continue;
        }
        match t.get_mut(&k) {
            Some(slot) => overlay(slot, v),
            None => {
                let mut fresh = Json::Object(Map::new());
                overlay(&mut fresh, v);
                t.insert(k, fresh);
            }
        }
    }
}

/// Overlay `fragment` onto a typed object by round-tripping it through JSON.
pub fn apply_fragment<T: Serialize + DeserializeOwned>(obj: &mut T, fragment: Json) -> Result<(), BuildError> {
    let mut v = serde_json::to_value(&*obj)?;
    overlay(&mut v, fragment);
    *obj = serde_json::from_value(v)?;
    Ok(())
}

/// The container named `name` in a pod spec, if any.
pub fn find_container<'a>(
    pod: &'a k8s_openapi::api::core::v1::PodSpec,
    name: &str,
) -> Option<&'a k8s_openapi::api::core::v1::Container> {
    pod.containers.iter().find(|c| c.name == name)
}
