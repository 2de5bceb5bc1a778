//! Cluster conditions: a set keyed by type with a three-valued lookup.
//!
//! A condition that was never recorded is reported as `None`, which is
//! distinct from an explicit `False` or `Unknown`.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionType(Cow<'static, str>);

impl ConditionType {
    pub const INITIALIZED: ConditionType = ConditionType(Cow::Borrowed("Initialized"));
    pub const VERSION_CHECKED: ConditionType = ConditionType(Cow::Borrowed("VersionChecked"));
    pub const NOT_INITIALIZED: ConditionType = ConditionType(Cow::Borrowed("NotInitialized"));

    pub fn new(tag: impl Into<String>) -> Self { Self(Cow::Owned(tag.into())) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    /// RFC 3339 timestamp of the last status flip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// One status per condition type. Later entries win when deserializing duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ClusterCondition>", into = "Vec<ClusterCondition>")]
pub struct Conditions {
    items: SmallVec<[ClusterCondition; 4]>,
}

impl From<Vec<ClusterCondition>> for Conditions {
    fn from(v: Vec<ClusterCondition>) -> Self {
        let mut out = Conditions::default();
        for c in v {
            match out.items.iter_mut().find(|x| x.type_ == c.type_) {
                Some(slot) => *slot = c,
                None => out.items.push(c),
            }
        }
        out
    }
}

impl From<Conditions> for Vec<ClusterCondition> {
    fn from(c: Conditions) -> Self { c.items.into_vec() }
}

impl FromIterator<(ConditionType, ConditionStatus)> for Conditions {
    fn from_iter<I: IntoIterator<Item = (ConditionType, ConditionStatus)>>(iter: I) -> Self {
        let mut out = Conditions::default();
        for (ty, status) in iter {
            out.set(ty, status);
        }
        out
    }
}

impl Conditions {
    /// Three-valued lookup: `None` when the condition was never recorded.
    pub fn get(&self, ty: &ConditionType) -> Option<ConditionStatus> {
        self.items.iter().find(|c| &c.type_ == ty).map(|c| c.status)
    }

    pub fn is_true(&self, ty: &ConditionType) -> bool { self.get(ty) == Some(ConditionStatus::True) }
    pub fn is_false(&self, ty: &ConditionType) -> bool { self.get(ty) == Some(ConditionStatus::False) }
    pub fn is_unknown(&self, ty: &ConditionType) -> bool { self.get(ty) == Some(ConditionStatus::Unknown) }
    pub fn is_absent(&self, ty: &ConditionType) -> bool { self.get(ty).is_none() }

    /// Record `status` for `ty`. The transition time only moves when the status flips.
    pub fn set(&mut self, ty: ConditionType, status: ConditionStatus) {
        let now = chrono::Utc::now().to_rfc3339();
        match self.items.iter_mut().find(|c| c.type_ == ty) {
            Some(c) if c.status == status => {}
            Some(c) => {
                c.status = status;
                c.last_transition_time = Some(now);
            }
            None => self.items.push(ClusterCondition { type_: ty, status, last_transition_time: Some(now) }),
        }
    }

    pub fn remove(&mut self, ty: &ConditionType) { self.items.retain(|c| &c.type_ != ty); }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterCondition> { self.items.iter() }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_is_distinct_from_false() {
        let mut conds = Conditions::default();
        assert_eq!(conds.get(&ConditionType::INITIALIZED), None);
        assert!(conds.is_absent(&ConditionType::INITIALIZED));
        assert!(!conds.is_false(&ConditionType::INITIALIZED));

        conds.set(ConditionType::INITIALIZED, ConditionStatus::False);
        assert!(conds.is_false(&ConditionType::INITIALIZED));
        assert!(!conds.is_absent(&ConditionType::INITIALIZED));
    }

    #[test]
    fn set_keeps_one_status_per_type() {
        let mut conds = Conditions::default();
        conds.set(ConditionType::INITIALIZED, ConditionStatus::False);
        let first = conds.iter().next().unwrap().last_transition_time.clone();
        conds.set(ConditionType::INITIALIZED, ConditionStatus::False);
        assert_eq!(conds.iter().next().unwrap().last_transition_time, first);
        conds.set(ConditionType::INITIALIZED, ConditionStatus::True);
        assert_eq!(conds.len(), 1);
        assert!(conds.is_true(&ConditionType::INITIALIZED));
    }

    #[test]
    fn duplicates_collapse_on_deserialize() {
        let raw = serde_json::json!([
            { "type": "Initialized", "status": "False" },
            { "type": "VersionChecked", "status": "Unknown" },
            { "type": "Initialized", "status": "True" }
        ]);
        let conds: Conditions = serde_json::from_value(raw).unwrap();
        assert_eq!(conds.len(), 2);
        assert!(conds.is_true(&ConditionType::INITIALIZED));
        assert!(conds.is_unknown(&ConditionType::VERSION_CHECKED));
    }

    #[test]
    fn custom_types_compare_with_builtin_consts() {
        let mut conds: Conditions = [(ConditionType::new("Initialized"), ConditionStatus::True)].into_iter().collect();
        assert!(conds.is_true(&ConditionType::INITIALIZED));
        conds.remove(&ConditionType::INITIALIZED);
        assert!(conds.is_empty());
    }
}
