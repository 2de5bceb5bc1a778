//! Feature gates, passed explicitly to whoever needs them.

use std::fmt;
use std::str::FromStr;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Require a successful version check before deploying.
    VersionValidator,
}

impl Feature {
    pub const ALL: [Feature; 1] = [Feature::VersionValidator];

    fn default_enabled(self) -> bool {
        match self {
            Feature::VersionValidator => false,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::VersionValidator => f.write_str("VersionValidator"),
        }
    }
}

impl FromStr for Feature {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.to_string() == s)
            .ok_or_else(|| CoreError::UnknownFeature(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureGates {
    gates: FxHashMap<Feature, bool>,
}

impl Default for FeatureGates {
    fn default() -> Self {
        Self { gates: Feature::ALL.into_iter().map(|f| (f, f.default_enabled())).collect() }
    }
}

impl FeatureGates {
    /// Parse `Name=true,Other=false` on top of the defaults. Empty input yields defaults.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let mut gates = Self::default();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry.split_once('=').ok_or_else(|| CoreError::InvalidGate(entry.to_string()))?;
            let feature: Feature = name.trim().parse()?;
            let on = value.trim().parse::<bool>().map_err(|_| CoreError::InvalidGate(entry.to_string()))?;
            debug!(feature = %feature, enabled = on, "feature gate override");
            gates.set(feature, on);
        }
        Ok(gates)
    }

    pub fn enabled(&self, feature: Feature) -> bool {
        self.gates.get(&feature).copied().unwrap_or_else(|| feature.default_enabled())
    }

    pub fn set(&mut self, feature: Feature, on: bool) { self.gates.insert(feature, on); }

    pub fn with(mut self, feature: Feature, on: bool) -> Self {
        self.set(feature, on);
        self
    }
}
