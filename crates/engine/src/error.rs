//! Engine error taxonomy.

use std::fmt;

use trellis_apply::DiffError;
use trellis_core::ObjectKey;
use trellis_kubehub::StoreError;

use crate::ActionType;

/// Where in a reconcile a store failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Create,
    Update,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Fetch => "fetching",
            Stage::Create => "creating",
            Stage::Update => "updating",
        })
    }
}

/// A builder could not produce its desired state.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid desired state: {0}")]
    Invalid(String),
    #[error("encoding desired state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The builder renamed or moved the object. A code bug; never corrected silently.
    #[error("{kind} {expected}: builder cannot change object name or namespace (got {actual})")]
    IdentityMutation { kind: String, expected: ObjectKey, actual: ObjectKey },
    #[error("building {kind} {key}: {source}")]
    Build {
        kind: String,
        key: ObjectKey,
        #[source]
        source: BuildError,
    },
    #[error("diffing {kind} {key}: {source}")]
    Diff {
        kind: String,
        key: ObjectKey,
        #[source]
        source: DiffError,
    },
    #[error("converting {kind} {key}: {source}")]
    Convert {
        kind: String,
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },
    #[error("{stage} {kind} {key}: {source}")]
    Store {
        kind: String,
        key: ObjectKey,
        stage: Stage,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    /// Only store failures may succeed on a fresh pass; everything else needs a code fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Store { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Store { source, .. } if source.is_conflict())
    }

    pub fn kind(&self) -> &str {
        match self {
            ReconcileError::IdentityMutation { kind, .. }
            | ReconcileError::Build { kind, .. }
            | ReconcileError::Diff { kind, .. }
            | ReconcileError::Convert { kind, .. }
            | ReconcileError::Store { kind, .. } => kind,
        }
    }
}

/// A step of an action failed; the rest of the pass was abandoned.
#[derive(Debug, thiserror::Error)]
#[error("{action}: failed to reconcile {step}: {source}")]
pub struct ActorError {
    pub action: ActionType,
    pub step: String,
    #[source]
    pub source: ReconcileError,
}

impl ActorError {
    pub fn is_retryable(&self) -> bool { self.source.is_retryable() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_errors_retry() {
        let key = ObjectKey::new("ns", "db");
        let conflict = ReconcileError::Store {
            kind: "Service".into(),
            key: key.clone(),
            stage: Stage::Update,
            source: StoreError::Conflict { kind: "Service".into(), key: key.clone(), message: "stale".into() },
        };
        assert!(conflict.is_retryable());
        assert!(conflict.is_conflict());
        assert_eq!(conflict.to_string(), "updating Service ns/db: conflict writing Service ns/db: stale");

        let ident = ReconcileError::IdentityMutation {
            kind: "Service".into(),
            expected: key.clone(),
            actual: ObjectKey::new("ns", "other"),
        };
        assert!(!ident.is_retryable());
        assert_eq!(ident.kind(), "Service");

        let wrapped = ActorError { action: ActionType::Deploy, step: "public service".into(), source: conflict };
        assert!(wrapped.is_retryable());
        assert!(wrapped.to_string().starts_with("Deploy: failed to reconcile public service"));
    }
}
