//! Declarative predicates over a cluster's condition set.

use trellis_core::{ConditionStatus, ConditionType, Conditions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Condition recorded with exactly this status.
    Is(ConditionType, ConditionStatus),
    /// Condition never recorded.
    Absent(ConditionType),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn is_true(ty: ConditionType) -> Self { Predicate::Is(ty, ConditionStatus::True) }
    pub fn is_false(ty: ConditionType) -> Self { Predicate::Is(ty, ConditionStatus::False) }

    /// Recorded with any status, True or False or Unknown.
    pub fn present(ty: ConditionType) -> Self { Predicate::Not(Box::new(Predicate::Absent(ty))) }

    pub fn eval(&self, conds: &Conditions) -> bool {
        match self {
            Predicate::Is(ty, status) => conds.get(ty) == Some(*status),
            Predicate::Absent(ty) => conds.is_absent(ty),
            Predicate::All(ps) => ps.iter().all(|p| p.eval(conds)),
            Predicate::Any(ps) => ps.iter().any(|p| p.eval(conds)),
            Predicate::Not(p) => !p.eval(conds),
        }
    }
}

/// Decides whether an action is eligible in the current condition state.
///
/// The extra requirement is switched by an external boolean (typically a
/// feature gate) fixed when the gate is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionGate {
    base: Predicate,
    extra: Vec<Predicate>,
}

impl ConditionGate {
    pub fn new(base: Predicate) -> Self { Self { base, extra: Vec::new() } }

    /// Also require `pred`, but only when `enabled`.
    pub fn require_if(mut self, enabled: bool, pred: Predicate) -> Self {
        if enabled {
            self.extra.push(pred);
        }
        self
    }

    pub fn handles(&self, conds: &Conditions) -> bool {
        self.base.eval(conds) && self.extra.iter().all(|p| p.eval(conds))
    }
}
