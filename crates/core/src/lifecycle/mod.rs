//! Travel-request lifecycle: status graph, alias normalization and the
//! engine that applies role-gated transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod engine;
pub mod graph;

pub use engine::{
    CreateOptions, LifecycleConfig, LifecycleEngine, TransitionOptions, TransitionReceipt,
};
pub use graph::{can_transition, can_transition_raw, normalize_status, ResolvedStatus};

/// Explicit approver decision attached to a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    Approve,
    Reject,
}

impl TransitionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for TransitionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a best-effort side channel. Failures are reported, never thrown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum SideEffect {
    Delivered,
    Failed(String),
}

impl SideEffect {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    /// Folds several outcomes into one, keeping every failure reason.
    pub fn combine(outcomes: impl IntoIterator<Item = SideEffect>) -> Self {
        let failures: Vec<String> = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                Self::Delivered => None,
                Self::Failed(reason) => Some(reason),
            })
            .collect();
        if failures.is_empty() {
            Self::Delivered
        } else {
            Self::Failed(failures.join("; "))
        }
    }
}
