//! Explicit outcome of the request-path gates.
//!
//! A backend failure on the request path never turns into an error for the
//! caller. It resolves to [`Decision::Fallback`] carrying the configured
//! [`FailurePolicy`], so the choice to fail open (or closed) is visible at
//! the call site instead of hidden in an error branch.

use serde::{Deserialize, Serialize};

/// What to do when the backing store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through.
    #[default]
    Open,
    /// Refuse the request.
    Closed,
}

impl FailurePolicy {
    pub fn allows(&self) -> bool {
        matches!(self, FailurePolicy::Open)
    }
}

/// Result of consulting a gate for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    /// The backend failed; the policy decides.
    Fallback(FailurePolicy),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        match self {
            Decision::Allow => true,
            Decision::Deny => false,
            Decision::Fallback(policy) => policy.allows(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Decision::Fallback(_))
    }
}
