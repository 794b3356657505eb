//! Error taxonomy for the governance core
//!
//! One enum per concern. Governance rejections (`GovernanceError`) are
//! expected outcomes and are returned, never panicked on.

use policy_lang::{BaseKind, EvalError, ValidationError};
use thiserror::Error;
use uuid::Uuid;

use crate::types::UserPolicyStatus;

/// A compiled artifact could not be loaded or instantiated
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("policy '{unique_name}' is denied and cannot be instantiated")]
    Denied { unique_name: String },

    #[error("policy '{unique_name}' failed to load: {primary}; registry fallback: {fallback}")]
    LoadFailed {
        unique_name: String,
        primary: String,
        fallback: String,
    },

    #[error("missing argument '{0}'")]
    MissingArgument(String),

    #[error("unexpected argument '{0}'")]
    UnexpectedArgument(String),

    #[error("takes {expected} positional argument(s) but {found} were given")]
    TooManyArguments { expected: usize, found: usize },

    #[error("evaluation failed: {0}")]
    Evaluation(#[from] EvalError),

    #[error("'{unique_name}' is a {found} class, expected {expected}")]
    WrongKind {
        unique_name: String,
        expected: BaseKind,
        found: BaseKind,
    },

    #[error("persisted state belongs to '{found}', not '{expected}'")]
    StateMismatch { expected: String, found: String },
}

/// An input identifier could not be attributed to an owner
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OwnershipError {
    #[error("argument '{argument}' carries no identifier")]
    MissingUid { argument: String },

    #[error("no reachable node owns '{id}' (argument '{argument}')")]
    Unclaimed { argument: String, id: Uuid },

    #[error("connection registry unavailable: {0}")]
    Connection(String),
}

/// A governance contract refused the request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GovernanceError {
    #[error("output policy exhausted: {count}/{limit} releases used")]
    Exhausted { count: u64, limit: u64 },

    #[error("policy '{policy}' did not admit the request")]
    Rejected { policy: String },

    #[error("input '{argument}' is not permitted: expected {expected}, got {found}")]
    Violation {
        argument: String,
        expected: String,
        found: String,
    },

    #[error("node '{node}' owns none of this policy's inputs")]
    NotOwner { node: String },

    #[error("object {id} for input '{argument}' is not in the store")]
    ObjectMissing { argument: String, id: Uuid },

    #[error("policy evaluation failed: {0}")]
    Evaluation(#[from] EvalError),

    #[error("store error: {0}")]
    Store(String),

    #[error("persisted policy state is inconsistent: {0}")]
    CorruptState(String),
}

/// Umbrella error for the engine facade
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("ownership error: {0}")]
    Ownership(#[from] OwnershipError),

    #[error("governance: {0}")]
    Governance(#[from] GovernanceError),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: UserPolicyStatus,
        to: UserPolicyStatus,
    },

    #[error("no persisted state for policy {0}")]
    UnknownPolicy(Uuid),

    #[error("store error: {0}")]
    Store(String),

    #[error("submission pipeline step '{0}' produced no value")]
    Incomplete(&'static str),
}

impl PolicyError {
    /// Stable code for audit logs
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::Validation(_) => "VALIDATION",
            PolicyError::Execution(ExecutionError::Denied { .. }) => "EXEC_DENIED",
            PolicyError::Execution(ExecutionError::LoadFailed { .. }) => "EXEC_LOAD_FAILED",
            PolicyError::Execution(_) => "EXEC",
            PolicyError::Ownership(_) => "OWNERSHIP",
            PolicyError::Governance(GovernanceError::Exhausted { .. }) => "POLICY_EXHAUSTED",
            PolicyError::Governance(GovernanceError::Violation { .. }) => "POLICY_VIOLATION",
            PolicyError::Governance(GovernanceError::CorruptState(_)) => "CORRUPT_STATE",
            PolicyError::Governance(_) => "GOVERNANCE",
            PolicyError::Codec(_) => "CODEC",
            PolicyError::Config(_) => "CONFIG",
            PolicyError::InvalidTransition { .. } => "INVALID_TRANSITION",
            PolicyError::UnknownPolicy(_) => "UNKNOWN_POLICY",
            PolicyError::Store(_) => "STORE",
            PolicyError::Incomplete(_) => "PIPELINE",
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, PolicyError::Governance(GovernanceError::Exhausted { .. }))
    }
}

pub type Result<T, E = PolicyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let err = PolicyError::from(GovernanceError::Exhausted { count: 3, limit: 3 });
        assert_eq!(err.code(), "POLICY_EXHAUSTED");
        assert!(err.is_exhausted());
        assert_eq!(err.to_string(), "governance: output policy exhausted: 3/3 releases used");

        let err = PolicyError::from(ExecutionError::LoadFailed {
            unique_name: "A_k_h".into(),
            primary: "boom".into(),
            fallback: "not registered".into(),
        });
        assert_eq!(err.code(), "EXEC_LOAD_FAILED");
        assert!(err.to_string().contains("boom"));
        assert!(err.to_string().contains("not registered"));
    }
}
