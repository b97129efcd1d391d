use serde_json::{Value, json};
use thiserror::Error;

/// Call-processing failures, one variant per wire error code
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Invalid or unknown API key")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("Denied by policy: {reason}")]
    PolicyDenied { reason: &'static str },

    #[error("Insufficient balance: {required} sats required, {available} sats available")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl CallError {
    pub fn code(&self) -> &'static str {
        match self {
            CallError::Unauthorized => "UNAUTHORIZED",
            CallError::Validation(..) => "VALIDATION_ERROR",
            CallError::PolicyDenied { .. } => "POLICY_DENIED",
            CallError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            CallError::NotFound(..) => "NOT_FOUND",
            CallError::Upstream(..) => "UPSTREAM_ERROR",
            CallError::Internal(..) => "INTERNAL",
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            CallError::PolicyDenied { reason } => Some(json!({ "reason": reason })),
            CallError::InsufficientBalance {
                required,
                available,
            } => Some(json!({ "required_sats": required, "available_sats": available })),
            _ => None,
        }
    }

    pub fn internal(error: impl std::fmt::Display) -> Self {
        CallError::Internal(error.to_string())
    }
}

impl From<anyhow::Error> for CallError {
    fn from(error: anyhow::Error) -> Self {
        CallError::Internal(error.to_string())
    }
}
