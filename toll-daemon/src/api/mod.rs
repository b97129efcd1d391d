mod account;
mod agents;
mod call;
mod services;
mod submissions;
mod wallet;
mod webhooks;

use std::fmt::Display;

use axum::Json;
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use tracing::error;

use toll_api_core::{ErrorBody, ErrorDetail};
use toll_daemon_db::models::AgentRecord;

use crate::error::CallError;
use crate::{AppState, auth};

pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Display) -> Self {
        Self {
            status,
            code,
            message: message.to_string(),
            details: None,
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "Invalid or unknown API key",
        )
    }

    pub fn validation(message: impl Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn not_found(message: impl Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn internal(error: impl Display) -> Self {
        error!(error = %error, "internal error");

        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "Internal error")
    }
}

impl From<CallError> for ApiError {
    fn from(call_error: CallError) -> Self {
        if let CallError::Internal(message) = &call_error {
            error!(error = %message, "internal error");
        }

        let status = match &call_error {
            CallError::Unauthorized => StatusCode::UNAUTHORIZED,
            CallError::Validation(..) => StatusCode::BAD_REQUEST,
            CallError::PolicyDenied { .. } => StatusCode::FORBIDDEN,
            CallError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            CallError::NotFound(..) => StatusCode::NOT_FOUND,
            CallError::Upstream(..) => StatusCode::BAD_GATEWAY,
            CallError::Internal(..) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            status,
            code: call_error.code(),
            details: call_error.details(),
            message: call_error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };

        (self.status, Json(body)).into_response()
    }
}

/// Resolves the Bearer token on a request to an agent record
pub async fn require_agent(state: &AppState, headers: &HeaderMap) -> Result<AgentRecord, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(ApiError::unauthorized)?;

    auth::authenticate(&state.db, token).await.map_err(ApiError::from)
}

/// Admin surface: a shared secret header checked in constant time
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = state
        .args
        .admin_token
        .as_deref()
        .ok_or_else(ApiError::unauthorized)?;

    let provided = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return Err(ApiError::unauthorized());
    }

    Ok(())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/signup", post(account::signup))
        .route("/v1/capabilities", get(services::list_capabilities))
        .route(
            "/v1/capabilities/{verb}",
            get(services::get_capability).post(call::capability_call),
        )
        .route("/v1/proxy/{slug}", post(call::proxy_call))
        .route("/v1/wallet", get(wallet::get_wallet))
        .route("/v1/wallet/fund", post(wallet::fund))
        .route("/v1/wallet/fund-card", post(wallet::fund_card))
        .route("/v1/wallet/transactions", get(wallet::list_transactions))
        .route("/v1/wallet/events", get(wallet::events))
        .route("/v1/agents", get(agents::list).post(agents::create))
        .route(
            "/v1/agents/{id}",
            get(agents::get).patch(agents::update).delete(agents::remove),
        )
        .route(
            "/v1/agents/{id}/policy",
            get(agents::get_policy)
                .put(agents::put_policy)
                .patch(agents::patch_policy),
        )
        .route("/v1/agents/{id}/policy/kill", post(agents::kill))
        .route("/v1/agents/{id}/policy/unkill", post(agents::unkill))
        .route("/v1/services", get(services::list))
        .route("/v1/services/{slug}", get(services::get))
        .route("/v1/services/{slug}/pricing", get(services::pricing))
        .route("/v1/registry/submit", post(submissions::submit))
        .route("/v1/registry/submissions", get(submissions::list))
        .route(
            "/v1/registry/submissions/{id}/approve",
            post(submissions::approve),
        )
        .route(
            "/v1/registry/submissions/{id}/reject",
            post(submissions::reject),
        )
        .route("/v1/webhooks/checkout", post(webhooks::checkout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_compares_correctly() {
        assert!(constant_time_eq(b"secret", b"secret"));

        assert!(!constant_time_eq(b"secret", b"secrex"));

        assert!(!constant_time_eq(b"secret", b"secre"));

        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn call_errors_map_to_wire_codes() {
        let error = ApiError::from(CallError::InsufficientBalance {
            required: 500,
            available: 10,
        });

        assert_eq!(error.status, StatusCode::PAYMENT_REQUIRED);

        assert_eq!(error.code, "INSUFFICIENT_BALANCE");

        let details = error.details.unwrap();

        assert_eq!(details["required_sats"], 500);

        assert_eq!(details["available_sats"], 10);

        let error = ApiError::from(CallError::PolicyDenied {
            reason: "kill_switch_active",
        });

        assert_eq!(error.status, StatusCode::FORBIDDEN);

        assert_eq!(error.details.unwrap()["reason"], "kill_switch_active");
    }
}
