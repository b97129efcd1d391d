use axum::Json;
use axum::extract::State;
use tracing::info;

use toll_api_core::{SignupRequest, SignupResponse};

use crate::AppState;
use crate::db;

use super::ApiError;

#[axum::debug_handler]
pub async fn signup(
    State(state): State<AppState>,
    Json(request): Json<SignupRequest>,
) -> Result<Json<SignupResponse>, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::validation("Name must not be empty"));
    }

    let (account, _, agent, api_key) = db::create_account(&state.db, request.name, request.email)
        .await
        .map_err(ApiError::internal)?;

    info!(account_id = ?account.id, agent_id = ?agent.id, "signup complete");

    Ok(Json(SignupResponse {
        account_id: account.id,
        agent_id: agent.id,
        api_key,
    }))
}
