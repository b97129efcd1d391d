use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use tracing::info;

use toll_api_core::{
    AgentInfo, CreateAgentRequest, CreateAgentResponse, ListAgentsResponse, PolicyBody,
    PolicyPatch, PolicyResponse, UpdateAgentRequest,
};
use toll_daemon_db::models::AgentRecord;

use crate::{AppState, convert, db};

use super::{ApiError, require_agent};

/// Every agent route is scoped to the caller's account; an id outside it
/// is indistinguishable from a missing one
async fn scoped_agent(
    state: &AppState,
    account_id: &str,
    agent_id: &str,
) -> Result<AgentRecord, ApiError> {
    db::agent_by_id(&state.db, account_id, agent_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("Unknown agent '{agent_id}'")))
}

#[axum::debug_handler]
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListAgentsResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    let agents = db::list_agents(&state.db, &agent.account_id)
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .map(convert::agent_info)
        .collect();

    Ok(Json(ListAgentsResponse { agents }))
}

#[axum::debug_handler]
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateAgentRequest>,
) -> Result<Json<CreateAgentResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    if request.name.trim().is_empty() {
        return Err(ApiError::validation("Name must not be empty"));
    }

    let (created, api_key) = db::create_agent(&state.db, &agent.account_id, &request.name)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(CreateAgentResponse {
        agent: convert::agent_info(created),
        api_key,
    }))
}

#[axum::debug_handler]
pub async fn get(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AgentInfo>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    let target = scoped_agent(&state, &agent.account_id, &agent_id).await?;

    Ok(Json(convert::agent_info(target)))
}

#[axum::debug_handler]
pub async fn update(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdateAgentRequest>,
) -> Result<Json<AgentInfo>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    scoped_agent(&state, &agent.account_id, &agent_id).await?;

    if let Some(status) = &request.status {
        if !matches!(status.as_str(), "active" | "suspended") {
            return Err(ApiError::validation(
                "Status must be 'active' or 'suspended'",
            ));
        }
    }

    let updated = db::update_agent(
        &state.db,
        &agent.account_id,
        &agent_id,
        request.name,
        request.status,
    )
    .await
    .map_err(ApiError::internal)?
    .ok_or_else(|| ApiError::not_found(format!("Unknown agent '{agent_id}'")))?;

    Ok(Json(convert::agent_info(updated)))
}

/// Deleting an agent retires its credential for good
#[axum::debug_handler]
pub async fn remove(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AgentInfo>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    scoped_agent(&state, &agent.account_id, &agent_id).await?;

    let killed = db::update_agent(
        &state.db,
        &agent.account_id,
        &agent_id,
        None,
        Some("killed".to_string()),
    )
    .await
    .map_err(ApiError::internal)?
    .ok_or_else(|| ApiError::not_found(format!("Unknown agent '{agent_id}'")))?;

    info!(?agent_id, "agent killed");

    Ok(Json(convert::agent_info(killed)))
}

#[axum::debug_handler]
pub async fn get_policy(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PolicyResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    scoped_agent(&state, &agent.account_id, &agent_id).await?;

    let record = db::policy_for_agent(&state.db, &agent_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("Agent '{agent_id}' has no policy")))?;

    Ok(Json(convert::policy_response(&record)))
}

#[axum::debug_handler]
pub async fn put_policy(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PolicyBody>,
) -> Result<Json<PolicyResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    scoped_agent(&state, &agent.account_id, &agent_id).await?;

    let record = db::replace_policy(&state.db, &agent_id, body)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("Agent '{agent_id}' has no policy")))?;

    info!(?agent_id, "policy replaced");

    Ok(Json(convert::policy_response(&record)))
}

#[axum::debug_handler]
pub async fn patch_policy(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<PolicyPatch>,
) -> Result<Json<PolicyResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    scoped_agent(&state, &agent.account_id, &agent_id).await?;

    let record = db::patch_policy(&state.db, &agent_id, patch)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("Agent '{agent_id}' has no policy")))?;

    info!(?agent_id, "policy patched");

    Ok(Json(convert::policy_response(&record)))
}

#[axum::debug_handler]
pub async fn kill(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PolicyResponse>, ApiError> {
    set_kill(state, agent_id, headers, true).await
}

#[axum::debug_handler]
pub async fn unkill(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PolicyResponse>, ApiError> {
    set_kill(state, agent_id, headers, false).await
}

async fn set_kill(
    state: AppState,
    agent_id: String,
    headers: HeaderMap,
    engaged: bool,
) -> Result<Json<PolicyResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    scoped_agent(&state, &agent.account_id, &agent_id).await?;

    let record = db::set_kill_switch(&state.db, &agent_id, engaged)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("Agent '{agent_id}' has no policy")))?;

    Ok(Json(convert::policy_response(&record)))
}
