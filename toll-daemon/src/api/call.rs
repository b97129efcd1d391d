use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::Value;

use toll_api_core::{CallResponse, Capability};
use toll_daemon_db::models::AgentRecord;

use crate::error::CallError;
use crate::pipeline::{self, CallTarget};
use crate::AppState;

use super::{ApiError, require_agent};

#[axum::debug_handler]
pub async fn capability_call(
    State(state): State<AppState>,
    Path(verb): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<CallResponse>, ApiError> {
    let capability = verb
        .parse::<Capability>()
        .map_err(|_| ApiError::not_found(format!("Unknown capability '{verb}'")))?;

    let agent = require_agent(&state, &headers).await?;

    run_pipeline(state, agent, CallTarget::Capability(capability), body).await
}

#[axum::debug_handler]
pub async fn proxy_call(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<CallResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    run_pipeline(state, agent, CallTarget::Service(slug), body).await
}

/// The whole pipeline runs under a hard deadline; a timeout drops the call
/// future, whose hold guard compensates any in-flight hold
async fn run_pipeline(
    state: AppState,
    agent: AgentRecord,
    target: CallTarget,
    body: Value,
) -> Result<Json<CallResponse>, ApiError> {
    let outcome = tokio::time::timeout(
        state.pipeline_deadline(),
        pipeline::process_call(&state, &agent, target, body),
    )
    .await
    .map_err(|_| ApiError::from(CallError::Upstream("Pipeline deadline exceeded".to_string())))??;

    Ok(Json(CallResponse {
        data: outcome.data,
        metadata: outcome.metadata,
    }))
}
