use axum::Json;
use axum::extract::{Path, State};

use toll_api_core::{
    Capability, CapabilityInfo, ListCapabilitiesResponse, ListPricingResponse,
    ListServicesResponse, ServiceInfo,
};

use crate::{AppState, convert, db};

use super::ApiError;

#[axum::debug_handler]
pub async fn list(State(state): State<AppState>) -> Result<Json<ListServicesResponse>, ApiError> {
    let services = db::list_services(&state.db)
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .map(convert::service_info)
        .collect();

    Ok(Json(ListServicesResponse { services }))
}

#[axum::debug_handler]
pub async fn get(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<ServiceInfo>, ApiError> {
    let service = db::service_by_slug(&state.db, &slug)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("Unknown service '{slug}'")))?;

    Ok(Json(convert::service_info(service)))
}

#[axum::debug_handler]
pub async fn pricing(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<ListPricingResponse>, ApiError> {
    let service = db::service_by_slug(&state.db, &slug)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("Unknown service '{slug}'")))?;

    let pricing = db::pricing_for_service(&state.db, &service.id)
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .map(convert::pricing_info)
        .collect();

    Ok(Json(ListPricingResponse {
        service: service.slug,
        pricing,
    }))
}

#[axum::debug_handler]
pub async fn list_capabilities(
    State(state): State<AppState>,
) -> Result<Json<ListCapabilitiesResponse>, ApiError> {
    Ok(Json(ListCapabilitiesResponse {
        capabilities: state.registry.capabilities(),
    }))
}

#[axum::debug_handler]
pub async fn get_capability(
    State(state): State<AppState>,
    Path(verb): Path<String>,
) -> Result<Json<CapabilityInfo>, ApiError> {
    let capability = verb
        .parse::<Capability>()
        .map_err(|_| ApiError::not_found(format!("Unknown capability '{verb}'")))?;

    Ok(Json(state.registry.capability_info(capability)))
}
