use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use tracing::info;
use url::Url;

use toll_api_core::{ListSubmissionsResponse, SubmissionInfo, SubmitServiceRequest};
use toll_core::{id, money, unix_time};
use toll_daemon_db::models::{PricingRecord, ServiceRecord, SubmissionRecord};

use crate::adapter::generic::GenericAdapter;
use crate::adapter::{AdapterDeps, credentials};
use crate::pricing::PriceUnit;
use crate::registry::ProviderEntry;
use crate::{AppState, convert, db};

use super::{ApiError, require_admin, require_agent};

fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[axum::debug_handler]
pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitServiceRequest>,
) -> Result<Json<SubmissionInfo>, ApiError> {
    require_agent(&state, &headers).await?;

    if !valid_slug(&request.slug) {
        return Err(ApiError::validation(
            "Slug must be lowercase letters, digits and dashes",
        ));
    }

    if request.name.trim().is_empty() {
        return Err(ApiError::validation("Name must not be empty"));
    }

    let base_url = Url::parse(&request.base_url)
        .map_err(|_| ApiError::validation("Base url is not a valid url"))?;

    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(ApiError::validation("Base url must be http or https"));
    }

    if !credentials::AUTH_TYPES.contains(&request.auth_type.as_str()) {
        return Err(ApiError::validation(format!(
            "Auth type must be one of {:?}",
            credentials::AUTH_TYPES
        )));
    }

    if !credentials::allowlisted(&request.auth_credential_env) {
        return Err(ApiError::validation(format!(
            "Credential env '{}' is not allowlisted",
            request.auth_credential_env
        )));
    }

    if PriceUnit::parse(&request.unit).is_none() {
        return Err(ApiError::validation(format!(
            "Unknown pricing unit '{}'",
            request.unit
        )));
    }

    if request.price_usd_micros <= 0 {
        return Err(ApiError::validation("Price must be positive"));
    }

    if db::service_by_slug(&state.db, &request.slug)
        .await
        .map_err(ApiError::internal)?
        .is_some()
    {
        return Err(ApiError::validation(format!(
            "Slug '{}' is already taken",
            request.slug
        )));
    }

    let record = db::create_submission(
        &state.db,
        SubmissionRecord {
            id: id::new_id(id::SUBMISSION),
            slug: request.slug,
            name: request.name,
            base_url: request.base_url,
            auth_type: request.auth_type,
            auth_credential_env: request.auth_credential_env,
            capability: request.capability.map(|verb| verb.as_str().to_string()),
            default_operation: request.default_operation,
            price_usd_micros: request.price_usd_micros,
            unit: request.unit,
            status: "pending".to_string(),
            reviewed_at: None,
            created_at: unix_time(),
        },
    )
    .await
    .map_err(ApiError::internal)?;

    Ok(Json(convert::submission_info(record)))
}

#[axum::debug_handler]
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListSubmissionsResponse>, ApiError> {
    require_admin(&state, &headers)?;

    let submissions = db::list_submissions(&state.db)
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .map(convert::submission_info)
        .collect();

    Ok(Json(ListSubmissionsResponse { submissions }))
}

/// Approval creates the service and its pricing row, then attaches the
/// generic adapter so the provider is callable immediately
#[axum::debug_handler]
pub async fn approve(
    State(state): State<AppState>,
    Path(submission_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SubmissionInfo>, ApiError> {
    require_admin(&state, &headers)?;

    let submission = db::submission_by_id(&state.db, &submission_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("Unknown submission '{submission_id}'")))?;

    if submission.status != "pending" {
        return Err(ApiError::validation("Submission was already reviewed"));
    }

    let price_sats = state
        .pricing
        .current_rate()
        .map(|rate| money::usd_micros_to_sats(submission.price_usd_micros, rate))
        .unwrap_or(0);

    let service_record = ServiceRecord {
        id: id::new_id(id::SERVICE),
        slug: submission.slug.clone(),
        name: submission.name.clone(),
        tier: "community".to_string(),
        status: "active".to_string(),
        base_url: submission.base_url.clone(),
        auth_type: submission.auth_type.clone(),
        auth_credential_env: submission.auth_credential_env.clone(),
        created_at: unix_time(),
    };

    let pricing_record = PricingRecord {
        id: id::new_id(id::SERVICE_PRICING),
        service_id: service_record.id.clone(),
        operation: submission.default_operation.clone(),
        cost_usd_micros: submission.price_usd_micros,
        price_usd_micros: submission.price_usd_micros,
        price_sats,
        unit: submission.unit.clone(),
        updated_at: unix_time(),
    };

    db::create_service(&state.db, service_record.clone(), vec![pricing_record])
        .await
        .map_err(ApiError::internal)?;

    let deps = AdapterDeps {
        pricing: state.pricing.clone(),
        upstream: state.upstream.clone(),
    };

    state.registry.register_adapter(
        &submission.slug,
        Arc::new(GenericAdapter::new(
            service_record,
            submission.default_operation.clone(),
            deps,
        )),
    );

    if let Some(capability) = submission.capability.as_deref().and_then(|verb| verb.parse().ok()) {
        state.registry.register_provider(
            capability,
            ProviderEntry {
                slug: submission.slug.clone(),
                priority: 10,
                active: true,
            },
        );
    }

    db::set_submission_status(&state.db, &submission_id, "approved")
        .await
        .map_err(ApiError::internal)?;

    info!(?submission_id, slug = ?submission.slug, "submission approved");

    let reviewed = db::submission_by_id(&state.db, &submission_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("Submission vanished during review"))?;

    Ok(Json(convert::submission_info(reviewed)))
}

#[axum::debug_handler]
pub async fn reject(
    State(state): State<AppState>,
    Path(submission_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SubmissionInfo>, ApiError> {
    require_admin(&state, &headers)?;

    let submission = db::submission_by_id(&state.db, &submission_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("Unknown submission '{submission_id}'")))?;

    if submission.status != "pending" {
        return Err(ApiError::validation("Submission was already reviewed"));
    }

    db::set_submission_status(&state.db, &submission_id, "rejected")
        .await
        .map_err(ApiError::internal)?;

    info!(?submission_id, "submission rejected");

    let reviewed = db::submission_by_id(&state.db, &submission_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("Submission vanished during review"))?;

    Ok(Json(convert::submission_info(reviewed)))
}
