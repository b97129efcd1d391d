use std::convert::Infallible;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::info;

use toll_api_core::{
    FundCardRequest, FundCardResponse, FundRequest, FundResponse, ListTransactionsResponse,
    WalletResponse,
};
use toll_core::{id, money, unix_time};
use toll_daemon_db::models::{CheckoutRecord, InvoiceRecord, WalletRecord};

use crate::error::CallError;
use crate::{AppState, convert, db, policy};

use super::{ApiError, require_agent};

const TRANSACTION_PAGE_SIZE: i64 = 100;

async fn wallet_for(state: &AppState, account_id: &str) -> Result<WalletRecord, ApiError> {
    db::wallet_by_account(&state.db, account_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal(format!("Account {account_id} has no wallet")))
}

#[axum::debug_handler]
pub async fn get_wallet(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WalletResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    let wallet = wallet_for(&state, &agent.account_id).await?;

    Ok(Json(convert::wallet_response(wallet)))
}

#[axum::debug_handler]
pub async fn fund(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FundRequest>,
) -> Result<Json<FundResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    if request.amount_sats <= 0 {
        return Err(ApiError::validation("Amount must be positive"));
    }

    let wallet = wallet_for(&state, &agent.account_id).await?;

    // max_balance_sats caps the wallet at funding time
    let policy_record = db::policy_for_agent(&state.db, &agent.id)
        .await
        .map_err(ApiError::internal)?;

    if let Some(cap) = policy_record.and_then(|record| record.max_balance_sats) {
        if wallet.balance_sats + request.amount_sats > cap {
            return Err(CallError::PolicyDenied {
                reason: policy::MAX_BALANCE_EXCEEDED,
            }
            .into());
        }
    }

    let lnd = state.lnd.as_ref().ok_or_else(|| {
        ApiError::from(CallError::Upstream("Lightning node not configured".to_string()))
    })?;

    let created = lnd
        .add_invoice(
            request.amount_sats,
            &format!("toll wallet funding {}", wallet.id),
            state.args.invoice_expiry_secs,
        )
        .await
        .map_err(|error| ApiError::from(CallError::Upstream(error.to_string())))?;

    let record = db::create_invoice(
        &state.db,
        InvoiceRecord {
            id: id::new_id(id::INVOICE),
            wallet_id: wallet.id,
            amount_sats: request.amount_sats,
            payment_request: created.payment_request,
            r_hash: created.r_hash_hex,
            status: "pending".to_string(),
            expires_at: unix_time() + state.args.invoice_expiry_secs as i64 * 1_000,
            settled_at: None,
            created_at: unix_time(),
        },
    )
    .await
    .map_err(ApiError::internal)?;

    info!(invoice_id = ?record.id, amount_sats = ?record.amount_sats, "funding invoice created");

    Ok(Json(FundResponse {
        invoice_id: record.id,
        payment_request: record.payment_request,
        expires_at: record.expires_at,
    }))
}

#[axum::debug_handler]
pub async fn fund_card(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FundCardRequest>,
) -> Result<Json<FundCardResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    if request.amount_usd_cents <= 0 {
        return Err(ApiError::validation("Amount must be positive"));
    }

    let wallet = wallet_for(&state, &agent.account_id).await?;

    let checkout_base = state.args.checkout_base_url.as_ref().ok_or_else(|| {
        ApiError::from(CallError::Upstream("Card checkout not configured".to_string()))
    })?;

    let rate = state.pricing.current_rate().ok_or_else(|| {
        ApiError::from(CallError::Upstream("BTC/USD rate unavailable".to_string()))
    })?;

    let record = db::create_checkout(
        &state.db,
        CheckoutRecord {
            id: id::new_id(id::CHECKOUT),
            wallet_id: wallet.id,
            external_session_id: id::new_id("cs"),
            amount_usd_cents: request.amount_usd_cents,
            btc_usd_rate: rate,
            // Reporting equivalent only; the credit stays in USD
            amount_sats: money::usd_cents_to_sats(request.amount_usd_cents, rate),
            status: "pending".to_string(),
            completed_at: None,
            created_at: unix_time(),
        },
    )
    .await
    .map_err(ApiError::internal)?;

    let checkout_url = format!(
        "{}/pay/{}",
        checkout_base.as_str().trim_end_matches('/'),
        record.external_session_id
    );

    info!(session_id = ?record.id, amount_usd_cents = ?record.amount_usd_cents, "checkout session created");

    Ok(Json(FundCardResponse {
        session_id: record.id,
        checkout_url,
    }))
}

/// Server-sent balance updates for the caller's wallet, fed by the ledger
/// through the event bus
#[axum::debug_handler]
pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    let wallet = wallet_for(&state, &agent.account_id).await?;

    let stream = state.events.subscribe(wallet.id).map(|update| {
        let event = match update {
            Ok(update) => Event::default().event("balance").data(
                json!({
                    "wallet_id": update.wallet_id,
                    "balance_sats": update.balance_sats,
                    "balance_usd_cents": update.balance_usd_cents,
                })
                .to_string(),
            ),
            Err(_) => Event::default().event("lagged").data("{}"),
        };

        Ok(event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[axum::debug_handler]
pub async fn list_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    let agent = require_agent(&state, &headers).await?;

    let wallet = wallet_for(&state, &agent.account_id).await?;

    let transactions = db::list_transactions(&state.db, &wallet.id, TRANSACTION_PAGE_SIZE)
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .map(convert::transaction_info)
        .collect();

    Ok(Json(ListTransactionsResponse { transactions }))
}
