//! Funding settlement tasks. The invoice settler subscribes to the node's
//! settle stream and credits wallets exactly once per invoice; the expiry
//! sweep retires stale pending invoices; checkout completion is driven by
//! the card-processor webhook.

use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use toll_core::unix_time;
use toll_daemon_db::models::CheckoutRecord;

use crate::ledger::{self, Credit};
use crate::lnd::SettledEvent;
use crate::{AppState, db};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run_invoice_settler(state: AppState, ct: CancellationToken) {
    let Some(lnd) = state.lnd.clone() else {
        info!("lightning node not configured, invoice settler disabled");

        return;
    };

    loop {
        match lnd.subscribe_settled().await {
            Ok(stream) => {
                let mut stream = Box::pin(stream);

                loop {
                    tokio::select! {
                        _ = ct.cancelled() => return,
                        event = stream.next() => match event {
                            Some(Ok(settled)) => {
                                if let Err(error) = apply_settled_invoice(&state, settled).await {
                                    warn!(?error, "failed to apply settled invoice");
                                }
                            }
                            Some(Err(error)) => {
                                warn!(?error, "invoice stream error");

                                break;
                            }
                            None => {
                                warn!("invoice stream ended, reconnecting");

                                break;
                            }
                        }
                    }
                }
            }
            Err(error) => warn!(?error, "failed to subscribe to invoice stream"),
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = ct.cancelled() => return,
        }
    }
}

/// Claims the invoice row and credits the wallet. The claim is gated on
/// `status = 'pending'`, so a replayed or sibling event finds zero rows and
/// is discarded; the ledger's reference constraint is the second line of
/// defense.
pub async fn apply_settled_invoice(state: &AppState, settled: SettledEvent) -> Result<()> {
    let Some(invoice) = db::claim_settled_invoice(&state.db, &settled.r_hash_hex).await? else {
        info!(r_hash = ?settled.r_hash_hex, "settled invoice is not ours or already claimed");

        return Ok(());
    };

    if settled.amount_paid_sats < invoice.amount_sats {
        warn!(
            invoice_id = ?invoice.id,
            amount_paid_sats = ?settled.amount_paid_sats,
            "node reported an underpaid settle, crediting the invoice amount"
        );
    }

    let credit =
        ledger::credit_from_invoice(&state.db, &invoice.wallet_id, invoice.amount_sats, &invoice.id)
            .await?;

    match credit {
        Credit::Applied(_, wallet) => {
            info!(invoice_id = ?invoice.id, amount_sats = ?invoice.amount_sats, "invoice settled");

            state
                .events
                .publish_balance(wallet.id.clone(), wallet.balance_sats, wallet.balance_usd_cents);
        }
        Credit::AlreadyApplied => {
            warn!(invoice_id = ?invoice.id, "invoice credit was already applied");
        }
    }

    Ok(())
}

/// Periodically retires pending invoices past their expiry
pub async fn run_invoice_expiry(state: AppState, ct: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(EXPIRY_SWEEP_INTERVAL) => {}
            _ = ct.cancelled() => return,
        }

        match db::expire_invoices(&state.db, unix_time()).await {
            Ok(0) => {}
            Ok(count) => info!(?count, "expired invoices"),
            Err(error) => warn!(?error, "failed to expire invoices"),
        }
    }
}

/// Card checkout completion: atomic claim by external session id, then a
/// USD credit. Unknown or already-completed sessions are discarded.
pub async fn apply_completed_checkout(
    state: &AppState,
    external_session_id: &str,
) -> Result<Option<CheckoutRecord>> {
    let Some(session) = db::claim_completed_checkout(&state.db, external_session_id).await? else {
        info!(?external_session_id, "checkout session unknown or already completed");

        return Ok(None);
    };

    let credit = ledger::credit_from_checkout(
        &state.db,
        &session.wallet_id,
        session.amount_usd_cents,
        &session.id,
    )
    .await?;

    match credit {
        Credit::Applied(_, wallet) => {
            info!(session_id = ?session.id, amount_usd_cents = ?session.amount_usd_cents, "checkout completed");

            state
                .events
                .publish_balance(wallet.id.clone(), wallet.balance_sats, wallet.balance_usd_cents);
        }
        Credit::AlreadyApplied => {
            warn!(session_id = ?session.id, "checkout credit was already applied");
        }
    }

    Ok(Some(session))
}

#[cfg(test)]
mod tests {
    use super::*;

    use toll_core::id;

    use crate::db::test_database;
    use crate::test_state;
    use toll_daemon_db::models::InvoiceRecord;

    async fn pending_invoice(state: &AppState, wallet_id: &str, r_hash: &str, sats: i64) {
        db::create_invoice(
            &state.db,
            InvoiceRecord {
                id: id::new_id(id::INVOICE),
                wallet_id: wallet_id.to_string(),
                amount_sats: sats,
                payment_request: "lnbc1...".to_string(),
                r_hash: r_hash.to_string(),
                status: "pending".to_string(),
                expires_at: unix_time() + 60_000,
                settled_at: None,
                created_at: unix_time(),
            },
        )
        .await
        .unwrap();
    }

    fn settled(r_hash: &str, sats: i64) -> SettledEvent {
        SettledEvent {
            r_hash_hex: r_hash.to_string(),
            amount_paid_sats: sats,
        }
    }

    #[tokio::test]
    async fn replayed_settle_events_credit_once() {
        let (_dir, db) = test_database();

        let state = test_state(db);

        let (_, wallet, ..) = db::create_account(&state.db, "a".to_string(), None).await.unwrap();

        let r_hash = "cd".repeat(32);

        pending_invoice(&state, &wallet.id, &r_hash, 1_000).await;

        apply_settled_invoice(&state, settled(&r_hash, 1_000)).await.unwrap();

        apply_settled_invoice(&state, settled(&r_hash, 1_000)).await.unwrap();

        let row = db::wallet_by_id(&state.db, &wallet.id).await.unwrap().unwrap();

        assert_eq!(row.balance_sats, 1_000);

        assert_eq!(row.lifetime_in_sats, 1_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_settle_events_credit_once() {
        let (_dir, db) = test_database();

        let state = test_state(db);

        let (_, wallet, ..) = db::create_account(&state.db, "a".to_string(), None).await.unwrap();

        let r_hash = "ef".repeat(32);

        pending_invoice(&state, &wallet.id, &r_hash, 1_000).await;

        let first = tokio::spawn({
            let state = state.clone();

            let r_hash = r_hash.clone();

            async move { apply_settled_invoice(&state, settled(&r_hash, 1_000)).await }
        });

        let second = tokio::spawn({
            let state = state.clone();

            let r_hash = r_hash.clone();

            async move { apply_settled_invoice(&state, settled(&r_hash, 1_000)).await }
        });

        first.await.unwrap().unwrap();

        second.await.unwrap().unwrap();

        let row = db::wallet_by_id(&state.db, &wallet.id).await.unwrap().unwrap();

        assert_eq!(row.balance_sats, 1_000);

        let invoice_id = {
            use diesel::prelude::*;
            use toll_daemon_db::schema::invoice;

            let mut conn = state.db.get_connection().await;

            invoice::table
                .filter(invoice::r_hash.eq(&r_hash))
                .select(invoice::id)
                .first::<String>(&mut conn)
                .unwrap()
        };

        let record = ledger::transaction_by_reference(&state.db, "invoice", &invoice_id)
            .await
            .unwrap();

        assert!(record.is_some());
    }

    #[tokio::test]
    async fn unknown_invoices_are_discarded() {
        let (_dir, db) = test_database();

        let state = test_state(db);

        let (_, wallet, ..) = db::create_account(&state.db, "a".to_string(), None).await.unwrap();

        apply_settled_invoice(&state, settled(&"11".repeat(32), 500)).await.unwrap();

        let row = db::wallet_by_id(&state.db, &wallet.id).await.unwrap().unwrap();

        assert_eq!(row.balance_sats, 0);
    }

    #[tokio::test]
    async fn duplicate_checkout_webhooks_credit_once() {
        let (_dir, db) = test_database();

        let state = test_state(db);

        let (_, wallet, ..) = db::create_account(&state.db, "a".to_string(), None).await.unwrap();

        db::create_checkout(
            &state.db,
            CheckoutRecord {
                id: id::new_id(id::CHECKOUT),
                wallet_id: wallet.id.clone(),
                external_session_id: "cs_x1".to_string(),
                amount_usd_cents: 2_000,
                btc_usd_rate: 100_000.0,
                amount_sats: 20_000,
                status: "pending".to_string(),
                completed_at: None,
                created_at: unix_time(),
            },
        )
        .await
        .unwrap();

        let first = apply_completed_checkout(&state, "cs_x1").await.unwrap();

        assert!(first.is_some());

        let second = apply_completed_checkout(&state, "cs_x1").await.unwrap();

        assert!(second.is_none());

        let row = db::wallet_by_id(&state.db, &wallet.id).await.unwrap().unwrap();

        assert_eq!(row.balance_usd_cents, 2_000);

        assert_eq!(row.balance_sats, 0);
    }
}
