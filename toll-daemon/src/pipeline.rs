//! The call-processing state machine. A call moves through
//! auth → resolve → quote → policy → hold → execute → finalize → commit →
//! audit; every failure past the hold releases it, and a call that reached
//! execute is committed even if the caller goes away.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{info, warn};

use toll_api_core::{CallMetadata, Capability};
use toll_core::db::Database;
use toll_core::{id, unix_time};
use toll_daemon_db::models::{AgentRecord, AuditRecord};

use crate::adapter::{Adapter, AdapterError, Quote};
use crate::error::CallError;
use crate::ledger::{self, LedgerError};
use crate::policy::{self, Decision};
use crate::{AppState, convert, db};

#[derive(Debug, Clone)]
pub enum CallTarget {
    Capability(Capability),
    Service(String),
}

#[derive(Debug)]
pub struct CallOutcome {
    pub data: Value,
    pub metadata: CallMetadata,
}

pub async fn process_call(
    state: &AppState,
    agent: &AgentRecord,
    target: CallTarget,
    body: Value,
) -> Result<CallOutcome, CallError> {
    let (service_slug, capability, adapter) = resolve(state, &target)?;

    let quote = adapter.quote(&body).await.map_err(adapter_error)?;

    if quote.quoted_sats < 0 {
        return Err(CallError::Internal(format!(
            "Adapter quoted a negative amount for {service_slug}"
        )));
    }

    let policy_record = db::policy_for_agent(&state.db, &agent.id)
        .await
        .map_err(CallError::internal)?
        .ok_or_else(|| CallError::Internal(format!("Agent {} has no policy", agent.id)))?;

    let policy_body = convert::policy_body(&policy_record);

    let today_spend = match policy_body.max_per_day_sats {
        Some(cap) => state
            .spend
            .today_spend(&state.db, &agent.id, quote.quoted_sats, cap)
            .await
            .map_err(CallError::internal)?,
        None => 0,
    };

    let mut audit = AuditRecord {
        id: id::new_id(id::AUDIT),
        agent_id: agent.id.clone(),
        service_slug: service_slug.clone(),
        capability: capability.map(|verb| verb.as_str().to_string()),
        operation: Some(quote.operation.clone()),
        policy_result: "allowed".to_string(),
        policy_reason: None,
        quoted_sats: quote.quoted_sats,
        charged_sats: None,
        upstream_status: None,
        upstream_latency_ms: None,
        response_meta: None,
        error: None,
        created_at: unix_time(),
    };

    let decision = policy::evaluate(
        agent,
        &policy_body,
        &service_slug,
        capability,
        quote.quoted_sats,
        today_spend,
    );

    if let Decision::Denied(reason) = decision {
        audit.policy_result = "denied".to_string();

        audit.policy_reason = Some(reason.to_string());

        db::append_audit(&state.db, audit).await.map_err(CallError::internal)?;

        info!(agent_id = ?agent.id, ?service_slug, ?reason, "call denied by policy");

        return Err(CallError::PolicyDenied { reason });
    }

    let wallet = db::wallet_by_account(&state.db, &agent.account_id)
        .await
        .map_err(CallError::internal)?
        .ok_or_else(|| CallError::Internal(format!("Account {} has no wallet", agent.account_id)))?;

    if let Err(error) = ledger::hold(&state.db, &wallet.id, quote.quoted_sats).await {
        return match error {
            LedgerError::Insufficient {
                required,
                available,
            } => {
                audit.charged_sats = Some(0);

                audit.error = Some("INSUFFICIENT_BALANCE".to_string());

                db::append_audit(&state.db, audit).await.map_err(CallError::internal)?;

                Err(CallError::InsufficientBalance {
                    required,
                    available,
                })
            }
            other => Err(CallError::internal(other)),
        };
    }

    let mut hold_guard = HoldGuard {
        db: state.db.clone(),
        wallet_id: wallet.id.clone(),
        sats: quote.quoted_sats,
        armed: true,
    };

    let started = Instant::now();

    let executed = tokio::time::timeout(state.execute_deadline(), adapter.execute(&body)).await;

    let latency_ms = started.elapsed().as_millis() as i64;

    audit.upstream_latency_ms = Some(latency_ms);

    let response = match executed {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => {
            hold_guard.armed = false;

            audit.charged_sats = Some(0);

            audit.error = Some(error.to_string());

            fail_held_call(&state.db, &wallet.id, quote.quoted_sats, audit).await;

            return Err(adapter_error(error));
        }
        Err(_) => {
            hold_guard.armed = false;

            audit.charged_sats = Some(0);

            audit.error = Some("execute deadline exceeded".to_string());

            fail_held_call(&state.db, &wallet.id, quote.quoted_sats, audit).await;

            return Err(CallError::Upstream(
                "Upstream call exceeded its deadline".to_string(),
            ));
        }
    };

    let final_sats = adapter.finalize(&response, quote.quoted_sats).clamp(0, quote.quoted_sats);

    // The upstream has been billed, so the commit must not die with a
    // cancelled request handler; it runs on its own task
    hold_guard.armed = false;

    let commit_state = state.clone();

    let commit_agent_id = agent.id.clone();

    let commit_wallet_id = wallet.id.clone();

    tokio::spawn(async move {
        commit_call(
            commit_state,
            commit_agent_id,
            commit_wallet_id,
            quote,
            audit,
            response.status,
            response.data,
            final_sats,
        )
        .await
    })
    .await
    .map_err(CallError::internal)?
}

#[allow(clippy::too_many_arguments)]
async fn commit_call(
    state: AppState,
    agent_id: String,
    wallet_id: String,
    quote: Quote,
    mut audit: AuditRecord,
    upstream_status: u16,
    data: Value,
    final_sats: i64,
) -> Result<CallOutcome, CallError> {
    let description = format!("{} {}", audit.service_slug, quote.operation);

    let debited = ledger::debit(
        &state.db,
        &wallet_id,
        &agent_id,
        quote.quoted_sats,
        final_sats,
        "proxy_call",
        &audit.id,
        &description,
    )
    .await;

    let (_, wallet) = match debited {
        Ok(row) => row,
        Err(error) => {
            warn!(?error, ?wallet_id, "ledger commit failed, releasing hold");

            if let Err(release_error) =
                ledger::release_hold(&state.db, &wallet_id, quote.quoted_sats).await
            {
                warn!(?release_error, ?wallet_id, "failed to release hold");
            }

            return Err(CallError::internal(error));
        }
    };

    state.spend.invalidate(&agent_id);

    state
        .events
        .publish_balance(wallet.id.clone(), wallet.balance_sats, wallet.balance_usd_cents);

    let audit_id = audit.id.clone();

    audit.charged_sats = Some(final_sats);

    audit.upstream_status = Some(upstream_status as i64);

    audit.response_meta = Some(json!({ "operation": quote.operation }).to_string());

    db::append_audit(&state.db, audit).await.map_err(CallError::internal)?;

    info!(
        ?audit_id,
        quoted_sats = ?quote.quoted_sats,
        charged_sats = ?final_sats,
        "call committed"
    );

    Ok(CallOutcome {
        data,
        metadata: CallMetadata {
            quoted_sats: quote.quoted_sats,
            charged_sats: final_sats,
            balance_after: wallet.balance_sats,
            audit_id,
        },
    })
}

fn resolve(
    state: &AppState,
    target: &CallTarget,
) -> Result<(String, Option<Capability>, Arc<dyn Adapter>), CallError> {
    match target {
        CallTarget::Capability(capability) => state
            .registry
            .resolve(*capability)
            .map(|(slug, adapter)| (slug, Some(*capability), adapter))
            .ok_or_else(|| {
                CallError::NotFound(format!("No active provider for capability '{capability}'"))
            }),
        CallTarget::Service(slug) => state
            .registry
            .adapter(slug)
            .map(|adapter| (slug.clone(), None, adapter))
            .ok_or_else(|| CallError::NotFound(format!("Unknown service '{slug}'"))),
    }
}

fn adapter_error(error: AdapterError) -> CallError {
    match error {
        AdapterError::Validation(message) => CallError::Validation(message),
        AdapterError::Upstream(message) => CallError::Upstream(message),
    }
}

/// Best-effort compensation after a failed execute: the hold goes back to
/// the balance and the failure is audited with a zero charge
async fn fail_held_call(db: &Database, wallet_id: &str, sats: i64, audit: AuditRecord) {
    if let Err(error) = ledger::release_hold(db, wallet_id, sats).await {
        warn!(?error, ?wallet_id, "failed to release hold");
    }

    if let Err(error) = db::append_audit(db, audit).await {
        warn!(?error, "failed to append audit record");
    }
}

/// Releases the hold if the request future is dropped between HELD and
/// COMMITTED; disarmed on every deliberate exit path
struct HoldGuard {
    db: Database,
    wallet_id: String,
    sats: i64,
    armed: bool,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let db = self.db.clone();

        let wallet_id = self.wallet_id.clone();

        let sats = self.sats;

        tokio::spawn(async move {
            warn!(?wallet_id, ?sats, "call cancelled while held, releasing");

            if let Err(error) = ledger::release_hold(&db, &wallet_id, sats).await {
                warn!(?error, ?wallet_id, "failed to release hold after cancellation");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use diesel::prelude::*;

    use toll_daemon_db::schema::{audit_log, transactions};

    use crate::adapter::{AdapterError, UpstreamResponse};
    use crate::db::test_database;
    use crate::registry::ProviderEntry;
    use crate::test_state;

    /// Adapter with scripted quote and finalize amounts
    struct StubAdapter {
        quoted_sats: i64,
        final_sats: i64,
        fail_execute: bool,
    }

    #[async_trait]
    impl Adapter for StubAdapter {
        async fn quote(&self, _body: &Value) -> Result<Quote, AdapterError> {
            Ok(Quote {
                operation: "stub".to_string(),
                quoted_sats: self.quoted_sats,
            })
        }

        async fn execute(&self, _body: &Value) -> Result<UpstreamResponse, AdapterError> {
            if self.fail_execute {
                return Err(AdapterError::Upstream("boom".to_string()));
            }

            Ok(UpstreamResponse {
                status: 200,
                data: json!({"answer": 42}),
            })
        }

        fn finalize(&self, _response: &UpstreamResponse, quoted_sats: i64) -> i64 {
            self.final_sats.min(quoted_sats)
        }
    }

    async fn state_with_stub(quoted: i64, finalized: i64, fail: bool) -> (tempfile::TempDir, AppState) {
        let (dir, db) = test_database();

        let state = test_state(db);

        state.registry.register_adapter(
            "stub",
            Arc::new(StubAdapter {
                quoted_sats: quoted,
                final_sats: finalized,
                fail_execute: fail,
            }),
        );

        state.registry.register_provider(
            Capability::Reason,
            ProviderEntry {
                slug: "stub".to_string(),
                priority: 100,
                active: true,
            },
        );

        (dir, state)
    }

    async fn transaction_count(state: &AppState) -> i64 {
        let mut conn = state.db.get_connection().await;

        transactions::table.count().get_result(&mut conn).unwrap()
    }

    async fn audit_rows(state: &AppState, agent_id: &str) -> Vec<toll_daemon_db::models::AuditRecord> {
        let mut conn = state.db.get_connection().await;

        audit_log::table
            .filter(audit_log::agent_id.eq(agent_id))
            .load(&mut conn)
            .unwrap()
    }

    #[tokio::test]
    async fn empty_wallet_rejects_paid_call() {
        let (_dir, state) = state_with_stub(500, 300, false).await;

        let (_, wallet, agent, _) =
            db::create_account(&state.db, "a".to_string(), None).await.unwrap();

        let error = process_call(
            &state,
            &agent,
            CallTarget::Capability(Capability::Reason),
            json!({"prompt": "hi"}),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            error,
            CallError::InsufficientBalance {
                required: 500,
                available: 0,
            }
        ));

        // Post-quote, pre-hold failure: audited as allowed with a zero
        // charge, wallet untouched, no ledger rows
        let audits = audit_rows(&state, &agent.id).await;

        assert_eq!(audits.len(), 1);

        assert_eq!(audits[0].policy_result, "allowed");

        assert_eq!(audits[0].charged_sats, Some(0));

        assert_eq!(audits[0].error.as_deref(), Some("INSUFFICIENT_BALANCE"));

        assert_eq!(transaction_count(&state).await, 0);

        let row = db::wallet_by_id(&state.db, &wallet.id).await.unwrap().unwrap();

        assert_eq!(row.balance_sats, 0);

        assert_eq!(row.held_sats, 0);
    }

    #[tokio::test]
    async fn successful_call_charges_final_and_returns_difference() {
        let (_dir, state) = state_with_stub(500, 300, false).await;

        let (_, wallet, agent, _) =
            db::create_account(&state.db, "a".to_string(), None).await.unwrap();

        ledger::credit_from_invoice(&state.db, &wallet.id, 10_000, "inv_t").await.unwrap();

        let outcome = process_call(
            &state,
            &agent,
            CallTarget::Capability(Capability::Reason),
            json!({"prompt": "hi"}),
        )
        .await
        .unwrap();

        assert_eq!(outcome.metadata.quoted_sats, 500);

        assert_eq!(outcome.metadata.charged_sats, 300);

        assert_eq!(outcome.metadata.balance_after, 9_700);

        assert_eq!(outcome.data, json!({"answer": 42}));

        let row = db::wallet_by_id(&state.db, &wallet.id).await.unwrap().unwrap();

        assert_eq!(row.balance_sats, 9_700);

        assert_eq!(row.held_sats, 0);

        assert_eq!(row.lifetime_out_sats, 300);

        // Exactly one debit transaction referencing the audit row
        let record = ledger::transaction_by_reference(&state.db, "proxy_call", &outcome.metadata.audit_id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.amount_sats, 300);

        assert_eq!(record.balance_after_sats, 9_700);

        assert_eq!(transaction_count(&state).await, 2);

        let audits = audit_rows(&state, &agent.id).await;

        assert_eq!(audits.len(), 1);

        assert_eq!(audits[0].policy_result, "allowed");

        assert_eq!(audits[0].charged_sats, Some(300));

        assert_eq!(audits[0].upstream_status, Some(200));
    }

    #[tokio::test]
    async fn kill_switch_denies_without_ledger_change() {
        let (_dir, state) = state_with_stub(100, 100, false).await;

        let (_, wallet, agent, _) =
            db::create_account(&state.db, "a".to_string(), None).await.unwrap();

        ledger::credit_from_invoice(&state.db, &wallet.id, 5_000, "inv_t").await.unwrap();

        db::set_kill_switch(&state.db, &agent.id, true).await.unwrap();

        let error = process_call(
            &state,
            &agent,
            CallTarget::Capability(Capability::Reason),
            json!({"query": "x"}),
        )
        .await
        .unwrap_err();

        match error {
            CallError::PolicyDenied { reason } => assert_eq!(reason, "kill_switch_active"),
            other => panic!("unexpected error: {other}"),
        }

        let audits = audit_rows(&state, &agent.id).await;

        assert_eq!(audits.len(), 1);

        assert_eq!(audits[0].policy_result, "denied");

        assert_eq!(audits[0].policy_reason.as_deref(), Some("kill_switch_active"));

        // The funding credit is the only transaction
        assert_eq!(transaction_count(&state).await, 1);

        let row = db::wallet_by_id(&state.db, &wallet.id).await.unwrap().unwrap();

        assert_eq!(row.balance_sats, 5_000);
    }

    #[tokio::test]
    async fn upstream_failure_releases_hold_and_charges_nothing() {
        let (_dir, state) = state_with_stub(500, 500, true).await;

        let (_, wallet, agent, _) =
            db::create_account(&state.db, "a".to_string(), None).await.unwrap();

        ledger::credit_from_invoice(&state.db, &wallet.id, 5_000, "inv_t").await.unwrap();

        let error = process_call(
            &state,
            &agent,
            CallTarget::Capability(Capability::Reason),
            json!({"prompt": "hi"}),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, CallError::Upstream(..)));

        let row = db::wallet_by_id(&state.db, &wallet.id).await.unwrap().unwrap();

        assert_eq!(row.balance_sats, 5_000);

        assert_eq!(row.held_sats, 0);

        assert_eq!(transaction_count(&state).await, 1);

        let audits = audit_rows(&state, &agent.id).await;

        assert_eq!(audits.len(), 1);

        assert_eq!(audits[0].charged_sats, Some(0));

        assert!(audits[0].error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn unknown_capability_provider_is_not_found() {
        let (_dir, state) = state_with_stub(100, 100, false).await;

        let (_, _, agent, _) = db::create_account(&state.db, "a".to_string(), None).await.unwrap();

        let error = process_call(
            &state,
            &agent,
            CallTarget::Capability(Capability::Sms),
            json!({}),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, CallError::NotFound(..)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_cannot_overdraw_a_wallet() {
        let (_dir, state) = state_with_stub(500, 500, false).await;

        let (_, wallet, agent, _) =
            db::create_account(&state.db, "a".to_string(), None).await.unwrap();

        ledger::credit_from_invoice(&state.db, &wallet.id, 600, "inv_t").await.unwrap();

        let first = tokio::spawn({
            let state = state.clone();

            let agent = agent.clone();

            async move {
                process_call(
                    &state,
                    &agent,
                    CallTarget::Capability(Capability::Reason),
                    json!({}),
                )
                .await
            }
        });

        let second = tokio::spawn({
            let state = state.clone();

            let agent = agent.clone();

            async move {
                process_call(
                    &state,
                    &agent,
                    CallTarget::Capability(Capability::Reason),
                    json!({}),
                )
                .await
            }
        });

        let outcomes = [first.await.unwrap(), second.await.unwrap()];

        let successes = outcomes.iter().filter(|outcome| outcome.is_ok()).count();

        assert_eq!(successes, 1);

        assert!(outcomes.iter().any(|outcome| matches!(
            outcome,
            Err(CallError::InsufficientBalance { .. })
        )));

        let row = db::wallet_by_id(&state.db, &wallet.id).await.unwrap().unwrap();

        assert_eq!(row.balance_sats, 100);

        assert_eq!(row.held_sats, 0);
    }
}
