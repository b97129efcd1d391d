use anyhow::{Context, Result};
use diesel::prelude::*;
use tracing::info;

use toll_api_core::{PolicyBody, PolicyPatch};
use toll_core::db::Database;
use toll_core::{apikey, id, unix_time};
use toll_daemon_db::models::{
    AccountRecord, AgentRecord, AuditRecord, CheckoutRecord, InvoiceRecord, PolicyRecord,
    PricingRecord, RateSnapshotRecord, ServiceRecord, SubmissionRecord, TransactionRecord,
    WalletRecord,
};
use toll_daemon_db::schema::{
    account, agent, audit_log, checkout_session, invoice, policy, rate_snapshot, service,
    service_pricing, submission, transactions, wallet,
};

use crate::convert;

fn new_agent_parts(account_id: &str, name: &str) -> Result<(AgentRecord, String)> {
    let raw_key = apikey::generate();

    let record = AgentRecord {
        id: id::new_id(id::AGENT),
        account_id: account_id.to_string(),
        name: name.to_string(),
        api_key_hash: apikey::hash(&raw_key)?,
        api_key_prefix: Some(apikey::lookup_prefix(&raw_key)),
        status: "active".to_string(),
        created_at: unix_time(),
    };

    Ok((record, raw_key))
}

fn default_policy(agent_id: &str) -> PolicyRecord {
    PolicyRecord {
        id: id::new_id(id::POLICY),
        agent_id: agent_id.to_string(),
        max_per_call_sats: None,
        max_per_day_sats: None,
        allowed_services: None,
        denied_services: None,
        allowed_capabilities: None,
        denied_capabilities: None,
        max_balance_sats: None,
        kill_switch: false,
        updated_at: unix_time(),
    }
}

/// Creates an account together with its wallet, primary agent and open
/// policy. Returns the raw API key, which is never stored.
pub async fn create_account(
    db: &Database,
    name: String,
    email: Option<String>,
) -> Result<(AccountRecord, WalletRecord, AgentRecord, String)> {
    let account_record = AccountRecord {
        id: id::new_id(id::ACCOUNT),
        name: name.clone(),
        email,
        created_at: unix_time(),
    };

    let wallet_record = WalletRecord {
        id: id::new_id(id::WALLET),
        account_id: account_record.id.clone(),
        balance_sats: 0,
        held_sats: 0,
        lifetime_in_sats: 0,
        lifetime_out_sats: 0,
        balance_usd_cents: 0,
        held_usd_cents: 0,
        lifetime_in_usd_cents: 0,
        lifetime_out_usd_cents: 0,
        created_at: unix_time(),
    };

    let account_id = account_record.id.clone();

    let (agent_record, raw_key) =
        tokio::task::spawn_blocking(move || new_agent_parts(&account_id, &name))
            .await
            .context("Failed to join key generation task")??;

    let policy_record = default_policy(&agent_record.id);

    let mut conn = db.get_connection().await;

    let inserted = conn.immediate_transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::insert_into(account::table)
            .values(&account_record)
            .execute(conn)?;

        diesel::insert_into(wallet::table)
            .values(&wallet_record)
            .execute(conn)?;

        diesel::insert_into(agent::table)
            .values(&agent_record)
            .execute(conn)?;

        diesel::insert_into(policy::table)
            .values(&policy_record)
            .execute(conn)?;

        Ok((account_record, wallet_record, agent_record))
    })?;

    info!(account_id = ?inserted.0.id, "created account");

    Ok((inserted.0, inserted.1, inserted.2, raw_key))
}

/// Creates an additional agent under an existing account
pub async fn create_agent(
    db: &Database,
    account_id: &str,
    name: &str,
) -> Result<(AgentRecord, String)> {
    let account_id = account_id.to_string();

    let name = name.to_string();

    let (agent_record, raw_key) =
        tokio::task::spawn_blocking(move || new_agent_parts(&account_id, &name))
            .await
            .context("Failed to join key generation task")??;

    let policy_record = default_policy(&agent_record.id);

    let mut conn = db.get_connection().await;

    conn.immediate_transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::insert_into(agent::table)
            .values(&agent_record)
            .execute(conn)?;

        diesel::insert_into(policy::table)
            .values(&policy_record)
            .execute(conn)?;

        Ok(())
    })?;

    info!(agent_id = ?agent_record.id, "created agent");

    Ok((agent_record, raw_key))
}

pub async fn agents_by_key_prefix(db: &Database, prefix: &str) -> Result<Vec<AgentRecord>> {
    let mut conn = db.get_connection().await;

    agent::table
        .filter(agent::api_key_prefix.eq(prefix))
        .load::<AgentRecord>(&mut conn)
        .context("Failed to query agents by key prefix")
}

/// Rows from before the prefix column existed; scanned as an auth fallback
pub async fn agents_without_key_prefix(db: &Database) -> Result<Vec<AgentRecord>> {
    let mut conn = db.get_connection().await;

    agent::table
        .filter(agent::api_key_prefix.is_null())
        .load::<AgentRecord>(&mut conn)
        .context("Failed to query legacy agents")
}

pub async fn list_agents(db: &Database, account_id: &str) -> Result<Vec<AgentRecord>> {
    let mut conn = db.get_connection().await;

    agent::table
        .filter(agent::account_id.eq(account_id))
        .order(agent::created_at.asc())
        .load::<AgentRecord>(&mut conn)
        .context("Failed to list agents")
}

pub async fn agent_by_id(
    db: &Database,
    account_id: &str,
    agent_id: &str,
) -> Result<Option<AgentRecord>> {
    let mut conn = db.get_connection().await;

    agent::table
        .filter(agent::id.eq(agent_id))
        .filter(agent::account_id.eq(account_id))
        .first::<AgentRecord>(&mut conn)
        .optional()
        .context("Failed to query agent")
}

pub async fn update_agent(
    db: &Database,
    account_id: &str,
    agent_id: &str,
    name: Option<String>,
    status: Option<String>,
) -> Result<Option<AgentRecord>> {
    let mut conn = db.get_connection().await;

    if let Some(name) = name {
        diesel::update(
            agent::table
                .filter(agent::id.eq(agent_id))
                .filter(agent::account_id.eq(account_id)),
        )
        .set(agent::name.eq(name))
        .execute(&mut conn)?;
    }

    if let Some(status) = status {
        diesel::update(
            agent::table
                .filter(agent::id.eq(agent_id))
                .filter(agent::account_id.eq(account_id)),
        )
        .set(agent::status.eq(status))
        .execute(&mut conn)?;
    }

    agent::table
        .filter(agent::id.eq(agent_id))
        .filter(agent::account_id.eq(account_id))
        .first::<AgentRecord>(&mut conn)
        .optional()
        .context("Failed to fetch updated agent")
}

pub async fn wallet_by_account(db: &Database, account_id: &str) -> Result<Option<WalletRecord>> {
    let mut conn = db.get_connection().await;

    wallet::table
        .filter(wallet::account_id.eq(account_id))
        .first::<WalletRecord>(&mut conn)
        .optional()
        .context("Failed to query wallet")
}

pub async fn wallet_by_id(db: &Database, wallet_id: &str) -> Result<Option<WalletRecord>> {
    let mut conn = db.get_connection().await;

    wallet::table
        .find(wallet_id)
        .first::<WalletRecord>(&mut conn)
        .optional()
        .context("Failed to query wallet")
}

pub async fn policy_for_agent(db: &Database, agent_id: &str) -> Result<Option<PolicyRecord>> {
    let mut conn = db.get_connection().await;

    policy::table
        .filter(policy::agent_id.eq(agent_id))
        .first::<PolicyRecord>(&mut conn)
        .optional()
        .context("Failed to query policy")
}

pub async fn replace_policy(
    db: &Database,
    agent_id: &str,
    body: PolicyBody,
) -> Result<Option<PolicyRecord>> {
    let mut conn = db.get_connection().await;

    diesel::update(policy::table.filter(policy::agent_id.eq(agent_id)))
        .set((
            policy::max_per_call_sats.eq(body.max_per_call_sats),
            policy::max_per_day_sats.eq(body.max_per_day_sats),
            policy::allowed_services.eq(convert::encode_list(body.allowed_services.as_ref())),
            policy::denied_services.eq(convert::encode_list(body.denied_services.as_ref())),
            policy::allowed_capabilities
                .eq(convert::encode_list(body.allowed_capabilities.as_ref())),
            policy::denied_capabilities.eq(convert::encode_list(body.denied_capabilities.as_ref())),
            policy::max_balance_sats.eq(body.max_balance_sats),
            policy::kill_switch.eq(body.kill_switch),
            policy::updated_at.eq(unix_time()),
        ))
        .execute(&mut conn)?;

    policy::table
        .filter(policy::agent_id.eq(agent_id))
        .first::<PolicyRecord>(&mut conn)
        .optional()
        .context("Failed to fetch updated policy")
}

pub async fn patch_policy(
    db: &Database,
    agent_id: &str,
    patch: PolicyPatch,
) -> Result<Option<PolicyRecord>> {
    let Some(existing) = policy_for_agent(db, agent_id).await? else {
        return Ok(None);
    };

    let mut body = convert::policy_body(&existing);

    if let Some(value) = patch.max_per_call_sats {
        body.max_per_call_sats = value;
    }

    if let Some(value) = patch.max_per_day_sats {
        body.max_per_day_sats = value;
    }

    if let Some(value) = patch.allowed_services {
        body.allowed_services = value;
    }

    if let Some(value) = patch.denied_services {
        body.denied_services = value;
    }

    if let Some(value) = patch.allowed_capabilities {
        body.allowed_capabilities = value;
    }

    if let Some(value) = patch.denied_capabilities {
        body.denied_capabilities = value;
    }

    if let Some(value) = patch.max_balance_sats {
        body.max_balance_sats = value;
    }

    if let Some(value) = patch.kill_switch {
        body.kill_switch = value;
    }

    replace_policy(db, agent_id, body).await
}

pub async fn set_kill_switch(
    db: &Database,
    agent_id: &str,
    engaged: bool,
) -> Result<Option<PolicyRecord>> {
    info!(?agent_id, ?engaged, "setting kill switch");

    let mut conn = db.get_connection().await;

    diesel::update(policy::table.filter(policy::agent_id.eq(agent_id)))
        .set((
            policy::kill_switch.eq(engaged),
            policy::updated_at.eq(unix_time()),
        ))
        .execute(&mut conn)?;

    policy::table
        .filter(policy::agent_id.eq(agent_id))
        .first::<PolicyRecord>(&mut conn)
        .optional()
        .context("Failed to fetch updated policy")
}

pub async fn list_services(db: &Database) -> Result<Vec<ServiceRecord>> {
    let mut conn = db.get_connection().await;

    service::table
        .order(service::slug.asc())
        .load::<ServiceRecord>(&mut conn)
        .context("Failed to list services")
}

pub async fn service_by_slug(db: &Database, slug: &str) -> Result<Option<ServiceRecord>> {
    let mut conn = db.get_connection().await;

    service::table
        .filter(service::slug.eq(slug))
        .first::<ServiceRecord>(&mut conn)
        .optional()
        .context("Failed to query service")
}

pub async fn create_service(
    db: &Database,
    service_record: ServiceRecord,
    pricing_records: Vec<PricingRecord>,
) -> Result<()> {
    let mut conn = db.get_connection().await;

    conn.immediate_transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::insert_into(service::table)
            .values(&service_record)
            .execute(conn)?;

        for pricing_record in &pricing_records {
            diesel::insert_into(service_pricing::table)
                .values(pricing_record)
                .execute(conn)?;
        }

        Ok(())
    })?;

    info!(slug = ?service_record.slug, "created service");

    Ok(())
}

pub async fn pricing_for_service(db: &Database, service_id: &str) -> Result<Vec<PricingRecord>> {
    let mut conn = db.get_connection().await;

    service_pricing::table
        .filter(service_pricing::service_id.eq(service_id))
        .order(service_pricing::operation.asc())
        .load::<PricingRecord>(&mut conn)
        .context("Failed to list pricing")
}

pub async fn create_invoice(db: &Database, record: InvoiceRecord) -> Result<InvoiceRecord> {
    let mut conn = db.get_connection().await;

    diesel::insert_into(invoice::table)
        .values(&record)
        .execute(&mut conn)
        .context("Failed to create invoice")?;

    Ok(record)
}

/// Atomically claims a pending invoice by payment hash. Returns None when
/// the invoice is unknown, expired, or was already claimed by a sibling.
pub async fn claim_settled_invoice(db: &Database, r_hash: &str) -> Result<Option<InvoiceRecord>> {
    let mut conn = db.get_connection().await;

    let claimed = conn.immediate_transaction::<_, diesel::result::Error, _>(|conn| {
        let updated = diesel::update(
            invoice::table
                .filter(invoice::r_hash.eq(r_hash))
                .filter(invoice::status.eq("pending")),
        )
        .set((
            invoice::status.eq("settled"),
            invoice::settled_at.eq(Some(unix_time())),
        ))
        .execute(conn)?;

        if updated == 0 {
            return Ok(None);
        }

        invoice::table
            .filter(invoice::r_hash.eq(r_hash))
            .first::<InvoiceRecord>(conn)
            .optional()
    })?;

    Ok(claimed)
}

/// Flips pending invoices past their expiry to expired; returns the count
pub async fn expire_invoices(db: &Database, now: i64) -> Result<usize> {
    let mut conn = db.get_connection().await;

    diesel::update(
        invoice::table
            .filter(invoice::status.eq("pending"))
            .filter(invoice::expires_at.lt(now)),
    )
    .set(invoice::status.eq("expired"))
    .execute(&mut conn)
    .context("Failed to expire invoices")
}

pub async fn create_checkout(db: &Database, record: CheckoutRecord) -> Result<CheckoutRecord> {
    let mut conn = db.get_connection().await;

    diesel::insert_into(checkout_session::table)
        .values(&record)
        .execute(&mut conn)
        .context("Failed to create checkout session")?;

    Ok(record)
}

/// Atomically claims a pending checkout session by its external id
pub async fn claim_completed_checkout(
    db: &Database,
    external_session_id: &str,
) -> Result<Option<CheckoutRecord>> {
    let mut conn = db.get_connection().await;

    let claimed = conn.immediate_transaction::<_, diesel::result::Error, _>(|conn| {
        let updated = diesel::update(
            checkout_session::table
                .filter(checkout_session::external_session_id.eq(external_session_id))
                .filter(checkout_session::status.eq("pending")),
        )
        .set((
            checkout_session::status.eq("completed"),
            checkout_session::completed_at.eq(Some(unix_time())),
        ))
        .execute(conn)?;

        if updated == 0 {
            return Ok(None);
        }

        checkout_session::table
            .filter(checkout_session::external_session_id.eq(external_session_id))
            .first::<CheckoutRecord>(conn)
            .optional()
    })?;

    Ok(claimed)
}

pub async fn append_audit(db: &Database, record: AuditRecord) -> Result<AuditRecord> {
    let mut conn = db.get_connection().await;

    diesel::insert_into(audit_log::table)
        .values(&record)
        .execute(&mut conn)
        .context("Failed to append audit log")?;

    Ok(record)
}

pub async fn list_transactions(
    db: &Database,
    wallet_id: &str,
    limit: i64,
) -> Result<Vec<TransactionRecord>> {
    let mut conn = db.get_connection().await;

    transactions::table
        .filter(transactions::wallet_id.eq(wallet_id))
        .order(transactions::created_at.desc())
        .limit(limit)
        .load::<TransactionRecord>(&mut conn)
        .context("Failed to list transactions")
}

/// Sum of an agent's debit transactions at or after the given timestamp
pub async fn agent_debit_total_since(db: &Database, agent_id: &str, since: i64) -> Result<i64> {
    let mut conn = db.get_connection().await;

    let amounts = transactions::table
        .filter(transactions::agent_id.eq(agent_id))
        .filter(transactions::tx_type.eq("debit"))
        .filter(transactions::created_at.ge(since))
        .select(transactions::amount_sats)
        .load::<i64>(&mut conn)
        .context("Failed to sum agent debits")?;

    Ok(amounts.into_iter().sum())
}

pub async fn append_rate_snapshot(db: &Database, btc_usd: f64, source: &str) -> Result<()> {
    let mut conn = db.get_connection().await;

    let record = RateSnapshotRecord {
        id: id::new_id(id::RATE_SNAPSHOT),
        btc_usd,
        source: source.to_string(),
        fetched_at: unix_time(),
    };

    diesel::insert_into(rate_snapshot::table)
        .values(&record)
        .execute(&mut conn)
        .context("Failed to append rate snapshot")?;

    Ok(())
}

pub async fn latest_rate_snapshot(db: &Database) -> Result<Option<RateSnapshotRecord>> {
    let mut conn = db.get_connection().await;

    rate_snapshot::table
        .order(rate_snapshot::fetched_at.desc())
        .first::<RateSnapshotRecord>(&mut conn)
        .optional()
        .context("Failed to query rate snapshot")
}

pub async fn create_submission(db: &Database, record: SubmissionRecord) -> Result<SubmissionRecord> {
    let mut conn = db.get_connection().await;

    diesel::insert_into(submission::table)
        .values(&record)
        .execute(&mut conn)
        .context("Failed to create submission")?;

    info!(slug = ?record.slug, "new service submission");

    Ok(record)
}

pub async fn list_submissions(db: &Database) -> Result<Vec<SubmissionRecord>> {
    let mut conn = db.get_connection().await;

    submission::table
        .order(submission::created_at.asc())
        .load::<SubmissionRecord>(&mut conn)
        .context("Failed to list submissions")
}

pub async fn submissions_by_status(db: &Database, status: &str) -> Result<Vec<SubmissionRecord>> {
    let mut conn = db.get_connection().await;

    submission::table
        .filter(submission::status.eq(status))
        .order(submission::created_at.asc())
        .load::<SubmissionRecord>(&mut conn)
        .context("Failed to list submissions")
}

pub async fn submission_by_id(
    db: &Database,
    submission_id: &str,
) -> Result<Option<SubmissionRecord>> {
    let mut conn = db.get_connection().await;

    submission::table
        .find(submission_id)
        .first::<SubmissionRecord>(&mut conn)
        .optional()
        .context("Failed to query submission")
}

pub async fn set_submission_status(
    db: &Database,
    submission_id: &str,
    status: &str,
) -> Result<()> {
    let mut conn = db.get_connection().await;

    diesel::update(submission::table.find(submission_id))
        .set((
            submission::status.eq(status),
            submission::reviewed_at.eq(Some(unix_time())),
        ))
        .execute(&mut conn)
        .context("Failed to update submission")?;

    Ok(())
}

#[cfg(test)]
pub fn test_database() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");

    let db = Database::new(dir.path(), toll_daemon_db::MIGRATIONS, 4)
        .expect("Failed to create test database");

    (dir, db)
}
