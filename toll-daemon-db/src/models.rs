use diesel::{Insertable, Queryable, Selectable};

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::account)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AccountRecord {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub created_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::agent)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AgentRecord {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub api_key_hash: String,
    pub api_key_prefix: Option<String>,
    pub status: String,
    pub created_at: i64,
}

impl AgentRecord {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::wallet)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WalletRecord {
    pub id: String,
    pub account_id: String,
    pub balance_sats: i64,
    pub held_sats: i64,
    pub lifetime_in_sats: i64,
    pub lifetime_out_sats: i64,
    pub balance_usd_cents: i64,
    pub held_usd_cents: i64,
    pub lifetime_in_usd_cents: i64,
    pub lifetime_out_usd_cents: i64,
    pub created_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::policy)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PolicyRecord {
    pub id: String,
    pub agent_id: String,
    pub max_per_call_sats: Option<i64>,
    pub max_per_day_sats: Option<i64>,
    /// JSON array of service slugs, NULL meaning no restriction
    pub allowed_services: Option<String>,
    pub denied_services: Option<String>,
    /// JSON array of capability verbs, NULL meaning no restriction
    pub allowed_capabilities: Option<String>,
    pub denied_capabilities: Option<String>,
    pub max_balance_sats: Option<i64>,
    pub kill_switch: bool,
    pub updated_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::service)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ServiceRecord {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub tier: String,
    pub status: String,
    pub base_url: String,
    pub auth_type: String,
    pub auth_credential_env: String,
    pub created_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::service_pricing)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PricingRecord {
    pub id: String,
    pub service_id: String,
    pub operation: String,
    pub cost_usd_micros: i64,
    pub price_usd_micros: i64,
    pub price_sats: i64,
    pub unit: String,
    pub updated_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::invoice)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct InvoiceRecord {
    pub id: String,
    pub wallet_id: String,
    pub amount_sats: i64,
    pub payment_request: String,
    /// Hex-encoded payment hash, unique across all invoices
    pub r_hash: String,
    pub status: String,
    pub expires_at: i64,
    pub settled_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::checkout_session)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CheckoutRecord {
    pub id: String,
    pub wallet_id: String,
    pub external_session_id: String,
    pub amount_usd_cents: i64,
    /// BTC/USD rate at session creation, kept for the sats-equivalent report
    pub btc_usd_rate: f64,
    pub amount_sats: i64,
    pub status: String,
    pub completed_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::transactions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TransactionRecord {
    pub id: String,
    pub wallet_id: String,
    pub agent_id: Option<String>,
    pub tx_type: String,
    /// Which balance_after column is authoritative: "sats" or "usd_cents"
    pub currency: String,
    pub amount_sats: i64,
    pub balance_after_sats: i64,
    pub amount_usd_cents: Option<i64>,
    pub balance_after_usd_cents: Option<i64>,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub description: String,
    pub created_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::audit_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AuditRecord {
    pub id: String,
    pub agent_id: String,
    pub service_slug: String,
    pub capability: Option<String>,
    pub operation: Option<String>,
    pub policy_result: String,
    pub policy_reason: Option<String>,
    pub quoted_sats: i64,
    pub charged_sats: Option<i64>,
    pub upstream_status: Option<i64>,
    pub upstream_latency_ms: Option<i64>,
    pub response_meta: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::rate_snapshot)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RateSnapshotRecord {
    pub id: String,
    pub btc_usd: f64,
    pub source: String,
    pub fetched_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::submission)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SubmissionRecord {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub base_url: String,
    pub auth_type: String,
    pub auth_credential_env: String,
    pub capability: Option<String>,
    pub default_operation: String,
    pub price_usd_micros: i64,
    pub unit: String,
    pub status: String,
    pub reviewed_at: Option<i64>,
    pub created_at: i64,
}
