use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Abstract operations resolved to a concrete provider at request time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Reason,
    Search,
    Read,
    Scrape,
    Execute,
    Email,
    Sms,
    Imagine,
    Speak,
    Transcribe,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::Reason,
        Capability::Search,
        Capability::Read,
        Capability::Scrape,
        Capability::Execute,
        Capability::Email,
        Capability::Sms,
        Capability::Imagine,
        Capability::Speak,
        Capability::Transcribe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Reason => "reason",
            Capability::Search => "search",
            Capability::Read => "read",
            Capability::Scrape => "scrape",
            Capability::Execute => "execute",
            Capability::Email => "email",
            Capability::Sms => "sms",
            Capability::Imagine => "imagine",
            Capability::Speak => "speak",
            Capability::Transcribe => "transcribe",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown capability '{}'", s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable machine-readable error code
    pub code: String,
    /// Human-readable description of the failure
    pub message: String,
    /// Optional structured context, e.g. required and available balance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Error envelope returned by every failing route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupRequest {
    /// Display name for the account and its first agent
    pub name: String,
    /// Optional contact email
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupResponse {
    /// The new account id
    pub account_id: String,
    /// The account's primary agent id
    pub agent_id: String,
    /// The agent's API key, shown exactly once
    pub api_key: String,
}

/// Billing metadata attached to every successful capability or proxy call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Pre-flight cost estimate in satoshis, the upper bound on the charge
    pub quoted_sats: i64,
    /// Actual amount charged in satoshis
    pub charged_sats: i64,
    /// Wallet balance in satoshis after the charge
    pub balance_after: i64,
    /// Audit log id for this call
    pub audit_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
    /// Normalized upstream response payload
    pub data: Value,
    pub metadata: CallMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletResponse {
    pub id: String,
    pub balance_sats: i64,
    pub held_sats: i64,
    pub lifetime_in_sats: i64,
    pub lifetime_out_sats: i64,
    pub balance_usd_cents: i64,
    pub held_usd_cents: i64,
    pub lifetime_in_usd_cents: i64,
    pub lifetime_out_usd_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundRequest {
    /// Amount to fund in satoshis
    pub amount_sats: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundResponse {
    /// The invoice id
    pub invoice_id: String,
    /// BOLT11 payment request to pay
    pub payment_request: String,
    /// Unix time in milliseconds at which the invoice expires
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundCardRequest {
    /// Amount to fund in USD cents
    pub amount_usd_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundCardResponse {
    /// The checkout session id
    pub session_id: String,
    /// Hosted checkout URL to complete the card payment
    pub checkout_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: String,
    pub tx_type: String,
    /// Which balance this row is authoritative for: "sats" or "usd_cents"
    pub currency: String,
    pub amount_sats: i64,
    pub balance_after_sats: i64,
    pub amount_usd_cents: Option<i64>,
    pub balance_after_usd_cents: Option<i64>,
    pub description: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTransactionsResponse {
    pub transactions: Vec<TransactionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    /// One of "active", "suspended" or "killed"
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAgentsResponse {
    pub agents: Vec<AgentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAgentRequest {
    /// Display name for the new agent
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAgentResponse {
    pub agent: AgentInfo,
    /// The new agent's API key, shown exactly once
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAgentRequest {
    /// New display name
    pub name: Option<String>,
    /// New status, "active" or "suspended"
    pub status: Option<String>,
}

/// Spend and access policy for one agent. Null fields mean "no limit".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyBody {
    pub max_per_call_sats: Option<i64>,
    pub max_per_day_sats: Option<i64>,
    pub allowed_services: Option<Vec<String>>,
    pub denied_services: Option<Vec<String>>,
    pub allowed_capabilities: Option<Vec<String>>,
    pub denied_capabilities: Option<Vec<String>>,
    pub max_balance_sats: Option<i64>,
    #[serde(default)]
    pub kill_switch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyResponse {
    pub id: String,
    pub agent_id: String,
    #[serde(flatten)]
    pub policy: PolicyBody,
    pub updated_at: i64,
}

/// Partial policy update; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyPatch {
    #[serde(default, with = "double_option")]
    pub max_per_call_sats: Option<Option<i64>>,
    #[serde(default, with = "double_option")]
    pub max_per_day_sats: Option<Option<i64>>,
    #[serde(default, with = "double_option")]
    pub allowed_services: Option<Option<Vec<String>>>,
    #[serde(default, with = "double_option")]
    pub denied_services: Option<Option<Vec<String>>>,
    #[serde(default, with = "double_option")]
    pub allowed_capabilities: Option<Option<Vec<String>>>,
    #[serde(default, with = "double_option")]
    pub denied_capabilities: Option<Option<Vec<String>>>,
    #[serde(default, with = "double_option")]
    pub max_balance_sats: Option<Option<i64>>,
    pub kill_switch: Option<bool>,
}

/// Distinguishes "field absent" from "field set to null" in PATCH bodies
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub tier: String,
    pub status: String,
    pub base_url: String,
    pub auth_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListServicesResponse {
    pub services: Vec<ServiceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingInfo {
    /// Operation name this price applies to
    pub operation: String,
    pub price_usd_micros: i64,
    pub price_sats: i64,
    /// One of "per_request", "per_1k_tokens" or "per_minute"
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPricingResponse {
    pub service: String,
    pub pricing: Vec<PricingInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub capability: Capability,
    /// Provider slugs in resolution order, highest priority first
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListCapabilitiesResponse {
    pub capabilities: Vec<CapabilityInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitServiceRequest {
    /// Unique slug for the submitted service
    pub slug: String,
    pub name: String,
    pub base_url: String,
    /// One of "bearer", "api_key_header", "basic" or "query_param"
    pub auth_type: String,
    /// Environment variable the credential is read from; must match the
    /// gateway's allowlisted naming pattern
    pub auth_credential_env: String,
    /// Capability verb the service should serve, if any
    pub capability: Option<Capability>,
    /// Operation name used for pricing lookups
    pub default_operation: String,
    pub price_usd_micros: i64,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionInfo {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub status: String,
    pub capability: Option<Capability>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSubmissionsResponse {
    pub submissions: Vec<SubmissionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trips_through_str() {
        for capability in Capability::ALL {
            assert_eq!(capability.as_str().parse::<Capability>(), Ok(capability));
        }

        assert!("teleport".parse::<Capability>().is_err());
    }

    #[test]
    fn policy_patch_distinguishes_absent_from_null() {
        let patch: PolicyPatch =
            serde_json::from_str(r#"{"max_per_call_sats": null, "kill_switch": true}"#).unwrap();

        assert_eq!(patch.max_per_call_sats, Some(None));

        assert_eq!(patch.max_per_day_sats, None);

        assert_eq!(patch.kill_switch, Some(true));
    }
}
