use toll_api_core::{
    AgentInfo, Capability, PolicyBody, PolicyResponse, PricingInfo, ServiceInfo, SubmissionInfo,
    TransactionInfo, WalletResponse,
};
use toll_daemon_db::models::{
    AgentRecord, PolicyRecord, PricingRecord, ServiceRecord, SubmissionRecord, TransactionRecord,
    WalletRecord,
};

/// Policy list columns are stored as JSON arrays of strings, NULL meaning
/// no restriction
pub fn encode_list(list: Option<&Vec<String>>) -> Option<String> {
    list.map(|values| serde_json::to_string(values).expect("Failed to serialize string list"))
}

pub fn decode_list(column: Option<&str>) -> Option<Vec<String>> {
    column.and_then(|raw| serde_json::from_str(raw).ok())
}

pub fn policy_body(record: &PolicyRecord) -> PolicyBody {
    PolicyBody {
        max_per_call_sats: record.max_per_call_sats,
        max_per_day_sats: record.max_per_day_sats,
        allowed_services: decode_list(record.allowed_services.as_deref()),
        denied_services: decode_list(record.denied_services.as_deref()),
        allowed_capabilities: decode_list(record.allowed_capabilities.as_deref()),
        denied_capabilities: decode_list(record.denied_capabilities.as_deref()),
        max_balance_sats: record.max_balance_sats,
        kill_switch: record.kill_switch,
    }
}

pub fn policy_response(record: &PolicyRecord) -> PolicyResponse {
    PolicyResponse {
        id: record.id.clone(),
        agent_id: record.agent_id.clone(),
        policy: policy_body(record),
        updated_at: record.updated_at,
    }
}

pub fn agent_info(record: AgentRecord) -> AgentInfo {
    AgentInfo {
        id: record.id,
        name: record.name,
        status: record.status,
        created_at: record.created_at,
    }
}

pub fn wallet_response(record: WalletRecord) -> WalletResponse {
    WalletResponse {
        id: record.id,
        balance_sats: record.balance_sats,
        held_sats: record.held_sats,
        lifetime_in_sats: record.lifetime_in_sats,
        lifetime_out_sats: record.lifetime_out_sats,
        balance_usd_cents: record.balance_usd_cents,
        held_usd_cents: record.held_usd_cents,
        lifetime_in_usd_cents: record.lifetime_in_usd_cents,
        lifetime_out_usd_cents: record.lifetime_out_usd_cents,
    }
}

pub fn service_info(record: ServiceRecord) -> ServiceInfo {
    ServiceInfo {
        id: record.id,
        slug: record.slug,
        name: record.name,
        tier: record.tier,
        status: record.status,
        base_url: record.base_url,
        auth_type: record.auth_type,
    }
}

pub fn pricing_info(record: PricingRecord) -> PricingInfo {
    PricingInfo {
        operation: record.operation,
        price_usd_micros: record.price_usd_micros,
        price_sats: record.price_sats,
        unit: record.unit,
    }
}

pub fn transaction_info(record: TransactionRecord) -> TransactionInfo {
    TransactionInfo {
        id: record.id,
        tx_type: record.tx_type,
        currency: record.currency,
        amount_sats: record.amount_sats,
        balance_after_sats: record.balance_after_sats,
        amount_usd_cents: record.amount_usd_cents,
        balance_after_usd_cents: record.balance_after_usd_cents,
        description: record.description,
        created_at: record.created_at,
    }
}

pub fn submission_info(record: SubmissionRecord) -> SubmissionInfo {
    SubmissionInfo {
        id: record.id,
        slug: record.slug,
        name: record.name,
        status: record.status,
        capability: record.capability.as_deref().and_then(|v| v.parse::<Capability>().ok()),
        created_at: record.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_round_trip() {
        let list = Some(vec!["brave".to_string(), "openrouter".to_string()]);

        let encoded = encode_list(list.as_ref());

        assert_eq!(decode_list(encoded.as_deref()), list);

        assert_eq!(encode_list(None), None);

        assert_eq!(decode_list(None), None);
    }
}
