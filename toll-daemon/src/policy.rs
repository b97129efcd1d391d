use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use toll_api_core::{Capability, PolicyBody};
use toll_core::db::Database;
use toll_core::{unix_time, utc_midnight};
use toll_daemon_db::models::AgentRecord;

use crate::db;

pub const AGENT_NOT_ACTIVE: &str = "agent_not_active";
pub const KILL_SWITCH_ACTIVE: &str = "kill_switch_active";
pub const SERVICE_DENIED: &str = "service_denied";
pub const SERVICE_NOT_ALLOWED: &str = "service_not_allowed";
pub const CAPABILITY_DENIED: &str = "capability_denied";
pub const CAPABILITY_NOT_ALLOWED: &str = "capability_not_allowed";
pub const PER_CALL_LIMIT_EXCEEDED: &str = "per_call_limit_exceeded";
pub const DAILY_LIMIT_EXCEEDED: &str = "daily_limit_exceeded";
pub const MAX_BALANCE_EXCEEDED: &str = "max_balance_exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(&'static str),
}

/// Evaluates a quoted call against an agent's policy. Checks run in a fixed
/// order and the first failure wins; denied lists beat allowed lists.
pub fn evaluate(
    agent: &AgentRecord,
    policy: &PolicyBody,
    service_slug: &str,
    capability: Option<Capability>,
    quoted_sats: i64,
    today_spend_sats: i64,
) -> Decision {
    if !agent.is_active() {
        return Decision::Denied(AGENT_NOT_ACTIVE);
    }

    if policy.kill_switch {
        return Decision::Denied(KILL_SWITCH_ACTIVE);
    }

    if let Some(denied) = &policy.denied_services {
        if denied.iter().any(|slug| slug == service_slug) {
            return Decision::Denied(SERVICE_DENIED);
        }
    }

    if let Some(allowed) = &policy.allowed_services {
        if !allowed.iter().any(|slug| slug == service_slug) {
            return Decision::Denied(SERVICE_NOT_ALLOWED);
        }
    }

    if let Some(capability) = capability {
        if let Some(denied) = &policy.denied_capabilities {
            if denied.iter().any(|verb| verb == capability.as_str()) {
                return Decision::Denied(CAPABILITY_DENIED);
            }
        }

        if let Some(allowed) = &policy.allowed_capabilities {
            if !allowed.iter().any(|verb| verb == capability.as_str()) {
                return Decision::Denied(CAPABILITY_NOT_ALLOWED);
            }
        }
    }

    if let Some(max_per_call) = policy.max_per_call_sats {
        if quoted_sats > max_per_call {
            return Decision::Denied(PER_CALL_LIMIT_EXCEEDED);
        }
    }

    if let Some(max_per_day) = policy.max_per_day_sats {
        if today_spend_sats + quoted_sats > max_per_day {
            return Decision::Denied(DAILY_LIMIT_EXCEEDED);
        }
    }

    Decision::Allowed
}

#[derive(Clone, Copy)]
struct SpendEntry {
    day_start: i64,
    spent_sats: i64,
    fetched_at: i64,
}

/// Per-agent cache of today's debit total. Entries expire after the TTL, on
/// day rollover, and whenever the quoted call would land within 10% of the
/// daily cap, in which case the ledger is consulted directly.
pub struct SpendCache {
    ttl_ms: i64,
    entries: DashMap<String, SpendEntry>,
}

impl SpendCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as i64,
            entries: DashMap::new(),
        }
    }

    pub async fn today_spend(
        &self,
        db: &Database,
        agent_id: &str,
        quoted_sats: i64,
        max_per_day_sats: i64,
    ) -> Result<i64> {
        let now = unix_time();

        let day_start = utc_midnight(now);

        if self.ttl_ms > 0 {
            if let Some(entry) = self.entries.get(agent_id) {
                let fresh = entry.day_start == day_start && now - entry.fetched_at < self.ttl_ms;

                let near_limit =
                    entry.spent_sats + quoted_sats >= max_per_day_sats - max_per_day_sats / 10;

                if fresh && !near_limit {
                    return Ok(entry.spent_sats);
                }
            }
        }

        let spent_sats = db::agent_debit_total_since(db, agent_id, day_start).await?;

        self.entries.insert(
            agent_id.to_string(),
            SpendEntry {
                day_start,
                spent_sats,
                fetched_at: now,
            },
        );

        Ok(spent_sats)
    }

    /// Drops the cached total after a debit so the next check re-reads
    pub fn invalidate(&self, agent_id: &str) {
        self.entries.remove(agent_id);
    }
}
