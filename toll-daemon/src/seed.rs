//! Built-in service catalog. Seeded into the database on first startup and
//! wired into the provider registry on every startup, together with any
//! services approved through the submission workflow.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use toll_api_core::Capability;
use toll_core::db::Database;
use toll_core::{id, unix_time};
use toll_daemon_db::models::{PricingRecord, ServiceRecord};

use crate::adapter::generic::GenericAdapter;
use crate::adapter::{self, AdapterDeps};
use crate::db;
use crate::registry::{ProviderEntry, ProviderRegistry};

const BUILTIN_PRIORITY: i64 = 100;

const COMMUNITY_PRIORITY: i64 = 10;

struct Builtin {
    slug: &'static str,
    name: &'static str,
    base_url: &'static str,
    auth_type: &'static str,
    credential_env: &'static str,
    capabilities: &'static [Capability],
    /// (operation, unit, cost_usd_micros, price_usd_micros)
    operations: &'static [(&'static str, &'static str, i64, i64)],
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        slug: "openrouter",
        name: "OpenRouter",
        base_url: "https://openrouter.ai/api/v1",
        auth_type: "bearer",
        credential_env: "OPENROUTER_API_KEY",
        capabilities: &[Capability::Reason],
        operations: &[("chat", "per_1k_tokens", 1_500, 2_000)],
    },
    Builtin {
        slug: "brave",
        name: "Brave Search",
        base_url: "https://api.search.brave.com",
        auth_type: "api_key_header",
        credential_env: "BRAVE_API_KEY",
        capabilities: &[Capability::Search],
        operations: &[("search", "per_request", 5_000, 8_000)],
    },
    Builtin {
        slug: "firecrawl",
        name: "Firecrawl",
        base_url: "https://api.firecrawl.dev",
        auth_type: "bearer",
        credential_env: "FIRECRAWL_API_KEY",
        capabilities: &[Capability::Read, Capability::Scrape],
        operations: &[("scrape", "per_request", 10_000, 15_000)],
    },
    Builtin {
        slug: "resend",
        name: "Resend",
        base_url: "https://api.resend.com",
        auth_type: "bearer",
        credential_env: "RESEND_API_KEY",
        capabilities: &[Capability::Email],
        operations: &[("send", "per_request", 1_000, 2_000)],
    },
    Builtin {
        slug: "twilio",
        name: "Twilio",
        base_url: "https://api.twilio.com",
        auth_type: "basic",
        credential_env: "TWILIO_API_TOKEN",
        capabilities: &[Capability::Sms],
        operations: &[("send", "per_request", 75_000, 100_000)],
    },
    Builtin {
        slug: "elevenlabs",
        name: "ElevenLabs",
        base_url: "https://api.elevenlabs.io",
        auth_type: "api_key_header",
        credential_env: "ELEVENLABS_API_KEY",
        capabilities: &[Capability::Speak],
        operations: &[("speak", "per_request", 30_000, 40_000)],
    },
    Builtin {
        slug: "deepgram",
        name: "Deepgram",
        base_url: "https://api.deepgram.com",
        auth_type: "bearer",
        credential_env: "DEEPGRAM_API_TOKEN",
        capabilities: &[Capability::Transcribe],
        operations: &[("transcribe", "per_minute", 4_300, 6_000)],
    },
    Builtin {
        slug: "replicate",
        name: "Replicate",
        base_url: "https://api.replicate.com",
        auth_type: "bearer",
        credential_env: "REPLICATE_API_TOKEN",
        capabilities: &[Capability::Imagine],
        operations: &[("imagine", "per_request", 20_000, 30_000)],
    },
    Builtin {
        slug: "e2b",
        name: "E2B",
        base_url: "https://api.e2b.dev",
        auth_type: "api_key_header",
        credential_env: "E2B_API_KEY",
        capabilities: &[Capability::Execute],
        operations: &[("execute", "per_minute", 2_000, 4_000)],
    },
];

/// Inserts any missing built-in services. Sats prices start at zero and are
/// set by the first rate refresh.
pub async fn seed_services(db: &Database) -> Result<()> {
    for builtin in BUILTINS {
        if db::service_by_slug(db, builtin.slug).await?.is_some() {
            continue;
        }

        let service_record = ServiceRecord {
            id: id::new_id(id::SERVICE),
            slug: builtin.slug.to_string(),
            name: builtin.name.to_string(),
            tier: "core".to_string(),
            status: "active".to_string(),
            base_url: builtin.base_url.to_string(),
            auth_type: builtin.auth_type.to_string(),
            auth_credential_env: builtin.credential_env.to_string(),
            created_at: unix_time(),
        };

        let pricing_records = builtin
            .operations
            .iter()
            .map(|(operation, unit, cost_usd_micros, price_usd_micros)| PricingRecord {
                id: id::new_id(id::SERVICE_PRICING),
                service_id: service_record.id.clone(),
                operation: operation.to_string(),
                cost_usd_micros: *cost_usd_micros,
                price_usd_micros: *price_usd_micros,
                price_sats: 0,
                unit: unit.to_string(),
                updated_at: unix_time(),
            })
            .collect();

        db::create_service(db, service_record, pricing_records).await?;

        info!(slug = ?builtin.slug, "seeded built-in service");
    }

    Ok(())
}

/// Wires adapters and capability routes for built-ins and for services
/// approved at runtime in earlier lifetimes of the daemon
pub async fn register_providers(
    db: &Database,
    registry: &ProviderRegistry,
    deps: AdapterDeps,
) -> Result<()> {
    for builtin in BUILTINS {
        let Some(service) = db::service_by_slug(db, builtin.slug).await? else {
            continue;
        };

        let Some(built) = adapter::builtin(service, deps.clone()) else {
            continue;
        };

        registry.register_adapter(builtin.slug, built);

        for capability in builtin.capabilities {
            registry.register_provider(
                *capability,
                ProviderEntry {
                    slug: builtin.slug.to_string(),
                    priority: BUILTIN_PRIORITY,
                    active: true,
                },
            );
        }
    }

    for submission in db::submissions_by_status(db, "approved").await? {
        let Some(service) = db::service_by_slug(db, &submission.slug).await? else {
            continue;
        };

        registry.register_adapter(
            &submission.slug,
            Arc::new(GenericAdapter::new(
                service,
                submission.default_operation.clone(),
                deps.clone(),
            )),
        );

        if let Some(capability) = submission
            .capability
            .as_deref()
            .and_then(|verb| verb.parse().ok())
        {
            registry.register_provider(
                capability,
                ProviderEntry {
                    slug: submission.slug.clone(),
                    priority: COMMUNITY_PRIORITY,
                    active: true,
                },
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::adapter::HttpUpstream;
    use crate::db::test_database;
    use crate::pricing::PricingOracle;

    #[tokio::test]
    async fn seeding_is_idempotent_and_covers_every_verb() {
        let (_dir, db) = test_database();

        seed_services(&db).await.unwrap();

        seed_services(&db).await.unwrap();

        let services = db::list_services(&db).await.unwrap();

        assert_eq!(services.len(), BUILTINS.len());

        let registry = ProviderRegistry::new();

        let deps = AdapterDeps {
            pricing: Arc::new(PricingOracle::new(db.clone())),
            upstream: Arc::new(HttpUpstream::new().unwrap()),
        };

        register_providers(&db, &registry, deps).await.unwrap();

        for capability in Capability::ALL {
            assert!(
                registry.resolve(capability).is_some(),
                "no provider for {capability}"
            );
        }
    }
}
