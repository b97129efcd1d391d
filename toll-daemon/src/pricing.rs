use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use dashmap::DashMap;
use diesel::prelude::*;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use toll_core::db::Database;
use toll_core::{money, unix_time};
use toll_daemon_db::models::PricingRecord;
use toll_daemon_db::schema::{service, service_pricing};

use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceUnit {
    PerRequest,
    Per1kTokens,
    PerMinute,
}

impl PriceUnit {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "per_request" => Some(PriceUnit::PerRequest),
            "per_1k_tokens" => Some(PriceUnit::Per1kTokens),
            "per_minute" => Some(PriceUnit::PerMinute),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriceUnit::PerRequest => "per_request",
            PriceUnit::Per1kTokens => "per_1k_tokens",
            PriceUnit::PerMinute => "per_minute",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PricedOperation {
    pub price_sats: i64,
    pub unit: PriceUnit,
}

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("BTC/USD rate unavailable")]
    RateUnavailable,

    #[error("No price for {service}:{operation}")]
    NotPriced { service: String, operation: String },

    #[error("{0}")]
    Storage(String),
}

/// Holds the current BTC/USD rate and a cache of per-operation prices.
/// Every rate change appends a snapshot, recomputes the sats price of all
/// pricing rows and drops the cache.
pub struct PricingOracle {
    db: Database,
    rate: RwLock<Option<f64>>,
    cache: DashMap<(String, String), PricedOperation>,
}

impl PricingOracle {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            rate: RwLock::new(None),
            cache: DashMap::new(),
        }
    }

    pub fn current_rate(&self) -> Option<f64> {
        *self.rate.read().expect("Rate lock poisoned")
    }

    /// Seeds the rate from the newest persisted snapshot, if any
    pub async fn load_rate_from_db(&self) -> Result<()> {
        if let Some(snapshot) = db::latest_rate_snapshot(&self.db).await? {
            info!(btc_usd = ?snapshot.btc_usd, "loaded persisted BTC/USD rate");

            *self.rate.write().expect("Rate lock poisoned") = Some(snapshot.btc_usd);
        }

        Ok(())
    }

    /// Applies a freshly fetched rate: appends a snapshot, recomputes
    /// `price_sats` across all pricing rows and invalidates the cache
    pub async fn apply_rate(&self, btc_usd: f64, source: &str) -> Result<()> {
        ensure!(
            btc_usd.is_finite() && btc_usd > 0.0,
            "Rejecting non-positive BTC/USD rate {btc_usd}"
        );

        db::append_rate_snapshot(&self.db, btc_usd, source).await?;

        let mut conn = self.db.get_connection().await;

        conn.immediate_transaction::<_, diesel::result::Error, _>(|conn| {
            let rows = service_pricing::table.load::<PricingRecord>(conn)?;

            for row in rows {
                let price_sats = money::usd_micros_to_sats(row.price_usd_micros, btc_usd);

                if price_sats != row.price_sats {
                    diesel::update(service_pricing::table.find(&row.id))
                        .set((
                            service_pricing::price_sats.eq(price_sats),
                            service_pricing::updated_at.eq(unix_time()),
                        ))
                        .execute(conn)?;
                }
            }

            Ok(())
        })
        .context("Failed to recompute sats prices")?;

        self.cache.clear();

        *self.rate.write().expect("Rate lock poisoned") = Some(btc_usd);

        info!(?btc_usd, ?source, "applied BTC/USD rate");

        Ok(())
    }

    /// Cached lookup of the price for `(service, operation)`
    pub async fn price(
        &self,
        service_slug: &str,
        operation: &str,
    ) -> Result<PricedOperation, PriceError> {
        if self.current_rate().is_none() {
            return Err(PriceError::RateUnavailable);
        }

        let key = (service_slug.to_string(), operation.to_string());

        if let Some(priced) = self.cache.get(&key) {
            return Ok(priced.value().clone());
        }

        let mut conn = self.db.get_connection().await;

        let not_priced = || PriceError::NotPriced {
            service: service_slug.to_string(),
            operation: operation.to_string(),
        };

        let service_id = service::table
            .filter(service::slug.eq(service_slug))
            .select(service::id)
            .first::<String>(&mut conn)
            .optional()
            .map_err(|e| PriceError::Storage(e.to_string()))?
            .ok_or_else(not_priced)?;

        let row = service_pricing::table
            .filter(service_pricing::service_id.eq(service_id))
            .filter(service_pricing::operation.eq(operation))
            .first::<PricingRecord>(&mut conn)
            .optional()
            .map_err(|e| PriceError::Storage(e.to_string()))?
            .ok_or_else(not_priced)?;

        let unit = PriceUnit::parse(&row.unit).ok_or_else(not_priced)?;

        let priced = PricedOperation {
            price_sats: row.price_sats,
            unit,
        };

        self.cache.insert(key, priced.clone());

        Ok(priced)
    }

    /// Cache-only lookup for synchronous finalize paths. A quote for the
    /// same operation always precedes finalize, so the entry is warm.
    pub fn cached(&self, service_slug: &str, operation: &str) -> Option<PricedOperation> {
        self.cache
            .get(&(service_slug.to_string(), operation.to_string()))
            .map(|priced| priced.value().clone())
    }

    /// Periodic rate refresh loop
    pub async fn run(self: Arc<Self>, rate_url: Url, refresh: Duration, ct: CancellationToken) {
        let client = reqwest::Client::new();

        loop {
            match fetch_rate(&client, &rate_url).await {
                Ok(btc_usd) => {
                    if let Err(error) = self.apply_rate(btc_usd, rate_url.as_str()).await {
                        warn!(?error, "failed to apply BTC/USD rate");
                    }
                }
                Err(error) => warn!(?error, "failed to fetch BTC/USD rate"),
            }

            tokio::select! {
                _ = tokio::time::sleep(refresh) => {}
                _ = ct.cancelled() => return,
            }
        }
    }
}

async fn fetch_rate(client: &reqwest::Client, rate_url: &Url) -> Result<f64> {
    let value = client
        .get(rate_url.clone())
        .send()
        .await
        .context("Rate request failed")?
        .error_for_status()
        .context("Rate request returned an error status")?
        .json::<Value>()
        .await
        .context("Rate response was not JSON")?;

    parse_rate(&value).context("Rate response had an unknown shape")
}

/// Accepts either `{"rate": 97000.0}` or the Coinbase spot shape
/// `{"data": {"amount": "97000.00"}}`
pub fn parse_rate(value: &Value) -> Option<f64> {
    let rate = match value.get("rate").and_then(Value::as_f64) {
        Some(rate) => rate,
        None => value
            .get("data")?
            .get("amount")?
            .as_str()?
            .parse::<f64>()
            .ok()?,
    };

    (rate.is_finite() && rate > 0.0).then_some(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use toll_core::id;
    use toll_daemon_db::models::ServiceRecord;

    use crate::db::test_database;

    async fn seed_service(db: &Database, slug: &str, price_usd_micros: i64) {
        let service_id = id::new_id(id::SERVICE);

        db::create_service(
            db,
            ServiceRecord {
                id: service_id.clone(),
                slug: slug.to_string(),
                name: slug.to_string(),
                tier: "core".to_string(),
                status: "active".to_string(),
                base_url: "https://api.example.com".to_string(),
                auth_type: "bearer".to_string(),
                auth_credential_env: "EXAMPLE_API_KEY".to_string(),
                created_at: unix_time(),
            },
            vec![PricingRecord {
                id: id::new_id(id::SERVICE_PRICING),
                service_id,
                operation: "search".to_string(),
                cost_usd_micros: price_usd_micros / 2,
                price_usd_micros,
                price_sats: 0,
                unit: "per_request".to_string(),
                updated_at: unix_time(),
            }],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn price_requires_a_rate() {
        let (_dir, db) = test_database();

        seed_service(&db, "brave", 1_000).await;

        let oracle = PricingOracle::new(db);

        assert!(matches!(
            oracle.price("brave", "search").await,
            Err(PriceError::RateUnavailable)
        ));
    }

    #[tokio::test]
    async fn rate_change_recomputes_sats_prices() {
        let (_dir, db) = test_database();

        seed_service(&db, "brave", 1_000).await;

        let oracle = PricingOracle::new(db);

        oracle.apply_rate(50_000.0, "test").await.unwrap();

        let priced = oracle.price("brave", "search").await.unwrap();

        assert_eq!(priced.price_sats, 2);

        oracle.apply_rate(100_000.0, "test").await.unwrap();

        // The cache was invalidated and the recomputed row is visible
        let priced = oracle.price("brave", "search").await.unwrap();

        assert_eq!(priced.price_sats, 1);
    }

    #[tokio::test]
    async fn unknown_operations_are_not_priced() {
        let (_dir, db) = test_database();

        seed_service(&db, "brave", 1_000).await;

        let oracle = PricingOracle::new(db);

        oracle.apply_rate(50_000.0, "test").await.unwrap();

        assert!(matches!(
            oracle.price("brave", "imagine").await,
            Err(PriceError::NotPriced { .. })
        ));

        assert!(matches!(
            oracle.price("nobody", "search").await,
            Err(PriceError::NotPriced { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_bogus_rates() {
        let (_dir, db) = test_database();

        let oracle = PricingOracle::new(db);

        assert!(oracle.apply_rate(0.0, "test").await.is_err());

        assert!(oracle.apply_rate(f64::NAN, "test").await.is_err());
    }

    #[test]
    fn parses_both_rate_shapes() {
        assert_eq!(parse_rate(&json!({"rate": 97_000.0})), Some(97_000.0));

        assert_eq!(
            parse_rate(&json!({"data": {"amount": "97000.00"}})),
            Some(97_000.0)
        );

        assert_eq!(parse_rate(&json!({"rate": -1.0})), None);

        assert_eq!(parse_rate(&json!({"unexpected": true})), None);
    }
}
