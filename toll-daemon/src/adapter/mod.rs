pub mod chat;
pub mod credentials;
pub mod generic;
pub mod image;
pub mod message;
pub mod sandbox;
pub mod scrape;
pub mod search;
pub mod speech;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

use toll_daemon_db::models::ServiceRecord;

use crate::pricing::{PriceError, PricedOperation, PricingOracle};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Upstream(String),
}

/// Pre-flight cost estimate for one call
#[derive(Debug, Clone)]
pub struct Quote {
    pub operation: String,
    pub quoted_sats: i64,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub data: Value,
}

/// Per-service request normalization and billing hooks.
///
/// `quote` is pure and never moves money. `execute` performs the upstream
/// call with credentials resolved through the env allowlist. `finalize`
/// reports the actual cost and never exceeds the quote.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn quote(&self, body: &Value) -> Result<Quote, AdapterError>;

    async fn execute(&self, body: &Value) -> Result<UpstreamResponse, AdapterError>;

    fn finalize(&self, response: &UpstreamResponse, quoted_sats: i64) -> i64;
}

/// Outbound HTTP request in normalized form, so tests can stub the wire
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl UpstreamRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_string(),
            url,
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: Url, body: Value) -> Self {
        Self {
            method: "POST".to_string(),
            url,
            headers: Vec::new(),
            query: Vec::new(),
            body: Some(body),
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, AdapterError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, AdapterError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| AdapterError::Validation(format!("Invalid method '{}'", request.method)))?;

        let mut builder = self.client.request(method, request.url.clone());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AdapterError::Upstream(format!("Upstream request failed: {e}")))?;

        let status = response.status().as_u16();

        let text = response
            .text()
            .await
            .map_err(|e| AdapterError::Upstream(format!("Upstream body read failed: {e}")))?;

        let data = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text }));

        Ok(UpstreamResponse { status, data })
    }
}

/// Shared construction state for service adapters
#[derive(Clone)]
pub struct AdapterDeps {
    pub pricing: Arc<PricingOracle>,
    pub upstream: Arc<dyn Upstream>,
}

/// Builds the built-in adapter for a seeded service, if its slug is known
pub fn builtin(service: ServiceRecord, deps: AdapterDeps) -> Option<Arc<dyn Adapter>> {
    let adapter: Arc<dyn Adapter> = match service.slug.as_str() {
        "openrouter" => Arc::new(chat::ChatAdapter::new(service, deps)),
        "brave" => Arc::new(search::SearchAdapter::new(service, deps)),
        "firecrawl" => Arc::new(scrape::ScrapeAdapter::new(service, deps)),
        "resend" => Arc::new(message::MessageAdapter::email(service, deps)),
        "twilio" => Arc::new(message::MessageAdapter::sms(service, deps)),
        "elevenlabs" => Arc::new(speech::SpeechAdapter::speak(service, deps)),
        "deepgram" => Arc::new(speech::SpeechAdapter::transcribe(service, deps)),
        "replicate" => Arc::new(image::ImageAdapter::new(service, deps)),
        "e2b" => Arc::new(sandbox::SandboxAdapter::new(service, deps)),
        _ => return None,
    };

    Some(adapter)
}

pub(crate) async fn priced(
    deps: &AdapterDeps,
    service_slug: &str,
    operation: &str,
) -> Result<PricedOperation, AdapterError> {
    deps.pricing
        .price(service_slug, operation)
        .await
        .map_err(|error| match error {
            PriceError::NotPriced { .. } => AdapterError::Validation(error.to_string()),
            PriceError::RateUnavailable | PriceError::Storage(..) => {
                AdapterError::Upstream(error.to_string())
            }
        })
}

pub(crate) fn ensure_success(response: UpstreamResponse) -> Result<UpstreamResponse, AdapterError> {
    if response.status >= 400 {
        return Err(AdapterError::Upstream(format!(
            "Upstream returned status {}",
            response.status
        )));
    }

    Ok(response)
}

pub(crate) fn required_str<'a>(body: &'a Value, field: &str) -> Result<&'a str, AdapterError> {
    body.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AdapterError::Validation(format!("Missing required field '{field}'")))
}

/// Joins an upstream path onto a service base URL without letting the path
/// escape to another origin
pub(crate) fn join_url(base_url: &str, path: &str) -> Result<Url, AdapterError> {
    let joined = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );

    Url::parse(&joined)
        .map_err(|_| AdapterError::Validation(format!("Invalid upstream url '{joined}'")))
}

pub(crate) fn ceil_div(value: i64, divisor: i64) -> i64 {
    (value + divisor - 1) / divisor
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    use toll_core::db::Database;
    use toll_core::{id, unix_time};
    use toll_daemon_db::models::PricingRecord;

    use crate::db;
    use crate::pricing::PriceUnit;

    /// Upstream stub returning a canned response and recording requests
    pub struct StubUpstream {
        pub status: u16,
        pub data: Value,
        pub requests: Mutex<Vec<UpstreamRequest>>,
    }

    impl StubUpstream {
        pub fn ok(data: Value) -> Self {
            Self {
                status: 200,
                data,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Upstream for StubUpstream {
        async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, AdapterError> {
            self.requests.lock().unwrap().push(request);

            Ok(UpstreamResponse {
                status: self.status,
                data: self.data.clone(),
            })
        }
    }

    pub fn service_record(slug: &str) -> ServiceRecord {
        ServiceRecord {
            id: id::new_id(id::SERVICE),
            slug: slug.to_string(),
            name: slug.to_string(),
            tier: "core".to_string(),
            status: "active".to_string(),
            base_url: format!("https://api.{slug}.example"),
            auth_type: "bearer".to_string(),
            auth_credential_env: "EXAMPLE_API_KEY".to_string(),
            created_at: unix_time(),
        }
    }

    /// Seeds one service with one priced operation at 100k USD/BTC, where
    /// `price_sats * 1000` micros yields exactly `price_sats` sats
    pub async fn priced_service(
        db: &Database,
        slug: &str,
        operation: &str,
        unit: PriceUnit,
        price_sats: i64,
    ) -> ServiceRecord {
        let record = service_record(slug);

        db::create_service(
            db,
            record.clone(),
            vec![PricingRecord {
                id: id::new_id(id::SERVICE_PRICING),
                service_id: record.id.clone(),
                operation: operation.to_string(),
                cost_usd_micros: price_sats * 500,
                price_usd_micros: price_sats * 1_000,
                price_sats: 0,
                unit: unit.as_str().to_string(),
                updated_at: unix_time(),
            }],
        )
        .await
        .unwrap();

        record
    }

    pub async fn deps_with(
        db: &Database,
        upstream: Arc<dyn Upstream>,
    ) -> (Arc<crate::pricing::PricingOracle>, AdapterDeps) {
        let pricing = Arc::new(crate::pricing::PricingOracle::new(db.clone()));

        pricing.apply_rate(100_000.0, "test").await.unwrap();

        let deps = AdapterDeps {
            pricing: pricing.clone(),
            upstream,
        };

        (pricing, deps)
    }
}
