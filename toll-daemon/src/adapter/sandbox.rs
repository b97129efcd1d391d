use async_trait::async_trait;
use serde_json::{Value, json};

use toll_daemon_db::models::ServiceRecord;

use super::{
    Adapter, AdapterDeps, AdapterError, Quote, UpstreamRequest, UpstreamResponse, ceil_div,
    credentials, ensure_success, join_url, priced, required_str,
};
use crate::pricing::PriceUnit;

const OPERATION: &str = "execute";

const DEFAULT_LANGUAGE: &str = "python";

const DEFAULT_TIMEOUT_MINUTES: i64 = 1;

/// Code execution behind the `execute` verb, priced per sandbox minute.
/// The quote covers the requested timeout; finalize bills actual runtime.
pub struct SandboxAdapter {
    service: ServiceRecord,
    deps: AdapterDeps,
}

impl SandboxAdapter {
    pub fn new(service: ServiceRecord, deps: AdapterDeps) -> Self {
        Self { service, deps }
    }

    fn timeout_minutes(body: &Value) -> i64 {
        body.get("timeout_minutes")
            .and_then(Value::as_i64)
            .filter(|minutes| *minutes > 0)
            .unwrap_or(DEFAULT_TIMEOUT_MINUTES)
    }
}

#[async_trait]
impl Adapter for SandboxAdapter {
    async fn quote(&self, body: &Value) -> Result<Quote, AdapterError> {
        required_str(body, "code")?;

        let price = priced(&self.deps, &self.service.slug, OPERATION).await?;

        let quoted_sats = match price.unit {
            PriceUnit::PerMinute => Self::timeout_minutes(body) * price.price_sats,
            _ => price.price_sats,
        };

        Ok(Quote {
            operation: OPERATION.to_string(),
            quoted_sats,
        })
    }

    async fn execute(&self, body: &Value) -> Result<UpstreamResponse, AdapterError> {
        let code = required_str(body, "code")?;

        let language = body
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_LANGUAGE);

        let upstream_body = json!({
            "language": language,
            "code": code,
            "timeout_minutes": Self::timeout_minutes(body),
        });

        let url = join_url(&self.service.base_url, "v1/executions")?;

        let mut request = UpstreamRequest::post(url, upstream_body);

        credentials::authorize(
            &self.service.auth_type,
            &self.service.auth_credential_env,
            &mut request,
        )?;

        ensure_success(self.deps.upstream.send(request).await?)
    }

    fn finalize(&self, response: &UpstreamResponse, quoted_sats: i64) -> i64 {
        let duration_ms = response.data.get("duration_ms").and_then(Value::as_i64);

        let price = self.deps.pricing.cached(&self.service.slug, OPERATION);

        match (duration_ms, price) {
            (Some(ms), Some(price)) if price.unit == PriceUnit::PerMinute && ms >= 0 => {
                let minutes = ceil_div(ms.max(1), 60_000);

                (minutes * price.price_sats).min(quoted_sats)
            }
            _ => quoted_sats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::adapter::testing::{StubUpstream, deps_with, priced_service};
    use crate::db::test_database;

    #[tokio::test]
    async fn bills_actual_runtime_rounded_to_minutes() {
        let (_dir, db) = test_database();

        let service = priced_service(&db, "e2b", OPERATION, PriceUnit::PerMinute, 4).await;

        let upstream = Arc::new(StubUpstream::ok(Value::Null));

        let (_, deps) = deps_with(&db, upstream).await;

        let adapter = SandboxAdapter::new(service, deps);

        let body = json!({"code": "print(1)", "timeout_minutes": 5});

        let quote = adapter.quote(&body).await.unwrap();

        assert_eq!(quote.quoted_sats, 20);

        // 61 seconds of runtime bills two minutes
        let response = UpstreamResponse {
            status: 200,
            data: json!({"duration_ms": 61_000}),
        };

        assert_eq!(adapter.finalize(&response, quote.quoted_sats), 8);
    }
}
