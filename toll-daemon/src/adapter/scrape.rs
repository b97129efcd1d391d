use async_trait::async_trait;
use serde_json::{Value, json};
use url::Url;

use toll_daemon_db::models::ServiceRecord;

use super::{
    Adapter, AdapterDeps, AdapterError, Quote, UpstreamRequest, UpstreamResponse, credentials,
    ensure_success, join_url, priced, required_str,
};

const OPERATION: &str = "scrape";

/// Page fetch and extraction behind the `read` and `scrape` verbs
pub struct ScrapeAdapter {
    service: ServiceRecord,
    deps: AdapterDeps,
}

impl ScrapeAdapter {
    pub fn new(service: ServiceRecord, deps: AdapterDeps) -> Self {
        Self { service, deps }
    }

    fn target_url(body: &Value) -> Result<Url, AdapterError> {
        let raw = required_str(body, "url")?;

        let url = Url::parse(raw)
            .map_err(|_| AdapterError::Validation(format!("Invalid url '{raw}'")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(AdapterError::Validation(format!(
                "Unsupported url scheme '{}'",
                url.scheme()
            )));
        }

        Ok(url)
    }
}

#[async_trait]
impl Adapter for ScrapeAdapter {
    async fn quote(&self, body: &Value) -> Result<Quote, AdapterError> {
        Self::target_url(body)?;

        let price = priced(&self.deps, &self.service.slug, OPERATION).await?;

        Ok(Quote {
            operation: OPERATION.to_string(),
            quoted_sats: price.price_sats,
        })
    }

    async fn execute(&self, body: &Value) -> Result<UpstreamResponse, AdapterError> {
        let target = Self::target_url(body)?;

        let upstream_body = json!({
            "url": target.as_str(),
            "formats": ["markdown"],
        });

        let url = join_url(&self.service.base_url, "v1/scrape")?;

        let mut request = UpstreamRequest::post(url, upstream_body);

        credentials::authorize(
            &self.service.auth_type,
            &self.service.auth_credential_env,
            &mut request,
        )?;

        ensure_success(self.deps.upstream.send(request).await?)
    }

    fn finalize(&self, _response: &UpstreamResponse, quoted_sats: i64) -> i64 {
        quoted_sats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::adapter::testing::{StubUpstream, deps_with, priced_service};
    use crate::db::test_database;
    use crate::pricing::PriceUnit;

    #[tokio::test]
    async fn rejects_non_http_targets() {
        let (_dir, db) = test_database();

        let service = priced_service(&db, "firecrawl", OPERATION, PriceUnit::PerRequest, 15).await;

        let upstream = Arc::new(StubUpstream::ok(Value::Null));

        let (_, deps) = deps_with(&db, upstream).await;

        let adapter = ScrapeAdapter::new(service, deps);

        for body in [
            json!({}),
            json!({"url": "not a url"}),
            json!({"url": "file:///etc/passwd"}),
            json!({"url": "ftp://example.com/x"}),
        ] {
            let error = adapter.quote(&body).await.unwrap_err();

            assert!(matches!(error, AdapterError::Validation(..)));
        }

        let quote = adapter.quote(&json!({"url": "https://example.com/post"})).await.unwrap();

        assert_eq!(quote.quoted_sats, 15);
    }
}
