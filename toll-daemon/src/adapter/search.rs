use async_trait::async_trait;
use serde_json::Value;

use toll_daemon_db::models::ServiceRecord;

use super::{
    Adapter, AdapterDeps, AdapterError, Quote, UpstreamRequest, UpstreamResponse, credentials,
    ensure_success, join_url, priced, required_str,
};

const OPERATION: &str = "search";

/// Web search behind the `search` verb, priced per request
pub struct SearchAdapter {
    service: ServiceRecord,
    deps: AdapterDeps,
}

impl SearchAdapter {
    pub fn new(service: ServiceRecord, deps: AdapterDeps) -> Self {
        Self { service, deps }
    }
}

#[async_trait]
impl Adapter for SearchAdapter {
    async fn quote(&self, body: &Value) -> Result<Quote, AdapterError> {
        required_str(body, "query")?;

        let price = priced(&self.deps, &self.service.slug, OPERATION).await?;

        Ok(Quote {
            operation: OPERATION.to_string(),
            quoted_sats: price.price_sats,
        })
    }

    async fn execute(&self, body: &Value) -> Result<UpstreamResponse, AdapterError> {
        let query = required_str(body, "query")?;

        let url = join_url(&self.service.base_url, "res/v1/web/search")?;

        let mut request = UpstreamRequest::get(url);

        request.query.push(("q".to_string(), query.to_string()));

        if let Some(count) = body.get("count").and_then(Value::as_i64) {
            request.query.push(("count".to_string(), count.to_string()));
        }

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

    use serde_json::json;

    use crate::adapter::testing::{StubUpstream, deps_with, priced_service};
    use crate::db::test_database;
    use crate::pricing::PriceUnit;

    #[tokio::test]
    async fn quotes_flat_rate_and_passes_query_through() {
        let (_dir, db) = test_database();

        let service = priced_service(&db, "brave", OPERATION, PriceUnit::PerRequest, 8).await;

        let upstream = Arc::new(StubUpstream::ok(json!({"web": {"results": []}})));

        let (_, deps) = deps_with(&db, upstream.clone()).await;

        let adapter = SearchAdapter::new(service, deps);

        let body = json!({"query": "rust sqlite busy timeout", "count": 5});

        let quote = adapter.quote(&body).await.unwrap();

        assert_eq!(quote.quoted_sats, 8);

        unsafe { std::env::set_var("EXAMPLE_API_KEY", "k") };

        let response = adapter.execute(&body).await.unwrap();

        assert_eq!(response.status, 200);

        assert_eq!(adapter.finalize(&response, quote.quoted_sats), 8);

        let sent = upstream.requests.lock().unwrap();

        assert_eq!(sent[0].method, "GET");

        assert!(sent[0].query.contains(&("q".to_string(), "rust sqlite busy timeout".to_string())));
    }

    #[tokio::test]
    async fn missing_query_is_a_validation_error() {
        let (_dir, db) = test_database();

        let service = priced_service(&db, "brave", OPERATION, PriceUnit::PerRequest, 8).await;

        let upstream = Arc::new(StubUpstream::ok(Value::Null));

        let (_, deps) = deps_with(&db, upstream).await;

        let adapter = SearchAdapter::new(service, deps);

        let error = adapter.quote(&json!({})).await.unwrap_err();

        assert!(matches!(error, AdapterError::Validation(..)));
    }
}
