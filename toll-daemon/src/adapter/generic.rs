use async_trait::async_trait;
use serde_json::Value;

use toll_daemon_db::models::ServiceRecord;

use super::{
    Adapter, AdapterDeps, AdapterError, Quote, UpstreamRequest, UpstreamResponse, credentials,
    ensure_success, join_url, priced,
};

const SAFE_METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

/// Descriptor-driven adapter for services approved at runtime. The request
/// body selects a path and method under the service's base URL; the path
/// may not escape the configured origin.
pub struct GenericAdapter {
    service: ServiceRecord,
    default_operation: String,
    deps: AdapterDeps,
}

impl GenericAdapter {
    pub fn new(service: ServiceRecord, default_operation: String, deps: AdapterDeps) -> Self {
        Self {
            service,
            default_operation,
            deps,
        }
    }

    fn path(body: &Value) -> Result<&str, AdapterError> {
        let path = body.get("path").and_then(Value::as_str).unwrap_or("/");

        validate_path(path)?;

        Ok(path)
    }

    fn method(body: &Value) -> Result<String, AdapterError> {
        let method = body
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_ascii_uppercase();

        if !SAFE_METHODS.contains(&method.as_str()) {
            return Err(AdapterError::Validation(format!(
                "Method '{method}' is not allowed"
            )));
        }

        Ok(method)
    }
}

pub fn validate_path(path: &str) -> Result<(), AdapterError> {
    let rejected = !path.starts_with('/')
        || path.starts_with("//")
        || path.contains("://")
        || path.split('/').any(|segment| segment == "..");

    if rejected {
        return Err(AdapterError::Validation(format!(
            "Path '{path}' is not allowed"
        )));
    }

    Ok(())
}

#[async_trait]
impl Adapter for GenericAdapter {
    async fn quote(&self, body: &Value) -> Result<Quote, AdapterError> {
        Self::path(body)?;

        Self::method(body)?;

        let price = priced(&self.deps, &self.service.slug, &self.default_operation).await?;

        Ok(Quote {
            operation: self.default_operation.clone(),
            quoted_sats: price.price_sats,
        })
    }

    async fn execute(&self, body: &Value) -> Result<UpstreamResponse, AdapterError> {
        let url = join_url(&self.service.base_url, Self::path(body)?)?;

        let mut request = UpstreamRequest {
            method: Self::method(body)?,
            url,
            headers: Vec::new(),
            query: Vec::new(),
            body: body.get("payload").cloned(),
        };

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

    #[test]
    fn path_validation_blocks_escapes() {
        for path in [
            "relative",
            "//evil.example.com/x",
            "/ok/../../secrets",
            "/proxy/https://evil.example.com",
        ] {
            assert!(validate_path(path).is_err(), "{path} should be rejected");
        }

        assert!(validate_path("/v2/things").is_ok());

        assert!(validate_path("/").is_ok());
    }

    #[tokio::test]
    async fn quotes_descriptor_price_and_rejects_unsafe_methods() {
        let (_dir, db) = test_database();

        let service = priced_service(&db, "community", "call", PriceUnit::PerRequest, 12).await;

        let upstream = Arc::new(StubUpstream::ok(json!({"ok": true})));

        let (_, deps) = deps_with(&db, upstream.clone()).await;

        let adapter = GenericAdapter::new(service, "call".to_string(), deps);

        let quote = adapter.quote(&json!({"path": "/v2/things"})).await.unwrap();

        assert_eq!(quote.quoted_sats, 12);

        let error = adapter
            .quote(&json!({"path": "/v2/things", "method": "TRACE"}))
            .await
            .unwrap_err();

        assert!(matches!(error, AdapterError::Validation(..)));

        unsafe { std::env::set_var("EXAMPLE_API_KEY", "k") };

        let response = adapter
            .execute(&json!({"path": "/v2/things", "method": "GET"}))
            .await
            .unwrap();

        assert_eq!(response.status, 200);

        let sent = upstream.requests.lock().unwrap();

        assert_eq!(sent[0].method, "GET");

        assert!(sent[0].url.as_str().ends_with("/v2/things"));
    }
}
