use async_trait::async_trait;
use serde_json::{Value, json};

use toll_daemon_db::models::ServiceRecord;

use super::{
    Adapter, AdapterDeps, AdapterError, Quote, UpstreamRequest, UpstreamResponse, ceil_div,
    credentials, ensure_success, join_url, priced,
};
use crate::pricing::PriceUnit;

const OPERATION: &str = "chat";

const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

const DEFAULT_MAX_TOKENS: i64 = 1_024;

/// LLM completions behind the `reason` verb. Priced per 1k tokens: the
/// quote covers the requested token budget, finalize bills actual usage.
pub struct ChatAdapter {
    service: ServiceRecord,
    deps: AdapterDeps,
}

impl ChatAdapter {
    pub fn new(service: ServiceRecord, deps: AdapterDeps) -> Self {
        Self { service, deps }
    }

    fn max_tokens(body: &Value) -> i64 {
        body.get("max_tokens")
            .and_then(Value::as_i64)
            .filter(|tokens| *tokens > 0)
            .unwrap_or(DEFAULT_MAX_TOKENS)
    }
}

#[async_trait]
impl Adapter for ChatAdapter {
    async fn quote(&self, body: &Value) -> Result<Quote, AdapterError> {
        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .filter(|messages| !messages.is_empty())
            .ok_or_else(|| AdapterError::Validation("Missing 'messages' array".to_string()))?;

        if !messages.iter().all(Value::is_object) {
            return Err(AdapterError::Validation(
                "Every message must be an object".to_string(),
            ));
        }

        let price = priced(&self.deps, &self.service.slug, OPERATION).await?;

        let quoted_sats = match price.unit {
            PriceUnit::Per1kTokens => {
                ceil_div(Self::max_tokens(body), 1_000) * price.price_sats
            }
            _ => price.price_sats,
        };

        Ok(Quote {
            operation: OPERATION.to_string(),
            quoted_sats,
        })
    }

    async fn execute(&self, body: &Value) -> Result<UpstreamResponse, AdapterError> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MODEL);

        let upstream_body = json!({
            "model": model,
            "messages": body.get("messages"),
            "max_tokens": Self::max_tokens(body),
        });

        let url = join_url(&self.service.base_url, "chat/completions")?;

        let mut request = UpstreamRequest::post(url, upstream_body);

        credentials::authorize(
            &self.service.auth_type,
            &self.service.auth_credential_env,
            &mut request,
        )?;

        ensure_success(self.deps.upstream.send(request).await?)
    }

    fn finalize(&self, response: &UpstreamResponse, quoted_sats: i64) -> i64 {
        let total_tokens = response
            .data
            .get("usage")
            .and_then(|usage| usage.get("total_tokens"))
            .and_then(Value::as_i64);

        let price = self.deps.pricing.cached(&self.service.slug, OPERATION);

        match (total_tokens, price) {
            (Some(tokens), Some(price)) if price.unit == PriceUnit::Per1kTokens => {
                (ceil_div(tokens.max(0), 1_000) * price.price_sats).min(quoted_sats)
            }
            // Usage unknown, bill the quote
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

    async fn adapter_with(
        data: Value,
        price_sats: i64,
    ) -> (tempfile::TempDir, ChatAdapter, Arc<StubUpstream>) {
        let (dir, db) = test_database();

        let service =
            priced_service(&db, "openrouter", OPERATION, PriceUnit::Per1kTokens, price_sats).await;

        let upstream = Arc::new(StubUpstream::ok(data));

        let (_, deps) = deps_with(&db, upstream.clone()).await;

        (dir, ChatAdapter::new(service, deps), upstream)
    }

    fn chat_body(max_tokens: i64) -> Value {
        json!({
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": max_tokens,
        })
    }

    #[tokio::test]
    async fn quote_scales_with_token_budget() {
        let (_dir, adapter, _) = adapter_with(Value::Null, 10).await;

        let quote = adapter.quote(&chat_body(1_000)).await.unwrap();

        assert_eq!(quote.quoted_sats, 10);

        let quote = adapter.quote(&chat_body(2_500)).await.unwrap();

        assert_eq!(quote.quoted_sats, 30);

        assert_eq!(quote.operation, "chat");
    }

    #[tokio::test]
    async fn quote_rejects_missing_messages() {
        let (_dir, adapter, _) = adapter_with(Value::Null, 10).await;

        let error = adapter.quote(&json!({"max_tokens": 100})).await.unwrap_err();

        assert!(matches!(error, AdapterError::Validation(..)));
    }

    #[tokio::test]
    async fn finalize_bills_actual_usage() {
        let (_dir, adapter, _) = adapter_with(Value::Null, 10).await;

        // Warm the price cache the way a real call does
        adapter.quote(&chat_body(5_000)).await.unwrap();

        let response = UpstreamResponse {
            status: 200,
            data: json!({"usage": {"total_tokens": 1_200}}),
        };

        assert_eq!(adapter.finalize(&response, 50), 20);
    }

    #[tokio::test]
    async fn finalize_without_usage_returns_quote() {
        let (_dir, adapter, _) = adapter_with(Value::Null, 10).await;

        let response = UpstreamResponse {
            status: 200,
            data: json!({"choices": []}),
        };

        assert_eq!(adapter.finalize(&response, 50), 50);
    }

    #[tokio::test]
    async fn finalize_never_exceeds_quote() {
        let (_dir, adapter, _) = adapter_with(Value::Null, 10).await;

        adapter.quote(&chat_body(1_000)).await.unwrap();

        let response = UpstreamResponse {
            status: 200,
            data: json!({"usage": {"total_tokens": 999_000}}),
        };

        assert_eq!(adapter.finalize(&response, 10), 10);
    }
}
