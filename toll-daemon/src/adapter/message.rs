use async_trait::async_trait;
use serde_json::{Value, json};

use toll_daemon_db::models::ServiceRecord;

use super::{
    Adapter, AdapterDeps, AdapterError, Quote, UpstreamRequest, UpstreamResponse, credentials,
    ensure_success, join_url, priced, required_str,
};

const OPERATION: &str = "send";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Email,
    Sms,
}

/// Outbound messaging behind the `email` and `sms` verbs, priced per message
pub struct MessageAdapter {
    service: ServiceRecord,
    deps: AdapterDeps,
    channel: Channel,
}

impl MessageAdapter {
    pub fn email(service: ServiceRecord, deps: AdapterDeps) -> Self {
        Self {
            service,
            deps,
            channel: Channel::Email,
        }
    }

    pub fn sms(service: ServiceRecord, deps: AdapterDeps) -> Self {
        Self {
            service,
            deps,
            channel: Channel::Sms,
        }
    }

    fn validate(&self, body: &Value) -> Result<(), AdapterError> {
        required_str(body, "to")?;

        required_str(body, "body")?;

        if self.channel == Channel::Email {
            required_str(body, "subject")?;
        }

        Ok(())
    }
}

#[async_trait]
impl Adapter for MessageAdapter {
    async fn quote(&self, body: &Value) -> Result<Quote, AdapterError> {
        self.validate(body)?;

        let price = priced(&self.deps, &self.service.slug, OPERATION).await?;

        Ok(Quote {
            operation: OPERATION.to_string(),
            quoted_sats: price.price_sats,
        })
    }

    async fn execute(&self, body: &Value) -> Result<UpstreamResponse, AdapterError> {
        self.validate(body)?;

        let (path, upstream_body) = match self.channel {
            Channel::Email => (
                "emails",
                json!({
                    "to": [body.get("to")],
                    "subject": body.get("subject"),
                    "text": body.get("body"),
                }),
            ),
            Channel::Sms => (
                "messages",
                json!({
                    "to": body.get("to"),
                    "body": body.get("body"),
                }),
            ),
        };

        let url = join_url(&self.service.base_url, path)?;

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
    async fn email_requires_a_subject_but_sms_does_not() {
        let (_dir, db) = test_database();

        let email_service = priced_service(&db, "resend", OPERATION, PriceUnit::PerRequest, 2).await;

        let sms_service = priced_service(&db, "twilio", OPERATION, PriceUnit::PerRequest, 100).await;

        let upstream = Arc::new(StubUpstream::ok(Value::Null));

        let (_, deps) = deps_with(&db, upstream).await;

        let email = MessageAdapter::email(email_service, deps.clone());

        let sms = MessageAdapter::sms(sms_service, deps);

        let body = json!({"to": "+15555550123", "body": "hello"});

        assert!(matches!(
            email.quote(&body).await.unwrap_err(),
            AdapterError::Validation(..)
        ));

        let quote = sms.quote(&body).await.unwrap();

        assert_eq!(quote.quoted_sats, 100);

        let with_subject = json!({"to": "a@b.c", "subject": "hi", "body": "hello"});

        assert_eq!(email.quote(&with_subject).await.unwrap().quoted_sats, 2);
    }
}
