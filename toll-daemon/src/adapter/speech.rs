use async_trait::async_trait;
use serde_json::{Value, json};

use toll_daemon_db::models::ServiceRecord;

use super::{
    Adapter, AdapterDeps, AdapterError, Quote, UpstreamRequest, UpstreamResponse, ceil_div,
    credentials, ensure_success, join_url, priced, required_str,
};
use crate::pricing::PriceUnit;

const SPEAK_OPERATION: &str = "speak";

const TRANSCRIBE_OPERATION: &str = "transcribe";

/// Quoted audio length when the caller does not state one
const DEFAULT_TRANSCRIBE_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Speak,
    Transcribe,
}

/// Text-to-speech and transcription. Speech synthesis is priced per
/// request; transcription per minute, with finalize billing the reported
/// audio duration.
pub struct SpeechAdapter {
    service: ServiceRecord,
    deps: AdapterDeps,
    mode: Mode,
}

impl SpeechAdapter {
    pub fn speak(service: ServiceRecord, deps: AdapterDeps) -> Self {
        Self {
            service,
            deps,
            mode: Mode::Speak,
        }
    }

    pub fn transcribe(service: ServiceRecord, deps: AdapterDeps) -> Self {
        Self {
            service,
            deps,
            mode: Mode::Transcribe,
        }
    }

    fn operation(&self) -> &'static str {
        match self.mode {
            Mode::Speak => SPEAK_OPERATION,
            Mode::Transcribe => TRANSCRIBE_OPERATION,
        }
    }

    fn quoted_minutes(body: &Value) -> i64 {
        body.get("duration_minutes")
            .and_then(Value::as_i64)
            .filter(|minutes| *minutes > 0)
            .unwrap_or(DEFAULT_TRANSCRIBE_MINUTES)
    }
}

#[async_trait]
impl Adapter for SpeechAdapter {
    async fn quote(&self, body: &Value) -> Result<Quote, AdapterError> {
        match self.mode {
            Mode::Speak => {
                required_str(body, "text")?;
            }
            Mode::Transcribe => {
                required_str(body, "audio_url")?;
            }
        }

        let price = priced(&self.deps, &self.service.slug, self.operation()).await?;

        let quoted_sats = match price.unit {
            PriceUnit::PerMinute => Self::quoted_minutes(body) * price.price_sats,
            _ => price.price_sats,
        };

        Ok(Quote {
            operation: self.operation().to_string(),
            quoted_sats,
        })
    }

    async fn execute(&self, body: &Value) -> Result<UpstreamResponse, AdapterError> {
        let (path, upstream_body) = match self.mode {
            Mode::Speak => (
                "v1/text-to-speech",
                json!({
                    "text": required_str(body, "text")?,
                    "voice": body.get("voice"),
                }),
            ),
            Mode::Transcribe => (
                "v1/listen",
                json!({
                    "url": required_str(body, "audio_url")?,
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

    fn finalize(&self, response: &UpstreamResponse, quoted_sats: i64) -> i64 {
        if self.mode == Mode::Speak {
            return quoted_sats;
        }

        let duration_secs = response
            .data
            .get("metadata")
            .and_then(|metadata| metadata.get("duration"))
            .and_then(Value::as_f64);

        let price = self.deps.pricing.cached(&self.service.slug, self.operation());

        match (duration_secs, price) {
            (Some(secs), Some(price)) if price.unit == PriceUnit::PerMinute && secs >= 0.0 => {
                let minutes = ceil_div(secs.ceil() as i64, 60).max(1);

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
    async fn transcription_quotes_stated_minutes_and_bills_actual() {
        let (_dir, db) = test_database();

        let service =
            priced_service(&db, "deepgram", TRANSCRIBE_OPERATION, PriceUnit::PerMinute, 6).await;

        let upstream = Arc::new(StubUpstream::ok(Value::Null));

        let (_, deps) = deps_with(&db, upstream).await;

        let adapter = SpeechAdapter::transcribe(service, deps);

        let body = json!({"audio_url": "https://example.com/a.mp3", "duration_minutes": 10});

        let quote = adapter.quote(&body).await.unwrap();

        assert_eq!(quote.quoted_sats, 60);

        // 130 seconds of audio rounds up to 3 minutes
        let response = UpstreamResponse {
            status: 200,
            data: json!({"metadata": {"duration": 130.0}}),
        };

        assert_eq!(adapter.finalize(&response, quote.quoted_sats), 18);

        // Missing duration falls back to the quote
        let response = UpstreamResponse {
            status: 200,
            data: json!({}),
        };

        assert_eq!(adapter.finalize(&response, quote.quoted_sats), 60);
    }

    #[tokio::test]
    async fn speak_is_flat_rate() {
        let (_dir, db) = test_database();

        let service =
            priced_service(&db, "elevenlabs", SPEAK_OPERATION, PriceUnit::PerRequest, 40).await;

        let upstream = Arc::new(StubUpstream::ok(Value::Null));

        let (_, deps) = deps_with(&db, upstream).await;

        let adapter = SpeechAdapter::speak(service, deps);

        assert!(matches!(
            adapter.quote(&json!({})).await.unwrap_err(),
            AdapterError::Validation(..)
        ));

        let quote = adapter.quote(&json!({"text": "hello"})).await.unwrap();

        assert_eq!(quote.quoted_sats, 40);
    }
}
