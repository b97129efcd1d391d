use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};

use toll_daemon_db::models::ServiceRecord;

use super::{
    Adapter, AdapterDeps, AdapterError, Quote, UpstreamRequest, UpstreamResponse, credentials,
    ensure_success, join_url, priced, required_str,
};

const OPERATION: &str = "imagine";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(50);

/// Image generation behind the `imagine` verb. The upstream job is
/// asynchronous: execute submits a prediction and polls it to a terminal
/// state, sleeping between ticks so the worker is never pinned.
pub struct ImageAdapter {
    service: ServiceRecord,
    deps: AdapterDeps,
    poll_interval: Duration,
    poll_deadline: Duration,
}

impl ImageAdapter {
    pub fn new(service: ServiceRecord, deps: AdapterDeps) -> Self {
        Self {
            service,
            deps,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_deadline: DEFAULT_POLL_DEADLINE,
        }
    }

    pub fn with_polling(mut self, interval: Duration, deadline: Duration) -> Self {
        self.poll_interval = interval;

        self.poll_deadline = deadline;

        self
    }

    fn authorized(&self, mut request: UpstreamRequest) -> Result<UpstreamRequest, AdapterError> {
        credentials::authorize(
            &self.service.auth_type,
            &self.service.auth_credential_env,
            &mut request,
        )?;

        Ok(request)
    }
}

fn job_status(data: &Value) -> &str {
    data.get("status").and_then(Value::as_str).unwrap_or("unknown")
}

#[async_trait]
impl Adapter for ImageAdapter {
    async fn quote(&self, body: &Value) -> Result<Quote, AdapterError> {
        required_str(body, "prompt")?;

        let price = priced(&self.deps, &self.service.slug, OPERATION).await?;

        Ok(Quote {
            operation: OPERATION.to_string(),
            quoted_sats: price.price_sats,
        })
    }

    async fn execute(&self, body: &Value) -> Result<UpstreamResponse, AdapterError> {
        let prompt = required_str(body, "prompt")?;

        let upstream_body = json!({
            "input": {
                "prompt": prompt,
            },
        });

        let url = join_url(&self.service.base_url, "v1/predictions")?;

        let request = self.authorized(UpstreamRequest::post(url, upstream_body))?;

        let mut response = ensure_success(self.deps.upstream.send(request).await?)?;

        let job_id = response
            .data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Upstream("Prediction response had no id".to_string()))?
            .to_string();

        let started = Instant::now();

        loop {
            match job_status(&response.data) {
                "succeeded" => return Ok(response),
                "failed" | "canceled" => {
                    return Err(AdapterError::Upstream(format!(
                        "Prediction {} ended as '{}'",
                        job_id,
                        job_status(&response.data)
                    )));
                }
                _ => {}
            }

            if started.elapsed() >= self.poll_deadline {
                return Err(AdapterError::Upstream(format!(
                    "Prediction {job_id} did not finish before the deadline"
                )));
            }

            tokio::time::sleep(self.poll_interval).await;

            let url = join_url(&self.service.base_url, &format!("v1/predictions/{job_id}"))?;

            let request = self.authorized(UpstreamRequest::get(url))?;

            response = ensure_success(self.deps.upstream.send(request).await?)?;
        }
    }

    fn finalize(&self, _response: &UpstreamResponse, quoted_sats: i64) -> i64 {
        quoted_sats
    }
}
