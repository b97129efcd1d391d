//! Minimal LND REST client: invoice creation and the settled-invoice
//! subscription stream. The node is an external collaborator; only the two
//! endpoints the settler needs are wrapped.

use std::path::Path;

use anyhow::{Context, Result, ensure};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{Stream, StreamExt, TryStreamExt};
use lightning_invoice::Bolt11Invoice;
use serde_json::{Value, json};
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;
use url::Url;

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

pub struct LndClient {
    base_url: Url,
    macaroon_hex: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub payment_request: String,
    pub r_hash_hex: String,
}

#[derive(Debug, Clone)]
pub struct SettledEvent {
    pub r_hash_hex: String,
    pub amount_paid_sats: i64,
}

impl LndClient {
    pub fn new(base_url: Url, macaroon_path: &Path, accept_invalid_certs: bool) -> Result<Self> {
        let macaroon =
            std::fs::read(macaroon_path).context("Failed to read the LND macaroon file")?;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .context("Failed to build the LND HTTP client")?;

        Ok(Self {
            base_url,
            macaroon_hex: hex::encode(macaroon),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("Invalid LND endpoint url")
    }

    pub async fn add_invoice(
        &self,
        amount_sats: i64,
        memo: &str,
        expiry_secs: u32,
    ) -> Result<CreatedInvoice> {
        let response = self
            .client
            .post(self.endpoint("v1/invoices")?)
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .json(&json!({
                "value": amount_sats.to_string(),
                "memo": memo,
                "expiry": expiry_secs.to_string(),
            }))
            .send()
            .await
            .context("LND invoice request failed")?
            .error_for_status()
            .context("LND rejected the invoice request")?
            .json::<Value>()
            .await
            .context("LND invoice response was not JSON")?;

        let payment_request = response
            .get("payment_request")
            .and_then(Value::as_str)
            .context("LND response had no payment_request")?
            .to_string();

        // The parsed invoice is authoritative for amount and payment hash
        let invoice = payment_request
            .parse::<Bolt11Invoice>()
            .map_err(|e| anyhow::anyhow!("LND returned an unparseable invoice: {e}"))?;

        ensure!(
            invoice.amount_milli_satoshis() == Some(amount_sats as u64 * 1_000),
            "LND invoice amount does not match the requested amount"
        );

        Ok(CreatedInvoice {
            r_hash_hex: invoice.payment_hash().to_string(),
            payment_request,
        })
    }

    /// Long-lived line-delimited JSON stream of invoice updates, filtered
    /// down to settle events
    pub async fn subscribe_settled(
        &self,
    ) -> Result<impl Stream<Item = Result<SettledEvent>> + Send + use<>> {
        let response = self
            .client
            .get(self.endpoint("v1/invoices/subscribe")?)
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .send()
            .await
            .context("LND subscribe request failed")?
            .error_for_status()
            .context("LND rejected the subscribe request")?;

        let reader = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));

        let lines = LinesStream::new(reader.lines());

        Ok(lines.filter_map(|line| async move {
            let line = match line {
                Ok(line) => line,
                Err(error) => return Some(Err(anyhow::anyhow!("Invoice stream error: {error}"))),
            };

            if line.trim().is_empty() {
                return None;
            }

            match serde_json::from_str::<Value>(&line) {
                Ok(value) => parse_settled(&value).map(Ok),
                Err(error) => Some(Err(anyhow::anyhow!("Invalid invoice event: {error}"))),
            }
        }))
    }
}

/// LND wraps each streamed message as `{"result": {...invoice...}}`; only
/// SETTLED states are of interest
fn parse_settled(value: &Value) -> Option<SettledEvent> {
    let invoice = value.get("result")?;

    if invoice.get("state")?.as_str()? != "SETTLED" {
        return None;
    }

    let r_hash_hex = hex::encode(BASE64.decode(invoice.get("r_hash")?.as_str()?).ok()?);

    let amount_paid_sats = invoice
        .get("amt_paid_sat")
        .and_then(|v| v.as_str().and_then(|s| s.parse::<i64>().ok()).or_else(|| v.as_i64()))
        .unwrap_or(0);

    Some(SettledEvent {
        r_hash_hex,
        amount_paid_sats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_settled_events_and_ignores_the_rest() {
        let r_hash = BASE64.encode([0xab; 32]);

        let settled = json!({
            "result": {
                "state": "SETTLED",
                "r_hash": r_hash,
                "amt_paid_sat": "1000",
            }
        });

        let event = parse_settled(&settled).unwrap();

        assert_eq!(event.r_hash_hex, "ab".repeat(32));

        assert_eq!(event.amount_paid_sats, 1_000);

        let open = json!({"result": {"state": "OPEN", "r_hash": BASE64.encode([1u8; 32])}});

        assert!(parse_settled(&open).is_none());

        assert!(parse_settled(&json!({"unexpected": true})).is_none());
    }

    #[test]
    fn amt_paid_accepts_both_json_shapes() {
        let numeric = json!({
            "result": {
                "state": "SETTLED",
                "r_hash": BASE64.encode([2u8; 32]),
                "amt_paid_sat": 750,
            }
        });

        assert_eq!(parse_settled(&numeric).unwrap().amount_paid_sats, 750);
    }
}
