use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{info, warn};

use crate::{AppState, settler};

use super::ApiError;

const SIGNATURE_HEADER: &str = "x-checkout-signature";

/// Card-processor webhook. The body is authenticated with an HMAC over the
/// raw bytes before any parsing happens.
#[axum::debug_handler]
pub async fn checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = state
        .args
        .checkout_webhook_secret
        .as_deref()
        .ok_or_else(ApiError::unauthorized)?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;

    if !verify_signature(secret, &body, signature) {
        warn!("checkout webhook with a bad signature");

        return Err(ApiError::unauthorized());
    }

    let event: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::validation("Webhook body is not JSON"))?;

    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");

    if event_type != "checkout.completed" {
        info!(?event_type, "ignoring checkout webhook event");

        return Ok(Json(json!({ "received": true })));
    }

    let session_id = event
        .get("data")
        .and_then(|data| data.get("session_id"))
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::validation("Webhook event has no session_id"))?;

    settler::apply_completed_checkout(&state, session_id)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(json!({ "received": true })))
}

/// Timing-safe HMAC-SHA256 check of the hex signature header
pub fn verify_signature(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");

    mac.update(payload);

    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();

        mac.update(payload);

        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_a_valid_signature() {
        let payload = br#"{"type":"checkout.completed"}"#;

        let signature = sign("webhook-secret", payload);

        assert!(verify_signature("webhook-secret", payload, &signature));
    }

    #[test]
    fn rejects_tampering_and_garbage() {
        let payload = br#"{"type":"checkout.completed"}"#;

        let signature = sign("webhook-secret", payload);

        assert!(!verify_signature("webhook-secret", b"{}", &signature));

        assert!(!verify_signature("other-secret", payload, &signature));

        assert!(!verify_signature("webhook-secret", payload, "zz-not-hex"));

        assert!(!verify_signature("webhook-secret", payload, ""));
    }
}
