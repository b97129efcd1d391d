//! Credential loading for adapters. Dynamic env lookup is the one place a
//! hostile service descriptor could read arbitrary daemon secrets, so the
//! env name must match the allowlisted credential naming pattern.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::{AdapterError, UpstreamRequest};

pub const AUTH_TYPES: [&str; 4] = ["bearer", "api_key_header", "basic", "query_param"];

const ALLOWED_SUFFIXES: [&str; 4] = ["_API_KEY", "_API_TOKEN", "_SECRET", "_TOKEN"];

/// Matches `^[A-Z][A-Z0-9_]*_(API_KEY|API_TOKEN|SECRET|TOKEN)$`
pub fn allowlisted(env_name: &str) -> bool {
    let starts_upper = env_name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_uppercase());

    let charset_ok = env_name
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');

    starts_upper
        && charset_ok
        && ALLOWED_SUFFIXES
            .iter()
            .any(|suffix| env_name.len() > suffix.len() && env_name.ends_with(suffix))
}

pub fn load(env_name: &str) -> Result<String, AdapterError> {
    if !allowlisted(env_name) {
        return Err(AdapterError::Validation(format!(
            "Credential env '{env_name}' is not allowlisted"
        )));
    }

    std::env::var(env_name).map_err(|_| {
        AdapterError::Upstream(format!("Credential env '{env_name}' is not configured"))
    })
}

/// Injects the service credential into an outbound request per auth type
pub fn authorize(
    auth_type: &str,
    env_name: &str,
    request: &mut UpstreamRequest,
) -> Result<(), AdapterError> {
    let credential = load(env_name)?;

    match auth_type {
        "bearer" => request.headers.push((
            "Authorization".to_string(),
            format!("Bearer {credential}"),
        )),
        "api_key_header" => request.headers.push(("X-API-Key".to_string(), credential)),
        "basic" => request.headers.push((
            "Authorization".to_string(),
            format!("Basic {}", BASE64.encode(credential)),
        )),
        "query_param" => request.query.push(("api_key".to_string(), credential)),
        other => {
            return Err(AdapterError::Validation(format!(
                "Unknown auth type '{other}'"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use url::Url;

    #[test]
    fn allowlist_accepts_credential_names() {
        for name in [
            "OPENROUTER_API_KEY",
            "REPLICATE_API_TOKEN",
            "TWILIO_TOKEN",
            "CHECKOUT_SECRET",
            "A1_SERVICE_API_KEY",
        ] {
            assert!(allowlisted(name), "{name} should be allowlisted");
        }
    }

    #[test]
    fn allowlist_rejects_daemon_secrets() {
        for name in [
            "DATABASE_URL",
            "LND_MACAROON",
            "PATH",
            "HOME",
            "_API_KEY",
            "lower_api_key",
            "BAD-NAME_API_KEY",
            "",
        ] {
            assert!(!allowlisted(name), "{name} should be rejected");
        }
    }

    #[test]
    fn authorize_injects_per_auth_type() {
        // set_var is process-global; the name is unique to this test
        unsafe { std::env::set_var("CRED_TEST_API_KEY", "s3cret") };

        let url = Url::parse("https://api.example.com/x").unwrap();

        let mut request = UpstreamRequest::get(url.clone());

        authorize("bearer", "CRED_TEST_API_KEY", &mut request).unwrap();

        assert_eq!(
            request.headers[0],
            ("Authorization".to_string(), "Bearer s3cret".to_string())
        );

        let mut request = UpstreamRequest::get(url.clone());

        authorize("query_param", "CRED_TEST_API_KEY", &mut request).unwrap();

        assert_eq!(
            request.query[0],
            ("api_key".to_string(), "s3cret".to_string())
        );

        let mut request = UpstreamRequest::get(url);

        let error = authorize("bearer", "DATABASE_URL", &mut request).unwrap_err();

        assert!(matches!(error, AdapterError::Validation(..)));
    }

    #[test]
    fn missing_credential_is_an_upstream_error() {
        let mut request = UpstreamRequest::get(Url::parse("https://api.example.com/x").unwrap());

        let error = authorize("bearer", "NEVER_SET_ANYWHERE_API_KEY", &mut request).unwrap_err();

        assert!(matches!(error, AdapterError::Upstream(..)));
    }
}
