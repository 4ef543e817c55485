//! API key authentication.
//!
//! Every request (except `/health`) must carry the configured API key in the
//! configured header. When no key is configured, authentication is disabled;
//! deployments are expected to set one.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use super::error::ApiError;
use super::state::AppState;
use crate::error::Error;

/// Extractor that rejects requests without a valid API key.
///
/// # Example
///
/// ```rust,ignore
/// async fn protected(_auth: RequireApiKey) -> impl IntoResponse { ... }
/// ```
pub struct RequireApiKey;

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        check_api_key(
            &parts.headers,
            &state.config.server.api_key_header,
            state.config.server.api_key.as_deref(),
        )
        .map_err(ApiError)?;
        Ok(RequireApiKey)
    }
}

/// Validates the API key header against the configured key.
fn check_api_key(
    headers: &HeaderMap,
    header_name: &str,
    expected: Option<&str>,
) -> Result<(), Error> {
    let Some(expected) = expected else {
        // No key configured: authentication disabled.
        return Ok(());
    };

    let supplied = headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Auth(format!("missing '{}' header", header_name)))?;

    if supplied == expected {
        Ok(())
    } else {
        Err(Error::Auth("invalid api key".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn disabled_when_no_key_configured() {
        assert!(check_api_key(&headers(&[]), "X-API-KEY", None).is_ok());
    }

    #[test]
    fn accepts_matching_key() {
        let headers = headers(&[("X-API-KEY", "np_secret")]);
        assert!(check_api_key(&headers, "X-API-KEY", Some("np_secret")).is_ok());
    }

    #[test]
    fn rejects_missing_or_wrong_key() {
        assert!(check_api_key(&headers(&[]), "X-API-KEY", Some("np_secret")).is_err());

        let wrong = headers(&[("X-API-KEY", "other")]);
        assert!(check_api_key(&wrong, "X-API-KEY", Some("np_secret")).is_err());
    }

    #[test]
    fn header_name_is_configurable() {
        let headers = headers(&[("Authorization-Token", "np_secret")]);
        assert!(check_api_key(&headers, "Authorization-Token", Some("np_secret")).is_ok());
        assert!(check_api_key(&headers, "X-API-KEY", Some("np_secret")).is_err());
    }
}
