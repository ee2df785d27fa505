use axum::http::{header::AUTHORIZATION, HeaderMap};

use k2proxy_core::ProxyConfig;

use crate::error::ApiError;

/// Client key check. Permissive mode accepts anything, including a missing
/// header; strict mode requires `Authorization: Bearer <valid_api_key>`.
pub fn check_client_auth(headers: &HeaderMap, config: &ProxyConfig) -> Result<(), ApiError> {
    if config.allow_any_api_key {
        return Ok(());
    }
    let expected = config
        .valid_api_key
        .as_deref()
        .ok_or_else(|| ApiError::Auth("no API key configured".to_string()))?;

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(key) if key == expected => Ok(()),
        _ => Err(ApiError::Auth("invalid API key".to_string())),
    }
}
