//! HTTP client for the K2-Think upstream: the chat endpoint used by the
//! dispatcher and the sign-in exchange used by the token refresher.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use k2proxy_core::ProxyConfig;
use k2proxy_pool::refresher::AccountLogin;
use k2proxy_pool::store::AccountRecord;
use k2proxy_pool::PoolError;

use crate::error::{RelayError, Result};

/// Shared client to the upstream. One per process; reqwest pools the
/// underlying connections.
pub struct UpstreamClient {
    http: reqwest::Client,
    chat_url: String,
    login_url: String,
    login_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            chat_url: config.upstream_chat_url.clone(),
            login_url: config.upstream_login_url.clone(),
            login_timeout: Duration::from_secs(config.login_timeout_seconds),
        })
    }

    /// Forward a chat body under the given bearer token and hand back the
    /// (streaming) response. 401/403 become `TokenRejected` so the dispatch
    /// loop can account the failure and move to the next token; any other
    /// non-success status is a terminal `Api` error.
    pub async fn chat(&self, token: &str, body: &Value) -> Result<reqwest::Response> {
        debug!(url = %self.chat_url, "forwarding chat request upstream");
        let resp = self
            .http
            .post(&self.chat_url)
            .bearer_auth(token)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "upstream rejected token");
            return Err(RelayError::TokenRejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "upstream API error");
            return Err(RelayError::Api {
                status: status.as_u16(),
                message: text,
            });
        }
        Ok(resp)
    }

    /// Sign in with account credentials and return a fresh bearer token.
    /// The response carries it in the `token` field; nothing else is read.
    /// Uses its own shorter timeout so a slow login never stalls requests.
    pub async fn login(&self, email: &str, password: &str) -> Result<String> {
        debug!(url = %self.login_url, %email, "upstream sign-in");
        let resp = self
            .http
            .post(&self.login_url)
            .timeout(self.login_timeout)
            .header("content-type", "application/json")
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RelayError::Api {
                status,
                message: text,
            });
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Parse(e.to_string()))?;
        value
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RelayError::Parse("sign-in response has no token field".to_string()))
    }
}

fn classify_send_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout
    } else {
        RelayError::Transport(e)
    }
}

/// Well-known auth tags the upstream puts in an otherwise-OK body when a
/// bearer has expired. HTTP 401/403 remain the authoritative signal.
pub fn body_signals_auth_failure(value: &Value) -> bool {
    if value
        .get("detail")
        .and_then(Value::as_str)
        .is_some_and(|d| d.eq_ignore_ascii_case("unauthorized"))
    {
        return true;
    }
    matches!(
        value.pointer("/error/code").and_then(Value::as_str),
        Some("invalid_api_key" | "unauthorized" | "token_expired")
    )
}

#[async_trait]
impl AccountLogin for UpstreamClient {
    async fn login(&self, account: &AccountRecord) -> k2proxy_pool::Result<String> {
        UpstreamClient::login(self, &account.email, &account.password)
            .await
            .map_err(|e| PoolError::Login {
                email: account.email.clone(),
                reason: e.to_string(),
            })
    }
}
