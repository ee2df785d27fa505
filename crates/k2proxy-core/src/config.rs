use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Canonical upstream endpoints. Overridable for staging deployments
/// or for pointing the proxy at a mock during tests.
pub const DEFAULT_CHAT_URL: &str = "https://www.k2think.ai/api/guest/chat/completions";
/// Sign-in endpoint used by the token refresher. The response carries the
/// bearer token in its `token` field; nothing else is read from it.
pub const DEFAULT_LOGIN_URL: &str = "https://www.k2think.ai/api/v1/auths/signin";
pub const DEFAULT_MODEL_ID: &str = "MBZUAI-IFM/K2-Think";

/// Top-level config (k2proxy.toml + K2PROXY_* env overrides).
///
/// Flat by design: every recognized option is a single key, so an env
/// override is always `K2PROXY_<OPTION>` with no section separator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client key checked in strict mode. Ignored when `allow_any_api_key`.
    pub valid_api_key: Option<String>,
    /// Permissive mode: accept any (or no) Authorization header.
    #[serde(default)]
    pub allow_any_api_key: bool,

    #[serde(default = "default_chat_url")]
    pub upstream_chat_url: String,
    #[serde(default = "default_login_url")]
    pub upstream_login_url: String,
    #[serde(default = "default_model_id")]
    pub upstream_model_id: String,
    /// When true, every request goes upstream under `upstream_model_id`
    /// regardless of the client's `model` field.
    #[serde(default = "bool_true")]
    pub model_override: bool,

    #[serde(default = "default_tokens_file")]
    pub tokens_file: String,
    #[serde(default = "default_accounts_file")]
    pub accounts_file: String,
    #[serde(default = "default_max_failures")]
    pub max_token_failures: u32,

    #[serde(default)]
    pub enable_token_auto_update: bool,
    #[serde(default = "default_update_interval")]
    pub token_update_interval_seconds: u64,

    #[serde(default = "bool_true")]
    pub tool_support: bool,
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
    #[serde(default = "bool_true")]
    pub output_thinking: bool,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_login_timeout")]
    pub login_timeout_seconds: u64,

    #[serde(default)]
    pub debug_logging: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            valid_api_key: None,
            allow_any_api_key: false,
            upstream_chat_url: default_chat_url(),
            upstream_login_url: default_login_url(),
            upstream_model_id: default_model_id(),
            model_override: true,
            tokens_file: default_tokens_file(),
            accounts_file: default_accounts_file(),
            max_token_failures: default_max_failures(),
            enable_token_auto_update: false,
            token_update_interval_seconds: default_update_interval(),
            tool_support: true,
            scan_limit: default_scan_limit(),
            output_thinking: true,
            request_timeout_seconds: default_request_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            login_timeout_seconds: default_login_timeout(),
            debug_logging: false,
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_chat_url() -> String {
    DEFAULT_CHAT_URL.to_string()
}
fn default_login_url() -> String {
    DEFAULT_LOGIN_URL.to_string()
}
fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}
fn default_tokens_file() -> String {
    "tokens.txt".to_string()
}
fn default_accounts_file() -> String {
    "accounts.txt".to_string()
}
fn default_max_failures() -> u32 {
    3
}
fn default_update_interval() -> u64 {
    3600
}
fn default_scan_limit() -> usize {
    200_000
}
fn default_request_timeout() -> u64 {
    120
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_login_timeout() -> u64 {
    30
}
fn bool_true() -> bool {
    true
}

impl ProxyConfig {
    /// Load config from a TOML file with K2PROXY_* env var overrides.
    ///
    /// A missing file is not an error — defaults plus env cover the
    /// common container deployment where everything arrives via env.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("k2proxy.toml");

        let config: ProxyConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("K2PROXY_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Startup-time checks that cannot be expressed as serde defaults.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.upstream_chat_url.is_empty() {
            return Err(crate::error::CoreError::Config(
                "upstream_chat_url must not be empty".to_string(),
            ));
        }
        if self.enable_token_auto_update && self.upstream_login_url.is_empty() {
            return Err(crate::error::CoreError::Config(
                "upstream_login_url is required when enable_token_auto_update is set".to_string(),
            ));
        }
        if !self.allow_any_api_key && self.valid_api_key.is_none() {
            return Err(crate::error::CoreError::Config(
                "valid_api_key is required unless allow_any_api_key is set".to_string(),
            ));
        }
        if self.max_token_failures == 0 {
            return Err(crate::error::CoreError::Config(
                "max_token_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
