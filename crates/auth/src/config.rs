// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};

/// Configuration for the coopauth token broker.
#[derive(Debug, Clone, clap::Args)]
pub struct AuthConfig {
    /// Host the callback listener binds on.
    #[arg(long, default_value = "127.0.0.1", env = "COOP_AUTH_HOST")]
    pub host: String,

    /// Fixed callback listener port (must match the registered redirect URI).
    #[arg(long, default_value_t = 8400, env = "COOP_AUTH_PORT")]
    pub port: u16,

    /// Path the provider redirects to.
    #[arg(long, default_value = "/callback", env = "COOP_AUTH_CALLBACK_PATH")]
    pub callback_path: String,

    /// Path to a provider configuration JSON file. Its values fill in unset flags.
    #[arg(long, env = "COOP_AUTH_PROVIDER_CONFIG")]
    pub provider_config: Option<PathBuf>,

    /// OAuth client ID.
    #[arg(long, env = "COOP_AUTH_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret (confidential clients only).
    #[arg(long, env = "COOP_AUTH_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Provider authorization endpoint.
    #[arg(long, env = "COOP_AUTH_AUTHORIZE_URL")]
    pub authorize_url: Option<String>,

    /// Provider token endpoint.
    #[arg(long, env = "COOP_AUTH_TOKEN_URL")]
    pub token_url: Option<String>,

    /// Optional userinfo endpoint, used when the token response has no `id_token`.
    #[arg(long, env = "COOP_AUTH_USERINFO_URL")]
    pub userinfo_url: Option<String>,

    /// Space-separated OAuth scopes.
    #[arg(long, env = "COOP_AUTH_SCOPES")]
    pub scopes: Option<String>,

    /// Redirect URI override. Defaults to `http://localhost:<port><callback_path>`.
    #[arg(long, env = "COOP_AUTH_REDIRECT_URI")]
    pub redirect_uri: Option<String>,

    /// Path of the JSON credential store.
    #[arg(long, env = "COOP_AUTH_STORE")]
    pub store_path: Option<PathBuf>,

    /// Interactive login window in seconds.
    #[arg(long, default_value_t = 120, env = "COOP_AUTH_LOGIN_TIMEOUT")]
    pub login_timeout_secs: u64,

    /// Credential store poll interval (external listener mode) in milliseconds.
    #[arg(long, default_value_t = 2000, env = "COOP_AUTH_POLL_MS")]
    pub poll_ms: u64,

    /// Evict sessions idle for longer than this many seconds.
    #[arg(long, default_value_t = 1800, env = "COOP_AUTH_IDLE_TIMEOUT")]
    pub idle_timeout_secs: u64,

    /// Idle-session sweep interval in seconds.
    #[arg(long, default_value_t = 60, env = "COOP_AUTH_SWEEP_INTERVAL")]
    pub sweep_interval_secs: u64,

    /// Treat tokens as expired this many seconds early.
    #[arg(long, default_value_t = 60, env = "COOP_AUTH_CLOCK_SKEW")]
    pub clock_skew_secs: u64,

    /// Refresh token lifetime when the provider does not report one, in seconds.
    #[arg(long, default_value_t = 90 * 24 * 3600, env = "COOP_AUTH_MAX_REFRESH_LIFETIME")]
    pub max_refresh_lifetime_secs: u64,

    /// Seconds an unanswered authorization attempt stays valid.
    #[arg(long, default_value_t = 600, env = "COOP_AUTH_ATTEMPT_TTL")]
    pub attempt_ttl_secs: u64,

    /// Do not launch a browser; only print the authorization URL.
    #[arg(long, env = "COOP_AUTH_NO_BROWSER")]
    pub no_browser: bool,

    /// Log filter (tracing `EnvFilter` syntax).
    #[arg(long, default_value = "info", env = "COOP_AUTH_LOG_LEVEL")]
    pub log_level: String,

    /// Log format: `text` or `json`.
    #[arg(long, default_value = "text", env = "COOP_AUTH_LOG_FORMAT")]
    pub log_format: String,
}

/// Provider registration loaded from `--provider-config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderFile {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub authorize_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub userinfo_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Extra query parameters appended to the authorization URL (e.g. `prompt`).
    #[serde(default)]
    pub extra_auth_params: Vec<(String, String)>,
}

/// Resolved identity-provider settings used by the exchanger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: Option<String>,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    pub extra_auth_params: Vec<(String, String)>,
}

impl ProviderConfig {
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }
}

impl AuthConfig {
    /// Check that values the binary cannot recover from are sane.
    pub fn validate(&self) -> AuthResult<()> {
        if self.login_timeout_secs == 0 {
            return Err(AuthError::Config("login timeout must be non-zero".into()));
        }
        if self.poll_ms == 0 {
            return Err(AuthError::Config("poll interval must be non-zero".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(AuthError::Config("sweep interval must be non-zero".into()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(AuthError::Config("idle timeout must be non-zero".into()));
        }
        if !self.callback_path.starts_with('/') {
            return Err(AuthError::Config(format!(
                "callback path must start with '/': {}",
                self.callback_path
            )));
        }
        match self.log_format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(AuthError::Config(format!("invalid log format: {other}"))),
        }
    }

    /// Merge flags with the optional provider file into a complete provider config.
    ///
    /// Flags win over file values.
    pub fn provider(&self) -> AuthResult<ProviderConfig> {
        let file = match self.provider_config {
            Some(ref path) => load_provider_file(path)?,
            None => ProviderFile::default(),
        };

        let client_id = self
            .client_id
            .clone()
            .or(file.client_id)
            .ok_or_else(|| AuthError::Config("no client_id configured".into()))?;
        let authorize_url = self
            .authorize_url
            .clone()
            .or(file.authorize_url)
            .ok_or_else(|| AuthError::Config("no authorize_url configured".into()))?;
        let token_url = self
            .token_url
            .clone()
            .or(file.token_url)
            .ok_or_else(|| AuthError::Config("no token_url configured".into()))?;
        let scopes = match self.scopes {
            Some(ref s) => s.split_whitespace().map(str::to_owned).collect(),
            None => file.scopes,
        };
        let redirect_uri = self
            .redirect_uri
            .clone()
            .or(file.redirect_uri)
            .unwrap_or_else(|| self.callback_url());

        Ok(ProviderConfig {
            client_id,
            client_secret: self.client_secret.clone().or(file.client_secret),
            authorize_url,
            token_url,
            userinfo_url: self.userinfo_url.clone().or(file.userinfo_url),
            scopes,
            redirect_uri,
            extra_auth_params: file.extra_auth_params,
        })
    }

    /// Local URL the listener serves callbacks on.
    pub fn callback_url(&self) -> String {
        format!("http://localhost:{}{}", self.port, self.callback_path)
    }

    /// Credential store location.
    ///
    /// Checks `--store-path`, then `$XDG_STATE_HOME/coop/auth`, then
    /// `$HOME/.local/state/coop/auth`.
    pub fn store_path(&self) -> PathBuf {
        if let Some(ref path) = self.store_path {
            return path.clone();
        }
        if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
            return PathBuf::from(xdg).join("coop/auth/credentials.json");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/state/coop/auth/credentials.json");
        }
        PathBuf::from(".coop/auth/credentials.json")
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }

    pub fn max_refresh_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_refresh_lifetime_secs)
    }

    pub fn attempt_ttl(&self) -> Duration {
        Duration::from_secs(self.attempt_ttl_secs)
    }
}

fn load_provider_file(path: &Path) -> AuthResult<ProviderFile> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| AuthError::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&contents)
        .map_err(|e| AuthError::Config(format!("cannot parse {}: {e}", path.display())))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
