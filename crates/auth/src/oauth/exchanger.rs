// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token exchanger: authorization URLs, code exchange, refresh, expiry math.
//!
//! Holds no per-user state beyond the table of outstanding authorization
//! attempts. Everything durable goes through the [`CredentialStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::{AuthError, AuthResult};
use crate::oauth::identity::discover_user;
use crate::oauth::pkce::{self, Pkce};
use crate::oauth::{AuthorizationAttempt, TokenErrorResponse, TokenResponse};
use crate::store::{epoch_ms, CredentialRecord, CredentialStore};

/// Default margin subtracted from expiry timestamps.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Default refresh token lifetime when the provider does not report one.
pub const DEFAULT_MAX_REFRESH_LIFETIME: Duration = Duration::from_secs(90 * 24 * 3600);

/// Default lifetime of an unanswered authorization attempt.
pub const DEFAULT_ATTEMPT_TTL: Duration = Duration::from_secs(600);

/// Outstanding attempts kept at once; the oldest is dropped beyond this.
pub const MAX_PENDING_ATTEMPTS: usize = 16;

/// Expiry rules shared by the exchanger and the session cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// Tokens count as expired this long before their stated expiry.
    pub clock_skew: Duration,
    /// Refresh token lifetime when the provider does not report one.
    pub max_refresh_lifetime: Duration,
    /// How long a `begin()` attempt stays redeemable.
    pub attempt_ttl: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            clock_skew: DEFAULT_CLOCK_SKEW,
            max_refresh_lifetime: DEFAULT_MAX_REFRESH_LIFETIME,
            attempt_ttl: DEFAULT_ATTEMPT_TTL,
        }
    }
}

impl ExpiryPolicy {
    /// Whether an access token expiring at `expires_at_ms` is unusable at `now_ms`.
    ///
    /// `0` means no expiry.
    pub fn is_expired_at(&self, expires_at_ms: u64, now_ms: u64) -> bool {
        if expires_at_ms == 0 {
            return false;
        }
        now_ms.saturating_add(self.clock_skew.as_millis() as u64) >= expires_at_ms
    }

    pub fn is_expired(&self, record: &CredentialRecord, now_ms: u64) -> bool {
        self.is_expired_at(record.expires_at_ms, now_ms)
    }

    /// Whether the record's refresh token has outlived its own validity window.
    ///
    /// Records without a stored refresh deadline fall back to
    /// `created_at + max_refresh_lifetime`.
    pub fn is_refresh_expired(&self, record: &CredentialRecord, now_ms: u64) -> bool {
        let deadline = record.refresh_expires_at_ms.unwrap_or_else(|| {
            record.created_at_ms.saturating_add(self.max_refresh_lifetime.as_millis() as u64)
        });
        now_ms.saturating_add(self.clock_skew.as_millis() as u64) >= deadline
    }

    fn refresh_deadline(&self, token: &TokenResponse, now_ms: u64) -> u64 {
        let lifetime_ms = token
            .refresh_token_expires_in
            .map(|s| s.saturating_mul(1000))
            .unwrap_or(self.max_refresh_lifetime.as_millis() as u64);
        now_ms.saturating_add(lifetime_ms)
    }
}

/// Result of a successful refresh or validity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_at_ms: u64,
}

/// Builds authorization URLs, exchanges codes and refreshes tokens.
pub struct TokenExchanger {
    provider: ProviderConfig,
    policy: ExpiryPolicy,
    store: Arc<dyn CredentialStore>,
    http: reqwest::Client,
    /// Outstanding attempts keyed by `state`.
    attempts: Mutex<HashMap<String, AuthorizationAttempt>>,
}

impl TokenExchanger {
    pub fn new(
        provider: ProviderConfig,
        policy: ExpiryPolicy,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        crate::ensure_crypto();
        Self {
            provider,
            policy,
            store,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    pub fn policy(&self) -> &ExpiryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Start a new authorization attempt. Nothing is persisted.
    pub fn begin(&self) -> AuthorizationAttempt {
        let state = pkce::random_token();
        let Pkce { verifier: code_verifier, challenge } = Pkce::generate();
        let scope = self.provider.scope();
        let mut params = vec![
            ("response_type", "code"),
            ("client_id", self.provider.client_id.as_str()),
            ("redirect_uri", self.provider.redirect_uri.as_str()),
            ("scope", scope.as_str()),
            ("state", state.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ];
        params.extend(self.provider.extra_auth_params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let authorization_url = pkce::with_query(&self.provider.authorize_url, params);

        let attempt = AuthorizationAttempt {
            state: state.clone(),
            authorization_url,
            created_at: Instant::now(),
            code_verifier,
        };

        let mut attempts = self.attempts.lock();
        let ttl = self.policy.attempt_ttl;
        attempts.retain(|_, a| a.created_at.elapsed() < ttl);
        while attempts.len() >= MAX_PENDING_ATTEMPTS {
            let Some(oldest) =
                attempts.iter().min_by_key(|(_, a)| a.created_at).map(|(k, _)| k.clone())
            else {
                break;
            };
            attempts.remove(&oldest);
            debug!("dropped oldest pending authorization attempt");
        }
        attempts.insert(state, attempt.clone());
        debug!(pending = attempts.len(), "authorization attempt started");
        attempt
    }

    /// Number of attempts still waiting for a redirect.
    pub fn pending_attempts(&self) -> usize {
        let ttl = self.policy.attempt_ttl;
        self.attempts.lock().values().filter(|a| a.created_at.elapsed() < ttl).count()
    }

    /// Remove and return the attempt for `state`. Unknown, consumed or stale
    /// states are all `InvalidState`.
    fn take_attempt(&self, state: &str) -> AuthResult<AuthorizationAttempt> {
        let attempt = self.attempts.lock().remove(state).ok_or(AuthError::InvalidState)?;
        if attempt.created_at.elapsed() >= self.policy.attempt_ttl {
            warn!("authorization attempt expired before redirect arrived");
            return Err(AuthError::InvalidState);
        }
        Ok(attempt)
    }

    /// Exchange an authorization code for tokens and persist them.
    ///
    /// Returns the user id discovered from the token response.
    pub async fn exchange(&self, code: &str, state: &str) -> AuthResult<String> {
        let attempt = match self.take_attempt(state) {
            Ok(a) => a,
            Err(e) => {
                warn!("rejected redirect with unknown state (possible CSRF)");
                return Err(e);
            }
        };

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("client_id", self.provider.client_id.as_str()),
            ("code", code),
            ("redirect_uri", self.provider.redirect_uri.as_str()),
            ("code_verifier", attempt.code_verifier.as_str()),
        ];
        if let Some(ref secret) = self.provider.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let token = self.post_token(&form).await.map_err(|e| match e {
            EndpointError::Revoked(msg) | EndpointError::Rejected(msg) => {
                AuthError::ProviderError(msg)
            }
            EndpointError::Transient(msg) => AuthError::TransientError(msg),
        })?;

        let user_id = discover_user(&self.http, &token, self.provider.userinfo_url.as_deref()).await?;

        let now = epoch_ms();
        let created_at_ms = match self.store.get_token(&user_id).await? {
            Some(existing) => existing.created_at_ms,
            None => now,
        };
        let refresh_expires_at_ms =
            token.refresh_token.as_ref().map(|_| self.policy.refresh_deadline(&token, now));
        let record = CredentialRecord {
            user_id: user_id.clone(),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at_ms: expires_at(token.expires_in, now),
            refresh_expires_at_ms,
            created_at_ms,
            updated_at_ms: now,
        };
        self.store.update_token(record).await?;

        info!(user = %user_id, "authorization code exchanged");
        Ok(user_id)
    }

    /// Mint a new access token from the stored refresh token.
    pub async fn refresh(&self, user_id: &str) -> AuthResult<RefreshedToken> {
        let record = self
            .store
            .get_token(user_id)
            .await?
            .ok_or_else(|| AuthError::NoToken(user_id.to_owned()))?;

        let Some(refresh_token) = record.refresh_token.clone() else {
            return Err(AuthError::ReauthRequired(format!("no refresh token stored for {user_id}")));
        };
        if self.policy.is_refresh_expired(&record, epoch_ms()) {
            info!(user = %user_id, "refresh token past its lifetime, re-authentication required");
            return Err(AuthError::ReauthRequired(format!("refresh token expired for {user_id}")));
        }

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.provider.client_id.as_str()),
            ("refresh_token", refresh_token.as_str()),
        ];
        let scope = self.provider.scope();
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }
        if let Some(ref secret) = self.provider.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let token = match self.post_token(&form).await {
            Ok(t) => t,
            Err(EndpointError::Revoked(msg)) => {
                warn!(user = %user_id, error = %msg, "refresh token revoked");
                return Err(AuthError::ReauthRequired(msg));
            }
            Err(EndpointError::Rejected(msg)) => return Err(AuthError::ProviderError(msg)),
            Err(EndpointError::Transient(msg)) => return Err(AuthError::TransientError(msg)),
        };

        let now = epoch_ms();
        let expires_at_ms = expires_at(token.expires_in, now);
        let (refresh_token, refresh_expires_at_ms) = match token.refresh_token {
            Some(ref rotated) => {
                (Some(rotated.clone()), Some(self.policy.refresh_deadline(&token, now)))
            }
            None => (record.refresh_token.clone(), record.refresh_expires_at_ms),
        };
        let updated = CredentialRecord {
            user_id: user_id.to_owned(),
            access_token: token.access_token.clone(),
            refresh_token,
            expires_at_ms,
            refresh_expires_at_ms,
            created_at_ms: record.created_at_ms,
            updated_at_ms: now,
        };
        self.store.update_token(updated).await?;

        info!(user = %user_id, "access token refreshed");
        Ok(RefreshedToken { access_token: token.access_token, expires_at_ms })
    }

    /// Return the stored access token if still valid, refreshing otherwise.
    pub async fn valid_access_token(&self, user_id: &str) -> AuthResult<RefreshedToken> {
        let record = self
            .store
            .get_token(user_id)
            .await?
            .ok_or_else(|| AuthError::NoToken(user_id.to_owned()))?;
        if !self.policy.is_expired(&record, epoch_ms()) {
            return Ok(RefreshedToken {
                access_token: record.access_token,
                expires_at_ms: record.expires_at_ms,
            });
        }
        debug!(user = %user_id, "stored access token expired, refreshing");
        self.refresh(user_id).await
    }

    pub fn is_expired(&self, record: &CredentialRecord) -> bool {
        self.policy.is_expired(record, epoch_ms())
    }

    pub fn is_refresh_expired(&self, record: &CredentialRecord) -> bool {
        self.policy.is_refresh_expired(record, epoch_ms())
    }

    /// POST a form to the token endpoint and classify the outcome.
    async fn post_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse, EndpointError> {
        let resp = self
            .http
            .post(&self.provider.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| EndpointError::Transient(format!("HTTP error: {e}")))?;

        let status = resp.status();
        let body =
            resp.text().await.map_err(|e| EndpointError::Transient(format!("read body: {e}")))?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(&body) {
                if err.error == "invalid_grant" {
                    return Err(EndpointError::Revoked(err.message()));
                }
                return Err(EndpointError::Rejected(err.message()));
            }
            if status.is_server_error() {
                return Err(EndpointError::Transient(format!("HTTP {status}: {body}")));
            }
            return Err(EndpointError::Rejected(format!("HTTP {status}: {body}")));
        }

        serde_json::from_str(&body)
            .map_err(|e| EndpointError::Rejected(format!("parse token response: {e}")))
    }
}

fn expires_at(expires_in: Option<u64>, now_ms: u64) -> u64 {
    expires_in.map(|s| now_ms.saturating_add(s.saturating_mul(1000))).unwrap_or(0)
}

/// Token endpoint failure classes.
enum EndpointError {
    /// `invalid_grant`: the presented grant is expired or revoked.
    Revoked(String),
    /// Any other provider-reported failure.
    Rejected(String),
    /// Network failure or provider outage; worth retrying.
    Transient(String),
}

#[cfg(test)]
#[path = "exchanger_tests.rs"]
mod tests;
