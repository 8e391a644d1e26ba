// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-user session cache.
//!
//! At most one live [`Session`] exists per user. Every lookup, creation and
//! eviction runs under a single async lock, including the awaited token
//! initialization, so concurrent callers for the same user never race.

pub mod provider;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::oauth::{RefreshedToken, TokenExchanger};
use crate::store::epoch_ms;

pub use provider::TokenProvider;

/// Default idle eviction threshold.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Initializing,
    Active,
    /// Evicted for inactivity.
    Expired,
    /// Dropped by a caller after an authorization failure.
    Invalidated,
    CleanedUp,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Invalidated => "invalidated",
            Self::CleanedUp => "cleaned_up",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { idle_timeout: DEFAULT_IDLE_TIMEOUT, sweep_interval: DEFAULT_SWEEP_INTERVAL }
    }
}

impl From<&AuthConfig> for SessionConfig {
    fn from(config: &AuthConfig) -> Self {
        Self { idle_timeout: config.idle_timeout(), sweep_interval: config.sweep_interval() }
    }
}

/// One user's cached token. Owned by the cache; callers get [`SessionHandle`]s.
struct Session {
    id: Uuid,
    user_id: String,
    access_token: String,
    expires_at_ms: u64,
    created_at: Instant,
    last_accessed: Instant,
    state: SessionState,
}

impl Session {
    fn new(user_id: &str) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_owned(),
            access_token: String::new(),
            expires_at_ms: 0,
            created_at: now,
            last_accessed: now,
            state: SessionState::Created,
        }
    }

    fn activate(&mut self, token: RefreshedToken) {
        self.access_token = token.access_token;
        self.expires_at_ms = token.expires_at_ms;
        self.state = SessionState::Active;
    }

    /// Move to `reason` and then to the terminal state, dropping the token.
    fn clean_up(mut self, reason: SessionState) {
        self.state = reason;
        debug!(user = %self.user_id, session = %self.id, reason = %reason, "session ended");
        self.access_token.clear();
        self.state = SessionState::CleanedUp;
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            user_id: self.user_id.clone(),
            access_token: self.access_token.clone(),
            expires_at_ms: self.expires_at_ms,
            state: self.state,
            age: self.created_at.elapsed(),
        }
    }
}

/// Point-in-time copy of a session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: Uuid,
    pub user_id: String,
    pub access_token: String,
    /// `0` when the token's expiry is unknown.
    pub expires_at_ms: u64,
    pub state: SessionState,
    pub age: Duration,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .field("state", &self.state)
            .field("age", &self.age)
            .finish()
    }
}

struct Sweep {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SessionCache {
    exchanger: Arc<TokenExchanger>,
    config: SessionConfig,
    sessions: tokio::sync::Mutex<HashMap<String, Session>>,
    sweep: Mutex<Option<Sweep>>,
}

impl SessionCache {
    pub fn new(exchanger: Arc<TokenExchanger>, config: SessionConfig) -> Self {
        Self {
            exchanger,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            sweep: Mutex::new(None),
        }
    }

    pub fn exchanger(&self) -> &Arc<TokenExchanger> {
        &self.exchanger
    }

    fn is_idle(&self, session: &Session, now: Instant) -> bool {
        now.saturating_duration_since(session.last_accessed) >= self.config.idle_timeout
    }

    /// Return the user's live session, creating and initializing one if needed.
    ///
    /// `token` is used as-is when given (its expiry is then unknown);
    /// otherwise the stored credential is loaded and refreshed if stale. A
    /// failed initialization registers nothing.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        token: Option<String>,
    ) -> AuthResult<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();

        if let Some(session) = sessions.get_mut(user_id) {
            if !self.is_idle(session, now) {
                session.last_accessed = now;
                return Ok(session.handle());
            }
        }
        if let Some(stale) = sessions.remove(user_id) {
            info!(user = %user_id, "session idle past timeout, replacing");
            stale.clean_up(SessionState::Expired);
        }

        let mut session = Session::new(user_id);
        session.state = SessionState::Initializing;
        let initial = match token {
            Some(access_token) => RefreshedToken { access_token, expires_at_ms: 0 },
            None => self.exchanger.valid_access_token(user_id).await?,
        };
        session.activate(initial);
        session.last_accessed = Instant::now();

        let handle = session.handle();
        sessions.insert(user_id.to_owned(), session);
        info!(user = %user_id, session = %handle.id, "session created");
        Ok(handle)
    }

    /// Look up a live session without creating one. Idle sessions are
    /// evicted instead of returned.
    pub async fn get(&self, user_id: &str) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        let idle = self.is_idle(sessions.get(user_id)?, now);
        if idle {
            if let Some(stale) = sessions.remove(user_id) {
                stale.clean_up(SessionState::Expired);
            }
            return None;
        }
        let session = sessions.get_mut(user_id)?;
        session.last_accessed = now;
        Some(session.handle())
    }

    /// Drop the user's session and mark the stored access token expired.
    ///
    /// The refresh token is kept, so the next `get_or_create` mints a new
    /// access token instead of reusing the rejected one. Returns whether a
    /// session was cached.
    pub async fn invalidate(&self, user_id: &str) -> AuthResult<bool> {
        let mut sessions = self.sessions.lock().await;
        let had_session = match sessions.remove(user_id) {
            Some(session) => {
                session.clean_up(SessionState::Invalidated);
                true
            }
            None => false,
        };

        let store = self.exchanger.store();
        if let Some(mut record) = store.get_token(user_id).await? {
            record.expires_at_ms = 1;
            record.updated_at_ms = epoch_ms();
            store.update_token(record).await?;
        }
        info!(user = %user_id, had_session, "session invalidated");
        Ok(had_session)
    }

    /// Drop the user's session and delete the stored credential.
    pub async fn purge(&self, user_id: &str) -> AuthResult<bool> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(user_id) {
            session.clean_up(SessionState::Invalidated);
        }
        let removed = self.exchanger.store().delete_token(user_id).await?;
        info!(user = %user_id, removed, "credential purged");
        Ok(removed)
    }

    /// A currently valid access token for `user_id`.
    ///
    /// Refreshes through the exchanger when the cached token is inside the
    /// skew margin and updates the session in place. A refresh that needs
    /// re-authentication drops the session.
    pub async fn valid_token(&self, user_id: &str) -> AuthResult<String> {
        let handle = self.get_or_create(user_id, None).await?;
        if !self.exchanger.policy().is_expired_at(handle.expires_at_ms, epoch_ms()) {
            return Ok(handle.access_token);
        }

        debug!(user = %user_id, "cached token near expiry, refreshing");
        let refreshed = match self.exchanger.refresh(user_id).await {
            Ok(t) => t,
            Err(e @ (AuthError::ReauthRequired(_) | AuthError::NoToken(_))) => {
                let mut sessions = self.sessions.lock().await;
                if sessions.get(user_id).is_some_and(|s| s.id == handle.id) {
                    if let Some(session) = sessions.remove(user_id) {
                        session.clean_up(SessionState::Invalidated);
                    }
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(user_id) {
            if session.id == handle.id {
                session.access_token = refreshed.access_token.clone();
                session.expires_at_ms = refreshed.expires_at_ms;
            }
        }
        Ok(refreshed.access_token)
    }

    /// Evict every idle session. Returns how many were removed.
    pub async fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        let idle: Vec<String> =
            sessions.iter().filter(|(_, s)| self.is_idle(s, now)).map(|(k, _)| k.clone()).collect();
        for user_id in &idle {
            if let Some(session) = sessions.remove(user_id) {
                session.clean_up(SessionState::Expired);
            }
        }
        if !idle.is_empty() {
            info!(evicted = idle.len(), remaining = sessions.len(), "idle sessions evicted");
        }
        idle.len()
    }

    /// Spawn the idle sweep. Calling it again while a sweep runs does nothing.
    pub fn start_sweep(self: &Arc<Self>) {
        let mut sweep = self.sweep.lock();
        if sweep.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately.
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                }
                let Some(cache) = cache.upgrade() else { break };
                cache.evict_idle().await;
            }
            debug!("session sweep stopped");
        });
        *sweep = Some(Sweep { cancel, task });
        debug!(interval_secs = period.as_secs(), "session sweep started");
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep.lock().is_some()
    }

    /// Stop the sweep, wait for it, and clean up every session. Idempotent.
    pub async fn shutdown(&self) {
        let sweep = self.sweep.lock().take();
        if let Some(Sweep { cancel, task }) = sweep {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!(err = %e, "session sweep task failed");
            }
        }

        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        for (_, session) in sessions.drain() {
            session.clean_up(SessionState::CleanedUp);
        }
        if count > 0 {
            info!(count, "session cache shut down");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Copies of every cached session, idle or not.
    pub async fn snapshot(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.lock().await;
        let mut handles: Vec<_> = sessions.values().map(Session::handle).collect();
        handles.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        handles
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
