// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interactive login: listener, browser, completion wait, teardown.

pub mod browser;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::callback::{CallbackListener, Completion, ListenerMode};
use crate::error::{AuthError, AuthResult, ErrorBody};

pub use browser::{BrowserLauncher, NoBrowser, SystemBrowser};

/// Default store poll interval when another process owns the callback port.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub expires_at_ms: u64,
    pub has_refresh_token: bool,
}

/// Everything an interactive login can end in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuthOutcome {
    Success(AuthenticatedUser),
    Timeout,
    Error(ErrorBody),
}

impl AuthOutcome {
    fn error(e: AuthError) -> Self {
        Self::Error(e.to_error_body())
    }
}

type UrlHook = Box<dyn Fn(&str) + Send + Sync>;

pub struct AuthOrchestrator {
    listener: Arc<CallbackListener>,
    browser: Arc<dyn BrowserLauncher>,
    poll_interval: Duration,
    on_url: Option<UrlHook>,
}

impl AuthOrchestrator {
    pub fn new(listener: Arc<CallbackListener>, browser: Arc<dyn BrowserLauncher>) -> Self {
        Self { listener, browser, poll_interval: DEFAULT_POLL_INTERVAL, on_url: None }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Called with every URL the user must open, before the browser is launched.
    pub fn on_url(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_url = Some(Box::new(hook));
        self
    }

    pub fn listener(&self) -> &Arc<CallbackListener> {
        &self.listener
    }

    /// Run one interactive login.
    ///
    /// A listener started here is stopped before returning, whatever the
    /// outcome, and also if the returned future is dropped mid-flight.
    pub async fn authenticate(&self, timeout: Duration) -> AuthOutcome {
        let was_running = self.listener.is_running();
        if !was_running {
            match self.listener.start().await {
                Ok(ListenerMode::Owned) => {}
                Ok(ListenerMode::External) => return self.authenticate_external(timeout).await,
                Err(e) => return AuthOutcome::error(e),
            }
        }

        let lease = ListenerLease { listener: &self.listener, owned: !was_running, released: false };
        let outcome = self.authenticate_owned(timeout).await;
        lease.release().await;
        outcome
    }

    async fn authenticate_owned(&self, timeout: Duration) -> AuthOutcome {
        let _flow = match self.listener.claim_flow() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(err = %e, "interactive login rejected");
                return AuthOutcome::error(e);
            }
        };
        // Armed before the URL is shown, so only this attempt's redirect can fire it.
        let attempt = self.listener.exchanger().begin();
        self.listener.reset_completion(&attempt.state);
        self.present(&attempt.authorization_url).await;

        match self.listener.wait_for_completion(timeout).await {
            Ok(Completion::Success(user_id)) => match self.describe(&user_id).await {
                Ok(user) => {
                    info!(user = %user.user_id, "interactive login complete");
                    AuthOutcome::Success(user)
                }
                Err(e) => AuthOutcome::error(e),
            },
            Ok(Completion::Timeout) => {
                info!(timeout_secs = timeout.as_secs(), "interactive login timed out");
                AuthOutcome::Timeout
            }
            Err(e) => AuthOutcome::error(e),
        }
    }

    /// Degraded mode: the completion signal lives in another process, so
    /// watch the store for a user id that was not there before.
    ///
    /// Two users logging in at once through the same external listener can
    /// be attributed to the wrong caller.
    async fn authenticate_external(&self, timeout: Duration) -> AuthOutcome {
        let store = Arc::clone(self.listener.exchanger().store());
        let before: BTreeSet<String> = match store.list_users().await {
            Ok(users) => users.into_iter().collect(),
            Err(e) => return AuthOutcome::error(e),
        };
        debug!(known = before.len(), "polling credential store for a new user");

        self.present(&self.listener.login_url()).await;

        let deadline = Instant::now() + timeout;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    info!(timeout_secs = timeout.as_secs(), "no new user appeared before timeout");
                    return AuthOutcome::Timeout;
                }
            }

            let users = match store.list_users().await {
                Ok(u) => u,
                Err(e) => {
                    warn!(err = %e, "credential store poll failed");
                    continue;
                }
            };
            if let Some(new_user) = users.into_iter().find(|u| !before.contains(u)) {
                return match self.describe(&new_user).await {
                    Ok(user) => {
                        info!(user = %user.user_id, "login completed by external listener");
                        AuthOutcome::Success(user)
                    }
                    Err(e) => AuthOutcome::error(e),
                };
            }
        }
    }

    async fn present(&self, url: &str) {
        if let Some(ref hook) = self.on_url {
            hook(url);
        }
        if let Err(e) = self.browser.open(url).await {
            warn!(err = %e, "could not open a browser");
            info!(url, "open this URL to sign in");
        }
    }

    async fn describe(&self, user_id: &str) -> AuthResult<AuthenticatedUser> {
        let record = self
            .listener
            .exchanger()
            .store()
            .get_token(user_id)
            .await?
            .ok_or_else(|| AuthError::NoToken(user_id.to_owned()))?;
        Ok(AuthenticatedUser {
            user_id: record.user_id,
            expires_at_ms: record.expires_at_ms,
            has_refresh_token: record.refresh_token.is_some(),
        })
    }
}

/// Stops a listener the orchestrator started itself.
///
/// [`release`](Self::release) stops and awaits it; dropping the lease
/// without releasing (the login future was cancelled) cancels it instead.
struct ListenerLease<'a> {
    listener: &'a CallbackListener,
    owned: bool,
    released: bool,
}

impl ListenerLease<'_> {
    async fn release(mut self) {
        self.released = true;
        if self.owned {
            self.listener.stop().await;
        }
    }
}

impl Drop for ListenerLease<'_> {
    fn drop(&mut self) {
        if self.owned && !self.released {
            debug!(port = self.listener.port(), "login abandoned, cancelling listener");
            self.listener.abort();
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
