// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Loopback redirect listener.
//!
//! One [`CallbackListener`] owns one fixed port. When the port is already
//! held by another process, the listener reports [`ListenerMode::External`]
//! and leaves it alone: that process is expected to complete the exchange and
//! write the credential store.

pub mod http;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::oauth::TokenExchanger;

use http::ArmedSlot;
pub use http::{CallbackParams, CallbackPayload, CallbackState, ListenerStatus};

/// Who is serving the callback port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// This listener bound the port and runs the server.
    Owned,
    /// Another process holds the port.
    External,
}

/// Result of waiting on the completion slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success(String),
    Timeout,
}

struct Server {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct CallbackListener {
    host: String,
    port: u16,
    callback_path: String,
    state: Arc<CallbackState>,
    running: AtomicBool,
    mode: Mutex<Option<ListenerMode>>,
    server: tokio::sync::Mutex<Option<Server>>,
    waiter: Mutex<Option<oneshot::Receiver<String>>>,
    /// Held for the duration of one interactive login.
    flow: tokio::sync::Mutex<()>,
}

impl CallbackListener {
    pub fn new(config: &AuthConfig, exchanger: Arc<TokenExchanger>) -> Self {
        Self::with_address(&config.host, config.port, &config.callback_path, exchanger)
    }

    pub fn with_address(
        host: &str,
        port: u16,
        callback_path: &str,
        exchanger: Arc<TokenExchanger>,
    ) -> Self {
        let callback_url = format!("http://localhost:{port}{callback_path}");
        Self {
            host: host.to_owned(),
            port,
            callback_path: callback_path.to_owned(),
            state: Arc::new(CallbackState::new(exchanger, port, callback_url)),
            running: AtomicBool::new(false),
            mode: Mutex::new(None),
            server: tokio::sync::Mutex::new(None),
            waiter: Mutex::new(None),
            flow: tokio::sync::Mutex::new(()),
        }
    }

    /// Router serving this listener's routes. Used by `start` and by tests.
    pub fn router(&self) -> Router {
        http::build_router(Arc::clone(&self.state), &self.callback_path)
    }

    /// Bind the callback port and start serving.
    ///
    /// Returns `PortInUse` if this listener is already running. A port held
    /// by someone else is not an error: the result is `External`. "Someone
    /// else" includes another `CallbackListener` value in this process; only
    /// the instance that bound the port reports `PortInUse`, since listeners
    /// are owned values rather than a process-wide singleton.
    pub async fn start(&self) -> AuthResult<ListenerMode> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(AuthError::PortInUse(self.port));
        }

        let addr = format!("{}:{}", self.host, self.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                info!(port = self.port, "callback port held by another process, using it");
                *self.mode.lock() = Some(ListenerMode::External);
                return Ok(ListenerMode::External);
            }
            Err(e) => {
                return Err(AuthError::TransientError(format!("bind {addr}: {e}")));
            }
        };

        let cancel = CancellationToken::new();
        let router = self.router();
        let shutdown = cancel.clone();
        let port = self.port;
        let task = tokio::spawn(async move {
            if let Err(e) =
                axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await
            {
                warn!(port, err = %e, "callback server exited with error");
            }
        });

        *server = Some(Server { cancel, task });
        *self.mode.lock() = Some(ListenerMode::Owned);
        self.running.store(true, Ordering::Release);
        info!(port = self.port, url = %self.callback_url(), "callback listener started");
        Ok(ListenerMode::Owned)
    }

    /// Stop serving and wait for the server task. Idempotent.
    ///
    /// Any armed completion slot is dropped, so a pending waiter sees an error.
    pub async fn stop(&self) {
        let server = self.server.lock().await.take();
        self.state.completion.lock().take();
        *self.mode.lock() = None;
        self.running.store(false, Ordering::Release);
        if let Some(Server { cancel, task }) = server {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!(port = self.port, err = %e, "callback server task failed");
            }
            info!(port = self.port, "callback listener stopped");
        }
    }

    /// Cancel the server without waiting for it to drain.
    ///
    /// Synchronous counterpart of [`stop`](Self::stop), for drop guards.
    pub fn abort(&self) {
        if let Ok(mut server) = self.server.try_lock() {
            if let Some(s) = server.take() {
                s.cancel.cancel();
            }
        }
        self.state.completion.lock().take();
        *self.mode.lock() = None;
        self.running.store(false, Ordering::Release);
    }

    /// Claim the listener for one interactive login until the guard drops.
    ///
    /// Only one flow can wait on a listener at a time; a second claim fails
    /// with `LoginInProgress` instead of displacing the first waiter.
    pub fn claim_flow(&self) -> AuthResult<tokio::sync::MutexGuard<'_, ()>> {
        self.flow.try_lock().map_err(|_| AuthError::LoginInProgress(self.port))
    }

    /// Arm a fresh completion slot for the attempt identified by `state`,
    /// discarding any previous one.
    ///
    /// Only a successful exchange of that same `state` fires the slot. A late
    /// redirect for an earlier attempt still stores its credential, but
    /// completes nobody's wait.
    pub fn reset_completion(&self, state: &str) {
        let (tx, rx) = oneshot::channel();
        *self.state.completion.lock() = Some(ArmedSlot { state: state.to_owned(), tx });
        *self.waiter.lock() = Some(rx);
        debug!(port = self.port, "completion slot armed");
    }

    /// Wait for the armed slot to fire.
    ///
    /// On timeout the slot stays armed, so a later redirect still completes it.
    pub async fn wait_for_completion(&self, timeout: Duration) -> AuthResult<Completion> {
        let Some(mut rx) = self.waiter.lock().take() else {
            return Err(AuthError::TransientError("no completion slot armed".into()));
        };
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(user_id)) => Ok(Completion::Success(user_id)),
            Ok(Err(_)) => Err(AuthError::TransientError("callback listener stopped".into())),
            Err(_) => {
                *self.waiter.lock() = Some(rx);
                Ok(Completion::Timeout)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn callback_url(&self) -> String {
        self.state.callback_url.clone()
    }

    /// Entry point that starts a login on whichever process serves the port.
    pub fn login_url(&self) -> String {
        format!("http://localhost:{}/login", self.port)
    }

    /// Mode chosen by the last `start`, if any.
    pub fn mode(&self) -> Option<ListenerMode> {
        *self.mode.lock()
    }

    /// User id of the most recent successful redirect.
    pub fn last_user(&self) -> Option<String> {
        self.state.last_user.lock().clone()
    }

    pub fn exchanger(&self) -> &Arc<TokenExchanger> {
        &self.state.exchanger
    }
}

/// Whether something accepts TCP connections on `127.0.0.1:port`.
pub async fn probe_port(port: u16) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(("127.0.0.1", port)))
            .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
