// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the callback listener.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, Redirect};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::oauth::TokenExchanger;

const PAGE_HTML: &str = include_str!("../../web/page.html");

/// State shared between the listener and its handlers.
pub struct CallbackState {
    pub exchanger: Arc<TokenExchanger>,
    pub port: u16,
    pub callback_url: String,
    /// Armed by `reset_completion` for one attempt; fired only by a
    /// successful exchange of that attempt's `state`.
    pub(crate) completion: Mutex<Option<ArmedSlot>>,
    pub last_user: Mutex<Option<String>>,
}

impl CallbackState {
    pub fn new(exchanger: Arc<TokenExchanger>, port: u16, callback_url: String) -> Self {
        Self {
            exchanger,
            port,
            callback_url,
            completion: Mutex::new(None),
            last_user: Mutex::new(None),
        }
    }

    fn complete(&self, state: &str, user_id: &str) {
        *self.last_user.lock() = Some(user_id.to_owned());
        let armed = {
            let mut slot = self.completion.lock();
            if slot.as_ref().is_some_and(|a| a.state == state) {
                slot.take()
            } else {
                None
            }
        };
        match armed {
            Some(a) => {
                if a.tx.send(user_id.to_owned()).is_err() {
                    warn!(user = %user_id, "completion waiter already gone");
                }
            }
            None => info!(user = %user_id, "callback completed an attempt nobody is waiting on"),
        }
    }
}

/// Completion sender bound to the attempt it was armed for.
pub(crate) struct ArmedSlot {
    pub(crate) state: String,
    pub(crate) tx: oneshot::Sender<String>,
}

// -- Request/Response types ---------------------------------------------------

/// Raw redirect query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// What a redirect carries once classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackPayload {
    Code { code: String, state: String },
    /// The provider redirected with `error` (denied consent, bad scope, ...).
    Denied { error: String, description: Option<String> },
    Malformed,
}

impl From<CallbackParams> for CallbackPayload {
    fn from(p: CallbackParams) -> Self {
        if let Some(error) = p.error {
            return Self::Denied { error, description: p.error_description };
        }
        match (p.code, p.state) {
            (Some(code), Some(state)) if !code.is_empty() && !state.is_empty() => {
                Self::Code { code, state }
            }
            _ => Self::Malformed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerStatus {
    pub status: String,
    pub port: u16,
    pub callback_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user: Option<String>,
    pub pending_attempts: usize,
}

// -- Router -------------------------------------------------------------------

pub fn build_router(state: Arc<CallbackState>, callback_path: &str) -> Router {
    Router::new()
        .route(callback_path, get(callback))
        .route("/login", get(login))
        .route("/", get(index))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET <callback_path>`
pub async fn callback(
    State(s): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<String>) {
    match CallbackPayload::from(params) {
        CallbackPayload::Denied { error, description } => {
            warn!(error = %error, "provider redirected with an error");
            let message = match description {
                Some(d) if !d.is_empty() => format!("{error}: {d}"),
                _ => error,
            };
            (StatusCode::BAD_REQUEST, render("Authorization failed", "err", &message))
        }
        CallbackPayload::Malformed => {
            warn!("callback missing code or state");
            (
                StatusCode::BAD_REQUEST,
                render("Authorization failed", "err", "Missing code or state parameter."),
            )
        }
        CallbackPayload::Code { code, state } => match s.exchanger.exchange(&code, &state).await {
            Ok(user_id) => {
                s.complete(&state, &user_id);
                (
                    StatusCode::OK,
                    render(
                        "Signed in",
                        "ok",
                        &format!("Signed in as {user_id}. You can close this window."),
                    ),
                )
            }
            Err(e) => {
                warn!(err = %e, "callback exchange failed");
                (failure_status(e.kind()), render("Authorization failed", "err", &e.to_string()))
            }
        },
    }
}

/// `GET /login`: start an attempt on this listener's exchanger and send the
/// browser to the provider. Lets other processes drive a login through a
/// listener they do not own.
pub async fn login(State(s): State<Arc<CallbackState>>) -> Redirect {
    let attempt = s.exchanger.begin();
    info!(port = s.port, "authorization attempt started via /login");
    Redirect::to(&attempt.authorization_url)
}

/// `GET /`
pub async fn index(State(s): State<Arc<CallbackState>>) -> Html<String> {
    let message = match s.last_user.lock().clone() {
        Some(user) => format!("Listening on port {}. Last sign-in: {user}.", s.port),
        None => format!("Listening on port {}. Waiting for a sign-in.", s.port),
    };
    render("Callback listener running", "info", &message)
}

/// `GET /status`
pub async fn status(State(s): State<Arc<CallbackState>>) -> Json<ListenerStatus> {
    Json(ListenerStatus {
        status: "running".to_owned(),
        port: s.port,
        callback_url: s.callback_url.clone(),
        last_user: s.last_user.lock().clone(),
        pending_attempts: s.exchanger.pending_attempts(),
    })
}

fn render(title: &str, class: &str, message: &str) -> Html<String> {
    Html(
        PAGE_HTML
            .replace("{{TITLE}}", &escape_html(title))
            .replace("{{CLASS}}", class)
            .replace("{{MESSAGE}}", &escape_html(message)),
    )
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// A bad `state` is the caller's fault; anything else is ours or the provider's.
fn failure_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidState => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
