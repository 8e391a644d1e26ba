// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for unit and integration tests: a scriptable mock
//! identity provider and config builders.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::config::ProviderConfig;
use crate::orchestrator::BrowserLauncher;

/// Scripted token endpoint responses, consumed in order; the last one repeats.
#[derive(Default)]
struct MockState {
    token_responses: Mutex<Vec<(u16, String)>>,
    token_calls: AtomicU32,
    token_requests: Mutex<Vec<String>>,
    userinfo: Mutex<Option<(u16, String)>>,
}

/// A mock OAuth provider serving `/token` and `/userinfo` on `127.0.0.1:0`.
#[derive(Clone)]
pub struct MockProvider {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockProvider {
    pub async fn start(token_responses: Vec<(u16, String)>) -> anyhow::Result<Self> {
        let state = Arc::new(MockState {
            token_responses: Mutex::new(token_responses),
            ..MockState::default()
        });

        let app = Router::new()
            .route("/token", post(token_handler))
            .route("/userinfo", get(userinfo_handler))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Ok(Self { addr, state })
    }

    pub fn token_url(&self) -> String {
        format!("http://{}/token", self.addr)
    }

    pub fn userinfo_url(&self) -> String {
        format!("http://{}/userinfo", self.addr)
    }

    /// Number of requests the token endpoint has served.
    pub fn token_calls(&self) -> u32 {
        self.state.token_calls.load(Ordering::Relaxed)
    }

    /// Raw form bodies received by the token endpoint.
    pub fn token_requests(&self) -> Vec<String> {
        self.state.token_requests.lock().clone()
    }

    /// Replace the scripted token responses.
    pub fn set_token_responses(&self, responses: Vec<(u16, String)>) {
        *self.state.token_responses.lock() = responses;
    }

    pub fn set_userinfo(&self, status: u16, body: impl Into<String>) {
        *self.state.userinfo.lock() = Some((status, body.into()));
    }

    /// Provider config pointing at this mock.
    pub fn provider_config(&self, redirect_uri: &str) -> ProviderConfig {
        ProviderConfig {
            client_id: "test-client".to_owned(),
            client_secret: None,
            authorize_url: format!("http://{}/authorize", self.addr),
            token_url: self.token_url(),
            userinfo_url: None,
            scopes: vec!["openid".to_owned(), "offline_access".to_owned()],
            redirect_uri: redirect_uri.to_owned(),
            extra_auth_params: vec![],
        }
    }
}

async fn token_handler(State(state): State<Arc<MockState>>, body: String) -> (StatusCode, String) {
    let idx = state.token_calls.fetch_add(1, Ordering::Relaxed) as usize;
    state.token_requests.lock().push(body);
    let resps = state.token_responses.lock();
    let (status, body) = if idx < resps.len() {
        resps[idx].clone()
    } else {
        resps.last().cloned().unwrap_or((500, "{}".to_owned()))
    };
    (StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), body)
}

async fn userinfo_handler(State(state): State<Arc<MockState>>) -> (StatusCode, String) {
    let (status, body) = state.userinfo.lock().clone().unwrap_or((404, "{}".to_owned()));
    (StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), body)
}

/// Unsigned JWT carrying `email` as its only claim.
pub fn id_token_for(email: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::json!({ "email": email }).to_string());
    format!("{header}.{payload}.")
}

/// Successful token endpoint body for `email`.
pub fn token_body(email: &str, access: &str, refresh: Option<&str>, expires_in: u64) -> String {
    let mut body = serde_json::json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "id_token": id_token_for(email),
    });
    if let Some(r) = refresh {
        body["refresh_token"] = serde_json::Value::String(r.to_owned());
    }
    body.to_string()
}

/// OAuth error body.
pub fn error_body(error: &str, description: &str) -> String {
    serde_json::json!({ "error": error, "error_description": description }).to_string()
}

/// Value of `key` in `url`'s query string, undecoded.
pub fn query_param(url: &str, key: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_owned())
    })
}

/// Browser stand-in that plays the user and the provider's authorize page.
///
/// On `open` it records the URL and, when completing, follows `/login`
/// redirects to find the `state` and hits the callback with `code`.
pub struct FakeBrowser {
    callback_url: Option<String>,
    code: String,
    opened: Mutex<Vec<String>>,
    http: reqwest::Client,
}

impl FakeBrowser {
    /// Redirects every opened authorization URL to `callback_url`.
    pub fn completing(callback_url: &str) -> Self {
        Self::build(Some(loopback(callback_url)))
    }

    /// Records URLs and never redirects.
    pub fn silent() -> Self {
        Self::build(None)
    }

    fn build(callback_url: Option<String>) -> Self {
        crate::ensure_crypto();
        Self {
            callback_url,
            code: "test-code".to_owned(),
            opened: Mutex::new(vec![]),
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl BrowserLauncher for FakeBrowser {
    async fn open(&self, url: &str) -> anyhow::Result<()> {
        self.opened.lock().push(url.to_owned());
        let Some(ref callback_url) = self.callback_url else {
            return Ok(());
        };

        let authorization_url = if url.ends_with("/login") {
            let resp = self.http.get(loopback(url)).send().await?;
            resp.headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
                .ok_or_else(|| anyhow::anyhow!("login did not redirect"))?
        } else {
            url.to_owned()
        };
        let state = query_param(&authorization_url, "state")
            .ok_or_else(|| anyhow::anyhow!("authorization URL has no state"))?;

        let target = format!("{callback_url}?code={}&state={state}", self.code);
        let http = self.http.clone();
        tokio::spawn(async move {
            let _ = http.get(target).send().await;
        });
        Ok(())
    }
}

fn loopback(url: &str) -> String {
    url.replacen("http://localhost:", "http://127.0.0.1:", 1)
}
