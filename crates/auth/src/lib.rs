// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Coopauth: OAuth2 authorization-code login and per-user token sessions.

pub mod callback;
pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod test_support;

use std::sync::{Arc, Once};

use tokio_util::sync::CancellationToken;

use crate::callback::{CallbackListener, ListenerMode};
use crate::config::AuthConfig;
use crate::oauth::{ExpiryPolicy, TokenExchanger};
use crate::store::{CredentialStore, FileStore};

static CRYPTO: Once = Once::new();

/// Install the process-wide rustls crypto provider (idempotent).
pub fn ensure_crypto() {
    CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build the exchanger described by `config`, backed by the JSON file store.
pub fn build_exchanger(config: &AuthConfig) -> anyhow::Result<Arc<TokenExchanger>> {
    let provider = config.provider()?;
    let store: Arc<dyn CredentialStore> = Arc::new(FileStore::new(config.store_path()));
    let policy = ExpiryPolicy {
        clock_skew: config.clock_skew(),
        max_refresh_lifetime: config.max_refresh_lifetime(),
        attempt_ttl: config.attempt_ttl(),
    };
    Ok(Arc::new(TokenExchanger::new(provider, policy, store)))
}

/// Run the callback listener until `shutdown` fires.
///
/// Acts as the shared listener other processes fall back to when they find
/// the callback port taken.
pub async fn serve(config: AuthConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let exchanger = build_exchanger(&config)?;
    let listener = CallbackListener::new(&config, exchanger);
    match listener.start().await? {
        ListenerMode::Owned => {
            tracing::info!(url = %listener.callback_url(), "coopauth listening for callbacks");
        }
        ListenerMode::External => {
            anyhow::bail!("callback port {} is held by another process", config.port);
        }
    }
    shutdown.cancelled().await;
    listener.stop().await;
    Ok(())
}
