// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The capability handed to domain clients.
//!
//! Clients only ever ask for a valid token; they never see sessions, the
//! exchanger or the handshake.

use async_trait::async_trait;
use tracing::warn;

use crate::session::SessionCache;
use crate::store::CredentialRecord;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently valid access token, or `None` when the user must log in
    /// again or the provider is unreachable.
    async fn validate_and_refresh_token(&self, user_id: &str) -> Option<String>;

    /// The stored credential record, if any.
    async fn get_token(&self, user_id: &str) -> Option<CredentialRecord>;

    /// Release background resources.
    async fn close(&self);
}

#[async_trait]
impl TokenProvider for SessionCache {
    async fn validate_and_refresh_token(&self, user_id: &str) -> Option<String> {
        match self.valid_token(user_id).await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(
                    user = %user_id,
                    kind = %e.kind(),
                    recoverable = e.kind().is_recoverable(),
                    err = %e,
                    "no valid token"
                );
                None
            }
        }
    }

    async fn get_token(&self, user_id: &str) -> Option<CredentialRecord> {
        match self.exchanger().store().get_token(user_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(user = %user_id, kind = %e.kind(), err = %e, "credential lookup failed");
                None
            }
        }
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}
