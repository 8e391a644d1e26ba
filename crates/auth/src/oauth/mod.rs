// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth2 authorization-code flow against the identity provider.

pub mod exchanger;
pub mod identity;
pub mod pkce;

use std::time::Instant;

use serde::{Deserialize, Serialize};

pub use exchanger::{ExpiryPolicy, RefreshedToken, TokenExchanger};

/// Standard OAuth2 token response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Refresh token lifetime in seconds, when the provider reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// OAuth error response from the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenErrorResponse {
    /// `error: description`, or just the code when no description was sent.
    pub fn message(&self) -> String {
        match self.error_description {
            Some(ref d) if !d.is_empty() => format!("{}: {d}", self.error),
            _ => self.error.clone(),
        }
    }
}

/// One interactive authorization attempt. Single use.
#[derive(Debug, Clone)]
pub struct AuthorizationAttempt {
    /// CSRF state round-tripped through the redirect.
    pub state: String,
    /// Full URL the user must open in a browser.
    pub authorization_url: String,
    pub created_at: Instant,
    pub(crate) code_verifier: String,
}
