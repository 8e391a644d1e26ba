// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User identity discovery.
//!
//! The user id is never supplied up front: it is read from the token
//! response, either from the `id_token` claims or from the provider's
//! userinfo endpoint called with the freshly issued access token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use tracing::debug;

use crate::error::{AuthError, AuthResult};
use crate::oauth::TokenResponse;

/// Claims consulted in order; the first non-empty string wins.
const IDENTITY_CLAIMS: &[&str] =
    &["email", "preferred_username", "upn", "mail", "userPrincipalName", "sub"];

/// Pick the user id out of a claims object.
pub fn user_from_claims(claims: &Value) -> Option<String> {
    IDENTITY_CLAIMS.iter().find_map(|claim| {
        claims.get(*claim).and_then(|v| v.as_str()).map(str::trim).filter(|s| !s.is_empty())
    })
    .map(str::to_owned)
}

/// Decode the (unverified) payload of a JWT and pick the user id.
///
/// The token is taken straight from the token endpoint response, so the
/// signature is not checked here.
pub fn user_from_id_token(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    user_from_claims(&claims)
}

/// Resolve the user id for a token response.
pub async fn discover_user(
    http: &reqwest::Client,
    token: &TokenResponse,
    userinfo_url: Option<&str>,
) -> AuthResult<String> {
    if let Some(user) = token.id_token.as_deref().and_then(user_from_id_token) {
        return Ok(user);
    }

    let Some(url) = userinfo_url else {
        return Err(AuthError::ProviderError("token response carried no user identity".into()));
    };

    debug!(url, "resolving identity from userinfo endpoint");
    let resp = http.get(url).bearer_auth(&token.access_token).send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(AuthError::ProviderError(format!("userinfo HTTP {status}: {body}")));
    }
    let claims: Value = serde_json::from_str(&body)
        .map_err(|e| AuthError::ProviderError(format!("parse userinfo response: {e}")))?;
    user_from_claims(&claims)
        .ok_or_else(|| AuthError::ProviderError("userinfo response carried no user identity".into()))
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
