// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Result alias used throughout the crate.
pub type AuthResult<T> = Result<T, AuthError>;

/// Failures surfaced by the exchanger, listener, orchestrator and cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The callback port is already bound by this listener.
    #[error("callback port {0} is already in use by this listener")]
    PortInUse(u16),
    /// Another interactive login already holds the listener.
    #[error("another interactive login is already waiting on port {0}")]
    LoginInProgress(u16),
    /// Redirect `state` did not match an outstanding attempt (possible CSRF).
    #[error("authorization state mismatch (possible CSRF attempt)")]
    InvalidState,
    /// Provider-reported redirect error or non-success token endpoint response.
    #[error("provider error: {0}")]
    ProviderError(String),
    /// No credential on file for the user.
    #[error("no token on file for {0}")]
    NoToken(String),
    /// Refresh token missing, expired or revoked; the user must log in again.
    #[error("re-authentication required: {0}")]
    ReauthRequired(String),
    /// Interactive flow exceeded its window.
    #[error("authorization timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// Network failure talking to the provider.
    #[error("transient error: {0}")]
    TransientError(String),
    /// Credential store failure.
    #[error("credential store error: {0}")]
    Store(String),
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PortInUse(_) => ErrorKind::PortInUse,
            Self::LoginInProgress(_) => ErrorKind::LoginInProgress,
            Self::InvalidState => ErrorKind::InvalidState,
            Self::ProviderError(_) => ErrorKind::ProviderError,
            Self::NoToken(_) => ErrorKind::NoToken,
            Self::ReauthRequired(_) => ErrorKind::ReauthRequired,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::TransientError(_) => ErrorKind::TransientError,
            Self::Store(_) => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Structured `{code, message}` form for pages and API responses.
    pub fn to_error_body(&self) -> ErrorBody {
        self.kind().to_error_body(self.to_string())
    }

    pub fn to_http_response(&self) -> (StatusCode, Json<ErrorResponse>) {
        self.kind().to_http_response(self.to_string())
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        Self::TransientError(e.to_string())
    }
}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PortInUse,
    LoginInProgress,
    InvalidState,
    ProviderError,
    NoToken,
    ReauthRequired,
    Timeout,
    TransientError,
    Store,
    Config,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::PortInUse => 409,
            Self::LoginInProgress => 409,
            Self::InvalidState => 400,
            Self::ProviderError => 400,
            Self::NoToken => 404,
            Self::ReauthRequired => 401,
            Self::Timeout => 408,
            Self::TransientError => 502,
            Self::Store => 500,
            Self::Config => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortInUse => "PORT_IN_USE",
            Self::LoginInProgress => "LOGIN_IN_PROGRESS",
            Self::InvalidState => "INVALID_STATE",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::NoToken => "NO_TOKEN",
            Self::ReauthRequired => "REAUTH_REQUIRED",
            Self::Timeout => "TIMEOUT",
            Self::TransientError => "TRANSIENT_ERROR",
            Self::Store => "STORE_ERROR",
            Self::Config => "CONFIG_ERROR",
        }
    }

    /// Whether retrying the same operation later may succeed without user action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::TransientError | Self::PortInUse | Self::LoginInProgress
        )
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
