// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential storage seam.
//!
//! The broker never owns persistence: everything goes through
//! [`CredentialStore`]. Two reference stores ship with the crate, an
//! in-memory map for tests and embedding, and a JSON file store for the
//! binary.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AuthResult;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Persisted credential for one user.
///
/// All timestamps are milliseconds since the Unix epoch. `expires_at_ms == 0`
/// means the access token carries no expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub user_id: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at_ms: u64,
    /// When the current refresh token stops being accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Access to persisted credentials. At most one record per user id.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_token(&self, user_id: &str) -> AuthResult<Option<CredentialRecord>>;

    /// Insert or overwrite the record for `record.user_id`.
    async fn update_token(&self, record: CredentialRecord) -> AuthResult<()>;

    /// Remove a user's record. Returns whether one existed.
    async fn delete_token(&self, user_id: &str) -> AuthResult<bool>;

    async fn list_users(&self) -> AuthResult<Vec<String>>;

    /// Drop records whose access token has expired and which cannot be refreshed.
    async fn cleanup_expired(&self, now_ms: u64) -> AuthResult<usize>;
}

/// Whether `record` is dead weight: access token lapsed and no usable refresh token.
pub fn is_unrecoverable(record: &CredentialRecord, now_ms: u64) -> bool {
    let access_expired = record.expires_at_ms != 0 && record.expires_at_ms <= now_ms;
    let refresh_usable = match (&record.refresh_token, record.refresh_expires_at_ms) {
        (None, _) => false,
        (Some(_), Some(at)) => at > now_ms,
        (Some(_), None) => true,
    };
    access_expired && !refresh_usable
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
