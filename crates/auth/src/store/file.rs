// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON file credential store with atomic writes.
//!
//! Every operation re-reads the file so records written by another process
//! (e.g. a standalone `coopauth serve` listener) are visible immediately.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{AuthError, AuthResult};
use crate::store::{is_unrecoverable, CredentialRecord, CredentialStore};

/// On-disk layout.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PersistedCredentials {
    #[serde(default)]
    users: BTreeMap<String, CredentialRecord>,
}

/// Credential store backed by a single JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> AuthResult<PersistedCredentials> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedCredentials::default());
            }
            Err(e) => {
                return Err(AuthError::Store(format!("read {}: {e}", self.path.display())));
            }
        };
        if contents.trim().is_empty() {
            return Ok(PersistedCredentials::default());
        }
        serde_json::from_str(&contents)
            .map_err(|e| AuthError::Store(format!("parse {}: {e}", self.path.display())))
    }

    /// Write tmp + rename. The tmp name carries PID and a counter so
    /// concurrent saves never share a partially written file.
    fn save(&self, creds: &PersistedCredentials) -> AuthResult<()> {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let json = serde_json::to_string_pretty(creds)
            .map_err(|e| AuthError::Store(format!("serialize credentials: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AuthError::Store(format!("create {}: {e}", parent.display())))?;
        }
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_name = format!(
            "{}.{}.{}.tmp",
            self.path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id(),
            seq,
        );
        let tmp_path = self.path.with_file_name(tmp_name);
        std::fs::write(&tmp_path, json)
            .map_err(|e| AuthError::Store(format!("write {}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| AuthError::Store(format!("rename {}: {e}", self.path.display())))?;

        debug!(path = %self.path.display(), users = creds.users.len(), "persisted credentials");
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn get_token(&self, user_id: &str) -> AuthResult<Option<CredentialRecord>> {
        Ok(self.load()?.users.remove(user_id))
    }

    async fn update_token(&self, record: CredentialRecord) -> AuthResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut creds = self.load()?;
        creds.users.insert(record.user_id.clone(), record);
        self.save(&creds)
    }

    async fn delete_token(&self, user_id: &str) -> AuthResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut creds = self.load()?;
        if creds.users.remove(user_id).is_none() {
            return Ok(false);
        }
        self.save(&creds)?;
        Ok(true)
    }

    async fn list_users(&self) -> AuthResult<Vec<String>> {
        Ok(self.load()?.users.into_keys().collect())
    }

    async fn cleanup_expired(&self, now_ms: u64) -> AuthResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut creds = self.load()?;
        let before = creds.users.len();
        creds.users.retain(|_, r| !is_unrecoverable(r, now_ms));
        let removed = before - creds.users.len();
        if removed > 0 {
            self.save(&creds)?;
        }
        Ok(removed)
    }
}
