// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::AuthResult;
use crate::store::{is_unrecoverable, CredentialRecord, CredentialStore};

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, CredentialRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get_token(&self, user_id: &str) -> AuthResult<Option<CredentialRecord>> {
        Ok(self.records.read().await.get(user_id).cloned())
    }

    async fn update_token(&self, record: CredentialRecord) -> AuthResult<()> {
        self.records.write().await.insert(record.user_id.clone(), record);
        Ok(())
    }

    async fn delete_token(&self, user_id: &str) -> AuthResult<bool> {
        Ok(self.records.write().await.remove(user_id).is_some())
    }

    async fn list_users(&self) -> AuthResult<Vec<String>> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn cleanup_expired(&self, now_ms: u64) -> AuthResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !is_unrecoverable(r, now_ms));
        Ok(before - records.len())
    }
}
