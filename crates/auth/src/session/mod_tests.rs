// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashSet;

use crate::config::ProviderConfig;
use crate::error::ErrorKind;
use crate::oauth::ExpiryPolicy;
use crate::store::{CredentialRecord, CredentialStore, MemoryStore};
use crate::test_support::{error_body, token_body, MockProvider};

use super::*;

const IDLE: Duration = Duration::from_secs(30);
const SWEEP: Duration = Duration::from_secs(5);

fn config() -> SessionConfig {
    SessionConfig { idle_timeout: IDLE, sweep_interval: SWEEP }
}

fn record(user: &str, access: &str, expires_at_ms: u64, refresh: Option<&str>) -> CredentialRecord {
    let now = epoch_ms();
    CredentialRecord {
        user_id: user.to_owned(),
        access_token: access.to_owned(),
        refresh_token: refresh.map(str::to_owned),
        expires_at_ms,
        refresh_expires_at_ms: None,
        created_at_ms: now,
        updated_at_ms: now,
    }
}

/// Provider config that is never contacted.
fn offline_provider() -> ProviderConfig {
    ProviderConfig {
        client_id: "test-client".into(),
        client_secret: None,
        authorize_url: "http://127.0.0.1:9/authorize".into(),
        token_url: "http://127.0.0.1:9/token".into(),
        userinfo_url: None,
        scopes: vec![],
        redirect_uri: "http://localhost:8400/callback".into(),
        extra_auth_params: vec![],
    }
}

fn offline_cache() -> (Arc<SessionCache>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let exchanger =
        Arc::new(TokenExchanger::new(offline_provider(), ExpiryPolicy::default(), store.clone()));
    (Arc::new(SessionCache::new(exchanger, config())), store)
}

async fn online_cache(
    responses: Vec<(u16, String)>,
) -> anyhow::Result<(Arc<SessionCache>, MockProvider, Arc<MemoryStore>)> {
    let mock = MockProvider::start(responses).await?;
    let store = Arc::new(MemoryStore::new());
    let exchanger = Arc::new(TokenExchanger::new(
        mock.provider_config("http://localhost:8400/callback"),
        ExpiryPolicy::default(),
        store.clone(),
    ));
    Ok((Arc::new(SessionCache::new(exchanger, config())), mock, store))
}

fn hour_from_now() -> u64 {
    epoch_ms() + 3_600_000
}

/// Force the cached token for `user` to look expired.
async fn age_cached_token(cache: &SessionCache, user: &str) {
    if let Some(s) = cache.sessions.lock().await.get_mut(user) {
        s.expires_at_ms = epoch_ms();
    }
}

// -- get_or_create ------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn same_session_within_idle_timeout_new_one_after() -> anyhow::Result<()> {
    let (cache, store) = offline_cache();
    store.update_token(record("a@x.com", "at", hour_from_now(), Some("rt"))).await?;

    let first = cache.get_or_create("a@x.com", None).await?;
    tokio::time::advance(IDLE / 2).await;
    let second = cache.get_or_create("a@x.com", None).await?;
    assert_eq!(first.id, second.id);
    assert_eq!(second.state, SessionState::Active);
    assert_eq!(second.access_token, "at");

    tokio::time::advance(IDLE).await;
    let third = cache.get_or_create("a@x.com", None).await?;
    assert_ne!(first.id, third.id);
    assert_eq!(cache.len().await, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn access_keeps_session_alive() -> anyhow::Result<()> {
    let (cache, store) = offline_cache();
    store.update_token(record("a@x.com", "at", hour_from_now(), None)).await?;

    let first = cache.get_or_create("a@x.com", None).await?;
    for _ in 0..4 {
        tokio::time::advance(IDLE / 2).await;
        assert!(cache.get("a@x.com").await.is_some());
    }
    let again = cache.get_or_create("a@x.com", None).await?;
    assert_eq!(first.id, again.id);
    Ok(())
}

#[tokio::test]
async fn supplied_token_is_used_as_is() -> anyhow::Result<()> {
    let (cache, _store) = offline_cache();
    let handle = cache.get_or_create("a@x.com", Some("given".into())).await?;
    assert_eq!(handle.access_token, "given");
    assert_eq!(handle.expires_at_ms, 0);
    assert_eq!(cache.valid_token("a@x.com").await?, "given");
    Ok(())
}

#[tokio::test]
async fn failed_initialization_registers_nothing() -> anyhow::Result<()> {
    let (cache, _store) = offline_cache();
    let err = cache.get_or_create("ghost@x.com", None).await.expect_err("no record");
    assert_eq!(err.kind(), ErrorKind::NoToken);
    assert!(cache.is_empty().await);
    assert!(cache.get("ghost@x.com").await.is_none());
    Ok(())
}

#[tokio::test]
async fn stale_record_is_refreshed_during_initialization() -> anyhow::Result<()> {
    let (cache, mock, store) =
        online_cache(vec![(200, token_body("a@x.com", "fresh", None, 3600))]).await?;
    store.update_token(record("a@x.com", "stale", 1, Some("rt"))).await?;

    let handle = cache.get_or_create("a@x.com", None).await?;
    assert_eq!(handle.access_token, "fresh");
    assert_eq!(mock.token_calls(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_session() -> anyhow::Result<()> {
    let (cache, mock, store) =
        online_cache(vec![(200, token_body("a@x.com", "fresh", None, 3600))]).await?;
    store.update_token(record("a@x.com", "stale", 1, Some("rt"))).await?;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move { cache.get_or_create("a@x.com", None).await }));
    }
    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await??.id);
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(cache.len().await, 1);
    assert_eq!(mock.token_calls(), 1);
    Ok(())
}

// -- get ----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn get_never_returns_idle_session() -> anyhow::Result<()> {
    let (cache, store) = offline_cache();
    store.update_token(record("a@x.com", "at", hour_from_now(), None)).await?;
    cache.get_or_create("a@x.com", None).await?;

    tokio::time::advance(IDLE).await;
    assert!(cache.get("a@x.com").await.is_none());
    assert!(cache.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn get_does_not_create() -> anyhow::Result<()> {
    let (cache, store) = offline_cache();
    store.update_token(record("a@x.com", "at", hour_from_now(), None)).await?;
    assert!(cache.get("a@x.com").await.is_none());
    assert!(cache.is_empty().await);
    Ok(())
}

// -- invalidate / purge -------------------------------------------------------

#[tokio::test]
async fn invalidate_forces_fresh_initialization() -> anyhow::Result<()> {
    let (cache, mock, store) =
        online_cache(vec![(200, token_body("a@x.com", "at-2", None, 3600))]).await?;
    store.update_token(record("a@x.com", "at-1", hour_from_now(), Some("rt"))).await?;

    let before = cache.get_or_create("a@x.com", None).await?;
    assert_eq!(before.access_token, "at-1");
    assert_eq!(mock.token_calls(), 0);

    assert!(cache.invalidate("a@x.com").await?);
    let stored = store.get_token("a@x.com").await?.expect("record kept");
    assert_eq!(stored.expires_at_ms, 1);
    assert_eq!(stored.refresh_token.as_deref(), Some("rt"));

    let after = cache.get_or_create("a@x.com", None).await?;
    assert_ne!(before.id, after.id);
    assert_eq!(after.access_token, "at-2");
    assert_eq!(mock.token_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn invalidate_without_session_still_poisons_record() -> anyhow::Result<()> {
    let (cache, store) = offline_cache();
    store.update_token(record("a@x.com", "at", hour_from_now(), Some("rt"))).await?;
    assert!(!cache.invalidate("a@x.com").await?);
    assert_eq!(store.get_token("a@x.com").await?.map(|r| r.expires_at_ms), Some(1));
    Ok(())
}

#[tokio::test]
async fn purge_deletes_record() -> anyhow::Result<()> {
    let (cache, store) = offline_cache();
    store.update_token(record("a@x.com", "at", hour_from_now(), Some("rt"))).await?;
    cache.get_or_create("a@x.com", None).await?;

    assert!(cache.purge("a@x.com").await?);
    assert!(cache.is_empty().await);
    assert!(store.get_token("a@x.com").await?.is_none());
    assert!(!cache.purge("a@x.com").await?);
    Ok(())
}

// -- valid_token --------------------------------------------------------------

#[tokio::test]
async fn valid_token_refreshes_in_place() -> anyhow::Result<()> {
    let (cache, mock, store) =
        online_cache(vec![(200, token_body("a@x.com", "renewed", None, 3600))]).await?;
    store.update_token(record("a@x.com", "old", hour_from_now(), Some("rt"))).await?;

    let before = cache.get_or_create("a@x.com", None).await?;
    age_cached_token(&cache, "a@x.com").await;

    assert_eq!(cache.valid_token("a@x.com").await?, "renewed");
    let after = cache.get("a@x.com").await.expect("session kept");
    assert_eq!(after.id, before.id);
    assert_eq!(after.access_token, "renewed");
    assert_eq!(after.state, SessionState::Active);
    assert_eq!(mock.token_calls(), 1);

    // Fresh now; no further provider traffic.
    assert_eq!(cache.valid_token("a@x.com").await?, "renewed");
    assert_eq!(mock.token_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn valid_token_drops_session_when_reauth_required() -> anyhow::Result<()> {
    let (cache, _mock, store) =
        online_cache(vec![(400, error_body("invalid_grant", "revoked"))]).await?;
    store.update_token(record("a@x.com", "old", hour_from_now(), Some("rt"))).await?;
    cache.get_or_create("a@x.com", None).await?;
    age_cached_token(&cache, "a@x.com").await;

    let err = cache.valid_token("a@x.com").await.expect_err("revoked");
    assert_eq!(err.kind(), ErrorKind::ReauthRequired);
    assert!(cache.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn valid_token_keeps_session_on_transient_failure() -> anyhow::Result<()> {
    let (cache, _mock, store) = online_cache(vec![(503, "down".into())]).await?;
    store.update_token(record("a@x.com", "old", hour_from_now(), Some("rt"))).await?;
    cache.get_or_create("a@x.com", None).await?;
    age_cached_token(&cache, "a@x.com").await;

    let err = cache.valid_token("a@x.com").await.expect_err("outage");
    assert_eq!(err.kind(), ErrorKind::TransientError);
    assert_eq!(cache.len().await, 1);
    Ok(())
}

// -- sweep / shutdown ---------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn sweep_evicts_idle_sessions() -> anyhow::Result<()> {
    let (cache, store) = offline_cache();
    store.update_token(record("a@x.com", "at", hour_from_now(), None)).await?;
    store.update_token(record("b@x.com", "bt", hour_from_now(), None)).await?;
    cache.start_sweep();

    cache.get_or_create("a@x.com", None).await?;
    tokio::time::sleep(IDLE / 2).await;
    cache.get_or_create("b@x.com", None).await?;

    // a is idle past the timeout, b is not.
    tokio::time::sleep(IDLE / 2 + SWEEP * 2).await;
    let users: Vec<_> = cache.snapshot().await.into_iter().map(|h| h.user_id).collect();
    assert_eq!(users, vec!["b@x.com".to_owned()]);

    tokio::time::sleep(IDLE).await;
    assert!(cache.is_empty().await);

    cache.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn start_sweep_is_idempotent() -> anyhow::Result<()> {
    let (cache, _store) = offline_cache();
    cache.start_sweep();
    cache.start_sweep();
    assert!(cache.is_sweeping());
    cache.shutdown().await;
    assert!(!cache.is_sweeping());
    Ok(())
}

#[tokio::test]
async fn shutdown_cleans_up_everything_and_is_idempotent() -> anyhow::Result<()> {
    let (cache, store) = offline_cache();
    store.update_token(record("a@x.com", "at", hour_from_now(), None)).await?;
    cache.start_sweep();
    cache.get_or_create("a@x.com", None).await?;
    cache.get_or_create("b@x.com", Some("bt".into())).await?;
    assert_eq!(cache.len().await, 2);

    cache.shutdown().await;
    assert!(cache.is_empty().await);
    assert!(!cache.is_sweeping());
    cache.shutdown().await;

    // Credentials survive shutdown.
    assert!(store.get_token("a@x.com").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn evict_idle_leaves_fresh_sessions() -> anyhow::Result<()> {
    let (cache, _store) = offline_cache();
    cache.get_or_create("a@x.com", Some("t".into())).await?;
    assert_eq!(cache.evict_idle().await, 0);
    assert_eq!(cache.len().await, 1);
    Ok(())
}

// -- TokenProvider ------------------------------------------------------------

#[tokio::test]
async fn token_provider_maps_errors_to_none() -> anyhow::Result<()> {
    let (cache, store) = offline_cache();
    store.update_token(record("a@x.com", "at", hour_from_now(), None)).await?;
    let provider: Arc<dyn TokenProvider> = cache.clone();

    assert_eq!(provider.validate_and_refresh_token("a@x.com").await.as_deref(), Some("at"));
    assert!(provider.validate_and_refresh_token("ghost@x.com").await.is_none());
    assert_eq!(provider.get_token("a@x.com").await.map(|r| r.access_token).as_deref(), Some("at"));
    assert!(provider.get_token("ghost@x.com").await.is_none());

    provider.close().await;
    assert!(cache.is_empty().await);
    Ok(())
}

#[test]
fn handle_debug_redacts_token() {
    let handle = SessionHandle {
        id: Uuid::nil(),
        user_id: "a@x.com".into(),
        access_token: "secret-token".into(),
        expires_at_ms: 0,
        state: SessionState::Active,
        age: Duration::ZERO,
    };
    let dbg = format!("{handle:?}");
    assert!(!dbg.contains("secret-token"));
    assert!(dbg.contains("a@x.com"));
}
