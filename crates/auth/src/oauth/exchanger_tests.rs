// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::error::ErrorKind;
use crate::store::MemoryStore;
use crate::test_support::{error_body, token_body, MockProvider};

use super::*;

const REDIRECT: &str = "http://localhost:8400/callback";

async fn exchanger_with(
    responses: Vec<(u16, String)>,
) -> anyhow::Result<(TokenExchanger, MockProvider, Arc<MemoryStore>)> {
    let mock = MockProvider::start(responses).await?;
    let store = Arc::new(MemoryStore::new());
    let exchanger =
        TokenExchanger::new(mock.provider_config(REDIRECT), ExpiryPolicy::default(), store.clone());
    Ok((exchanger, mock, store))
}

fn record(user: &str, expires_at_ms: u64, refresh: Option<&str>) -> CredentialRecord {
    let now = epoch_ms();
    CredentialRecord {
        user_id: user.to_owned(),
        access_token: "stale-access".to_owned(),
        refresh_token: refresh.map(str::to_owned),
        expires_at_ms,
        refresh_expires_at_ms: None,
        created_at_ms: now,
        updated_at_ms: now,
    }
}

// -- Expiry math --------------------------------------------------------------

#[yare::parameterized(
    no_expiry = { 0, 1_000_000, false },
    well_before = { 1_000_000, 900_000, false },
    inside_skew = { 1_000_000, 950_000, true },
    exactly_at_skew = { 1_000_000, 940_000, true },
    just_outside_skew = { 1_000_000, 939_999, false },
    after = { 1_000_000, 1_000_001, true },
)]
fn access_expiry_applies_skew(expires_at: u64, now: u64, expired: bool) {
    let policy = ExpiryPolicy::default();
    assert_eq!(policy.is_expired_at(expires_at, now), expired);
}

#[test]
fn refresh_expiry_falls_back_to_max_lifetime() {
    let policy = ExpiryPolicy { max_refresh_lifetime: Duration::from_secs(100), ..Default::default() };
    let mut r = record("u", 0, Some("r"));
    r.created_at_ms = 1_000_000;
    // 100s lifetime, 60s skew: expired from 1_040_000 on.
    assert!(!policy.is_refresh_expired(&r, 1_039_999));
    assert!(policy.is_refresh_expired(&r, 1_040_000));

    r.refresh_expires_at_ms = Some(5_000_000);
    assert!(!policy.is_refresh_expired(&r, 1_040_000));
}

// -- begin --------------------------------------------------------------------

#[tokio::test]
async fn begin_registers_unique_attempts() -> anyhow::Result<()> {
    let (exchanger, _mock, _store) = exchanger_with(vec![]).await?;
    let a = exchanger.begin();
    let b = exchanger.begin();
    assert_ne!(a.state, b.state);
    assert!(a.authorization_url.contains(&format!("state={}", a.state)));
    assert!(a.authorization_url.contains("code_challenge_method=S256"));
    assert!(a.authorization_url.contains("client_id=test-client"));
    assert_eq!(exchanger.pending_attempts(), 2);
    Ok(())
}

#[tokio::test]
async fn begin_caps_pending_attempts() -> anyhow::Result<()> {
    let (exchanger, mock, _store) =
        exchanger_with(vec![(200, token_body("a@x.com", "at", None, 3600))]).await?;
    let first = exchanger.begin();
    tokio::time::sleep(Duration::from_millis(2)).await;
    for _ in 0..MAX_PENDING_ATTEMPTS + 4 {
        let _ = exchanger.begin();
    }
    let newest = exchanger.begin();
    assert_eq!(exchanger.pending_attempts(), MAX_PENDING_ATTEMPTS);

    let err = exchanger.exchange("c", &first.state).await.expect_err("evicted");
    assert_eq!(err, AuthError::InvalidState);
    assert_eq!(mock.token_calls(), 0);
    assert_eq!(exchanger.exchange("c", &newest.state).await?, "a@x.com");
    Ok(())
}

#[tokio::test]
async fn begin_prunes_stale_attempts() -> anyhow::Result<()> {
    let mock = MockProvider::start(vec![]).await?;
    let policy = ExpiryPolicy { attempt_ttl: Duration::ZERO, ..Default::default() };
    let exchanger =
        TokenExchanger::new(mock.provider_config(REDIRECT), policy, Arc::new(MemoryStore::new()));
    let stale = exchanger.begin();
    assert_eq!(exchanger.pending_attempts(), 0);
    let err = exchanger.exchange("code", &stale.state).await.expect_err("stale attempt");
    assert_eq!(err, AuthError::InvalidState);
    assert_eq!(mock.token_calls(), 0);
    Ok(())
}

// -- exchange -----------------------------------------------------------------

#[tokio::test]
async fn exchange_persists_record_for_discovered_user() -> anyhow::Result<()> {
    let (exchanger, mock, store) =
        exchanger_with(vec![(200, token_body("a@x.com", "at-1", Some("rt-1"), 3600))]).await?;

    let attempt = exchanger.begin();
    let user = exchanger.exchange("the-code", &attempt.state).await?;
    assert_eq!(user, "a@x.com");

    let stored = store.get_token("a@x.com").await?.expect("record persisted");
    assert_eq!(stored.access_token, "at-1");
    assert_eq!(stored.refresh_token.as_deref(), Some("rt-1"));
    assert!(stored.expires_at_ms > epoch_ms());
    assert!(stored.refresh_expires_at_ms.is_some());

    let requests = mock.token_requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("grant_type=authorization_code"));
    assert!(requests[0].contains("code=the-code"));
    assert!(requests[0].contains("code_verifier="));
    Ok(())
}

#[tokio::test]
async fn exchange_with_consumed_state_is_invalid_state() -> anyhow::Result<()> {
    let (exchanger, mock, _store) =
        exchanger_with(vec![(200, token_body("a@x.com", "at-1", Some("rt-1"), 3600))]).await?;

    let attempt = exchanger.begin();
    exchanger.exchange("code", &attempt.state).await?;
    let err = exchanger.exchange("code", &attempt.state).await.expect_err("second use");
    assert_eq!(err, AuthError::InvalidState);
    assert_eq!(mock.token_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn exchange_with_mismatched_state_writes_nothing() -> anyhow::Result<()> {
    let (exchanger, mock, store) =
        exchanger_with(vec![(200, token_body("a@x.com", "at-1", None, 3600))]).await?;

    let _s1 = exchanger.begin();
    let err = exchanger.exchange("code", "S2").await.expect_err("mismatch");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(mock.token_calls(), 0);
    assert!(store.list_users().await?.is_empty());
    // The legitimate attempt is still redeemable.
    assert_eq!(exchanger.pending_attempts(), 1);
    Ok(())
}

#[tokio::test]
async fn exchange_surfaces_provider_error_verbatim() -> anyhow::Result<()> {
    let (exchanger, _mock, store) =
        exchanger_with(vec![(400, error_body("invalid_client", "bad client secret"))]).await?;

    let attempt = exchanger.begin();
    let err = exchanger.exchange("code", &attempt.state).await.expect_err("provider error");
    assert_eq!(err, AuthError::ProviderError("invalid_client: bad client secret".into()));
    assert!(store.list_users().await?.is_empty());
    // A failed exchange still consumes the attempt.
    assert_eq!(exchanger.pending_attempts(), 0);
    Ok(())
}

#[tokio::test]
async fn exchange_resolves_identity_from_userinfo() -> anyhow::Result<()> {
    let body = serde_json::json!({ "access_token": "at", "expires_in": 3600 }).to_string();
    let mock = MockProvider::start(vec![(200, body)]).await?;
    mock.set_userinfo(200, r#"{"mail":"graph@x.com","displayName":"G"}"#);
    let mut provider = mock.provider_config(REDIRECT);
    provider.userinfo_url = Some(mock.userinfo_url());
    let store = Arc::new(MemoryStore::new());
    let exchanger = TokenExchanger::new(provider, ExpiryPolicy::default(), store.clone());

    let attempt = exchanger.begin();
    assert_eq!(exchanger.exchange("code", &attempt.state).await?, "graph@x.com");
    assert!(store.get_token("graph@x.com").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn exchange_network_failure_is_transient() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut provider = MockProvider::start(vec![]).await?.provider_config(REDIRECT);
    // Nothing listens on port 9 locally.
    provider.token_url = "http://127.0.0.1:9/token".to_owned();
    let exchanger = TokenExchanger::new(provider, ExpiryPolicy::default(), store);
    let attempt = exchanger.begin();
    let err = exchanger.exchange("code", &attempt.state).await.expect_err("unreachable");
    assert_eq!(err.kind(), ErrorKind::TransientError);
    Ok(())
}

// -- refresh ------------------------------------------------------------------

#[tokio::test]
async fn refresh_without_record_is_no_token() -> anyhow::Result<()> {
    let (exchanger, _mock, _store) = exchanger_with(vec![]).await?;
    let err = exchanger.refresh("ghost@x.com").await.expect_err("no record");
    assert_eq!(err.kind(), ErrorKind::NoToken);
    Ok(())
}

#[tokio::test]
async fn refresh_without_refresh_token_requires_reauth() -> anyhow::Result<()> {
    let (exchanger, mock, store) = exchanger_with(vec![]).await?;
    store.update_token(record("a@x.com", 1, None)).await?;
    let err = exchanger.refresh("a@x.com").await.expect_err("no refresh token");
    assert_eq!(err.kind(), ErrorKind::ReauthRequired);
    assert_eq!(mock.token_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn refresh_past_max_lifetime_requires_reauth_without_provider_call() -> anyhow::Result<()> {
    let (exchanger, mock, store) =
        exchanger_with(vec![(200, token_body("a@x.com", "new", None, 3600))]).await?;
    let mut r = record("a@x.com", 1, Some("old-refresh"));
    r.created_at_ms = epoch_ms() - DEFAULT_MAX_REFRESH_LIFETIME.as_millis() as u64 - 1_000;
    store.update_token(r).await?;

    let err = exchanger.refresh("a@x.com").await.expect_err("refresh token too old");
    assert_eq!(err.kind(), ErrorKind::ReauthRequired);
    assert_eq!(mock.token_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn refresh_invalid_grant_requires_reauth() -> anyhow::Result<()> {
    let (exchanger, _mock, store) =
        exchanger_with(vec![(400, error_body("invalid_grant", "token revoked"))]).await?;
    store.update_token(record("a@x.com", 1, Some("revoked"))).await?;
    let err = exchanger.refresh("a@x.com").await.expect_err("revoked");
    assert_eq!(err, AuthError::ReauthRequired("invalid_grant: token revoked".into()));
    Ok(())
}

#[tokio::test]
async fn refresh_classifies_failures() -> anyhow::Result<()> {
    let cases = [
        (503, "upstream down", ErrorKind::TransientError),
        (401, r#"{"error":"invalid_client"}"#, ErrorKind::ProviderError),
        (400, "nope", ErrorKind::ProviderError),
    ];
    for (status, body, kind) in cases {
        let (exchanger, _mock, store) = exchanger_with(vec![(status, body.to_owned())]).await?;
        store.update_token(record("a@x.com", 1, Some("rt"))).await?;
        let err = exchanger.refresh("a@x.com").await.expect_err("should fail");
        assert_eq!(err.kind(), kind, "HTTP {status}: {body}");
    }
    Ok(())
}

#[tokio::test]
async fn refresh_persists_and_keeps_refresh_token_when_not_rotated() -> anyhow::Result<()> {
    let (exchanger, mock, store) =
        exchanger_with(vec![(200, token_body("a@x.com", "fresh", None, 3600))]).await?;
    let original = record("a@x.com", 1, Some("keep-me"));
    let created = original.created_at_ms;
    store.update_token(original).await?;

    let refreshed = exchanger.refresh("a@x.com").await?;
    assert_eq!(refreshed.access_token, "fresh");
    assert!(refreshed.expires_at_ms > epoch_ms());

    let stored = store.get_token("a@x.com").await?.expect("record");
    assert_eq!(stored.access_token, "fresh");
    assert_eq!(stored.refresh_token.as_deref(), Some("keep-me"));
    assert_eq!(stored.created_at_ms, created);
    assert!(mock.token_requests()[0].contains("grant_type=refresh_token"));
    Ok(())
}

#[tokio::test]
async fn refresh_stores_rotated_refresh_token() -> anyhow::Result<()> {
    let (exchanger, _mock, store) =
        exchanger_with(vec![(200, token_body("a@x.com", "fresh", Some("rotated"), 3600))]).await?;
    store.update_token(record("a@x.com", 1, Some("old"))).await?;
    exchanger.refresh("a@x.com").await?;
    let stored = store.get_token("a@x.com").await?.expect("record");
    assert_eq!(stored.refresh_token.as_deref(), Some("rotated"));
    assert!(stored.refresh_expires_at_ms.is_some());
    Ok(())
}

#[tokio::test]
async fn valid_access_token_skips_refresh_when_fresh() -> anyhow::Result<()> {
    let (exchanger, mock, store) = exchanger_with(vec![]).await?;
    let mut r = record("a@x.com", epoch_ms() + 3_600_000, Some("rt"));
    r.access_token = "still-good".into();
    store.update_token(r).await?;

    let token = exchanger.valid_access_token("a@x.com").await?;
    assert_eq!(token.access_token, "still-good");
    assert_eq!(mock.token_calls(), 0);
    Ok(())
}
