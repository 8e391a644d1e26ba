// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[yare::parameterized(
    no_expiry = { 0, 1_000, "never" },
    past = { 1_000, 2_000, "expired" },
    exactly_now = { 2_000, 2_000, "expired" },
    seconds = { 2_000 + 95_000, 2_000, "1m 35s" },
    hours = { 2_000 + 2 * 3_600_000 + 5 * 60_000, 2_000, "2h 05m" },
)]
fn expiry_formatting(expires_at_ms: u64, now_ms: u64, expected: &str) {
    assert_eq!(format_expires(expires_at_ms, now_ms), expected);
}

#[test]
fn parses_login_with_timeout() -> anyhow::Result<()> {
    let cli = Cli::try_parse_from(["coopauth", "--client-id", "c", "login", "--timeout", "30"])?;
    assert!(matches!(cli.command, Command::Login { timeout: Some(30) }));
    assert_eq!(cli.config.client_id.as_deref(), Some("c"));
    Ok(())
}

#[test]
fn parses_user_subcommands() -> anyhow::Result<()> {
    let cli = Cli::try_parse_from(["coopauth", "token", "a@x.com"])?;
    assert!(matches!(cli.command, Command::Token { ref user } if user == "a@x.com"));

    let cli = Cli::try_parse_from(["coopauth", "logout", "b@x.com"])?;
    assert!(matches!(cli.command, Command::Logout { ref user } if user == "b@x.com"));

    let cli = Cli::try_parse_from(["coopauth", "cleanup"])?;
    assert!(matches!(cli.command, Command::Cleanup));
    Ok(())
}

#[yare::parameterized(
    login = { &["login"], true },
    serve = { &["serve"], true },
    token = { &["token", "a@x.com"], true },
    users = { &["users"], false },
    logout = { &["logout", "a@x.com"], false },
    cleanup = { &["cleanup"], false },
)]
fn validate_requires_provider_only_where_used(args: &[&str], needs_provider: bool) {
    let mut argv = vec!["coopauth"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).expect("parse");
    assert_eq!(cli.command.needs_provider(), needs_provider);

    let err = cli.validate().err();
    assert_eq!(err.is_some(), needs_provider, "{err:?}");
    if let Some(e) = err {
        assert_eq!(e.kind(), crate::error::ErrorKind::Config);
    }
}

#[test]
fn validate_accepts_complete_provider() -> anyhow::Result<()> {
    let cli = Cli::try_parse_from([
        "coopauth",
        "--client-id",
        "c",
        "--authorize-url",
        "http://idp/authorize",
        "--token-url",
        "http://idp/token",
        "login",
    ])?;
    cli.validate()?;
    Ok(())
}

#[test]
fn subcommand_is_required() {
    assert!(Cli::try_parse_from(["coopauth"]).is_err());
}

#[tokio::test]
async fn logout_and_cleanup_use_the_file_store() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("creds.json");
    let store = FileStore::new(&path);
    store
        .update_token(CredentialRecord {
            user_id: "a@x.com".into(),
            access_token: "at".into(),
            refresh_token: None,
            expires_at_ms: 1,
            refresh_expires_at_ms: None,
            created_at_ms: 1,
            updated_at_ms: 1,
        })
        .await?;
    let path_arg = path.to_string_lossy().into_owned();

    let cli = Cli::try_parse_from(["coopauth", "--store-path", &path_arg, "cleanup"])?;
    assert_eq!(run(cli).await?, 0);
    assert!(store.list_users().await?.is_empty());

    let cli = Cli::try_parse_from(["coopauth", "--store-path", &path_arg, "logout", "a@x.com"])?;
    assert_eq!(run(cli).await?, 1);
    Ok(())
}
