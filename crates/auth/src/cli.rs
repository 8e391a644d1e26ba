// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `coopauth` subcommands.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::callback::CallbackListener;
use crate::config::AuthConfig;
use crate::error::AuthResult;
use crate::orchestrator::{AuthOrchestrator, AuthOutcome, BrowserLauncher, NoBrowser, SystemBrowser};
use crate::store::{epoch_ms, CredentialRecord, CredentialStore, FileStore};

#[derive(Debug, Parser)]
#[command(name = "coopauth", version, about = "OAuth login and token broker for coop")]
pub struct Cli {
    #[command(flatten)]
    pub config: AuthConfig,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sign a user in through the browser and store their credential
    Login {
        /// Seconds to wait for the redirect (defaults to --login-timeout-secs)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Serve the callback port until interrupted
    Serve,
    /// Print a valid access token for a user, refreshing if needed
    Token {
        user: String,
    },
    /// List stored users
    Users,
    /// Delete a user's stored credential
    Logout {
        user: String,
    },
    /// Remove credentials that can no longer be used or refreshed
    Cleanup,
}

impl Cli {
    /// Check flags before anything runs. Commands that talk to the provider
    /// also need a complete provider config (client id and endpoints).
    pub fn validate(&self) -> AuthResult<()> {
        self.config.validate()?;
        if self.command.needs_provider() {
            self.config.provider()?;
        }
        Ok(())
    }
}

impl Command {
    pub fn needs_provider(&self) -> bool {
        matches!(self, Self::Login { .. } | Self::Serve | Self::Token { .. })
    }
}

/// Run a parsed command. Returns the process exit code.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = cli.config;
    match cli.command {
        Command::Login { timeout } => {
            let timeout = timeout.map(Duration::from_secs).unwrap_or_else(|| config.login_timeout());
            login(&config, timeout).await
        }
        Command::Serve => {
            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());
            crate::serve(config, shutdown).await?;
            Ok(0)
        }
        Command::Token { user } => {
            let exchanger = crate::build_exchanger(&config)?;
            let token = exchanger.valid_access_token(&user).await?;
            println!("{}", token.access_token);
            Ok(0)
        }
        Command::Users => {
            let store = FileStore::new(config.store_path());
            let mut records = Vec::new();
            for user in store.list_users().await? {
                if let Some(record) = store.get_token(&user).await? {
                    records.push(record);
                }
            }
            print_users(&records, epoch_ms());
            Ok(0)
        }
        Command::Logout { user } => {
            let store = FileStore::new(config.store_path());
            if store.delete_token(&user).await? {
                println!("logged out {user}");
                Ok(0)
            } else {
                eprintln!("no credential stored for {user}");
                Ok(1)
            }
        }
        Command::Cleanup => {
            let store = FileStore::new(config.store_path());
            let removed = store.cleanup_expired(epoch_ms()).await?;
            println!("removed {removed} expired credential(s)");
            Ok(0)
        }
    }
}

async fn login(config: &AuthConfig, timeout: Duration) -> anyhow::Result<i32> {
    let exchanger = crate::build_exchanger(config)?;
    let listener = Arc::new(CallbackListener::new(config, exchanger));
    let browser: Arc<dyn BrowserLauncher> =
        if config.no_browser { Arc::new(NoBrowser) } else { Arc::new(SystemBrowser) };
    let orchestrator = AuthOrchestrator::new(listener, browser)
        .with_poll_interval(config.poll_interval())
        .on_url(|url| eprintln!("Open this URL to sign in:\n\n  {url}\n"));

    match orchestrator.authenticate(timeout).await {
        AuthOutcome::Success(user) => {
            println!("{}", user.user_id);
            Ok(0)
        }
        AuthOutcome::Timeout => {
            eprintln!("login timed out after {}s", timeout.as_secs());
            Ok(1)
        }
        AuthOutcome::Error(body) => {
            eprintln!("login failed ({}): {}", body.code, body.message);
            Ok(1)
        }
    }
}

/// Human-readable time until `expires_at_ms`.
pub fn format_expires(expires_at_ms: u64, now_ms: u64) -> String {
    if expires_at_ms == 0 {
        return "never".to_owned();
    }
    if expires_at_ms <= now_ms {
        return "expired".to_owned();
    }
    let secs = (expires_at_ms - now_ms) / 1000;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    if h > 0 {
        format!("{h}h {m:02}m")
    } else {
        format!("{m}m {:02}s", secs % 60)
    }
}

fn print_users(records: &[CredentialRecord], now_ms: u64) {
    if records.is_empty() {
        println!("no stored users");
        return;
    }
    let user_w = records.iter().map(|r| r.user_id.len()).max().unwrap_or(0).max(4);
    println!("{:<user_w$}  {:<12}  REFRESH", "USER", "EXPIRES IN");
    for r in records {
        let refresh = if r.refresh_token.is_some() { "yes" } else { "no" };
        println!("{:<user_w$}  {:<12}  {refresh}", r.user_id, format_expires(r.expires_at_ms, now_ms));
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
                shutdown.cancel();
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
                shutdown.cancel();
            }
        }
    });
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
