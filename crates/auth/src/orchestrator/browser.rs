// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use async_trait::async_trait;

/// Opens an authorization URL for the user.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn open(&self, url: &str) -> anyhow::Result<()>;
}

/// Launches the platform's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

#[async_trait]
impl BrowserLauncher for SystemBrowser {
    async fn open(&self, url: &str) -> anyhow::Result<()> {
        let url = url.to_owned();
        tokio::task::spawn_blocking(move || open::that(url)).await??;
        Ok(())
    }
}

/// Never opens anything; the URL is only surfaced through logs and hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBrowser;

#[async_trait]
impl BrowserLauncher for NoBrowser {
    async fn open(&self, _url: &str) -> anyhow::Result<()> {
        anyhow::bail!("browser launch disabled")
    }
}
