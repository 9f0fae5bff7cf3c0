//! Autonomous release checks and the single-update-in-flight latch.
//!
//! The actual bundle swap lives in `compdash-update`; this module decides
//! *when* to update: a check shortly after startup, then on a fixed
//! interval, with a cache window between scheduled checks. A forced check
//! clears the cache first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use compdash_proto::registry::Release;
use compdash_proto::SemanticVersion;
pub use compdash_update::{SwapError, MAX_UPDATE_BYTES};

const INITIAL_CHECK_DELAY: Duration = Duration::from_secs(5);
const CHECK_INTERVAL: Duration = Duration::from_secs(30 * 60);
const CACHE_WINDOW: Duration = Duration::from_secs(15 * 60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct Updater {
    current_version: String,
    github_repo: String,
    auto_update: bool,
    in_progress: AtomicBool,
    last_check: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl Updater {
    pub fn new(current_version: &str, github_repo: &str, auto_update: bool) -> Self {
        Self {
            current_version: current_version.to_string(),
            github_repo: github_repo.to_string(),
            auto_update,
            in_progress: AtomicBool::new(false),
            last_check: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    /// Claim the single-update-in-flight latch. Returns false if an update
    /// is already running.
    pub fn try_begin(&self) -> bool {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self) {
        self.in_progress.store(false, Ordering::SeqCst);
    }

    /// Apply a pushed archive. The caller must hold the latch; it is not
    /// released here on success because a successful apply exits the process.
    pub async fn apply_archive(&self, archive: &[u8]) -> Result<(), SwapError> {
        compdash_update::apply_archive(archive).await
    }

    /// Background release checks: one shortly after startup, then on a
    /// fixed interval. Never returns.
    pub async fn run_periodic_checks(self: Arc<Self>) {
        tokio::time::sleep(INITIAL_CHECK_DELAY).await;
        self.check_and_update().await;

        loop {
            tokio::time::sleep(CHECK_INTERVAL).await;
            self.check_and_update().await;
        }
    }

    /// Drop the cached check result and check immediately.
    pub async fn force_check(&self) {
        *self.last_check.lock() = None;
        self.check_and_update().await;
    }

    async fn check_and_update(&self) {
        {
            let last = self.last_check.lock();
            if matches!(*last, Some(at) if at.elapsed() < CACHE_WINDOW) {
                return;
            }
        }

        let releases = match self.fetch_releases().await {
            Ok(releases) => releases,
            Err(e) => {
                warn!("release check failed: {e:#}");
                return;
            }
        };
        *self.last_check.lock() = Some(Instant::now());

        let Some((release, newest)) = Release::newest(&releases) else {
            return;
        };
        let Some(current) = SemanticVersion::parse(&self.current_version) else {
            // A dev build has no comparable version; never downgrade it.
            return;
        };
        if newest <= current {
            return;
        }

        if !self.auto_update {
            info!("agent update {newest} available (auto-update disabled)");
            return;
        }

        let Some(asset) = release.find_asset(platform_token(), "agent") else {
            warn!("release {newest} has no agent asset for this platform");
            return;
        };
        if asset.size > MAX_UPDATE_BYTES {
            warn!("release asset {} is oversized, skipping", asset.name);
            return;
        }

        if !self.try_begin() {
            return;
        }

        info!("updating agent {current} -> {newest}");
        // A successful apply never returns; the trampoline owns the swap.
        if let Err(e) = self.download_and_apply(&asset.browser_download_url).await {
            error!("agent update failed: {e:#}");
            self.release();
        }
    }

    async fn fetch_releases(&self) -> Result<Vec<Release>> {
        let url = format!("https://api.github.com/repos/{}/releases", self.github_repo);
        let response = self
            .http
            .get(&url)
            .header("User-Agent", "compdash-agent")
            .header("Accept", "application/vnd.github+json")
            .timeout(REGISTRY_TIMEOUT)
            .send()
            .await
            .context("release registry unreachable")?;

        if !response.status().is_success() {
            anyhow::bail!("release registry returned {}", response.status());
        }

        response.json().await.context("invalid registry payload")
    }

    async fn download_and_apply(&self, url: &str) -> Result<()> {
        let response = self
            .http
            .get(url)
            .header("User-Agent", "compdash-agent")
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .context("asset download failed")?;
        if !response.status().is_success() {
            anyhow::bail!("asset download returned {}", response.status());
        }

        let archive = response.bytes().await.context("asset download truncated")?;
        self.apply_archive(&archive).await?;
        Ok(())
    }
}

fn platform_token() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        "linux"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_admits_exactly_one_update() {
        let updater = Updater::new("1.0.0", "compdash-app/compdash", true);
        assert!(updater.try_begin());
        assert!(!updater.try_begin());
        updater.release();
        assert!(updater.try_begin());
    }
}
