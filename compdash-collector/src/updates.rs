//! Version-gated fleet updates and collector self-update.
//!
//! The release registry is consulted at most once per cache window; pushes
//! to agents are the empty-body `/update` trigger, which the agent answers
//! with 200 once it has accepted responsibility for its own update. The
//! dashboard must never push while it is itself out of date, or an old
//! dashboard could downgrade newer agents.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use compdash_proto::registry::Release;
use compdash_proto::{wire, Endpoint, SemanticVersion};

use crate::fleet::Fleet;

const CACHE_WINDOW: Duration = Duration::from_secs(15 * 60);
const CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);
const PUSH_DEADLINE: Duration = Duration::from_secs(10);
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum PushError {
    #[error("update push timed out")]
    Timeout,
    #[error("update push was cancelled")]
    Cancelled,
    #[error("agent rejected the update: {0}")]
    AgentRejected(String),
    #[error("release registry error: {0}")]
    GithubApi(String),
    #[error("dashboard is out of date; it must update before pushing to agents")]
    DashboardOutdated,
    #[error(transparent)]
    Transport(#[from] std::io::Error),
}

#[derive(Default)]
struct RegistryCache {
    fetched_at: Option<Instant>,
    latest: Option<(Release, SemanticVersion)>,
}

pub struct UpdateController {
    fleet: Arc<Fleet>,
    github_repo: String,
    own_version: Option<SemanticVersion>,
    http: reqwest::Client,
    cache: Mutex<RegistryCache>,
}

impl UpdateController {
    pub fn new(fleet: Arc<Fleet>, github_repo: &str, own_version: &str) -> Self {
        Self {
            fleet,
            github_repo: github_repo.to_string(),
            own_version: SemanticVersion::parse(own_version),
            http: reqwest::Client::new(),
            cache: Mutex::new(RegistryCache::default()),
        }
    }

    /// Check at start, then on a fixed cadence. Never returns.
    pub async fn run_periodic(self: Arc<Self>) {
        loop {
            self.check_for_update().await;
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Refresh the registry cache if stale; returns the latest known
    /// version. An unreachable registry is not an error here: the stale
    /// answer stands and the next tick retries.
    pub async fn check_for_update(&self) -> Option<SemanticVersion> {
        {
            let cache = self.cache.lock();
            if matches!(cache.fetched_at, Some(at) if at.elapsed() < CACHE_WINDOW) {
                return cache.latest.as_ref().map(|(_, version)| version.clone());
            }
        }

        match self.fetch_releases().await {
            Ok(releases) => {
                let latest = Release::newest(&releases)
                    .map(|(release, version)| (release.clone(), version));
                if let Some((_, version)) = &latest {
                    info!("latest published version: {version}");
                }
                let mut cache = self.cache.lock();
                cache.fetched_at = Some(Instant::now());
                cache.latest = latest;
                cache.latest.as_ref().map(|(_, version)| version.clone())
            }
            Err(e) => {
                warn!("release check failed: {e:#}");
                self.cache.lock().latest.as_ref().map(|(_, v)| v.clone())
            }
        }
    }

    /// Invalidate the cache and refresh now.
    pub async fn force_check(&self) -> Option<SemanticVersion> {
        self.cache.lock().fetched_at = None;
        self.check_for_update().await
    }

    pub fn latest_version(&self) -> Option<SemanticVersion> {
        self.cache
            .lock()
            .latest
            .as_ref()
            .map(|(_, version)| version.clone())
    }

    /// True iff the latest known version is newer than the agent's. A
    /// missing or unparseable agent version is conservatively "no".
    pub fn agent_needs_update(&self, agent_version: Option<&str>) -> bool {
        let Some(latest) = self.latest_version() else {
            return false;
        };
        let Some(version) = agent_version.and_then(SemanticVersion::parse) else {
            return false;
        };
        latest > version
    }

    fn dashboard_outdated(&self) -> bool {
        match (&self.own_version, self.latest_version()) {
            (Some(own), Some(latest)) => latest > *own,
            _ => false,
        }
    }

    /// Trigger a self-update on one agent: `POST /update` with an empty
    /// body, 10-second deadline, 200 required.
    ///
    /// Refused while the dashboard itself is out of date. An agent whose
    /// reported version is already current is skipped.
    pub async fn push_update_to_agent(
        &self,
        endpoint: &Endpoint,
        agent_version: Option<&str>,
    ) -> Result<(), PushError> {
        if self.dashboard_outdated() {
            return Err(PushError::DashboardOutdated);
        }
        if let (Some(latest), Some(version)) = (
            self.latest_version(),
            agent_version.and_then(SemanticVersion::parse),
        ) {
            if latest <= version {
                debug!("agent at {endpoint} already runs {version}");
                return Ok(());
            }
        }

        info!("pushing update trigger to {endpoint}");
        tokio::time::timeout(PUSH_DEADLINE, push_trigger(endpoint))
            .await
            .map_err(|_| PushError::Timeout)?
    }

    /// Push to every outdated agent concurrently; returns when all pushes
    /// have finished. Per-agent results land on the machine's `last_error`.
    pub async fn update_all(self: &Arc<Self>) -> Vec<(String, Result<(), PushError>)> {
        self.check_for_update().await;

        let mut candidates = Vec::new();
        for entry in self.fleet.snapshot() {
            let agent_version = entry
                .latest_status
                .as_ref()
                .and_then(|status| status.agent_version.clone());
            if !self.agent_needs_update(agent_version.as_deref()) {
                continue;
            }
            let Some(endpoint) = self.fleet.resolve_endpoint(&entry.identity.hardware_uuid) else {
                debug!(
                    "no reachable endpoint for {}, skipping push",
                    entry.identity.display_name
                );
                continue;
            };
            candidates.push((entry.identity.hardware_uuid, endpoint, agent_version));
        }

        let mut pushes = JoinSet::new();
        for (hardware_uuid, endpoint, agent_version) in candidates {
            let controller = Arc::clone(self);
            pushes.spawn(async move {
                let result = controller
                    .push_update_to_agent(&endpoint, agent_version.as_deref())
                    .await;
                (hardware_uuid, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = pushes.join_next().await {
            let Ok((hardware_uuid, result)) = joined else {
                continue;
            };
            let error = result.as_ref().err().map(ToString::to_string);
            self.fleet.set_last_error(&hardware_uuid, error).await;
            results.push((hardware_uuid, result));
        }
        results
    }

    /// Fetch the dashboard's own release archive and hand it to the
    /// updater. On success the process exits and the trampoline relaunches
    /// the new bundle.
    pub async fn update_dashboard(&self) -> Result<()> {
        self.force_check().await;

        let (release, version) = {
            let cache = self.cache.lock();
            cache
                .latest
                .clone()
                .context("no release available to update to")?
        };
        if let Some(own) = &self.own_version {
            if version <= *own {
                info!("dashboard already runs {own}");
                return Ok(());
            }
        }

        let asset = release
            .find_asset(platform_token(), "dashboard")
            .context("release has no dashboard asset for this platform")?;

        info!("updating dashboard to {version}");
        let response = self
            .http
            .get(&asset.browser_download_url)
            .header("User-Agent", "compdash-collector")
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .context("asset download failed")?;
        if !response.status().is_success() {
            anyhow::bail!("asset download returned {}", response.status());
        }
        let archive = response.bytes().await.context("asset download truncated")?;

        compdash_update::apply_archive(&archive)
            .await
            .context("bundle swap failed")?;
        Ok(())
    }

    async fn fetch_releases(&self) -> Result<Vec<Release>> {
        let url = format!("https://api.github.com/repos/{}/releases", self.github_repo);
        let response = self
            .http
            .get(&url)
            .header("User-Agent", "compdash-collector")
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
}

async fn push_trigger(endpoint: &Endpoint) -> Result<(), PushError> {
    let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    stream
        .write_all(&wire::build_request("POST", "/update", b"", None))
        .await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;

    match wire::parse_status_code(&raw) {
        Some(200) => Ok(()),
        Some(code) => {
            let detail = wire::extract_body(&raw)
                .map(|body| String::from_utf8_lossy(body).into_owned())
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| format!("status {code}"));
            Err(PushError::AgentRejected(detail))
        }
        None => Err(PushError::AgentRejected(
            "connection closed before a response".to_string(),
        )),
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
