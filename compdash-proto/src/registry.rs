//! Release-registry JSON types.
//!
//! The registry is a GitHub Releases listing consumed read-only by both the
//! agent (autonomous self-update) and the collector (fleet update gating).

use serde::Deserialize;

use crate::version::SemanticVersion;

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

impl Release {
    /// Pick the newest release with a parseable version tag. Unparseable
    /// tags are skipped rather than treated as errors.
    pub fn newest(releases: &[Release]) -> Option<(&Release, SemanticVersion)> {
        releases
            .iter()
            .filter_map(|r| SemanticVersion::parse(&r.tag_name).map(|v| (r, v)))
            .max_by(|(_, a), (_, b)| a.cmp(b))
    }

    /// Find the downloadable asset for a deployable on this platform:
    /// `<platform-token>` + role in the name, `.zip` suffix.
    pub fn find_asset(&self, platform: &str, role: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| {
            let lower = asset.name.to_lowercase();
            lower.contains(platform) && lower.contains(role) && lower.ends_with(".zip")
        })
    }
}
