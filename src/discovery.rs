//! Repository discovery abstraction layer
//!
//! Each hosting platform implements [`Discovery`] and normalizes its API
//! responses into [`Repository`]. [`MultiDiscovery`] runs every configured
//! adapter and merges the results without deduplicating across platforms.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{redact_url, BackupError};
use crate::retry::is_throttled;

/// Keyword in an organization list that pulls in the credential owner's own repositories
pub const USER_KEYWORD: &str = "user";

/// Source-control platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[value(name = "github")]
    GitHub,
    #[value(name = "gitlab")]
    GitLab,
    #[value(name = "bitbucket")]
    Bitbucket,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::GitHub, Platform::GitLab, Platform::Bitbucket];

    /// Lowercase identifier used in artifact keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::GitHub => "github",
            Platform::GitLab => "gitlab",
            Platform::Bitbucket => "bitbucket",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::GitHub => "GitHub",
            Platform::GitLab => "GitLab",
            Platform::Bitbucket => "Bitbucket",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Platform::GitHub),
            "gitlab" => Ok(Platform::GitLab),
            "bitbucket" => Ok(Platform::Bitbucket),
            other => Err(BackupError::Config(format!("unknown platform: {}", other))),
        }
    }
}

/// Platform-agnostic repository snapshot produced by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub platform: Platform,

    /// Organization, group path or workspace slug
    pub owner: String,

    pub name: String,

    /// HTTPS clone URL with the credential embedded
    pub clone_url: String,

    pub default_branch: Option<String>,

    /// Size estimate in bytes as reported by the platform
    pub size_bytes: Option<u64>,

    /// Latest committer time across all refs, once known
    pub last_commit_at: Option<DateTime<Utc>>,

    pub is_fork: bool,

    /// Owned by the authenticated account rather than an organization
    pub is_personal: bool,

    pub is_private: bool,

    /// Uses Git LFS; known only after the mirror clone
    pub has_lfs: bool,
}

impl Repository {
    pub fn new(platform: Platform, owner: impl Into<String>, name: impl Into<String>, clone_url: impl Into<String>) -> Self {
        Self {
            platform,
            owner: owner.into(),
            name: name.into(),
            clone_url: clone_url.into(),
            default_branch: None,
            size_bytes: None,
            last_commit_at: None,
            is_fork: false,
            is_personal: false,
            is_private: false,
            has_lfs: false,
        }
    }

    /// owner/name
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// platform:owner/name
    pub fn qualified_name(&self) -> String {
        format!("{}:{}/{}", self.platform, self.owner, self.name)
    }

    /// Identity key; unique within a run
    pub fn identity(&self) -> (Platform, &str, &str) {
        (self.platform, &self.owner, &self.name)
    }

    /// Clone URL safe for logs
    pub fn redacted_clone_url(&self) -> String {
        redact_url(&self.clone_url)
    }

    pub fn with_last_commit(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_commit_at = at;
        self
    }

    pub fn with_lfs(mut self, has_lfs: bool) -> Self {
        self.has_lfs = has_lfs;
        self
    }
}

/// Organization scope handed to an adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryScope {
    /// Named organizations/groups/workspaces, without the user keyword
    pub orgs: Vec<String>,

    /// Include the credential owner's own repositories
    pub include_user: bool,
}

impl DiscoveryScope {
    /// Everything the credential can see
    pub fn unrestricted() -> Self {
        Self {
            orgs: Vec::new(),
            include_user: true,
        }
    }

    /// Build from a configured allow-list; an empty list is unrestricted
    pub fn from_allow_list(list: &[String]) -> Self {
        if list.iter().all(|entry| entry.trim().is_empty()) {
            return Self::unrestricted();
        }

        let include_user = list
            .iter()
            .any(|entry| entry.trim().eq_ignore_ascii_case(USER_KEYWORD));
        let orgs = list
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty() && !entry.eq_ignore_ascii_case(USER_KEYWORD))
            .map(str::to_string)
            .collect();

        Self { orgs, include_user }
    }

    /// True when discovery must stay inside the named set
    pub fn is_restricted(&self) -> bool {
        !self.orgs.is_empty() || !self.include_user
    }
}

/// Trait for repository discovery from a hosting platform
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Discover repositories visible to this adapter's credential
    ///
    /// Results are deduplicated within the platform. `Auth` and `Discovery`
    /// errors are fatal for this adapter only.
    async fn discover(&self, scope: &DiscoveryScope) -> Result<Vec<Repository>, BackupError>;

    fn platform(&self) -> Platform;

    /// Cheap credential check used by the health command
    async fn check_auth(&self) -> Result<String, BackupError>;
}

/// Outcome of running every adapter
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub repositories: Vec<Repository>,
    pub failures: Vec<(Platform, BackupError)>,
}

/// Aggregates multiple discovery sources
pub struct MultiDiscovery {
    sources: Vec<(Box<dyn Discovery>, DiscoveryScope)>,
}

impl MultiDiscovery {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn add_source(&mut self, source: Box<dyn Discovery>, scope: DiscoveryScope) {
        self.sources.push((source, scope));
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> impl Iterator<Item = &dyn Discovery> {
        self.sources.iter().map(|(source, _)| source.as_ref())
    }

    /// Discover from all configured sources; one adapter's failure never stops the others
    pub async fn discover_all(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for (source, scope) in &self.sources {
            let platform = source.platform();
            match source.discover(scope).await {
                Ok(repos) => {
                    info!(
                        "Discovered {} repositories from {}",
                        repos.len(),
                        platform.display_name()
                    );
                    report.repositories.extend(repos);
                }
                Err(e) => {
                    warn!("Failed to discover from {}: {}", platform.display_name(), e);
                    report.failures.push((platform, e));
                }
            }
        }

        report
    }
}

impl Default for MultiDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure of a single platform API call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// 401, or 403 without a rate-limit marker
    Unauthorized(String),
    /// 429 or 503, or 403 mentioning a rate limit
    RateLimited(String),
    Other(String),
}

impl ApiError {
    /// Classify an HTTP error status and body
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body.trim());
        let rate_marker = body.to_ascii_lowercase().contains("rate limit");
        match status {
            s if is_throttled(s) => ApiError::RateLimited(message),
            403 if rate_marker => ApiError::RateLimited(message),
            401 | 403 => ApiError::Unauthorized(message),
            _ => ApiError::Other(message),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ApiError::RateLimited(_))
    }

    /// Adapter-level error once retries are exhausted
    pub fn into_backup_error(self, platform: Platform) -> BackupError {
        match self {
            ApiError::Unauthorized(message) => BackupError::auth(platform.as_str(), message),
            ApiError::RateLimited(message) => {
                BackupError::discovery(platform.as_str(), format!("rate limited: {}", message))
            }
            ApiError::Other(message) => BackupError::discovery(platform.as_str(), message),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized(m) | ApiError::RateLimited(m) | ApiError::Other(m) => {
                f.write_str(m)
            }
        }
    }
}

/// Drop repeated identities, keeping first occurrence order
pub fn dedupe_repositories(repos: Vec<Repository>) -> Vec<Repository> {
    let mut seen = HashSet::new();
    repos
        .into_iter()
        .filter(|repo| {
            seen.insert((
                repo.platform,
                repo.owner.to_ascii_lowercase(),
                repo.name.to_ascii_lowercase(),
            ))
        })
        .collect()
}

/// Put credentials into an HTTPS URL's user-info, replacing any already there
///
/// Both parts are percent-encoded, so secrets containing `@`, `:` or `/`
/// survive. Non-HTTPS URLs (SSH, local paths) are returned unchanged.
pub fn inject_credentials(url: &str, username: &str, password: Option<&str>) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    if parsed.scheme() != "https" {
        return url.to_string();
    }
    if parsed.set_username(username).is_err() || parsed.set_password(password).is_err() {
        return url.to_string();
    }
    parsed.to_string()
}
