use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BackupError;

/// Main configuration structure for RepoVault
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Where artifacts are written
    #[serde(default)]
    pub destination: DestinationConfig,

    /// Per-platform discovery settings
    #[serde(default)]
    pub platforms: PlatformsConfig,

    /// Repository selection
    #[serde(default)]
    pub filters: FiltersConfig,

    /// Backup execution settings
    #[serde(default)]
    pub backup: BackupConfig,

    /// Retry policy for clones, uploads and rate-limited discovery
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Destination configuration: a local directory or an S3 bucket
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DestinationConfig {
    /// Local backup root
    pub local_path: Option<String>,

    /// S3 bucket settings
    pub s3: Option<S3Config>,

    /// Key prefix shared by both destination kinds
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct S3Config {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible stores
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct PlatformsConfig {
    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default)]
    pub gitlab: GitLabConfig,

    #[serde(default)]
    pub bitbucket: BitbucketConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Organizations to back up; "user" adds the token owner's own repositories
    #[serde(default)]
    pub include_orgs: Vec<String>,

    /// API base URL override (GitHub Enterprise)
    pub api_url: Option<String>,
}

/// GitLab configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitLabConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_gitlab_url")]
    pub url: String,

    /// Group paths to back up, subgroups included
    #[serde(default)]
    pub include_groups: Vec<String>,

    /// Group paths skipped during unrestricted discovery
    #[serde(default)]
    pub exclude_groups: Vec<String>,
}

/// Bitbucket configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BitbucketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Workspace a workspace access token is bound to
    pub workspace: Option<String>,

    /// Username paired with an app password
    pub username: Option<String>,

    #[serde(default)]
    pub include_workspaces: Vec<String>,

    #[serde(default)]
    pub exclude_workspaces: Vec<String>,

    #[serde(default = "default_bitbucket_api_url")]
    pub api_url: String,
}

/// Repository selection settings
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FiltersConfig {
    /// Platform allow-list; empty means every configured platform
    #[serde(default)]
    pub platforms: Vec<String>,

    /// Explicit repository list (owner/name or platform:owner/name)
    #[serde(default)]
    pub repos: Vec<String>,

    /// Name patterns: exact, glob, or `re:` regex
    #[serde(default)]
    pub patterns: Vec<String>,

    /// File with one repository entry per line
    pub repos_file: Option<String>,

    #[serde(default)]
    pub include_forks: bool,

    #[serde(default)]
    pub include_personal: bool,
}

/// How a repository is packaged
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackupMethod {
    /// Single `git bundle` file with every ref
    #[default]
    #[serde(alias = "direct")]
    Bundle,
    /// Gzip-compressed tar of the bare mirror
    Archive,
}

impl BackupMethod {
    /// File suffix appended after the derived timestamp
    pub fn extension(&self) -> &'static str {
        match self {
            BackupMethod::Bundle => "bundle",
            BackupMethod::Archive => "tar.gz",
        }
    }
}

impl std::fmt::Display for BackupMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupMethod::Bundle => f.write_str("bundle"),
            BackupMethod::Archive => f.write_str("archive"),
        }
    }
}

/// Backup execution configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackupConfig {
    /// Maximum concurrent jobs
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub method: BackupMethod,

    /// Re-create artifacts even when the key already exists
    #[serde(default)]
    pub force: bool,

    /// Parent of job-scoped working directories
    pub work_dir: Option<String>,

    /// Whole-run timeout in seconds
    pub run_timeout: Option<u64>,

    /// Per-job timeout in seconds
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u64,

    /// Export LFS objects next to the main artifact
    #[serde(default = "default_true")]
    pub lfs: bool,

    /// Verify every artifact right after it is written
    #[serde(default = "default_true")]
    pub verify: bool,
}

/// Retry configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "json"
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_prefix() -> String {
    "repos".to_string()
}
fn default_region() -> String {
    "us-west-2".to_string()
}
fn default_gitlab_url() -> String {
    "https://gitlab.com".to_string()
}
fn default_bitbucket_api_url() -> String {
    "https://api.bitbucket.org/2.0".to_string()
}
fn default_workers() -> usize {
    5
}
fn default_job_timeout() -> u64 {
    3600
}
fn default_max_attempts() -> usize {
    3
}
fn default_min_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            local_path: None,
            s3: None,
            prefix: default_prefix(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            include_orgs: Vec::new(),
            api_url: None,
        }
    }
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            url: default_gitlab_url(),
            include_groups: Vec::new(),
            exclude_groups: Vec::new(),
        }
    }
}

impl Default for BitbucketConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            workspace: None,
            username: None,
            include_workspaces: Vec::new(),
            exclude_workspaces: Vec::new(),
            api_url: default_bitbucket_api_url(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            method: BackupMethod::default(),
            force: false,
            work_dir: None,
            run_timeout: None,
            job_timeout: default_job_timeout(),
            lfs: default_true(),
            verify: default_true(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repovault").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        if let Some(local_path) = &self.destination.local_path {
            self.destination.local_path = Some(
                shellexpand::full(local_path)
                    .context("Failed to expand destination.local_path")?
                    .into_owned(),
            );
        }

        if let Some(work_dir) = &self.backup.work_dir {
            self.backup.work_dir = Some(
                shellexpand::full(work_dir)
                    .context("Failed to expand backup.work_dir")?
                    .into_owned(),
            );
        }

        if let Some(repos_file) = &self.filters.repos_file {
            self.filters.repos_file = Some(
                shellexpand::full(repos_file)
                    .context("Failed to expand filters.repos_file")?
                    .into_owned(),
            );
        }

        Ok(())
    }

    /// Check the settings a run cannot start without
    pub fn validate(&self) -> std::result::Result<(), BackupError> {
        match (&self.destination.local_path, &self.destination.s3) {
            (None, None) => {
                return Err(BackupError::Config(
                    "no destination configured: set a local path or an S3 bucket".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(BackupError::Config(
                    "both a local path and an S3 bucket are configured; choose one".to_string(),
                ))
            }
            _ => {}
        }

        if let Some(s3) = &self.destination.s3 {
            if s3.bucket.trim().is_empty() {
                return Err(BackupError::Config("S3 bucket name is empty".to_string()));
            }
        }

        if self.backup.workers == 0 {
            return Err(BackupError::Config(
                "backup.workers must be at least 1".to_string(),
            ));
        }

        if let Some(work_dir) = &self.backup.work_dir {
            if !Path::new(work_dir).is_dir() {
                return Err(BackupError::Config(format!(
                    "working directory does not exist: {}",
                    work_dir
                )));
            }
        }

        if self.enabled_platforms().is_empty() {
            return Err(BackupError::Config("every platform is disabled".to_string()));
        }

        Ok(())
    }

    /// Platforms that are enabled and pass the platform allow-list
    pub fn enabled_platforms(&self) -> Vec<crate::Platform> {
        use crate::Platform;

        let allowed = |platform: Platform| {
            self.filters.platforms.is_empty()
                || self
                    .filters
                    .platforms
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(platform.as_str()))
        };

        let mut platforms = Vec::new();
        if self.platforms.github.enabled && allowed(Platform::GitHub) {
            platforms.push(Platform::GitHub);
        }
        if self.platforms.gitlab.enabled && allowed(Platform::GitLab) {
            platforms.push(Platform::GitLab);
        }
        if self.platforms.bitbucket.enabled && allowed(Platform::Bitbucket) {
            platforms.push(Platform::Bitbucket);
        }
        platforms
    }

    /// Parent directory for job-scoped working directories
    pub fn work_dir(&self) -> PathBuf {
        match &self.backup.work_dir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::temp_dir().join("repovault"),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.backup.job_timeout)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.backup.run_timeout.map(Duration::from_secs)
    }
}

/// Read repository entries from a file: one per line, `#` starts a comment
pub fn load_repos_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read repository file: {:?}", path))?;

    let entries: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    tracing::info!("Loaded {} repositories from {:?}", entries.len(), path);
    Ok(entries)
}
