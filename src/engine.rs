//! Backup Engine - orchestrates discovery, filtering and scheduled backup jobs
//!
//! The engine resolves credentials into platform adapters, runs discovery,
//! narrows the result through the filter stages and hands the survivors to
//! the scheduler. The reporter's summary is the only thing it returns.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bitbucket::BitbucketDiscovery;
use crate::config::Config;
use crate::credentials::{host_of, Credential, CredentialProvider};
use crate::discovery::{Discovery, DiscoveryScope, MultiDiscovery, Repository};
use crate::error::BackupError;
use crate::executor::BackupExecutor;
use crate::filter::{self, smallest_candidate, FilterConfig};
use crate::git::GitClient;
use crate::github::GitHubDiscovery;
use crate::gitlab::GitLabDiscovery;
use crate::report::{AdapterFailure, RunSummary};
use crate::scheduler::Scheduler;
use crate::sink::{self, Destination, StoredArtifact};
use crate::verify::{VerificationResult, Verifier};
use crate::Platform;

/// Which repositories a run backs up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Everything that survives the filters
    #[default]
    Full,
    /// Only the smallest non-fork repository, to smoke-test a configuration
    SmokeTest,
}

/// Repositories selected for backup plus the adapters that failed
#[derive(Debug, Default)]
pub struct Selection {
    pub repositories: Vec<Repository>,
    pub failures: Vec<AdapterFailure>,
}

/// Credential provider for a platform, honouring the configured GitLab host
pub fn credential_provider(config: &Config, platform: Platform) -> CredentialProvider {
    let host = match platform {
        Platform::GitLab => host_of(&config.platforms.gitlab.url),
        Platform::GitHub => "github.com".to_string(),
        Platform::Bitbucket => "bitbucket.org".to_string(),
    };
    CredentialProvider::for_platform(platform, &host)
}

/// Construct the adapter for one platform
pub fn build_adapter(
    config: &Config,
    platform: Platform,
    credential: &Credential,
) -> Result<Box<dyn Discovery>, BackupError> {
    let retry = config.retry.clone();
    let adapter: Box<dyn Discovery> = match platform {
        Platform::GitHub => Box::new(GitHubDiscovery::new(&config.platforms.github, credential, retry)?),
        Platform::GitLab => Box::new(GitLabDiscovery::new(&config.platforms.gitlab, credential, retry)),
        Platform::Bitbucket => Box::new(BitbucketDiscovery::new(
            &config.platforms.bitbucket,
            credential,
            retry,
        )?),
    };
    Ok(adapter)
}

/// One adapter per enabled platform with a resolvable credential
///
/// Platforms without a credential are skipped with a warning. Ending up
/// with no adapters at all is a configuration error.
pub fn build_discovery(config: &Config, filters: &FilterConfig) -> Result<MultiDiscovery, BackupError> {
    let mut discovery = MultiDiscovery::new();

    for platform in config.enabled_platforms() {
        let Some(credential) = credential_provider(config, platform).resolve() else {
            warn!(
                "No {} credential found, skipping platform",
                platform.display_name()
            );
            continue;
        };

        let scope = filters
            .orgs
            .get(&platform)
            .map(|list| DiscoveryScope::from_allow_list(list))
            .unwrap_or_else(DiscoveryScope::unrestricted);
        debug!("{} discovery scope: {:?}", platform.display_name(), scope);

        discovery.add_source(build_adapter(config, platform, &credential)?, scope);
    }

    if discovery.is_empty() {
        return Err(BackupError::Config(
            "no platform has a usable credential".to_string(),
        ));
    }

    Ok(discovery)
}

/// The main engine that drives one backup run
pub struct BackupEngine {
    config: Arc<Config>,
    filters: FilterConfig,
    destination: Arc<dyn Destination>,
    cancel: CancellationToken,
}

impl BackupEngine {
    /// Create an engine writing to the configured destination
    pub fn new(config: Config) -> Result<Self> {
        let destination: Arc<dyn Destination> = Arc::from(
            sink::from_config(&config).context("Failed to set up the backup destination")?,
        );
        Self::with_destination(config, destination)
    }

    pub fn with_destination(config: Config, destination: Arc<dyn Destination>) -> Result<Self> {
        let filters = FilterConfig::from_config(&config).context("Invalid repository filters")?;
        Ok(Self {
            config: Arc::new(config),
            filters,
            destination,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that cancels the running backup when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn destination(&self) -> &Arc<dyn Destination> {
        &self.destination
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Discover with credential-resolved adapters and run the backup
    pub async fn run(&self, mode: RunMode) -> Result<RunSummary> {
        let discovery = build_discovery(&self.config, &self.filters)?;
        self.run_with(&discovery, mode).await
    }

    /// Run the backup over an already-built set of adapters
    pub async fn run_with(&self, discovery: &MultiDiscovery, mode: RunMode) -> Result<RunSummary> {
        let started = Instant::now();
        info!(
            "Starting backup run to {} (method {})",
            self.destination.describe(),
            self.config.backup.method
        );

        let selection = self.select(discovery).await;
        let repositories = match mode {
            RunMode::Full => selection.repositories,
            RunMode::SmokeTest => {
                let candidate = smallest_candidate(&selection.repositories).cloned();
                match &candidate {
                    Some(repo) => info!(
                        "Test mode: backing up only {} ({} bytes)",
                        repo.qualified_name(),
                        repo.size_bytes.unwrap_or(0)
                    ),
                    None => warn!("Test mode: no non-fork repository with a known size"),
                }
                candidate.into_iter().collect()
            }
        };

        let executor = BackupExecutor::new(&self.config, self.destination.clone());
        let scheduler = Scheduler::new(
            Arc::new(executor),
            self.config.backup.workers,
            self.config.job_timeout(),
        )
        .with_run_timeout(self.config.run_timeout())
        .with_cancellation(self.cancel.clone());

        let outcomes = scheduler.run(repositories).await;
        let summary = RunSummary::compile(outcomes, selection.failures, started.elapsed());

        info!(
            "Backup run finished in {:.2}s: {} jobs, {} failed, {} bytes written",
            summary.duration.as_secs_f64(),
            summary.total_jobs(),
            summary.failed_jobs().count(),
            summary.bytes_written
        );

        Ok(summary)
    }

    /// Discovery followed by the filter stages
    pub async fn select(&self, discovery: &MultiDiscovery) -> Selection {
        let report = discovery.discover_all().await;
        let failures = report
            .failures
            .iter()
            .map(|(platform, error)| AdapterFailure::new(*platform, error))
            .collect();

        let discovered = report.repositories.len();
        let repositories = filter::filter(&report.repositories, &self.filters);
        info!(
            "Selected {} of {} discovered repositories",
            repositories.len(),
            discovered
        );

        Selection {
            repositories,
            failures,
        }
    }

    /// Stored artifacts under the prefix, newest first
    pub async fn list_backups(&self, platforms: &[Platform]) -> Result<Vec<StoredArtifact>, BackupError> {
        let prefix = self.config.destination.prefix.trim_end_matches('/');
        let prefixes: Vec<String> = if platforms.is_empty() {
            vec![format!("{}/", prefix)]
        } else {
            platforms
                .iter()
                .map(|platform| format!("{}/{}/", prefix, platform.as_str()))
                .collect()
        };

        let mut artifacts = Vec::new();
        for prefix in &prefixes {
            artifacts.extend(self.destination.list(prefix).await?);
        }

        artifacts.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.key.cmp(&b.key)));
        Ok(artifacts)
    }

    /// Verify a local file or directory, or else a key prefix in the destination
    pub async fn verify_backups(&self, target: &str) -> Result<Vec<VerificationResult>> {
        let verifier = Verifier::new(GitClient::new(self.config.retry.clone()));
        let path = Path::new(target);

        if path.exists() {
            return verifier.verify_local(path).await;
        }

        info!(
            "{} is not a local path, verifying prefix in {}",
            target,
            self.destination.describe()
        );
        verifier
            .verify_stored(self.destination.as_ref(), target)
            .await
            .with_context(|| format!("Failed to verify backups under {}", target))
    }
}
