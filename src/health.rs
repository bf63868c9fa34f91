//! Preflight checks for RepoVault
//!
//! [`HealthCheck`] exercises the environment a backup run depends on: git,
//! platform credentials and the destination. [`ConfigValidation`] is the
//! offline subset that never touches the network.

use crate::config::Config;
use crate::discovery::DiscoveryScope;
use crate::engine::{build_adapter, credential_provider};
use crate::filter::FilterConfig;
use crate::git::GitClient;
use crate::sink;
use crate::Platform;
use std::path::Path;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// git-lfs presence (warning only)
    pub git_lfs: CheckResult,
    /// Authentication per enabled platform
    pub platforms: Vec<(Platform, CheckResult)>,
    /// Destination reachability
    pub destination: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

#[allow(dead_code)]
impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config) -> Self {
        let mut platforms = Vec::new();
        for platform in config.enabled_platforms() {
            platforms.push((platform, Self::check_platform(config, platform).await));
        }

        Self {
            git: Self::check_git().await,
            git_lfs: Self::check_git_lfs(config).await,
            platforms,
            destination: Self::check_destination(config).await,
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.errors().is_empty()
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| r.is_warning)
            .collect()
    }

    async fn check_git() -> CheckResult {
        match GitClient::version("git", &["--version"]).await {
            Some(version) => CheckResult::ok_with_details("Git installed", version),
            None => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    /// Missing git-lfs only matters for LFS repositories
    async fn check_git_lfs(config: &Config) -> CheckResult {
        match GitClient::version("git", &["lfs", "version"]).await {
            Some(version) => CheckResult::ok_with_details("Git LFS installed", version),
            None if !config.backup.lfs => CheckResult::ok("Git LFS backup disabled"),
            None => CheckResult::warning_with_details(
                "Git LFS not installed",
                "LFS objects will not be backed up. Install: https://git-lfs.com",
            ),
        }
    }

    /// Authenticate and count visible repositories
    async fn check_platform(config: &Config, platform: Platform) -> CheckResult {
        let name = platform.display_name();
        let provider = credential_provider(config, platform);
        let Some(credential) = provider.resolve() else {
            let details = provider
                .require()
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default();
            return CheckResult::warning_with_details(
                format!("No {} credential, platform will be skipped", name),
                details,
            );
        };

        let adapter = match build_adapter(config, platform, &credential) {
            Ok(adapter) => adapter,
            Err(e) => {
                return CheckResult::error_with_details(format!("{} misconfigured", name), e.to_string())
            }
        };

        let identity = match adapter.check_auth().await {
            Ok(identity) => identity,
            Err(e) => {
                return CheckResult::error_with_details(
                    format!("{} authentication failed", name),
                    format!("{} (credential from {})", e, credential.source),
                )
            }
        };

        match adapter.discover(&DiscoveryScope::unrestricted()).await {
            Ok(repos) => CheckResult::ok_with_details(
                format!("{} authentication successful", name),
                format!("{}: {} repositories visible", identity, repos.len()),
            ),
            Err(e) => CheckResult::error_with_details(
                format!("{} repository listing failed", name),
                e.to_string(),
            ),
        }
    }

    /// Destination accepts a probe write
    async fn check_destination(config: &Config) -> CheckResult {
        let destination = match sink::from_config(config) {
            Ok(destination) => destination,
            Err(e) => return CheckResult::error_with_details("No usable destination", e.to_string()),
        };

        match destination.probe().await {
            Ok(()) => CheckResult::ok_with_details("Destination writable", destination.describe()),
            Err(e) => CheckResult::error_with_details(
                format!("Destination {} not writable", destination.describe()),
                e.to_string(),
            ),
        }
    }

    /// Get all checks for iteration
    pub fn all_checks(&self) -> Vec<(String, &CheckResult)> {
        let mut checks = vec![
            ("Git Installation".to_string(), &self.git),
            ("Git LFS".to_string(), &self.git_lfs),
        ];
        checks.extend(
            self.platforms
                .iter()
                .map(|(platform, result)| (format!("{} Authentication", platform.display_name()), result)),
        );
        checks.push(("Destination".to_string(), &self.destination));
        checks
    }
}

/// Offline configuration check
#[derive(Debug, Clone, Default)]
pub struct ConfigValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigValidation {
    pub fn run(config: &Config) -> Self {
        let mut validation = Self::default();

        if let Err(e) = config.validate() {
            validation.errors.push(e.to_string());
        }

        if let Err(e) = FilterConfig::from_config(config) {
            validation.errors.push(format!("{:#}", e));
        }

        // validate() stops at the first problem; report the work dir regardless
        if let Some(work_dir) = &config.backup.work_dir {
            let reported = validation.errors.iter().any(|e| e.contains("working directory"));
            if !reported && !Path::new(work_dir).is_dir() {
                validation
                    .errors
                    .push(format!("working directory does not exist: {}", work_dir));
            }
        }

        let mut resolved = 0;
        for platform in config.enabled_platforms() {
            let Some(credential) = credential_provider(config, platform).resolve() else {
                validation.warnings.push(format!(
                    "no {} credential found; the platform will be skipped",
                    platform.display_name()
                ));
                continue;
            };
            resolved += 1;

            if let Err(e) = build_adapter(config, platform, &credential) {
                validation.errors.push(e.to_string());
            }
        }

        if resolved == 0 && !config.enabled_platforms().is_empty() {
            validation
                .errors
                .push("no platform credential could be resolved".to_string());
        }

        if let (Some(run), job) = (config.backup.run_timeout, config.backup.job_timeout) {
            if run < job {
                validation.warnings.push(format!(
                    "run_timeout ({}s) is shorter than job_timeout ({}s)",
                    run, job
                ));
            }
        }

        validation
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}
