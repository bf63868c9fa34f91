use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::process::Output;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::discovery::Repository;
use crate::error::{redact_text, BackupError};
use crate::retry::with_retry;

/// git stderr fragment for a repository without commits
const EMPTY_BUNDLE_MARKER: &str = "Refusing to create empty bundle";

/// Clone failures that another attempt cannot fix
const PERMANENT_CLONE_MARKERS: [&str; 4] = [
    "Authentication failed",
    "could not read Username",
    "Repository not found",
    "does not appear to be a git repository",
];

/// Thin async wrapper over the `git` and `tar` executables
///
/// Every child process is killed when its future is dropped, so a cancelled
/// job does not leave clones running.
#[derive(Debug, Clone)]
pub struct GitClient {
    retry: RetryConfig,
}

impl GitClient {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    fn command(program: &str) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(program);
        cmd.kill_on_drop(true).env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        Self::command("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .with_context(|| format!("Failed to execute git {}", args.first().unwrap_or(&"")))
    }

    /// `git clone --mirror` into `target`, retrying transient failures
    pub async fn mirror_clone(&self, repo: &Repository, target: &Path) -> Result<(), BackupError> {
        let name = repo.qualified_name();
        info!("Cloning {} from {}", name, repo.redacted_clone_url());

        let label = format!("clone of {}", name);
        with_retry(
            &self.retry,
            &label,
            || self.mirror_clone_once(&repo.clone_url, target),
            |message: &String| !PERMANENT_CLONE_MARKERS.iter().any(|m| message.contains(m)),
        )
        .await
        .map_err(|message| BackupError::Clone {
            repository: name,
            message,
        })
    }

    async fn mirror_clone_once(&self, url: &str, target: &Path) -> Result<(), String> {
        if target.exists() {
            tokio::fs::remove_dir_all(target)
                .await
                .map_err(|e| format!("failed to clear partial clone: {}", e))?;
        }

        let output = Self::command("git")
            .args(["clone", "--mirror", "--quiet", url])
            .arg(target)
            .output()
            .await
            .map_err(|e| format!("failed to execute git clone: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(redact_text(stderr.trim()));
        }

        Ok(())
    }

    /// Latest committer time across all refs; `None` when there are no commits
    pub async fn last_commit_time(&self, mirror: &Path) -> Result<Option<DateTime<Utc>>> {
        let output = self
            .git(mirror, &["log", "-1", "--all", "--format=%ct"])
            .await?;

        if !output.status.success() {
            if self.is_empty(mirror).await? {
                return Ok(None);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git log failed: {}", stderr.trim()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(None);
        }

        let seconds: i64 = stdout
            .parse()
            .with_context(|| format!("Unexpected commit time: {}", stdout))?;
        Ok(DateTime::from_timestamp(seconds, 0))
    }

    /// True when no ref points at a commit
    pub async fn is_empty(&self, mirror: &Path) -> Result<bool> {
        let output = self.git(mirror, &["rev-list", "-n", "1", "--all"]).await?;
        Ok(!output.status.success() || output.stdout.iter().all(u8::is_ascii_whitespace))
    }

    /// Whether the repository tracks files with Git LFS; false when git-lfs is missing
    pub async fn has_lfs(&self, mirror: &Path) -> bool {
        match self.git(mirror, &["lfs", "ls-files"]).await {
            Ok(output) if output.status.success() => !output.stdout.is_empty(),
            Ok(output) => {
                debug!(
                    "git lfs ls-files failed in {}: {}",
                    mirror.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                debug!("git lfs unavailable: {}", e);
                false
            }
        }
    }

    /// Download every LFS object into the mirror's `lfs/objects`
    pub async fn lfs_fetch(&self, mirror: &Path) -> Result<()> {
        let output = self.git(mirror, &["lfs", "fetch", "--all"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git lfs fetch failed: {}", redact_text(stderr.trim())));
        }
        Ok(())
    }

    /// `git bundle create <output> --all`
    pub async fn create_bundle(&self, repo: &Repository, mirror: &Path, output: &Path) -> Result<(), BackupError> {
        let name = repo.qualified_name();
        let result = Self::command("git")
            .args(["bundle", "create"])
            .arg(output)
            .arg("--all")
            .current_dir(mirror)
            .output()
            .await
            .map_err(|e| BackupError::Packaging {
                repository: name.clone(),
                message: format!("failed to execute git bundle: {}", e),
            })?;

        if result.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&result.stderr);
        if stderr.contains(EMPTY_BUNDLE_MARKER) {
            return Err(BackupError::EmptyRepository { repository: name });
        }

        Err(BackupError::Packaging {
            repository: name,
            message: redact_text(stderr.trim()),
        })
    }

    /// Gzip-compressed tar of `dir`, stored with `dir`'s name as the top-level entry
    pub async fn create_archive(&self, dir: &Path, output: &Path) -> Result<()> {
        let parent = dir
            .parent()
            .ok_or_else(|| anyhow!("No parent directory for {}", dir.display()))?;
        let entry = dir
            .file_name()
            .ok_or_else(|| anyhow!("No directory name for {}", dir.display()))?;

        let result = Self::command("tar")
            .arg("-czf")
            .arg(output)
            .arg("-C")
            .arg(parent)
            .arg(entry)
            .output()
            .await
            .context("Failed to execute tar")?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(anyhow!("tar failed: {}", stderr.trim()));
        }
        Ok(())
    }

    /// Check the bundle header, then import every ref into a scratch repository
    ///
    /// `git bundle verify` only reads the header and prerequisites. Fetching
    /// runs `index-pack` over the pack data, which catches truncation and
    /// corrupt objects.
    pub async fn verify_bundle(&self, bundle: &Path) -> Result<()> {
        let scratch = tempfile::TempDir::new().context("Failed to create scratch directory")?;
        let init = self.git(scratch.path(), &["init", "--bare", "--quiet"]).await?;
        if !init.status.success() {
            return Err(anyhow!("git init failed in scratch directory"));
        }

        // git runs inside the scratch directory, so relative paths must be resolved first
        let bundle = tokio::fs::canonicalize(bundle)
            .await
            .with_context(|| format!("Cannot read bundle {}", bundle.display()))?;
        let bundle_arg = bundle.to_string_lossy().into_owned();
        let bundle_arg = bundle_arg.as_str();
        let steps: [(&str, Vec<&str>); 2] = [
            ("git bundle verify", vec!["bundle", "verify", "--quiet", bundle_arg]),
            (
                "git fetch",
                vec![
                    "fetch",
                    "--quiet",
                    "--no-write-fetch-head",
                    "--update-head-ok",
                    bundle_arg,
                    "+refs/*:refs/*",
                ],
            ),
        ];

        for (step, args) in steps {
            let output = self.git(scratch.path(), &args).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(anyhow!("{} failed: {}", step, stderr.trim()));
            }
        }
        Ok(())
    }

    /// Full gzip and tar listing of an archive
    pub async fn verify_tarball(&self, archive: &Path) -> Result<()> {
        let output = Self::command("tar")
            .arg("-tzf")
            .arg(archive)
            .output()
            .await
            .context("Failed to execute tar")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("{}", stderr.trim()));
        }
        if output.stdout.is_empty() {
            warn!("Archive {} lists no entries", archive.display());
            return Err(anyhow!("archive has no entries"));
        }
        Ok(())
    }

    /// `git --version`, or `None` when git is missing
    pub async fn version(program: &str, args: &[&str]) -> Option<String> {
        let output = AsyncCommand::new(program).args(args).output().await.ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
