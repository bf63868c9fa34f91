//! Per-repository backup job
//!
//! clone → resolve history tip → decide → package → LFS side-car → write →
//! verify. The job's working directory is removed when the job ends, whether
//! it succeeded, failed or was dropped mid-flight.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BackupMethod, Config};
use crate::discovery::Repository;
use crate::error::BackupError;
use crate::git::GitClient;
use crate::idempotency::{lfs_key, Decision, IdempotencyTracker};
use crate::report::JobOutcome;
use crate::sink::{file_digest, ArtifactMetadata, BackupRecord, Destination};
use crate::verify::Verifier;

/// Result of a job that did not fail
#[derive(Debug)]
enum Executed {
    Written(Vec<BackupRecord>),
    Skipped(String),
}

/// Runs the backup sequence for one repository at a time
#[derive(Clone)]
pub struct BackupExecutor {
    git: GitClient,
    tracker: IdempotencyTracker,
    destination: Arc<dyn Destination>,
    verifier: Option<Verifier>,
    method: BackupMethod,
    lfs: bool,
    work_dir: PathBuf,
}

impl BackupExecutor {
    pub fn new(config: &Config, destination: Arc<dyn Destination>) -> Self {
        let git = GitClient::new(config.retry.clone());
        let tracker = IdempotencyTracker::new(
            destination.clone(),
            config.destination.prefix.clone(),
            config.backup.method,
            config.backup.force,
        );
        let verifier = config.backup.verify.then(|| Verifier::new(git.clone()));

        Self {
            git,
            tracker,
            destination,
            verifier,
            method: config.backup.method,
            lfs: config.backup.lfs,
            work_dir: config.work_dir(),
        }
    }

    /// Back up one repository; every failure becomes the outcome's status
    pub async fn run(&self, repo: &Repository) -> JobOutcome {
        let started = Instant::now();

        match self.execute(repo).await {
            Ok(Executed::Written(records)) => {
                info!(
                    "Backed up {} -> {}",
                    repo.qualified_name(),
                    records
                        .iter()
                        .map(|r| r.key.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                JobOutcome::completed(repo, records, started.elapsed())
            }
            Ok(Executed::Skipped(key)) => {
                info!("Skipping {}: {} already exists", repo.qualified_name(), key);
                JobOutcome::skipped(repo, key, started.elapsed())
            }
            Err(e) if e.is_expected() => {
                info!("{}", e);
                JobOutcome::failed(repo, &e, started.elapsed())
            }
            Err(e) => {
                warn!("Backup of {} failed: {}", repo.qualified_name(), e);
                JobOutcome::failed(repo, &e, started.elapsed())
            }
        }
    }

    async fn execute(&self, repo: &Repository) -> Result<Executed, BackupError> {
        let name = repo.qualified_name();

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| BackupError::Clone {
                repository: name.clone(),
                message: format!("failed to create {}: {}", self.work_dir.display(), e),
            })?;
        let job_dir = tempfile::Builder::new()
            .prefix("repovault-job-")
            .tempdir_in(&self.work_dir)
            .map_err(|e| BackupError::Clone {
                repository: name.clone(),
                message: format!("failed to create working directory: {}", e),
            })?;
        debug!("Working directory for {}: {}", name, job_dir.path().display());

        let mirror = job_dir.path().join(format!("{}.git", repo.name));
        self.git.mirror_clone(repo, &mirror).await?;

        let last_commit = self
            .git
            .last_commit_time(&mirror)
            .await
            .map_err(|e| BackupError::Packaging {
                repository: name.clone(),
                message: e.to_string(),
            })?;
        let has_lfs = self.lfs && self.git.has_lfs(&mirror).await;
        let snapshot = repo.clone().with_last_commit(last_commit).with_lfs(has_lfs);

        let (key, timestamp) = match self.tracker.decide(&snapshot).await? {
            Decision::Skip { key } => return Ok(Executed::Skipped(key)),
            Decision::Undetermined => {
                return Err(BackupError::EmptyRepository { repository: name })
            }
            Decision::Proceed { key, timestamp } => (key, timestamp),
        };

        let artifact = job_dir
            .path()
            .join(format!("{}.{}", repo.name, self.method.extension()));
        self.package(&snapshot, &mirror, &artifact).await?;

        let metadata = ArtifactMetadata {
            platform: snapshot.platform,
            owner: snapshot.owner.clone(),
            name: snapshot.name.clone(),
            is_private: snapshot.is_private,
            default_branch: snapshot.default_branch.clone(),
            derived_timestamp: timestamp.clone(),
        };

        let sidecar = if snapshot.has_lfs {
            let sidecar_key = lfs_key(self.tracker.prefix(), &snapshot, &timestamp);
            Some((sidecar_key, self.export_lfs(&snapshot, &mirror, job_dir.path()).await?))
        } else {
            None
        };

        let records = self
            .write_artifacts(
                (&key, &artifact),
                sidecar.as_ref().map(|(k, p)| (k.as_str(), p.as_path())),
                &metadata,
            )
            .await?;
        Ok(Executed::Written(records))
    }

    /// Store the LFS side-car (if any), then the main artifact
    ///
    /// The main key decides whether later runs skip, so it is written last and
    /// only after the side-car is safely stored.
    async fn write_artifacts(
        &self,
        main: (&str, &Path),
        sidecar: Option<(&str, &Path)>,
        metadata: &ArtifactMetadata,
    ) -> Result<Vec<BackupRecord>, BackupError> {
        let mut records = Vec::new();
        if let Some((key, path)) = sidecar {
            records.push(self.store(key, path, metadata).await?);
        }
        records.push(self.store(main.0, main.1, metadata).await?);
        Ok(records)
    }

    async fn package(&self, repo: &Repository, mirror: &Path, artifact: &Path) -> Result<(), BackupError> {
        match self.method {
            BackupMethod::Bundle => self.git.create_bundle(repo, mirror, artifact).await,
            BackupMethod::Archive => self
                .git
                .create_archive(mirror, artifact)
                .await
                .map_err(|e| BackupError::Packaging {
                    repository: repo.qualified_name(),
                    message: e.to_string(),
                }),
        }
    }

    async fn export_lfs(&self, repo: &Repository, mirror: &Path, job_dir: &Path) -> Result<PathBuf, BackupError> {
        let packaging_error = |message: String| BackupError::Packaging {
            repository: repo.qualified_name(),
            message,
        };

        self.git
            .lfs_fetch(mirror)
            .await
            .map_err(|e| packaging_error(e.to_string()))?;

        let lfs_dir = mirror.join("lfs");
        if !lfs_dir.join("objects").is_dir() {
            return Err(packaging_error("git lfs fetch produced no objects".to_string()));
        }

        let sidecar = job_dir.join(format!("{}_lfs.tar.gz", repo.name));
        self.git
            .create_archive(&lfs_dir, &sidecar)
            .await
            .map_err(|e| packaging_error(e.to_string()))?;
        Ok(sidecar)
    }

    /// Write one artifact and run the inline check when enabled
    ///
    /// The structural check runs on the packaged file. The destination must
    /// then report the same size and sha256, which ties the stored bytes to
    /// the bytes that were checked.
    async fn store(&self, key: &str, path: &Path, metadata: &ArtifactMetadata) -> Result<BackupRecord, BackupError> {
        let Some(verifier) = &self.verifier else {
            return self.destination.write(key, path, metadata).await;
        };

        let verification_error = |message: String| BackupError::Verification {
            key: key.to_string(),
            message,
        };

        verifier.verify_artifact(key, path).await?;
        let staged = path.to_path_buf();
        let (local_len, local_sha256) = tokio::task::spawn_blocking(move || file_digest(&staged))
            .await
            .map_err(|e| verification_error(e.to_string()))?
            .map_err(|e| verification_error(e.to_string()))?;

        let record = self.destination.write(key, path, metadata).await?;

        if record.size_bytes != local_len {
            return Err(verification_error(format!(
                "destination holds {} bytes, expected {}",
                record.size_bytes, local_len
            )));
        }
        if !record.sha256.eq_ignore_ascii_case(&local_sha256) {
            return Err(verification_error(format!(
                "destination checksum {} does not match {}",
                record.sha256, local_sha256
            )));
        }

        Ok(record)
    }
}
