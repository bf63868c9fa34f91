//! Run summary and exit status

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::discovery::Repository;
use crate::error::{BackupError, ErrorKind};
use crate::sink::BackupRecord;
use crate::Platform;

/// Terminal status of one backup job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum JobStatus {
    Completed,
    Skipped,
    EmptyRepository,
    CloneError,
    PackagingError,
    UploadError,
    VerificationError,
    /// Interrupted or never started because the run was cancelled
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Completed,
        JobStatus::Skipped,
        JobStatus::EmptyRepository,
        JobStatus::CloneError,
        JobStatus::PackagingError,
        JobStatus::UploadError,
        JobStatus::VerificationError,
        JobStatus::Cancelled,
    ];

    /// Map a job error onto its status
    ///
    /// A job talks to the hosting platform only while cloning, so platform
    /// errors count against the clone. Configuration rejected mid-job can only
    /// come from the destination.
    pub fn from_error(error: &BackupError) -> Self {
        match error.kind() {
            ErrorKind::EmptyRepository => JobStatus::EmptyRepository,
            ErrorKind::Clone => JobStatus::CloneError,
            ErrorKind::Auth => JobStatus::CloneError,
            ErrorKind::Discovery => JobStatus::CloneError,
            ErrorKind::Packaging => JobStatus::PackagingError,
            ErrorKind::Upload => JobStatus::UploadError,
            ErrorKind::Config => JobStatus::UploadError,
            ErrorKind::Verification => JobStatus::VerificationError,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            JobStatus::Completed | JobStatus::Skipped | JobStatus::EmptyRepository
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of one job, as seen by the collector
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub platform: Platform,
    /// platform:owner/name
    pub repository: String,
    pub status: JobStatus,
    /// Main artifact and, when present, the LFS side-car
    pub records: Vec<BackupRecord>,
    /// Key that made the job skip
    pub skipped_key: Option<String>,
    pub message: Option<String>,
    pub duration: Duration,
}

impl JobOutcome {
    pub fn completed(repo: &Repository, records: Vec<BackupRecord>, duration: Duration) -> Self {
        Self {
            platform: repo.platform,
            repository: repo.qualified_name(),
            status: JobStatus::Completed,
            records,
            skipped_key: None,
            message: None,
            duration,
        }
    }

    pub fn skipped(repo: &Repository, key: String, duration: Duration) -> Self {
        Self {
            platform: repo.platform,
            repository: repo.qualified_name(),
            status: JobStatus::Skipped,
            records: Vec::new(),
            skipped_key: Some(key),
            message: None,
            duration,
        }
    }

    pub fn failed(repo: &Repository, error: &BackupError, duration: Duration) -> Self {
        Self {
            platform: repo.platform,
            repository: repo.qualified_name(),
            status: JobStatus::from_error(error),
            records: Vec::new(),
            skipped_key: None,
            message: Some(error.to_string()),
            duration,
        }
    }

    pub fn cancelled(repo: &Repository, reason: impl Into<String>) -> Self {
        Self {
            platform: repo.platform,
            repository: repo.qualified_name(),
            status: JobStatus::Cancelled,
            records: Vec::new(),
            skipped_key: None,
            message: Some(reason.into()),
            duration: Duration::ZERO,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.records.iter().map(|r| r.size_bytes).sum()
    }
}

/// Per-platform tally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformTotals {
    pub jobs: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// A platform adapter that produced no repositories
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterFailure {
    pub platform: Platform,
    pub kind: String,
    pub message: String,
    /// Auth failures fail the run
    pub fatal: bool,
}

impl AdapterFailure {
    pub fn new(platform: Platform, error: &BackupError) -> Self {
        Self {
            platform,
            kind: error.kind().to_string(),
            message: error.to_string(),
            fatal: error.kind().is_fatal(),
        }
    }
}

/// Aggregate of every job in a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub counts: BTreeMap<JobStatus, usize>,
    pub per_platform: BTreeMap<Platform, PlatformTotals>,
    pub adapter_failures: Vec<AdapterFailure>,
    pub bytes_written: u64,
    #[serde(skip)]
    pub duration: Duration,
    #[serde(skip)]
    pub outcomes: Vec<JobOutcome>,
}

impl RunSummary {
    /// Fold outcomes in; the single writer of the summary
    pub fn compile(outcomes: Vec<JobOutcome>, adapter_failures: Vec<AdapterFailure>, duration: Duration) -> Self {
        let mut summary = RunSummary {
            adapter_failures,
            duration,
            ..Default::default()
        };

        for status in JobStatus::ALL {
            summary.counts.insert(status, 0);
        }

        let mut outcomes = outcomes;
        outcomes.sort_by(|a, b| a.repository.cmp(&b.repository));

        for outcome in &outcomes {
            *summary.counts.entry(outcome.status).or_default() += 1;
            summary.bytes_written += outcome.bytes_written();

            let totals = summary.per_platform.entry(outcome.platform).or_default();
            totals.jobs += 1;
            match outcome.status {
                JobStatus::Completed => totals.completed += 1,
                JobStatus::Skipped => totals.skipped += 1,
                status if status.is_failure() => totals.failed += 1,
                _ => {}
            }
        }

        summary.outcomes = outcomes;
        summary
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total_jobs(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_failure())
    }

    /// Run succeeds unless an adapter hit Auth/Config or a job failed
    pub fn is_success(&self) -> bool {
        !self.adapter_failures.iter().any(|f| f.fatal) && self.failed_jobs().next().is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}
