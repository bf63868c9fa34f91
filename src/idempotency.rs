//! Artifact naming and the skip/proceed decision
//!
//! Keys embed a timestamp derived from the repository's history tip, never
//! from the wall clock. An unchanged repository re-derives the same key, so
//! a single `exists` check tells whether the current history is already
//! backed up.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::config::BackupMethod;
use crate::discovery::Repository;
use crate::error::BackupError;
use crate::sink::Destination;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Render a history-tip time as `YYYYMMDD_HHMMSS` in UTC
pub fn derive_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn key_stem(prefix: &str, repo: &Repository, timestamp: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let path = format!(
        "{}/{}/{}_{}",
        repo.platform, repo.owner, repo.name, timestamp
    );
    if prefix.is_empty() {
        path
    } else {
        format!("{}/{}", prefix, path)
    }
}

/// `{prefix}/{platform}/{owner}/{name}_{timestamp}.{ext}`
pub fn artifact_key(prefix: &str, repo: &Repository, timestamp: &str, method: BackupMethod) -> String {
    format!("{}.{}", key_stem(prefix, repo, timestamp), method.extension())
}

/// `{prefix}/{platform}/{owner}/{name}_{timestamp}_lfs.tar.gz`
pub fn lfs_key(prefix: &str, repo: &Repository, timestamp: &str) -> String {
    format!("{}_lfs.tar.gz", key_stem(prefix, repo, timestamp))
}

/// What to do with a repository this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// An artifact for the current history tip already exists
    Skip { key: String },
    /// Write a new artifact under `key`
    Proceed { key: String, timestamp: String },
    /// No history tip; the repository has no commits
    Undetermined,
}

/// Decides per repository whether a new artifact is needed
#[derive(Clone)]
pub struct IdempotencyTracker {
    destination: Arc<dyn Destination>,
    prefix: String,
    method: BackupMethod,
    force: bool,
}

impl IdempotencyTracker {
    pub fn new(destination: Arc<dyn Destination>, prefix: impl Into<String>, method: BackupMethod, force: bool) -> Self {
        Self {
            destination,
            prefix: prefix.into(),
            method,
            force,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Decide from the repository's last-commit time; issues at most one `exists` call
    pub async fn decide(&self, repo: &Repository) -> Result<Decision, BackupError> {
        let Some(last_commit) = repo.last_commit_at else {
            return Ok(Decision::Undetermined);
        };

        let timestamp = derive_timestamp(last_commit);
        let key = artifact_key(&self.prefix, repo, &timestamp, self.method);

        if self.force {
            debug!("Force enabled, writing {}", key);
            return Ok(Decision::Proceed { key, timestamp });
        }

        if self.destination.exists(&key).await? {
            debug!("{} already backed up at {}", repo.qualified_name(), key);
            Ok(Decision::Skip { key })
        } else {
            Ok(Decision::Proceed { key, timestamp })
        }
    }
}
