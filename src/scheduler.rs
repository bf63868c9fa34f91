//! Scheduler - bounded-concurrency dispatch of backup jobs
//!
//! One job per repository, at most `workers` in flight, every outcome
//! captured independently. Cancellation (run timeout or Ctrl-C) marks
//! unstarted jobs `Cancelled` and interrupts running ones.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::Repository;
use crate::executor::BackupExecutor;
use crate::report::JobOutcome;

/// Something that turns a repository into an outcome
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, repo: &Repository) -> JobOutcome;
}

#[async_trait]
impl Job for BackupExecutor {
    async fn run(&self, repo: &Repository) -> JobOutcome {
        BackupExecutor::run(self, repo).await
    }
}

pub struct Scheduler {
    job: Arc<dyn Job>,
    workers: usize,
    job_timeout: Duration,
    run_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(job: Arc<dyn Job>, workers: usize, job_timeout: Duration) -> Self {
        Self {
            job,
            workers: workers.max(1),
            job_timeout,
            run_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_run_timeout(mut self, run_timeout: Option<Duration>) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels the run when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every job; returns exactly one outcome per repository
    pub async fn run(&self, repositories: Vec<Repository>) -> Vec<JobOutcome> {
        info!(
            "Scheduling {} backup jobs with {} workers",
            repositories.len(),
            self.workers
        );

        let timer = self.run_timeout.map(|limit| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!("Run timeout of {}s reached, cancelling", limit.as_secs());
                cancel.cancel();
            })
        });

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut futures = FuturesUnordered::new();

        for repo in repositories {
            let semaphore = semaphore.clone();
            let job = self.job.clone();
            let cancel = self.cancel.clone();
            let job_timeout = self.job_timeout;

            futures.push(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return JobOutcome::cancelled(&repo, "run cancelled before the job started");
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        warn!("Interrupted backup of {}", repo.qualified_name());
                        JobOutcome::cancelled(&repo, "run cancelled while the job was running")
                    }
                    result = timeout(job_timeout, job.run(&repo)) => match result {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!(
                                "Backup of {} timed out after {}s",
                                repo.qualified_name(),
                                job_timeout.as_secs()
                            );
                            JobOutcome::cancelled(
                                &repo,
                                format!("job timed out after {}s", job_timeout.as_secs()),
                            )
                        }
                    },
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(outcome) = futures.next().await {
            debug!("Job finished: {} -> {}", outcome.repository, outcome.status);
            outcomes.push(outcome);
        }

        if let Some(timer) = timer {
            timer.abort();
        }

        outcomes
    }
}
