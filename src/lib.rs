//! RepoVault - Multi-Platform Git Repository Backup Engine
//!
//! RepoVault discovers repositories on GitHub, GitLab and Bitbucket, selects
//! the ones a configuration asks for and writes a timestamped, verifiable
//! artifact for each into a local directory or an S3-compatible bucket.
//!
//! ## Core Features
//!
//! - **Multi-platform discovery**: one [`Discovery`] adapter per platform
//! - **Filtering**: platform, organization, fork, personal and name-pattern stages
//! - **Idempotent backups**: artifacts are keyed by the latest commit time, so
//!   unchanged repositories are skipped
//! - **Bounded concurrency**: a worker pool with per-job and per-run timeouts
//! - **Verification**: bundles and archives are checked after every write
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`discovery`]: Platform-neutral repository model and the adapter trait
//! - [`engine`]: Run orchestration
//! - [`executor`]: The per-repository backup job
//! - [`sink`]: Local and object-store destinations

pub mod bitbucket;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod executor;
pub mod filter;
pub mod git;
pub mod github;
pub mod gitlab;
pub mod health;
pub mod idempotency;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod verify;

pub use config::{BackupMethod, Config};
pub use discovery::{Discovery, DiscoveryScope, MultiDiscovery, Platform, Repository};
pub use engine::{BackupEngine, RunMode};
pub use error::{BackupError, ErrorKind};
pub use git::GitClient;
pub use report::{JobOutcome, JobStatus, RunSummary};
pub use sink::{Destination, LocalDestination, ObjectStoreDestination};
