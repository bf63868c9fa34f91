//! Common test utilities and helpers for RepoVault tests
#![allow(dead_code)]

use async_trait::async_trait;
use fake::faker::lorem::en::Word;
use fake::Fake;
use repovault::{BackupError, Discovery, DiscoveryScope, MultiDiscovery, Platform, Repository};
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Committer date used by every fixture commit
pub const FIXTURE_DATE: &str = "2024-03-05T07:08:09Z";

/// Timestamp component of artifact keys built from [`FIXTURE_DATE`]
pub const FIXTURE_TIMESTAMP: &str = "20240305_070809";

/// Isolated directories and environment for one test
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config_dir: PathBuf,
    pub original_env: Vec<(String, Option<String>)>,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("repovault");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        let env_vars = [
            "GITHUB_TOKEN",
            "GH_TOKEN",
            "GITLAB_TOKEN",
            "BITBUCKET_TOKEN",
            "BITBUCKET_USERNAME",
            "BITBUCKET_APP_PASSWORD",
            "XDG_CONFIG_HOME",
        ];
        let original_env = env_vars
            .iter()
            .map(|var| (var.to_string(), env::var(var).ok()))
            .collect();

        Self {
            temp_dir,
            config_dir,
            original_env,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Backup root inside the environment
    pub fn backup_root(&self) -> PathBuf {
        let root = self.path().join("backups");
        std::fs::create_dir_all(&root).expect("Failed to create backup root");
        root
    }

    /// Parent for job working directories
    pub fn work_dir(&self) -> PathBuf {
        let dir = self.path().join("work");
        std::fs::create_dir_all(&dir).expect("Failed to create work dir");
        dir
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.config_dir.join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    /// Config with a local destination and a working directory
    pub fn create_minimal_config(&self) -> PathBuf {
        let content = format!(
            r#"
destination:
  local_path: "{}"
backup:
  work_dir: "{}"
  workers: 2
retry:
  max_attempts: 1
  min_delay_ms: 1
  max_delay_ms: 1
"#,
            self.backup_root().display(),
            self.work_dir().display()
        );
        self.create_test_config(&content)
    }

    /// Config value equivalent to [`create_minimal_config`](Self::create_minimal_config)
    pub fn config(&self) -> repovault::Config {
        let mut config = repovault::Config::default();
        config.destination.local_path = Some(self.backup_root().display().to_string());
        config.backup.work_dir = Some(self.work_dir().display().to_string());
        config.backup.workers = 2;
        config.retry.max_attempts = 1;
        config.retry.min_delay_ms = 1;
        config.retry.max_delay_ms = 1;
        config
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        for (key, value) in &self.original_env {
            match value {
                Some(val) => env::set_var(key, val),
                None => env::remove_var(key),
            }
        }
    }
}

/// Builder for discovered repositories
#[derive(Debug, Clone)]
pub struct MockRepository {
    pub platform: Platform,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    pub size_bytes: Option<u64>,
    pub is_fork: bool,
    pub is_personal: bool,
    pub is_private: bool,
}

impl MockRepository {
    pub fn new(name: &str, owner: &str) -> Self {
        Self {
            platform: Platform::GitHub,
            owner: owner.to_string(),
            name: name.to_string(),
            clone_url: format!("https://example.com/{}/{}.git", owner, name),
            size_bytes: Some(1024),
            is_fork: false,
            is_personal: false,
            is_private: true,
        }
    }

    /// Random lowercase name under `owner`
    pub fn random(owner: &str) -> Self {
        let word: String = Word().fake();
        let suffix: u16 = (1000..9999).fake();
        Self::new(&format!("{}-{}", word.to_lowercase(), suffix), owner)
    }

    pub fn on(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Clone from a local fixture instead of the network
    pub fn cloned_from(mut self, path: &Path) -> Self {
        self.clone_url = path.to_string_lossy().into_owned();
        self
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size_bytes = Some(bytes);
        self
    }

    pub fn as_fork(mut self) -> Self {
        self.is_fork = true;
        self
    }

    pub fn as_personal(mut self) -> Self {
        self.is_personal = true;
        self
    }

    pub fn build(self) -> Repository {
        let mut repo = Repository::new(self.platform, self.owner, self.name, self.clone_url);
        repo.size_bytes = self.size_bytes;
        repo.is_fork = self.is_fork;
        repo.is_personal = self.is_personal;
        repo.is_private = self.is_private;
        repo.default_branch = Some("main".to_string());
        repo
    }
}

/// Discovery source returning a fixed list
pub struct StaticDiscovery {
    pub platform: Platform,
    pub repos: Vec<Repository>,
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self, _scope: &DiscoveryScope) -> Result<Vec<Repository>, BackupError> {
        Ok(self.repos.clone())
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    async fn check_auth(&self) -> Result<String, BackupError> {
        Ok("fixture".to_string())
    }
}

/// Single-platform discovery over `repos`
pub fn static_discovery(repos: Vec<Repository>) -> MultiDiscovery {
    let mut multi = MultiDiscovery::new();
    let platform = repos.first().map(|r| r.platform).unwrap_or(Platform::GitHub);
    multi.add_source(
        Box::new(StaticDiscovery { platform, repos }),
        DiscoveryScope::unrestricted(),
    );
    multi
}

/// Run git with a fixed identity and committer date
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(["-c", "init.defaultBranch=main"])
        .args(args)
        .current_dir(dir)
        .env("GIT_COMMITTER_DATE", FIXTURE_DATE)
        .env("GIT_AUTHOR_DATE", FIXTURE_DATE)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Local repository with `commits` commits; zero gives an empty repository
pub fn git_fixture(root: &Path, name: &str, commits: usize) -> PathBuf {
    let path = root.join("fixtures").join(name);
    std::fs::create_dir_all(&path).expect("Failed to create fixture dir");
    git(&path, &["init", "--quiet"]);

    for i in 0..commits {
        std::fs::write(path.join("file.txt"), format!("revision {}\n", i))
            .expect("Failed to write fixture file");
        git(&path, &["add", "file.txt"]);
        git(&path, &["commit", "--quiet", "-m", &format!("commit {}", i)]);
    }

    path
}

/// Every regular file below `root`, relative and sorted
pub fn list_files(root: &Path) -> Vec<String> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, root, out);
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }

    let mut files = Vec::new();
    walk(root, root, &mut files);
    files.sort();
    files
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
