//! Structural checks for written artifacts
//!
//! Inline verification runs right after a write. On-demand verification
//! walks a local path or a destination prefix. Neither mode modifies or
//! deletes what it checks.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::BackupError;
use crate::git::GitClient;
use crate::sink::Destination;

/// Artifact formats that can be checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Bundle,
    TarGz,
}

impl ArtifactFormat {
    /// Infer from a key or file name
    pub fn detect(name: &str) -> Option<Self> {
        if name.ends_with(".bundle") {
            Some(ArtifactFormat::Bundle)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArtifactFormat::TarGz)
        } else {
            None
        }
    }
}

/// Result for a single artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// Path or key that was checked
    pub target: String,
    pub error: Option<String>,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Verifier {
    git: GitClient,
}

impl Verifier {
    pub fn new(git: GitClient) -> Self {
        Self { git }
    }

    /// Non-empty and structurally valid for its format
    pub async fn check_file(&self, path: &Path, format: ArtifactFormat) -> Result<(), String> {
        let len = tokio::fs::metadata(path)
            .await
            .map_err(|e| e.to_string())?
            .len();
        if len == 0 {
            return Err("artifact is empty".to_string());
        }

        let result = match format {
            ArtifactFormat::Bundle => self.git.verify_bundle(path).await,
            ArtifactFormat::TarGz => self.git.verify_tarball(path).await,
        };
        result.map_err(|e| e.to_string())
    }

    /// Inline check of a freshly written artifact
    pub async fn verify_artifact(&self, key: &str, path: &Path) -> Result<(), BackupError> {
        let format = ArtifactFormat::detect(key).ok_or_else(|| BackupError::Verification {
            key: key.to_string(),
            message: "unknown artifact format".to_string(),
        })?;

        self.check_file(path, format)
            .await
            .map_err(|message| BackupError::Verification {
                key: key.to_string(),
                message,
            })?;

        debug!("Verified {}", key);
        Ok(())
    }

    /// Check a local artifact file, or every artifact below a directory
    pub async fn verify_local(&self, path: &Path) -> anyhow::Result<Vec<VerificationResult>> {
        let mut files = Vec::new();
        if path.is_dir() {
            collect_artifacts(path, &mut files)?;
            files.sort();
        } else if path.exists() {
            files.push(path.to_path_buf());
        } else {
            anyhow::bail!("No such file or directory: {}", path.display());
        }

        let mut results = Vec::new();
        for file in files {
            let target = file.display().to_string();
            let error = match ArtifactFormat::detect(&target) {
                Some(format) => self.check_file(&file, format).await.err(),
                None => continue,
            };
            log_result(&target, &error);
            results.push(VerificationResult { target, error });
        }

        info!("Verified {} local artifacts", results.len());
        Ok(results)
    }

    /// Download every artifact under `prefix` into a temporary file and check it
    pub async fn verify_stored(
        &self,
        destination: &dyn Destination,
        prefix: &str,
    ) -> Result<Vec<VerificationResult>, BackupError> {
        let mut artifacts = destination.list(prefix).await?;
        artifacts.sort_by(|a, b| a.key.cmp(&b.key));

        let scratch = tempfile::TempDir::new().map_err(|e| BackupError::Verification {
            key: prefix.to_string(),
            message: format!("failed to create scratch directory: {}", e),
        })?;

        let mut results = Vec::new();
        for artifact in artifacts {
            let Some(format) = ArtifactFormat::detect(&artifact.key) else {
                continue;
            };
            let local = scratch.path().join(match format {
                ArtifactFormat::Bundle => "artifact.bundle",
                ArtifactFormat::TarGz => "artifact.tar.gz",
            });

            let error = match destination.fetch(&artifact.key, &local).await {
                Ok(()) => self.check_file(&local, format).await.err(),
                Err(e) => Some(e.to_string()),
            };
            let _ = tokio::fs::remove_file(&local).await;

            log_result(&artifact.key, &error);
            results.push(VerificationResult {
                target: artifact.key,
                error,
            });
        }

        info!(
            "Verified {} artifacts under {} on {}",
            results.len(),
            prefix,
            destination.describe()
        );
        Ok(results)
    }
}

fn log_result(target: &str, error: &Option<String>) {
    match error {
        None => debug!("OK {}", target),
        Some(message) => warn!("FAILED {}: {}", target, message),
    }
}

fn collect_artifacts(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_artifacts(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::sink::{LocalDestination, MockDestination, StoredArtifact};
    use tempfile::TempDir;

    fn verifier() -> Verifier {
        Verifier::new(GitClient::new(RetryConfig::default()))
    }

    fn make_bundle(dir: &Path) -> PathBuf {
        let source = dir.join("src");
        std::fs::create_dir_all(&source).unwrap();
        let git = |args: &[&str]| {
            let out = std::process::Command::new("git")
                .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
                .args(args)
                .current_dir(&source)
                .output()
                .unwrap();
            assert!(out.status.success());
        };
        git(&["init", "--quiet"]);
        std::fs::write(source.join("file.txt"), "content").unwrap();
        git(&["add", "."]);
        git(&["commit", "--quiet", "-m", "c1"]);

        let bundle = dir.join("repo.bundle");
        git(&["bundle", "create", bundle.to_str().unwrap(), "--all"]);
        bundle
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(ArtifactFormat::detect("a/b_1.bundle"), Some(ArtifactFormat::Bundle));
        assert_eq!(ArtifactFormat::detect("a/b_1.tar.gz"), Some(ArtifactFormat::TarGz));
        assert_eq!(ArtifactFormat::detect("a/b_1_lfs.tar.gz"), Some(ArtifactFormat::TarGz));
        assert_eq!(ArtifactFormat::detect("README.md"), None);
    }

    #[tokio::test]
    async fn test_empty_file_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.bundle");
        std::fs::write(&path, b"").unwrap();

        let err = verifier()
            .verify_artifact("repos/github/acme/x_1.bundle", &path)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Verification);
    }

    #[tokio::test]
    async fn test_verify_local_directory() {
        let temp = TempDir::new().unwrap();
        let good = make_bundle(temp.path());
        let store = temp.path().join("store");
        std::fs::create_dir_all(store.join("nested")).unwrap();
        std::fs::copy(&good, store.join("nested/good.bundle")).unwrap();

        let bytes = std::fs::read(&good).unwrap();
        std::fs::write(store.join("bad.bundle"), &bytes[..bytes.len() / 3]).unwrap();
        std::fs::write(store.join("notes.txt"), "ignored").unwrap();

        let results = verifier().verify_local(&store).await.unwrap();
        assert_eq!(results.len(), 2);
        let failed: Vec<_> = results.iter().filter(|r| !r.passed()).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].target.ends_with("bad.bundle"));

        assert!(store.join("bad.bundle").exists());
    }

    #[tokio::test]
    async fn test_verify_local_missing_path() {
        assert!(verifier()
            .verify_local(Path::new("/nonexistent/backup"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_verify_stored_prefix() {
        let temp = TempDir::new().unwrap();
        let good = make_bundle(temp.path());
        let root = temp.path().join("root");
        let dest = LocalDestination::new(&root);
        let meta = crate::sink::ArtifactMetadata {
            platform: crate::Platform::GitHub,
            owner: "acme".to_string(),
            name: "core".to_string(),
            is_private: false,
            default_branch: None,
            derived_timestamp: "20240101_000000".to_string(),
        };
        dest.write("repos/github/acme/core_20240101_000000.bundle", &good, &meta)
            .await
            .unwrap();

        let results = verifier().verify_stored(&dest, "repos/").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].passed());
    }

    #[tokio::test]
    async fn test_verify_stored_reports_fetch_failures() {
        let mut dest = MockDestination::new();
        dest.expect_list().returning(|_| {
            Ok(vec![StoredArtifact {
                key: "repos/github/acme/core_1.bundle".to_string(),
                size_bytes: 10,
                modified: None,
            }])
        });
        dest.expect_fetch().returning(|key, _| {
            Err(BackupError::Verification {
                key: key.to_string(),
                message: "access denied".to_string(),
            })
        });
        dest.expect_describe().returning(|| "mock".to_string());

        let results = verifier().verify_stored(&dest, "repos/").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].error.as_deref().unwrap().contains("access denied"));
    }
}
