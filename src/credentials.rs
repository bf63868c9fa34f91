//! Credential discovery for the hosting platforms
//!
//! Each platform has an ordered list of [`CredentialSource`]s. The first
//! source that yields a non-empty secret wins. Secrets never appear in
//! `Debug` output.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::Platform;

/// A resolved secret together with where it came from
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub secret: String,

    /// Username for basic-auth style credentials
    pub username: Option<String>,

    /// Human-readable source, e.g. "env GITHUB_TOKEN"
    pub source: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"***")
            .field("username", &self.username)
            .field("source", &self.source)
            .finish()
    }
}

/// One place a credential may be found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Single environment variable holding the secret
    Env(String),

    /// Username and secret in two environment variables
    EnvPair { username: String, secret: String },

    /// Command whose trimmed stdout is the secret
    Command { program: String, args: Vec<String> },

    /// glab CLI config file, `hosts.<host>.token`
    GlabConfig { path: PathBuf, host: String },

    /// netrc file entry for a machine
    Netrc { path: PathBuf, machine: String },
}

impl CredentialSource {
    fn describe(&self) -> String {
        match self {
            CredentialSource::Env(var) => format!("env {}", var),
            CredentialSource::EnvPair { username, secret } => format!("env {}/{}", username, secret),
            CredentialSource::Command { program, args } => format!("{} {}", program, args.join(" ")),
            CredentialSource::GlabConfig { path, .. } => format!("glab config {}", path.display()),
            CredentialSource::Netrc { path, .. } => format!("netrc {}", path.display()),
        }
    }

    fn resolve(&self) -> Result<Option<Credential>> {
        let found = match self {
            CredentialSource::Env(var) => non_empty_env(var).map(|secret| (secret, None)),
            CredentialSource::EnvPair { username, secret } => {
                match (non_empty_env(username), non_empty_env(secret)) {
                    (Some(user), Some(secret)) => Some((secret, Some(user))),
                    _ => None,
                }
            }
            CredentialSource::Command { program, args } => {
                run_token_command(program, args)?.map(|secret| (secret, None))
            }
            CredentialSource::GlabConfig { path, host } => {
                read_glab_token(path, host)?.map(|secret| (secret, None))
            }
            CredentialSource::Netrc { path, machine } => read_netrc(path, machine)?
                .map(|(login, password)| (password, Some(login))),
        };

        Ok(found.map(|(secret, username)| Credential {
            secret,
            username,
            source: self.describe(),
        }))
    }
}

/// Ordered credential lookup for one platform
#[derive(Debug, Clone)]
pub struct CredentialProvider {
    platform: Platform,
    sources: Vec<CredentialSource>,
}

impl CredentialProvider {
    pub fn new(platform: Platform, sources: Vec<CredentialSource>) -> Self {
        Self { platform, sources }
    }

    /// Default lookup chain for a platform
    ///
    /// `host` is the GitLab instance host; the other platforms ignore it.
    pub fn for_platform(platform: Platform, host: &str) -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        let sources = match platform {
            Platform::GitHub => vec![
                CredentialSource::Env("GITHUB_TOKEN".to_string()),
                CredentialSource::Env("GH_TOKEN".to_string()),
                CredentialSource::Command {
                    program: "gh".to_string(),
                    args: vec!["auth".to_string(), "token".to_string()],
                },
            ],
            Platform::GitLab => {
                let glab_dir = dirs::config_dir()
                    .unwrap_or_else(|| home.join(".config"))
                    .join("glab-cli");
                vec![
                    CredentialSource::Env("GITLAB_TOKEN".to_string()),
                    CredentialSource::GlabConfig {
                        path: glab_dir.join("config.yml"),
                        host: host.to_string(),
                    },
                ]
            }
            Platform::Bitbucket => vec![
                CredentialSource::Env("BITBUCKET_TOKEN".to_string()),
                CredentialSource::EnvPair {
                    username: "BITBUCKET_USERNAME".to_string(),
                    secret: "BITBUCKET_APP_PASSWORD".to_string(),
                },
                CredentialSource::Netrc {
                    path: home.join(".netrc"),
                    machine: "bitbucket.org".to_string(),
                },
            ],
        };
        Self::new(platform, sources)
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// First credential found, or `None` when no source has one
    ///
    /// A source that errors (unreadable file, failing command) is logged
    /// and skipped.
    pub fn resolve(&self) -> Option<Credential> {
        for source in &self.sources {
            match source.resolve() {
                Ok(Some(credential)) => {
                    debug!(
                        "Using {} credential from {}",
                        self.platform.display_name(),
                        credential.source
                    );
                    return Some(credential);
                }
                Ok(None) => {}
                Err(e) => debug!("Credential source {} unavailable: {}", source.describe(), e),
            }
        }
        None
    }

    /// Like [`resolve`](Self::resolve) but an absent credential is an error
    pub fn require(&self) -> Result<Credential> {
        self.resolve().ok_or_else(|| {
            let tried: Vec<String> = self.sources.iter().map(CredentialSource::describe).collect();
            anyhow!(
                "No {} credential found. Tried: {}",
                self.platform.display_name(),
                tried.join(", ")
            )
        })
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn run_token_command(program: &str, args: &[String]) -> Result<Option<String>> {
    let output = match Command::new(program).args(args).output() {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to run {}", program)),
    };

    if !output.status.success() {
        return Ok(None);
    }

    let token = String::from_utf8(output.stdout)
        .with_context(|| format!("{} output is not valid UTF-8", program))?
        .trim()
        .to_string();

    Ok(Some(token).filter(|t| !t.is_empty()))
}

fn read_glab_token(path: &Path, host: &str) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read glab config: {:?}", path))?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse glab config: {:?}", path))?;

    let token = doc
        .get("hosts")
        .and_then(|hosts| hosts.get(host))
        .and_then(|entry| entry.get("token"))
        .and_then(|token| token.as_str())
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    Ok(token)
}

/// Parse a netrc file and return `(login, password)` for `machine`
fn read_netrc(path: &Path, machine: &str) -> Result<Option<(String, String)>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read netrc: {:?}", path))?;

    Ok(parse_netrc(&content, machine))
}

fn parse_netrc(content: &str, machine: &str) -> Option<(String, String)> {
    let mut tokens = content.split_whitespace();
    let mut in_machine = false;
    let mut login = None;
    let mut password = None;

    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                if in_machine {
                    break;
                }
                in_machine = tokens.next() == Some(machine);
            }
            "default" if in_machine => break,
            "login" if in_machine => login = tokens.next().map(str::to_string),
            "password" if in_machine => password = tokens.next().map(str::to_string),
            _ => {}
        }
    }

    login.zip(password)
}

/// Host part of a base URL, e.g. `gitlab.example.com` for `https://gitlab.example.com/`
pub fn host_of(url: &str) -> String {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}
