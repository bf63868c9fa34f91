//! Bitbucket Cloud discovery over the REST 2.0 API
//!
//! Two credential shapes are supported. Workspace access tokens (prefixed
//! `ATCTT`) use bearer auth and see exactly one workspace, which must be
//! configured. Anything else is an app password used with basic auth.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{BitbucketConfig, RetryConfig};
use crate::credentials::Credential;
use crate::discovery::{
    dedupe_repositories, inject_credentials, ApiError, Discovery, DiscoveryScope, Repository,
};
use crate::error::BackupError;
use crate::retry::with_retry;
use crate::Platform;

const WORKSPACE_TOKEN_PREFIX: &str = "ATCTT";

#[derive(Debug, Clone, PartialEq, Eq)]
enum BitbucketAuth {
    WorkspaceToken { token: String, workspace: String },
    AppPassword { username: String, password: String },
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    values: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Workspace {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketRepository {
    slug: String,
    is_private: Option<bool>,
    size: Option<u64>,
    mainbranch: Option<Branch>,
    parent: Option<serde_json::Value>,
    owner: Option<Owner>,
    workspace: Workspace,
    links: Links,
}

#[derive(Debug, Deserialize)]
struct Branch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Owner {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Links {
    #[serde(default)]
    clone: Vec<CloneLink>,
}

#[derive(Debug, Deserialize)]
struct CloneLink {
    name: String,
    href: String,
}

#[derive(Debug, Deserialize)]
struct User {
    username: Option<String>,
    display_name: Option<String>,
}

pub struct BitbucketDiscovery {
    http: Client,
    api_url: String,
    auth: BitbucketAuth,
    exclude_workspaces: Vec<String>,
    retry: RetryConfig,
}

impl BitbucketDiscovery {
    /// Pick the auth mode from the credential shape
    pub fn new(config: &BitbucketConfig, credential: &Credential, retry: RetryConfig) -> Result<Self, BackupError> {
        let auth = if credential.secret.starts_with(WORKSPACE_TOKEN_PREFIX) {
            let workspace = config.workspace.clone().ok_or_else(|| {
                BackupError::Config(
                    "Bitbucket workspace access tokens require platforms.bitbucket.workspace".to_string(),
                )
            })?;
            BitbucketAuth::WorkspaceToken {
                token: credential.secret.clone(),
                workspace,
            }
        } else {
            let username = credential
                .username
                .clone()
                .or_else(|| config.username.clone())
                .ok_or_else(|| {
                    BackupError::Config(
                        "Bitbucket app passwords require a username (BITBUCKET_USERNAME or platforms.bitbucket.username)"
                            .to_string(),
                    )
                })?;
            BitbucketAuth::AppPassword {
                username,
                password: credential.secret.clone(),
            }
        };

        Ok(Self {
            http: Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            auth,
            exclude_workspaces: config.exclude_workspaces.clone(),
            retry,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            BitbucketAuth::WorkspaceToken { token, .. } => request.bearer_auth(token),
            BitbucketAuth::AppPassword { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }

    /// User-info for HTTPS clones
    fn clone_credentials(&self) -> (&str, &str) {
        match &self.auth {
            BitbucketAuth::WorkspaceToken { token, .. } => ("x-token-auth", token.as_str()),
            BitbucketAuth::AppPassword { username, password } => (username.as_str(), password.as_str()),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        debug!("GET {}", url);
        let response = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(|e| ApiError::Other(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Other(format!("unexpected response: {}", e.without_url())))
    }

    /// Collect every page by following `next`
    async fn paginate<T: DeserializeOwned>(&self, first: String) -> Result<Vec<T>, ApiError> {
        let mut items = Vec::new();
        let mut url = Some(first);

        while let Some(current) = url {
            let page: Page<T> = self.get(&current).await?;
            items.extend(page.values);
            url = page.next;
        }

        Ok(items)
    }

    async fn list_workspaces(&self) -> Result<Vec<String>, ApiError> {
        let workspaces: Vec<Workspace> = self
            .paginate(format!("{}/workspaces?pagelen=100", self.api_url))
            .await?;
        Ok(workspaces.into_iter().map(|w| w.slug).collect())
    }

    async fn list_repositories(&self, workspace: &str) -> Result<Vec<Repository>, ApiError> {
        let repos: Vec<BitbucketRepository> = self
            .paginate(format!("{}/repositories/{}?pagelen=100", self.api_url, workspace))
            .await?;
        info!("Found {} repositories in workspace {}", repos.len(), workspace);
        Ok(repos.into_iter().filter_map(|r| self.normalize(r)).collect())
    }

    async fn current_username(&self) -> Result<String, ApiError> {
        let user: User = self.get(&format!("{}/user", self.api_url)).await?;
        user.username
            .or(user.display_name)
            .ok_or_else(|| ApiError::Other("user response has no username".to_string()))
    }

    fn is_excluded(&self, workspace: &str) -> bool {
        self.exclude_workspaces
            .iter()
            .any(|w| w.eq_ignore_ascii_case(workspace))
    }

    /// Workspaces to enumerate for a scope
    async fn workspaces_for(&self, scope: &DiscoveryScope) -> Result<Vec<String>, ApiError> {
        if let BitbucketAuth::WorkspaceToken { workspace, .. } = &self.auth {
            return Ok(vec![workspace.clone()]);
        }

        if !scope.is_restricted() {
            let all = self.list_workspaces().await?;
            return Ok(all.into_iter().filter(|w| !self.is_excluded(w)).collect());
        }

        let mut workspaces = scope.orgs.clone();
        if scope.include_user {
            if let BitbucketAuth::AppPassword { username, .. } = &self.auth {
                workspaces.push(username.clone());
            }
        }
        Ok(workspaces)
    }

    async fn discover_once(&self, scope: &DiscoveryScope) -> Result<Vec<Repository>, ApiError> {
        let mut repos = Vec::new();
        for workspace in self.workspaces_for(scope).await? {
            repos.extend(self.list_repositories(&workspace).await?);
        }
        Ok(dedupe_repositories(repos))
    }

    fn normalize(&self, raw: BitbucketRepository) -> Option<Repository> {
        let href = raw
            .links
            .clone
            .iter()
            .find(|link| link.name == "https")
            .map(|link| link.href.clone())?;

        let (username, secret) = self.clone_credentials();
        let mut repo = Repository::new(
            Platform::Bitbucket,
            raw.workspace.slug,
            raw.slug,
            inject_credentials(&href, username, Some(secret)),
        );
        repo.default_branch = raw.mainbranch.map(|b| b.name);
        repo.size_bytes = raw.size;
        repo.is_fork = raw.parent.is_some_and(|p| !p.is_null());
        repo.is_personal = raw.owner.is_some_and(|o| o.kind == "user");
        repo.is_private = raw.is_private.unwrap_or(true);
        Some(repo)
    }
}

#[async_trait]
impl Discovery for BitbucketDiscovery {
    async fn discover(&self, scope: &DiscoveryScope) -> Result<Vec<Repository>, BackupError> {
        with_retry(
            &self.retry,
            "Bitbucket discovery",
            || self.discover_once(scope),
            ApiError::is_rate_limited,
        )
        .await
        .map_err(|e| e.into_backup_error(Platform::Bitbucket))
    }

    fn platform(&self) -> Platform {
        Platform::Bitbucket
    }

    async fn check_auth(&self) -> Result<String, BackupError> {
        let result = match &self.auth {
            BitbucketAuth::WorkspaceToken { workspace, .. } => self
                .get::<Page<serde_json::Value>>(&format!(
                    "{}/repositories/{}?pagelen=1",
                    self.api_url, workspace
                ))
                .await
                .map(|_| format!("workspace {}", workspace)),
            BitbucketAuth::AppPassword { .. } => self.current_username().await,
        };
        result.map_err(|e| e.into_backup_error(Platform::Bitbucket))
    }
}
