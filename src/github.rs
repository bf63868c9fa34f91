use async_trait::async_trait;
use octocrab::Octocrab;
use std::collections::HashSet;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::config::{GitHubConfig, RetryConfig};
use crate::credentials::Credential;
use crate::discovery::{inject_credentials, ApiError, Discovery, DiscoveryScope, Repository};
use crate::error::BackupError;
use crate::retry::with_retry;
use crate::Platform;

/// GitHub discovery backed by octocrab
pub struct GitHubDiscovery {
    client: Octocrab,
    token: String,
    retry: RetryConfig,
}

/// Fields we keep from an octocrab repository
#[derive(Debug, Clone, PartialEq, Eq)]
struct RepoListing {
    owner: String,
    name: String,
    clone_url: String,
    default_branch: Option<String>,
    size_kb: Option<u64>,
    fork: bool,
    private: bool,
}

impl RepoListing {
    fn from_model(repo: octocrab::models::Repository) -> Option<Self> {
        let owner = repo.owner.map(|o| o.login).or_else(|| {
            repo.full_name
                .as_deref()
                .and_then(|full| full.split_once('/'))
                .map(|(owner, _)| owner.to_string())
        })?;

        let clone_url = match repo.clone_url {
            Some(url) => url.to_string(),
            None => {
                debug!("Skipping {} without an HTTPS clone URL", repo.name);
                return None;
            }
        };

        Some(Self {
            owner,
            name: repo.name,
            clone_url,
            default_branch: repo.default_branch,
            size_kb: repo.size.map(u64::from),
            fork: repo.fork.unwrap_or(false),
            private: repo.private.unwrap_or(false),
        })
    }
}

/// Map an octocrab failure onto the shared API error classes
fn classify(err: octocrab::Error) -> ApiError {
    match &err {
        octocrab::Error::GitHub { source, .. } => {
            ApiError::from_status(source.status_code.as_u16(), &source.message)
        }
        _ => ApiError::Other(err.to_string()),
    }
}

/// Request numbered pages until one comes back empty
async fn collect_pages<T, F, Fut>(what: &str, mut fetch: F) -> Result<Vec<T>, ApiError>
where
    F: FnMut(u8) -> Fut,
    Fut: Future<Output = Result<Vec<T>, ApiError>>,
{
    let mut items = Vec::new();
    let mut page = 1u8;

    loop {
        let batch = fetch(page).await?;
        if batch.is_empty() {
            break;
        }
        items.extend(batch);

        if page == u8::MAX {
            warn!("Reached maximum pagination limit (255 pages) for {}", what);
            break;
        }
        page += 1;
    }

    Ok(items)
}

impl GitHubDiscovery {
    /// Create a client for github.com or an Enterprise API URL
    pub fn new(config: &GitHubConfig, credential: &Credential, retry: RetryConfig) -> Result<Self, BackupError> {
        let mut builder = Octocrab::builder().personal_token(credential.secret.clone());
        if let Some(api_url) = &config.api_url {
            builder = builder.base_uri(api_url.as_str()).map_err(|e| {
                BackupError::Config(format!("invalid GitHub api_url {}: {}", api_url, e))
            })?;
        }

        let client = builder
            .build()
            .map_err(|e| BackupError::Config(format!("Failed to create GitHub client: {}", e)))?;

        Ok(Self {
            client,
            token: credential.secret.clone(),
            retry,
        })
    }

    async fn login(&self) -> Result<String, ApiError> {
        let user = self.client.current().user().await.map_err(classify)?;
        Ok(user.login)
    }

    /// Repositories the authenticated user can see directly
    async fn list_user_repositories(&self) -> Result<Vec<RepoListing>, ApiError> {
        let client = &self.client;
        let models = collect_pages("user repositories", |page| async move {
            let page_repos = client
                .current()
                .list_repos_for_authenticated_user()
                .per_page(100)
                .page(page)
                .send()
                .await
                .map_err(classify)?;
            Ok::<_, ApiError>(page_repos.items)
        })
        .await?;

        let repositories: Vec<_> = models.into_iter().filter_map(RepoListing::from_model).collect();
        info!("Found {} user-visible repositories", repositories.len());
        Ok(repositories)
    }

    async fn list_user_organizations(&self) -> Result<Vec<String>, ApiError> {
        let client = &self.client;
        let names = collect_pages("organization memberships", |page| async move {
            let memberships = client
                .current()
                .list_org_memberships_for_authenticated_user()
                .per_page(100)
                .page(page)
                .send()
                .await
                .map_err(classify)?;
            Ok::<_, ApiError>(
                memberships
                    .items
                    .into_iter()
                    .map(|membership| membership.organization.login)
                    .collect::<Vec<_>>(),
            )
        })
        .await?;

        debug!("Member of {} organizations: {:?}", names.len(), names);
        Ok(names)
    }

    async fn list_organization_repositories(&self, org: &str) -> Result<Vec<RepoListing>, ApiError> {
        let client = &self.client;
        let models = collect_pages(org, |page| async move {
            let page_repos = client
                .orgs(org)
                .list_repos()
                .per_page(100)
                .page(page)
                .send()
                .await
                .map_err(classify)?;
            Ok::<_, ApiError>(page_repos.items)
        })
        .await?;

        let repositories: Vec<_> = models.into_iter().filter_map(RepoListing::from_model).collect();
        info!("Found {} repositories for organization {}", repositories.len(), org);
        Ok(repositories)
    }

    async fn discover_once(&self, scope: &DiscoveryScope) -> Result<Vec<Repository>, ApiError> {
        let login = self.login().await?;
        let mut listings = Vec::new();

        if scope.is_restricted() {
            for org in &scope.orgs {
                listings.extend(self.list_organization_repositories(org).await?);
            }
            if scope.include_user {
                let own = self.list_user_repositories().await?;
                listings.extend(
                    own.into_iter()
                        .filter(|r| r.owner.eq_ignore_ascii_case(&login)),
                );
            }
        } else {
            listings.extend(self.list_user_repositories().await?);
            for org in self.list_user_organizations().await? {
                listings.extend(self.list_organization_repositories(&org).await?);
            }
        }

        let mut seen = HashSet::new();
        Ok(listings
            .into_iter()
            .filter(|r| seen.insert((r.owner.to_ascii_lowercase(), r.name.to_ascii_lowercase())))
            .map(|r| self.normalize(r, &login))
            .collect())
    }

    fn normalize(&self, listing: RepoListing, login: &str) -> Repository {
        let is_personal = listing.owner.eq_ignore_ascii_case(login);
        let mut repo = Repository::new(
            Platform::GitHub,
            listing.owner,
            listing.name,
            inject_credentials(&listing.clone_url, &self.token, None),
        );
        repo.default_branch = listing.default_branch;
        // GitHub reports size in KB
        repo.size_bytes = listing.size_kb.map(|kb| kb * 1024);
        repo.is_fork = listing.fork;
        repo.is_personal = is_personal;
        repo.is_private = listing.private;
        repo
    }
}

#[async_trait]
impl Discovery for GitHubDiscovery {
    async fn discover(&self, scope: &DiscoveryScope) -> Result<Vec<Repository>, BackupError> {
        with_retry(
            &self.retry,
            "GitHub discovery",
            || self.discover_once(scope),
            ApiError::is_rate_limited,
        )
        .await
        .map_err(|e| e.into_backup_error(Platform::GitHub))
    }

    fn platform(&self) -> Platform {
        Platform::GitHub
    }

    async fn check_auth(&self) -> Result<String, BackupError> {
        self.login()
            .await
            .map_err(|e| e.into_backup_error(Platform::GitHub))
    }
}
