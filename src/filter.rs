//! Repository selection
//!
//! [`filter`] is a pure function over discovered repositories. Stages run in
//! a fixed order: platform allow-list, organization allow-list, fork
//! exclusion, personal exclusion, explicit repository list, name patterns.

use anyhow::Result;
use regex::{Regex, RegexBuilder};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

use crate::config::{load_repos_file, Config};
use crate::discovery::{Repository, USER_KEYWORD};
use crate::error::BackupError;
use crate::Platform;

/// A single name pattern
#[derive(Debug, Clone)]
pub enum NamePattern {
    /// Case-insensitive full match of `owner/name` or `platform:owner/name`
    Exact(String),
    /// `*`, `?` and `[...]` wildcards anchored to the whole name
    Glob { source: String, regex: Regex },
    /// `re:<expr>`, case-insensitive search
    Regex(Regex),
}

impl NamePattern {
    /// Parse `re:` regexes, globs (containing `*`, `?` or `[`) and exact names
    pub fn parse(raw: &str) -> Result<Self, BackupError> {
        let raw = raw.trim();

        if let Some(expr) = raw.strip_prefix("re:") {
            let regex = RegexBuilder::new(expr)
                .case_insensitive(true)
                .build()
                .map_err(|e| BackupError::Config(format!("invalid regex '{}': {}", expr, e)))?;
            return Ok(NamePattern::Regex(regex));
        }

        if raw.contains(['*', '?', '[']) {
            let regex = RegexBuilder::new(&glob_to_regex(raw))
                .case_insensitive(true)
                .build()
                .map_err(|e| BackupError::Config(format!("invalid glob '{}': {}", raw, e)))?;
            return Ok(NamePattern::Glob {
                source: raw.to_string(),
                regex,
            });
        }

        Ok(NamePattern::Exact(raw.to_string()))
    }

    pub fn matches(&self, repo: &Repository) -> bool {
        let short = repo.full_name();
        let qualified = repo.qualified_name();

        match self {
            NamePattern::Exact(name) => {
                name.eq_ignore_ascii_case(&short) || name.eq_ignore_ascii_case(&qualified)
            }
            NamePattern::Glob { regex, .. } | NamePattern::Regex(regex) => {
                regex.is_match(&short) || regex.is_match(&qualified)
            }
        }
    }
}

/// Translate a shell glob into an anchored regex
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    out
}

/// Selection criteria applied after discovery
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    /// Empty means every platform
    pub platforms: Vec<Platform>,

    /// Per-platform organization allow-list; a missing entry is unrestricted
    pub orgs: HashMap<Platform, Vec<String>>,

    /// Explicit repository list
    pub repos: Vec<NamePattern>,

    pub patterns: Vec<NamePattern>,

    pub include_forks: bool,

    pub include_personal: bool,
}

impl FilterConfig {
    /// Build selection criteria from configuration, reading the repos file if one is set
    pub fn from_config(config: &Config) -> Result<Self> {
        let platforms = config
            .filters
            .platforms
            .iter()
            .map(|p| p.parse::<Platform>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut orgs = HashMap::new();
        let allow_lists = [
            (Platform::GitHub, &config.platforms.github.include_orgs),
            (Platform::GitLab, &config.platforms.gitlab.include_groups),
            (Platform::Bitbucket, &config.platforms.bitbucket.include_workspaces),
        ];
        for (platform, list) in allow_lists {
            if !list.is_empty() {
                orgs.insert(platform, list.clone());
            }
        }

        let mut repo_entries = config.filters.repos.clone();
        if let Some(repos_file) = &config.filters.repos_file {
            repo_entries.extend(load_repos_file(Path::new(repos_file))?);
        }

        Ok(Self {
            platforms,
            orgs,
            repos: parse_patterns(&repo_entries)?,
            patterns: parse_patterns(&config.filters.patterns)?,
            include_forks: config.filters.include_forks,
            include_personal: config.filters.include_personal,
        })
    }

    fn platform_allowed(&self, repo: &Repository) -> bool {
        self.platforms.is_empty() || self.platforms.contains(&repo.platform)
    }

    fn org_allowed(&self, repo: &Repository) -> bool {
        let Some(allowed) = self.orgs.get(&repo.platform) else {
            return true;
        };

        let owner = repo.owner.to_ascii_lowercase();
        allowed.iter().any(|entry| {
            let entry = entry.trim().to_ascii_lowercase();
            if entry == USER_KEYWORD {
                return repo.is_personal;
            }
            owner == entry || owner.starts_with(&format!("{}/", entry))
        })
    }

    /// The `user` keyword in a platform's allow-list opts its personal repositories in
    fn personal_allowed(&self, repo: &Repository) -> bool {
        if self.include_personal || !repo.is_personal {
            return true;
        }
        self.orgs.get(&repo.platform).is_some_and(|allowed| {
            allowed
                .iter()
                .any(|entry| entry.trim().eq_ignore_ascii_case(USER_KEYWORD))
        })
    }
}

fn parse_patterns(entries: &[String]) -> Result<Vec<NamePattern>, BackupError> {
    entries
        .iter()
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| NamePattern::parse(entry))
        .collect()
}

/// Apply every stage, preserving input order and dropping duplicate identities
pub fn filter(repositories: &[Repository], config: &FilterConfig) -> Vec<Repository> {
    let mut seen = HashSet::new();
    let mut selected = Vec::new();

    for repo in repositories {
        if !config.platform_allowed(repo) {
            continue;
        }
        if !config.org_allowed(repo) {
            debug!("Excluding {} (organization not allowed)", repo.qualified_name());
            continue;
        }
        if repo.is_fork && !config.include_forks {
            debug!("Excluding fork {}", repo.qualified_name());
            continue;
        }
        if !config.personal_allowed(repo) {
            debug!("Excluding personal repository {}", repo.qualified_name());
            continue;
        }
        if !config.repos.is_empty() && !config.repos.iter().any(|p| p.matches(repo)) {
            continue;
        }
        if !config.patterns.is_empty() && !config.patterns.iter().any(|p| p.matches(repo)) {
            continue;
        }

        let identity = (
            repo.platform,
            repo.owner.to_ascii_lowercase(),
            repo.name.to_ascii_lowercase(),
        );
        if seen.insert(identity) {
            selected.push(repo.clone());
        }
    }

    selected
}

/// Smallest non-fork repository with a known non-zero size, for smoke tests
pub fn smallest_candidate(repositories: &[Repository]) -> Option<&Repository> {
    repositories
        .iter()
        .filter(|repo| !repo.is_fork)
        .filter(|repo| repo.size_bytes.is_some_and(|size| size > 0))
        .min_by_key(|repo| repo.size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn repo(platform: Platform, owner: &str, name: &str) -> Repository {
        Repository::new(platform, owner, name, format!("https://example.com/{}/{}.git", owner, name))
    }

    fn fork(platform: Platform, owner: &str, name: &str) -> Repository {
        let mut r = repo(platform, owner, name);
        r.is_fork = true;
        r
    }

    fn personal(platform: Platform, owner: &str, name: &str) -> Repository {
        let mut r = repo(platform, owner, name);
        r.is_personal = true;
        r
    }

    fn names(repos: &[Repository]) -> Vec<String> {
        repos.iter().map(Repository::qualified_name).collect()
    }

    #[test]
    fn test_org_allow_list_excludes_forks_and_other_orgs() {
        let repos = vec![
            repo(Platform::GitHub, "acme", "core"),
            fork(Platform::GitHub, "acme", "core-fork"),
            repo(Platform::GitHub, "other", "x"),
        ];
        let config = FilterConfig {
            platforms: vec![Platform::GitHub],
            orgs: HashMap::from([(Platform::GitHub, vec!["acme".to_string()])]),
            ..Default::default()
        };

        assert_eq!(names(&filter(&repos, &config)), vec!["github:acme/core"]);
    }

    #[test]
    fn test_platform_allow_list() {
        let repos = vec![
            repo(Platform::GitHub, "acme", "core"),
            repo(Platform::GitLab, "acme", "core"),
        ];
        let config = FilterConfig {
            platforms: vec![Platform::GitLab],
            ..Default::default()
        };
        assert_eq!(names(&filter(&repos, &config)), vec!["gitlab:acme/core"]);
    }

    #[test]
    fn test_gitlab_subgroups_match_parent_group() {
        let repos = vec![
            repo(Platform::GitLab, "platform/infra", "terraform"),
            repo(Platform::GitLab, "platform-old", "legacy"),
        ];
        let config = FilterConfig {
            orgs: HashMap::from([(Platform::GitLab, vec!["Platform".to_string()])]),
            ..Default::default()
        };
        assert_eq!(
            names(&filter(&repos, &config)),
            vec!["gitlab:platform/infra/terraform"]
        );
    }

    #[test]
    fn test_personal_exclusion_and_user_keyword() {
        let repos = vec![
            personal(Platform::GitHub, "alice", "dotfiles"),
            repo(Platform::GitHub, "acme", "core"),
        ];

        let config = FilterConfig::default();
        assert_eq!(names(&filter(&repos, &config)), vec!["github:acme/core"]);

        let config = FilterConfig {
            include_personal: true,
            ..Default::default()
        };
        assert_eq!(filter(&repos, &config).len(), 2);

        let config = FilterConfig {
            orgs: HashMap::from([(Platform::GitHub, vec!["user".to_string()])]),
            ..Default::default()
        };
        assert_eq!(names(&filter(&repos, &config)), vec!["github:alice/dotfiles"]);
    }

    #[test]
    fn test_pattern_kinds() {
        let core = repo(Platform::GitHub, "Acme", "Core");

        assert!(NamePattern::parse("acme/core").unwrap().matches(&core));
        assert!(NamePattern::parse("github:acme/core").unwrap().matches(&core));
        assert!(!NamePattern::parse("gitlab:acme/core").unwrap().matches(&core));
        assert!(!NamePattern::parse("acme/cor").unwrap().matches(&core));

        assert!(NamePattern::parse("acme/*").unwrap().matches(&core));
        assert!(NamePattern::parse("github:acme/c?re").unwrap().matches(&core));
        assert!(NamePattern::parse("acme/[a-c]ore").unwrap().matches(&core));
        assert!(!NamePattern::parse("acme/[!c]ore").unwrap().matches(&core));
        assert!(!NamePattern::parse("acme/co*x").unwrap().matches(&core));

        assert!(NamePattern::parse("re:^acme/").unwrap().matches(&core));
        assert!(NamePattern::parse("re:ore$").unwrap().matches(&core));
        assert!(!NamePattern::parse("re:^gitlab:").unwrap().matches(&core));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let dotted = repo(Platform::GitHub, "acme", "a.b");
        let other = repo(Platform::GitHub, "acme", "axb");
        let pattern = NamePattern::parse("acme/a.*").unwrap();
        assert!(pattern.matches(&dotted));
        assert!(!pattern.matches(&other));
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        let err = NamePattern::parse("re:(unclosed").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_explicit_list_then_patterns_narrow() {
        let repos = vec![
            repo(Platform::GitHub, "acme", "core"),
            repo(Platform::GitHub, "acme", "api"),
            repo(Platform::GitHub, "acme", "web"),
        ];
        let config = FilterConfig {
            repos: parse_patterns(&["acme/core".to_string(), "acme/api".to_string()]).unwrap(),
            patterns: parse_patterns(&["*/a*".to_string()]).unwrap(),
            ..Default::default()
        };
        assert_eq!(names(&filter(&repos, &config)), vec!["github:acme/api"]);
    }

    #[test]
    fn test_output_has_no_duplicates_and_keeps_order() {
        let repos = vec![
            repo(Platform::GitHub, "acme", "b"),
            repo(Platform::GitHub, "acme", "a"),
            repo(Platform::GitHub, "acme", "b"),
        ];
        let filtered = filter(&repos, &FilterConfig::default());
        assert_eq!(names(&filtered), vec!["github:acme/b", "github:acme/a"]);
    }

    #[test]
    fn test_smallest_candidate_skips_forks_and_unknown_sizes() {
        let mut big = repo(Platform::GitHub, "acme", "big");
        big.size_bytes = Some(10_000);
        let mut small_fork = fork(Platform::GitHub, "acme", "small-fork");
        small_fork.size_bytes = Some(10);
        let mut zero = repo(Platform::GitHub, "acme", "zero");
        zero.size_bytes = Some(0);
        let mut small = repo(Platform::GitLab, "acme", "small");
        small.size_bytes = Some(500);
        let unknown = repo(Platform::Bitbucket, "acme", "unknown");

        let repos = vec![big, small_fork, zero, small, unknown];
        let candidate = smallest_candidate(&repos).unwrap();
        assert_eq!(candidate.qualified_name(), "gitlab:acme/small");
    }

    #[test]
    fn test_from_config_merges_repos_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("repos.txt");
        std::fs::write(&path, "# keep\nacme/api\n").unwrap();

        let mut config = Config::default();
        config.filters.repos = vec!["acme/core".to_string()];
        config.filters.repos_file = Some(path.to_string_lossy().into_owned());
        config.filters.platforms = vec!["github".to_string()];
        config.platforms.gitlab.include_groups = vec!["platform".to_string()];

        let filter_config = FilterConfig::from_config(&config).unwrap();
        assert_eq!(filter_config.repos.len(), 2);
        assert_eq!(filter_config.platforms, vec![Platform::GitHub]);
        assert!(filter_config.orgs.contains_key(&Platform::GitLab));
        assert!(!filter_config.orgs.contains_key(&Platform::GitHub));
    }

    const POOL: [(&str, &str, bool, bool); 8] = [
        ("acme", "core", false, false),
        ("acme", "core-fork", true, false),
        ("acme", "api", false, false),
        ("other", "x", false, false),
        ("alice", "dotfiles", false, true),
        ("acme", "svc-billing", false, false),
        ("acme", "svc-auth", true, false),
        ("other", "svc-mail", false, false),
    ];

    fn pool_repo(index: u8) -> Repository {
        let (owner, name, is_fork, is_personal) = POOL[index as usize % POOL.len()];
        let platform = Platform::ALL[index as usize % Platform::ALL.len()];
        let mut r = repo(platform, owner, name);
        r.is_fork = is_fork;
        r.is_personal = is_personal;
        r
    }

    #[quickcheck]
    fn prop_filter_independent_of_input_order(indices: Vec<u8>) -> bool {
        let repos: Vec<Repository> = indices.iter().copied().map(pool_repo).collect();
        let mut reversed = repos.clone();
        reversed.reverse();

        let config = FilterConfig {
            orgs: HashMap::from([(Platform::GitHub, vec!["acme".to_string()])]),
            patterns: parse_patterns(&["re:core|svc".to_string()]).unwrap(),
            ..Default::default()
        };

        let forward: HashSet<String> = names(&filter(&repos, &config)).into_iter().collect();
        let backward: HashSet<String> = names(&filter(&reversed, &config)).into_iter().collect();
        forward == backward
    }

    #[quickcheck]
    fn prop_filter_output_satisfies_every_stage(indices: Vec<u8>) -> bool {
        let repos: Vec<Repository> = indices.iter().copied().map(pool_repo).collect();
        let config = FilterConfig {
            platforms: vec![Platform::GitHub, Platform::Bitbucket],
            ..Default::default()
        };

        filter(&repos, &config).iter().all(|r| {
            config.platforms.contains(&r.platform) && !r.is_fork && !r.is_personal
        })
    }
}
