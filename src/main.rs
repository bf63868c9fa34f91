use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use repovault::config::{LoggingConfig, S3Config};
use repovault::health::{CheckResult, ConfigValidation, HealthCheck};
use repovault::report::{JobStatus, RunSummary};
use repovault::verify::{VerificationResult, Verifier};
use repovault::{BackupEngine, BackupMethod, Config, GitClient, Platform, RunMode};

#[derive(Parser)]
#[command(name = "repovault")]
#[command(about = "Back up GitHub, GitLab and Bitbucket repositories to local disk or S3")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Write artifacts under this local directory
    #[arg(long, conflicts_with = "s3_bucket")]
    local: Option<String>,

    /// Write artifacts to this S3 bucket
    #[arg(long)]
    s3_bucket: Option<String>,

    /// S3 region
    #[arg(long, requires = "s3_bucket")]
    region: Option<String>,

    /// Custom S3 endpoint for S3-compatible stores
    #[arg(long, requires = "s3_bucket")]
    endpoint: Option<String>,

    /// Key prefix for artifacts
    #[arg(long)]
    prefix: Option<String>,

    /// Only these platforms
    #[arg(long, value_enum, value_delimiter = ',')]
    platform: Vec<Platform>,

    /// Only these organizations, groups or workspaces ("user" for personal repositories)
    #[arg(long, value_delimiter = ',')]
    org: Vec<String>,

    /// Explicit repositories (owner/name, platform:owner/name, glob or re:regex)
    #[arg(long, value_delimiter = ',')]
    repos: Vec<String>,

    /// File with one repository entry per line
    #[arg(long)]
    repos_file: Option<String>,

    /// Include forked repositories
    #[arg(long)]
    include_forks: bool,

    /// Include personal repositories
    #[arg(long)]
    include_personal: bool,

    /// Maximum concurrent backup jobs
    #[arg(long)]
    workers: Option<usize>,

    /// Run one job at a time
    #[arg(long, conflicts_with = "workers")]
    sequential: bool,

    /// Re-create artifacts that already exist
    #[arg(long)]
    force: bool,

    /// Packaging method
    #[arg(long, value_enum)]
    method: Option<BackupMethod>,

    /// Per-job timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Whole-run timeout in seconds
    #[arg(long)]
    run_timeout: Option<u64>,

    /// Parent directory for temporary clones
    #[arg(long)]
    work_dir: Option<String>,

    /// Skip Git LFS export
    #[arg(long)]
    no_lfs: bool,

    /// Skip verification after each write
    #[arg(long)]
    no_verify: bool,

    /// Check git, credentials and the destination, then exit
    #[arg(long)]
    health_check: bool,

    /// Validate configuration and credentials without network access, then exit
    #[arg(long)]
    validate_config: bool,

    /// Verify artifacts in a local file/directory or under a destination prefix, then exit
    #[arg(long, value_name = "PATH")]
    verify_backup: Option<String>,

    /// List existing backups, newest first, then exit
    #[arg(long)]
    list: bool,

    /// Back up only the smallest repository to test the configuration
    #[arg(long)]
    test: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging)?;
    info!("Starting RepoVault v{}", env!("CARGO_PKG_VERSION"));

    apply_overrides(&mut config, &cli)?;

    let code = if cli.validate_config {
        cmd_validate_config(&config)
    } else if cli.health_check {
        cmd_health_check(&config).await
    } else if let Some(target) = &cli.verify_backup {
        cmd_verify_backup(config, target).await?
    } else if cli.list {
        cmd_list(config, &cli.platform).await?
    } else {
        let mode = if cli.test { RunMode::SmokeTest } else { RunMode::Full };
        cmd_backup(config, mode).await?
    };

    std::process::exit(code);
}

/// Initialize logging from the config, `--verbose` and `RUST_LOG`
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Invalid log level")?;

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match logging.format.as_str() {
        "json" => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        "pretty" => fmt::layer().pretty().with_writer(std::io::stderr).boxed(),
        _ => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
    };

    tracing_subscriber::registry().with(layer).with(filter).init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// CLI flags win over the configuration file
fn apply_overrides(config: &mut Config, cli: &Cli) -> Result<()> {
    if let Some(local) = &cli.local {
        config.destination.local_path = Some(
            shellexpand::full(local)
                .context("Failed to expand --local")?
                .into_owned(),
        );
        config.destination.s3 = None;
    }

    if let Some(bucket) = &cli.s3_bucket {
        let existing = config.destination.s3.take();
        let region = cli
            .region
            .clone()
            .or_else(|| existing.as_ref().map(|s3| s3.region.clone()))
            .unwrap_or_else(|| "us-west-2".to_string());
        let endpoint = cli
            .endpoint
            .clone()
            .or_else(|| existing.and_then(|s3| s3.endpoint));
        config.destination.s3 = Some(S3Config {
            bucket: bucket.clone(),
            region,
            endpoint,
        });
        config.destination.local_path = None;
    }

    if let Some(prefix) = &cli.prefix {
        config.destination.prefix = prefix.clone();
    }

    if !cli.platform.is_empty() {
        config.filters.platforms = cli.platform.iter().map(|p| p.as_str().to_string()).collect();
    }

    if !cli.org.is_empty() {
        config.platforms.github.include_orgs = cli.org.clone();
        config.platforms.gitlab.include_groups = cli.org.clone();
        config.platforms.bitbucket.include_workspaces = cli.org.clone();
    }

    if !cli.repos.is_empty() {
        config.filters.repos = cli.repos.clone();
    }
    if let Some(repos_file) = &cli.repos_file {
        config.filters.repos_file = Some(
            shellexpand::full(repos_file)
                .context("Failed to expand --repos-file")?
                .into_owned(),
        );
    }

    config.filters.include_forks |= cli.include_forks;
    config.filters.include_personal |= cli.include_personal;

    if let Some(workers) = cli.workers {
        config.backup.workers = workers;
    }
    if cli.sequential {
        config.backup.workers = 1;
    }
    config.backup.force |= cli.force;
    if let Some(method) = cli.method {
        config.backup.method = method;
    }
    if let Some(timeout) = cli.timeout {
        config.backup.job_timeout = timeout;
    }
    if let Some(run_timeout) = cli.run_timeout {
        config.backup.run_timeout = Some(run_timeout);
    }
    if let Some(work_dir) = &cli.work_dir {
        config.backup.work_dir = Some(
            shellexpand::full(work_dir)
                .context("Failed to expand --work-dir")?
                .into_owned(),
        );
    }
    if cli.no_lfs {
        config.backup.lfs = false;
    }
    if cli.no_verify {
        config.backup.verify = false;
    }

    Ok(())
}

/// Run a backup and print the summary
async fn cmd_backup(config: Config, mode: RunMode) -> Result<i32> {
    config.validate()?;

    let engine = BackupEngine::new(config)?;
    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running backups");
            cancel.cancel();
        }
    });

    if mode == RunMode::SmokeTest {
        println!("🧪 Test mode: backing up the smallest repository only");
    }
    println!("📦 Backing up to {}", engine.destination().describe());

    let summary = engine.run(mode).await?;
    print_summary(&summary);

    Ok(summary.exit_code())
}

fn print_summary(summary: &RunSummary) {
    println!("\n🎉 Backup Complete!");
    println!("   📊 Total repositories: {}", summary.total_jobs());
    println!("   ✅ Completed: {}", summary.count(JobStatus::Completed));
    println!("   ⏭️  Skipped (unchanged): {}", summary.count(JobStatus::Skipped));
    println!("   📭 Empty: {}", summary.count(JobStatus::EmptyRepository));
    println!("   ❌ Failed: {}", summary.failed_jobs().count());
    println!("   💾 Bytes written: {}", summary.bytes_written);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.per_platform.len() > 1 {
        println!("\n📈 By platform:");
        for (platform, totals) in &summary.per_platform {
            println!(
                "   {}: {} jobs, {} completed, {} skipped, {} failed",
                platform.display_name(),
                totals.jobs,
                totals.completed,
                totals.skipped,
                totals.failed
            );
        }
    }

    if !summary.adapter_failures.is_empty() {
        println!("\n⚠️  Platform failures:");
        for failure in &summary.adapter_failures {
            println!(
                "   {} {} ({}): {}",
                if failure.fatal { "❌" } else { "⚠️ " },
                failure.platform.display_name(),
                failure.kind,
                failure.message
            );
        }
    }

    let failed: Vec<_> = summary.failed_jobs().collect();
    if !failed.is_empty() {
        println!("\n🔍 Failed jobs:");
        for outcome in failed {
            println!(
                "   ❌ {} [{}]: {}",
                outcome.repository,
                outcome.status,
                outcome.message.as_deref().unwrap_or("")
            );
        }
    }
}

fn cmd_validate_config(config: &Config) -> i32 {
    let validation = ConfigValidation::run(config);

    for warning in &validation.warnings {
        println!("⚠️  {}", warning);
    }
    for error in &validation.errors {
        println!("❌ {}", error);
    }

    if validation.is_valid() {
        println!("✅ Configuration is valid");
        0
    } else {
        println!("❌ Configuration has {} error(s)", validation.errors.len());
        1
    }
}

async fn cmd_health_check(config: &Config) -> i32 {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);
    if health.all_passed() {
        0
    } else {
        1
    }
}

async fn cmd_verify_backup(config: Config, target: &str) -> Result<i32> {
    let results = if Path::new(target).exists() {
        Verifier::new(GitClient::new(config.retry.clone()))
            .verify_local(Path::new(target))
            .await?
    } else {
        config.validate()?;
        BackupEngine::new(config)?.verify_backups(target).await?
    };

    print_verification(&results);
    let failed = results.iter().filter(|r| !r.passed()).count();
    Ok(if failed == 0 { 0 } else { 1 })
}

fn print_verification(results: &[VerificationResult]) {
    println!("🔍 Verified {} artifact(s)", results.len());
    for result in results {
        match &result.error {
            None => println!("   ✅ {}", result.target),
            Some(error) => println!("   ❌ {}: {}", result.target, error),
        }
    }
}

async fn cmd_list(config: Config, platforms: &[Platform]) -> Result<i32> {
    config.validate()?;
    let engine = BackupEngine::new(config)?;
    let artifacts = engine.list_backups(platforms).await?;

    println!("Backups ({}):", artifacts.len());
    for artifact in artifacts {
        let modified = artifact
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  📁 {}  {} bytes  {}", artifact.key, artifact.size_bytes, modified);
    }

    Ok(0)
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 RepoVault System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(&name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
