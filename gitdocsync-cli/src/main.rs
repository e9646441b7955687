//! gitdocsync — replicate git object graphs to and from a document store.
//!
//! Supports:
//! - Pushing a git repository (local or fetched from a URL) into a store
//! - Pulling a store back into a git repository
//! - Single runs or polling on a fixed interval
//!
//! # Usage
//!
//! ```bash
//! # Replicate the repository in the current directory
//! gitdocsync push --dest http://localhost:5984/git
//!
//! # Mirror a remote repository every ten minutes
//! gitdocsync push --source git://example.com/project.git \
//!     --dest http://localhost:5984/project --poll --poll-interval 600
//!
//! # Rebuild a repository from the store
//! gitdocsync pull --source http://localhost:5984/project --dest /srv/project.git
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gitdoc_core::{
    writer_for, CouchStore, GitObjectStore, GitRepo, GitResolver, Replicator, RunSummary,
    StoreResolver, SyncConfig, WriteStrategy,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "gitdocsync")]
#[command(author = "gitdoc Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Replicate git object graphs to and from a document store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replicate a git repository into a document store
    Push {
        /// Git URL to mirror (default: the repository in the current directory)
        #[arg(short, long, value_name = "GIT_URL")]
        source: Option<String>,
        /// Document store database URL
        #[arg(short, long, value_name = "STORE_URL")]
        dest: String,
        #[command(flatten)]
        options: RunOptions,
    },

    /// Replicate a document store into a git repository
    Pull {
        /// Document store database URL
        #[arg(short, long, value_name = "STORE_URL")]
        source: String,
        /// Git repository directory (created if missing)
        #[arg(short, long, value_name = "GIT_DIR")]
        dest: PathBuf,
        #[command(flatten)]
        options: RunOptions,
    },
}

#[derive(Args, Debug, Default)]
struct RunOptions {
    /// Keep running, one replication per interval
    #[arg(long)]
    poll: bool,
    /// Seconds between runs when polling (default: hourly)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,
    /// Directory holding fetched git mirrors
    #[arg(long)]
    cache_root: Option<PathBuf>,
    /// Write strategy: cas or atomic
    #[arg(long)]
    strategy: Option<WriteStrategy>,
    /// Give up on a document after this many conflicting writes
    #[arg(long)]
    max_write_attempts: Option<u64>,
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl RunOptions {
    fn load_config(&self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => SyncConfig::default(),
        };
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if let Some(root) = &self.cache_root {
            config.cache_root = root.clone();
        }
        if let Some(strategy) = self.strategy {
            config.write_strategy = strategy;
        }
        if self.max_write_attempts.is_some() {
            config.max_write_attempts = self.max_write_attempts;
        }
        config.cache_root = std::path::absolute(&config.cache_root)
            .with_context(|| format!("Invalid cache root {:?}", config.cache_root))?;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gitdocsync=info".parse()?)
                .add_directive("gitdoc_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Push {
            source,
            dest,
            options,
        } => cmd_push(source, dest, options).await,

        Commands::Pull {
            source,
            dest,
            options,
        } => cmd_pull(source, dest, options).await,
    }
}

async fn cmd_push(source: Option<String>, dest: String, options: RunOptions) -> Result<()> {
    let config = options.load_config()?;
    let store =
        CouchStore::new(&dest).with_context(|| format!("Invalid store URL {:?}", dest))?;

    println!("Pushing git objects...");
    println!("  Source: {}", source.as_deref().unwrap_or("."));
    println!("  Dest:   {}", dest);
    println!("  Writes: {}", config.write_strategy);

    run_mode(options.poll, config.poll_interval(), || {
        push_once(source.as_deref(), &store, &config)
    })
    .await
}

async fn push_once(
    source: Option<&str>,
    store: &CouchStore,
    config: &SyncConfig,
) -> Result<RunSummary> {
    let repo = match source {
        Some(url) => GitRepo::mirror(&config.cache_root, url)
            .await
            .with_context(|| format!("Failed to fetch {}", url))?,
        None => GitRepo::open(std::env::current_dir()?),
    };
    let resolver = GitResolver::new(repo);
    let writer = writer_for(store.clone(), config);
    let summary = Replicator::new(&resolver, store, &*writer)
        .with_config(config.engine())
        .run()
        .await?;
    Ok(summary)
}

async fn cmd_pull(source: String, dest: PathBuf, options: RunOptions) -> Result<()> {
    let config = options.load_config()?;
    let store =
        CouchStore::new(&source).with_context(|| format!("Invalid store URL {:?}", source))?;

    println!("Pulling git objects...");
    println!("  Source: {}", source);
    println!("  Dest:   {}", dest.display());
    println!("  Writes: {}", config.write_strategy);

    run_mode(options.poll, config.poll_interval(), || {
        pull_once(&store, &dest, &config)
    })
    .await
}

async fn pull_once(source: &CouchStore, dest: &Path, config: &SyncConfig) -> Result<RunSummary> {
    let target = GitObjectStore::init(dest)
        .await
        .with_context(|| format!("Failed to prepare repository {}", dest.display()))?;
    let resolver = StoreResolver::new(source.clone());
    let writer = writer_for(target.clone(), config);
    let summary = Replicator::new(&resolver, &target, &*writer)
        .with_config(config.engine())
        .run()
        .await?;
    Ok(summary)
}

/// Run once, or forever with `interval` between runs when polling.
///
/// A failed run ends a single-run invocation with an error; while polling it
/// is logged and the next run goes ahead as scheduled.
async fn run_mode<F, Fut>(poll: bool, interval: Duration, mut run: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RunSummary>>,
{
    loop {
        match run().await {
            Ok(summary) => print_summary(&summary),
            Err(e) if poll => tracing::error!("Replication run failed: {:#}", e),
            Err(e) => return Err(e),
        }
        if !poll {
            return Ok(());
        }
        tracing::info!(seconds = interval.as_secs(), "Waiting for next run");
        tokio::time::sleep(interval).await;
    }
}

fn print_summary(summary: &RunSummary) {
    println!("\nRun completed:");
    println!("  Already present: {}", summary.initially_settled);
    println!("  Resolved:        {}", summary.resolved);
    println!("  Committed:       {}", summary.committed);
    println!("  Skipped:         {}", summary.skipped);
    if summary.cache_evictions > 0 || summary.worklist_truncations > 0 {
        println!(
            "  Overflow:        {} cache evictions, {} worklist truncations",
            summary.cache_evictions, summary.worklist_truncations
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_arguments() {
        let cli = Cli::try_parse_from([
            "gitdocsync",
            "push",
            "--dest",
            "http://localhost:5984/git",
            "--poll",
            "--poll-interval",
            "60",
            "--strategy",
            "atomic",
        ])
        .unwrap();
        let Commands::Push {
            source,
            dest,
            options,
        } = cli.command
        else {
            panic!("expected push");
        };
        assert!(source.is_none());
        assert_eq!(dest, "http://localhost:5984/git");
        assert!(options.poll);

        let config = options.load_config().unwrap();
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.write_strategy, WriteStrategy::Atomic);
        assert!(config.cache_root.is_absolute());
    }

    #[test]
    fn test_pull_requires_source() {
        assert!(Cli::try_parse_from(["gitdocsync", "pull", "--dest", "/tmp/repo"]).is_err());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!(
            Cli::try_parse_from([
                "gitdocsync",
                "push",
                "--dest",
                "http://localhost:5984/git",
                "--strategy",
                "bulk",
            ])
            .is_err()
        );
    }

    #[test]
    fn test_default_options() {
        let config = RunOptions::default().load_config().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(3600));
        assert!(config.cache_root.ends_with("gitcouchsynccache"));
        assert_eq!(config.max_write_attempts, None);
    }

    #[tokio::test]
    async fn test_single_run_failure_is_returned() {
        let result = run_mode(false, Duration::from_secs(0), || async {
            Err(anyhow::anyhow!("store unreachable"))
        })
        .await;
        assert!(result.is_err());
    }
}
