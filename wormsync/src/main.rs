//! wormsync - entry point
//!
//! `backup` watches directories and uploads finished files; `restore` pulls a
//! fileset back down.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wormsync::config::Config;
use wormsync::daemon::shutdown::ShutdownCoordinator;
use wormsync::executor::{self, BackupRequest, RestoreRequest};
use wormsync::store::s3::S3Connector;
use wormsync::store::StoreConnector;
use wormsync::utils;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload finished files under the given directories
    Backup(BackupArgs),
    /// Download a fileset into a local directory
    Restore(RestoreArgs),
}

#[derive(Args, Debug)]
struct BackupArgs {
    /// Bucket name (overrides config)
    #[arg(long)]
    bucket: Option<String>,

    /// S3-compatible endpoint URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Prefix prepended to every object key
    #[arg(long)]
    key_prefix: Option<String>,

    /// Number of upload workers
    #[arg(long)]
    workers: Option<usize>,

    /// Do not write a manifest with each upload
    #[arg(long)]
    no_index: bool,

    /// Scan once, upload what is there and exit
    #[arg(long)]
    once: bool,

    /// Directories to watch
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Bucket name (overrides config)
    #[arg(long)]
    bucket: Option<String>,

    /// Batch directory the files were backed up from
    #[arg(long)]
    origin: String,

    /// Local directory to restore into
    #[arg(long)]
    target: PathBuf,

    /// Fileset name (the file whose upload wrote the manifest); the newest
    /// manifest of the directory is used when omitted
    #[arg(long)]
    fileset: Option<String>,

    /// Host the fileset was uploaded from
    #[arg(long)]
    host: Option<String>,

    /// Owner for restored files
    #[arg(long)]
    owner: Option<String>,

    /// Group for restored files
    #[arg(long)]
    group: Option<String>,

    /// Restore stored owner and permissions
    #[arg(long)]
    preserve: bool,

    /// Number of download workers
    #[arg(long)]
    threads: Option<usize>,

    /// Download files even when a same-sized copy exists
    #[arg(long)]
    force: bool,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env_overrides();

    match &cli.command {
        Command::Backup(args) => {
            if let Some(bucket) = &args.bucket {
                config.store.bucket = bucket.clone();
            }
            if let Some(endpoint) = &args.endpoint {
                config.store.endpoint = Some(endpoint.clone());
            }
            if let Some(prefix) = &args.key_prefix {
                config.store.key_prefix = Some(prefix.clone());
            }
            if let Some(workers) = args.workers {
                config.workers.upload_workers = workers;
            }
            if args.no_index {
                config.transfer.index = false;
            }
        }
        Command::Restore(args) => {
            if let Some(bucket) = &args.bucket {
                config.store.bucket = bucket.clone();
            }
            if let Some(threads) = args.threads {
                config.workers.download_workers = threads;
            }
        }
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    utils::logger::init(&config.log, cli.log_level.as_deref())?;

    tracing::info!(
        "starting wormsync v{} (host: {}, bucket: {})",
        env!("CARGO_PKG_VERSION"),
        config.host_name(),
        config.store.bucket
    );

    let connector: Arc<dyn StoreConnector> = Arc::new(S3Connector::new(&config.store).await);
    let (token, signals) = ShutdownCoordinator::new().spawn();

    let result = match cli.command {
        Command::Backup(args) => executor::run_backup(
            &config,
            connector,
            BackupRequest::new(args.paths, args.once),
            token.clone(),
        )
        .await
        .context("backup failed"),
        Command::Restore(args) => executor::run_restore(
            &config,
            connector,
            RestoreRequest {
                origin: args.origin,
                target: args.target,
                fileset: args.fileset,
                host: args.host,
                owner: args.owner,
                group: args.group,
                preserve: args.preserve,
                force: args.force,
            },
            token.clone(),
        )
        .await
        .context("restore failed"),
    };

    // stop the signal listener if the run ended on its own
    token.cancel();
    if tokio::time::timeout(Duration::from_secs(1), signals).await.is_err() {
        tracing::warn!("signal listener did not stop in time");
    }

    result.map(|_| ())
}
