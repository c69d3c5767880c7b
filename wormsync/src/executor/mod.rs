//! Backup and restore runs.
//!
//! A run wires the pieces together: one store session per worker, a
//! [`pool::Coordinator`] owning the cancellation token and the fatal-error
//! slot, and the shared run statistics.

pub mod download;
pub mod manifest;
pub mod pool;
pub mod restore;
pub mod upload;

use crate::config::Config;
use crate::fs::metadata::{probe_target, Ownership};
use crate::fs::watcher::PollWatcher;
use crate::store::keys::KeyLayout;
use crate::store::retry::RetryConfig;
use crate::store::session::StoreSession;
use crate::store::StoreConnector;
use crate::transfer::chunk::{system_memory_probe, ChunkPlanner, MemoryProbe};
use crate::transfer::progress::{RunStats, StatsSnapshot};
use crate::utils::Result;
use download::{DownloadContext, Downloader};
use pool::{work_queue, Coordinator};
use restore::RestoreResolver;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use upload::{UploadContext, UploadPipeline};

/// Inputs of a backup run
pub struct BackupRequest {
    pub paths: Vec<PathBuf>,
    /// Scan once, drain the queue and return
    pub once: bool,
    pub memory_probe: MemoryProbe,
}

impl BackupRequest {
    pub fn new(paths: Vec<PathBuf>, once: bool) -> Self {
        Self {
            paths,
            once,
            memory_probe: system_memory_probe(),
        }
    }
}

/// Inputs of a restore run
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    /// Batch directory the fileset was uploaded from
    pub origin: String,
    pub target: PathBuf,
    pub fileset: Option<String>,
    /// Source host, when restoring another machine's files
    pub host: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub preserve: bool,
    pub force: bool,
}

fn layout(config: &Config, host: Option<&str>) -> KeyLayout {
    let host = host
        .map(str::to_string)
        .unwrap_or_else(|| config.host_name());
    KeyLayout::new(config.store.key_prefix.as_deref(), host)
}

fn build_coordinator(config: &Config, token: CancellationToken) -> Coordinator {
    Coordinator::new(
        token,
        Duration::from_secs(config.workers.report_interval_secs),
    )
    .abort_on_fatal(config.transfer.abort_on_persistent_failure)
}

async fn open_sessions(
    connector: &Arc<dyn StoreConnector>,
    retry: RetryConfig,
    count: usize,
) -> Result<Vec<StoreSession>> {
    let mut sessions = Vec::with_capacity(count);
    for _ in 0..count {
        sessions.push(StoreSession::open(Arc::clone(connector), retry).await?);
    }
    Ok(sessions)
}

/// Upload the files under `request.paths` until cancelled, or once with
/// `request.once`.
pub async fn run_backup(
    config: &Config,
    connector: Arc<dyn StoreConnector>,
    request: BackupRequest,
    token: CancellationToken,
) -> Result<StatsSnapshot> {
    let mut watcher = PollWatcher::new(
        request.paths,
        Duration::from_secs(config.workers.scan_interval_secs),
    );

    let stats = Arc::new(RunStats::new());
    let ctx = Arc::new(UploadContext {
        layout: layout(config, None),
        planner: ChunkPlanner::new(&config.transfer, request.memory_probe),
        transfer_retry: RetryConfig::for_transfers(&config.transfer),
        index: config.transfer.index,
        rescan: (!request.once).then(|| watcher.rescan_handle()),
        stats: Arc::clone(&stats),
    });

    let sessions = open_sessions(
        &connector,
        RetryConfig::for_store_calls(&config.transfer),
        config.workers.upload_workers,
    )
    .await?;
    let workers = sessions
        .into_iter()
        .map(|session| UploadPipeline::new(Arc::clone(&ctx), session))
        .collect();

    // cancelled when the workers stop, to take the watcher down with them
    let run_token = token.child_token();
    let (queue, shared) = work_queue();
    let watch = if request.once {
        watcher.enqueue_settled(&queue);
        drop(queue);
        None
    } else {
        Some(tokio::spawn(watcher.run(queue, run_token.clone())))
    };

    let result = build_coordinator(config, run_token.clone())
        .run_push(workers, shared)
        .await;

    run_token.cancel();
    if let Some(watch) = watch {
        if let Err(e) = watch.await {
            warn!("watcher task failed: {}", e);
        }
    }

    let snapshot = stats.snapshot();
    info!("backup finished: {}", snapshot);
    result.map(|()| snapshot)
}

/// Restore one fileset into `request.target`.
pub async fn run_restore(
    config: &Config,
    connector: Arc<dyn StoreConnector>,
    request: RestoreRequest,
    token: CancellationToken,
) -> Result<StatsSnapshot> {
    let store_retry = RetryConfig::for_store_calls(&config.transfer);
    let resolver = RestoreResolver::new(layout(config, request.host.as_deref()));
    let mut session = StoreSession::open(Arc::clone(&connector), store_retry).await?;

    let fileset = resolver
        .resolve(&mut session, &request.origin, request.fileset.as_deref())
        .await?;

    let ownership = if request.preserve {
        match resolver.fileset_owner(&mut session, &fileset).await {
            Some(owner) => Ownership::from_metadata(&owner),
            None => {
                warn!(
                    "no usable owner metadata in fileset {}, using requested owner and group",
                    fileset.name
                );
                Ownership::from_names(request.owner.as_deref(), request.group.as_deref())?
            }
        }
    } else {
        Ownership::from_names(request.owner.as_deref(), request.group.as_deref())?
    };

    tokio::fs::create_dir_all(&request.target).await?;
    probe_target(&request.target, &ownership)?;

    let stats = Arc::new(RunStats::new());
    let ctx = Arc::new(DownloadContext {
        layout: resolver.layout().clone(),
        origin: fileset.origin.clone(),
        target: request.target.clone(),
        ownership,
        preserve: request.preserve,
        force: request.force,
        stats: Arc::clone(&stats),
    });

    let worker_count = config.workers.download_workers.min(fileset.files.len()).max(1);
    let mut sessions = vec![session];
    sessions.extend(open_sessions(&connector, store_retry, worker_count - 1).await?);
    let workers = sessions
        .into_iter()
        .map(|session| Downloader::new(Arc::clone(&ctx), session))
        .collect();

    info!(
        "restoring {} files of {} into {}",
        fileset.files.len(),
        fileset.name,
        request.target.display()
    );
    build_coordinator(config, token)
        .run_partitioned(workers, fileset.files)
        .await?;

    let snapshot = stats.snapshot();
    info!("restore finished: {}", snapshot);
    Ok(snapshot)
}
