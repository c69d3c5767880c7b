//! Worker pools.
//!
//! Two shapes share one [`Coordinator`]:
//!
//! - push: a single unbounded FIFO queue drained by N long-lived workers,
//!   fed at any time through [`WorkQueue`] (uploads)
//! - static partition: a fixed item list split round-robin into N disjoint
//!   subsequences, one per worker (downloads)
//!
//! Workers check the cancellation token between items, never during one.

use crate::store::keys::is_temporary;
use crate::utils::{Result, SyncError};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Processes work items one at a time.
#[async_trait]
pub trait Worker: Send + 'static {
    type Item: Send + 'static;

    async fn process(&mut self, item: Self::Item) -> Result<()>;
}

/// Producer side of the push queue
#[derive(Debug)]
pub struct WorkQueue<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Consumer side, shared by every worker of the pool
#[derive(Debug)]
pub struct SharedQueue<T> {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

/// The queue closes once every [`WorkQueue`] handle is dropped and the
/// remaining items are drained.
pub fn work_queue<T>() -> (WorkQueue<T>, SharedQueue<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        WorkQueue { tx },
        SharedQueue {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        },
    )
}

impl<T> WorkQueue<T> {
    /// Returns false when the pool has already shut down.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }
}

impl WorkQueue<PathBuf> {
    /// Queue a finished file for upload. Names containing `-tmp` are files
    /// still being written and are dropped.
    pub fn enqueue(&self, path: PathBuf) -> bool {
        let temporary = path
            .file_name()
            .is_some_and(|name| is_temporary(&name.to_string_lossy()));
        if temporary {
            debug!("not queueing temporary file {}", path.display());
            return false;
        }
        self.push(path)
    }
}

impl<T> SharedQueue<T> {
    async fn pop(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

/// Round-robin split: item `i` goes to worker `i % workers`.
pub fn partition<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let workers = workers.max(1);
    let mut parts: Vec<Vec<T>> = (0..workers).map(|_| Vec::new()).collect();
    for (index, item) in items.into_iter().enumerate() {
        parts[index % workers].push(item);
    }
    parts
}

/// First fatal error raised by any worker of a run.
#[derive(Debug, Clone, Default)]
pub struct FatalSlot {
    inner: Arc<Mutex<Option<SyncError>>>,
}

impl FatalSlot {
    /// Record `err` unless an earlier one is already held.
    pub fn set(&self, err: SyncError) {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take(&self) -> Option<SyncError> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// State handed to every worker task.
struct WorkerScope {
    id: usize,
    token: CancellationToken,
    fatal: FatalSlot,
    abort_on_fatal: bool,
    active: Arc<AtomicUsize>,
}

impl WorkerScope {
    /// Returns false when the worker must stop.
    fn settle(&self, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) if e.is_fatal() && self.abort_on_fatal => {
                error!("worker {}: {}; stopping run", self.id, e);
                self.fatal.set(e);
                self.token.cancel();
                false
            }
            Err(e) => {
                error!("worker {}: {}", self.id, e);
                true
            }
        }
    }
}

impl Drop for WorkerScope {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns the cancellation token, the fatal-error slot and the worker handles
/// of one run.
pub struct Coordinator {
    token: CancellationToken,
    fatal: FatalSlot,
    abort_on_fatal: bool,
    report_interval: Duration,
}

impl Coordinator {
    pub fn new(token: CancellationToken, report_interval: Duration) -> Self {
        Self {
            token,
            fatal: FatalSlot::default(),
            abort_on_fatal: true,
            report_interval,
        }
    }

    /// When off, fatal worker errors are logged and the worker carries on.
    pub fn abort_on_fatal(mut self, enabled: bool) -> Self {
        self.abort_on_fatal = enabled;
        self
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn scopes(&self, count: usize) -> (Vec<WorkerScope>, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(count));
        let scopes = (0..count)
            .map(|id| WorkerScope {
                id,
                token: self.token.clone(),
                fatal: self.fatal.clone(),
                abort_on_fatal: self.abort_on_fatal,
                active: Arc::clone(&active),
            })
            .collect();
        (scopes, active)
    }

    /// Drain `queue` with `workers` until it closes or the run is cancelled.
    pub async fn run_push<W: Worker>(
        &self,
        workers: Vec<W>,
        queue: SharedQueue<W::Item>,
    ) -> Result<()> {
        let (scopes, active) = self.scopes(workers.len());
        info!("starting {} queue workers", workers.len());

        let handles = workers
            .into_iter()
            .zip(scopes)
            .map(|(mut worker, scope)| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    loop {
                        let item = tokio::select! {
                            biased;
                            _ = scope.token.cancelled() => break,
                            item = queue.pop() => match item {
                                Some(item) => item,
                                None => break,
                            },
                        };
                        if !scope.settle(worker.process(item).await) {
                            break;
                        }
                    }
                    debug!("worker {} exiting", scope.id);
                })
            })
            .collect();

        self.supervise(handles, active).await
    }

    /// Give each worker its own round-robin share of `items`.
    pub async fn run_partitioned<W: Worker>(
        &self,
        workers: Vec<W>,
        items: Vec<W::Item>,
    ) -> Result<()> {
        let parts = partition(items, workers.len());
        let (scopes, active) = self.scopes(workers.len());
        info!("starting {} partitioned workers", workers.len());

        let handles = workers
            .into_iter()
            .zip(scopes)
            .zip(parts)
            .map(|((mut worker, scope), part)| {
                tokio::spawn(async move {
                    for item in part {
                        if scope.token.is_cancelled() {
                            break;
                        }
                        if !scope.settle(worker.process(item).await) {
                            break;
                        }
                    }
                    debug!("worker {} exiting", scope.id);
                })
            })
            .collect();

        self.supervise(handles, active).await
    }

    /// Wait for every worker, logging progress, then surface any fatal error.
    async fn supervise(
        &self,
        handles: Vec<JoinHandle<()>>,
        active: Arc<AtomicUsize>,
    ) -> Result<()> {
        let all = join_all(handles);
        tokio::pin!(all);

        let period = self.report_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        let results = loop {
            tokio::select! {
                results = &mut all => break results,
                _ = ticker.tick() => {
                    info!("{} workers still active", active.load(Ordering::SeqCst));
                }
            }
        };

        for result in results {
            if let Err(e) = result {
                error!("worker task failed: {}", e);
            }
        }

        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
