//! Polling change source for the backup side.
//!
//! Rescans the watch roots at a fixed interval. A file counts as finished once
//! its size is the same on two consecutive scans, and is then queued once. A
//! queued path is forgotten when it disappears from disk or when its upload
//! fails, so it is picked up again if it comes back.

use crate::executor::pool::WorkQueue;
use crate::fs::walker::scan_files;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hands paths back to the watcher so they settle and get queued again.
#[derive(Debug, Clone)]
pub struct RescanHandle {
    tx: mpsc::UnboundedSender<PathBuf>,
}

impl RescanHandle {
    pub fn rescan(&self, path: PathBuf) {
        // a stopped watcher has nothing left to retry
        let _ = self.tx.send(path);
    }
}

pub struct PollWatcher {
    roots: Vec<PathBuf>,
    interval: Duration,
    /// Size seen on the previous scan, for files not yet queued
    pending: HashMap<PathBuf, u64>,
    queued: HashSet<PathBuf>,
    rescan_tx: mpsc::UnboundedSender<PathBuf>,
    rescan_rx: mpsc::UnboundedReceiver<PathBuf>,
}

impl PollWatcher {
    pub fn new(roots: Vec<PathBuf>, interval: Duration) -> Self {
        let (rescan_tx, rescan_rx) = mpsc::unbounded_channel();
        Self {
            roots,
            interval,
            pending: HashMap::new(),
            queued: HashSet::new(),
            rescan_tx,
            rescan_rx,
        }
    }

    pub fn rescan_handle(&self) -> RescanHandle {
        RescanHandle {
            tx: self.rescan_tx.clone(),
        }
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// One scan. Returns the files that became stable since the last one.
    pub fn scan(&mut self) -> Vec<PathBuf> {
        while let Ok(path) = self.rescan_rx.try_recv() {
            debug!("rescanning {}", path.display());
            self.queued.remove(&path);
        }

        let mut present = HashSet::new();
        let mut complete = true;
        let mut ready = Vec::new();

        for root in &self.roots {
            let files = match scan_files(root) {
                Ok(files) => files,
                Err(e) => {
                    warn!("cannot scan {}: {}", root.display(), e);
                    complete = false;
                    continue;
                }
            };

            for file in files {
                present.insert(file.path.clone());
                if self.queued.contains(&file.path) {
                    continue;
                }
                match self.pending.insert(file.path.clone(), file.size) {
                    Some(previous) if previous == file.size => ready.push(file.path),
                    _ => {}
                }
            }
        }

        // forget files that disappeared, settled or not
        self.pending.retain(|path, _| present.contains(path));
        if complete {
            self.queued.retain(|path| present.contains(path));
        }
        for path in &ready {
            self.pending.remove(path);
            self.queued.insert(path.clone());
        }
        ready.sort();
        ready
    }

    /// Two back-to-back scans: everything whose size did not move in between.
    pub fn scan_settled(&mut self) -> Vec<PathBuf> {
        self.scan();
        self.scan()
    }

    /// Single pass for `--once` runs. Dropping `queue` afterwards closes the
    /// pool once it drains.
    pub fn enqueue_settled(&mut self, queue: &WorkQueue<PathBuf>) -> usize {
        let mut count = 0;
        for path in self.scan_settled() {
            if queue.enqueue(path) {
                count += 1;
            }
        }
        info!("queued {} files", count);
        count
    }

    /// Scan until cancelled.
    pub async fn run(mut self, queue: WorkQueue<PathBuf>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
        info!(
            "watching {} paths every {:?}",
            self.roots.len(),
            self.interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = token.cancelled() => break,
            }

            for path in self.scan() {
                debug!("file settled: {}", path.display());
                if !queue.enqueue(path) {
                    // pool already gone
                    return;
                }
            }
        }
        debug!("watcher stopped");
    }
}
