//! Multipart retry, persistent failure and cancellation of backup runs.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wormsync::executor::{run_backup, BackupRequest};
use wormsync::store::memory::MemoryStore;
use wormsync::SyncError;

#[tokio::test]
async fn test_failed_part_aborts_and_retries_whole_upload() {
    let source = TempDir::new().unwrap();
    let content = pattern(40_000, 9);
    let path = write_file(&source.path().join("run1"), "big.dat", &content);

    let memory = MemoryStore::new();
    let store = FailingStore::new(memory.clone(), Fault::Part(17), 1);
    let mut config = multipart_config(1024, 1000);
    config.workers.upload_workers = 1;

    let run = backup_once(&config, Arc::new(store.clone()), source.path())
        .await
        .unwrap();
    assert_eq!(run.transferred, 1);
    assert_eq!(store.failures_left(), 0);

    let stats = memory.stats();
    assert_eq!(stats.multipart_created, 2);
    assert_eq!(stats.multipart_aborted, 1);
    assert_eq!(stats.multipart_completed, 1);
    // 16 parts before the failure, then all 40 again
    assert_eq!(stats.parts_uploaded, 56);
    assert_eq!(memory.pending_uploads(), 0);
    assert_eq!(
        memory.object(&object_key(&path)).unwrap().as_ref(),
        content.as_slice()
    );
}

#[tokio::test]
async fn test_exhausted_attempts_end_the_run() {
    let source = TempDir::new().unwrap();
    let path = write_file(&source.path().join("run1"), "big.dat", &pattern(5_000, 1));

    let memory = MemoryStore::new();
    let store = FailingStore::new(memory.clone(), Fault::Part(3), usize::MAX);
    let mut config = multipart_config(1024, 1000);
    config.transfer.upload_attempts = 2;

    let err = backup_once(&config, Arc::new(store), source.path())
        .await
        .unwrap_err();
    match err {
        SyncError::PersistentUploadFailure { path: failed, attempts, .. } => {
            assert_eq!(failed, path);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let stats = memory.stats();
    assert_eq!(stats.multipart_created, 2);
    assert_eq!(stats.multipart_aborted, 2);
    assert_eq!(memory.pending_uploads(), 0);
    assert!(memory.object(&object_key(&path)).is_none());
}

#[tokio::test]
async fn test_persistent_failure_is_logged_when_abort_is_disabled() {
    let source = TempDir::new().unwrap();
    let batch = source.path().join("run1");
    write_file(&batch, "big.dat", &pattern(5_000, 1));
    let small = write_file(&batch, "small.dat", b"fits in one put");

    let memory = MemoryStore::new();
    let store = FailingStore::new(memory.clone(), Fault::Part(2), usize::MAX);
    let mut config = multipart_config(1024, 1000);
    config.transfer.upload_attempts = 1;
    config.transfer.abort_on_persistent_failure = false;

    let run = backup_once(&config, Arc::new(store), source.path())
        .await
        .unwrap();
    assert_eq!(run.failed, 1);
    assert_eq!(run.transferred, 1);
    assert!(memory.object(&object_key(&small)).is_some());
}

#[tokio::test]
async fn test_unreachable_store_before_transfer_ends_the_run() {
    let source = TempDir::new().unwrap();
    let path = write_file(&source.path().join("run1"), "a.dat", b"never checked");

    let memory = MemoryStore::new();
    let store = FailingStore::new(memory.clone(), Fault::Head, usize::MAX);
    let mut config = config();
    config.transfer.store_attempts = 3;

    let err = backup_once(&config, Arc::new(store), source.path())
        .await
        .unwrap_err();
    match err {
        SyncError::PersistentUploadFailure { path: failed, attempts, last_error } => {
            assert_eq!(failed, path);
            assert_eq!(attempts, 3);
            assert!(last_error.contains("HEAD"), "{last_error}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(memory.stats().transfers(), 0);
}

#[tokio::test]
async fn test_store_failure_is_counted_when_abort_is_disabled() {
    let source = TempDir::new().unwrap();
    write_file(&source.path().join("run1"), "a.dat", b"checked once");

    let memory = MemoryStore::new();
    let store = FailingStore::new(memory.clone(), Fault::Head, usize::MAX);
    let mut config = config();
    config.transfer.store_attempts = 2;
    config.transfer.abort_on_persistent_failure = false;

    let run = backup_once(&config, Arc::new(store), source.path())
        .await
        .unwrap();
    assert_eq!(run.failed, 1);
    assert_eq!(run.transferred, 0);
}

#[tokio::test]
async fn test_watching_backup_stops_on_cancel() {
    let source = TempDir::new().unwrap();
    let path = write_file(&source.path().join("run1"), "a.dat", b"watched");

    let store = MemoryStore::new();
    let config = config();
    let token = CancellationToken::new();
    let request = BackupRequest {
        paths: vec![source.path().to_path_buf()],
        once: false,
        memory_probe: Arc::new(|| None::<u64>),
    };

    let run = tokio::spawn({
        let config = config.clone();
        let connector = Arc::new(store.clone());
        let token = token.clone();
        async move { run_backup(&config, connector, request, token).await }
    });

    let key = object_key(&path);
    tokio::time::timeout(Duration::from_secs(10), async {
        while store.object(&key).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    token.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.transferred, 1);
}

#[tokio::test]
async fn test_watching_backup_picks_failed_file_up_again() {
    let source = TempDir::new().unwrap();
    let path = write_file(&source.path().join("run1"), "a.dat", b"second time lucky");

    // the first upload spends its whole HEAD budget
    let memory = MemoryStore::new();
    let store = FailingStore::new(memory.clone(), Fault::Head, 2);
    let mut config = config();
    config.transfer.store_attempts = 2;
    config.transfer.abort_on_persistent_failure = false;

    let token = CancellationToken::new();
    let request = BackupRequest {
        paths: vec![source.path().to_path_buf()],
        once: false,
        memory_probe: Arc::new(|| None::<u64>),
    };
    let run = tokio::spawn({
        let store = store.clone();
        let token = token.clone();
        async move { run_backup(&config, Arc::new(store), request, token).await }
    });

    let key = object_key(&path);
    tokio::time::timeout(Duration::from_secs(10), async {
        while memory.object(&key).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    token.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(store.failures_left(), 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.transferred, 1);
}

#[tokio::test]
async fn test_cancelled_run_starts_no_transfer() {
    let source = TempDir::new().unwrap();
    write_file(&source.path().join("run1"), "a.dat", b"never sent");

    let store = MemoryStore::new();
    let token = CancellationToken::new();
    token.cancel();
    let request = BackupRequest {
        paths: vec![source.path().to_path_buf()],
        once: true,
        memory_probe: Arc::new(|| None::<u64>),
    };

    let stats = run_backup(&config(), Arc::new(store.clone()), request, token)
        .await
        .unwrap();
    assert_eq!(stats.transferred, 0);
    assert_eq!(store.stats().transfers(), 0);
}
