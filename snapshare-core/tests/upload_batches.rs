//! Batch upload behaviour against fault-injecting collaborators.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use snapshare_core::config::{TimeoutConfig, UploadConfig};
use snapshare_core::feed::RoomMediaFeed;
use snapshare_core::infra::InMemoryKeyValueStore;
use snapshare_core::ports::DataService;
use snapshare_core::transfer::{BatchOutcome, BatchPhase, BatchSnapshot};
use snapshare_core::{BlobTransferClient, LocalCacheStore, UploadContext, UploadCoordinator};
use snapshare_model::{RoomContext, RoomId};
use tokio::sync::watch;

#[path = "support/mod.rs"]
mod support;

use support::fakes::{FlakyBlobStore, FlakyDataService};
use support::fixtures::{photo_bytes, write_photos};

fn coordinator(blobs: &Arc<FlakyBlobStore>, data: &Arc<FlakyDataService>) -> UploadCoordinator {
    let client = BlobTransferClient::new(blobs.clone(), TimeoutConfig::default());
    UploadCoordinator::new(client, data.clone(), UploadConfig::default())
}

/// Collect every snapshot until the batch retires.
fn record(mut rx: watch::Receiver<BatchSnapshot>) -> tokio::task::JoinHandle<Vec<BatchSnapshot>> {
    tokio::spawn(async move {
        let mut seen = vec![rx.borrow_and_update().clone()];
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            let retired = matches!(snapshot.phase, BatchPhase::Retired(_));
            seen.push(snapshot);
            if retired {
                break;
            }
        }
        seen
    })
}

#[tokio::test(start_paused = true)]
async fn item_failing_twice_still_completes() -> Result<()> {
    support::init_tracing();
    let dir = tempfile::tempdir()?;
    let files = write_photos(dir.path(), 3).await;
    let blobs = Arc::new(FlakyBlobStore::new());
    let data = Arc::new(FlakyDataService::new());
    blobs.fail_put(photo_bytes(1), 2);

    let room = RoomId::new();
    let handle = coordinator(&blobs, &data).submit_batch(files, UploadContext::new(room, "me"));
    let history = record(handle.progress());
    let report = handle.wait().await?;

    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.outcome, BatchOutcome::AllSucceeded);
    assert_eq!(blobs.put_calls(), 5);
    assert_eq!(data.list_media(room).await?.len(), 3);

    let history = history.await?;
    for pair in history.windows(2) {
        assert!(pair[1].reported_progress >= pair[0].reported_progress);
    }
    for snapshot in &history {
        assert!(snapshot.resolved() <= snapshot.total);
    }
    let last = history.last().expect("at least one snapshot");
    assert_eq!(last.reported_progress, 1.0);
    assert_eq!(last.phase, BatchPhase::Retired(BatchOutcome::AllSucceeded));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_items_are_counted_once_and_stay_out_of_the_feed() -> Result<()> {
    support::init_tracing();
    let dir = tempfile::tempdir()?;
    let files = write_photos(dir.path(), 5).await;
    let blobs = Arc::new(FlakyBlobStore::new());
    let data = Arc::new(FlakyDataService::new());
    // One first attempt plus three retries.
    blobs.fail_put(photo_bytes(0), 4);
    blobs.fail_put(photo_bytes(3), 4);

    let room = RoomContext::new(RoomId::new(), "olive");
    let feed = RoomMediaFeed::new(room.clone(), "me", data.clone());
    feed.load().await?;

    let ctx = UploadContext::new(room.room_id, "me").with_feed(feed.clone());
    let report = coordinator(&blobs, &data).submit_batch(files, ctx).wait().await?;

    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(
        report.outcome,
        BatchOutcome::PartiallySucceeded {
            completed: 3,
            failed: 2
        }
    );
    assert_eq!(report.uploaded.len(), 3);
    assert_eq!(feed.items().len(), 3);
    assert_eq!(data.list_media(room.room_id).await?.len(), 3);
    // 3 clean uploads plus 4 attempts for each exhausted item.
    assert_eq!(blobs.put_calls(), 3 + 4 + 4);
    assert!(blobs.deleted().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn all_failures_report_all_failed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_photos(dir.path(), 2).await;
    let blobs = Arc::new(FlakyBlobStore::new());
    let data = Arc::new(FlakyDataService::new());
    blobs.fail_put(photo_bytes(0), 10);
    blobs.fail_put(photo_bytes(1), 10);

    let report = coordinator(&blobs, &data)
        .submit_batch(files, UploadContext::new(RoomId::new(), "me"))
        .wait()
        .await?;

    assert_eq!(report.outcome, BatchOutcome::AllFailed);
    assert_eq!(report.completed + report.failed, report.total);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn persist_failure_retries_without_reuploading() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_photos(dir.path(), 1).await;
    let blobs = Arc::new(FlakyBlobStore::new());
    let data = Arc::new(FlakyDataService::new());
    data.fail_inserts(2);

    let report = coordinator(&blobs, &data)
        .submit_batch(files, UploadContext::new(RoomId::new(), "me"))
        .wait()
        .await?;

    assert_eq!(report.completed, 1);
    assert_eq!(blobs.put_calls(), 1);
    assert_eq!(blobs.inner.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn orphaned_blob_is_deleted_when_persist_never_succeeds() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_photos(dir.path(), 1).await;
    let blobs = Arc::new(FlakyBlobStore::new());
    let data = Arc::new(FlakyDataService::new());
    data.fail_inserts(4);

    let report = coordinator(&blobs, &data)
        .submit_batch(files, UploadContext::new(RoomId::new(), "me"))
        .wait()
        .await?;

    assert_eq!(report.failed, 1);
    assert_eq!(blobs.deleted().len(), 1);
    assert!(blobs.inner.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn successful_uploads_seed_the_local_cache() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let files = write_photos(dir.path(), 2).await;
    let blobs = Arc::new(FlakyBlobStore::new());
    let data = Arc::new(FlakyDataService::new());
    let cache = Arc::new(
        LocalCacheStore::open(
            dir.path().join("cache"),
            Duration::from_secs(3600),
            Arc::new(InMemoryKeyValueStore::new()),
        )
        .await?,
    );

    let report = coordinator(&blobs, &data)
        .with_cache(cache.clone())
        .submit_batch(files, UploadContext::new(RoomId::new(), "me"))
        .wait()
        .await?;

    for item in &report.uploaded {
        let entry = cache.lookup(&item.remote_url).await.expect("cached preview");
        assert!(entry.local_path.exists());
    }
    assert_eq!(blobs.get_calls(), 0);
    Ok(())
}
