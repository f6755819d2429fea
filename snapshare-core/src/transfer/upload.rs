//! Batch upload coordinator.
//!
//! Files are uploaded `batch_size` at a time from a FIFO queue. A failed job
//! goes back to the end of the queue until its retry budget is spent; no
//! job's failure ever aborts its siblings. Progress is reported through a
//! `watch` channel of [`BatchSnapshot`]s driven by an independent ticker.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use snapshare_model::{LocalFile, MediaItem, NewMediaItem, RoomId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::{ProgressConfig, UploadConfig};
use crate::error::{Result, TransferError};
use crate::feed::RoomMediaFeed;
use crate::local_cache::LocalCacheStore;
use crate::ports::DataService;
use crate::transfer::client::BlobTransferClient;
use crate::transfer::job::{BatchId, JobTransition, RetryPolicy, TransferJob};
use crate::transfer::progress::{
    BatchOutcome, BatchPhase, BatchSnapshot, ProgressSmoother,
};

/// Where uploaded items go and who they are attributed to.
#[derive(Clone, Debug)]
pub struct UploadContext {
    pub room_id: RoomId,
    pub uploader: String,
    /// Feed that receives each persisted item as soon as it exists.
    pub feed: Option<RoomMediaFeed>,
}

impl UploadContext {
    pub fn new(room_id: RoomId, uploader: impl Into<String>) -> Self {
        Self {
            room_id,
            uploader: uploader.into(),
            feed: None,
        }
    }

    pub fn with_feed(mut self, feed: RoomMediaFeed) -> Self {
        self.feed = Some(feed);
        self
    }
}

/// Final accounting for a retired batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub outcome: BatchOutcome,
    /// Persisted records, in completion order.
    pub uploaded: Vec<MediaItem>,
}

/// Caller's view of a running batch.
#[derive(Debug)]
pub struct BatchHandle {
    id: BatchId,
    progress: watch::Receiver<BatchSnapshot>,
    task: JoinHandle<BatchReport>,
}

impl BatchHandle {
    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        self.progress.borrow().clone()
    }

    pub fn progress(&self) -> watch::Receiver<BatchSnapshot> {
        self.progress.clone()
    }

    /// Wait until the batch has been retired.
    pub async fn wait(self) -> Result<BatchReport> {
        self.task
            .await
            .map_err(|e| TransferError::Internal(format!("upload batch task failed: {e}")))
    }
}

#[derive(Clone)]
pub struct UploadCoordinator {
    client: BlobTransferClient,
    data: Arc<dyn DataService>,
    cache: Option<Arc<LocalCacheStore>>,
    config: UploadConfig,
}

impl fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadCoordinator")
            .field("client", &self.client)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl UploadCoordinator {
    pub fn new(
        client: BlobTransferClient,
        data: Arc<dyn DataService>,
        config: UploadConfig,
    ) -> Self {
        Self {
            client,
            data,
            cache: None,
            config,
        }
    }

    /// Record each successful upload in `cache` so previews never
    /// re-download it.
    pub fn with_cache(mut self, cache: Arc<LocalCacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Start uploading `files` in the background and return immediately.
    pub fn submit_batch(&self, files: Vec<LocalFile>, ctx: UploadContext) -> BatchHandle {
        let id = BatchId::new();
        let (tx, progress) = watch::channel(BatchSnapshot::new(id, files.len()));
        let coordinator = self.clone();
        let task = tokio::spawn(async move {
            coordinator.run_batch(id, files, ctx, Arc::new(tx)).await
        });
        BatchHandle { id, progress, task }
    }

    async fn run_batch(
        self,
        id: BatchId,
        files: Vec<LocalFile>,
        ctx: UploadContext,
        tx: Arc<watch::Sender<BatchSnapshot>>,
    ) -> BatchReport {
        let total = files.len();
        let policy = RetryPolicy::from(self.config.retry);
        let batch_size = self.config.batch_size.max(1);
        let mut queue: VecDeque<TransferJob<LocalFile>> = files
            .into_iter()
            .map(|file| TransferJob::new(file, id))
            .collect();
        let mut uploaded = Vec::with_capacity(total);

        tracing::info!(
            target: "transfer::upload",
            batch_id = %id,
            room_id = %ctx.room_id,
            total,
            "upload batch started"
        );
        let ticker = tokio::spawn(tick_progress(Arc::clone(&tx), self.config.progress));

        while !queue.is_empty() {
            let take = batch_size.min(queue.len());
            let round: Vec<_> = queue.drain(..take).collect();
            let settled = join_all(
                round
                    .into_iter()
                    .map(|job| self.run_job(job, &ctx, &policy)),
            )
            .await;

            for (mut job, result) in settled {
                match result {
                    Ok(item) => {
                        tx.send_modify(|s| s.completed += 1);
                        uploaded.push(item);
                    }
                    Err(e) => match job.fail(&e, &policy) {
                        JobTransition::Requeue => {
                            tracing::warn!(
                                target: "transfer::upload",
                                batch_id = %id,
                                file = %job.source().path().display(),
                                attempt = job.attempt_count(),
                                error = %e,
                                "upload failed, requeued"
                            );
                            queue.push_back(job);
                        }
                        JobTransition::Terminal => {
                            tracing::warn!(
                                target: "transfer::upload",
                                batch_id = %id,
                                file = %job.source().path().display(),
                                attempts = job.attempt_count() + 1,
                                error = %e,
                                "upload failed permanently"
                            );
                            self.discard_orphan(&job).await;
                            tx.send_modify(|s| s.failed += 1);
                        }
                    },
                }
            }

            if !queue.is_empty() {
                tokio::time::sleep(self.config.inter_batch_delay()).await;
            }
        }

        ticker.abort();
        let (completed, failed) = {
            let snapshot = tx.borrow();
            (snapshot.completed, snapshot.failed)
        };
        let outcome = BatchOutcome::from_counts(completed, failed);
        tx.send_modify(|s| {
            s.reported_progress = 1.0;
            s.phase = BatchPhase::Completed(outcome);
        });
        tracing::info!(
            target: "transfer::upload",
            batch_id = %id,
            completed,
            failed,
            ?outcome,
            "upload batch finished"
        );

        tokio::time::sleep(self.config.progress.completion_linger()).await;
        tx.send_modify(|s| s.phase = BatchPhase::Retired(outcome));

        BatchReport {
            batch_id: id,
            total,
            completed,
            failed,
            outcome,
            uploaded,
        }
    }

    async fn run_job(
        &self,
        mut job: TransferJob<LocalFile>,
        ctx: &UploadContext,
        policy: &RetryPolicy,
    ) -> (TransferJob<LocalFile>, Result<MediaItem>) {
        let delay = policy.delay_before(job.attempt_count());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        job.start();
        let result = self.attempt(&mut job, ctx).await;
        if let Ok(item) = &result {
            job.succeed();
            self.publish(item, job.source(), ctx).await;
        }
        (job, result)
    }

    /// Upload the bytes unless an earlier attempt already did, then persist
    /// the record.
    async fn attempt(
        &self,
        job: &mut TransferJob<LocalFile>,
        ctx: &UploadContext,
    ) -> Result<MediaItem> {
        let url = match job.uploaded_url() {
            Some(url) => url.to_string(),
            None => {
                let destination = destination_for(ctx.room_id, job.source());
                let url = self
                    .client
                    .upload(job.source(), &destination, self.config.quality)
                    .await?;
                job.set_uploaded_url(url.clone());
                url
            }
        };

        self.data
            .insert_media(NewMediaItem::new(ctx.room_id, url, ctx.uploader.clone()))
            .await
    }

    async fn publish(&self, item: &MediaItem, source: &LocalFile, ctx: &UploadContext) {
        if let Some(feed) = &ctx.feed
            && let Err(e) = feed.apply_local_insert(item.clone())
        {
            tracing::warn!(target: "transfer::upload", media_id = %item.id, error = %e, "feed insert failed");
        }
        if let Some(cache) = &self.cache
            && let Err(e) = cache.cache_local(&item.remote_url, source.path()).await
        {
            tracing::debug!(target: "transfer::upload", url = %item.remote_url, error = %e, "preview cache skipped");
        }
    }

    async fn discard_orphan(&self, job: &TransferJob<LocalFile>) {
        let Some(url) = job.uploaded_url() else {
            return;
        };
        match self.client.store().delete(url).await {
            Ok(_) => {
                tracing::debug!(target: "transfer::upload", url = %url, "deleted orphaned blob");
            }
            Err(e) => {
                tracing::warn!(target: "transfer::upload", url = %url, error = %e, "failed to delete orphaned blob");
            }
        }
    }
}

async fn tick_progress(tx: Arc<watch::Sender<BatchSnapshot>>, config: ProgressConfig) {
    let smoother = ProgressSmoother::new(&config);
    let mut interval = tokio::time::interval(config.tick().max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let mut running = true;
        tx.send_if_modified(|s| {
            running = s.is_running();
            if !running {
                return false;
            }
            let next = smoother.next(s.reported_progress);
            let changed = next > s.reported_progress;
            s.reported_progress = next;
            changed
        });
        if !running {
            break;
        }
    }
}

/// Remote path for an uploaded file: `rooms/<room>/<uuid>.<ext>`.
pub fn destination_for(room_id: RoomId, file: &LocalFile) -> String {
    let ext = file.extension().unwrap_or_else(|| "jpg".to_string());
    format!("rooms/{room_id}/{}.{ext}", Uuid::now_v7())
}
