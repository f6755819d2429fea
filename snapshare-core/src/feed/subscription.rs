//! Live change-feed subscription with bounded reconnects.
//!
//! `Disconnected -> Subscribing -> Subscribed`; an error or a closed stream
//! goes through `Error` back to `Subscribing` after an exponential backoff,
//! at most `max_retries` times in a row. A timeout ends in `Disconnected`
//! without reconnecting.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use snapshare_model::RoomMediaEvent;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SubscriptionConfig;
use crate::ports::{ChangeFeedStream, ChannelKey, DataService, FeedSignal, SubscriptionHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Subscribing,
    Subscribed,
    Error,
    TimedOut,
}

/// Receiver of change-feed events. `on_event` is called inline, in delivery
/// order.
#[async_trait]
pub trait FeedEventSink: Send + Sync {
    fn on_event(&self, event: RoomMediaEvent);

    /// Called after a reconnect succeeds, before further events.
    async fn on_resubscribed(&self) {}
}

enum StreamEnd {
    Cancelled,
    TimedOut,
    Failed(String),
}

struct ManagerInner {
    data: Arc<dyn DataService>,
    channel: ChannelKey,
    config: SubscriptionConfig,
    state: watch::Sender<SubscriptionState>,
    attempts: AtomicU32,
    current: Mutex<Option<SubscriptionHandle>>,
    task: Mutex<Option<RunningTask>>,
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
    /// Closes when the task ends.
    done: watch::Receiver<()>,
}

/// Owns the single subscription for one (room, user) channel.
#[derive(Clone)]
pub struct ChangeFeedManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ChangeFeedManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeedManager")
            .field("channel", &self.inner.channel)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

impl ChangeFeedManager {
    pub fn new(
        data: Arc<dyn DataService>,
        channel: ChannelKey,
        config: SubscriptionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                data,
                channel,
                config,
                state,
                attempts: AtomicU32::new(0),
                current: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn channel(&self) -> &ChannelKey {
        &self.inner.channel
    }

    pub fn state(&self) -> SubscriptionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.inner.state.subscribe()
    }

    /// Total `subscribe` calls made so far.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Open the subscription. A no-op while one is already running.
    pub fn start(&self, sink: Arc<dyn FeedEventSink>) {
        let Ok(mut slot) = self.inner.task.lock() else {
            tracing::error!(target: "feed::subscription", "subscription task slot poisoned");
            return;
        };
        if let Some(running) = slot.as_ref()
            && !running.token.is_cancelled()
            && !running.handle.is_finished()
        {
            tracing::debug!(target: "feed::subscription", channel = %self.inner.channel, "already running");
            return;
        }

        let token = CancellationToken::new();
        let (done_tx, done) = watch::channel(());
        let inner = Arc::clone(&self.inner);
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            run(inner, sink, run_token).await;
            drop(done_tx);
        });
        *slot = Some(RunningTask {
            token,
            handle,
            done,
        });
    }

    /// Tear the subscription down. Safe to call repeatedly or before
    /// `start`.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.inner.task.lock()
            && let Some(running) = slot.take()
        {
            running.token.cancel();
            running.handle.abort();
        }
        self.inner.close_current();
        self.inner.set_state(SubscriptionState::Disconnected);
        tracing::debug!(target: "feed::subscription", channel = %self.inner.channel, "subscription stopped");
    }

    /// Wait for the background task to end on its own (retry exhaustion,
    /// timeout or `stop`).
    pub async fn finished(&self) {
        let done = match self.inner.task.lock() {
            Ok(slot) => slot.as_ref().map(|running| running.done.clone()),
            Err(_) => None,
        };
        if let Some(mut done) = done {
            while done.changed().await.is_ok() {}
        }
    }
}

impl ManagerInner {
    fn set_state(&self, next: SubscriptionState) {
        self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    fn replace_current(&self, handle: Option<SubscriptionHandle>) {
        if let Ok(mut current) = self.current.lock()
            && let Some(previous) = std::mem::replace(&mut *current, handle)
        {
            previous.close();
        }
    }

    fn close_current(&self) {
        self.replace_current(None);
    }

    /// Count a failure; returns `false` once the retry budget is spent.
    fn record_failure(&self, failures: &mut u32, reason: &str) -> bool {
        *failures += 1;
        self.set_state(SubscriptionState::Error);
        if *failures > self.config.max_retries {
            tracing::warn!(
                target: "feed::subscription",
                channel = %self.channel,
                failures = *failures,
                error = reason,
                "giving up on change feed, manual refresh required"
            );
            self.set_state(SubscriptionState::Disconnected);
            return false;
        }
        tracing::warn!(
            target: "feed::subscription",
            channel = %self.channel,
            attempt = *failures,
            error = reason,
            "change feed failed, will retry"
        );
        true
    }
}

async fn run(inner: Arc<ManagerInner>, sink: Arc<dyn FeedEventSink>, token: CancellationToken) {
    let mut failures = 0u32;
    let mut connected_before = false;

    loop {
        if failures > 0 {
            let delay = inner.config.backoff_for(failures);
            tracing::info!(
                target: "feed::subscription",
                channel = %inner.channel,
                delay_ms = delay.as_millis() as u64,
                "reconnecting change feed"
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        inner.set_state(SubscriptionState::Subscribing);
        inner.attempts.fetch_add(1, Ordering::SeqCst);

        let subscribed = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = inner.data.subscribe(&inner.channel) => result,
        };
        let subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                if inner.record_failure(&mut failures, &e.to_string()) {
                    continue;
                }
                return;
            }
        };

        inner.replace_current(Some(subscription.handle));
        let end = pump(
            &inner,
            subscription.signals,
            sink.as_ref(),
            &token,
            &mut failures,
            &mut connected_before,
        )
        .await;
        inner.close_current();

        match end {
            StreamEnd::Cancelled => break,
            StreamEnd::TimedOut => {
                tracing::warn!(target: "feed::subscription", channel = %inner.channel, "change feed timed out, not reconnecting");
                inner.set_state(SubscriptionState::TimedOut);
                inner.set_state(SubscriptionState::Disconnected);
                return;
            }
            StreamEnd::Failed(reason) => {
                if !inner.record_failure(&mut failures, &reason) {
                    return;
                }
            }
        }
    }

    inner.set_state(SubscriptionState::Disconnected);
}

async fn pump(
    inner: &ManagerInner,
    mut signals: ChangeFeedStream,
    sink: &dyn FeedEventSink,
    token: &CancellationToken,
    failures: &mut u32,
    connected_before: &mut bool,
) -> StreamEnd {
    loop {
        let signal = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamEnd::Cancelled,
            signal = signals.next() => signal,
        };
        match signal {
            Some(FeedSignal::Subscribed) => {
                *failures = 0;
                inner.set_state(SubscriptionState::Subscribed);
                tracing::info!(target: "feed::subscription", channel = %inner.channel, "change feed subscribed");
                if *connected_before {
                    sink.on_resubscribed().await;
                }
                *connected_before = true;
            }
            Some(FeedSignal::Event(event)) => sink.on_event(event),
            Some(FeedSignal::Error(reason)) => return StreamEnd::Failed(reason),
            Some(FeedSignal::TimedOut) => return StreamEnd::TimedOut,
            Some(FeedSignal::Closed) | None => {
                if token.is_cancelled() {
                    return StreamEnd::Cancelled;
                }
                return StreamEnd::Failed("change feed closed".into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TransferError};
    use crate::ports::ChangeFeedSubscription;
    use futures::stream;
    use snapshare_model::{MediaId, MediaItem, NewMediaItem, RoomId};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Data service whose `subscribe` replays a script of signal lists.
    struct ScriptedFeed {
        scripts: Mutex<VecDeque<Vec<FeedSignal>>>,
        hang_after: bool,
    }

    impl ScriptedFeed {
        fn new(scripts: Vec<Vec<FeedSignal>>, hang_after: bool) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                hang_after,
            }
        }
    }

    #[async_trait]
    impl DataService for ScriptedFeed {
        async fn list_media(&self, _room_id: RoomId) -> Result<Vec<MediaItem>> {
            Ok(Vec::new())
        }

        async fn insert_media(&self, _item: NewMediaItem) -> Result<MediaItem> {
            Err(TransferError::Service("read only".into()))
        }

        async fn delete_media(&self, _id: MediaId, _actor: &str) -> Result<bool> {
            Ok(false)
        }

        async fn delete_media_many(&self, _ids: &[MediaId], _actor: &str) -> Result<bool> {
            Ok(false)
        }

        async fn subscribe(&self, _channel: &ChannelKey) -> Result<ChangeFeedSubscription> {
            let script = self.scripts.lock().unwrap().pop_front();
            let Some(script) = script else {
                return Err(TransferError::Network("no script left".into()));
            };
            let handle = SubscriptionHandle::new();
            let signals = if self.hang_after {
                stream::iter(script).chain(stream::pending()).boxed()
            } else {
                stream::iter(script).boxed()
            };
            Ok(ChangeFeedSubscription { signals, handle })
        }
    }

    #[derive(Default)]
    struct CountingSink {
        events: AtomicUsize,
        resubscribed: AtomicUsize,
    }

    #[async_trait]
    impl FeedEventSink for CountingSink {
        fn on_event(&self, _event: RoomMediaEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_resubscribed(&self) {
            self.resubscribed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(feed: ScriptedFeed) -> ChangeFeedManager {
        ChangeFeedManager::new(
            Arc::new(feed),
            ChannelKey::new(RoomId::new(), "me"),
            SubscriptionConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn four_consecutive_errors_exhaust_three_retries() {
        let errors = (0..4)
            .map(|i| vec![FeedSignal::Error(format!("boom {i}"))])
            .collect();
        let manager = manager(ScriptedFeed::new(errors, false));
        manager.start(Arc::new(CountingSink::default()));
        manager.finished().await;

        assert_eq!(manager.state(), SubscriptionState::Disconnected);
        assert_eq!(manager.attempts(), 4);

        // No further reconnects happen on their own.
        tokio::time::sleep(std::time::Duration::from_secs(600)).await;
        assert_eq!(manager.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_does_not_reconnect() {
        let manager = manager(ScriptedFeed::new(
            vec![vec![FeedSignal::Subscribed, FeedSignal::TimedOut]],
            false,
        ));
        manager.start(Arc::new(CountingSink::default()));
        manager.finished().await;

        assert_eq!(manager.state(), SubscriptionState::Disconnected);
        assert_eq!(manager.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resets_failures_and_notifies_sink() {
        let room = RoomId::new();
        let item = NewMediaItem::new(room, "mem://blobs/a.jpg", "ana")
            .persisted(MediaId::generate(), chrono::Utc::now());
        let manager = manager(ScriptedFeed::new(
            vec![
                vec![FeedSignal::Subscribed, FeedSignal::Error("drop".into())],
                vec![
                    FeedSignal::Subscribed,
                    FeedSignal::Event(RoomMediaEvent::Inserted { item }),
                ],
            ],
            true,
        ));
        let sink = Arc::new(CountingSink::default());
        manager.start(sink.clone());

        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while sink.events.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(manager.state(), SubscriptionState::Subscribed);
        assert_eq!(manager.attempts(), 2);
        assert_eq!(sink.resubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(sink.events.load(Ordering::SeqCst), 1);

        manager.stop();
        manager.stop();
        assert_eq!(manager.state(), SubscriptionState::Disconnected);
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let manager = manager(ScriptedFeed::new(Vec::new(), false));
        manager.stop();
        assert_eq!(manager.state(), SubscriptionState::Disconnected);
        assert_eq!(manager.attempts(), 0);
    }
}
