//! Push delivery of timer progress to connected clients.
//!
//! Clients register a channel per connection; a periodic tick recomputes each
//! subscribed user's active timers and fans the result out to every channel
//! of that user. Pull requests go through the same snapshot code.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::domain::{SessionToken, TimerView, UserId};
use crate::services::timer_engine::{TimerEngine, TimerError, TimerFilter};

/// Server-to-client messages on a push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    AllTimers {
        #[serde(rename = "activeTimers")]
        active_timers: Vec<TimerView>,
        #[serde(rename = "oldTimers")]
        old_timers: Vec<TimerView>,
    },
    ActiveTimers {
        #[serde(rename = "activeTimers")]
        active_timers: Vec<TimerView>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Handle returned by [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub user_id: UserId,
    pub id: SubscriptionId,
}

/// A registered channel and the session that opened it.
struct Subscriber {
    session: SessionToken,
    sender: mpsc::Sender<SyncMessage>,
}

type Channels = HashMap<SubscriptionId, Subscriber>;

/// `user id -> channels`. A tick works on a copy taken under the read lock.
///
/// Dropping a registry entry drops its sender, which is how a connection
/// learns it was unsubscribed from outside.
#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: RwLock<HashMap<UserId, Channels>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(
        &self,
        user_id: UserId,
        session: SessionToken,
        sender: mpsc::Sender<SyncMessage>,
    ) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.channels.write().await;
        channels
            .entry(user_id)
            .or_default()
            .insert(id, Subscriber { session, sender });
        metrics::gauge!("sync_subscriptions").increment(1.0);
        debug!(user_id = user_id.value(), subscription = id.0, "Subscribed");
        Subscription { user_id, id }
    }

    /// Returns whether the subscription was still registered.
    pub async fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut channels = self.channels.write().await;

        let Some(user_channels) = channels.get_mut(&subscription.user_id) else {
            return false;
        };

        let removed = user_channels.remove(&subscription.id).is_some();
        if user_channels.is_empty() {
            channels.remove(&subscription.user_id);
        }

        if removed {
            metrics::gauge!("sync_subscriptions").decrement(1.0);
            debug!(
                user_id = subscription.user_id.value(),
                subscription = subscription.id.0,
                "Unsubscribed"
            );
        }
        removed
    }

    /// Removes every channel opened with `session`. Returns how many.
    pub async fn drop_session(&self, session: &SessionToken) -> usize {
        let mut channels = self.channels.write().await;
        let mut removed = 0;

        channels.retain(|_, user_channels| {
            let before = user_channels.len();
            user_channels.retain(|_, subscriber| subscriber.session != *session);
            removed += before - user_channels.len();
            !user_channels.is_empty()
        });

        if removed > 0 {
            metrics::gauge!("sync_subscriptions").decrement(removed as f64);
            debug!(session = %session.redacted(), removed, "Dropped session subscriptions");
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.channels.read().await.values().map(HashMap::len).sum()
    }

    pub async fn subscribed_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.channels.read().await.keys().copied().collect();
        users.sort_unstable();
        users
    }

    async fn snapshot(&self) -> Vec<(UserId, Vec<(SubscriptionId, mpsc::Sender<SyncMessage>)>)> {
        self.channels
            .read()
            .await
            .iter()
            .map(|(user_id, channels)| {
                let handles = channels
                    .iter()
                    .map(|(id, subscriber)| (*id, subscriber.sender.clone()))
                    .collect();
                (*user_id, handles)
            })
            .collect()
    }
}

/// Counters for a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub users: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub failed: usize,
    pub pruned: usize,
}

enum UserOutcome {
    Sent {
        delivered: usize,
        dropped: usize,
        closed: Vec<Subscription>,
    },
    Failed,
}

pub struct SyncService {
    engine: Arc<TimerEngine>,
    registry: SubscriptionRegistry,
    tick_interval: Duration,
    subscriber_timeout: Duration,
    channel_capacity: usize,
}

impl SyncService {
    #[must_use]
    pub fn new(engine: Arc<TimerEngine>, config: &SyncConfig) -> Self {
        Self {
            engine,
            registry: SubscriptionRegistry::new(),
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            subscriber_timeout: Duration::from_millis(config.subscriber_timeout_ms),
            channel_capacity: config.channel_capacity,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Creates a bounded outbound queue sized for one push channel.
    #[must_use]
    pub fn channel(&self) -> (mpsc::Sender<SyncMessage>, mpsc::Receiver<SyncMessage>) {
        mpsc::channel(self.channel_capacity)
    }

    pub async fn subscribe(
        &self,
        user_id: UserId,
        session: SessionToken,
        sender: mpsc::Sender<SyncMessage>,
    ) -> Subscription {
        self.registry.subscribe(user_id, session, sender).await
    }

    pub async fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.registry.unsubscribe(subscription).await
    }

    /// Ends push delivery for every channel opened with `session`.
    pub async fn drop_session(&self, session: &SessionToken) -> usize {
        self.registry.drop_session(session).await
    }

    /// One-shot pull of one half of a user's timers.
    pub async fn get_snapshot(
        &self,
        owner_id: UserId,
        filter: TimerFilter,
    ) -> Result<Vec<TimerView>, TimerError> {
        self.engine.snapshot(owner_id, filter, Utc::now()).await
    }

    /// The full `all_timers` reply sent on `init` and on request.
    pub async fn all_timers_message(&self, owner_id: UserId) -> Result<SyncMessage, TimerError> {
        let all = self.engine.all_timers(owner_id, Utc::now()).await?;
        Ok(SyncMessage::AllTimers {
            active_timers: all.active,
            old_timers: all.stopped,
        })
    }

    /// Runs one push cycle.
    ///
    /// Users are processed concurrently and independently: a failed or slow
    /// lookup for one user is logged and skipped without affecting others.
    pub async fn tick(&self) -> TickReport {
        let now = Utc::now();
        let subscribers = self.registry.snapshot().await;

        let outcomes = join_all(
            subscribers
                .into_iter()
                .map(|(user_id, channels)| self.push_to_user(user_id, channels, now)),
        )
        .await;

        let mut report = TickReport {
            users: outcomes.len(),
            ..TickReport::default()
        };

        for outcome in outcomes {
            match outcome {
                UserOutcome::Sent {
                    delivered,
                    dropped,
                    closed,
                } => {
                    report.delivered += delivered;
                    report.dropped += dropped;
                    for subscription in closed {
                        if self.registry.unsubscribe(subscription).await {
                            report.pruned += 1;
                        }
                    }
                }
                UserOutcome::Failed => report.failed += 1,
            }
        }

        metrics::counter!("sync_ticks_total").increment(1);
        if report.failed > 0 {
            metrics::counter!("sync_subscriber_failures_total").increment(report.failed as u64);
        }
        if report.dropped > 0 {
            metrics::counter!("sync_messages_dropped_total").increment(report.dropped as u64);
        }

        report
    }

    async fn push_to_user(
        &self,
        user_id: UserId,
        channels: Vec<(SubscriptionId, mpsc::Sender<SyncMessage>)>,
        now: DateTime<Utc>,
    ) -> UserOutcome {
        let lookup = tokio::time::timeout(
            self.subscriber_timeout,
            self.engine.snapshot(user_id, TimerFilter::Active, now),
        )
        .await;

        let active_timers = match lookup {
            Ok(Ok(timers)) => timers,
            Ok(Err(e)) => {
                warn!(user_id = user_id.value(), error = %e, "Tick lookup failed");
                return UserOutcome::Failed;
            }
            Err(_) => {
                warn!(
                    user_id = user_id.value(),
                    timeout_ms = self.subscriber_timeout.as_millis() as u64,
                    "Tick lookup timed out"
                );
                return UserOutcome::Failed;
            }
        };

        let message = SyncMessage::ActiveTimers { active_timers };
        let mut delivered = 0;
        let mut dropped = 0;
        let mut closed = Vec::new();

        for (id, tx) in channels {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(user_id = user_id.value(), subscription = id.0, "Channel full, tick dropped");
                    dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(Subscription { user_id, id });
                }
            }
        }

        UserOutcome::Sent {
            delivered,
            dropped,
            closed,
        }
    }

    /// Spawns the periodic push loop. Abort the handle to stop it.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            "Sync push loop started"
        );

        loop {
            interval.tick().await;
            let report = self.tick().await;
            if report.users > 0 {
                debug!(?report, "Sync tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::domain::{Timer, TimerId, TimerState};
    use crate::repository::{RepositoryError, RepositoryResult, TimerRepository};
    use async_trait::async_trait;

    const ALICE: UserId = UserId::new(1);
    const BOB: UserId = UserId::new(2);

    fn token(value: &str) -> SessionToken {
        SessionToken::new(value)
    }

    fn sync_config() -> SyncConfig {
        SyncConfig {
            tick_interval_ms: 50,
            subscriber_timeout_ms: 100,
            channel_capacity: 4,
        }
    }

    fn service_with(repo: Arc<dyn TimerRepository>) -> (Arc<TimerEngine>, SyncService) {
        let engine = Arc::new(TimerEngine::new(repo));
        let sync = SyncService::new(engine.clone(), &sync_config());
        (engine, sync)
    }

    enum Fault {
        Fail,
        Stall(Duration),
    }

    /// Breaks every lookup for one owner, delegates everything else.
    struct FlakyRepo {
        inner: MemoryStore,
        broken_owner: UserId,
        fault: Fault,
    }

    #[async_trait]
    impl TimerRepository for FlakyRepo {
        async fn insert_timer(
            &self,
            owner_id: UserId,
            description: &str,
            started_at: DateTime<Utc>,
        ) -> RepositoryResult<Timer> {
            self.inner.insert_timer(owner_id, description, started_at).await
        }

        async fn find_timer(&self, id: TimerId) -> RepositoryResult<Option<Timer>> {
            self.inner.find_timer(id).await
        }

        async fn list_timers(
            &self,
            owner_id: UserId,
            state: TimerState,
        ) -> RepositoryResult<Vec<Timer>> {
            if owner_id == self.broken_owner {
                match self.fault {
                    Fault::Fail => {
                        return Err(RepositoryError::Unavailable("disk on fire".to_string()));
                    }
                    Fault::Stall(delay) => tokio::time::sleep(delay).await,
                }
            }
            self.inner.list_timers(owner_id, state).await
        }

        async fn stop_if_active(
            &self,
            id: TimerId,
            stopped_at: DateTime<Utc>,
        ) -> RepositoryResult<Option<Timer>> {
            self.inner.stop_if_active(id, stopped_at).await
        }
    }

    #[tokio::test]
    async fn all_channels_of_a_user_get_identical_payloads() {
        let (engine, sync) = service_with(Arc::new(MemoryStore::new()));
        engine.start(ALICE, "write report").await.unwrap();

        let (tx1, mut rx1) = sync.channel();
        let (tx2, mut rx2) = sync.channel();
        sync.subscribe(ALICE, token("a1"), tx1).await;
        sync.subscribe(ALICE, token("a2"), tx2).await;

        let report = sync.tick().await;
        assert_eq!(report.users, 1);
        assert_eq!(report.delivered, 2);

        let first = rx1.recv().await.unwrap();
        let second = rx2.recv().await.unwrap();
        assert_eq!(first, second);
        match first {
            SyncMessage::ActiveTimers { active_timers } => {
                assert_eq!(active_timers.len(), 1);
                assert_eq!(active_timers[0].description, "write report");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn users_only_see_their_own_timers() {
        let (engine, sync) = service_with(Arc::new(MemoryStore::new()));
        engine.start(ALICE, "alice task").await.unwrap();

        let (tx, mut rx) = sync.channel();
        sync.subscribe(BOB, token("b1"), tx).await;
        sync.tick().await;

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncMessage::ActiveTimers {
                active_timers: vec![]
            }
        );
    }

    #[tokio::test]
    async fn one_failing_user_does_not_block_others() {
        let repo = Arc::new(FlakyRepo {
            inner: MemoryStore::new(),
            broken_owner: BOB,
            fault: Fault::Fail,
        });
        let (engine, sync) = service_with(repo);
        engine.start(ALICE, "still works").await.unwrap();

        let (alice_tx, mut alice_rx) = sync.channel();
        let (bob_tx, mut bob_rx) = sync.channel();
        sync.subscribe(ALICE, token("a1"), alice_tx).await;
        sync.subscribe(BOB, token("b1"), bob_tx).await;

        let report = sync.tick().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);

        assert!(matches!(
            alice_rx.recv().await.unwrap(),
            SyncMessage::ActiveTimers { .. }
        ));
        assert!(bob_rx.try_recv().is_err());

        // A failure does not unsubscribe anyone.
        assert_eq!(sync.registry().subscriber_count().await, 2);
    }

    #[tokio::test]
    async fn slow_user_is_cut_off_at_the_timeout() {
        let repo = Arc::new(FlakyRepo {
            inner: MemoryStore::new(),
            broken_owner: BOB,
            fault: Fault::Stall(Duration::from_secs(5)),
        });
        let (engine, sync) = service_with(repo);
        engine.start(ALICE, "not stuck").await.unwrap();

        let (alice_tx, mut alice_rx) = sync.channel();
        let (bob_tx, mut bob_rx) = sync.channel();
        sync.subscribe(ALICE, token("a1"), alice_tx).await;
        sync.subscribe(BOB, token("b1"), bob_tx).await;

        let started = std::time::Instant::now();
        let report = sync.tick().await;
        let elapsed = started.elapsed();

        // subscriber_timeout_ms is 100
        assert!(elapsed < Duration::from_secs(1), "tick took {elapsed:?}");
        assert_eq!(report.users, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);

        match alice_rx.try_recv().unwrap() {
            SyncMessage::ActiveTimers { active_timers } => {
                assert_eq!(active_timers[0].description, "not stuck");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(sync.registry().subscriber_count().await, 2);
    }

    #[tokio::test]
    async fn dropping_a_session_closes_only_its_channels() {
        let (_, sync) = service_with(Arc::new(MemoryStore::new()));
        let (laptop_tx, mut laptop_rx) = sync.channel();
        let (phone_tx, mut phone_rx) = sync.channel();
        let (bob_tx, _bob_rx) = sync.channel();
        sync.subscribe(ALICE, token("laptop"), laptop_tx).await;
        sync.subscribe(ALICE, token("phone"), phone_tx).await;
        sync.subscribe(BOB, token("bob"), bob_tx).await;

        assert_eq!(sync.drop_session(&token("laptop")).await, 1);
        assert_eq!(sync.drop_session(&token("laptop")).await, 0);
        assert_eq!(sync.registry().subscriber_count().await, 2);

        // The registry held the only sender, so the receiver sees the end.
        assert!(laptop_rx.recv().await.is_none());

        let report = sync.tick().await;
        assert_eq!(report.delivered, 2);
        assert!(phone_rx.recv().await.is_some());

        sync.drop_session(&token("phone")).await;
        assert_eq!(sync.registry().subscribed_users().await, vec![BOB]);
    }

    #[tokio::test]
    async fn closed_channels_are_pruned() {
        let (_, sync) = service_with(Arc::new(MemoryStore::new()));
        let (tx, rx) = sync.channel();
        sync.subscribe(ALICE, token("a1"), tx).await;
        drop(rx);

        let report = sync.tick().await;
        assert_eq!(report.pruned, 1);
        assert_eq!(sync.registry().subscriber_count().await, 0);
        assert!(sync.registry().subscribed_users().await.is_empty());
    }

    #[tokio::test]
    async fn full_channel_drops_the_tick_but_stays_subscribed() {
        let (_, sync) = service_with(Arc::new(MemoryStore::new()));
        let (tx, mut rx) = mpsc::channel(1);
        sync.subscribe(ALICE, token("a1"), tx).await;

        assert_eq!(sync.tick().await.delivered, 1);
        let report = sync.tick().await;
        assert_eq!(report.dropped, 1);
        assert_eq!(sync.registry().subscriber_count().await, 1);

        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_channel() {
        let (_, sync) = service_with(Arc::new(MemoryStore::new()));
        let (tx1, _rx1) = sync.channel();
        let (tx2, _rx2) = sync.channel();
        let first = sync.subscribe(ALICE, token("a1"), tx1).await;
        sync.subscribe(ALICE, token("a2"), tx2).await;

        assert!(sync.unsubscribe(first).await);
        assert!(!sync.unsubscribe(first).await);
        assert_eq!(sync.registry().subscriber_count().await, 1);
        assert_eq!(sync.registry().subscribed_users().await, vec![ALICE]);
    }

    #[tokio::test]
    async fn all_timers_message_splits_active_and_stopped() {
        let (engine, sync) = service_with(Arc::new(MemoryStore::new()));
        let done = engine.start(ALICE, "done").await.unwrap();
        engine.start(ALICE, "running").await.unwrap();
        engine.stop(ALICE, done.id).await.unwrap();

        match sync.all_timers_message(ALICE).await.unwrap() {
            SyncMessage::AllTimers {
                active_timers,
                old_timers,
            } => {
                assert_eq!(active_timers.len(), 1);
                assert!(active_timers[0].progress.is_some());
                assert_eq!(old_timers.len(), 1);
                assert!(old_timers[0].duration.is_some());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn messages_use_the_wire_field_names() {
        let json = serde_json::to_value(SyncMessage::ActiveTimers {
            active_timers: vec![],
        })
        .unwrap();
        assert_eq!(json["type"], "active_timers");
        assert!(json["activeTimers"].is_array());

        let json = serde_json::to_value(SyncMessage::AllTimers {
            active_timers: vec![],
            old_timers: vec![],
        })
        .unwrap();
        assert_eq!(json["type"], "all_timers");
        assert!(json["oldTimers"].is_array());
    }

    #[tokio::test]
    async fn spawned_loop_pushes_periodically() {
        let (engine, sync) = service_with(Arc::new(MemoryStore::new()));
        engine.start(ALICE, "loop").await.unwrap();
        let sync = Arc::new(sync);

        let (tx, mut rx) = sync.channel();
        sync.subscribe(ALICE, token("a1"), tx).await;
        let handle = sync.clone().spawn();

        for _ in 0..2 {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("tick within timeout")
                .expect("channel open");
            assert!(matches!(msg, SyncMessage::ActiveTimers { .. }));
        }

        handle.abort();
    }
}
