//! Core orchestrator for one vehicle kind: owns the feed connection
//! lifecycle, the active vehicle map and the periodic flush and stale-sweep
//! loops, and publishes the reconciled vehicle list.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::models::{RouteSelection, VehicleKey, VehicleKind, VehiclePosition};
use crate::providers::feed::{FeedError, FeedMessage, VehicleFeed};
use crate::providers::retry::RetryPolicy;
use crate::services::buffer::UpdateBuffer;
use crate::services::decoder;
use crate::services::favorites::FavoritesStore;
use crate::services::subscriptions::{SubscriptionChange, SubscriptionReconciler};

/// Connection state surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts are exhausted; a new `connect` call starts over
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Background task handles. Loop tasks exit through their token; one-shot
/// tasks (reconnect, subscription) are aborted when superseded.
struct Tasks {
    loop_token: CancellationToken,
    read_token: CancellationToken,
    flush: Option<JoinHandle<()>>,
    sweep: Option<JoinHandle<()>>,
    read: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    subscribe: Option<JoinHandle<()>>,
}

impl Tasks {
    fn new() -> Self {
        Self {
            loop_token: CancellationToken::new(),
            read_token: CancellationToken::new(),
            flush: None,
            sweep: None,
            read: None,
            reconnect: None,
            subscribe: None,
        }
    }
}

struct ManagerInner {
    kind: VehicleKind,
    config: TrackerConfig,
    feed: Arc<dyn VehicleFeed>,
    favorites_store: Arc<dyn FavoritesStore>,
    reconnect_policy: RetryPolicy,

    connection: RwLock<ConnectionState>,
    connect_attempts: AtomicU32,
    selection: RwLock<Vec<RouteSelection>>,
    vehicles: RwLock<HashMap<VehicleKey, VehiclePosition>>,
    favorites: RwLock<Vec<String>>,
    buffer: UpdateBuffer,
    reconciler: Mutex<SubscriptionReconciler>,
    tasks: Mutex<Tasks>,

    vehicles_tx: watch::Sender<Arc<Vec<VehiclePosition>>>,
    status_tx: watch::Sender<FeedStatus>,
    removals_tx: broadcast::Sender<(VehicleKey, u64)>,
}

/// Live-vehicle tracking manager for a single vehicle kind.
///
/// Cheap to clone; all clones share the same state. All mutable state is
/// owned by this one instance and mutated only through its methods; the
/// [`UpdateBuffer`] is the only structure shared with the feed read loop for
/// concurrent writes.
#[derive(Clone)]
pub struct VehicleManager {
    inner: Arc<ManagerInner>,
}

impl VehicleManager {
    pub fn new(
        kind: VehicleKind,
        config: TrackerConfig,
        feed: Arc<dyn VehicleFeed>,
        favorites_store: Arc<dyn FavoritesStore>,
    ) -> Self {
        let (vehicles_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (status_tx, _) = watch::channel(FeedStatus::Disconnected);
        // Removal events are advisory; capacity 64 is plenty for one display
        let (removals_tx, _) = broadcast::channel(64);

        let reconnect_policy = RetryPolicy::new(
            config.max_connect_attempts,
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_secs(config.reconnect_max_delay_secs),
        );
        let favorites = favorites_store.load(kind);

        Self {
            inner: Arc::new(ManagerInner {
                kind,
                config,
                feed,
                favorites_store,
                reconnect_policy,
                connection: RwLock::new(ConnectionState::Disconnected),
                connect_attempts: AtomicU32::new(0),
                selection: RwLock::new(Vec::new()),
                vehicles: RwLock::new(HashMap::new()),
                favorites: RwLock::new(favorites),
                buffer: UpdateBuffer::new(),
                reconciler: Mutex::new(SubscriptionReconciler::new()),
                tasks: Mutex::new(Tasks::new()),
                vehicles_tx,
                status_tx,
                removals_tx,
            }),
        }
    }

    pub fn kind(&self) -> VehicleKind {
        self.inner.kind
    }

    /// Latest reconciled vehicle list, sorted by id.
    pub fn vehicle_list(&self) -> watch::Receiver<Arc<Vec<VehiclePosition>>> {
        self.inner.vehicles_tx.subscribe()
    }

    /// Connection and error state for the UI.
    pub fn status(&self) -> watch::Receiver<FeedStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Stream of pruned vehicles with their removal generation. The display
    /// layer calls [`VehicleManager::acknowledge_removal`] with the same
    /// generation once its exit animation finished.
    pub fn removals(&self) -> broadcast::Receiver<(VehicleKey, u64)> {
        self.inner.removals_tx.subscribe()
    }

    /// Complete a removal handshake. Returns `false` when the intent was
    /// superseded (e.g. the vehicle reappeared), in which case the caller
    /// must keep its annotation.
    pub fn acknowledge_removal(&self, key: VehicleKey, generation: u64) -> bool {
        self.inner.buffer.confirm_removal(&key, generation)
    }

    // --- connection lifecycle ---

    /// Start connecting to the feed. Resets the attempt counter, so an
    /// explicit call always re-enters recovery even after a `Failed` status.
    pub fn connect(&self) {
        self.inner.connect_attempts.store(0, Ordering::Relaxed);
        let manager = self.clone();
        tokio::spawn(async move { manager.start_connect().await });
    }

    async fn start_connect(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.connection.write().await;
            if *state != ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Connecting;
        }
        inner.status_tx.send_replace(FeedStatus::Connecting);

        match inner.feed.connect().await {
            Ok(messages) => {
                *inner.connection.write().await = ConnectionState::Connected;
                inner.connect_attempts.store(0, Ordering::Relaxed);
                inner.status_tx.send_replace(FeedStatus::Connected);
                self.spawn_read_loop(messages).await;

                // A fresh session starts with no broker-side subscriptions;
                // invalidate the old active set and re-issue the selection.
                inner.reconciler.lock().await.reset();
                let selections = inner.selection.read().await.clone();
                if !selections.is_empty() {
                    self.spawn_reconciliation(&selections).await;
                }
            }
            Err(e) => {
                warn!(kind = ?inner.kind, error = %e, "Feed connect failed");
                *inner.connection.write().await = ConnectionState::Disconnected;
                self.schedule_reconnect(e.to_string()).await;
            }
        }
    }

    /// Tear everything down to a clean slate: loops, feed connection,
    /// buffered updates, subscription state and the published list.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!(kind = ?inner.kind, "Shutting down vehicle manager");
        {
            let mut tasks = inner.tasks.lock().await;
            tasks.loop_token.cancel();
            tasks.read_token.cancel();
            if let Some(handle) = tasks.subscribe.take() {
                handle.abort();
            }
            if let Some(handle) = tasks.reconnect.take() {
                handle.abort();
            }
            tasks.flush.take();
            tasks.sweep.take();
            tasks.read.take();
        }

        if let Err(e) = inner.feed.disconnect().await {
            debug!(error = %e, "Feed disconnect failed during shutdown");
        }

        inner.buffer.clear();
        inner.reconciler.lock().await.reset();
        inner.vehicles.write().await.clear();
        *inner.connection.write().await = ConnectionState::Disconnected;
        self.publish_vehicles().await;
        inner.status_tx.send_replace(FeedStatus::Disconnected);
    }

    // Returns a boxed `Send` future rather than being a plain `async fn` so
    // that the recursive cycle start_connect -> schedule_reconnect -> spawn ->
    // start_connect has a concretely-`Send` node, letting the auto-trait
    // solver resolve `Send` instead of looping on the opaque future types.
    fn schedule_reconnect(
        &self,
        reason: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let inner = &self.inner;
        let attempt = inner.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt > inner.config.max_connect_attempts {
            error!(
                kind = ?inner.kind,
                attempts = attempt - 1,
                "Feed reconnect attempts exhausted"
            );
            inner.status_tx.send_replace(FeedStatus::Failed(reason));
            return;
        }

        let delay = inner.reconnect_policy.delay(attempt - 1);
        info!(
            kind = ?inner.kind,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling feed reconnect"
        );

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.start_connect().await;
        });

        let mut tasks = inner.tasks.lock().await;
        if let Some(previous) = tasks.reconnect.replace(handle) {
            previous.abort();
        }
        })
    }

    /// Immediate reconnect after a detected connection loss; the scheduled
    /// backoff path is reserved for connect failures.
    fn reconnect_now(&self) {
        self.inner.status_tx.send_replace(FeedStatus::Disconnected);
        let manager = self.clone();
        tokio::spawn(async move { manager.start_connect().await });
    }

    async fn spawn_read_loop(&self, mut messages: mpsc::Receiver<FeedMessage>) {
        let token = CancellationToken::new();
        let read_token = token.clone();
        let manager = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_token.cancelled() => break,
                    message = messages.recv() => match message {
                        Some(message) => manager.handle_message(message),
                        None => {
                            // A replaced read loop must not react to its old
                            // channel closing.
                            if read_token.is_cancelled() {
                                break;
                            }
                            warn!(kind = ?manager.inner.kind, "Feed message stream closed");
                            *manager.inner.connection.write().await = ConnectionState::Disconnected;
                            manager.reconnect_now();
                            break;
                        }
                    },
                }
            }
        });

        let mut tasks = self.inner.tasks.lock().await;
        let old_token = std::mem::replace(&mut tasks.read_token, token);
        old_token.cancel();
        if let Some(previous) = tasks.read.replace(handle) {
            previous.abort();
        }
    }

    /// Decode and deposit one inbound message. Synchronous on purpose: this
    /// path runs at feed-native frequency and must never wait on the flush.
    fn handle_message(&self, message: FeedMessage) {
        if let Some(position) = decoder::decode(&message.topic, &message.payload, self.inner.kind)
        {
            self.inner.buffer.deposit(position);
        }
    }

    // --- selection and subscription reconciliation ---

    /// Replace the tracked line selection. Starts or stops the periodic
    /// loops and, when connected, reconciles the feed subscriptions.
    pub async fn update_subscriptions(&self, selections: Vec<RouteSelection>) {
        let inner = &self.inner;
        info!(kind = ?inner.kind, lines = selections.len(), "Updating line selection");
        *inner.selection.write().await = selections.clone();

        if selections.is_empty() {
            self.stop_loops().await;
        } else {
            self.ensure_loops().await;
        }

        if *inner.connection.read().await != ConnectionState::Connected {
            // The selection is stored; start_connect reconciles once online.
            return;
        }

        self.spawn_reconciliation(&selections).await;
    }

    async fn spawn_reconciliation(&self, selections: &[RouteSelection]) {
        let inner = &self.inner;
        // A newer selection supersedes whatever is still in flight.
        {
            let mut tasks = inner.tasks.lock().await;
            if let Some(previous) = tasks.subscribe.take() {
                previous.abort();
            }
        }

        let change = inner
            .reconciler
            .lock()
            .await
            .compute_change(selections, inner.kind);

        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.run_reconciliation(change).await });
        inner.tasks.lock().await.subscribe = Some(handle);
    }

    async fn run_reconciliation(&self, change: SubscriptionChange) {
        let inner = &self.inner;
        for topic in &change.to_unsubscribe {
            if let Err(e) = inner.feed.unsubscribe(topic).await {
                self.handle_subscription_error(e).await;
                return;
            }
        }
        for topic in &change.to_subscribe {
            if let Err(e) = inner.feed.subscribe(topic).await {
                self.handle_subscription_error(e).await;
                return;
            }
        }

        let committed = inner
            .reconciler
            .lock()
            .await
            .apply_update(change.request_id, change.new_topics);
        if !committed {
            // A newer reconciliation took over; this one's topic set must
            // not touch the vehicle map.
            debug!(kind = ?inner.kind, request_id = change.request_id, "Reconciliation superseded");
            return;
        }

        let selections = inner.selection.read().await.clone();
        {
            let mut vehicles = inner.vehicles.write().await;
            vehicles.retain(|_, vehicle| selections.iter().any(|s| s.matches_vehicle(vehicle)));
        }
        self.publish_vehicles().await;
    }

    async fn handle_subscription_error(&self, error: FeedError) {
        let inner = &self.inner;
        if error.is_no_connection() {
            warn!(kind = ?inner.kind, error = %error, "Connection lost during subscription change");
            *inner.connection.write().await = ConnectionState::Disconnected;
            self.reconnect_now();
        } else {
            warn!(kind = ?inner.kind, error = %error, "Subscription change failed");
        }
    }

    // --- periodic loops ---

    async fn ensure_loops(&self) {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock().await;
        let running = tasks
            .flush
            .as_ref()
            .map_or(false, |handle| !handle.is_finished());
        if running {
            return;
        }

        let token = CancellationToken::new();
        tasks.loop_token = token.clone();

        let manager = self.clone();
        let flush_token = token.clone();
        let flush_interval = Duration::from_millis(inner.config.flush_interval_ms);
        tasks.flush = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            // The first tick fires immediately with nothing buffered yet.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = flush_token.cancelled() => break,
                    _ = interval.tick() => manager.flush_tick().await,
                }
            }
        }));

        let manager = self.clone();
        let sweep_token = token;
        let sweep_interval = Duration::from_millis(inner.config.sweep_interval_ms);
        tasks.sweep = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = sweep_token.cancelled() => break,
                    _ = interval.tick() => manager.sweep_tick().await,
                }
            }
        }));
    }

    async fn stop_loops(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        tasks.loop_token.cancel();
        tasks.flush.take();
        tasks.sweep.take();
    }

    /// One flush cycle: drain the buffer, merge accepted vehicles, prune
    /// stale entries, republish when anything changed. The published list is
    /// always a function of exactly one drain.
    async fn flush_tick(&self) {
        let inner = &self.inner;
        let drained = inner.buffer.drain_all();
        let selections = inner.selection.read().await.clone();
        let now = Utc::now().timestamp();
        let mut changed = false;

        {
            let mut vehicles = inner.vehicles.write().await;
            for (key, position) in drained {
                if !selections.iter().any(|s| s.matches_vehicle(&position)) {
                    continue;
                }
                // The vehicle is alive again; drop any pending exit intent.
                inner.buffer.cancel_removal(&key);

                // Always store the drained record so the timestamp stays
                // fresh; only a visible difference triggers a republish.
                let differs = vehicles
                    .get(&key)
                    .map_or(true, |existing| *existing != position);
                vehicles.insert(key, position);
                changed |= differs;
            }

            changed |= self.prune_stale_locked(&mut vehicles, now);
        }

        if changed {
            self.publish_vehicles().await;
        }
    }

    /// One stale-sweep cycle: prune without draining. Covers the case where
    /// the feed stops sending for a vehicle entirely and flush never sees a
    /// reason to touch it.
    async fn sweep_tick(&self) {
        let now = Utc::now().timestamp();
        let removed = {
            let mut vehicles = self.inner.vehicles.write().await;
            self.prune_stale_locked(&mut vehicles, now)
        };
        if removed {
            self.publish_vehicles().await;
        }
    }

    fn prune_stale_locked(
        &self,
        vehicles: &mut HashMap<VehicleKey, VehiclePosition>,
        now: i64,
    ) -> bool {
        let inner = &self.inner;
        let stale: Vec<VehicleKey> = vehicles
            .iter()
            .filter(|(_, vehicle)| vehicle.age_secs(now) > inner.config.stale_after_secs)
            .map(|(key, _)| *key)
            .collect();

        for key in &stale {
            vehicles.remove(key);
            let generation = inner.buffer.begin_removal(*key);
            // Ignore send errors - they just mean no one is listening
            let _ = inner.removals_tx.send((*key, generation));
        }

        if !stale.is_empty() {
            info!(kind = ?inner.kind, removed = stale.len(), "Pruned stale vehicles");
        }
        !stale.is_empty()
    }

    async fn publish_vehicles(&self) {
        let vehicles = self.inner.vehicles.read().await;
        let mut list: Vec<VehiclePosition> = vehicles.values().cloned().collect();
        list.sort_by_key(|vehicle| vehicle.id);
        self.inner.vehicles_tx.send_replace(Arc::new(list));
    }

    // --- favorites ---

    /// Add or remove a line from the favorites list and write through to the
    /// store.
    pub async fn toggle_favorite(&self, line: &str) {
        let inner = &self.inner;
        let mut favorites = inner.favorites.write().await;
        if let Some(index) = favorites.iter().position(|l| l == line) {
            favorites.remove(index);
        } else {
            favorites.push(line.to_string());
        }
        inner.favorites_store.save(inner.kind, &favorites);
    }

    pub async fn favorites(&self) -> Vec<String> {
        self.inner.favorites.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::favorites::MemoryFavoritesStore;
    use async_trait::async_trait;

    // --- mock feed ---

    #[derive(Default)]
    struct MockFeed {
        sender: parking_lot::Mutex<Option<mpsc::Sender<FeedMessage>>>,
        subscribed: parking_lot::Mutex<Vec<String>>,
        unsubscribed: parking_lot::Mutex<Vec<String>>,
        connects: AtomicU32,
        failing_connects: AtomicU32,
        next_subscribe_error: parking_lot::Mutex<Option<FeedError>>,
    }

    impl MockFeed {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn fail_next_connects(&self, count: u32) {
            self.failing_connects.store(count, Ordering::Relaxed);
        }

        fn fail_next_subscribe(&self, error: FeedError) {
            *self.next_subscribe_error.lock() = Some(error);
        }

        async fn send_vp(&self, topic: &str, payload: &str) {
            let sender = self.sender.lock().clone().expect("feed not connected");
            sender
                .send(FeedMessage {
                    topic: topic.to_string(),
                    payload: payload.as_bytes().to_vec(),
                })
                .await
                .expect("read loop gone");
        }

        fn subscribed_topics(&self) -> Vec<String> {
            self.subscribed.lock().clone()
        }

        fn unsubscribed_topics(&self) -> Vec<String> {
            self.unsubscribed.lock().clone()
        }
    }

    #[async_trait]
    impl VehicleFeed for MockFeed {
        async fn connect(&self) -> Result<mpsc::Receiver<FeedMessage>, FeedError> {
            self.connects.fetch_add(1, Ordering::Relaxed);
            if self.failing_connects.load(Ordering::Relaxed) > 0 {
                self.failing_connects.fetch_sub(1, Ordering::Relaxed);
                return Err(FeedError::Connection("broker unreachable".into()));
            }
            let (tx, rx) = mpsc::channel(64);
            *self.sender.lock() = Some(tx);
            Ok(rx)
        }

        async fn disconnect(&self) -> Result<(), FeedError> {
            self.sender.lock().take();
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> Result<(), FeedError> {
            if let Some(error) = self.next_subscribe_error.lock().take() {
                return Err(error);
            }
            self.subscribed.lock().push(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), FeedError> {
            self.unsubscribed.lock().push(topic.to_string());
            Ok(())
        }
    }

    // --- helpers ---

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            flush_interval_ms: 40,
            sweep_interval_ms: 60,
            stale_after_secs: 300,
            max_connect_attempts: 3,
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_secs: 1,
        }
    }

    fn make_manager(feed: Arc<MockFeed>, config: TrackerConfig) -> VehicleManager {
        VehicleManager::new(
            VehicleKind::Bus,
            config,
            feed,
            Arc::new(MemoryFavoritesStore::new()),
        )
    }

    async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, predicate: F)
    where
        F: Fn(&T) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = predicate(&*rx.borrow_and_update());
                if done {
                    return;
                }
                rx.changed().await.expect("watch channel closed");
            }
        })
        .await
        .expect("condition not reached within timeout");
    }

    fn vp(veh: i64, lat: f64, tsi: i64) -> String {
        format!(
            r#"{{"VP": {{"veh": {veh}, "desi": "550", "lat": {lat}, "long": 24.94, "hdg": 90, "tsi": {tsi}}}}}"#
        )
    }

    const TOPIC_550: &str =
        "/hfp/v2/journey/ongoing/vp/bus/0022/00042/2550/1/Westendinasema/05:00/1001/0";

    // --- end-to-end flush and sweep tests ---

    #[tokio::test]
    async fn flush_publishes_and_sweep_prunes_stale_vehicle() {
        let feed = MockFeed::new();
        let manager = make_manager(feed.clone(), fast_config());
        let mut status = manager.status();
        let mut vehicles = manager.vehicle_list();

        manager.connect();
        wait_for(&mut status, |s| *s == FeedStatus::Connected).await;

        manager
            .update_subscriptions(vec![RouteSelection::new("HSL:2550", "550")])
            .await;

        // Four topic variants for the single selection.
        tokio::time::timeout(Duration::from_secs(2), async {
            while feed.subscribed_topics().len() < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriptions not issued");

        // Position that goes stale roughly one second from now.
        let now = Utc::now().timestamp();
        feed.send_vp(TOPIC_550, &vp(42, 60.17, now - 299)).await;

        wait_for(&mut vehicles, |list| list.len() == 1).await;
        {
            let list = vehicles.borrow().clone();
            assert_eq!(list[0].id, 42);
            assert_eq!(list[0].lat, 60.17);
            assert_eq!(list[0].heading, Some(90));
            assert_eq!(list[0].route_id.as_deref(), Some("2550"));
        }

        // No further messages: once the age passes the threshold the sweep
        // loop removes the vehicle and republishes an empty list.
        let mut removals = manager.removals();
        wait_for(&mut vehicles, |list| list.is_empty()).await;

        let (key, generation) = removals.recv().await.expect("removal event");
        assert_eq!(key.id, 42);
        assert!(manager.acknowledge_removal(key, generation));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unchanged_position_refreshes_timestamp_without_republish() {
        let feed = MockFeed::new();
        let manager = make_manager(feed.clone(), fast_config());
        let mut status = manager.status();
        let mut vehicles = manager.vehicle_list();

        manager.connect();
        wait_for(&mut status, |s| *s == FeedStatus::Connected).await;
        manager
            .update_subscriptions(vec![RouteSelection::new("HSL:2550", "550")])
            .await;

        let now = Utc::now().timestamp();
        feed.send_vp(TOPIC_550, &vp(42, 60.17, now)).await;
        wait_for(&mut vehicles, |list| list.len() == 1).await;

        // Same coordinates, newer timestamp: must not wake the watchers.
        feed.send_vp(TOPIC_550, &vp(42, 60.17, now + 1)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!vehicles.has_changed().unwrap());

        // A moved vehicle does wake them.
        feed.send_vp(TOPIC_550, &vp(42, 60.18, now + 2)).await;
        wait_for(&mut vehicles, |list| list.len() == 1 && list[0].lat == 60.18).await;

        manager.shutdown().await;
    }

    // --- selection change tests ---

    #[tokio::test]
    async fn deselected_line_never_survives_reconciliation() {
        let feed = MockFeed::new();
        let manager = make_manager(feed.clone(), fast_config());
        let mut status = manager.status();
        let mut vehicles = manager.vehicle_list();

        manager.connect();
        wait_for(&mut status, |s| *s == FeedStatus::Connected).await;

        let line_a = RouteSelection::new("HSL:2550", "550");
        let line_b = RouteSelection::new("HSL:1065", "65");

        manager.update_subscriptions(vec![line_a.clone()]).await;
        let now = Utc::now().timestamp();
        feed.send_vp(TOPIC_550, &vp(42, 60.17, now)).await;
        wait_for(&mut vehicles, |list| list.len() == 1).await;

        // Select A+B and wait until B's four topic variants are subscribed,
        // so the following deselection has a committed set to diff against.
        manager
            .update_subscriptions(vec![line_a.clone(), line_b.clone()])
            .await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while feed.subscribed_topics().len() < 8 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("B topics not subscribed");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A B update lands in the buffer, then B is dropped again before the
        // flush can possibly publish it.
        let topic_b = "/hfp/v2/journey/ongoing/vp/bus/0022/00007/1065/1/Veräjälaakso/05:00/1001/0";
        let payload_b = format!(
            r#"{{"VP": {{"veh": 7, "desi": "65", "lat": 60.20, "long": 24.95, "tsi": {now}}}}}"#
        );
        feed.send_vp(topic_b, &payload_b).await;
        manager.update_subscriptions(vec![line_a.clone()]).await;

        // Give the reconciliation and a couple of flush ticks time to run.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let list = vehicles.borrow().clone();
        assert_eq!(list.len(), 1, "only line A vehicles may remain: {list:?}");
        assert_eq!(list[0].id, 42);

        // B's topics were unsubscribed again.
        assert!(feed
            .unsubscribed_topics()
            .iter()
            .any(|topic| topic.contains("1065")));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn empty_selection_clears_vehicles_and_stops_loops() {
        let feed = MockFeed::new();
        let manager = make_manager(feed.clone(), fast_config());
        let mut status = manager.status();
        let mut vehicles = manager.vehicle_list();

        manager.connect();
        wait_for(&mut status, |s| *s == FeedStatus::Connected).await;
        manager
            .update_subscriptions(vec![RouteSelection::new("HSL:2550", "550")])
            .await;

        let now = Utc::now().timestamp();
        feed.send_vp(TOPIC_550, &vp(42, 60.17, now)).await;
        wait_for(&mut vehicles, |list| list.len() == 1).await;

        manager.update_subscriptions(Vec::new()).await;
        wait_for(&mut vehicles, |list| list.is_empty()).await;

        // With the loops stopped, further messages pile up in the buffer but
        // never reach the published list.
        feed.send_vp(TOPIC_550, &vp(43, 60.18, now)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(vehicles.borrow().is_empty());

        manager.shutdown().await;
    }

    // --- reconnect tests ---

    #[tokio::test]
    async fn connect_failures_exhaust_into_failed_status() {
        let feed = MockFeed::new();
        feed.fail_next_connects(u32::MAX);
        let manager = make_manager(feed.clone(), fast_config());
        let mut status = manager.status();

        manager.connect();
        wait_for(&mut status, |s| matches!(s, FeedStatus::Failed(_))).await;

        // Initial attempt plus three scheduled retries.
        assert_eq!(feed.connects.load(Ordering::Relaxed), 4);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn explicit_connect_recovers_after_failure() {
        let feed = MockFeed::new();
        feed.fail_next_connects(u32::MAX);
        let manager = make_manager(feed.clone(), fast_config());
        let mut status = manager.status();

        manager.connect();
        wait_for(&mut status, |s| matches!(s, FeedStatus::Failed(_))).await;

        feed.fail_next_connects(0);
        manager.connect();
        wait_for(&mut status, |s| *s == FeedStatus::Connected).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn no_connection_during_subscribe_triggers_reconnect() {
        let feed = MockFeed::new();
        let manager = make_manager(feed.clone(), fast_config());
        let mut status = manager.status();

        manager.connect();
        wait_for(&mut status, |s| *s == FeedStatus::Connected).await;
        let connects_before = feed.connects.load(Ordering::Relaxed);

        feed.fail_next_subscribe(FeedError::NotConnected);
        manager
            .update_subscriptions(vec![RouteSelection::new("HSL:2550", "550")])
            .await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while feed.connects.load(Ordering::Relaxed) <= connects_before {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no reconnect happened");
        wait_for(&mut status, |s| *s == FeedStatus::Connected).await;

        // The retried session subscribes the selection's four variants.
        tokio::time::timeout(Duration::from_secs(2), async {
            while feed.subscribed_topics().len() < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriptions not re-issued");

        manager.shutdown().await;
    }

    // --- favorites tests ---

    #[tokio::test]
    async fn toggle_favorite_keeps_order_and_persists() {
        let store = Arc::new(MemoryFavoritesStore::new());
        let manager =
            VehicleManager::new(VehicleKind::Bus, fast_config(), MockFeed::new(), store.clone());

        manager.toggle_favorite("550").await;
        manager.toggle_favorite("65").await;
        assert_eq!(manager.favorites().await, vec!["550", "65"]);
        assert_eq!(store.load(VehicleKind::Bus), vec!["550", "65"]);

        manager.toggle_favorite("550").await;
        assert_eq!(manager.favorites().await, vec!["65"]);
        assert_eq!(store.load(VehicleKind::Bus), vec!["65"]);
    }

    #[tokio::test]
    async fn favorites_load_from_store_at_construction() {
        let store = Arc::new(MemoryFavoritesStore::new());
        store.save(VehicleKind::Tram, &["7".to_string()]);
        let manager = VehicleManager::new(VehicleKind::Tram, fast_config(), MockFeed::new(), store);
        assert_eq!(manager.favorites().await, vec!["7"]);
    }
}
