// Fleetgate
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Live-data channels
//!
//! Every feed subscription is drained by one pump task, so events reach
//! listeners in the order the feed emitted them. For each event a listener
//! first has its query key invalidated, then its callback invoked, both
//! within the same delivery turn.

use crate::config::RealtimeConfig;
use crate::error::{AccessError, AccessResult};
use crate::realtime::cache::{QueryCache, QueryKey};
use crate::realtime::events::{ChangeEvent, ChannelSpec, EventFilter};
use crate::realtime::feed::{ChangeFeed, FeedSubscription, SubscriptionId};
use crate::realtime::invalidation::CacheInvalidator;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consumer callback run after invalidation
pub type EventCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Parameters of a channel
#[derive(Clone)]
pub struct ChannelRequest {
    pub resource: String,
    pub invalidation_key: QueryKey,
    pub filter: EventFilter,
    /// Falls back to the configured default schema
    pub schema: Option<String>,
    pub on_event: Option<EventCallback>,
}

impl ChannelRequest {
    pub fn new(resource: impl Into<String>, invalidation_key: impl Into<QueryKey>) -> Self {
        Self {
            resource: resource.into(),
            invalidation_key: invalidation_key.into(),
            filter: EventFilter::Any,
            schema: None,
            on_event: None,
        }
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }

    fn spec(&self, default_schema: &str) -> ChannelSpec {
        ChannelSpec::new(self.resource.clone())
            .with_schema(self.schema.clone().unwrap_or_else(|| default_schema.to_string()))
            .with_filter(self.filter)
    }
}

impl fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("resource", &self.resource)
            .field("invalidation_key", &self.invalidation_key)
            .field("filter", &self.filter)
            .field("schema", &self.schema)
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

thread_local! {
    /// Listener whose callback is running on this thread
    static IN_CALLBACK: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Marks a listener's callback as running until dropped
struct CallbackScope(Option<u64>);

impl CallbackScope {
    fn enter(listener_id: u64) -> Self {
        Self(IN_CALLBACK.with(|current| current.replace(Some(listener_id))))
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_CALLBACK.with(|current| current.set(self.0));
    }
}

struct Listener {
    id: u64,
    key: QueryKey,
    on_event: Option<EventCallback>,
    alive: AtomicBool,
    /// Held for a whole delivery turn (invalidate, then callback)
    delivery: Mutex<()>,
}

impl Listener {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop deliveries and wait out a turn already in progress.
    ///
    /// Called from the listener's own callback it returns at once; that
    /// turn is the one in progress and no other follows it.
    fn retire(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if IN_CALLBACK.with(|current| current.get()) == Some(self.id) {
            return;
        }
        drop(self.delivery.lock());
    }
}

#[derive(Default)]
struct PumpState {
    listeners: Vec<Arc<Listener>>,
    closed: bool,
}

/// One feed subscription and the listeners it fans out to
struct Pump {
    spec: ChannelSpec,
    subscription: SubscriptionId,
    state: Mutex<PumpState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Pump {
    fn listeners(&self) -> Vec<Arc<Listener>> {
        self.state.lock().listeners.clone()
    }

    /// Attach a listener unless the pump was already torn down
    fn attach(&self, listener: Arc<Listener>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.listeners.push(listener);
        true
    }
}

struct ManagerInner {
    feed: Arc<dyn ChangeFeed>,
    invalidator: CacheInvalidator,
    config: RealtimeConfig,
    shared: DashMap<ChannelSpec, Arc<Pump>>,
    next_listener: AtomicU64,
    active: AtomicUsize,
    delivered: AtomicU64,
}

impl ManagerInner {
    fn deliver(&self, pump: &Pump, event: &ChangeEvent) {
        for listener in pump.listeners() {
            let _turn = listener.delivery.lock();
            if !listener.is_alive() {
                continue;
            }
            self.invalidator.on_event(&listener.key, event);
            // A close may have landed while the cache was invalidating
            if !listener.is_alive() {
                continue;
            }
            if let Some(callback) = &listener.on_event {
                let _scope = CallbackScope::enter(listener.id);
                callback(event);
            }
            self.delivered.fetch_add(1, Ordering::Relaxed);
            counter!("fleetgate_events_delivered_total", 1);
        }
    }

    /// Remove a listener, tearing the pump down when it was the last one
    fn detach(&self, pump: &Arc<Pump>, listener_id: u64) {
        let teardown = {
            let mut state = pump.state.lock();
            state.listeners.retain(|listener| listener.id != listener_id);
            if state.listeners.is_empty() && !state.closed {
                state.closed = true;
                true
            } else {
                false
            }
        };

        let active = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        counter!("fleetgate_channels_closed_total", 1);
        gauge!("fleetgate_channels_active", active as f64);

        if teardown {
            self.release(pump);
        }
    }

    fn release(&self, pump: &Arc<Pump>) {
        self.shared.remove_if(&pump.spec, |_, current| Arc::ptr_eq(current, pump));
        self.feed.unsubscribe(pump.subscription);
        if let Some(task) = pump.task.lock().take() {
            task.abort();
        }
        debug!(channel = %pump.spec, subscription = %pump.subscription, "Feed subscription released");
    }

    /// Stream ended without a close
    fn dropped(&self, pump: &Arc<Pump>) {
        let listeners = {
            let mut state = pump.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.listeners.len()
        };

        self.shared.remove_if(&pump.spec, |_, current| Arc::ptr_eq(current, pump));
        let err = AccessError::ChannelDropped {
            resource: pump.spec.resource.clone(),
        };
        error!(channel = %pump.spec, listeners, error_type = err.error_type(), "{}", err);
    }
}

/// Opens and tracks live-data channels
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, cache: Arc<dyn QueryCache>) -> Self {
        Self::with_config(feed, cache, RealtimeConfig::default())
    }

    pub fn with_config(feed: Arc<dyn ChangeFeed>, cache: Arc<dyn QueryCache>, config: RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                feed,
                invalidator: CacheInvalidator::new(cache),
                config,
                shared: DashMap::new(),
                next_listener: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Open a channel.
    ///
    /// Resolves once the feed acknowledged the subscription. Subscription
    /// failures are logged and returned; there is no retry.
    pub async fn open(&self, request: ChannelRequest) -> AccessResult<ChannelHandle> {
        let spec = request.spec(&self.inner.config.default_schema);
        let listener = Arc::new(Listener {
            id: self.inner.next_listener.fetch_add(1, Ordering::SeqCst) + 1,
            key: request.invalidation_key.clone(),
            on_event: request.on_event.clone(),
            alive: AtomicBool::new(true),
            delivery: Mutex::new(()),
        });

        let pump = if self.inner.config.multiplex_channels {
            self.open_shared(&spec, listener.clone()).await?
        } else {
            let pump = self.subscribe(&spec).await?;
            pump.attach(listener.clone());
            pump
        };

        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        counter!("fleetgate_channels_opened_total", 1);
        gauge!("fleetgate_channels_active", active as f64);
        info!(channel = %spec, key = %listener.key, "Channel opened");

        Ok(ChannelHandle {
            listener,
            pump,
            inner: self.inner.clone(),
            closed: false,
        })
    }

    async fn open_shared(&self, spec: &ChannelSpec, listener: Arc<Listener>) -> AccessResult<Arc<Pump>> {
        if let Some(pump) = self.inner.shared.get(spec).map(|entry| entry.value().clone()) {
            if pump.attach(listener.clone()) {
                debug!(channel = %spec, "Joined shared channel");
                return Ok(pump);
            }
        }

        let fresh = self.subscribe(spec).await?;

        // Another open may have won the race while we awaited the ack
        let pump = self.inner.shared.entry(spec.clone()).or_insert_with(|| fresh.clone()).value().clone();
        if Arc::ptr_eq(&pump, &fresh) {
            fresh.attach(listener);
            return Ok(fresh);
        }

        if pump.attach(listener.clone()) {
            fresh.state.lock().closed = true;
            self.inner.release(&fresh);
            return Ok(pump);
        }

        // The pump we found was torn down in the meantime
        self.inner.shared.insert(spec.clone(), fresh.clone());
        fresh.attach(listener);
        Ok(fresh)
    }

    async fn subscribe(&self, spec: &ChannelSpec) -> AccessResult<Arc<Pump>> {
        let FeedSubscription { id, events } = match self.inner.feed.subscribe(spec).await {
            Ok(subscription) => subscription,
            Err(e) => {
                counter!("fleetgate_channel_errors_total", 1);
                warn!(channel = %spec, error = %e, "Failed to open channel");
                return Err(e);
            }
        };

        let pump = Arc::new(Pump {
            spec: spec.clone(),
            subscription: id,
            state: Mutex::new(PumpState::default()),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(Self::run(self.inner.clone(), pump.clone(), events));
        pump.task.lock().replace(task);
        debug!(channel = %spec, subscription = %id, "Pump started");
        Ok(pump)
    }

    async fn run(inner: Arc<ManagerInner>, pump: Arc<Pump>, mut events: mpsc::UnboundedReceiver<ChangeEvent>) {
        while let Some(event) = events.recv().await {
            if pump.state.lock().closed {
                return;
            }
            inner.deliver(&pump, &event);
        }
        inner.dropped(&pump);
    }

    /// Listeners currently open
    pub fn active_channels(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Shared feed subscriptions held in multiplexed mode
    pub fn shared_subscriptions(&self) -> usize {
        self.inner.shared.len()
    }

    /// Events handed to listeners since creation
    pub fn delivered_events(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn is_multiplexed(&self) -> bool {
        self.inner.config.multiplex_channels
    }
}

/// An open channel. Closing, or dropping, stops all further deliveries.
pub struct ChannelHandle {
    listener: Arc<Listener>,
    pump: Arc<Pump>,
    inner: Arc<ManagerInner>,
    closed: bool,
}

impl ChannelHandle {
    pub fn spec(&self) -> &ChannelSpec {
        &self.pump.spec
    }

    pub fn key(&self) -> &QueryKey {
        &self.listener.key
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.pump.subscription
    }

    /// False once closed or once the feed dropped the stream
    pub fn is_open(&self) -> bool {
        !self.closed && self.listener.is_alive() && !self.pump.state.lock().closed
    }

    /// Close the channel. Once this returns the callback is not invoked again,
    /// even for an event whose delivery had already started.
    pub fn close(mut self) {
        self.release();
        info!(channel = %self.pump.spec, key = %self.listener.key, "Channel closed");
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.listener.retire();
        self.inner.detach(&self.pump, self.listener.id);
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if !self.closed {
            warn!(channel = %self.pump.spec, key = %self.listener.key, "Channel dropped without close");
            self.release();
        }
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("spec", &self.pump.spec)
            .field("key", &self.listener.key)
            .field("subscription", &self.pump.subscription)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Holds at most one channel for a consumer, re-binding on parameter changes
pub struct ChannelBinding {
    manager: SubscriptionManager,
    current: Option<ChannelHandle>,
}

impl ChannelBinding {
    pub fn new(manager: SubscriptionManager) -> Self {
        Self { manager, current: None }
    }

    /// Close the current channel, then open one for `request`
    pub async fn bind(&mut self, request: ChannelRequest) -> AccessResult<()> {
        self.unbind();
        self.current = Some(self.manager.open(request).await?);
        Ok(())
    }

    pub fn unbind(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.close();
        }
    }

    pub fn current(&self) -> Option<&ChannelHandle> {
        self.current.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.current.is_some()
    }
}

impl Drop for ChannelBinding {
    fn drop(&mut self) {
        self.unbind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::cache::{InMemoryQueryCache, InvalidationOutcome};
    use crate::realtime::events::EventKind;
    use crate::realtime::feed::InMemoryChangeFeed;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        feed: Arc<InMemoryChangeFeed>,
        cache: Arc<InMemoryQueryCache>,
        manager: SubscriptionManager,
    }

    fn harness(multiplex: bool) -> Harness {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let cache = Arc::new(InMemoryQueryCache::new());
        let config = RealtimeConfig {
            multiplex_channels: multiplex,
            ..RealtimeConfig::default()
        };
        let manager = SubscriptionManager::with_config(feed.clone(), cache.clone(), config);
        Harness { feed, cache, manager }
    }

    fn recorder() -> (impl Fn(&ChangeEvent) + Send + Sync + 'static, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |event: &ChangeEvent| {
                let _ = tx.send(event.clone());
            },
            rx,
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap()
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalidation_precedes_callback() {
        let h = harness(false);
        h.cache.set(QueryKey::from("orders"), json!([]));

        let cache = h.cache.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = ChannelRequest::new("orders", "orders").on_event(move |_| {
            let _ = tx.send(cache.is_stale(&QueryKey::from("orders")));
        });
        let handle = h.manager.open(request).await.unwrap();

        h.feed.emit(ChangeEvent::new("orders", EventKind::Insert, json!({"id": 1})));
        let stale_at_callback = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(stale_at_callback, Some(true));
        handle.close();
    }

    #[tokio::test]
    async fn test_events_delivered_in_feed_order() {
        let h = harness(false);
        let (callback, mut rx) = recorder();
        let handle = h.manager.open(ChannelRequest::new("orders", "orders").on_event(callback)).await.unwrap();

        for id in 0..10 {
            h.feed.emit(ChangeEvent::new("orders", EventKind::Update, json!({ "id": id })));
        }
        for id in 0..10 {
            assert_eq!(next(&mut rx).await.payload["id"], id);
        }
        assert_eq!(h.manager.delivered_events(), 10);
        handle.close();
    }

    #[tokio::test]
    async fn test_filter_limits_delivery() {
        let h = harness(false);
        let (callback, mut rx) = recorder();
        let handle = h
            .manager
            .open(ChannelRequest::new("orders", "orders").with_filter(EventFilter::Delete).on_event(callback))
            .await
            .unwrap();

        h.feed.emit(ChangeEvent::new("orders", EventKind::Insert, json!({})));
        h.feed.emit(ChangeEvent::new("orders", EventKind::Delete, json!(null)));

        assert_eq!(next(&mut rx).await.kind, EventKind::Delete);
        assert_quiet(&mut rx).await;
        assert_eq!(handle.spec().to_string(), "public.orders:DELETE");
        handle.close();
    }

    #[tokio::test]
    async fn test_nothing_delivered_before_ack() {
        let feed = Arc::new(InMemoryChangeFeed::new().with_ack_delay(Duration::from_millis(50)));
        let manager = SubscriptionManager::new(feed.clone(), Arc::new(InMemoryQueryCache::new()));
        let (callback, mut rx) = recorder();

        let opening = tokio::spawn({
            let manager = manager.clone();
            async move { manager.open(ChannelRequest::new("kits", "kits").on_event(callback)).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(feed.emit(ChangeEvent::new("kits", EventKind::Insert, json!({"id": "early"}))), 0);

        let handle = opening.await.unwrap().unwrap();
        feed.emit(ChangeEvent::new("kits", EventKind::Insert, json!({"id": "late"})));
        assert_eq!(next(&mut rx).await.payload["id"], "late");
        assert_quiet(&mut rx).await;
        handle.close();
    }

    #[tokio::test]
    async fn test_close_stops_delivery_and_releases_subscription() {
        let h = harness(false);
        let (callback, mut rx) = recorder();
        let handle = h.manager.open(ChannelRequest::new("orders", "orders").on_event(callback)).await.unwrap();
        assert_eq!(h.feed.subscription_count(), 1);
        assert_eq!(h.manager.active_channels(), 1);

        handle.close();
        assert_eq!(h.feed.subscription_count(), 0);
        assert_eq!(h.manager.active_channels(), 0);

        h.feed.emit(ChangeEvent::new("orders", EventKind::Insert, json!({})));
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_dropping_handle_closes_channel() {
        let h = harness(false);
        let handle = h.manager.open(ChannelRequest::new("orders", "orders")).await.unwrap();
        drop(handle);

        assert_eq!(h.feed.subscription_count(), 0);
        assert_eq!(h.manager.active_channels(), 0);
    }

    #[tokio::test]
    async fn test_independent_channels_by_default() {
        let h = harness(false);
        let a = h.manager.open(ChannelRequest::new("orders", "orders")).await.unwrap();
        let b = h.manager.open(ChannelRequest::new("orders", ["orders", "dashboard"])).await.unwrap();

        assert_eq!(h.feed.subscription_count(), 2);
        assert_ne!(a.subscription(), b.subscription());

        a.close();
        assert_eq!(h.feed.subscription_count(), 1);
        b.close();
    }

    #[tokio::test]
    async fn test_multiplexed_channels_share_one_subscription() {
        let h = harness(true);
        h.cache.set(QueryKey::from("orders"), json!([]));
        h.cache.set(QueryKey::from(["orders", "dashboard"]), json!({}));

        let (first_cb, mut first_rx) = recorder();
        let (second_cb, mut second_rx) = recorder();
        let first = h.manager.open(ChannelRequest::new("orders", "orders").on_event(first_cb)).await.unwrap();
        let second = h.manager.open(ChannelRequest::new("orders", ["orders", "dashboard"]).on_event(second_cb)).await.unwrap();

        assert_eq!(h.feed.subscription_count(), 1);
        assert_eq!(h.manager.shared_subscriptions(), 1);
        assert_eq!(first.subscription(), second.subscription());

        h.feed.emit(ChangeEvent::new("orders", EventKind::Update, json!({"id": 1})));
        next(&mut first_rx).await;
        next(&mut second_rx).await;
        assert_eq!(h.cache.is_stale(&QueryKey::from("orders")), Some(true));
        assert_eq!(h.cache.is_stale(&QueryKey::from(["orders", "dashboard"])), Some(true));

        first.close();
        assert_eq!(h.feed.subscription_count(), 1);

        h.feed.emit(ChangeEvent::new("orders", EventKind::Update, json!({"id": 2})));
        assert_eq!(next(&mut second_rx).await.payload["id"], 2);
        assert_quiet(&mut first_rx).await;

        second.close();
        assert_eq!(h.feed.subscription_count(), 0);
        assert_eq!(h.manager.shared_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_multiplexing_keys_on_filter_and_schema() {
        let h = harness(true);
        let a = h.manager.open(ChannelRequest::new("orders", "orders")).await.unwrap();
        let b = h.manager.open(ChannelRequest::new("orders", "orders").with_filter(EventFilter::Insert)).await.unwrap();
        let c = h.manager.open(ChannelRequest::new("orders", "orders").with_schema("audit")).await.unwrap();

        assert_eq!(h.manager.shared_subscriptions(), 3);
        a.close();
        b.close();
        c.close();
        assert_eq!(h.manager.shared_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_configured_schema_receives_schemaless_payloads() {
        let feed = Arc::new(InMemoryChangeFeed::new().with_default_schema("fleet"));
        let config = RealtimeConfig {
            default_schema: "fleet".to_string(),
            ..RealtimeConfig::default()
        };
        let manager = SubscriptionManager::with_config(feed.clone(), Arc::new(InMemoryQueryCache::new()), config);
        let (callback, mut rx) = recorder();
        let handle = manager.open(ChannelRequest::new("orders", "orders").on_event(callback)).await.unwrap();
        assert_eq!(handle.spec().to_string(), "fleet.orders:*");

        assert_eq!(feed.emit_raw(&json!({"eventType": "INSERT", "table": "orders", "new": {"id": 4}})).unwrap(), 1);
        assert_eq!(next(&mut rx).await.payload["id"], 4);
        handle.close();
    }

    #[tokio::test]
    async fn test_open_failure_is_returned() {
        let h = harness(false);
        h.feed.refuse("secrets", "permission denied");

        let err = h.manager.open(ChannelRequest::new("secrets", "secrets")).await.unwrap_err();
        assert!(matches!(err, AccessError::Subscription { .. }));
        assert_eq!(h.manager.active_channels(), 0);
    }

    #[tokio::test]
    async fn test_missing_cache_entry_still_runs_callback() {
        let h = harness(false);
        let (callback, mut rx) = recorder();
        let handle = h.manager.open(ChannelRequest::new("reports", "reports").on_event(callback)).await.unwrap();

        h.feed.emit(ChangeEvent::new("reports", EventKind::Insert, json!({})));
        next(&mut rx).await;
        assert_eq!(h.cache.invalidate(&QueryKey::from("reports")), InvalidationOutcome::Missing);
        handle.close();
    }

    #[tokio::test]
    async fn test_feed_disconnect_marks_channel_dropped() {
        let h = harness(true);
        let handle = h.manager.open(ChannelRequest::new("orders", "orders")).await.unwrap();
        assert!(handle.is_open());

        h.feed.disconnect("orders");
        timeout(Duration::from_secs(1), async {
            while handle.is_open() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.manager.shared_subscriptions(), 0);

        handle.close();
        assert_eq!(h.manager.active_channels(), 0);
    }

    #[tokio::test]
    async fn test_binding_closes_previous_channel_first() {
        let h = harness(false);
        let mut binding = ChannelBinding::new(h.manager.clone());

        binding.bind(ChannelRequest::new("orders", ["orders", "region-1"])).await.unwrap();
        let first = binding.current().unwrap().subscription();

        binding.bind(ChannelRequest::new("orders", ["orders", "region-2"])).await.unwrap();
        assert_eq!(h.feed.subscription_count(), 1);
        assert_ne!(binding.current().unwrap().subscription(), first);
        assert_eq!(binding.current().unwrap().key(), &QueryKey::from(["orders", "region-2"]));

        drop(binding);
        assert_eq!(h.feed.subscription_count(), 0);
        assert_eq!(h.manager.active_channels(), 0);
    }

    struct GatedCache {
        entered: std::sync::Barrier,
        resume: std::sync::Barrier,
    }

    impl QueryCache for GatedCache {
        fn invalidate(&self, _key: &QueryKey) -> InvalidationOutcome {
            self.entered.wait();
            self.resume.wait();
            InvalidationOutcome::Invalidated
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_during_delivery_suppresses_callback() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let cache = Arc::new(GatedCache {
            entered: std::sync::Barrier::new(2),
            resume: std::sync::Barrier::new(2),
        });
        let manager = SubscriptionManager::new(feed.clone(), cache.clone());

        let close_returned = Arc::new(AtomicBool::new(false));
        let late_callback = Arc::new(AtomicBool::new(false));
        let request = ChannelRequest::new("orders", "orders").on_event({
            let close_returned = close_returned.clone();
            let late_callback = late_callback.clone();
            move |_| {
                if close_returned.load(Ordering::SeqCst) {
                    late_callback.store(true, Ordering::SeqCst);
                }
            }
        });
        let handle = manager.open(request).await.unwrap();

        feed.emit(ChangeEvent::new("orders", EventKind::Update, json!({"id": 1})));
        let waiting = cache.clone();
        tokio::task::spawn_blocking(move || waiting.entered.wait()).await.unwrap();

        // Let the delivery resume only after close has started waiting on it
        let releasing = cache.clone();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            releasing.resume.wait();
        });

        handle.close();
        close_returned.store(true, Ordering::SeqCst);
        releaser.join().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!late_callback.load(Ordering::SeqCst));
        assert_eq!(feed.subscription_count(), 0);
        assert_eq!(manager.active_channels(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callback_may_close_its_own_channel() {
        let h = harness(false);
        let slot: Arc<Mutex<Option<ChannelHandle>>> = Arc::new(Mutex::new(None));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let request = ChannelRequest::new("orders", "orders").on_event({
            let slot = slot.clone();
            move |event: &ChangeEvent| {
                let _ = tx.send(event.clone());
                let handle = slot.lock().take();
                if let Some(handle) = handle {
                    handle.close();
                }
            }
        });
        let handle = h.manager.open(request).await.unwrap();
        slot.lock().replace(handle);

        h.feed.emit(ChangeEvent::new("orders", EventKind::Insert, json!({"id": 1})));
        h.feed.emit(ChangeEvent::new("orders", EventKind::Insert, json!({"id": 2})));

        assert_eq!(next(&mut rx).await.payload["id"], 1);
        assert_quiet(&mut rx).await;
        assert!(slot.lock().is_none());
        assert_eq!(h.manager.active_channels(), 0);
        assert_eq!(h.feed.subscription_count(), 0);
    }
}
