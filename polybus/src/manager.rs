//! The orchestrator
//!
//! [`PubSubManager`] composes the priority queue, subscription registry,
//! handler pipeline, circuit breaker, retry policy and performance monitor
//! around a single [`Adapter`].
//!
//! Outbound: `publish` only enqueues. A drain loop started by `connect` takes
//! at most one message per topic on every tick and hands it to the adapter
//! through the circuit breaker, bounded by `performance.timeout`. A failed
//! publish puts the message back into its queue.
//!
//! Inbound: each subscription gets its own adapter subscription. A delivered
//! message is matched against the subscription filters, run through the
//! pipeline and finally handed to the subscriber callback. A failing callback
//! is retried with exponential backoff on a separate task; nothing is
//! propagated back into the adapter's delivery loop.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::adapter::{delivery_fn, Adapter, SubscriptionHandle};
use crate::breaker::{BreakerStats, CircuitBreaker, CircuitState};
use crate::conf::Settings;
use crate::monitor::{BrokerSnapshot, LatencySummary, PerformanceMonitor};
use crate::pipeline::{Handler, HandlerPriority, Middleware, Pipeline};
use crate::queue::{Enqueued, PriorityQueue};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::stats::Stats;
use crate::subscribe::{Subscription, SubscriptionRegistry};
use crate::types::{DashMap, HashMap, Message, MessageId, MessageType, PublishOptions, SubscriptionId, Topic};
use crate::utils::{format_timestamp_millis, timestamp_millis, TimestampMillis};
use crate::{Error, Result};

pub const OP_PUBLISH: &str = "publish";
pub const OP_PUBLISH_IMMEDIATE: &str = "publish_immediate";
pub const OP_SUBSCRIPTION: &str = "subscription";

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub broker: String,
    pub connected: bool,
    pub circuit: BreakerStats,
    pub queued: usize,
    pub dead_lettered: usize,
    pub subscriptions: usize,
    pub checked_at: TimestampMillis,
}

impl Health {
    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.connected && self.circuit.state != CircuitState::Open
    }
}

#[derive(Clone)]
pub struct PubSubManager(Arc<Inner>);

pub struct Inner {
    pub settings: Settings,
    adapter: Arc<dyn Adapter>,
    queue: PriorityQueue,
    registry: SubscriptionRegistry,
    pipeline: Pipeline,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    monitor: PerformanceMonitor,
    stats: Stats,
    handles: DashMap<(Topic, SubscriptionId), SubscriptionHandle>,
    draining: AtomicBool,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Deref for PubSubManager {
    type Target = Inner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PubSubManager {
    pub fn new(settings: Settings, adapter: Arc<dyn Adapter>) -> Self {
        let perf = &settings.performance;
        let (stop_tx, _) = watch::channel(false);
        let inner = Inner {
            queue: PriorityQueue::new(perf.max_queue_size),
            registry: SubscriptionRegistry::new(),
            pipeline: Pipeline::new(),
            breaker: CircuitBreaker::from_conf(&settings.circuit_breaker),
            retry: RetryPolicy::new(perf.max_retries, perf.retry_delay),
            monitor: PerformanceMonitor::new(),
            stats: Stats::new(),
            handles: DashMap::default(),
            draining: AtomicBool::new(false),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
            adapter,
            settings,
        };
        Self(Arc::new(inner))
    }

    ///Connects the adapter, attaches registered subscriptions and starts the
    ///background loops
    pub async fn connect(&self) -> Result<()> {
        if !self.tasks.lock().is_empty() {
            log::debug!("{} already connected", self.adapter.name());
            return Ok(());
        }
        self.adapter.connect().await?;
        if let Err(e) = self.attach_registered().await {
            //leave the adapter as it was found, a later connect starts over
            self.handles.clear();
            if let Err(de) = self.adapter.disconnect().await {
                log::warn!("{} disconnect after failed attach failed, {}", self.adapter.name(), de);
            }
            return Err(e);
        }

        self.stop_tx.send_replace(false);
        let tasks = vec![
            tokio::spawn(self.clone().drain_loop(self.stop_tx.subscribe())),
            tokio::spawn(self.clone().metrics_loop(self.stop_tx.subscribe())),
            tokio::spawn(self.clone().health_loop(self.stop_tx.subscribe())),
        ];
        self.tasks.lock().extend(tasks);
        log::info!("{} connected, drain interval is {:?}", self.adapter.name(), self.settings.drain_interval());
        Ok(())
    }

    ///Stops the background loops, waiting for an in-flight drain tick, then
    ///disconnects the adapter
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("background task failed, {}", e);
            }
        }
        self.handles.clear();
        self.adapter.disconnect().await?;
        log::info!("{} disconnected", self.adapter.name());
        Ok(())
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }

    ///Queues a message for `topic`, it reaches the adapter on a later drain tick
    #[inline]
    pub fn publish(&self, topic: &str, payload: Value, opts: PublishOptions) -> MessageId {
        self.publish_message(opts.into_message(topic, payload))
    }

    ///Queues a prebuilt message on the topic named by its type
    #[inline]
    pub fn publish_message(&self, msg: Message) -> MessageId {
        let id = msg.id.clone();
        let topic = msg.typ.clone();
        self.enqueue(&topic, msg);
        id
    }

    ///Sends straight to the adapter, bypassing the queue
    pub async fn publish_immediate(&self, topic: &str, payload: Value, opts: PublishOptions) -> Result<MessageId> {
        let msg = opts.into_message(topic, payload);
        self.send(topic, &msg, OP_PUBLISH_IMMEDIATE).await?;
        Ok(msg.id)
    }

    pub async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionId> {
        let sub = Arc::new(sub);
        let id = sub.id.clone();
        self.registry.subscribe(sub.clone());
        if self.adapter.is_connected() {
            if let Err(e) = self.attach(sub.clone()).await {
                self.registry.unsubscribe(&sub.topic, &id);
                return Err(e);
            }
        }
        log::debug!("subscribed {} to topic {}", id, sub.topic);
        Ok(id)
    }

    pub async fn unsubscribe(&self, topic: &str, id: &str) -> Result<bool> {
        let removed = self.registry.unsubscribe(topic, id);
        if let Some((_, handle)) = self.handles.remove(&(topic.to_owned(), id.to_owned())) {
            self.adapter.unsubscribe(&handle).await?;
        }
        Ok(removed)
    }

    #[inline]
    pub fn register_handler<T: Into<MessageType>>(
        &self,
        typ: T,
        handler: Arc<dyn Handler>,
        priority: HandlerPriority,
    ) {
        self.pipeline.register(typ, handler, priority);
    }

    #[inline]
    pub fn register_global_handler(&self, handler: Arc<dyn Handler>, priority: HandlerPriority) {
        self.pipeline.register_global(handler, priority);
    }

    #[inline]
    pub fn add_middleware(&self, mw: Arc<dyn Middleware>) {
        self.pipeline.add_middleware(mw);
    }

    #[inline]
    pub fn metrics(&self) -> HashMap<String, LatencySummary> {
        self.monitor.metrics()
    }

    #[inline]
    pub fn broker_metrics(&self) -> Option<BrokerSnapshot> {
        self.monitor.broker_metrics(self.adapter.name())
    }

    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    #[inline]
    pub fn health(&self) -> Health {
        Health {
            broker: self.adapter.name().to_owned(),
            connected: self.adapter.is_connected(),
            circuit: self.breaker.stats(),
            queued: self.queue.total_queued(),
            dead_lettered: self.queue.total_dead_lettered(),
            subscriptions: self.registry.len(),
            checked_at: timestamp_millis(),
        }
    }

    #[inline]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    #[inline]
    pub fn dlq_messages(&self, topic: &str) -> Vec<Message> {
        self.queue.dlq_messages(topic)
    }

    #[inline]
    pub fn take_dlq_messages(&self, topic: &str) -> Vec<Message> {
        let msgs = self.queue.take_dlq_messages(topic);
        self.stats.dead_lettered.sub(msgs.len() as isize);
        msgs
    }

    #[inline]
    pub fn queue_size(&self, topic: &str) -> usize {
        self.queue.queue_size(topic)
    }

    ///Drops queued and dead-lettered messages of `topic`, or of every topic
    #[inline]
    pub fn clear(&self, topic: Option<&str>) {
        self.queue.clear(topic);
        self.stats.queued.set(self.queue.total_queued() as isize);
        self.stats.dead_lettered.set(self.queue.total_dead_lettered() as isize);
    }

    ///Drains until the queues are empty or a tick makes no progress, returns
    ///the number of messages published
    pub async fn flush(&self) -> Result<usize> {
        if !self.adapter.is_connected() {
            return Err(Error::NotConnected);
        }
        let mut total = 0;
        while self.queue.total_queued() > 0 {
            match self.drain_tick().await {
                Some(0) => break,
                Some(n) => total += n,
                None => tokio::time::sleep(self.settings.drain_interval()).await,
            }
        }
        Ok(total)
    }

    #[inline]
    fn enqueue(&self, topic: &str, msg: Message) {
        match self.queue.enqueue(topic, msg) {
            Enqueued::Queued => self.stats.queued.inc(),
            Enqueued::DeadLettered => self.stats.dead_lettered.inc(),
        }
    }

    async fn send(&self, topic: &str, msg: &Message, op: &str) -> Result<()> {
        let timeout = self.settings.performance.timeout;
        let start = Instant::now();
        let res = self
            .breaker
            .execute(|| async {
                match tokio::time::timeout(timeout, self.adapter.publish(topic, msg)).await {
                    Ok(res) => res,
                    Err(_) => Err(Error::Timeout(timeout)),
                }
            })
            .await;
        match &res {
            Ok(()) => {
                self.stats.published.inc();
                self.monitor.record_latency(op, elapsed_millis(start), Some(self.adapter.name()));
            }
            Err(_) => self.stats.publish_failures.inc(),
        }
        res
    }

    ///One drain pass, `None` when another pass is still running
    async fn drain_tick(&self) -> Option<usize> {
        if self.draining.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return None;
        }
        scopeguard::defer! {
            self.draining.store(false, Ordering::Release);
        }

        let mut published = 0;
        for topic in self.queue.topics() {
            let Some(msg) = self.queue.dequeue(&topic) else {
                continue;
            };
            self.stats.queued.dec();
            match self.send(&topic, &msg, OP_PUBLISH).await {
                Ok(()) => published += 1,
                Err(e) => {
                    log::warn!("publish failed, topic: {}, message: {}, {}, message requeued", topic, msg.id, e);
                    self.enqueue(&topic, msg);
                }
            }
        }
        Some(published)
    }

    async fn drain_loop(self, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.drain_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_tick().await;
                }
                _ = stop.changed() => break,
            }
        }
        log::debug!("drain loop exited");
    }

    async fn metrics_loop(self, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.performance.metrics_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(data) = self.adapter.metrics().await {
                        self.monitor.record_broker_metrics(self.adapter.name(), data);
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }

    async fn health_loop(self, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.breaker.monitoring_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let health = self.health();
                    let json = serde_json::to_string(&health).unwrap_or_default();
                    let at = format_timestamp_millis(health.checked_at);
                    if health.is_healthy() {
                        log::debug!("health at {}: {}", at, json);
                    } else {
                        log::warn!("unhealthy at {}: {}", at, json);
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }

    async fn attach_registered(&self) -> Result<()> {
        for topic in self.registry.topics() {
            for sub in self.registry.subscriptions(&topic) {
                if !self.handles.contains_key(&(sub.topic.clone(), sub.id.clone())) {
                    self.attach(sub).await?;
                }
            }
        }
        Ok(())
    }

    async fn attach(&self, sub: Arc<Subscription>) -> Result<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.0);
        let target = sub.clone();
        let delivery = delivery_fn(move |msg| {
            let inner = inner.clone();
            let sub = target.clone();
            async move {
                if let Some(inner) = inner.upgrade() {
                    PubSubManager(inner).deliver(sub, msg).await;
                }
            }
        });
        let handle = self.adapter.subscribe(&sub.topic, delivery, sub.opts.clone()).await?;
        if let Some(prev) = self.handles.insert((sub.topic.clone(), sub.id.clone()), handle) {
            self.adapter.unsubscribe(&prev).await?;
        }
        Ok(())
    }

    async fn deliver(&self, sub: Arc<Subscription>, msg: Message) {
        //replaced or removed since the adapter queued this message
        match self.registry.get(&sub.topic, &sub.id) {
            Some(current) if Arc::ptr_eq(&current, &sub) => {}
            _ => return,
        }
        if !sub.matches(&msg) {
            return;
        }

        let start = Instant::now();
        let msg = Arc::new(msg);
        if let Err(e) = self.pipeline.handle(msg.clone()).await {
            self.stats.delivery_failures.inc();
            log::warn!("subscription {} on topic {}, message {} rejected by pipeline, {}", sub.id, sub.topic, msg.id, e);
            return;
        }
        match (sub.callback)(msg.clone()).await {
            Ok(()) => {
                self.stats.delivered.inc();
                self.monitor.record_latency(OP_SUBSCRIPTION, elapsed_millis(start), Some(self.adapter.name()));
            }
            Err(e) => {
                self.stats.delivery_failures.inc();
                log::warn!("subscription {} on topic {}, message {} callback failed, {}", sub.id, sub.topic, msg.id, e);
                self.retry_callback(sub, msg);
            }
        }
    }

    fn retry_callback(&self, sub: Arc<Subscription>, msg: Arc<Message>) {
        let delay = match self.next_retry(&sub, &msg) {
            Some(delay) => delay,
            None => return,
        };
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut delay = delay;
            loop {
                tokio::time::sleep(delay).await;
                match (sub.callback)(msg.clone()).await {
                    Ok(()) => {
                        mgr.retry.succeeded(&sub.id, &msg.id);
                        mgr.stats.delivered.inc();
                        break;
                    }
                    Err(e) => {
                        mgr.stats.delivery_failures.inc();
                        log::warn!("subscription {} on topic {}, message {} retry failed, {}", sub.id, sub.topic, msg.id, e);
                        match mgr.next_retry(&sub, &msg) {
                            Some(d) => delay = d,
                            None => break,
                        }
                    }
                }
            }
        });
    }

    #[inline]
    fn next_retry(&self, sub: &Subscription, msg: &Message) -> Option<Duration> {
        match self.retry.failed(&sub.id, &msg.id) {
            RetryDecision::Retry { attempt, delay } => {
                self.stats.retries.inc();
                log::debug!("message {} for subscription {}, retry {} in {:?}", msg.id, sub.id, attempt, delay);
                Some(delay)
            }
            RetryDecision::Exhausted { attempts } => {
                self.stats.retries_exhausted.inc();
                let e = Error::RetryExhausted { id: msg.id.clone(), attempts };
                log::error!("subscription {} on topic {}, {}", sub.id, sub.topic, e);
                None
            }
        }
    }
}

#[inline]
fn elapsed_millis(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::{mpsc, Notify};

    use crate::adapter::{DeliveryFn, MemoryAdapter};
    use crate::conf::Inner as SettingsInner;
    use crate::handlers::{LoggingHandler, ValidationHandler};
    use crate::subscribe::{callback, Filters};
    use crate::types::{Priority, SubscribeOptions};

    const WAIT: Duration = Duration::from_secs(5);

    fn settings(f: impl FnOnce(&mut SettingsInner)) -> Settings {
        let mut inner = SettingsInner::default();
        f(&mut inner);
        inner.into()
    }

    fn manager() -> PubSubManager {
        PubSubManager::new(Settings::default(), Arc::new(MemoryAdapter::default()))
    }

    fn collect(topic: &str) -> (Subscription, mpsc::UnboundedReceiver<Arc<Message>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = Subscription::new(
            topic,
            callback(move |msg| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg);
                    Ok(())
                }
            }),
        );
        (sub, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Arc<Message>>) -> Arc<Message> {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_critical_published_after_low_is_delivered_first() {
        let mgr = manager();
        let (sub, mut rx) = collect("orders");
        mgr.subscribe(sub).await.unwrap();

        mgr.publish("orders", json!({"n": "low"}), PublishOptions::default().priority(Priority::Low));
        mgr.publish("orders", json!({"n": "critical"}), PublishOptions::default().priority(Priority::Critical));
        assert_eq!(mgr.queue_size("orders"), 2);

        mgr.connect().await.unwrap();
        assert_eq!(recv(&mut rx).await.payload["n"], "critical");
        assert_eq!(recv(&mut rx).await.payload["n"], "low");
        assert_eq!(mgr.stats().published.count(), 2);
        assert!(mgr.metrics().contains_key("memory.publish"));
        mgr.disconnect().await.unwrap();
    }

    #[derive(Default)]
    struct TestAdapter {
        inner: MemoryAdapter,
        failing: AtomicBool,
        refuse_subscribe: AtomicBool,
        attempts: AtomicUsize,
        stall: Option<Duration>,
        gated: bool,
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl Adapter for TestAdapter {
        fn name(&self) -> &str {
            "test"
        }
        async fn connect(&self) -> Result<()> {
            self.inner.connect().await
        }
        async fn disconnect(&self) -> Result<()> {
            self.inner.disconnect().await
        }
        async fn publish(&self, topic: &str, msg: &Message) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.gated {
                self.entered.notify_one();
                self.gate.notified().await;
            }
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::publish(topic, "broker unavailable"));
            }
            self.inner.publish(topic, msg).await
        }
        async fn subscribe(
            &self,
            topic: &str,
            delivery: DeliveryFn,
            opts: SubscribeOptions,
        ) -> Result<SubscriptionHandle> {
            if self.refuse_subscribe.load(Ordering::SeqCst) {
                return Err(Error::Subscription("subscribe refused".into()));
            }
            self.inner.subscribe(topic, delivery, opts).await
        }
        async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<bool> {
            self.inner.unsubscribe(handle).await
        }
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
    }

    #[tokio::test]
    async fn test_publish_failure_requeues_then_delivers() {
        let adapter = Arc::new(TestAdapter { failing: AtomicBool::new(true), ..Default::default() });
        let cfg = settings(|s| {
            s.circuit_breaker.failure_threshold = 3;
            s.circuit_breaker.recovery_timeout = Duration::from_millis(50);
        });
        let mgr = PubSubManager::new(cfg, adapter.clone());
        let (sub, mut rx) = collect("orders");
        mgr.subscribe(sub).await.unwrap();
        mgr.connect().await.unwrap();

        let id = mgr.publish("orders", json!({"n": 1}), PublishOptions::default());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mgr.queue_size("orders"), 1);
        assert!(mgr.dlq_messages("orders").is_empty());
        assert!(adapter.attempts.load(Ordering::SeqCst) >= 3);
        assert!(mgr.stats().publish_failures.count() >= 3);

        adapter.failing.store(false, Ordering::SeqCst);
        assert_eq!(recv(&mut rx).await.id, id);
        assert_eq!(mgr.queue_size("orders"), 0);
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_filters_pipeline_and_isolation() {
        let mgr = manager();
        mgr.register_global_handler(Arc::new(LoggingHandler::default()), 100);
        mgr.register_handler("orders", Arc::new(ValidationHandler::new(["order_id"])), 10);
        mgr.connect().await.unwrap();

        let (us, mut us_rx) = collect("orders");
        let us = us.filters(Filters::compile([("region", json!("us-*"))]).unwrap());
        mgr.subscribe(us).await.unwrap();

        let broken = Subscription::new(
            "orders",
            callback(|_msg| async { Err(Error::Subscription("subscriber is broken".into())) }),
        );
        mgr.subscribe(broken).await.unwrap();

        mgr.publish("orders", json!({"order_id": 1, "region": "eu-west"}), PublishOptions::default());
        mgr.publish("orders", json!({"region": "us-west"}), PublishOptions::default());
        mgr.publish("orders", json!({"order_id": 3, "region": "us-east"}), PublishOptions::default());

        //only the third message passes both the filter and validation
        let got = recv(&mut us_rx).await;
        assert_eq!(got.payload["order_id"], 3);
        mgr.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(us_rx.try_recv().is_err());
        assert!(mgr.stats().delivery_failures.count() >= 1);
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let mgr = manager();
        mgr.connect().await.unwrap();
        let (sub, mut rx) = collect("orders");
        let id = mgr.subscribe(sub).await.unwrap();

        assert!(!mgr.unsubscribe("orders", "unknown").await.unwrap());
        assert!(mgr.unsubscribe("orders", &id).await.unwrap());
        assert!(!mgr.unsubscribe("orders", &id).await.unwrap());

        mgr.publish("orders", json!({}), PublishOptions::default());
        mgr.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_immediate_bypasses_queue() {
        let mgr = manager();
        assert!(matches!(
            mgr.publish_immediate("orders", json!({}), PublishOptions::default()).await,
            Err(Error::NotConnected)
        ));
        mgr.connect().await.unwrap();
        let (sub, mut rx) = collect("orders");
        mgr.subscribe(sub).await.unwrap();

        let id = mgr.publish_immediate("orders", json!({"n": 1}), PublishOptions::default()).await.unwrap();
        assert_eq!(mgr.queue_size("orders"), 0);
        assert_eq!(recv(&mut rx).await.id, id);
        let metrics = mgr.metrics();
        assert_eq!(metrics.get("memory.publish_immediate").map(|s| s.count), Some(1));
        assert!(metrics.contains_key("memory.subscription"));
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_overflow_dead_letters() {
        let mgr =
            PubSubManager::new(settings(|s| s.performance.max_queue_size = 2), Arc::new(MemoryAdapter::default()));
        for n in 0..3 {
            mgr.publish("orders", json!({ "n": n }), PublishOptions::default());
        }
        assert_eq!(mgr.queue_size("orders"), 2);
        assert_eq!(mgr.dlq_messages("orders").len(), 1);
        assert_eq!(mgr.health().dead_lettered, 1);
        assert_eq!(mgr.stats().dead_lettered.count(), 1);

        let dead = mgr.take_dlq_messages("orders");
        assert_eq!(dead[0].payload["n"], 2);
        assert!(mgr.dlq_messages("orders").is_empty());
        assert_eq!(mgr.stats().dead_lettered.count(), 0);

        mgr.clear(None);
        assert_eq!(mgr.queue_size("orders"), 0);
        assert_eq!(mgr.stats().queued.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_callback_is_retried() {
        let cfg = settings(|s| s.performance.retry_delay = Duration::from_millis(5));
        let mgr = PubSubManager::new(cfg, Arc::new(MemoryAdapter::default()));
        mgr.connect().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = Subscription::new("orders", {
            let calls = calls.clone();
            callback(move |msg| {
                let (calls, tx) = (calls.clone(), tx.clone());
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(Error::Subscription("not yet".into()));
                    }
                    let _ = tx.send(msg);
                    Ok(())
                }
            })
        });
        mgr.subscribe(sub).await.unwrap();

        let id = mgr.publish("orders", json!({}), PublishOptions::default());
        assert_eq!(recv(&mut rx).await.id, id);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(mgr.stats().retries.count(), 2);
        assert_eq!(mgr.stats().delivered.count(), 1);
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_halts_drain() {
        let mgr = manager();
        mgr.connect().await.unwrap();
        assert!(mgr.health().is_healthy());
        mgr.disconnect().await.unwrap();
        assert!(!mgr.is_connected());

        mgr.publish("orders", json!({}), PublishOptions::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mgr.queue_size("orders"), 1);
        assert!(matches!(mgr.flush().await, Err(Error::NotConnected)));

        //reconnecting resumes draining
        mgr.connect().await.unwrap();
        assert_eq!(mgr.flush().await.unwrap(), 1);
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_subscription_id_replaces_adapter_subscription() {
        let mgr = manager();
        mgr.connect().await.unwrap();
        let (first, mut first_rx) = collect("orders");
        let (second, mut second_rx) = collect("orders");
        mgr.subscribe(first.id("s1")).await.unwrap();
        mgr.subscribe(second.id("s1")).await.unwrap();
        assert_eq!(mgr.health().subscriptions, 1);

        mgr.publish("orders", json!({}), PublishOptions::default());
        recv(&mut second_rx).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(first_rx.try_recv().is_err());
        mgr.disconnect().await.unwrap();
    }

    fn failing_subscription(calls: Arc<AtomicUsize>) -> Subscription {
        Subscription::new(
            "orders",
            callback(move |_msg| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Subscription("always failing".into())) }
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_subscription_gets_its_own_retry_budget() {
        let cfg = settings(|s| {
            s.performance.max_retries = 3;
            s.performance.retry_delay = Duration::from_millis(2);
        });
        let mgr = PubSubManager::new(cfg, Arc::new(MemoryAdapter::default()));
        mgr.connect().await.unwrap();
        let (a, b) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        mgr.subscribe(failing_subscription(a.clone())).await.unwrap();
        mgr.subscribe(failing_subscription(b.clone())).await.unwrap();

        mgr.publish("orders", json!({}), PublishOptions::default());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!((a.load(Ordering::SeqCst), b.load(Ordering::SeqCst)), (4, 4));
        assert_eq!(mgr.stats().retries.count(), 6);
        assert_eq!(mgr.stats().retries_exhausted.count(), 2);
        assert_eq!(mgr.retry.pending(), 0);

        //abandoned for good once exhausted
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!((a.load(Ordering::SeqCst), b.load(Ordering::SeqCst)), (4, 4));
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_stops_the_callback() {
        let cfg = settings(|s| {
            s.performance.max_retries = 1;
            s.performance.retry_delay = Duration::from_millis(10);
        });
        let mgr = PubSubManager::new(cfg, Arc::new(MemoryAdapter::default()));
        mgr.connect().await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        mgr.subscribe(failing_subscription(calls.clone())).await.unwrap();

        mgr.publish("orders", json!({}), PublishOptions::default());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.stats().retries_exhausted.count(), 1);
        assert_eq!(mgr.stats().delivered.count(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_drain_tick_is_a_noop() {
        let adapter = Arc::new(TestAdapter { gated: true, ..Default::default() });
        let mgr = PubSubManager::new(Settings::default(), adapter.clone());
        //no background loops, ticks are driven by hand
        adapter.connect().await.unwrap();
        mgr.publish("orders", json!({}), PublishOptions::default());

        let first = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.drain_tick().await }
        });
        adapter.entered.notified().await;
        assert_eq!(mgr.drain_tick().await, None);

        adapter.gate.notify_one();
        assert_eq!(first.await.unwrap(), Some(1));
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 1);
        //the guard is released once the tick finishes
        assert_eq!(mgr.drain_tick().await, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_counts_as_breaker_failure() {
        let adapter = Arc::new(TestAdapter { stall: Some(Duration::from_secs(10)), ..Default::default() });
        let cfg = settings(|s| {
            s.performance.timeout = Duration::from_secs(1);
            s.circuit_breaker.failure_threshold = 1;
        });
        let mgr = PubSubManager::new(cfg, adapter.clone());
        mgr.connect().await.unwrap();

        let res = mgr.publish_immediate("orders", json!({}), PublishOptions::default()).await;
        assert!(matches!(res, Err(Error::Timeout(d)) if d == Duration::from_secs(1)));
        assert_eq!(mgr.circuit_state(), CircuitState::Open);
        assert_eq!(mgr.stats().publish_failures.count(), 1);

        let res = mgr.publish_immediate("orders", json!({}), PublishOptions::default()).await;
        assert!(res.unwrap_err().is_circuit_open());
        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 1);
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_metrics_are_polled() {
        let cfg = settings(|s| s.performance.metrics_interval = Duration::from_secs(30));
        let mgr = PubSubManager::new(cfg, Arc::new(MemoryAdapter::default()));
        assert!(mgr.broker_metrics().is_none());
        mgr.connect().await.unwrap();
        let (sub, _rx) = collect("orders");
        mgr.subscribe(sub).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        let snapshot = mgr.broker_metrics().unwrap();
        assert_eq!(snapshot.data["subscriptions"], 1);
        assert!(snapshot.captured_at > 0);
        mgr.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_attach_leaves_adapter_disconnected() {
        let adapter = Arc::new(TestAdapter { refuse_subscribe: AtomicBool::new(true), ..Default::default() });
        let mgr = PubSubManager::new(Settings::default(), adapter.clone());
        let (sub, mut rx) = collect("orders");
        mgr.subscribe(sub).await.unwrap();

        assert!(matches!(mgr.connect().await, Err(Error::Subscription(_))));
        assert!(!mgr.is_connected());
        assert!(mgr.tasks.lock().is_empty());

        adapter.refuse_subscribe.store(false, Ordering::SeqCst);
        mgr.connect().await.unwrap();
        let id = mgr.publish("orders", json!({}), PublishOptions::default());
        assert_eq!(recv(&mut rx).await.id, id);
        mgr.disconnect().await.unwrap();
    }
}
