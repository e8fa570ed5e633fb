//! Applies invalidation messages to a response store.
//!
//! The consumer keeps two indexes built from registration messages:
//! dependency edges (`object -> keys`) from `pk` and `dep`, and predicate
//! registrations (`model -> (predicate, key)`) from `test`. A `del` evicts
//! the transitive closure of the changed object plus every key whose
//! predicate matches the changed instance.
//!
//! Registrations older than the retention window are swept, so pages that
//! expired without ever being invalidated do not accumulate.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::bus::BusConnector;
use super::error::BusError;
use super::message::{InvalidationMessage, MessageType};
use super::signals::InstanceSnapshot;
use crate::cache::CacheBackend;
use crate::cache::lock::mutex_lock;

const METRIC_EVICTED: &str = "quire_invalidation_evicted_total";
const METRIC_RECEIVED: &str = "quire_invalidation_received_total";
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const SOURCE: &str = "invalidation::consumer";

/// How long a page's registrations are kept without being renewed.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// `field=value` clauses joined by `&`; empty matches every instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestPredicate {
    clauses: Vec<(String, String)>,
}

impl TestPredicate {
    pub fn parse(raw: &str) -> Self {
        let clauses = raw
            .split('&')
            .filter(|clause| !clause.trim().is_empty())
            .map(|clause| match clause.split_once('=') {
                Some((field, value)) => (field.trim().to_string(), value.trim().to_string()),
                None => (clause.trim().to_string(), String::new()),
            })
            .collect();
        Self { clauses }
    }

    pub fn matches(&self, snapshot: &InstanceSnapshot) -> bool {
        self.clauses.iter().all(|(field, expected)| {
            match snapshot.fields.get(field) {
                Some(serde_json::Value::String(actual)) => actual == expected,
                Some(serde_json::Value::Null) | None => false,
                Some(other) => other.to_string() == *expected,
            }
        })
    }
}

pub struct InvalidationConsumer {
    backend: CacheBackend,
    dependents: DashMap<String, HashSet<String>>,
    tests: DashMap<String, HashSet<(TestPredicate, String)>>,
    /// Last registration seen for each dependent page key.
    registered: DashMap<String, Instant>,
    retention: Duration,
    last_sweep: Mutex<Instant>,
}

impl InvalidationConsumer {
    pub fn new(backend: CacheBackend) -> Self {
        Self {
            backend,
            dependents: DashMap::new(),
            tests: DashMap::new(),
            registered: DashMap::new(),
            retention: DEFAULT_RETENTION,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Forget registrations not renewed within `retention`.
    ///
    /// Pages cached for longer than this are no longer evicted by messages
    /// and expire by TTL only.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Number of tracked dependency edges.
    pub fn edge_count(&self) -> usize {
        self.dependents.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn test_count(&self) -> usize {
        self.tests.iter().map(|entry| entry.value().len()).sum()
    }

    /// Apply one message; returns how many stored entries were evicted.
    ///
    /// Applying the same message again leaves the store unchanged.
    #[instrument(skip_all, fields(kind = %message.kind))]
    pub async fn apply(&self, message: &InvalidationMessage) -> usize {
        counter!(METRIC_RECEIVED, "type" => message.kind.as_str()).increment(1);
        self.sweep_if_due();

        match message.kind {
            MessageType::Dep => {
                match (&message.key, &message.model) {
                    (Some(src_key), Some(obj_key)) => self.add_edge(obj_key, src_key),
                    _ => warn!("dep message without Key and Model headers"),
                }
                0
            }
            MessageType::Pk => {
                let Some(key) = &message.key else {
                    warn!("pk message without Key header");
                    return 0;
                };
                match InstanceSnapshot::from_payload(&message.payload) {
                    Ok(snapshot) => self.add_edge(&snapshot.object_key(), key),
                    Err(err) => warn!(error = %err, "pk message with unreadable snapshot"),
                }
                0
            }
            MessageType::Test => {
                let (Some(key), Some(model)) = (&message.key, &message.model) else {
                    warn!("test message without Key and Model headers");
                    return 0;
                };
                let predicate = TestPredicate::parse(&String::from_utf8_lossy(&message.payload));
                self.tests
                    .entry(model.clone())
                    .or_default()
                    .insert((predicate, key.clone()));
                self.registered.insert(key.clone(), Instant::now());
                0
            }
            MessageType::Del => self.invalidate(message).await,
        }
    }

    fn add_edge(&self, object: &str, dependent: &str) {
        self.dependents
            .entry(object.to_string())
            .or_default()
            .insert(dependent.to_string());
        self.registered.insert(dependent.to_string(), Instant::now());
    }

    fn sweep_if_due(&self) {
        let now = Instant::now();
        {
            let mut last = mutex_lock(&self.last_sweep, SOURCE, "sweep");
            if now.saturating_duration_since(*last) < self.retention / 4 {
                return;
            }
            *last = now;
        }
        self.sweep(now);
    }

    /// Drop every registration of pages not renewed within the retention
    /// window; returns how many page keys were forgotten.
    pub fn sweep(&self, now: Instant) -> usize {
        let stale: HashSet<String> = self
            .registered
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.value()) >= self.retention)
            .map(|entry| entry.key().clone())
            .collect();
        if stale.is_empty() {
            return 0;
        }

        for key in &stale {
            self.registered.remove(key);
        }
        self.dependents.retain(|_, dependents| {
            dependents.retain(|key| !stale.contains(key));
            !dependents.is_empty()
        });
        self.tests.retain(|_, registered| {
            registered.retain(|(_, key)| !stale.contains(key));
            !registered.is_empty()
        });

        debug!(forgotten = stale.len(), "swept stale registrations");
        stale.len()
    }

    async fn invalidate(&self, message: &InvalidationMessage) -> usize {
        let snapshot = match InstanceSnapshot::from_payload(&message.payload) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                debug!(error = %err, "del message without readable snapshot");
                None
            }
        };

        let object = message
            .key
            .clone()
            .or_else(|| snapshot.as_ref().map(InstanceSnapshot::object_key));
        let model = message
            .model
            .clone()
            .or_else(|| snapshot.as_ref().map(|s| s.model.clone()));

        let mut roots: Vec<String> = Vec::new();
        if let Some(object) = &object {
            roots.push(object.clone());
        }
        let mut keys = self.matching_test_keys(model.as_deref(), snapshot.as_ref());
        roots.extend(keys.iter().cloned());

        keys.extend(self.dependents_closure(roots));
        if let Some(object) = &object {
            keys.remove(object);
        }

        let mut evicted = 0;
        for key in &keys {
            if self.backend.evict(key).await {
                evicted += 1;
            }
        }

        if evicted > 0 {
            counter!(METRIC_EVICTED).increment(evicted as u64);
        }
        debug!(
            object = object.as_deref().unwrap_or("-"),
            candidates = keys.len(),
            evicted,
            "applied invalidation"
        );
        evicted
    }

    fn matching_test_keys(
        &self,
        model: Option<&str>,
        snapshot: Option<&InstanceSnapshot>,
    ) -> HashSet<String> {
        let (Some(model), Some(snapshot)) = (model, snapshot) else {
            return HashSet::new();
        };
        let Some(mut registered) = self.tests.get_mut(model) else {
            return HashSet::new();
        };

        let matched: Vec<(TestPredicate, String)> = registered
            .iter()
            .filter(|(predicate, _)| predicate.matches(snapshot))
            .cloned()
            .collect();
        for entry in &matched {
            registered.remove(entry);
        }
        matched.into_iter().map(|(_, key)| key).collect()
    }

    /// Every key reachable from `roots` through dependency edges. Visited
    /// edges are dropped; rebuilt pages register them again.
    fn dependents_closure(&self, roots: Vec<String>) -> HashSet<String> {
        let mut reached = HashSet::new();
        let mut queue: VecDeque<String> = roots.into();
        while let Some(node) = queue.pop_front() {
            let Some((_, dependents)) = self.dependents.remove(&node) else {
                continue;
            };
            for dependent in dependents {
                if reached.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        reached
    }

    /// Apply messages from `connector`'s subscription to `destination` until
    /// `shutdown` resolves, resubscribing with backoff when the session drops.
    pub async fn run<S>(
        self: Arc<Self>,
        connector: Arc<dyn BusConnector>,
        destination: String,
        shutdown: S,
    ) where
        S: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut delay = Duration::from_millis(500);

        loop {
            let session = tokio::select! {
                _ = &mut shutdown => return,
                result = self.consume(connector.as_ref(), &destination) => result,
            };

            match session {
                Ok(()) => {
                    info!(broker = %connector.describe(), "subscription ended");
                    delay = Duration::from_millis(500);
                }
                Err(err) => {
                    warn!(
                        broker = %connector.describe(),
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "subscription failed"
                    );
                }
            }

            tokio::select! {
                _ = &mut shutdown => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    async fn consume(&self, connector: &dyn BusConnector, destination: &str) -> Result<(), BusError> {
        let mut source = connector.subscribe(destination).await?;
        info!(broker = %connector.describe(), destination, "subscribed to invalidation topic");
        while let Some(message) = source.next_message().await? {
            self.apply(&message).await;
        }
        let _ = source.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::cache::{MemoryStore, ResponseStore};
    use crate::invalidation::bus::{BusConnection, MemoryBroker};

    fn snapshot(model: &str, pk: &str, fields: serde_json::Value) -> InstanceSnapshot {
        InstanceSnapshot {
            model: model.to_string(),
            pk: pk.to_string(),
            fields,
        }
    }

    fn del(snapshot: &InstanceSnapshot) -> InvalidationMessage {
        InvalidationMessage::new(MessageType::Del, snapshot.to_payload().expect("payload"))
            .with_key(snapshot.object_key())
            .with_model(snapshot.model.clone())
    }

    fn dep(src: &str, obj: &str) -> InvalidationMessage {
        InvalidationMessage::new(MessageType::Dep, Bytes::new())
            .with_key(src)
            .with_model(obj)
    }

    async fn seeded(keys: &[&str]) -> (Arc<MemoryStore>, InvalidationConsumer) {
        let store = Arc::new(MemoryStore::new(NonZeroUsize::new(64).expect("non-zero")));
        for key in keys {
            store
                .set(key, Bytes::from_static(b"page"), Duration::from_secs(60))
                .await
                .expect("seed");
        }
        let backend = CacheBackend::new(store.clone(), Duration::from_millis(100));
        (store, InvalidationConsumer::new(backend))
    }

    async fn present(store: &MemoryStore, key: &str) -> bool {
        store.get(key).await.expect("get").is_some()
    }

    #[test]
    fn predicates_compare_fields_as_text() {
        let article = snapshot("article", "1", json!({"id": 1, "published": true, "section": "news"}));

        assert!(TestPredicate::parse("").matches(&article));
        assert!(TestPredicate::parse("section=news").matches(&article));
        assert!(TestPredicate::parse("section=news&published=true").matches(&article));
        assert!(TestPredicate::parse("id=1").matches(&article));
        assert!(!TestPredicate::parse("section=sport").matches(&article));
        assert!(!TestPredicate::parse("missing=x").matches(&article));
    }

    #[tokio::test]
    async fn del_evicts_direct_and_transitive_dependents() {
        let (store, consumer) = seeded(&["page:detail", "page:home", "page:unrelated"]).await;
        let article = snapshot("article", "1", json!({"id": 1}));

        consumer
            .apply(
                &InvalidationMessage::new(MessageType::Pk, article.to_payload().expect("payload"))
                    .with_key("page:detail")
                    .with_model("article"),
            )
            .await;
        consumer.apply(&dep("page:home", "page:detail")).await;

        assert_eq!(consumer.apply(&del(&article)).await, 2);
        assert!(!present(&store, "page:detail").await);
        assert!(!present(&store, "page:home").await);
        assert!(present(&store, "page:unrelated").await);
    }

    #[tokio::test]
    async fn del_evicts_keys_with_matching_predicates() {
        let (store, consumer) = seeded(&["page:news", "page:sport"]).await;
        for (key, test) in [("page:news", "section=news"), ("page:sport", "section=sport")] {
            consumer
                .apply(
                    &InvalidationMessage::new(MessageType::Test, Bytes::from(test))
                        .with_key(key)
                        .with_model("article"),
                )
                .await;
        }

        let article = snapshot("article", "9", json!({"section": "news"}));
        assert_eq!(consumer.apply(&del(&article)).await, 1);
        assert!(!present(&store, "page:news").await);
        assert!(present(&store, "page:sport").await);
        assert_eq!(consumer.test_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_messages_are_idempotent() {
        let (store, consumer) = seeded(&["page:a", "page:b"]).await;
        let article = snapshot("article", "1", json!({}));

        consumer.apply(&dep("page:a", "article:1")).await;
        consumer.apply(&dep("page:a", "article:1")).await;
        assert_eq!(consumer.edge_count(), 1);

        assert_eq!(consumer.apply(&del(&article)).await, 1);
        assert_eq!(consumer.apply(&del(&article)).await, 0);

        assert!(!present(&store, "page:a").await);
        assert!(present(&store, "page:b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn registrations_not_renewed_within_retention_are_swept() {
        let (_, consumer) = seeded(&[]).await;
        let consumer = consumer.with_retention(Duration::from_secs(60));
        consumer.apply(&dep("page:old", "article:1")).await;
        consumer
            .apply(
                &InvalidationMessage::new(MessageType::Test, Bytes::from_static(b"section=news"))
                    .with_key("page:old")
                    .with_model("article"),
            )
            .await;

        tokio::time::advance(Duration::from_secs(45)).await;
        consumer.apply(&dep("page:fresh", "article:1")).await;
        assert_eq!(consumer.edge_count(), 2);
        assert_eq!(consumer.test_count(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        consumer.apply(&dep("page:fresh", "article:2")).await;
        assert_eq!(consumer.edge_count(), 2);
        assert_eq!(consumer.test_count(), 0);

        assert_eq!(consumer.sweep(Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(consumer.sweep(Instant::now()), 1);
        assert_eq!(consumer.edge_count(), 0);
    }

    #[tokio::test]
    async fn dependency_cycles_terminate() {
        let (store, consumer) = seeded(&["page:a", "page:b"]).await;
        consumer.apply(&dep("page:a", "article:1")).await;
        consumer.apply(&dep("page:b", "page:a")).await;
        consumer.apply(&dep("page:a", "page:b")).await;

        assert_eq!(consumer.apply(&del(&snapshot("article", "1", json!({})))).await, 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn malformed_registrations_are_ignored() {
        let (_, consumer) = seeded(&[]).await;

        consumer
            .apply(&InvalidationMessage::new(MessageType::Dep, Bytes::new()).with_key("k"))
            .await;
        consumer
            .apply(
                &InvalidationMessage::new(MessageType::Pk, Bytes::from_static(b"not json"))
                    .with_key("k"),
            )
            .await;

        assert_eq!(consumer.edge_count(), 0);
    }

    #[tokio::test]
    async fn run_applies_bus_messages_until_shutdown() {
        let (store, consumer) = seeded(&["page:a"]).await;
        let consumer = Arc::new(consumer);
        let broker = MemoryBroker::new();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(Arc::clone(&consumer).run(
            Arc::new(broker.clone()),
            "/topic/ella".to_string(),
            async move {
                let _ = stopped.await;
            },
        ));

        let connection = BusConnection::new(
            Arc::new(broker.clone()),
            "/topic/ella",
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        let article = snapshot("article", "1", json!({}));

        // The subscription is opened asynchronously; resend until it lands.
        for _ in 0..50 {
            connection.send(&dep("page:a", "article:1")).await.expect("send");
            if consumer.edge_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        connection.send(&del(&article)).await.expect("send");

        for _ in 0..50 {
            if !present(&store, "page:a").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!present(&store, "page:a").await);

        stop.send(()).expect("stop");
        task.await.expect("consumer task");
    }
}
