//! Publishes cache invalidation messages on the bus topic.

use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, error, instrument, warn};

use super::bus::BusConnection;
use super::error::{BusError, PublishError};
use super::message::{InvalidationMessage, MessageType};
use super::signals::ContentInstance;

const METRIC_SENT: &str = "quire_invalidation_sent_total";
const METRIC_FAILED: &str = "quire_invalidation_failed_total";

/// Turns cache registrations and model mutations into bus messages.
///
/// Delivery is fire-and-forget: subscribers must tolerate loss, duplication
/// and reordering.
pub struct InvalidationPublisher {
    connection: Arc<BusConnection>,
}

impl InvalidationPublisher {
    pub fn new(connection: Arc<BusConnection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<BusConnection> {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn connect(&self) -> Result<(), BusError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// `key` stays valid only while no `model` instance matching `test` changes.
    pub async fn register_test(&self, model: &str, test: &str, key: &str) -> Result<(), PublishError> {
        let message = InvalidationMessage::new(MessageType::Test, Bytes::from(test.to_string()))
            .with_key(key)
            .with_model(model);
        self.publish(message).await
    }

    /// `key` depends on `instance`.
    pub async fn register_pk(
        &self,
        instance: &dyn ContentInstance,
        key: &str,
    ) -> Result<(), PublishError> {
        let snapshot = instance.snapshot().map_err(|err| self.failed(MessageType::Pk, err.into()))?;
        let payload = snapshot
            .to_payload()
            .map_err(|err| self.failed(MessageType::Pk, err.into()))?;
        let message = InvalidationMessage::new(MessageType::Pk, payload)
            .with_key(key)
            .with_model(instance.model_label());
        self.publish(message).await
    }

    /// `src_key` depends on `obj_key`.
    pub async fn register_dependency(&self, src_key: &str, obj_key: &str) -> Result<(), PublishError> {
        let message = InvalidationMessage::new(MessageType::Dep, Bytes::new())
            .with_key(src_key)
            .with_model(obj_key);
        self.publish(message).await
    }

    /// Announce that `instance` changed.
    ///
    /// Never fails: errors are logged and counted so the triggering write
    /// goes through regardless of broker health.
    #[instrument(skip_all, fields(sender = %sender, object = %instance.object_key()))]
    pub async fn propagate_signal(&self, sender: &str, instance: &dyn ContentInstance) {
        debug!("signal from `{sender}` received");

        let payload = match instance.snapshot().and_then(|snapshot| snapshot.to_payload()) {
            Ok(payload) => payload,
            Err(err) => {
                let err = self.failed(MessageType::Del, err.into());
                error!(error = %err, "cannot serialize instance for invalidation");
                return;
            }
        };

        let message = InvalidationMessage::new(MessageType::Del, payload)
            .with_key(instance.object_key())
            .with_model(sender);
        if let Err(err) = self.publish(message).await {
            warn!(error = %err, "cannot send invalidation message");
        }
    }

    async fn publish(&self, message: InvalidationMessage) -> Result<(), PublishError> {
        if !self.connection.is_enabled() {
            return Ok(());
        }

        match self.connection.send(&message).await {
            Ok(()) => {
                counter!(METRIC_SENT, "type" => message.kind.as_str()).increment(1);
                Ok(())
            }
            Err(err) => Err(self.failed(message.kind, err.into())),
        }
    }

    fn failed(&self, kind: MessageType, err: PublishError) -> PublishError {
        counter!(
            METRIC_FAILED,
            "type" => kind.as_str(),
            "reason" => err.reason()
        )
        .increment(1);
        err
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Serialize;

    use super::*;
    use crate::invalidation::bus::MemoryBroker;
    use crate::invalidation::signals::{InstanceSnapshot, Model};

    #[derive(Serialize)]
    struct Tag {
        slug: String,
    }

    impl Model for Tag {
        const LABEL: &'static str = "tag";

        fn pk(&self) -> String {
            self.slug.clone()
        }
    }

    fn publisher(broker: &MemoryBroker) -> InvalidationPublisher {
        InvalidationPublisher::new(Arc::new(BusConnection::new(
            Arc::new(broker.clone()),
            "/topic/ella",
            Duration::from_millis(100),
            Duration::from_millis(100),
        )))
    }

    fn rust_tag() -> Tag {
        Tag {
            slug: "rust".to_string(),
        }
    }

    #[tokio::test]
    async fn register_messages_carry_expected_headers() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        publisher
            .register_test("tag", "slug=rust", "quire:GET:/tags/:aa")
            .await
            .expect("test");
        publisher
            .register_pk(&rust_tag(), "quire:GET:/tags/rust/:bb")
            .await
            .expect("pk");
        publisher
            .register_dependency("quire:GET:/:cc", "tag:rust")
            .await
            .expect("dep");

        let sent = broker.published();
        assert_eq!(sent.len(), 3);

        assert_eq!(sent[0].kind, MessageType::Test);
        assert_eq!(sent[0].model.as_deref(), Some("tag"));
        assert_eq!(sent[0].payload, Bytes::from_static(b"slug=rust"));

        assert_eq!(sent[1].kind, MessageType::Pk);
        assert_eq!(sent[1].key.as_deref(), Some("quire:GET:/tags/rust/:bb"));
        let snapshot = InstanceSnapshot::from_payload(&sent[1].payload).expect("snapshot");
        assert_eq!(snapshot.object_key(), "tag:rust");

        assert_eq!(sent[2].kind, MessageType::Dep);
        assert_eq!(sent[2].key.as_deref(), Some("quire:GET:/:cc"));
        assert_eq!(sent[2].model.as_deref(), Some("tag:rust"));
        assert!(sent[2].payload.is_empty());
    }

    #[tokio::test]
    async fn propagate_signal_sends_del_with_snapshot() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        publisher.propagate_signal("tag", &rust_tag()).await;

        let sent = broker.published_of(MessageType::Del);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key.as_deref(), Some("tag:rust"));
        assert_eq!(sent[0].model.as_deref(), Some("tag"));
        let snapshot = InstanceSnapshot::from_payload(&sent[0].payload).expect("snapshot");
        assert_eq!(snapshot.fields["slug"], "rust");
    }

    #[tokio::test]
    async fn propagate_signal_survives_broker_outage() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let publisher = publisher(&broker);

        publisher.propagate_signal("tag", &rust_tag()).await;

        assert!(broker.published().is_empty());
        assert!(publisher.register_dependency("a", "b").await.is_err());
    }

    #[tokio::test]
    async fn disabled_connection_publishes_nothing() {
        let publisher = InvalidationPublisher::new(Arc::new(BusConnection::disabled()));

        publisher.connect().await.expect("connect");
        publisher.propagate_signal("tag", &rust_tag()).await;
        publisher
            .register_dependency("a", "b")
            .await
            .expect("no-op dependency");
        assert!(!publisher.is_connected());
    }
}
