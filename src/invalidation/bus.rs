//! Message bus connection management.
//!
//! `BusConnection` is owned by the hosting process: `main` connects it at
//! startup and disconnects it on shutdown. Without a configured broker it is
//! a no-op sink. A lost session is reopened on the next send, except during
//! the backoff window that follows a failed connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::error::BusError;
use super::message::{InvalidationMessage, MessageType};
use super::stomp::{StompConnector, StompOptions};
use crate::cache::lock::{mutex_lock, rw_read, rw_write};
use crate::config::BusSettings;

const SOURCE: &str = "invalidation::bus";

/// Quiet period after a failed connect before the next attempt.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// An open session able to publish messages.
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn send(&self, destination: &str, message: &InvalidationMessage) -> Result<(), BusError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BusError>;
}

/// A stream of messages received from a subscription.
#[async_trait]
pub trait MessageSource: Send {
    /// Next message; `Ok(None)` once the subscription has ended.
    async fn next_message(&mut self) -> Result<Option<InvalidationMessage>, BusError>;

    async fn close(&mut self) -> Result<(), BusError>;
}

/// Opens sessions against one broker.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Human-readable broker address for logs.
    fn describe(&self) -> String;

    async fn open(&self) -> Result<Arc<dyn BusTransport>, BusError>;

    async fn subscribe(&self, destination: &str) -> Result<Box<dyn MessageSource>, BusError>;
}

pub struct BusConnection {
    connector: Option<Arc<dyn BusConnector>>,
    topic: String,
    connect_timeout: Duration,
    send_timeout: Duration,
    reconnect_backoff: Duration,
    transport: RwLock<Option<Arc<dyn BusTransport>>>,
    connecting: AsyncMutex<()>,
    retry_at: Mutex<Option<Instant>>,
}

impl BusConnection {
    pub fn new(
        connector: Arc<dyn BusConnector>,
        topic: impl Into<String>,
        connect_timeout: Duration,
        send_timeout: Duration,
    ) -> Self {
        Self {
            connector: Some(connector),
            topic: topic.into(),
            connect_timeout,
            send_timeout,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            transport: RwLock::new(None),
            connecting: AsyncMutex::new(()),
            retry_at: Mutex::new(None),
        }
    }

    /// After a failed connect, fail sends immediately for `backoff`.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// A connection that accepts and drops every message.
    pub fn disabled() -> Self {
        Self {
            connector: None,
            topic: crate::config::DEFAULT_BUS_TOPIC.to_string(),
            connect_timeout: Duration::ZERO,
            send_timeout: Duration::ZERO,
            reconnect_backoff: Duration::ZERO,
            transport: RwLock::new(None),
            connecting: AsyncMutex::new(()),
            retry_at: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &BusSettings) -> Self {
        match StompOptions::from_settings(settings) {
            Some(options) => Self::new(
                Arc::new(StompConnector::new(options)),
                settings.topic.clone(),
                settings.connect_timeout,
                settings.send_timeout,
            )
            .with_reconnect_backoff(settings.reconnect_backoff),
            None => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.connector.is_some()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn connector(&self) -> Option<&Arc<dyn BusConnector>> {
        self.connector.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|transport| transport.is_open())
    }

    fn current(&self) -> Option<Arc<dyn BusTransport>> {
        rw_read(&self.transport, SOURCE, "current").clone()
    }

    /// Open a session unless one is already open. No-op when disabled.
    pub async fn connect(&self) -> Result<(), BusError> {
        self.ensure_connected().await.map(|_| ())
    }

    async fn ensure_connected(&self) -> Result<Option<Arc<dyn BusTransport>>, BusError> {
        let Some(connector) = &self.connector else {
            return Ok(None);
        };
        if let Some(transport) = self.current().filter(|t| t.is_open()) {
            return Ok(Some(transport));
        }
        self.check_backoff()?;

        let _guard = self.connecting.lock().await;
        if let Some(transport) = self.current().filter(|t| t.is_open()) {
            return Ok(Some(transport));
        }
        // Whoever held the lock before us may have just failed.
        self.check_backoff()?;

        let opened = match timeout(self.connect_timeout, connector.open()).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout {
                op: "connect",
                timeout_ms: self.connect_timeout.as_millis(),
            }),
        };
        let transport = match opened {
            Ok(transport) => transport,
            Err(err) => {
                *mutex_lock(&self.retry_at, SOURCE, "connect") =
                    Some(Instant::now() + self.reconnect_backoff);
                return Err(err);
            }
        };

        info!(
            target = "quire::invalidation::bus",
            broker = %connector.describe(),
            topic = %self.topic,
            "connected to message broker"
        );
        *mutex_lock(&self.retry_at, SOURCE, "connect") = None;
        *rw_write(&self.transport, SOURCE, "connect") = Some(Arc::clone(&transport));
        Ok(Some(transport))
    }

    fn check_backoff(&self) -> Result<(), BusError> {
        let retry_at = *mutex_lock(&self.retry_at, SOURCE, "backoff");
        match retry_at {
            Some(at) if at > Instant::now() => Err(BusError::Backoff {
                retry_in_ms: at.saturating_duration_since(Instant::now()).as_millis(),
            }),
            _ => Ok(()),
        }
    }

    /// Close the current session, if any.
    pub async fn disconnect(&self) {
        let transport = rw_write(&self.transport, SOURCE, "disconnect").take();
        if let Some(transport) = transport {
            match transport.close().await {
                Ok(()) => info!(target = "quire::invalidation::bus", "disconnected from message broker"),
                Err(err) => debug!(error = %err, "broker session closed uncleanly"),
            }
        }
    }

    /// Publish `message` on the configured topic.
    ///
    /// Waiting for another caller's connect attempt, connecting and sending
    /// together take at most the connect timeout plus the send timeout. A
    /// failed send drops the session so the next send reconnects.
    pub async fn send(&self, message: &InvalidationMessage) -> Result<(), BusError> {
        if self.connector.is_none() {
            debug!(kind = %message.kind, "no broker configured; dropping message");
            return Ok(());
        }
        let budget = self.connect_timeout + self.send_timeout;
        match timeout(budget, self.deliver(message)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout {
                op: "publish",
                timeout_ms: budget.as_millis(),
            }),
        }
    }

    async fn deliver(&self, message: &InvalidationMessage) -> Result<(), BusError> {
        let Some(transport) = self.ensure_connected().await? else {
            return Ok(());
        };

        let result = match timeout(self.send_timeout, transport.send(&self.topic, message)).await
        {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout {
                op: "send",
                timeout_ms: self.send_timeout.as_millis(),
            }),
        };

        if result.is_err() {
            let mut current = rw_write(&self.transport, SOURCE, "send");
            if current
                .as_ref()
                .is_some_and(|open| Arc::ptr_eq(open, &transport))
            {
                *current = None;
            }
        }
        result
    }
}

// ============================================================================
// In-process broker
// ============================================================================

type Envelope = (String, InvalidationMessage);

struct BrokerState {
    available: AtomicBool,
    published: Mutex<Vec<Envelope>>,
    fanout: broadcast::Sender<Envelope>,
}

/// Broker living inside the process.
///
/// Every published message is retained and fanned out to subscribers of the
/// same destination. Availability can be toggled to model an outage.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (fanout, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(BrokerState {
                available: AtomicBool::new(true),
                published: Mutex::new(Vec::new()),
                fanout,
            }),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::Acquire)
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<InvalidationMessage> {
        mutex_lock(&self.state.published, SOURCE, "published")
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn published_of(&self, kind: MessageType) -> Vec<InvalidationMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.kind == kind)
            .collect()
    }
}

struct MemoryTransport {
    state: Arc<BrokerState>,
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn send(&self, destination: &str, message: &InvalidationMessage) -> Result<(), BusError> {
        if !self.is_open() {
            return Err(BusError::send("broker unavailable"));
        }
        let envelope = (destination.to_string(), message.clone());
        mutex_lock(&self.state.published, SOURCE, "send").push(envelope.clone());
        // No subscribers is fine.
        let _ = self.state.fanout.send(envelope);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.available.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

struct MemorySubscription {
    destination: String,
    receiver: broadcast::Receiver<Envelope>,
}

#[async_trait]
impl MessageSource for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<InvalidationMessage>, BusError> {
        loop {
            match self.receiver.recv().await {
                Ok((destination, message)) if destination == self.destination => {
                    return Ok(Some(message));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "in-process subscriber fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), BusError> {
        Ok(())
    }
}

#[async_trait]
impl BusConnector for MemoryBroker {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn open(&self) -> Result<Arc<dyn BusTransport>, BusError> {
        if !self.is_available() {
            return Err(BusError::connect("memory", "broker unavailable"));
        }
        Ok(Arc::new(MemoryTransport {
            state: Arc::clone(&self.state),
        }))
    }

    async fn subscribe(&self, destination: &str) -> Result<Box<dyn MessageSource>, BusError> {
        if !self.is_available() {
            return Err(BusError::connect("memory", "broker unavailable"));
        }
        Ok(Box::new(MemorySubscription {
            destination: destination.to_string(),
            receiver: self.state.fanout.subscribe(),
        }))
    }
}
