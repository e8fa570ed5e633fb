//! Persistence lifecycle signals.
//!
//! Repositories emit a [`MutationSignal`] around every write. Subscribers
//! register per phase through [`SignalBus::on_mutation`]; the invalidation
//! publisher is wired in by [`register_signal_hooks`].

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::publisher::InvalidationPublisher;
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "invalidation::signals";

/// Object key of one instance, `"{label}:{pk}"`.
pub fn object_key(label: &str, pk: &str) -> String {
    format!("{label}:{pk}")
}

/// A persisted content type whose changes invalidate cached pages.
pub trait Model: Serialize + Send + Sync + 'static {
    /// Stable label used in bus messages, e.g. `article`.
    const LABEL: &'static str;

    fn pk(&self) -> String;
}

/// Object-safe view of any [`Model`] instance.
pub trait ContentInstance: Send + Sync {
    fn model_label(&self) -> &'static str;

    fn primary_key(&self) -> String;

    fn snapshot(&self) -> Result<InstanceSnapshot, serde_json::Error>;

    fn object_key(&self) -> String {
        object_key(self.model_label(), &self.primary_key())
    }
}

impl<M: Model> ContentInstance for M {
    fn model_label(&self) -> &'static str {
        M::LABEL
    }

    fn primary_key(&self) -> String {
        self.pk()
    }

    fn snapshot(&self) -> Result<InstanceSnapshot, serde_json::Error> {
        Ok(InstanceSnapshot {
            model: M::LABEL.to_string(),
            pk: self.pk(),
            fields: serde_json::to_value(self)?,
        })
    }
}

/// Serialized instance carried by `pk` and `del` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub model: String,
    pub pk: String,
    pub fields: serde_json::Value,
}

impl InstanceSnapshot {
    pub fn object_key(&self) -> String {
        object_key(&self.model, &self.pk)
    }

    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationPhase {
    PreSave,
    PostSave,
    PostDelete,
}

impl MutationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationPhase::PreSave => "pre_save",
            MutationPhase::PostSave => "post_save",
            MutationPhase::PostDelete => "post_delete",
        }
    }
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct MutationSignal {
    pub phase: MutationPhase,
    pub sender: &'static str,
    pub instance: Arc<dyn ContentInstance>,
}

type Handler = Arc<dyn Fn(MutationSignal) -> BoxFuture<'static, ()> + Send + Sync>;

/// Dispatches mutation signals to the handlers registered for each phase.
#[derive(Default)]
pub struct SignalBus {
    handlers: RwLock<Vec<(MutationPhase, Handler)>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_mutation<F, Fut>(&self, phase: MutationPhase, callback: F)
    where
        F: Fn(MutationSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |signal| -> BoxFuture<'static, ()> { Box::pin(callback(signal)) });
        rw_write(&self.handlers, SOURCE, "on_mutation").push((phase, handler));
    }

    /// Run every handler registered for `phase`, in registration order.
    pub async fn emit(
        &self,
        phase: MutationPhase,
        sender: &'static str,
        instance: Arc<dyn ContentInstance>,
    ) {
        let handlers: Vec<Handler> = rw_read(&self.handlers, SOURCE, "emit")
            .iter()
            .filter(|(registered, _)| *registered == phase)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        debug!(%phase, sender, handlers = handlers.len(), "emitting mutation signal");

        for handler in handlers {
            handler(MutationSignal {
                phase,
                sender,
                instance: Arc::clone(&instance),
            })
            .await;
        }
    }
}

/// Subscribe `publisher` to post-save and post-delete, and to pre-save when
/// invalidating before commit.
pub fn register_signal_hooks(
    signals: &SignalBus,
    publisher: Arc<InvalidationPublisher>,
    invalidate_before_commit: bool,
) {
    let mut phases = vec![MutationPhase::PostSave, MutationPhase::PostDelete];
    if invalidate_before_commit {
        phases.insert(0, MutationPhase::PreSave);
    }

    for phase in phases {
        let publisher = Arc::clone(&publisher);
        signals.on_mutation(phase, move |signal| {
            let publisher = Arc::clone(&publisher);
            async move {
                publisher
                    .propagate_signal(signal.sender, signal.instance.as_ref())
                    .await;
            }
        });
    }
}
