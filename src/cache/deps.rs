//! Per-request dependency collector.
//!
//! Handlers describe what a response was rendered from while it renders:
//! single instances ([`record_instance`]), bare object or page keys
//! ([`record`]) and model predicates ([`record_test`]). The cache middleware
//! runs the inner service inside [`with_collector`] and, once the page is
//! stored, registers each dependency on the bus so the page is evicted when
//! any of them changes.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use super::lock::mutex_lock;
use crate::invalidation::ContentInstance;

const SOURCE: &str = "cache::deps";

/// Everything one response depends on.
#[derive(Clone, Default)]
pub struct Dependencies {
    /// Instances rendered into the page; registered as `pk` messages.
    pub instances: Vec<Arc<dyn ContentInstance>>,
    /// Object or page keys; registered as `dep` messages.
    pub objects: BTreeSet<String>,
    /// `(model, predicate)` pairs; registered as `test` messages.
    pub tests: BTreeSet<(String, String)>,
}

impl Dependencies {
    pub fn len(&self) -> usize {
        self.instances.len() + self.objects.len() + self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

tokio::task_local! {
    static DEPS: Arc<Mutex<Dependencies>>;
}

fn with_current(op: &'static str, f: impl FnOnce(&mut Dependencies)) {
    let _ = DEPS.try_with(|deps| f(&mut mutex_lock(deps, SOURCE, op)));
}

/// Record that the current response depends on `object_key`.
///
/// Ignored when no collector is active.
pub fn record(object_key: impl Into<String>) {
    let object_key = object_key.into();
    with_current("record", |deps| {
        deps.objects.insert(object_key);
    });
}

/// Record that the current response renders `instance`.
pub fn record_instance(instance: Arc<dyn ContentInstance>) {
    with_current("record_instance", |deps| {
        let key = instance.object_key();
        if !deps
            .instances
            .iter()
            .any(|known| known.object_key() == key)
        {
            deps.instances.push(instance);
        }
    });
}

/// Record that the current response lists every `model` instance matching
/// `predicate` (`field=value` clauses joined by `&`).
pub fn record_test(model: impl Into<String>, predicate: impl Into<String>) {
    let entry = (model.into(), predicate.into());
    with_current("record_test", |deps| {
        deps.tests.insert(entry);
    });
}

/// Run `f` with a fresh collector; returns its output and what it recorded.
pub async fn with_collector<F, R>(f: F) -> (R, Dependencies)
where
    F: Future<Output = R>,
{
    let deps: Arc<Mutex<Dependencies>> = Arc::default();
    let result = DEPS.scope(Arc::clone(&deps), f).await;
    let collected = mutex_lock(&deps, SOURCE, "collect").clone();
    (result, collected)
}
