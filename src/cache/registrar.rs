//! Background registration of page dependencies.
//!
//! Storing a page queues its dependencies here; a single worker task turns
//! them into `pk`, `dep` and `test` messages. The response never waits for
//! the broker.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::deps::Dependencies;
use crate::invalidation::InvalidationPublisher;

const QUEUE_CAPACITY: usize = 1024;
/// Upper bound for publishing the dependencies of one page.
const PAGE_BUDGET: Duration = Duration::from_secs(5);
const METRIC_DROPPED: &str = "quire_cache_registration_dropped_total";

enum Job {
    Register { key: String, deps: Dependencies },
    Flush(oneshot::Sender<()>),
}

/// Handle to the registration worker. Cloning shares the same queue.
#[derive(Clone)]
pub struct DependencyRegistrar {
    jobs: mpsc::Sender<Job>,
}

impl DependencyRegistrar {
    /// Start the worker on the current Tokio runtime.
    ///
    /// The worker stops once every handle has been dropped.
    pub fn spawn(publisher: Arc<InvalidationPublisher>) -> Self {
        let (jobs, queue) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(run(publisher, queue));
        Self { jobs }
    }

    /// Queue the dependencies of the page stored under `key`.
    ///
    /// Drops the registration when the queue is full; the page then only
    /// expires by TTL.
    pub fn submit(&self, key: &str, deps: Dependencies) {
        if deps.is_empty() {
            return;
        }
        let job = Job::Register {
            key: key.to_string(),
            deps,
        };
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(METRIC_DROPPED).increment(1);
                warn!(key, "dependency registration queue is full; dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(key, "dependency registrar stopped; dropping");
            }
        }
    }

    /// Wait until everything submitted before this call has been published
    /// or given up on.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.jobs.send(Job::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}

async fn run(publisher: Arc<InvalidationPublisher>, mut queue: mpsc::Receiver<Job>) {
    while let Some(job) = queue.recv().await {
        match job {
            Job::Register { key, deps } => {
                let publish = register_dependencies(&publisher, &key, &deps);
                if timeout(PAGE_BUDGET, publish).await.is_err() {
                    warn!(
                        key = %key,
                        budget_ms = PAGE_BUDGET.as_millis() as u64,
                        "dependency registration abandoned"
                    );
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("dependency registrar stopped");
}

async fn register_dependencies(publisher: &InvalidationPublisher, key: &str, deps: &Dependencies) {
    for instance in &deps.instances {
        if let Err(err) = publisher.register_pk(instance.as_ref(), key).await {
            debug!(key, error = %err, "instance registration dropped");
        }
    }
    for object in &deps.objects {
        if let Err(err) = publisher.register_dependency(key, object).await {
            debug!(key, object = %object, error = %err, "dependency registration dropped");
        }
    }
    for (model, test) in &deps.tests {
        if let Err(err) = publisher.register_test(model, test, key).await {
            debug!(key, model = %model, error = %err, "test registration dropped");
        }
    }
}
