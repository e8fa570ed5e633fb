//! Poison-tolerant access to shared cache state.
//!
//! A panic while a guard is held must not take the serving path down with
//! it, so every accessor recovers the inner value and reports the event.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn report_poisoned(source: &'static str, op: &'static str, lock_kind: &'static str) {
    warn!(
        op,
        target_module = source,
        lock_kind,
        result = "poisoned_recovered",
        hint = "state may be stale after panic in another task",
        "Recovered from poisoned cache lock"
    );
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    source: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        report_poisoned(source, op, "mutex.lock");
        poisoned.into_inner()
    })
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        report_poisoned(source, op, "rwlock.read");
        poisoned.into_inner()
    })
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        report_poisoned(source, op, "rwlock.write");
        poisoned.into_inner()
    })
}
