use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::unit::{PermissionKey, StreamKey};
use crate::metrics::RunStats;

/// Accounts whose credentials were refused during this run.
#[derive(Debug, Default)]
pub struct PermissionErrorCache {
    entries: HashMap<PermissionKey, String>,
}

impl PermissionErrorCache {
    pub fn contains(&self, key: &PermissionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns true when the key was not cached yet.
    pub fn insert(&mut self, key: PermissionKey, message: String) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, message);
        true
    }

    pub fn get(&self, key: &PermissionKey) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// State shared by every unit of one run. Created per run and passed by
/// reference; nothing here outlives the run.
#[derive(Debug, Default)]
pub struct RunContext {
    permission_errors: Mutex<PermissionErrorCache>,
    failed_streams: Mutex<HashSet<StreamKey>>,
    stats: Mutex<RunStats>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_permission_denied(&self, key: &PermissionKey) -> bool {
        lock(&self.permission_errors).contains(key)
    }

    pub fn record_permission_denied(&self, key: PermissionKey, message: &str) -> bool {
        lock(&self.permission_errors).insert(key, message.to_string())
    }

    pub fn permission_error_count(&self) -> usize {
        lock(&self.permission_errors).len()
    }

    pub fn mark_stream_failed(&self, key: StreamKey) {
        lock(&self.failed_streams).insert(key);
    }

    pub fn stream_failed(&self, key: &StreamKey) -> bool {
        lock(&self.failed_streams).contains(key)
    }

    pub fn with_stats<R>(&self, f: impl FnOnce(&mut RunStats) -> R) -> R {
        let mut stats = lock(&self.stats);
        f(&mut *stats)
    }

    pub fn abort(&self, reason: &str) {
        lock(&self.stats).record_abort(reason);
    }

    pub fn abort_reason(&self) -> Option<String> {
        lock(&self.stats).aborted().map(str::to_string)
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.stats).aborted().is_some()
    }

    pub fn stats(&self) -> RunStats {
        lock(&self.stats).clone()
    }
}
