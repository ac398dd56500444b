//! Pending-fetch guards and live-subscription registries.
//!
//! Both are owned per store and carry a generation number. `reset()` bumps
//! the generation: guards and tasks created before it become inert instead of
//! leaking a "forever pending" key or writing into discarded state.

use parking_lot::Mutex;
use plebsync_core::AccountId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};

#[derive(Default)]
struct PendingState {
    generation: u64,
    keys: HashSet<(AccountId, String)>,
}

/// At most one outstanding fetch per `(account, key)`.
#[derive(Clone, Default)]
pub(crate) struct PendingFetches {
    state: Arc<Mutex<PendingState>>,
}

impl PendingFetches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `(account, key)`, or `None` if a fetch is already pending.
    pub fn try_acquire(&self, account_id: &AccountId, key: &str) -> Option<PendingGuard> {
        let mut state = self.state.lock();
        let entry = (account_id.clone(), key.to_string());
        if !state.keys.insert(entry.clone()) {
            return None;
        }
        Some(PendingGuard {
            state: self.state.clone(),
            entry,
            generation: state.generation,
        })
    }

    pub fn is_pending(&self, account_id: &AccountId, key: &str) -> bool {
        self.state
            .lock()
            .keys
            .contains(&(account_id.clone(), key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.state.lock().keys.len()
    }

    /// Forget every pending key. Outstanding guards become stale.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.keys.clear();
        state.generation += 1;
    }
}

/// Releases its key on drop, on every exit path of the fetch.
pub(crate) struct PendingGuard {
    state: Arc<Mutex<PendingState>>,
    entry: (AccountId, String),
    generation: u64,
}

impl PendingGuard {
    /// Whether a reset happened since the guard was acquired.
    pub fn is_stale(&self) -> bool {
        self.state.lock().generation != self.generation
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.generation == self.generation {
            state.keys.remove(&self.entry);
        }
    }
}

/// Background tasks following live entities, by key.
#[derive(Default)]
pub(crate) struct LiveSubscriptions {
    tasks: Mutex<HashMap<String, AbortHandle>>,
    generation: AtomicU64,
}

impl LiveSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether a task started at `generation` is still current.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tasks.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Start the task for `key` unless one is already running. `spawn`
    /// receives the current generation. Returns the handle of the started
    /// task.
    pub fn start<F>(&self, key: &str, spawn: F) -> Option<AbortHandle>
    where
        F: FnOnce(u64) -> JoinHandle<()>,
    {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(key) {
            return None;
        }
        let handle = spawn(self.generation()).abort_handle();
        tasks.insert(key.to_string(), handle.clone());
        Some(handle)
    }

    /// Forget a finished task.
    pub fn remove(&self, key: &str) {
        self.tasks.lock().remove(key);
    }

    /// Stop the tasks whose key starts with `prefix`.
    pub fn stop_prefix(&self, prefix: &str) {
        let stopped: Vec<AbortHandle> = {
            let mut tasks = self.tasks.lock();
            let keys: Vec<String> = tasks
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();
            keys.iter().filter_map(|key| tasks.remove(key)).collect()
        };
        // Aborted tasks may touch the registry while they are dropped.
        for handle in stopped {
            handle.abort();
        }
    }

    /// Stop every task and invalidate the current generation.
    pub fn stop_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let stopped: Vec<AbortHandle> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        for handle in stopped {
            handle.abort();
        }
    }
}

impl Drop for LiveSubscriptions {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.get_mut().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let pending = PendingFetches::new();
        let account = AccountId::from("a");

        let guard = pending.try_acquire(&account, "QmA").unwrap();
        assert!(pending.try_acquire(&account, "QmA").is_none());
        assert!(pending.try_acquire(&AccountId::from("b"), "QmA").is_some());

        drop(guard);
        assert!(!pending.is_pending(&account, "QmA"));
    }

    #[test]
    fn test_stale_guard_does_not_release_new_claim() {
        let pending = PendingFetches::new();
        let account = AccountId::from("a");

        let stale = pending.try_acquire(&account, "QmA").unwrap();
        pending.reset();
        assert!(stale.is_stale());

        let fresh = pending.try_acquire(&account, "QmA").unwrap();
        drop(stale);
        assert!(pending.is_pending(&account, "QmA"));
        drop(fresh);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_live_subscriptions_start_once() {
        let live = LiveSubscriptions::new();
        let spawn = |_: u64| tokio::spawn(futures::future::pending::<()>());

        assert!(live.start("a/0", spawn).is_some());
        assert!(live.start("a/0", spawn).is_none());
        assert!(live.start("b/0", spawn).is_some());

        live.stop_prefix("a/");
        assert!(!live.contains("a/0"));
        assert!(live.contains("b/0"));

        let generation = live.generation();
        live.stop_all();
        assert!(!live.is_current(generation));
        assert_eq!(live.len(), 0);
    }
}
