//! Load ledger
//!
//! Process-wide record of every resource id that has been requested, is in
//! flight, or has settled. `register` is the only gate through which a load
//! may start, which is what makes loads at-most-once.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::config::RetryPolicy;
use crate::core::errors::LoadError;
use crate::loader::{LoadResult, LoadedResource};

lazy_static::lazy_static! {
    static ref GLOBAL_LEDGER: Arc<LoadLedger> = Arc::new(LoadLedger::new(RetryPolicy::Never));
}

/// Lifecycle of a ledger entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStatus {
    Pending,
    InFlight,
    Loaded,
    Failed,
}

impl LoadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Loaded | Self::Failed)
    }
}

/// State of one resource id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub status: LoadStatus,
    pub result: Option<LoadedResource>,
    pub error: Option<LoadError>,
    /// Number of times a caller was granted ownership of the load
    pub attempts: u32,
}

impl LedgerEntry {
    fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: LoadStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    /// Terminal result, if the entry has settled
    pub fn outcome(&self) -> Option<LoadResult> {
        match self.status {
            LoadStatus::Loaded => self.result.clone().map(Ok),
            LoadStatus::Failed => Some(Err(self.error.clone().unwrap_or(LoadError::Loader {
                cause: "failed without a recorded cause".to_string(),
            }))),
            _ => None,
        }
    }
}

/// Answer from [`LoadLedger::register`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// The caller owns the load and must settle it with `complete` or `fail`
    Owner,
    /// Someone else owns or finished it; wait for the terminal state instead
    Existing,
}

impl Registration {
    pub fn already_in_flight_or_done(&self) -> bool {
        matches!(self, Self::Existing)
    }
}

struct LedgerSlot {
    entry: LedgerEntry,
    notify: watch::Sender<LedgerEntry>,
}

impl LedgerSlot {
    fn new(entry: LedgerEntry) -> Self {
        let (notify, _) = watch::channel(entry.clone());
        Self { entry, notify }
    }

    fn publish(&self) {
        self.notify.send_replace(self.entry.clone());
    }

    fn claim(&mut self) {
        self.entry.status = LoadStatus::InFlight;
        self.entry.attempts += 1;
        self.entry.result = None;
        self.entry.error = None;
        self.publish();
    }
}

/// At-most-once load registry
pub struct LoadLedger {
    slots: DashMap<String, LedgerSlot>,
    retry: RetryPolicy,
}

impl LoadLedger {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            slots: DashMap::new(),
            retry,
        }
    }

    /// The shared process-wide ledger (failed resources are never retried)
    pub fn global() -> Arc<LoadLedger> {
        GLOBAL_LEDGER.clone()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Record that `id` has been requested without claiming it
    pub fn request(&self, id: &str) {
        self.slots
            .entry(id.to_string())
            .or_insert_with(|| LedgerSlot::new(LedgerEntry::pending(id)));
    }

    /// Atomically claim the load of `id`.
    ///
    /// Exactly one of any number of concurrent callers receives
    /// [`Registration::Owner`].
    pub fn register(&self, id: &str) -> Registration {
        match self.slots.entry(id.to_string()) {
            Entry::Vacant(vacant) => {
                let mut slot = LedgerSlot::new(LedgerEntry::pending(id));
                slot.claim();
                vacant.insert(slot);
                debug!(resource = %id, "Claimed new resource");
                Registration::Owner
            }
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                match slot.entry.status {
                    LoadStatus::Pending => {
                        slot.claim();
                        debug!(resource = %id, "Claimed pending resource");
                        Registration::Owner
                    }
                    LoadStatus::Failed if self.retry.allows_retry(slot.entry.attempts) => {
                        slot.claim();
                        debug!(
                            resource = %id,
                            attempt = slot.entry.attempts,
                            "Re-claimed failed resource"
                        );
                        Registration::Owner
                    }
                    _ => Registration::Existing,
                }
            }
        }
    }

    /// Settle an in-flight entry as loaded. Returns false if the entry was
    /// not in flight, in which case nothing changes.
    pub fn complete(&self, id: &str, result: LoadedResource) -> bool {
        self.settle(id, |entry| {
            entry.status = LoadStatus::Loaded;
            entry.result = Some(result);
        })
    }

    /// Settle an in-flight entry as failed
    pub fn fail(&self, id: &str, error: LoadError) -> bool {
        self.settle(id, |entry| {
            entry.status = LoadStatus::Failed;
            entry.error = Some(error);
        })
    }

    fn settle(&self, id: &str, apply: impl FnOnce(&mut LedgerEntry)) -> bool {
        let Some(mut slot) = self.slots.get_mut(id) else {
            warn!(resource = %id, "Attempted to settle an unknown resource");
            return false;
        };
        if slot.entry.status != LoadStatus::InFlight {
            warn!(
                resource = %id,
                status = ?slot.entry.status,
                "Ignoring settle of a resource that is not in flight"
            );
            return false;
        }
        apply(&mut slot.entry);
        slot.publish();
        true
    }

    pub fn lookup(&self, id: &str) -> Option<LedgerEntry> {
        self.slots.get(id).map(|slot| slot.entry.clone())
    }

    /// Wait for `id` to reach a terminal state. Returns `None` for ids the
    /// ledger has never seen.
    pub async fn wait(&self, id: &str) -> Option<LoadResult> {
        let mut rx = self.slots.get(id)?.notify.subscribe();
        let entry = match rx.wait_for(|entry| entry.status.is_terminal()).await {
            Ok(entry) => entry.clone(),
            // The sender lives as long as the slot, which is never removed
            Err(_) => return None,
        };
        entry.outcome()
    }

    /// Every entry, sorted by id
    pub fn entries(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> =
            self.slots.iter().map(|slot| slot.entry.clone()).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for LoadLedger {
    fn default() -> Self {
        Self::new(RetryPolicy::Never)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loaded(id: &str) -> LoadedResource {
        LoadedResource::new(id, format!("{}.js", id))
    }

    #[test]
    fn test_register_once() {
        let ledger = LoadLedger::default();
        assert_eq!(ledger.register("x"), Registration::Owner);
        assert!(ledger.register("x").already_in_flight_or_done());
        assert_eq!(ledger.lookup("x").unwrap().status, LoadStatus::InFlight);
    }

    #[test]
    fn test_request_then_register() {
        let ledger = LoadLedger::default();
        ledger.request("x");
        assert_eq!(ledger.lookup("x").unwrap().status, LoadStatus::Pending);
        assert_eq!(ledger.register("x"), Registration::Owner);
        assert_eq!(ledger.lookup("x").unwrap().attempts, 1);
    }

    #[test]
    fn test_terminal_entries_are_immutable() {
        let ledger = LoadLedger::default();
        ledger.register("x");
        assert!(ledger.complete("x", loaded("x")));
        assert!(!ledger.fail("x", LoadError::cancelled("x")));
        assert!(!ledger.complete("x", loaded("x")));

        let entry = ledger.lookup("x").unwrap();
        assert_eq!(entry.status, LoadStatus::Loaded);
        assert!(entry.error.is_none());
    }

    #[test]
    fn test_settle_requires_in_flight() {
        let ledger = LoadLedger::default();
        ledger.request("x");
        assert!(!ledger.complete("x", loaded("x")));
        assert!(!ledger.fail("ghost", LoadError::cancelled("ghost")));
    }

    #[test]
    fn test_failed_stays_failed_by_default() {
        let ledger = LoadLedger::default();
        ledger.register("x");
        ledger.fail("x", LoadError::timeout("x", 5));
        assert_eq!(ledger.register("x"), Registration::Existing);
        assert_eq!(ledger.lookup("x").unwrap().attempts, 1);
    }

    #[test]
    fn test_retry_once() {
        let ledger = LoadLedger::new(RetryPolicy::Once);
        ledger.register("x");
        ledger.fail("x", LoadError::timeout("x", 5));

        assert_eq!(ledger.register("x"), Registration::Owner);
        let entry = ledger.lookup("x").unwrap();
        assert_eq!(entry.status, LoadStatus::InFlight);
        assert!(entry.error.is_none());

        ledger.fail("x", LoadError::timeout("x", 5));
        assert_eq!(ledger.register("x"), Registration::Existing);
    }

    #[test]
    fn test_retry_unlimited() {
        let ledger = LoadLedger::new(RetryPolicy::Unlimited);
        for _ in 0..5 {
            assert_eq!(ledger.register("x"), Registration::Owner);
            ledger.fail("x", LoadError::timeout("x", 5));
        }
        assert_eq!(ledger.lookup("x").unwrap().attempts, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_has_single_owner() {
        let ledger = Arc::new(LoadLedger::default());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.register("shared") }));
        }

        let mut owners = 0;
        for handle in handles {
            if handle.await.unwrap() == Registration::Owner {
                owners += 1;
            }
        }
        assert_eq!(owners, 1);
    }

    #[tokio::test]
    async fn test_waiters_observe_terminal_state() {
        let ledger = Arc::new(LoadLedger::default());
        ledger.register("x");

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let ledger = ledger.clone();
            waiters.push(tokio::spawn(async move { ledger.wait("x").await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        ledger.fail("x", LoadError::loader(&anyhow::anyhow!("boom")));

        for waiter in waiters {
            let outcome = waiter.await.unwrap().unwrap();
            assert_eq!(outcome.unwrap_err().to_string(), "Loader error: boom");
        }
    }

    #[tokio::test]
    async fn test_wait_unknown_id() {
        let ledger = LoadLedger::default();
        assert!(ledger.wait("ghost").await.is_none());
    }

    #[test]
    fn test_entries_sorted() {
        let ledger = LoadLedger::default();
        ledger.request("b");
        ledger.request("a");
        let ids: Vec<String> = ledger.entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
