//! Coordinator - single entry point for loading a manifest
//!
//! Composes the sequencer, ledger and mutation guard. One coordinator runs
//! at most one manifest; later `initialize` calls return the first outcome.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use crate::coord::types::{
    CoordinatorState, InitOptions, InitOutcome, ResourceStatus, StatusSnapshot,
};
use crate::core::cancel::CancelSignal;
use crate::core::config::CoordinatorConfig;
use crate::core::errors::{CoordError, Result};
use crate::environment::{InMemoryEnvironment, MutationGuard};
use crate::events::{EventBus, LoadEvent, LoadEventEnvelope};
use crate::ledger::{LedgerEntry, LoadLedger};
use crate::loader::{Fetcher, ResourceLoader};
use crate::manifest::Manifest;
use crate::sequencer::Sequencer;

type OutcomeRx = watch::Receiver<Option<InitOutcome>>;

enum Phase {
    Idle,
    Running(OutcomeRx),
    Done(InitOutcome),
}

pub struct Coordinator {
    config: CoordinatorConfig,
    sequencer: Arc<Sequencer>,
    ledger: Arc<LoadLedger>,
    guard: MutationGuard,
    events: Arc<EventBus>,
    phase: Arc<Mutex<Phase>>,
    state: Arc<watch::Sender<CoordinatorState>>,
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<LoadLedger> {
        &self.ledger
    }

    pub fn guard(&self) -> &MutationGuard {
        &self.guard
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Follow state transitions without polling
    pub fn watch_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Subscribe to load events from now on
    pub fn subscribe(&self) -> async_broadcast::Receiver<LoadEventEnvelope> {
        self.events.subscribe()
    }

    /// Load `manifest` once, then call `finalize` exactly once.
    ///
    /// The run is detached from the caller: dropping this future does not
    /// stop loads or skip `finalize`. On a coordinator that is already
    /// running or finished this is a no-op that returns the first outcome,
    /// and `finalize` is dropped uncalled.
    pub async fn initialize<F>(&self, manifest: &Manifest, finalize: F, options: InitOptions) -> InitOutcome
    where
        F: FnOnce() + Send + 'static,
    {
        let rx = {
            let mut phase = self.phase.lock().await;
            let joined = match &*phase {
                Phase::Done(outcome) => {
                    debug!("initialize called on a finished coordinator");
                    return outcome.clone();
                }
                Phase::Running(rx) => Some(rx.clone()),
                Phase::Idle => None,
            };
            match joined {
                Some(rx) => {
                    debug!("initialize called while running, joining existing run");
                    rx
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *phase = Phase::Running(rx.clone());
                    self.state.send_replace(CoordinatorState::Running);
                    self.spawn_run(manifest.clone(), finalize, options, tx);
                    rx
                }
            }
        };
        Self::await_outcome(rx).await
    }

    fn spawn_run<F>(
        &self,
        manifest: Manifest,
        finalize: F,
        options: InitOptions,
        tx: watch::Sender<Option<InitOutcome>>,
    ) where
        F: FnOnce() + Send + 'static,
    {
        let sequencer = self.sequencer.clone();
        let events = self.events.clone();
        let phase = self.phase.clone();
        let state = self.state.clone();
        let policy = options.policy.unwrap_or(self.config.policy);
        let cancel = options.cancel.unwrap_or_else(CancelSignal::never);

        info!(
            "Coordinator running {} resources ({})",
            manifest.len(),
            policy
        );

        tokio::spawn(async move {
            let report = sequencer.run(&manifest, policy, &cancel).await;

            let any_failed = report.results.values().any(|r| r.is_err());
            let final_state = if report.cancelled || any_failed {
                CoordinatorState::PartiallyFailed
            } else {
                CoordinatorState::Completed
            };

            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(finalize)) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!("Finalize callback panicked: {}", message);
            }

            let outcome = InitOutcome {
                state: final_state,
                results: report.results,
                cancelled: report.cancelled,
            };
            info!(
                "Coordinator finished: {:?} ({} resources, {} failed)",
                final_state,
                outcome.results.len(),
                outcome.errors().len()
            );

            *phase.lock().await = Phase::Done(outcome.clone());
            state.send_replace(final_state);
            events.emit(LoadEvent::Finalized {
                partially_failed: final_state == CoordinatorState::PartiallyFailed,
            });
            tx.send_replace(Some(outcome));
        });
    }

    async fn await_outcome(mut rx: OutcomeRx) -> InitOutcome {
        let settled = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .map(|outcome| outcome.clone());
        match settled {
            Ok(Some(outcome)) => outcome,
            _ => {
                error!("Coordinator run ended without an outcome");
                InitOutcome {
                    state: CoordinatorState::PartiallyFailed,
                    results: BTreeMap::new(),
                    cancelled: false,
                }
            }
        }
    }

    /// Every ledger entry, sorted by id
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.ledger.entries()
    }

    /// `{id -> {status, error?}}` for every resource the ledger knows
    pub fn status(&self) -> StatusSnapshot {
        self.ledger
            .entries()
            .iter()
            .map(|entry| (entry.id.clone(), ResourceStatus::from(entry)))
            .collect()
    }
}

/// Builder for Coordinator
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    guard: Option<MutationGuard>,
    ledger: Option<Arc<LoadLedger>>,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
            fetcher: None,
            guard: None,
            ledger: None,
        }
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Fetch capability used by the resource loader (required)
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Environment guard; defaults to a fresh in-memory environment
    pub fn guard(mut self, guard: MutationGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Share a ledger between coordinators. Its own retry policy applies.
    pub fn ledger(mut self, ledger: Arc<LoadLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;
        let fetcher = self
            .fetcher
            .ok_or_else(|| CoordError::configuration_field("a fetcher is required", "fetcher"))?;
        let guard = self
            .guard
            .unwrap_or_else(|| MutationGuard::new(InMemoryEnvironment::new()));
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(LoadLedger::new(self.config.on_failed_retry)));

        let events = Arc::new(EventBus::new(self.config.event_capacity));
        let loader = Arc::new(ResourceLoader::new(
            fetcher,
            guard.clone(),
            self.config.resource_timeout,
        ));
        let sequencer = Arc::new(Sequencer::new(ledger.clone(), loader, events.clone()));
        let (state, _) = watch::channel(CoordinatorState::Idle);

        Ok(Coordinator {
            config: self.config,
            sequencer,
            ledger,
            guard,
            events,
            phase: Arc::new(Mutex::new(Phase::Idle)),
            state: Arc::new(state),
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
