//! Types exposed by the coordinator

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::cancel::CancelSignal;
use crate::core::config::ConcurrencyPolicy;
use crate::core::errors::LoadError;
use crate::ledger::{LedgerEntry, LoadStatus};
use crate::loader::LoadResult;

/// Externally visible coordinator state. `Completed` and `PartiallyFailed`
/// are sticky.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorState {
    Idle,
    Running,
    Completed,
    PartiallyFailed,
}

impl CoordinatorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed)
    }
}

/// Per-call options for [`Coordinator::initialize`](crate::coord::Coordinator::initialize)
#[derive(Clone, Debug, Default)]
pub struct InitOptions {
    /// Overrides the configured policy for this run
    pub policy: Option<ConcurrencyPolicy>,
    pub cancel: Option<CancelSignal>,
}

impl InitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Settled result of an initialize call
#[derive(Clone, Debug, Serialize)]
pub struct InitOutcome {
    pub state: CoordinatorState,
    pub results: BTreeMap<String, LoadResult>,
    pub cancelled: bool,
}

impl InitOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == CoordinatorState::Completed
    }

    /// Per-resource errors, keyed by id
    pub fn errors(&self) -> BTreeMap<&str, &LoadError> {
        self.results
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id.as_str(), e)))
            .collect()
    }
}

/// One row of the status snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub status: LoadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LoadError>,
}

impl From<&LedgerEntry> for ResourceStatus {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            status: entry.status,
            error: entry.error.clone(),
        }
    }
}

/// Read-only view `{id -> {status, error?}}` for diagnostic consumers
pub type StatusSnapshot = BTreeMap<String, ResourceStatus>;
