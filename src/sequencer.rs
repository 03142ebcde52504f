//! Stage sequencer
//!
//! Runs a manifest stage by stage. A stage starts only after the previous
//! one has fully settled. Inside a stage a single dispatcher admits each
//! resource once its same-stage dependencies have settled, then hands out
//! load slots in queue order under the concurrency policy.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::core::cancel::CancelSignal;
use crate::core::config::ConcurrencyPolicy;
use crate::core::errors::LoadError;
use crate::events::{EventBus, LoadEvent};
use crate::ledger::{LoadLedger, LoadStatus, Registration};
use crate::loader::{LoadResult, ResourceLoader};
use crate::manifest::{Manifest, ResourceDescriptor};

/// Result of a sequencer run
#[derive(Clone, Debug)]
pub struct SequencerReport {
    pub results: BTreeMap<String, LoadResult>,
    /// Cancellation was requested at some point during the run
    pub cancelled: bool,
}

impl SequencerReport {
    pub fn failed(&self) -> impl Iterator<Item = (&str, &LoadError)> {
        self.results
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id.as_str(), e)))
    }
}

pub struct Sequencer {
    ledger: Arc<LoadLedger>,
    loader: Arc<ResourceLoader>,
    events: Arc<EventBus>,
}

impl Sequencer {
    pub fn new(ledger: Arc<LoadLedger>, loader: Arc<ResourceLoader>, events: Arc<EventBus>) -> Self {
        Self {
            ledger,
            loader,
            events,
        }
    }

    pub fn ledger(&self) -> &Arc<LoadLedger> {
        &self.ledger
    }

    /// Load every resource of `manifest`, stage by stage
    pub async fn run(
        &self,
        manifest: &Manifest,
        policy: ConcurrencyPolicy,
        cancel: &CancelSignal,
    ) -> SequencerReport {
        for id in manifest.ids() {
            self.ledger.request(id);
        }

        let mut results: BTreeMap<String, LoadResult> = BTreeMap::new();
        let mut cancelled = false;

        for (stage, members) in manifest.stages() {
            if cancel.is_cancelled() {
                if !cancelled {
                    info!("Cancellation requested, skipping stage {} onwards", stage);
                }
                cancelled = true;
                self.events.emit(LoadEvent::Cancelled { stage });
                for res in members {
                    results.insert(res.id.clone(), Err(LoadError::cancelled(&res.id)));
                }
                continue;
            }

            info!(
                "Starting stage {} with {} resources ({})",
                stage,
                members.len(),
                policy
            );
            self.events.emit(LoadEvent::StageStarted {
                stage,
                resources: members.iter().map(|r| r.id.clone()).collect(),
            });

            let settled = self.run_stage(stage, members, &results, policy, cancel).await;
            let failed = settled.values().filter(|r| r.is_err()).count();

            info!("Stage {} settled ({} failed)", stage, failed);
            self.events.emit(LoadEvent::StageSettled { stage, failed });
            results.extend(settled);
        }

        SequencerReport {
            results,
            cancelled: cancelled || cancel.is_cancelled(),
        }
    }

    async fn run_stage(
        &self,
        stage: u32,
        members: Vec<&ResourceDescriptor>,
        prior: &BTreeMap<String, LoadResult>,
        policy: ConcurrencyPolicy,
        cancel: &CancelSignal,
    ) -> BTreeMap<String, LoadResult> {
        let slots = match policy {
            ConcurrencyPolicy::Sequential => 1,
            ConcurrencyPolicy::BoundedParallel(n) => n.max(1),
            ConcurrencyPolicy::Parallel => members.len().max(1),
        };
        let permits = Arc::new(Semaphore::new(slots.min(Semaphore::MAX_PERMITS)));
        let sequential = policy == ConcurrencyPolicy::Sequential;
        let in_stage: HashSet<String> = members.iter().map(|r| r.id.clone()).collect();

        // Members arrive in the stage's stable order
        let mut waiting: VecDeque<&ResourceDescriptor> = members.into_iter().collect();
        let mut ready: VecDeque<&ResourceDescriptor> = VecDeque::new();
        let mut settled: BTreeMap<String, LoadResult> = BTreeMap::new();
        let mut running = FuturesUnordered::new();

        loop {
            // Admit members whose same-stage dependencies are terminal.
            // Sequential admits strictly in order.
            let mut blocked = false;
            for res in std::mem::take(&mut waiting) {
                let unmet = res
                    .depends_on
                    .iter()
                    .any(|dep| in_stage.contains(dep) && !settled.contains_key(dep));
                if blocked || unmet {
                    blocked |= sequential;
                    waiting.push_back(res);
                } else {
                    ready.push_back(res);
                }
            }

            let mut progressed = false;
            while let Some(&res) = ready.front() {
                if cancel.is_cancelled() {
                    debug!(resource = %res.id, "Not dispatching, run was cancelled");
                    ready.pop_front();
                    settled.insert(res.id.clone(), Err(LoadError::cancelled(&res.id)));
                    progressed = true;
                    continue;
                }

                let failed_dep = res.depends_on.iter().find(|dep| {
                    matches!(
                        settled.get(dep.as_str()).or_else(|| prior.get(dep.as_str())),
                        Some(Err(_))
                    )
                });
                if let Some(dep) = failed_dep {
                    ready.pop_front();
                    settled.insert(res.id.clone(), self.skip(res, dep));
                    progressed = true;
                    continue;
                }

                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    break;
                };
                ready.pop_front();
                running.push(self.dispatch(stage, res, permit));
            }

            match running.next().await {
                Some((id, joined)) => {
                    let result = self.unwrap_join(&id, joined);
                    settled.insert(id, result);
                }
                None if waiting.is_empty() && ready.is_empty() => break,
                None if progressed => {}
                None => {
                    // Unreachable for a validated manifest
                    error!(stage, "Stage stalled with {} unadmitted resources", waiting.len());
                    for res in waiting.drain(..) {
                        settled.insert(
                            res.id.clone(),
                            Err(LoadError::Loader {
                                cause: format!("'{}' never became ready", res.id),
                            }),
                        );
                    }
                }
            }
        }
        settled
    }

    /// Record a resource whose dependency failed, without loading it
    fn skip(&self, res: &ResourceDescriptor, dep: &str) -> LoadResult {
        let err = LoadError::dependency_failed(dep);
        warn!(resource = %res.id, "Skipping load: {}", err);
        if self.ledger.register(&res.id) == Registration::Owner {
            self.ledger.fail(&res.id, err.clone());
        }
        self.events.emit(LoadEvent::ResourceFailed {
            id: res.id.clone(),
            error: err.clone(),
        });
        Err(err)
    }

    /// Claim `res` in the ledger and spawn its load, or a wait on whoever
    /// already owns it. The permit is held only while this run loads.
    fn dispatch(
        &self,
        stage: u32,
        res: &ResourceDescriptor,
        permit: OwnedSemaphorePermit,
    ) -> impl Future<Output = (String, Result<LoadResult, JoinError>)> {
        let id = res.id.clone();
        let ledger = self.ledger.clone();

        let handle = match self.ledger.register(&id) {
            Registration::Owner => {
                self.events.emit(LoadEvent::ResourceStarted {
                    id: id.clone(),
                    stage,
                });
                let loader = self.loader.clone();
                let events = self.events.clone();
                let descriptor = res.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = loader.load(&descriptor).await;
                    drop(permit);

                    let id = descriptor.id;
                    match &result {
                        Ok(loaded) => {
                            ledger.complete(&id, loaded.clone());
                            events.emit(LoadEvent::ResourceLoaded {
                                id,
                                duration_ms: started.elapsed().as_millis() as u64,
                            });
                        }
                        Err(e) => {
                            ledger.fail(&id, e.clone());
                            events.emit(LoadEvent::ResourceFailed {
                                id,
                                error: e.clone(),
                            });
                        }
                    }
                    result
                })
            }
            Registration::Existing => {
                drop(permit);
                let status = self
                    .ledger
                    .lookup(&id)
                    .map(|entry| entry.status)
                    .unwrap_or(LoadStatus::InFlight);
                debug!(resource = %id, ?status, "Reusing ledger entry");
                self.events.emit(LoadEvent::ResourceReused {
                    id: id.clone(),
                    status,
                });
                let id = id.clone();
                tokio::spawn(async move {
                    ledger.wait(&id).await.unwrap_or_else(|| {
                        Err(LoadError::Loader {
                            cause: format!("ledger lost track of '{}'", id),
                        })
                    })
                })
            }
        };

        async move { (id, handle.await) }
    }

    fn unwrap_join(&self, id: &str, joined: Result<LoadResult, JoinError>) -> LoadResult {
        joined.unwrap_or_else(|e| {
            error!(resource = %id, "Load task aborted: {}", e);
            let err = LoadError::Loader {
                cause: format!("load task aborted: {}", e),
            };
            self.ledger.fail(id, err.clone());
            Err(err)
        })
    }
}
