//! Shared fixtures: a fetcher that records every call

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use rescoord::{EnvironmentNode, Fetcher, Manifest, RawResource, ResourceDescriptor};
use serde_json::json;

#[derive(Clone, Debug)]
pub struct Call {
    pub locator: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Fake fetch capability with per-locator delays, failures and nodes
#[derive(Default)]
pub struct FakeFetcher {
    delay: Duration,
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    fail_first: HashMap<String, usize>,
    nodes: HashMap<String, Vec<(String, EnvironmentNode)>>,
    calls: Mutex<Vec<Call>>,
    attempts: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn delay_for(mut self, locator: &str, delay: Duration) -> Self {
        self.delays.insert(locator.to_string(), delay);
        self
    }

    pub fn fail(mut self, locator: &str) -> Self {
        self.failing.insert(locator.to_string());
        self
    }

    /// Fail the first `times` fetches of `locator`, then succeed
    pub fn fail_first(mut self, locator: &str, times: usize) -> Self {
        self.fail_first.insert(locator.to_string(), times);
        self
    }

    pub fn node(mut self, locator: &str, parent: &str, node: EnvironmentNode) -> Self {
        self.nodes
            .entry(locator.to_string())
            .or_default()
            .push((parent.to_string(), node));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, locator: &str) -> usize {
        self.calls().iter().filter(|c| c.locator == locator).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls().len()
    }

    pub fn span(&self, locator: &str) -> Call {
        self.calls()
            .into_iter()
            .find(|c| c.locator == locator)
            .unwrap_or_else(|| panic!("{} was never fetched", locator))
    }

    /// Completion order of all calls
    pub fn finish_order(&self) -> Vec<String> {
        let mut calls = self.calls();
        calls.sort_by_key(|c| c.finished);
        calls.into_iter().map(|c| c.locator).collect()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, locator: &str) -> Result<RawResource> {
        let started = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(locator).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(locator.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            locator: locator.to_string(),
            started,
            finished: Instant::now(),
        });

        let flaky = self
            .fail_first
            .get(locator)
            .map(|&times| attempt <= times)
            .unwrap_or(false);
        if self.failing.contains(locator) || flaky {
            anyhow::bail!("fetch failed: {}", locator);
        }

        let mut raw = RawResource::new(json!({ "locator": locator }));
        for (parent, node) in self.nodes.get(locator).cloned().unwrap_or_default() {
            raw = raw.with_node(parent, node);
        }
        Ok(raw)
    }
}

/// Manifest from `(id, stage, deps)` rows; each locator equals its id
pub fn manifest(rows: &[(&str, u32, &[&str])]) -> Manifest {
    let resources = rows
        .iter()
        .map(|(id, stage, deps)| {
            ResourceDescriptor::new(*id, *id)
                .with_stage(*stage)
                .with_deps(deps.iter().copied())
        })
        .collect();
    Manifest::new(resources).expect("valid manifest")
}

/// The x/y/z scenario: y depends on x in stage 0, z sits alone in stage 1
pub fn xyz() -> Manifest {
    manifest(&[("x", 0, &[]), ("y", 0, &["x"]), ("z", 1, &[])])
}
