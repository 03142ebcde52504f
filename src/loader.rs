//! Resource loader
//!
//! Fetches a single resource through the injected [`Fetcher`] capability and
//! routes any nodes it produces through the [`MutationGuard`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::core::errors::{GuardError, LoadError};
use crate::environment::{EnvironmentNode, MutationGuard};
use crate::manifest::ResourceDescriptor;

/// Outcome of one load
pub type LoadResult = Result<LoadedResource, LoadError>;

/// A node a resource wants attached, and where
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeAttachment {
    pub parent: String,
    pub node: EnvironmentNode,
}

/// What the fetch capability hands back
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResource {
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub nodes: Vec<NodeAttachment>,
}

impl RawResource {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, parent: impl Into<String>, node: EnvironmentNode) -> Self {
        self.nodes.push(NodeAttachment {
            parent: parent.into(),
            node,
        });
        self
    }
}

/// A successfully loaded resource
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadedResource {
    pub id: String,
    pub locator: String,
    pub payload: Value,
    /// Node ids attached into the environment
    pub attached: Vec<String>,
    /// Subset of `attached` that replaced a stale node
    pub replaced: Vec<String>,
    /// Attachments the guard refused; these do not fail the resource
    pub rejected: Vec<GuardError>,
}

impl LoadedResource {
    pub fn new(id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            locator: locator.into(),
            payload: Value::Null,
            attached: Vec::new(),
            replaced: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// Fetch capability injected by the embedding application
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> anyhow::Result<RawResource>;
}

/// Loads one resource per call
pub struct ResourceLoader {
    fetcher: Arc<dyn Fetcher>,
    guard: MutationGuard,
    default_timeout: Option<Duration>,
}

impl ResourceLoader {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        guard: MutationGuard,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            fetcher,
            guard,
            default_timeout,
        }
    }

    pub fn guard(&self) -> &MutationGuard {
        &self.guard
    }

    /// Fetch the resource named by `descriptor.locator`, then attach the
    /// nodes it produced. The timeout covers the fetch only.
    pub async fn load(&self, descriptor: &ResourceDescriptor) -> LoadResult {
        let id = descriptor.id.as_str();
        let limit = descriptor.timeout().or(self.default_timeout);
        let started = Instant::now();
        info!(resource = %id, locator = %descriptor.locator, "Loading resource");

        let fetch = self.fetcher.fetch(&descriptor.locator);
        let fetched = match limit {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(fetched) => fetched,
                Err(_) => {
                    warn!(resource = %id, "Fetch timed out after {:?}", limit);
                    return Err(LoadError::timeout(id, limit.as_millis() as u64));
                }
            },
            None => fetch.await,
        };

        let raw = fetched.map_err(|e| {
            error!(resource = %id, error = %e, "Fetch failed");
            LoadError::loader(&e)
        })?;

        let mut loaded = LoadedResource::new(id, descriptor.locator.clone());
        loaded.payload = raw.payload;

        for NodeAttachment { parent, mut node } in raw.nodes {
            if node.owner.is_none() {
                node.owner = Some(id.to_string());
            }
            let node_id = node.id.clone();
            match self.guard.attach(&parent, node).await {
                Ok(outcome) => {
                    if outcome.replaced {
                        loaded.replaced.push(node_id.clone());
                    }
                    loaded.attached.push(node_id);
                }
                Err(e) => {
                    warn!(resource = %id, error = %e, "Skipping rejected attachment");
                    loaded.rejected.push(e);
                }
            }
        }

        debug!(
            resource = %id,
            attached = loaded.attached.len(),
            rejected = loaded.rejected.len(),
            "Resource loaded in {:?}",
            started.elapsed()
        );
        Ok(loaded)
    }
}

/// Reads locators as paths under a root directory.
///
/// `.json` files shaped like a [`RawResource`] (with `payload` or `nodes`)
/// are taken as-is; other JSON becomes the payload, and any other file is
/// loaded as a text payload.
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, locator: &str) -> anyhow::Result<RawResource> {
        let path = self.root.join(locator);
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Ok(RawResource::new(Value::String(text)));
        }

        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        let shaped = value
            .as_object()
            .map(|obj| obj.contains_key("payload") || obj.contains_key("nodes"))
            .unwrap_or(false);
        if shaped {
            Ok(serde_json::from_value(value)
                .with_context(|| format!("decoding resource {}", path.display()))?)
        } else {
            Ok(RawResource::new(value))
        }
    }
}
