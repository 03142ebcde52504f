//! Resource manifests
//!
//! A manifest is the declared set of resources with their stage and
//! dependency constraints. Every structural check happens here, when the
//! manifest is built, so the sequencer never discovers a bad edge mid-run.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::config::CoordinatorConfig;
use crate::core::errors::{CoordError, ManifestError, Result};

/// One declared resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Unique, stable key
    pub id: String,
    /// Address handed to the fetch capability
    pub locator: String,
    /// Ordering bucket; lower stages settle first
    #[serde(default)]
    pub stage: u32,
    /// Ids that must be terminal before this resource starts
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Overrides the configured default timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ResourceDescriptor {
    pub fn new(id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            locator: locator.into(),
            stage: 0,
            depends_on: BTreeSet::new(),
            timeout_ms: None,
        }
    }

    pub fn with_stage(mut self, stage: u32) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A validated manifest, grouped into stages
#[derive(Clone, Debug)]
pub struct Manifest {
    resources: Vec<ResourceDescriptor>,
    index: HashMap<String, usize>,
    /// Stage -> resource positions, dependencies first, otherwise manifest order
    stages: BTreeMap<u32, Vec<usize>>,
}

impl Manifest {
    /// Validate descriptors and group them into ordered stages
    pub fn new(resources: Vec<ResourceDescriptor>) -> std::result::Result<Self, ManifestError> {
        let mut index = HashMap::with_capacity(resources.len());
        for (pos, res) in resources.iter().enumerate() {
            if index.insert(res.id.clone(), pos).is_some() {
                return Err(ManifestError::DuplicateId { id: res.id.clone() });
            }
        }

        for res in &resources {
            if res.timeout_ms == Some(0) {
                return Err(ManifestError::ZeroTimeout { id: res.id.clone() });
            }
            for dep in &res.depends_on {
                if dep == &res.id {
                    return Err(ManifestError::SelfDependency { id: res.id.clone() });
                }
                let &dep_pos = index.get(dep).ok_or_else(|| ManifestError::UnknownDependency {
                    id: res.id.clone(),
                    dependency: dep.clone(),
                })?;
                let dep_stage = resources[dep_pos].stage;
                if dep_stage > res.stage {
                    return Err(ManifestError::LaterStageDependency {
                        id: res.id.clone(),
                        stage: res.stage,
                        dependency: dep.clone(),
                        dependency_stage: dep_stage,
                    });
                }
            }
        }

        check_acyclic(&resources, &index)?;

        let mut grouped: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (pos, res) in resources.iter().enumerate() {
            grouped.entry(res.stage).or_default().push(pos);
        }
        let stages = grouped
            .into_iter()
            .map(|(stage, members)| (stage, stable_order(&resources, &index, members)))
            .collect::<BTreeMap<_, _>>();

        debug!(
            "Built manifest with {} resources in {} stages",
            resources.len(),
            stages.len()
        );

        Ok(Self {
            resources,
            index,
            stages,
        })
    }

    /// Parse a JSON array of descriptors
    pub fn from_json_str(s: &str) -> Result<Self> {
        let resources: Vec<ResourceDescriptor> = serde_json::from_str(s)?;
        Ok(Self::new(resources)?)
    }

    /// Parse a YAML sequence of descriptors
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let resources: Vec<ResourceDescriptor> = serde_yaml::from_str(s)?;
        Ok(Self::new(resources)?)
    }

    pub fn get(&self, id: &str) -> Option<&ResourceDescriptor> {
        self.index.get(id).map(|&pos| &self.resources[pos])
    }

    /// Descriptors in declaration order
    pub fn resources(&self) -> &[ResourceDescriptor] {
        &self.resources
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(|r| r.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Stages in ascending order, each in its dispatch order
    pub fn stages(&self) -> impl Iterator<Item = (u32, Vec<&ResourceDescriptor>)> {
        self.stages.iter().map(move |(&stage, members)| {
            (stage, members.iter().map(|&pos| &self.resources[pos]).collect())
        })
    }
}

/// Reject transitive self-dependencies
fn check_acyclic(
    resources: &[ResourceDescriptor],
    index: &HashMap<String, usize>,
) -> std::result::Result<(), ManifestError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::with_capacity(resources.len(), 0);
    let nodes: Vec<NodeIndex> = resources
        .iter()
        .map(|r| graph.add_node(r.id.as_str()))
        .collect();

    for (pos, res) in resources.iter().enumerate() {
        for dep in &res.depends_on {
            if let Some(&dep_pos) = index.get(dep) {
                graph.add_edge(nodes[dep_pos], nodes[pos], ());
            }
        }
    }

    toposort(&graph, None).map(|_| ()).map_err(|cycle| ManifestError::DependencyCycle {
        id: graph[cycle.node_id()].to_string(),
    })
}

/// Kahn's algorithm restricted to one stage, always taking the earliest
/// declared resource whose same-stage dependencies are placed.
fn stable_order(
    resources: &[ResourceDescriptor],
    index: &HashMap<String, usize>,
    members: Vec<usize>,
) -> Vec<usize> {
    let stage = match members.first() {
        Some(&pos) => resources[pos].stage,
        None => return members,
    };
    let mut placed: HashSet<usize> = HashSet::with_capacity(members.len());
    let mut remaining = members;
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let next = remaining.iter().position(|&pos| {
            resources[pos].depends_on.iter().all(|dep| {
                let dep_pos = index[dep];
                resources[dep_pos].stage != stage || placed.contains(&dep_pos)
            })
        });
        // Acyclicity was checked first, so some member is always ready
        let Some(at) = next else { break };
        let pos = remaining.remove(at);
        placed.insert(pos);
        ordered.push(pos);
    }
    ordered.extend(remaining);
    ordered
}

/// On-disk manifest: resources plus an optional configuration section
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestFile {
    #[serde(default)]
    pub config: Option<CoordinatorConfig>,
    pub resources: Vec<ResourceDescriptor>,
}

impl ManifestFile {
    /// Read a `.json`, `.yaml` or `.yml` manifest file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoordError::io(format!("reading {}", path.display()), e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&text)?),
            _ => Ok(serde_json::from_str(&text)?),
        }
    }

    /// Validate into a manifest and an effective configuration
    pub fn into_parts(self) -> Result<(Manifest, CoordinatorConfig)> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok((Manifest::new(self.resources)?, config))
    }
}

/// Fluent manifest construction
#[derive(Default)]
pub struct ManifestBuilder {
    resources: Vec<ResourceDescriptor>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(mut self, descriptor: ResourceDescriptor) -> Self {
        self.resources.push(descriptor);
        self
    }

    /// Shorthand for a resource with a stage and dependencies
    pub fn add<I, S>(self, id: &str, stage: u32, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let descriptor = ResourceDescriptor::new(id, format!("{}.js", id))
            .with_stage(stage)
            .with_deps(deps);
        self.resource(descriptor)
    }

    pub fn build(self) -> std::result::Result<Manifest, ManifestError> {
        Manifest::new(self.resources)
    }
}
