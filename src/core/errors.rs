use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single resource.
///
/// Cloneable so one terminal state can be handed to every caller waiting on
/// the same resource id.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadError {
    /// The fetch did not settle within the configured timeout
    #[error("Timed out loading '{resource_id}' after {timeout_ms}ms")]
    Timeout { resource_id: String, timeout_ms: u64 },

    /// A dependency failed, so this resource was never loaded
    #[error("Dependency failed: '{dependency_id}'")]
    DependencyFailed { dependency_id: String },

    /// Opaque failure from the injected fetch capability
    #[error("Loader error: {cause}")]
    Loader { cause: String },

    /// The run was cancelled before this resource was dispatched
    #[error("Cancelled before '{resource_id}' was dispatched")]
    Cancelled { resource_id: String },
}

impl LoadError {
    pub fn dependency_failed<S: Into<String>>(dependency_id: S) -> Self {
        Self::DependencyFailed {
            dependency_id: dependency_id.into(),
        }
    }

    /// Flatten an opaque fetch error, keeping its context chain
    pub fn loader(cause: &anyhow::Error) -> Self {
        Self::Loader {
            cause: format!("{:#}", cause),
        }
    }

    pub fn timeout<S: Into<String>>(resource_id: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            resource_id: resource_id.into(),
            timeout_ms,
        }
    }

    pub fn cancelled<S: Into<String>>(resource_id: S) -> Self {
        Self::Cancelled {
            resource_id: resource_id.into(),
        }
    }
}

/// Rejections raised by the mutation guard. The environment is unchanged
/// whenever one of these is returned; a load reports them in
/// `LoadedResource::rejected` and still succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardError {
    #[error("Self reference: node '{node_id}' cannot be attached to itself")]
    SelfReference { node_id: String },

    #[error("Cycle: '{child}' is an ancestor of '{parent}'")]
    Cycle { parent: String, child: String },

    #[error("Unknown parent node '{parent}'")]
    UnknownParent { parent: String },
}

/// Manifest validation errors, raised at build time and never at load time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("Duplicate resource id '{id}'")]
    DuplicateId { id: String },

    #[error("Resource '{id}' depends on unknown resource '{dependency}'")]
    UnknownDependency { id: String, dependency: String },

    #[error("Resource '{id}' depends on itself")]
    SelfDependency { id: String },

    #[error("Resource '{id}' (stage {stage}) depends on '{dependency}' in later stage {dependency_stage}")]
    LaterStageDependency {
        id: String,
        stage: u32,
        dependency: String,
        dependency_stage: u32,
    },

    #[error("Dependency cycle through resource '{id}'")]
    DependencyCycle { id: String },

    #[error("Resource '{id}' has a zero timeout")]
    ZeroTimeout { id: String },
}

/// Crate-wide error for operations that can fail before any load begins
#[derive(Debug, Error)]
pub enum CoordError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoordError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(GuardError::Cycle {
            parent: "b".to_string(),
            child: "a".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "cycle");
        assert_eq!(json["child"], "a");
    }

    #[test]
    fn test_loader_error_keeps_context() {
        let cause = anyhow::anyhow!("connection reset").context("fetching chart.js");
        let err = LoadError::loader(&cause);
        let display = err.to_string();
        assert!(display.contains("fetching chart.js"));
        assert!(display.contains("connection reset"));
    }

    #[test]
    fn test_load_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(LoadError::dependency_failed("x")).unwrap();
        assert_eq!(json["kind"], "dependency_failed");
        assert_eq!(json["dependency_id"], "x");
    }
}
