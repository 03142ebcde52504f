// Core infrastructure modules
pub mod core {
    pub mod cancel;
    pub mod config;
    pub mod errors;

    pub use cancel::{cancellation, CancelHandle, CancelSignal};
    pub use config::{ConcurrencyPolicy, CoordinatorConfig, CoordinatorConfigBuilder, RetryPolicy};
    pub use errors::{CoordError, GuardError, LoadError, ManifestError, Result};
}

// Leaf-first: guard and ledger, then loader, sequencer, coordinator
pub mod environment;
pub mod ledger;
pub mod loader;
pub mod manifest;
pub mod events;
pub mod sequencer;
pub mod coord;

// Re-exports for convenience
pub use crate::core::errors::{CoordError, GuardError, LoadError, ManifestError, Result};
pub use crate::core::{cancellation, CancelHandle, CancelSignal};
pub use crate::core::{ConcurrencyPolicy, CoordinatorConfig, RetryPolicy};
pub use coord::{
    Coordinator, CoordinatorBuilder, CoordinatorState, InitOptions, InitOutcome, ResourceStatus,
    StatusSnapshot,
};
pub use environment::{AttachOutcome, Environment, EnvironmentNode, InMemoryEnvironment, MutationGuard};
pub use events::{EventBus, LoadEvent, LoadEventEnvelope};
pub use ledger::{LedgerEntry, LoadLedger, LoadStatus, Registration};
pub use loader::{FileFetcher, Fetcher, LoadResult, LoadedResource, RawResource, ResourceLoader};
pub use manifest::{Manifest, ManifestBuilder, ManifestFile, ResourceDescriptor};
pub use sequencer::{Sequencer, SequencerReport};
