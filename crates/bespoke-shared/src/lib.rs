//! Shared types for the Bespoke Executor: the data model, configuration,
//! error taxonomy, content fingerprinting, and resilience primitives used
//! by every other crate in the workspace.

pub mod backends;
pub mod cancellation;
pub mod config;
pub mod documents;
pub mod domain;
pub mod error;
pub mod fingerprint;
pub mod queue;
pub mod resilience;
pub mod store;

pub use cancellation::CancellationRegistry;
pub use config::ExecutorConfig;
pub use documents::{fragment_canonical, fragments_of, StageInput, StageOutput, WorkflowDocument};
pub use domain::{
    CacheEntry, Lease, RoutingKey, StageKind, StageRecord, StageStatus, Submission,
    SubmissionStatus, TaskRecord, TaskStatus,
};
pub use error::{ExecutorError, ExecutorResult};
pub use queue::{QueueItem, TaskEnvelope, TaskQueue};
pub use store::ResultStore;
