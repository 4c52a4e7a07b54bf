//! Worker Pool (§4.4): claims Task Queue items, invokes a [`StageExecutor`]
//! for the stage's external program, and publishes results to the Cache
//! Manager.

pub mod executor;
pub mod pool;

pub use executor::{EchoExecutor, StageExecutor, SubprocessExecutor};
pub use pool::{spawn, TaskCompletion, TaskOutcome, WorkerContext, WorkerPoolConfig};
