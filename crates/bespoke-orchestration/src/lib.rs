//! The Coordinator Service (§4.1): request validation and submission
//! lifecycle, the Stage Orchestrator actor (§4.2), the HTTP surface
//! (§6.1), and the Supervisor that brings the whole process up and down
//! in order (§4.7).

pub mod coordinator;
pub mod http;
pub mod orchestrator;
pub mod supervisor;
pub mod task_index;

pub use coordinator::Coordinator;
pub use supervisor::Supervisor;
