//! Single-host default backends for the Result Store and Task Queue
//! contracts (§4.5, §4.6): a directory of length-prefixed-JSON files and an
//! in-process FIFO-per-routing-key queue layered on top of it. Selected
//! when the configured backend URL is not a `postgres://` URL.

pub mod embedded_queue;
pub mod file_store;

pub use embedded_queue::EmbeddedQueue;
pub use file_store::FileResultStore;
