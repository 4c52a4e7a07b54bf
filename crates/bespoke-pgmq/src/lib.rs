//! Postgres-backed Task Queue provider (§4.5): a typed wrapper over the
//! `pgmq` Postgres extension, selected when the configured Task Queue
//! backend URL is a `postgres://` URL.

pub mod client;
pub mod error;
pub mod queue;
pub mod result_store;

pub use client::PgmqClient;
pub use error::{PgmqError, Result};
pub use queue::PgmqQueue;
pub use result_store::PostgresResultStore;
