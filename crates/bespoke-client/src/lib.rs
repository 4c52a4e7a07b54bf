//! HTTP client for the Bespoke Executor coordinator (§6.1), used by the
//! `bespoke` CLI and embeddable by other Rust callers.

pub mod client;
pub mod config;
pub mod error;
pub mod types;

pub use client::BespokeClient;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
