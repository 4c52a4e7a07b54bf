//! Cache Manager (§4.3): deduplicates stage executions by fingerprint and
//! enforces at-most-one-computation-per-fingerprint via leases.

pub mod manager;

pub use manager::{spawn_lease_reaper, AcquireOutcome, CacheLookup, CacheManager, InMemoryCacheManager};
