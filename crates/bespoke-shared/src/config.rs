//! # Executor Configuration (§6.2)
//!
//! Recognized environment options, each with its own documented default.
//! Loaded once by the Supervisor at construction and passed by value to
//! every component — no process-wide globals.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Per-pool worker counts (fragment, QC, optimize)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolCounts {
    pub fragment_workers: usize,
    pub qc_workers: usize,
    pub optimize_workers: usize,
}

impl Default for WorkerPoolCounts {
    fn default() -> Self {
        Self {
            fragment_workers: 1,
            qc_workers: 1,
            optimize_workers: 1,
        }
    }
}

/// Per-worker resource budget: CPU core count and GiB of memory per core
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceBudget {
    /// `None` means "auto" (all CPUs for QC, 1 otherwise), per §6.2
    pub core_budget: Option<usize>,
    /// `None` means best-effort / unspecified
    pub memory_gib_per_core: Option<f64>,
}

impl ResourceBudget {
    pub fn auto_for_qc() -> Self {
        Self {
            core_budget: Some(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)),
            memory_gib_per_core: None,
        }
    }

    pub fn single_core() -> Self {
        Self {
            core_budget: Some(1),
            memory_gib_per_core: None,
        }
    }
}

/// Per-routing-key task retry limits, default per §6.2
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLimits {
    pub fragment: u32,
    pub qc: u32,
    pub optimize: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            fragment: 0,
            qc: 2,
            optimize: 0,
        }
    }
}

/// Top-level executor configuration, assembled once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub worker_counts: WorkerPoolCounts,
    pub qc_core_budget: ResourceBudget,
    pub fragment_core_budget: ResourceBudget,
    pub optimize_core_budget: ResourceBudget,
    pub bind_address: String,
    pub result_store_dir: String,
    pub queue_backend_url: String,
    pub lease_ttl: Duration,
    pub lease_heartbeat: Duration,
    pub retry_limits: RetryLimits,
    pub shutdown_grace: Duration,
    pub keep_intermediate_files: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let lease_ttl = Duration::from_secs(300);
        Self {
            worker_counts: WorkerPoolCounts::default(),
            qc_core_budget: ResourceBudget::auto_for_qc(),
            fragment_core_budget: ResourceBudget::single_core(),
            optimize_core_budget: ResourceBudget::single_core(),
            bind_address: "127.0.0.1:15323".to_string(),
            result_store_dir: "./bespoke-state".to_string(),
            queue_backend_url: "embedded".to_string(),
            lease_ttl,
            lease_heartbeat: lease_ttl / 3,
            retry_limits: RetryLimits::default(),
            shutdown_grace: Duration::from_secs(30),
            keep_intermediate_files: false,
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults for anything unset (§6.2). Layered in the sense
    /// that `.env` files loaded by the caller via `dotenvy` take effect
    /// before this is called.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let lease_ttl = Duration::from_secs(env_or(
            "BESPOKE_LEASE_TTL_SECONDS",
            defaults.lease_ttl.as_secs(),
        ));

        Self {
            worker_counts: WorkerPoolCounts {
                fragment_workers: env_or(
                    "BESPOKE_N_FRAGMENTER_WORKERS",
                    defaults.worker_counts.fragment_workers,
                ),
                qc_workers: env_or(
                    "BESPOKE_N_QC_COMPUTE_WORKERS",
                    defaults.worker_counts.qc_workers,
                ),
                optimize_workers: env_or(
                    "BESPOKE_N_OPTIMIZER_WORKERS",
                    defaults.worker_counts.optimize_workers,
                ),
            },
            qc_core_budget: defaults.qc_core_budget,
            fragment_core_budget: defaults.fragment_core_budget,
            optimize_core_budget: defaults.optimize_core_budget,
            bind_address: env_string_or("BESPOKE_BIND", &defaults.bind_address),
            result_store_dir: env_string_or("BESPOKE_DIRECTORY", &defaults.result_store_dir),
            queue_backend_url: env_string_or(
                "BESPOKE_QUEUE_BACKEND_URL",
                &defaults.queue_backend_url,
            ),
            lease_heartbeat: lease_ttl / 3,
            lease_ttl,
            retry_limits: RetryLimits {
                fragment: env_or("BESPOKE_RETRY_FRAGMENT", defaults.retry_limits.fragment),
                qc: env_or("BESPOKE_RETRY_QC", defaults.retry_limits.qc),
                optimize: env_or("BESPOKE_RETRY_OPTIMIZE", defaults.retry_limits.optimize),
            },
            shutdown_grace: Duration::from_secs(env_or(
                "BESPOKE_SHUTDOWN_GRACE_SECONDS",
                defaults.shutdown_grace.as_secs(),
            )),
            keep_intermediate_files: env_or(
                "BESPOKE_KEEP_INTERMEDIATE_FILES",
                defaults.keep_intermediate_files,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ExecutorConfig::default();
        assert_eq!(cfg.worker_counts.fragment_workers, 1);
        assert_eq!(cfg.worker_counts.qc_workers, 1);
        assert_eq!(cfg.worker_counts.optimize_workers, 1);
        assert_eq!(cfg.bind_address, "127.0.0.1:15323");
        assert_eq!(cfg.result_store_dir, "./bespoke-state");
        assert_eq!(cfg.queue_backend_url, "embedded");
        assert_eq!(cfg.lease_ttl, Duration::from_secs(300));
        assert_eq!(cfg.lease_heartbeat, Duration::from_secs(100));
        assert_eq!(cfg.retry_limits.fragment, 0);
        assert_eq!(cfg.retry_limits.qc, 2);
        assert_eq!(cfg.retry_limits.optimize, 0);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(30));
        assert!(!cfg.keep_intermediate_files);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("BESPOKE_N_QC_COMPUTE_WORKERS", "4");
        std::env::set_var("BESPOKE_BIND", "0.0.0.0:9000");
        let cfg = ExecutorConfig::from_env();
        assert_eq!(cfg.worker_counts.qc_workers, 4);
        assert_eq!(cfg.bind_address, "0.0.0.0:9000");
        std::env::remove_var("BESPOKE_N_QC_COMPUTE_WORKERS");
        std::env::remove_var("BESPOKE_BIND");
    }

    #[test]
    fn resource_budget_auto_has_at_least_one_core() {
        let budget = ResourceBudget::auto_for_qc();
        assert!(budget.core_budget.unwrap_or(0) >= 1);
    }
}
