//! Concurrency planning
//!
//! Derives the worker pool size and the number of hardware encoder slots
//! from the CPU core count and configuration.

use recodex_config::WorkerConfig;
use serde::Serialize;

/// Upper bound on derived worker count; explicit configuration may exceed it
const MAX_DERIVED_WORKERS: u32 = 8;

/// Hardware encode slots when not configured; typical consumer GPUs allow 2-3
/// concurrent NVENC sessions
const DEFAULT_HARDWARE_SLOTS: u32 = 2;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Number of concurrent workers
    pub workers: u32,
    /// Maximum number of concurrent hardware-accelerated encodes
    pub hardware_slots: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - workers: explicit `max_workers`, else `max(1, cores / 4)` capped at 8
    /// - hardware slots: explicit `max_hardware_jobs`, else 2
    pub fn derive(cfg: &WorkerConfig) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`ConcurrencyPlan::derive`] with a known core count
    pub fn derive_with_cores(cfg: &WorkerConfig, total_cores: u32) -> Self {
        let workers = if cfg.max_workers > 0 {
            cfg.max_workers
        } else {
            derive_workers(total_cores)
        };

        let hardware_slots = if cfg.max_hardware_jobs > 0 {
            cfg.max_hardware_jobs
        } else {
            DEFAULT_HARDWARE_SLOTS
        };

        Self {
            total_cores,
            workers,
            hardware_slots,
        }
    }
}

/// A software encode saturates about four cores
fn derive_workers(cores: u32) -> u32 {
    (cores / 4).clamp(1, MAX_DERIVED_WORKERS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &WorkerConfig) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_derived_workers_are_bounded(cores in 1u32..512) {
            let plan = ConcurrencyPlan::derive_with_cores(&WorkerConfig::default(), cores);

            prop_assert!(plan.workers >= 1);
            prop_assert!(plan.workers <= MAX_DERIVED_WORKERS);
            prop_assert_eq!(plan.workers, (cores / 4).clamp(1, 8));
            prop_assert_eq!(plan.hardware_slots, DEFAULT_HARDWARE_SLOTS);
            prop_assert_eq!(plan.total_cores, cores);
        }

        #[test]
        fn prop_explicit_values_win(
            cores in 1u32..512,
            workers in 1u32..64,
            hw_jobs in 1u32..8,
        ) {
            let cfg = WorkerConfig {
                max_workers: workers,
                max_hardware_jobs: hw_jobs,
                ..WorkerConfig::default()
            };
            let plan = ConcurrencyPlan::derive_with_cores(&cfg, cores);

            prop_assert_eq!(plan.workers, workers);
            prop_assert_eq!(plan.hardware_slots, hw_jobs);
        }
    }

    #[test]
    fn test_small_machine_gets_one_worker() {
        let plan = ConcurrencyPlan::derive_with_cores(&WorkerConfig::default(), 2);
        assert_eq!(plan.workers, 1);
    }

    #[test]
    fn test_large_machine_is_capped() {
        let plan = ConcurrencyPlan::derive_with_cores(&WorkerConfig::default(), 128);
        assert_eq!(plan.workers, 8);
    }

    #[test]
    fn test_derive_plan_detects_cores() {
        let plan = derive_plan(&WorkerConfig::default());
        assert!(plan.total_cores >= 1);
        assert!(plan.workers >= 1);
    }
}
