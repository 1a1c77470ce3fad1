//! GPU-utilization-driven batch size cap.
//!
//! The adaptive controller tunes for latency; this one keeps the batch
//! inside memory limits. The batcher takes the minimum of both.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;

use crate::engine::{MemoryProbe, MemoryReading};

/// Bounded history of utilization snapshots.
const HISTORY_CAPACITY: usize = 100;

/// Configuration for the memory controller.
#[derive(Debug, Clone)]
pub struct MemoryControllerConfig {
    /// Utilization above this shrinks the cap.
    pub max_memory_utilization: f64,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Calls between actual probe reads.
    pub sampling_window: u64,
}

impl Default for MemoryControllerConfig {
    fn default() -> Self {
        Self {
            max_memory_utilization: 0.85,
            min_batch_size: 1,
            max_batch_size: 32,
            sampling_window: 5,
        }
    }
}

/// One recorded utilization sample.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemorySample {
    pub utilization: f64,
    pub active_bytes: u64,
    pub peak_bytes: u64,
    pub cache_bytes: u64,
}

/// Controller metrics for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryControllerMetrics {
    pub current_memory_limit: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub max_memory_utilization: f64,
    pub current_utilization: f64,
    pub avg_utilization: f64,
    pub oom_prevention_count: u64,
    pub scale_up_count: u64,
    pub sample_count: u64,
}

/// Memory-aware batch size controller.
pub struct MemoryController {
    config: MemoryControllerConfig,
    probe: Option<Arc<dyn MemoryProbe>>,
    current_limit: usize,
    call_count: u64,
    history: VecDeque<MemorySample>,
    oom_prevention_count: u64,
    scale_up_count: u64,
}

impl MemoryController {
    pub fn new(config: MemoryControllerConfig, probe: Option<Arc<dyn MemoryProbe>>) -> Self {
        let current_limit = config.max_batch_size;
        Self {
            config,
            probe,
            current_limit,
            call_count: 0,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            oom_prevention_count: 0,
            scale_up_count: 0,
        }
    }

    /// Read the probe, or fall back to a neutral 0.5 so a blind
    /// controller neither grows nor shrinks.
    fn read_memory(&self) -> MemorySample {
        let reading = self.probe.as_ref().and_then(|p| p.read());
        match reading {
            Some(r) => MemorySample {
                utilization: r.utilization(),
                active_bytes: r.active_bytes,
                peak_bytes: r.peak_bytes,
                cache_bytes: r.cache_bytes,
            },
            None => MemorySample {
                utilization: 0.5,
                active_bytes: 0,
                peak_bytes: 0,
                cache_bytes: 0,
            },
        }
    }

    /// Maximum safe batch size. Probes memory every `sampling_window`
    /// calls; between samples the last cap is returned unchanged.
    pub fn get_max_batch_size(&mut self, current_batch_size: usize) -> usize {
        self.call_count += 1;
        if self.call_count % self.config.sampling_window != 0 {
            return self.current_limit;
        }

        let sample = self.read_memory();
        if self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(sample);

        let old_limit = self.current_limit;
        let high_water = self.config.max_memory_utilization;

        let new_limit = if sample.utilization > high_water {
            let reduced = current_batch_size
                .saturating_sub(1)
                .max(self.config.min_batch_size);
            if reduced < old_limit {
                self.oom_prevention_count += 1;
                tracing::warn!(
                    utilization = sample.utilization,
                    old_limit,
                    new_limit = reduced,
                    "memory pressure high, reducing batch limit"
                );
            }
            reduced
        } else if sample.utilization < high_water - 0.15 {
            let grown = (old_limit + 2).min(self.config.max_batch_size);
            if grown > old_limit {
                self.scale_up_count += 1;
                tracing::debug!(
                    utilization = sample.utilization,
                    old_limit,
                    new_limit = grown,
                    "memory available, raising batch limit"
                );
            }
            grown
        } else {
            old_limit
        };

        self.current_limit = new_limit;
        new_limit
    }

    pub fn current_limit(&self) -> usize {
        self.current_limit
    }

    pub fn metrics(&self) -> MemoryControllerMetrics {
        let current = self.history.back().map(|s| s.utilization).unwrap_or(0.0);
        let avg = if self.history.is_empty() {
            0.0
        } else {
            let recent: Vec<f64> =
                self.history.iter().rev().take(10).map(|s| s.utilization).collect();
            recent.iter().sum::<f64>() / recent.len() as f64
        };
        MemoryControllerMetrics {
            current_memory_limit: self.current_limit,
            min_batch_size: self.config.min_batch_size,
            max_batch_size: self.config.max_batch_size,
            max_memory_utilization: self.config.max_memory_utilization,
            current_utilization: current,
            avg_utilization: avg,
            oom_prevention_count: self.oom_prevention_count,
            scale_up_count: self.scale_up_count,
            sample_count: self.call_count,
        }
    }

    /// Reset counters and history (used by benchmarks).
    pub fn reset_stats(&mut self) {
        self.oom_prevention_count = 0;
        self.scale_up_count = 0;
        self.call_count = 0;
        self.history.clear();
        self.current_limit = self.config.max_batch_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedProbe {
        active: AtomicU64,
        peak: u64,
    }

    impl FixedProbe {
        fn new(active: u64, peak: u64) -> Self {
            Self { active: AtomicU64::new(active), peak }
        }

        fn set_active(&self, active: u64) {
            self.active.store(active, Ordering::SeqCst);
        }
    }

    impl MemoryProbe for FixedProbe {
        fn read(&self) -> Option<MemoryReading> {
            Some(MemoryReading {
                active_bytes: self.active.load(Ordering::SeqCst),
                peak_bytes: self.peak,
                cache_bytes: 0,
            })
        }
    }

    fn config() -> MemoryControllerConfig {
        MemoryControllerConfig {
            max_memory_utilization: 0.85,
            min_batch_size: 1,
            max_batch_size: 16,
            sampling_window: 1,
        }
    }

    #[test]
    fn test_high_pressure_shrinks_limit() {
        let probe = Arc::new(FixedProbe::new(95, 100));
        let mut controller = MemoryController::new(config(), Some(probe));
        let limit = controller.get_max_batch_size(8);
        assert_eq!(limit, 7);
        assert_eq!(controller.metrics().oom_prevention_count, 1);
    }

    #[test]
    fn test_low_pressure_grows_limit_by_two() {
        let probe = Arc::new(FixedProbe::new(10, 100));
        let mut controller = MemoryController::new(
            MemoryControllerConfig { max_batch_size: 32, ..config() },
            Some(probe),
        );
        // Force the limit down first.
        controller.current_limit = 4;
        let limit = controller.get_max_batch_size(4);
        assert_eq!(limit, 6);
        assert_eq!(controller.metrics().scale_up_count, 1);
    }

    #[test]
    fn test_hysteresis_band_holds_limit() {
        // 0.75 sits between 0.70 and 0.85: no change either way.
        let probe = Arc::new(FixedProbe::new(75, 100));
        let mut controller = MemoryController::new(config(), Some(probe));
        controller.current_limit = 8;
        assert_eq!(controller.get_max_batch_size(8), 8);
        assert_eq!(controller.metrics().oom_prevention_count, 0);
        assert_eq!(controller.metrics().scale_up_count, 0);
    }

    #[test]
    fn test_missing_probe_is_neutral() {
        let mut controller = MemoryController::new(config(), None);
        controller.current_limit = 8;
        for _ in 0..20 {
            assert_eq!(controller.get_max_batch_size(8), 8);
        }
        assert_eq!(controller.metrics().scale_up_count, 0);
        assert_eq!(controller.metrics().oom_prevention_count, 0);
    }

    #[test]
    fn test_sampling_window_caches_between_reads() {
        let probe = Arc::new(FixedProbe::new(10, 100));
        let mut controller = MemoryController::new(
            MemoryControllerConfig { sampling_window: 5, ..config() },
            Some(probe.clone()),
        );
        controller.current_limit = 4;

        // Calls 1-4 skip the probe and return the cached cap.
        for _ in 0..4 {
            assert_eq!(controller.get_max_batch_size(4), 4);
        }
        // Call 5 samples and scales up.
        assert_eq!(controller.get_max_batch_size(4), 6);

        // Pressure spike is not seen until the next sampling boundary.
        probe.set_active(99);
        for _ in 0..4 {
            assert_eq!(controller.get_max_batch_size(6), 6);
        }
        assert_eq!(controller.get_max_batch_size(6), 5);
    }

    #[test]
    fn test_limit_respects_floor() {
        let probe = Arc::new(FixedProbe::new(99, 100));
        let mut controller = MemoryController::new(config(), Some(probe));
        for _ in 0..50 {
            let limit = controller.get_max_batch_size(1);
            assert!(limit >= 1);
        }
        assert_eq!(controller.current_limit(), 1);
    }
}
