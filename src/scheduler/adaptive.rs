//! EMA-smoothed batch size tuning from p99 latency feedback.
//!
//! The controller watches p99 latency and nudges the scheduler's batch
//! size toward a target band: below target grows the batch for
//! throughput, above target shrinks it for latency. A sudden spike past
//! the degradation threshold triggers an emergency reduction.

use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;

/// Bounded adjustment / sample history length.
const HISTORY_CAPACITY: usize = 100;

/// Configuration for the adaptive controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// EMA smoothing factor: `ema = alpha * x + (1 - alpha) * ema`.
    pub ema_alpha: f64,
    /// Adjust every N observations.
    pub adjustment_interval: u64,
    pub p99_target_ms: f64,
    pub p99_tolerance_ms: f64,
    /// Multiplier over the target that marks a degradation spike.
    pub degradation_threshold: f64,
    /// Maximum batch-size change per periodic adjustment.
    pub max_adjustment_step: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 2,
            max_batch_size: 8,
            ema_alpha: 0.3,
            adjustment_interval: 10,
            p99_target_ms: 100.0,
            p99_tolerance_ms: 20.0,
            degradation_threshold: 2.0,
            max_adjustment_step: 1,
        }
    }
}

/// One recorded adjustment: when, to what size, and why.
#[derive(Debug, Clone, Serialize)]
pub struct Adjustment {
    #[serde(skip)]
    pub at: Option<Instant>,
    pub batch_size: usize,
    pub reason: String,
}

/// Controller state snapshot for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerMetrics {
    pub enabled: bool,
    pub current_batch_size: usize,
    pub p99_latency_ms: f64,
    pub ema_p99_ms: f64,
    pub batch_count: u64,
    pub adjustment_count: u64,
    pub degradation_events: u64,
    pub stability_score: f64,
    pub recent_adjustments: Vec<Adjustment>,
}

/// Adaptive batch size controller.
pub struct AdaptiveController {
    config: ControllerConfig,
    enabled: bool,
    current_batch_size: usize,
    batch_count: u64,
    adjustment_count: u64,
    degradation_events: u64,
    ema_p99_ms: Option<f64>,
    p99_history: VecDeque<f64>,
    adjustment_history: VecDeque<Adjustment>,
}

impl AdaptiveController {
    pub fn new(config: ControllerConfig) -> Self {
        let current_batch_size = config.min_batch_size;
        Self {
            config,
            enabled: true,
            current_batch_size,
            batch_count: 0,
            adjustment_count: 0,
            degradation_events: 0,
            ema_p99_ms: None,
            p99_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            adjustment_history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Create a controller that never adjusts (all updates are no-ops).
    pub fn disabled(config: ControllerConfig) -> Self {
        let mut controller = Self::new(config);
        controller.enabled = false;
        controller
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Feed one p99 observation. Returns the recommended batch size and
    /// whether this call changed it.
    pub fn update(&mut self, p99_latency_ms: f64) -> (usize, bool) {
        if !self.enabled {
            return (self.current_batch_size, false);
        }

        // EMA initializes to the first sample to avoid cold-start bias.
        self.ema_p99_ms = Some(match self.ema_p99_ms {
            None => p99_latency_ms,
            Some(ema) => {
                self.config.ema_alpha * p99_latency_ms + (1.0 - self.config.ema_alpha) * ema
            }
        });

        if self.p99_history.len() >= HISTORY_CAPACITY {
            self.p99_history.pop_front();
        }
        self.p99_history.push_back(p99_latency_ms);
        self.batch_count += 1;

        if self.detect_degradation(p99_latency_ms) {
            self.degradation_events += 1;
            tracing::warn!(
                p99_ms = p99_latency_ms,
                ema_ms = self.ema_p99_ms.unwrap_or(0.0),
                "latency degradation detected"
            );
            let new_size = self
                .current_batch_size
                .saturating_sub(2)
                .max(self.config.min_batch_size);
            if new_size != self.current_batch_size {
                self.apply(new_size, "degradation_emergency");
                return (new_size, true);
            }
        }

        if self.batch_count % self.config.adjustment_interval == 0 {
            let new_size = self.calculate_adjustment();
            if new_size != self.current_batch_size {
                self.apply(new_size, "periodic_adjustment");
                return (new_size, true);
            }
        }

        (self.current_batch_size, false)
    }

    fn detect_degradation(&self, p99_latency_ms: f64) -> bool {
        let Some(ema) = self.ema_p99_ms else {
            return false;
        };
        let threshold = self.config.p99_target_ms * self.config.degradation_threshold;
        p99_latency_ms > threshold && p99_latency_ms > ema * 1.5
    }

    fn calculate_adjustment(&self) -> usize {
        let Some(ema) = self.ema_p99_ms else {
            return self.current_batch_size;
        };
        let deviation = ema - self.config.p99_target_ms;

        if deviation < -self.config.p99_tolerance_ms {
            // Well below target: room for more throughput.
            (self.current_batch_size + self.config.max_adjustment_step)
                .min(self.config.max_batch_size)
        } else if deviation > self.config.p99_tolerance_ms {
            self.current_batch_size
                .saturating_sub(self.config.max_adjustment_step)
                .max(self.config.min_batch_size)
        } else {
            self.current_batch_size
        }
    }

    fn apply(&mut self, new_size: usize, reason: &str) {
        let old_size = self.current_batch_size;
        self.current_batch_size = new_size;
        self.adjustment_count += 1;
        if self.adjustment_history.len() >= HISTORY_CAPACITY {
            self.adjustment_history.pop_front();
        }
        self.adjustment_history.push_back(Adjustment {
            at: Some(Instant::now()),
            batch_size: new_size,
            reason: reason.to_string(),
        });
        tracing::info!(old_size, new_size, reason, "batch size adjusted");
    }

    pub fn current_batch_size(&self) -> usize {
        self.current_batch_size
    }

    /// 1.0 = no adjustments; degrades linearly, reaching 0.0 when one
    /// batch in ten required an adjustment.
    pub fn stability_score(&self) -> f64 {
        if self.batch_count == 0 {
            return 1.0;
        }
        let rate = self.adjustment_count as f64 / self.batch_count as f64;
        (1.0 - rate * 10.0).clamp(0.0, 1.0)
    }

    pub fn metrics(&self) -> ControllerMetrics {
        ControllerMetrics {
            enabled: self.enabled,
            current_batch_size: self.current_batch_size,
            p99_latency_ms: self.p99_history.back().copied().unwrap_or(0.0),
            ema_p99_ms: self.ema_p99_ms.unwrap_or(0.0),
            batch_count: self.batch_count,
            adjustment_count: self.adjustment_count,
            degradation_events: self.degradation_events,
            stability_score: self.stability_score(),
            recent_adjustments: self.adjustment_history.iter().rev().take(10).cloned().collect(),
        }
    }

    /// Reset state, keeping configuration.
    pub fn reset(&mut self) {
        self.current_batch_size = self.config.min_batch_size;
        self.batch_count = 0;
        self.adjustment_count = 0;
        self.degradation_events = 0;
        self.ema_p99_ms = None;
        self.p99_history.clear();
        self.adjustment_history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControllerConfig {
        ControllerConfig {
            min_batch_size: 2,
            max_batch_size: 8,
            adjustment_interval: 10,
            p99_target_ms: 100.0,
            p99_tolerance_ms: 20.0,
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn test_ema_initializes_to_first_sample() {
        let mut controller = AdaptiveController::new(config());
        controller.update(40.0);
        assert_eq!(controller.metrics().ema_p99_ms, 40.0);
    }

    #[test]
    fn test_grows_when_below_target() {
        let mut controller = AdaptiveController::new(config());
        let mut adjusted = false;
        for _ in 0..10 {
            let (_, changed) = controller.update(10.0);
            adjusted |= changed;
        }
        assert!(adjusted);
        assert_eq!(controller.current_batch_size(), 3);
    }

    #[test]
    fn test_shrinks_when_above_target() {
        let mut controller = AdaptiveController::new(config());
        // Push the size up first.
        for _ in 0..30 {
            controller.update(10.0);
        }
        let grown = controller.current_batch_size();
        assert!(grown > 2);

        // Feed latencies above the band but below the degradation spike
        // threshold so only the periodic path fires.
        for _ in 0..40 {
            controller.update(130.0);
        }
        assert!(controller.current_batch_size() < grown);
    }

    #[test]
    fn test_stays_within_bounds() {
        let mut controller = AdaptiveController::new(config());
        for _ in 0..200 {
            controller.update(1.0);
            let size = controller.current_batch_size();
            assert!((2..=8).contains(&size));
        }
        assert_eq!(controller.current_batch_size(), 8);

        for _ in 0..200 {
            controller.update(5000.0);
            let size = controller.current_batch_size();
            assert!((2..=8).contains(&size));
        }
        assert_eq!(controller.current_batch_size(), 2);
    }

    #[test]
    fn test_emergency_degradation_reduces_by_two() {
        let mut controller = AdaptiveController::new(config());
        // Establish a calm EMA and grow the batch size.
        for _ in 0..20 {
            controller.update(10.0);
        }
        let before = controller.current_batch_size();
        assert!(before >= 4, "expected growth before the spike, got {before}");

        // A 500ms spike against a ~10ms EMA with target 100ms and
        // multiplier 2.0 must trigger the emergency path.
        let mut emergency_seen = false;
        for _ in 0..5 {
            let (size, changed) = controller.update(500.0);
            if changed && size + 2 <= before {
                emergency_seen = true;
                break;
            }
        }
        assert!(emergency_seen, "no emergency reduction observed");
        assert_eq!(
            controller
                .metrics()
                .recent_adjustments
                .first()
                .map(|a| a.reason.clone()),
            Some("degradation_emergency".to_string())
        );
    }

    #[test]
    fn test_periodic_step_is_at_most_one() {
        let mut controller = AdaptiveController::new(config());
        let mut last = controller.current_batch_size();
        for i in 0..100 {
            // Alternate calm and moderately-slow latencies; neither side
            // crosses the degradation spike threshold.
            let p99 = if (i / 10) % 2 == 0 { 10.0 } else { 130.0 };
            let (size, _) = controller.update(p99);
            assert!(size.abs_diff(last) <= 1, "step exceeded 1: {last} -> {size}");
            last = size;
        }
    }

    #[test]
    fn test_disabled_controller_never_adjusts() {
        let mut controller = AdaptiveController::disabled(config());
        for _ in 0..50 {
            let (size, changed) = controller.update(900.0);
            assert_eq!(size, 2);
            assert!(!changed);
        }
    }

    #[test]
    fn test_stability_score_clamped() {
        let mut controller = AdaptiveController::new(config());
        assert_eq!(controller.stability_score(), 1.0);
        for _ in 0..100 {
            controller.update(10.0);
        }
        let score = controller.stability_score();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut controller = AdaptiveController::new(config());
        for _ in 0..30 {
            controller.update(10.0);
        }
        controller.reset();
        assert_eq!(controller.current_batch_size(), 2);
        assert_eq!(controller.metrics().batch_count, 0);
        assert_eq!(controller.metrics().ema_p99_ms, 0.0);
    }
}
