//! Sliding-window metrics for the scheduling core.
//!
//! Each metric family (latency, throughput, batch size, queue depth, mode)
//! has its own lock so hot-path recording of different families never
//! contends. Aggregates are cached behind a per-family dirty flag: scrape
//! frequency is seconds, mutation frequency is milliseconds, so repeated
//! reads between mutations hit the cache.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Latency samples kept in the sliding ring.
const LATENCY_CAPACITY: usize = 1000;
/// Batch-size samples kept in the sliding ring.
const BATCH_CAPACITY: usize = 1000;
/// Queue-depth samples kept in the sliding ring.
const QUEUE_CAPACITY: usize = 100;
/// Upper validity bound for a latency sample: one hour in milliseconds.
/// Samples outside (0, 1h] are clock-skew artifacts and are dropped.
const MAX_VALID_LATENCY_MS: f64 = 3_600_000.0;

/// Latency distribution snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub count: usize,
}

/// Throughput rates over the rolling windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThroughputSnapshot {
    pub tokens_per_sec_5s: f64,
    pub tokens_per_sec_30s: f64,
    pub tokens_per_sec_60s: f64,
    pub requests_per_sec_5s: f64,
    pub requests_per_sec_30s: f64,
    pub requests_per_sec_60s: f64,
}

/// Batch-size distribution snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSnapshot {
    pub current_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub mean_size: f64,
    pub distribution: HashMap<usize, u64>,
}

/// Complete point-in-time metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub latency: LatencySnapshot,
    pub throughput: ThroughputSnapshot,
    pub batch: BatchSnapshot,
    pub queue_depth: usize,
    pub mode_transitions: u64,
    pub uptime_seconds: f64,
}

struct LatencyFamily {
    samples: VecDeque<(Instant, f64)>,
    dirty: bool,
    cached: Option<LatencySnapshot>,
}

struct ThroughputWindow {
    seconds: u64,
    tokens: VecDeque<(Instant, u64)>,
    requests: VecDeque<(Instant, u64)>,
}

impl ThroughputWindow {
    fn new(seconds: u64) -> Self {
        let capacity = (seconds as usize) * 10;
        Self {
            seconds,
            tokens: VecDeque::with_capacity(capacity),
            requests: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, now: Instant, tokens: u64, requests: u64) {
        let capacity = (self.seconds as usize) * 10;
        if self.tokens.len() >= capacity {
            self.tokens.pop_front();
        }
        if self.requests.len() >= capacity {
            self.requests.pop_front();
        }
        self.tokens.push_back((now, tokens));
        self.requests.push_back((now, requests));
    }
}

struct ThroughputFamily {
    windows: Vec<ThroughputWindow>,
    dirty: bool,
    cached: Option<ThroughputSnapshot>,
}

struct BatchFamily {
    sizes: VecDeque<usize>,
    distribution: HashMap<usize, u64>,
    dirty: bool,
    cached: Option<BatchSnapshot>,
}

struct QueueFamily {
    depths: VecDeque<(Instant, usize)>,
}

struct ModeFamily {
    transitions: u64,
    current: Option<String>,
}

/// Bounded, cheaply-scraped metrics collector.
pub struct MetricsCollector {
    start: Instant,
    latency: Mutex<LatencyFamily>,
    throughput: Mutex<ThroughputFamily>,
    batch: Mutex<BatchFamily>,
    queue: Mutex<QueueFamily>,
    mode: Mutex<ModeFamily>,
}

impl MetricsCollector {
    /// Create a collector with the default 5 s / 30 s / 60 s windows.
    pub fn new() -> Self {
        Self::with_windows(&[5, 30, 60])
    }

    /// Create a collector with custom window sizes in seconds.
    pub fn with_windows(window_sizes_s: &[u64]) -> Self {
        Self {
            start: Instant::now(),
            latency: Mutex::new(LatencyFamily {
                samples: VecDeque::with_capacity(LATENCY_CAPACITY),
                dirty: true,
                cached: None,
            }),
            throughput: Mutex::new(ThroughputFamily {
                windows: window_sizes_s.iter().map(|&s| ThroughputWindow::new(s)).collect(),
                dirty: true,
                cached: None,
            }),
            batch: Mutex::new(BatchFamily {
                sizes: VecDeque::with_capacity(BATCH_CAPACITY),
                distribution: HashMap::new(),
                dirty: true,
                cached: None,
            }),
            queue: Mutex::new(QueueFamily { depths: VecDeque::with_capacity(QUEUE_CAPACITY) }),
            mode: Mutex::new(ModeFamily { transitions: 0, current: None }),
        }
    }

    /// Record one request latency. Never fails: invalid samples are
    /// dropped with a warning so clock skew cannot corrupt percentiles.
    pub fn record_latency(&self, latency_ms: f64) {
        if !latency_ms.is_finite() || latency_ms <= 0.0 || latency_ms > MAX_VALID_LATENCY_MS {
            tracing::warn!(latency_ms, "dropping invalid latency sample");
            return;
        }
        let mut family = self.latency.lock();
        if family.samples.len() >= LATENCY_CAPACITY {
            family.samples.pop_front();
        }
        family.samples.push_back((Instant::now(), latency_ms));
        family.dirty = true;
    }

    /// Record generated tokens (and the request count that produced them).
    pub fn record_throughput(&self, tokens: u64, requests: u64) {
        let now = Instant::now();
        let mut family = self.throughput.lock();
        for window in &mut family.windows {
            window.push(now, tokens, requests);
        }
        family.dirty = true;
    }

    /// Record the size of an executed batch.
    pub fn record_batch_size(&self, batch_size: usize) {
        let mut family = self.batch.lock();
        if family.sizes.len() >= BATCH_CAPACITY {
            family.sizes.pop_front();
        }
        family.sizes.push_back(batch_size);
        *family.distribution.entry(batch_size).or_insert(0) += 1;
        family.dirty = true;
    }

    /// Record the current queue depth.
    pub fn record_queue_depth(&self, depth: usize) {
        let now = Instant::now();
        let mut family = self.queue.lock();
        if family.depths.len() >= QUEUE_CAPACITY {
            family.depths.pop_front();
        }
        family.depths.push_back((now, depth));
    }

    /// Record a scheduler mode transition (e.g. a batch-size change).
    pub fn record_mode_transition(&self, new_mode: &str) {
        let mut family = self.mode.lock();
        if let Some(current) = &family.current {
            if current != new_mode {
                family.transitions += 1;
            }
        }
        family.current = Some(new_mode.to_string());
    }

    /// Latency percentiles over the current ring. Cached until the next
    /// `record_latency`.
    pub fn latency_metrics(&self) -> LatencySnapshot {
        let samples: Vec<f64> = {
            let mut family = self.latency.lock();
            if !family.dirty {
                if let Some(cached) = family.cached {
                    return cached;
                }
            }
            if family.samples.is_empty() {
                let empty = LatencySnapshot::default();
                family.cached = Some(empty);
                family.dirty = false;
                return empty;
            }
            family.samples.iter().map(|&(_, ms)| ms).collect()
        };

        // Sort and aggregate outside the lock.
        let mut sorted = samples;
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let snapshot = LatencySnapshot {
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            mean_ms: sum / count as f64,
            count,
        };

        let mut family = self.latency.lock();
        family.cached = Some(snapshot);
        family.dirty = false;
        snapshot
    }

    /// Throughput rates over each configured window. Cached until the
    /// next `record_throughput`.
    pub fn throughput_metrics(&self) -> ThroughputSnapshot {
        let now = Instant::now();
        let windows: Vec<(u64, Vec<(Instant, u64)>, Vec<(Instant, u64)>)> = {
            let mut family = self.throughput.lock();
            if !family.dirty {
                if let Some(cached) = family.cached {
                    return cached;
                }
            }
            family
                .windows
                .iter()
                .map(|w| {
                    (
                        w.seconds,
                        w.tokens.iter().copied().collect(),
                        w.requests.iter().copied().collect(),
                    )
                })
                .collect()
        };

        let mut rates = [0.0f64; 6];
        for (slot, (seconds, tokens, requests)) in windows.into_iter().take(3).enumerate() {
            rates[slot] = window_rate(now, seconds, &tokens);
            rates[slot + 3] = window_rate(now, seconds, &requests);
        }
        let snapshot = ThroughputSnapshot {
            tokens_per_sec_5s: rates[0],
            tokens_per_sec_30s: rates[1],
            tokens_per_sec_60s: rates[2],
            requests_per_sec_5s: rates[3],
            requests_per_sec_30s: rates[4],
            requests_per_sec_60s: rates[5],
        };

        let mut family = self.throughput.lock();
        family.cached = Some(snapshot);
        family.dirty = false;
        snapshot
    }

    /// Batch-size distribution. Cached until the next `record_batch_size`.
    pub fn batch_metrics(&self) -> BatchSnapshot {
        let (sizes, distribution) = {
            let mut family = self.batch.lock();
            if !family.dirty {
                if let Some(cached) = &family.cached {
                    return cached.clone();
                }
            }
            if family.sizes.is_empty() {
                let empty = BatchSnapshot::default();
                family.cached = Some(empty.clone());
                family.dirty = false;
                return empty;
            }
            let sizes: Vec<usize> = family.sizes.iter().copied().collect();
            (sizes, family.distribution.clone())
        };

        let count = sizes.len();
        let sum: usize = sizes.iter().sum();
        let snapshot = BatchSnapshot {
            current_size: *sizes.last().unwrap_or(&0),
            min_size: sizes.iter().copied().min().unwrap_or(0),
            max_size: sizes.iter().copied().max().unwrap_or(0),
            mean_size: sum as f64 / count as f64,
            distribution,
        };

        let mut family = self.batch.lock();
        family.cached = Some(snapshot.clone());
        family.dirty = false;
        snapshot
    }

    /// Most recently recorded queue depth.
    pub fn queue_depth(&self) -> usize {
        self.queue.lock().depths.back().map(|&(_, d)| d).unwrap_or(0)
    }

    /// Total mode transitions observed.
    pub fn mode_transitions(&self) -> u64 {
        self.mode.lock().transitions
    }

    /// Full snapshot across all families. Each family is read under its
    /// own lock; the snapshot is consistent enough for export purposes.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            latency: self.latency_metrics(),
            throughput: self.throughput_metrics(),
            batch: self.batch_metrics(),
            queue_depth: self.queue_depth(),
            mode_transitions: self.mode_transitions(),
            uptime_seconds: self.start.elapsed().as_secs_f64(),
        }
    }

    /// Export the snapshot as a JSON value for the telemetry RPC.
    pub fn export_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Clear all rings, distributions, and caches.
    pub fn reset(&self) {
        {
            let mut family = self.latency.lock();
            family.samples.clear();
            family.cached = None;
            family.dirty = true;
        }
        {
            let mut family = self.throughput.lock();
            for window in &mut family.windows {
                window.tokens.clear();
                window.requests.clear();
            }
            family.cached = None;
            family.dirty = true;
        }
        {
            let mut family = self.batch.lock();
            family.sizes.clear();
            family.distribution.clear();
            family.cached = None;
            family.dirty = true;
        }
        self.queue.lock().depths.clear();
        let mut mode = self.mode.lock();
        mode.transitions = 0;
        mode.current = None;
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear-interpolation percentile over a sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0) * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(n - 1);
    let fraction = rank - lower as f64;
    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

/// Rate over a window: total of in-window values divided by the span back
/// to the oldest in-window sample. Sub-millisecond spans report zero.
fn window_rate(now: Instant, window_secs: u64, samples: &[(Instant, u64)]) -> f64 {
    let recent: Vec<&(Instant, u64)> = samples
        .iter()
        .filter(|(ts, _)| now.duration_since(*ts).as_secs_f64() <= window_secs as f64)
        .collect();
    let Some(&&(oldest, _)) = recent.first() else {
        return 0.0;
    };
    let span = now.duration_since(oldest).as_secs_f64();
    if span < 0.001 {
        return 0.0;
    }
    let total: u64 = recent.iter().map(|&&(_, v)| v).sum();
    total as f64 / span
}
