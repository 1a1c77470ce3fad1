//! Single-point GPU scheduler.
//!
//! Funnels tensor-library calls from many tasks through one commit
//! worker. The accelerator's command-buffer API cannot be driven from
//! multiple host threads, so at most one operation is in flight at any
//! instant; everything else here (micro-batching, the fast path,
//! auto-tuning) exists to make that serialization cheap.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::engine::BackendError;
use crate::scheduler::adaptive::{AdaptiveController, ControllerConfig, ControllerMetrics};
use crate::scheduler::job::{GpuJob, JobDisposition, JobFuture, JobPriority};
use crate::scheduler::priority::AsyncPriorityQueue;
use crate::telemetry::{LatencySnapshot, MetricsCollector};

/// Idle wait between polls when the queue stays empty.
const IDLE_WAIT: Duration = Duration::from_millis(1);
/// Legacy degradation needs this many latency samples before acting.
const LEGACY_MIN_SAMPLES: usize = 100;
/// Auto-tune needs this many latency samples before acting.
const AUTO_TUNE_MIN_SAMPLES: usize = 10;
/// Floor for the legacy window-halving strategy.
const MIN_WINDOW_MS: f64 = 0.5;

#[derive(Debug, Error)]
pub enum GpuSchedulerError {
    #[error("GPU scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Configuration for the GPU scheduler.
#[derive(Debug, Clone)]
pub struct GpuSchedulerConfig {
    /// False = direct passthrough (no worker, no batching).
    pub enabled: bool,
    pub batch_window_ms: f64,
    pub max_batch_size: usize,
    pub p99_threshold_ms: f64,
    /// Commit a lone job immediately when the queue is empty.
    pub fast_path: bool,
    /// Resize the batching window from queue depth.
    pub adaptive_window: bool,
    pub adaptive_window_low_ms: f64,
    pub adaptive_window_medium_ms: f64,
    pub adaptive_window_high_ms: f64,
    /// Drive batch size from the adaptive controller.
    pub auto_tune: bool,
    pub controller: ControllerConfig,
    pub shutdown_timeout: Duration,
}

impl Default for GpuSchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_window_ms: 1.0,
            max_batch_size: 4,
            p99_threshold_ms: 100.0,
            fast_path: true,
            adaptive_window: false,
            adaptive_window_low_ms: 0.75,
            adaptive_window_medium_ms: 1.0,
            adaptive_window_high_ms: 2.0,
            auto_tune: false,
            controller: ControllerConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Counts of adaptive-window adjustments per load band.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WindowAdjustments {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

/// Scheduler statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSchedulerStats {
    pub enabled: bool,
    pub running: bool,
    pub total_jobs: u64,
    pub total_batches: u64,
    pub fast_path_hits: u64,
    pub degradation_events: u64,
    pub current_batch_size: usize,
    pub current_window_ms: f64,
    pub queue_size: usize,
    pub latency: LatencySnapshot,
    pub adaptive_window: WindowAdjustments,
    pub auto_tune: Option<ControllerMetrics>,
}

/// Serializes GPU submissions through a single commit worker with
/// micro-batching and priority ordering.
pub struct GpuScheduler {
    config: GpuSchedulerConfig,
    queue: AsyncPriorityQueue<GpuJob>,
    metrics: Arc<MetricsCollector>,
    controller: Mutex<Option<AdaptiveController>>,

    running: AtomicBool,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,

    next_job_id: AtomicU64,
    total_jobs: AtomicU64,
    total_batches: AtomicU64,
    fast_path_hits: AtomicU64,
    degradation_events: AtomicU64,
    current_batch_size: AtomicUsize,
    /// Microseconds, so the window fits in an atomic.
    current_window_us: AtomicU64,
    window_low: AtomicU64,
    window_medium: AtomicU64,
    window_high: AtomicU64,
}

impl GpuScheduler {
    pub fn new(config: GpuSchedulerConfig) -> Self {
        let controller = if config.auto_tune {
            Some(AdaptiveController::new(config.controller.clone()))
        } else {
            None
        };
        // With auto-tune on, start from the controller's recommendation
        // so the two never disagree at startup.
        let initial_batch = controller
            .as_ref()
            .map(|c| c.current_batch_size())
            .unwrap_or(config.max_batch_size);
        let window_us = (config.batch_window_ms * 1000.0) as u64;

        tracing::info!(
            enabled = config.enabled,
            batch_size = initial_batch,
            window_ms = config.batch_window_ms,
            p99_threshold_ms = config.p99_threshold_ms,
            auto_tune = config.auto_tune,
            fast_path = config.fast_path,
            adaptive_window = config.adaptive_window,
            "GPU scheduler initialized"
        );

        Self {
            config,
            queue: AsyncPriorityQueue::new(),
            metrics: Arc::new(MetricsCollector::new()),
            controller: Mutex::new(controller),
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            next_job_id: AtomicU64::new(1),
            total_jobs: AtomicU64::new(0),
            total_batches: AtomicU64::new(0),
            fast_path_hits: AtomicU64::new(0),
            degradation_events: AtomicU64::new(0),
            current_batch_size: AtomicUsize::new(initial_batch),
            current_window_us: AtomicU64::new(window_us),
            window_low: AtomicU64::new(0),
            window_medium: AtomicU64::new(0),
            window_high: AtomicU64::new(0),
        }
    }

    /// Launch the commit worker. Idempotent; a disabled scheduler stays
    /// in passthrough mode and never spawns.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled || self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            scheduler.commit_worker().await;
        });
        *self.worker.lock().await = Some(handle);
    }

    /// Stop the worker: let the current batch finish within the shutdown
    /// timeout, then cancel. Pending jobs complete with a shutdown error.
    pub async fn stop(&self) {
        if !self.config.enabled || !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        if let Some(mut handle) = self.worker.lock().await.take() {
            if tokio::time::timeout(self.config.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("commit worker did not stop in time, aborting");
                handle.abort();
            }
        }

        // Fail whatever never got dequeued.
        while let Ok(job) = self.queue.try_get().await {
            (job.run)(JobDisposition::Shutdown).await;
        }
    }

    /// Schedule a GPU operation and await its result.
    ///
    /// Disabled schedulers execute the operation inline (passthrough).
    pub async fn schedule<T, F, Fut>(
        &self,
        priority: JobPriority,
        operation: F,
    ) -> Result<T, GpuSchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, BackendError>> + Send + 'static,
    {
        if !self.config.enabled {
            return operation().await.map_err(GpuSchedulerError::from);
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GpuSchedulerError::ShuttingDown);
        }

        let (tx, rx) = oneshot::channel::<Result<T, GpuSchedulerError>>();
        let job = GpuJob {
            job_id: self.next_job_id.fetch_add(1, Ordering::SeqCst),
            priority,
            enqueued_at: Instant::now(),
            run: Box::new(move |disposition| {
                let fut: JobFuture = match disposition {
                    JobDisposition::Execute => Box::pin(async move {
                        let result = operation().await.map_err(GpuSchedulerError::from);
                        let _ = tx.send(result);
                    }),
                    JobDisposition::Shutdown => Box::pin(async move {
                        let _ = tx.send(Err(GpuSchedulerError::ShuttingDown));
                    }),
                };
                fut
            }),
        };

        self.total_jobs.fetch_add(1, Ordering::SeqCst);
        self.queue.put(job, priority.as_queue_priority()).await;

        rx.await.unwrap_or(Err(GpuSchedulerError::ShuttingDown))
    }

    async fn commit_worker(self: Arc<Self>) {
        tracing::debug!("commit worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let batch = self.collect_batch().await;
            if batch.is_empty() {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(IDLE_WAIT) => {}
                }
                continue;
            }

            self.execute_batch(batch).await;
            self.total_batches.fetch_add(1, Ordering::SeqCst);
            self.check_degradation().await;
        }
        tracing::debug!("commit worker exited");
    }

    /// Pick the batching window for the current queue depth.
    async fn adjust_window_for_load(&self) {
        if !self.config.adaptive_window {
            return;
        }
        let depth = self.queue.len().await;
        let (window_ms, counter) = if depth <= 1 {
            (self.config.adaptive_window_low_ms, &self.window_low)
        } else if depth <= 5 {
            (self.config.adaptive_window_medium_ms, &self.window_medium)
        } else {
            (self.config.adaptive_window_high_ms, &self.window_high)
        };
        self.current_window_us
            .store((window_ms * 1000.0) as u64, Ordering::SeqCst);
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Collect jobs inside the batching window, honoring the fast path
    /// and urgent bypass.
    async fn collect_batch(&self) -> Vec<GpuJob> {
        self.adjust_window_for_load().await;

        let batch_size = self.current_batch_size.load(Ordering::SeqCst).max(1);
        let window = Duration::from_micros(self.current_window_us.load(Ordering::SeqCst));
        let deadline = Instant::now() + window;
        let mut batch = Vec::with_capacity(batch_size);

        while batch.len() < batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && !batch.is_empty() {
                break;
            }
            let wait = if remaining.is_zero() { IDLE_WAIT } else { remaining };

            let job = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = tokio::time::timeout(wait, self.queue.get()) => match result {
                    Ok(job) => job,
                    Err(_) => break,
                }
            };

            let urgent = job.priority == JobPriority::Urgent;
            batch.push(job);

            if urgent {
                break;
            }
            if self.config.fast_path && batch.len() == 1 && self.queue.is_empty().await {
                // Sequential workloads hit this on nearly every job: one
                // request in, nothing queued behind it, no point waiting
                // out the window.
                self.fast_path_hits.fetch_add(1, Ordering::SeqCst);
                break;
            }
        }

        batch
    }

    /// Run jobs one at a time. This is the serialization point: no job
    /// starts before the previous one finished.
    async fn execute_batch(&self, batch: Vec<GpuJob>) {
        let batch_len = batch.len();
        for job in batch {
            let enqueued_at = job.enqueued_at;
            (job.run)(JobDisposition::Execute).await;
            let latency_ms = enqueued_at.elapsed().as_secs_f64() * 1000.0;
            self.metrics.record_latency(latency_ms);
        }
        self.metrics.record_batch_size(batch_len);
        self.metrics.record_queue_depth(self.queue.len().await);
    }

    async fn check_degradation(&self) {
        let mut controller = self.controller.lock().await;
        if let Some(controller) = controller.as_mut() {
            let latency = self.metrics.latency_metrics();
            if latency.count < AUTO_TUNE_MIN_SAMPLES {
                return;
            }
            let (new_size, adjusted) = controller.update(latency.p99_ms);
            if adjusted {
                let old = self.current_batch_size.swap(new_size, Ordering::SeqCst);
                tracing::info!(old, new = new_size, p99_ms = latency.p99_ms, "auto-tune adjusted batch size");
                self.metrics
                    .record_mode_transition(&format!("batch_size_{new_size}"));
            }
            return;
        }
        drop(controller);

        // Legacy degradation: shrink batch, then window, then warn.
        let latency = self.metrics.latency_metrics();
        if latency.count < LEGACY_MIN_SAMPLES || latency.p99_ms <= self.config.p99_threshold_ms {
            return;
        }
        self.degradation_events.fetch_add(1, Ordering::SeqCst);

        let batch = self.current_batch_size.load(Ordering::SeqCst);
        if batch > 1 {
            let halved = (batch / 2).max(1);
            self.current_batch_size.store(halved, Ordering::SeqCst);
            tracing::warn!(p99_ms = latency.p99_ms, new_batch = halved, "auto-degrade: batch size halved");
            return;
        }

        let window_us = self.current_window_us.load(Ordering::SeqCst);
        let window_ms = window_us as f64 / 1000.0;
        if window_ms > MIN_WINDOW_MS {
            let halved = (window_ms / 2.0).max(MIN_WINDOW_MS);
            self.current_window_us
                .store((halved * 1000.0) as u64, Ordering::SeqCst);
            tracing::warn!(p99_ms = latency.p99_ms, new_window_ms = halved, "auto-degrade: window halved");
            return;
        }

        tracing::warn!(
            p99_ms = latency.p99_ms,
            threshold_ms = self.config.p99_threshold_ms,
            "p99 over threshold with degradation limit reached"
        );
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub async fn stats(&self) -> GpuSchedulerStats {
        let controller = self.controller.lock().await;
        GpuSchedulerStats {
            enabled: self.config.enabled,
            running: self.running.load(Ordering::SeqCst),
            total_jobs: self.total_jobs.load(Ordering::SeqCst),
            total_batches: self.total_batches.load(Ordering::SeqCst),
            fast_path_hits: self.fast_path_hits.load(Ordering::SeqCst),
            degradation_events: self.degradation_events.load(Ordering::SeqCst),
            current_batch_size: self.current_batch_size.load(Ordering::SeqCst),
            current_window_ms: self.current_window_us.load(Ordering::SeqCst) as f64 / 1000.0,
            queue_size: self.queue.len().await,
            latency: self.metrics.latency_metrics(),
            adaptive_window: WindowAdjustments {
                low: self.window_low.load(Ordering::SeqCst),
                medium: self.window_medium.load(Ordering::SeqCst),
                high: self.window_high.load(Ordering::SeqCst),
            },
            auto_tune: controller.as_ref().map(|c| c.metrics()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GpuSchedulerConfig {
        GpuSchedulerConfig {
            batch_window_ms: 2.0,
            max_batch_size: 4,
            ..GpuSchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_passthrough_when_disabled() {
        let scheduler = Arc::new(GpuScheduler::new(GpuSchedulerConfig {
            enabled: false,
            ..test_config()
        }));
        let result = scheduler
            .schedule(JobPriority::Default, || async { Ok::<_, BackendError>(41 + 1) })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(scheduler.stats().await.total_jobs, 0);
    }

    #[tokio::test]
    async fn test_schedule_returns_operation_result() {
        let scheduler = Arc::new(GpuScheduler::new(test_config()));
        scheduler.start().await;

        let result = scheduler
            .schedule(JobPriority::Default, || async { Ok::<_, BackendError>("out") })
            .await
            .unwrap();
        assert_eq!(result, "out");

        let stats = scheduler.stats().await;
        assert_eq!(stats.total_jobs, 1);
        assert!(stats.total_batches >= 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_operation_error_is_isolated() {
        let scheduler = Arc::new(GpuScheduler::new(test_config()));
        scheduler.start().await;

        let failed = scheduler
            .schedule(JobPriority::Default, || async {
                Err::<u32, _>(BackendError::Forward("boom".into()))
            })
            .await;
        assert!(failed.is_err());

        // The worker keeps going after a failed job.
        let ok = scheduler
            .schedule(JobPriority::Default, || async { Ok::<_, BackendError>(7) })
            .await
            .unwrap();
        assert_eq!(ok, 7);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_fails_pending_jobs_with_shutdown() {
        let scheduler = Arc::new(GpuScheduler::new(test_config()));
        // Never started: jobs stay queued until stop() drains them.
        let sched = scheduler.clone();
        let pending = tokio::spawn(async move {
            sched
                .schedule(JobPriority::Default, || async { Ok::<_, BackendError>(1) })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.running.store(true, Ordering::SeqCst);
        scheduler.stop().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(GpuSchedulerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_rejected() {
        let scheduler = Arc::new(GpuScheduler::new(test_config()));
        scheduler.start().await;
        scheduler.stop().await;

        let result = scheduler
            .schedule(JobPriority::Default, || async { Ok::<_, BackendError>(1) })
            .await;
        assert!(matches!(result, Err(GpuSchedulerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_fast_path_counted_for_sequential_jobs() {
        let scheduler = Arc::new(GpuScheduler::new(test_config()));
        scheduler.start().await;

        for _ in 0..5 {
            scheduler
                .schedule(JobPriority::Default, || async { Ok::<_, BackendError>(()) })
                .await
                .unwrap();
        }
        assert!(scheduler.stats().await.fast_path_hits >= 1);
        scheduler.stop().await;
    }
}
