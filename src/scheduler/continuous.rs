//! Step-synchronous continuous batching, one instance per model.
//!
//! Requests join the batch between generation steps and leave the moment
//! they finish, so the accelerator never waits for a full batch and a
//! long generation never blocks a short one. Each step pads the batch to
//! a common length, runs one forward pass on a blocking worker thread,
//! samples one token per request, and retires whatever finished.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::engine::{sampling, ModelBackend, Tokenizer};
use crate::memory::{
    MemoryController, MemoryControllerConfig, MemoryControllerMetrics, PromptCache,
    PromptCacheConfig, PromptCacheStats,
};
use crate::scheduler::streaming::{
    CompletionStats, FinishReason, StreamEvent, StreamSendError, StreamSender,
};
use crate::telemetry::{MetricsCollector, MetricsSnapshot};

/// Pending-queue depth (relative to max batch) that flags overload.
const OVERLOAD_FACTOR: usize = 10;

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("batcher for '{0}' is stopped")]
    Stopped(String),
}

/// Configuration for one continuous batcher.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    /// How long the fill phase waits for more requests.
    pub batch_window_ms: f64,
    pub shutdown_timeout: Duration,
    pub memory: MemoryControllerConfig,
    pub prompt_cache: PromptCacheConfig,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            batch_window_ms: 10.0,
            shutdown_timeout: Duration::from_secs(5),
            memory: MemoryControllerConfig::default(),
            prompt_cache: PromptCacheConfig::default(),
        }
    }
}

/// One generation unit moving through the batcher.
#[derive(Debug)]
pub struct GenerationRequest {
    pub request_id: u64,
    pub stream_id: String,
    pub prompt: String,
    pub prompt_tokens: Vec<u32>,
    pub generated_tokens: Vec<u32>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout: Option<Duration>,
    pub started_at: Instant,
    pub first_token_at: Option<Instant>,
    pub is_finished: bool,
    pub finish_reason: Option<FinishReason>,
    pub error: Option<String>,
}

impl GenerationRequest {
    pub fn new(
        request_id: u64,
        stream_id: String,
        prompt: String,
        prompt_tokens: Vec<u32>,
        max_tokens: usize,
        temperature: f32,
        top_p: f32,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            request_id,
            stream_id,
            prompt,
            prompt_tokens,
            generated_tokens: Vec::new(),
            max_tokens,
            temperature,
            top_p,
            timeout,
            started_at: Instant::now(),
            first_token_at: None,
            is_finished: false,
            finish_reason: None,
            error: None,
        }
    }

    fn finish(&mut self, reason: FinishReason) {
        if !self.is_finished {
            self.is_finished = true;
            self.finish_reason = Some(reason);
        }
    }
}

/// Batcher statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BatcherStats {
    pub running: bool,
    pub active_batch_size: usize,
    pub pending_queue_size: usize,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub avg_batch_size: f64,
    pub max_batch_size: usize,
    pub current_batch_limit: usize,
    pub batch_window_ms: f64,
    pub total_tokens_generated: u64,
}

/// Health verdict with the reasons when unhealthy.
#[derive(Debug, Clone, Serialize)]
pub struct BatcherHealth {
    pub healthy: bool,
    pub running: bool,
    pub active_batch_size: usize,
    pub pending_queue_size: usize,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub max_batch_size: usize,
    pub error_indicators: Vec<String>,
}

/// Roll-up of the memory, cache, and throughput state.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationSummary {
    pub memory_controller: MemoryControllerMetrics,
    pub prompt_cache: PromptCacheStats,
    pub stats: BatcherStats,
}

/// Per-row output of one blocking generation step.
enum RowOutcome {
    Token { token_id: u32, text: String },
    DecodeError(String),
}

struct StepInput {
    tokens: Vec<u32>,
    temperature: f32,
    top_p: f32,
}

/// Continuous batcher for one loaded model.
pub struct ContinuousBatcher {
    model_id: String,
    backend: Arc<dyn ModelBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    config: BatcherConfig,

    pending_tx: parking_lot::RwLock<mpsc::UnboundedSender<GenerationRequest>>,
    pending_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<GenerationRequest>>>,
    pending_depth: AtomicUsize,

    /// One sender per live request; dropped together with the request.
    senders: parking_lot::Mutex<HashMap<u64, StreamSender>>,
    cancel_requested: parking_lot::Mutex<HashSet<u64>>,

    running: AtomicBool,
    stopped: AtomicBool,
    cancel: parking_lot::Mutex<CancellationToken>,
    loop_handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,

    memory_ctrl: parking_lot::Mutex<MemoryController>,
    prompt_cache: PromptCache,
    metrics: Arc<MetricsCollector>,

    total_requests: AtomicU64,
    completed_requests: AtomicU64,
    total_tokens: AtomicU64,
    active_count: AtomicUsize,
    current_batch_limit: AtomicUsize,
    /// f64 bits of the running batch-size EMA.
    avg_batch_size_bits: AtomicU64,
}

impl ContinuousBatcher {
    pub fn new(
        model_id: String,
        backend: Arc<dyn ModelBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        config: BatcherConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let memory_config = MemoryControllerConfig {
            max_batch_size: config.max_batch_size,
            ..config.memory.clone()
        };
        let probe = backend.memory_probe();
        let max_batch = config.max_batch_size;
        Self {
            model_id,
            backend,
            tokenizer,
            prompt_cache: PromptCache::new(config.prompt_cache.clone()),
            config,
            pending_tx: parking_lot::RwLock::new(tx),
            pending_rx: AsyncMutex::new(Some(rx)),
            pending_depth: AtomicUsize::new(0),
            senders: parking_lot::Mutex::new(HashMap::new()),
            cancel_requested: parking_lot::Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            loop_handle: AsyncMutex::new(None),
            memory_ctrl: parking_lot::Mutex::new(MemoryController::new(memory_config, probe)),
            metrics: Arc::new(MetricsCollector::new()),
            total_requests: AtomicU64::new(0),
            completed_requests: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            active_count: AtomicUsize::new(0),
            current_batch_limit: AtomicUsize::new(max_batch),
            avg_batch_size_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Launch the background loop. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(false, Ordering::SeqCst);

        // A restart after stop() gets a fresh channel and token.
        let rx = {
            let mut rx_slot = self.pending_rx.lock().await;
            match rx_slot.take() {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    *self.pending_tx.write() = tx;
                    self.pending_depth.store(0, Ordering::SeqCst);
                    rx
                }
            }
        };
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        let batcher = self.clone();
        let handle = tokio::spawn(async move {
            batcher.batch_loop(rx, token).await;
        });
        *self.loop_handle.lock().await = Some(handle);
        tracing::info!(model_id = %self.model_id, "continuous batcher started");
    }

    /// Stop the loop and emit a `shutdown` completion for every request
    /// still pending or active. Bounded wait, then abort.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel.lock().cancel();

        if let Some(mut handle) = self.loop_handle.lock().await.take() {
            if tokio::time::timeout(self.config.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(model_id = %self.model_id, "batch loop did not stop in time, aborting");
                handle.abort();
            }
        }
        tracing::info!(model_id = %self.model_id, "continuous batcher stopped");
    }

    /// Admit a request. O(1): stores the event sender and enqueues.
    pub fn add_request(
        &self,
        request: GenerationRequest,
        events: StreamSender,
    ) -> Result<(), BatcherError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BatcherError::Stopped(self.model_id.clone()));
        }

        if let Some(cached) = self.prompt_cache.get(&request.prompt) {
            tracing::debug!(
                request_id = request.request_id,
                prompt_hash = %cached.prompt_hash,
                use_count = cached.use_count,
                "prompt cache hit"
            );
        }

        let request_id = request.request_id;
        self.senders.lock().insert(request_id, events);
        if self.pending_tx.read().send(request).is_err() {
            self.senders.lock().remove(&request_id);
            return Err(BatcherError::Stopped(self.model_id.clone()));
        }
        self.pending_depth.fetch_add(1, Ordering::SeqCst);
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Cancel a live request. Pending requests are dropped at the next
    /// fill; active requests finish with `cancelled` at the next step.
    /// Returns false for unknown or already-terminated ids.
    pub fn cancel_request(&self, request_id: u64) -> bool {
        if self.senders.lock().contains_key(&request_id) {
            self.cancel_requested.lock().insert(request_id);
            true
        } else {
            false
        }
    }

    fn avg_batch_size(&self) -> f64 {
        f64::from_bits(self.avg_batch_size_bits.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            running: self.running.load(Ordering::SeqCst),
            active_batch_size: self.active_count.load(Ordering::SeqCst),
            pending_queue_size: self.pending_depth.load(Ordering::SeqCst),
            total_requests: self.total_requests.load(Ordering::SeqCst),
            completed_requests: self.completed_requests.load(Ordering::SeqCst),
            avg_batch_size: self.avg_batch_size(),
            max_batch_size: self.config.max_batch_size,
            current_batch_limit: self.current_batch_limit.load(Ordering::SeqCst),
            batch_window_ms: self.config.batch_window_ms,
            total_tokens_generated: self.total_tokens.load(Ordering::SeqCst),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health_check(&self) -> BatcherHealth {
        let stats = self.stats();
        let mut error_indicators = Vec::new();

        if !stats.running {
            error_indicators.push("batcher not running".to_string());
        }
        if stats.pending_queue_size > stats.max_batch_size * OVERLOAD_FACTOR {
            error_indicators.push(format!(
                "pending queue overloaded: {} requests",
                stats.pending_queue_size
            ));
        }
        if stats.completed_requests == 0 && stats.total_requests >= stats.max_batch_size as u64 {
            error_indicators.push(format!(
                "batch loop may be stuck ({} requests, 0 completions)",
                stats.total_requests
            ));
        }

        BatcherHealth {
            healthy: error_indicators.is_empty(),
            running: stats.running,
            active_batch_size: stats.active_batch_size,
            pending_queue_size: stats.pending_queue_size,
            total_requests: stats.total_requests,
            completed_requests: stats.completed_requests,
            max_batch_size: stats.max_batch_size,
            error_indicators,
        }
    }

    pub fn optimization_summary(&self) -> OptimizationSummary {
        OptimizationSummary {
            memory_controller: self.memory_ctrl.lock().metrics(),
            prompt_cache: self.prompt_cache.stats(),
            stats: self.stats(),
        }
    }

    async fn batch_loop(
        self: Arc<Self>,
        mut pending: mpsc::UnboundedReceiver<GenerationRequest>,
        cancel: CancellationToken,
    ) {
        let mut active: Vec<GenerationRequest> = Vec::new();
        let window = Duration::from_secs_f64(self.config.batch_window_ms / 1000.0);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.fill_batch(&mut pending, &mut active).await;

            if active.is_empty() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(window) => {}
                }
                continue;
            }

            self.scan_timeouts(&mut active);
            self.scan_cancellations(&mut active);
            self.retire_finished(&mut active).await;
            if active.is_empty() {
                self.publish_active(&active);
                continue;
            }

            self.metrics.record_batch_size(active.len());
            self.metrics.record_queue_depth(self.pending_depth.load(Ordering::SeqCst));

            let memory_limit = self.memory_ctrl.lock().get_max_batch_size(active.len());
            self.current_batch_limit
                .store(memory_limit.min(self.config.max_batch_size), Ordering::SeqCst);

            match self.generate_step(&active).await {
                Ok(outcomes) => self.apply_step(&mut active, outcomes).await,
                Err(message) => {
                    // Whole-batch failure: every member fails, the loop
                    // survives.
                    tracing::error!(
                        model_id = %self.model_id,
                        batch = active.len(),
                        error = %message,
                        "batch generation step failed"
                    );
                    for request in &mut active {
                        request.error = Some(message.clone());
                        request.finish(FinishReason::Error);
                    }
                }
            }

            self.retire_finished(&mut active).await;
            self.publish_active(&active);

            if !active.is_empty() {
                let avg = self.avg_batch_size() * 0.9 + active.len() as f64 * 0.1;
                self.avg_batch_size_bits.store(avg.to_bits(), Ordering::SeqCst);
            }
        }

        self.drain_on_shutdown(&mut pending, &mut active).await;
    }

    fn publish_active(&self, active: &[GenerationRequest]) {
        self.active_count.store(active.len(), Ordering::SeqCst);
    }

    /// Pull pending requests: everything immediately available, then wait
    /// out the batch window for more.
    async fn fill_batch(
        &self,
        pending: &mut mpsc::UnboundedReceiver<GenerationRequest>,
        active: &mut Vec<GenerationRequest>,
    ) {
        let limit = self
            .current_batch_limit
            .load(Ordering::SeqCst)
            .min(self.config.max_batch_size)
            .max(1);
        let mut capacity = limit.saturating_sub(active.len());
        if capacity == 0 {
            return;
        }

        while capacity > 0 {
            match pending.try_recv() {
                Ok(request) => {
                    self.pending_depth.fetch_sub(1, Ordering::SeqCst);
                    if self.admit(request, active).await {
                        capacity -= 1;
                    }
                }
                Err(_) => break,
            }
        }

        if capacity == 0 || self.config.batch_window_ms <= 0.0 {
            self.publish_active(active);
            return;
        }

        let deadline = Instant::now() + Duration::from_secs_f64(self.config.batch_window_ms / 1000.0);
        while capacity > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, pending.recv()).await {
                Ok(Some(request)) => {
                    self.pending_depth.fetch_sub(1, Ordering::SeqCst);
                    if self.admit(request, active).await {
                        capacity -= 1;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        self.publish_active(active);
    }

    /// Move one dequeued request into the active batch unless it was
    /// cancelled while pending. Returns whether it was admitted.
    async fn admit(
        &self,
        mut request: GenerationRequest,
        active: &mut Vec<GenerationRequest>,
    ) -> bool {
        if self.cancel_requested.lock().remove(&request.request_id) {
            request.finish(FinishReason::Cancelled);
            self.complete_request(request).await;
            return false;
        }
        active.push(request);
        true
    }

    fn scan_timeouts(&self, active: &mut [GenerationRequest]) {
        let now = Instant::now();
        for request in active.iter_mut() {
            if request.is_finished {
                continue;
            }
            if let Some(timeout) = request.timeout {
                if now.duration_since(request.started_at) > timeout {
                    request.finish(FinishReason::Timeout);
                }
            }
        }
    }

    fn scan_cancellations(&self, active: &mut [GenerationRequest]) {
        let mut cancelled = self.cancel_requested.lock();
        if cancelled.is_empty() {
            return;
        }
        for request in active.iter_mut() {
            if !request.is_finished && cancelled.remove(&request.request_id) {
                request.finish(FinishReason::Cancelled);
            }
        }
    }

    /// One generation step for the whole batch, off the coordinator.
    async fn generate_step(&self, active: &[GenerationRequest]) -> Result<Vec<RowOutcome>, String> {
        let inputs: Vec<StepInput> = active
            .iter()
            .map(|request| {
                let mut tokens =
                    Vec::with_capacity(request.prompt_tokens.len() + request.generated_tokens.len());
                tokens.extend_from_slice(&request.prompt_tokens);
                tokens.extend_from_slice(&request.generated_tokens);
                StepInput {
                    tokens,
                    temperature: request.temperature,
                    top_p: request.top_p,
                }
            })
            .collect();

        let backend = self.backend.clone();
        let tokenizer = self.tokenizer.clone();

        tokio::task::spawn_blocking(move || run_step(&*backend, &*tokenizer, inputs))
            .await
            .map_err(|join| format!("generation step panicked: {join}"))?
    }

    /// Fold step outcomes back into request state and emit token events.
    async fn apply_step(&self, active: &mut [GenerationRequest], outcomes: Vec<RowOutcome>) {
        let eos_token_id = self.backend.eos_token_id();

        for (request, outcome) in active.iter_mut().zip(outcomes) {
            if request.is_finished {
                continue;
            }
            match outcome {
                RowOutcome::Token { token_id, text } => {
                    if request.first_token_at.is_none() {
                        request.first_token_at = Some(Instant::now());
                    }
                    request.generated_tokens.push(token_id);
                    self.total_tokens.fetch_add(1, Ordering::SeqCst);

                    let sender = self.senders.lock().get(&request.request_id).cloned();
                    if let Some(sender) = sender {
                        match sender.send(StreamEvent::Token { token_id, text }).await {
                            Ok(()) => {}
                            Err(StreamSendError::ConsumerTooSlow) => {
                                request.error = Some("stream consumer too slow".to_string());
                                request.finish(FinishReason::Error);
                                continue;
                            }
                            Err(StreamSendError::Closed) => {
                                // Receiver went away; treat as cancel.
                                request.finish(FinishReason::Cancelled);
                                continue;
                            }
                        }
                    }

                    if eos_token_id == Some(token_id) {
                        request.finish(FinishReason::Eos);
                    } else if request.generated_tokens.len() >= request.max_tokens {
                        request.finish(FinishReason::Length);
                    }
                }
                RowOutcome::DecodeError(message) => {
                    tracing::error!(
                        request_id = request.request_id,
                        error = %message,
                        "per-request step error"
                    );
                    request.error = Some(message);
                    request.finish(FinishReason::Error);
                }
            }
        }
    }

    /// Emit completions for finished requests and drop them from the
    /// batch.
    async fn retire_finished(&self, active: &mut Vec<GenerationRequest>) {
        if !active.iter().any(|r| r.is_finished) {
            return;
        }
        let mut keep = Vec::with_capacity(active.len());
        for request in active.drain(..) {
            if request.is_finished {
                self.complete_request(request).await;
            } else {
                keep.push(request);
            }
        }
        *active = keep;
    }

    /// Terminal bookkeeping for exactly one request: metrics, prompt
    /// cache, the completion event, and callback teardown.
    async fn complete_request(&self, request: GenerationRequest) {
        let reason = request.finish_reason.unwrap_or(FinishReason::Error);
        let duration = request.started_at.elapsed();
        let duration_ms = duration.as_secs_f64() * 1000.0;
        let ttft_ms = request
            .first_token_at
            .map(|at| at.duration_since(request.started_at).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        let tokens = request.generated_tokens.len();
        let tokens_per_sec = if duration.as_secs_f64() > 0.0 {
            tokens as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        self.metrics.record_latency(duration_ms);
        self.metrics.record_throughput(tokens as u64, 1);

        if matches!(reason, FinishReason::Eos | FinishReason::Length)
            && !request.prompt.is_empty()
            && !self.prompt_cache.contains(&request.prompt)
        {
            self.prompt_cache
                .insert(&request.prompt, request.prompt_tokens.len(), None);
        }

        let sender = self.senders.lock().remove(&request.request_id);
        self.cancel_requested.lock().remove(&request.request_id);

        if let Some(sender) = sender {
            let stats = CompletionStats {
                finish_reason: reason,
                tokens_generated: tokens,
                duration_ms,
                ttft_ms,
                tokens_per_sec,
                error: request.error.clone(),
            };
            if let Err(e) = sender.send(StreamEvent::Complete(stats)).await {
                // Emission failures never propagate into the loop.
                tracing::warn!(
                    stream_id = %request.stream_id,
                    error = %e,
                    "failed to emit completion"
                );
            }
        }

        self.completed_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Shutdown path: everything still alive gets a `shutdown` terminal.
    async fn drain_on_shutdown(
        &self,
        pending: &mut mpsc::UnboundedReceiver<GenerationRequest>,
        active: &mut Vec<GenerationRequest>,
    ) {
        for mut request in active.drain(..) {
            request.error = Some("batcher stopped during processing".to_string());
            request.finish(FinishReason::Shutdown);
            self.complete_request(request).await;
        }
        self.publish_active(active);

        while let Ok(mut request) = pending.try_recv() {
            self.pending_depth.fetch_sub(1, Ordering::SeqCst);
            request.error = Some("batcher stopped before processing began".to_string());
            request.finish(FinishReason::Shutdown);
            self.complete_request(request).await;
        }
    }
}

/// Pad the batch, run one forward pass, sample and decode one token per
/// row. Runs on a blocking worker thread; the backend synchronize call at
/// the end flushes all outstanding accelerator work for this step.
fn run_step(
    backend: &dyn ModelBackend,
    tokenizer: &dyn Tokenizer,
    inputs: Vec<StepInput>,
) -> Result<Vec<RowOutcome>, String> {
    let pad_id = backend.pad_token_id();
    let max_len = inputs.iter().map(|r| r.tokens.len()).max().unwrap_or(0);

    let mut batch = Vec::with_capacity(inputs.len());
    let mut mask = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let mut row = input.tokens.clone();
        let mut row_mask = vec![1u8; row.len()];
        row.resize(max_len, pad_id);
        row_mask.resize(max_len, 0);
        batch.push(row);
        mask.push(row_mask);
    }

    let logits = backend.forward(&batch, &mask).map_err(|e| e.to_string())?;
    if logits.len() != inputs.len() {
        return Err(format!(
            "backend returned {} logit rows for batch of {}",
            logits.len(),
            inputs.len()
        ));
    }

    let mut rng = rand::thread_rng();
    let outcomes = inputs
        .iter()
        .zip(logits.iter())
        .map(|(input, row_logits)| {
            let token_id =
                sampling::sample_token(&mut rng, row_logits, input.temperature, input.top_p);
            match tokenizer.decode(&[token_id]) {
                Ok(text) => RowOutcome::Token { token_id, text },
                Err(e) => RowOutcome::DecodeError(e.to_string()),
            }
        })
        .collect();

    backend.synchronize().map_err(|e| e.to_string())?;
    Ok(outcomes)
}
