//! mx-serve: on-host inference serving runtime.
//!
//! A control plane speaks line-framed JSON-RPC 2.0 over stdio to this
//! process. The runtime loads models through an opaque tensor backend,
//! tokenizes, and streams generated tokens, while the scheduling core
//! keeps many concurrent requests sharing one accelerator without
//! driving its command-buffer API from more than one place at a time.
//!
//! # Architecture
//!
//! - `engine`: backend capability traits, sampling, single-stream
//!   generation.
//! - `scheduler`: priority admission queue, the GPU commit worker,
//!   adaptive batch tuning, and per-model continuous batchers.
//! - `memory`: KV cache pool, prompt cache, memory-based batch caps.
//! - `models`: loader, registry, draft compatibility.
//! - `ipc`: wire protocol, line framing, stream bridge, dispatcher.
//! - `telemetry`: metrics collector and Prometheus export.
//!
//! All shared mutable state is owned by one [`Runtime`] value built at
//! process start; nothing here is a global.

pub mod config;
pub mod engine;
pub mod ipc;
pub mod memory;
pub mod models;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod validate;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use config::{BridgeConfig, ModelLimitsConfig, RuntimeConfig};

use engine::generate::{run_stream, GenerateOptions};
use engine::{BackendProvider, LoadRequest};
use ipc::bridge::{forward_stream, BufferPool, Outbound};
use ipc::protocol::{
    codes, BatchCheckDraftParams, BatchGenerateParams, BatchTokenizeParams, BatcherTargetParams,
    CheckDraftParams, GenerateParams, GenerateWithImageParams, LoadModelParams, RpcError,
    TokenizeParams, UnloadModelParams,
};
use memory::KvCachePool;
use models::{check_draft, ModelHandle, ModelLoader, ModelRegistry};
use scheduler::{ContinuousBatcher, GenerationRequest, GpuScheduler, JobPriority};
use shutdown::ShutdownCoordinator;
use telemetry::MetricsCollector;

/// Tracks one active stream for uniqueness, cancellation, and shutdown.
struct ActiveStream {
    model_id: String,
    request_id: u64,
    cancel: CancellationToken,
    /// True when the stream lives in a continuous batcher rather than
    /// the direct scheduler path.
    batched: bool,
}

/// The serving runtime. Owns every subsystem; constructed once.
pub struct Runtime {
    pub config: RuntimeConfig,
    loader: ModelLoader,
    registry: Arc<ModelRegistry>,
    batchers: DashMap<String, Arc<ContinuousBatcher>>,
    gpu: Arc<GpuScheduler>,
    kv_pool: Arc<KvCachePool>,
    streams: Arc<DashMap<String, ActiveStream>>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Arc<MetricsCollector>,
    outbound: Outbound,
    next_request_id: AtomicU64,
    restart_count: AtomicU64,
    started_at: Instant,
}

impl Runtime {
    /// Build the runtime. Returns the outbound line receiver the
    /// transport writer must drain.
    pub fn new(
        config: RuntimeConfig,
        provider: Arc<dyn BackendProvider>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(BufferPool::new(64));
        let outbound = Outbound::new(line_tx, pool);

        let runtime = Arc::new(Self {
            loader: ModelLoader::new(
                provider,
                config.limits.trusted_model_directories.clone(),
            ),
            registry: Arc::new(ModelRegistry::new()),
            batchers: DashMap::new(),
            gpu: Arc::new(GpuScheduler::new(config.scheduler.clone())),
            kv_pool: Arc::new(KvCachePool::new(config.kv_pool.clone())),
            streams: Arc::new(DashMap::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: Arc::new(MetricsCollector::new()),
            outbound,
            next_request_id: AtomicU64::new(1),
            restart_count: AtomicU64::new(0),
            started_at: Instant::now(),
            config,
        });
        (runtime, line_rx)
    }

    /// Launch background machinery (the GPU commit worker).
    pub async fn start(self: &Arc<Self>) {
        self.gpu.start().await;
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn is_accepting(&self) -> bool {
        self.shutdown.is_accepting()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn runtime_info(&self) -> Value {
        let (rss, vms) = process_memory();
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "protocol": "jsonrpc-2.0/line",
            "capabilities": [
                "generate",
                "continuous_generate",
                "batch_generate",
                "generate_with_image",
                "tokenize",
                "check_draft",
                "kv_cache_pool",
                "gpu_scheduler",
            ],
            "memory": { "rss": rss, "vms": vms },
            "uptime_seconds": self.started_at.elapsed().as_secs_f64(),
        })
    }

    /// `runtime/state`. The restart counter increments on every call;
    /// the control plane uses it as a liveness probe sequence, not as a
    /// true restart count.
    pub fn runtime_state(&self) -> Value {
        let restart_count = self.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        json!({
            "loaded_models": self.registry.list(),
            "active_streams": self.streams.len(),
            "restart_count": restart_count,
        })
    }

    pub async fn runtime_telemetry(&self) -> Value {
        let mut batchers = serde_json::Map::new();
        for entry in self.batchers.iter() {
            batchers.insert(
                entry.key().clone(),
                json!({
                    "stats": entry.value().stats(),
                    "health": entry.value().health_check(),
                }),
            );
        }
        json!({
            "uptime_seconds": self.started_at.elapsed().as_secs_f64(),
            "runtime": self.metrics.snapshot(),
            "gpu_scheduler": self.gpu.stats().await,
            "kv_cache_pool": self.kv_pool.stats(),
            "batchers": Value::Object(batchers),
            "active_streams": self.streams.len(),
            "prometheus": telemetry::prometheus::render("mx_serve", &self.metrics.snapshot()),
        })
    }

    pub fn batcher_metrics(&self, params: BatcherTargetParams) -> Result<Value, RpcError> {
        let mut out = serde_json::Map::new();
        for entry in self.batchers.iter() {
            if let Some(wanted) = &params.model_id {
                if wanted != entry.key() {
                    continue;
                }
            }
            out.insert(
                entry.key().clone(),
                json!({
                    "stats": entry.value().stats(),
                    "metrics": entry.value().metrics(),
                    "optimization": entry.value().optimization_summary(),
                }),
            );
        }
        if let Some(wanted) = &params.model_id {
            if out.is_empty() {
                return Err(RpcError::new(
                    codes::MODEL_NOT_LOADED,
                    format!("no batcher for model: {wanted}"),
                ));
            }
        }
        Ok(Value::Object(out))
    }

    pub fn batcher_health(&self, params: BatcherTargetParams) -> Result<Value, RpcError> {
        let mut out = serde_json::Map::new();
        for entry in self.batchers.iter() {
            if let Some(wanted) = &params.model_id {
                if wanted != entry.key() {
                    continue;
                }
            }
            out.insert(
                entry.key().clone(),
                serde_json::to_value(entry.value().health_check())
                    .unwrap_or_else(|_| json!({})),
            );
        }
        if let Some(wanted) = &params.model_id {
            if out.is_empty() {
                return Err(RpcError::new(
                    codes::MODEL_NOT_LOADED,
                    format!("no batcher for model: {wanted}"),
                ));
            }
        }
        Ok(Value::Object(out))
    }

    // ------------------------------------------------------------------
    // Model lifecycle
    // ------------------------------------------------------------------

    pub async fn load_model(
        &self,
        params: LoadModelParams,
        vision: bool,
    ) -> Result<Value, RpcError> {
        validate::validate_model_id(&params.model_id)?;
        if self.registry.contains(&params.model_id) {
            return Err(RpcError::new(
                codes::MODEL_LOAD_FAILURE,
                format!("model already loaded: {}", params.model_id),
            ));
        }

        let local_path = params
            .local_path
            .clone()
            .ok_or_else(|| RpcError::new(codes::INVALID_PARAMS, "local_path is required"))?;

        let request = LoadRequest {
            model_id: params.model_id.clone(),
            local_path: local_path.into(),
            revision: params.revision.clone(),
            quantization: params.quantization.clone(),
            context_length: params.context_length,
            vision,
        };
        let loaded = self.loader.load(&request).await?;

        let handle = Arc::new(ModelHandle::new(
            params.model_id.clone(),
            loaded.backend,
            loaded.tokenizer,
            loaded.metadata,
        ));
        self.registry.insert(handle.clone())?;

        Ok(json!({
            "model_id": handle.model_id,
            "state": "ready",
            "context_length": handle.metadata.context_length,
            "parameter_count": handle.metadata.parameter_count,
            "dtype": handle.metadata.dtype,
            "is_vision_model": handle.metadata.is_vision,
        }))
    }

    pub async fn unload_model(&self, params: UnloadModelParams) -> Result<Value, RpcError> {
        validate::validate_model_id(&params.model_id)?;

        // The batcher must drain before the handle goes away.
        if let Some((_, batcher)) = self.batchers.remove(&params.model_id) {
            batcher.stop().await;
        }
        self.registry
            .remove(&params.model_id, self.config.shutdown_timeout)
            .await?;
        tracing::info!(model_id = %params.model_id, "model unloaded");
        Ok(json!({ "success": true }))
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    /// `generate`: single-stream path through the GPU scheduler.
    pub async fn generate(&self, params: GenerateParams) -> Result<Value, RpcError> {
        self.generate_inner(params, None).await
    }

    /// `generate_with_image`: the vision payload becomes extra prompt
    /// tokens; everything downstream is the same scheduler path.
    pub async fn generate_with_image(
        &self,
        params: GenerateWithImageParams,
    ) -> Result<Value, RpcError> {
        let image = validate::validate_base64_image(&params.image)?;
        self.generate_inner(params.generate, Some(image)).await
    }

    async fn generate_inner(
        &self,
        params: GenerateParams,
        image: Option<Vec<u8>>,
    ) -> Result<Value, RpcError> {
        let _guard = self.track_admission()?;
        let (handle, options, stream_id) = self.prepare_request(&params)?;

        if image.is_some() && !handle.metadata.is_vision {
            return Err(RpcError::new(
                codes::INVALID_PARAMS,
                format!("model is not a vision model: {}", handle.model_id),
            ));
        }

        let prompt_tokens = self.encode_prompt(&handle, &params.prompt, image).await?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        self.register_stream(
            &stream_id,
            ActiveStream {
                model_id: handle.model_id.clone(),
                request_id,
                cancel: cancel.clone(),
                batched: false,
            },
        )?;

        let (events_tx, events_rx) = scheduler::stream_channel(
            self.config.bridge.stream_queue_size,
            self.config.bridge.send_budget(),
        );
        self.spawn_forwarder(stream_id.clone(), events_rx);

        let use_guard = handle.acquire();
        let backend = handle.backend.clone();
        let tokenizer = handle.tokenizer.clone();
        let gpu = self.gpu.clone();
        let kv_pool = self.kv_pool.clone();
        let prompt = params.prompt.clone();
        let runtime_metrics = self.metrics.clone();
        let started = Instant::now();
        tokio::spawn(async move {
            run_stream(
                backend, tokenizer, gpu, kv_pool, prompt, prompt_tokens, options, events_tx,
                cancel,
            )
            .await;
            runtime_metrics.record_latency(started.elapsed().as_secs_f64() * 1000.0);
            drop(use_guard);
        });

        Ok(handshake(&stream_id))
    }

    /// `continuous_generate`: non-blocking admission into the model's
    /// batcher.
    pub async fn continuous_generate(&self, params: GenerateParams) -> Result<Value, RpcError> {
        let _guard = self.track_admission()?;
        let (handle, options, stream_id) = self.prepare_request(&params)?;
        let prompt_tokens = self.encode_prompt(&handle, &params.prompt, None).await?;

        let batcher = self.batcher_for(&handle).await;
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);

        self.register_stream(
            &stream_id,
            ActiveStream {
                model_id: handle.model_id.clone(),
                request_id,
                cancel: CancellationToken::new(),
                batched: true,
            },
        )?;

        let (events_tx, events_rx) = scheduler::stream_channel(
            self.config.bridge.stream_queue_size,
            self.config.bridge.send_budget(),
        );
        self.spawn_forwarder(stream_id.clone(), events_rx);

        let request = GenerationRequest::new(
            request_id,
            stream_id.clone(),
            params.prompt.clone(),
            prompt_tokens,
            options.max_tokens,
            options.temperature,
            options.top_p,
            options.timeout,
        );
        if let Err(e) = batcher.add_request(request, events_tx) {
            self.streams.remove(&stream_id);
            return Err(e.into());
        }

        Ok(handshake(&stream_id))
    }

    /// `batch_generate`: strictly sequential fan-out. Concurrent
    /// dispatch faults the accelerator; this ordering is a correctness
    /// requirement, not an optimization.
    pub async fn batch_generate(&self, params: BatchGenerateParams) -> Result<Value, RpcError> {
        let mut results = Vec::with_capacity(params.requests.len());
        for raw in params.requests {
            let outcome = match serde_json::from_value::<GenerateParams>(raw) {
                Ok(request) => self.generate(request).await,
                Err(e) => Err(RpcError::new(codes::INVALID_PARAMS, e.to_string())),
            };
            results.push(match outcome {
                Ok(result) => json!({ "success": true, "result": result }),
                Err(error) => json!({ "success": false, "error": error }),
            });
        }
        Ok(json!({ "results": results }))
    }

    /// Cancel an active stream by id. Returns false for unknown ids.
    pub fn cancel_stream(&self, stream_id: &str) -> bool {
        let Some(entry) = self.streams.get(stream_id) else {
            return false;
        };
        if entry.batched {
            let request_id = entry.request_id;
            let model_id = entry.model_id.clone();
            drop(entry);
            self.batchers
                .get(&model_id)
                .map(|b| b.cancel_request(request_id))
                .unwrap_or(false)
        } else {
            entry.cancel.cancel();
            true
        }
    }

    // ------------------------------------------------------------------
    // Stateless utilities
    // ------------------------------------------------------------------

    pub async fn tokenize(&self, params: TokenizeParams) -> Result<Value, RpcError> {
        validate::validate_model_id(&params.model_id)?;
        let handle = self.registry.get(&params.model_id)?;
        let add_special = params.add_special_tokens.unwrap_or(true);

        let tokenizer = handle.tokenizer.clone();
        let text = params.text.clone();
        let (tokens, token_strings) = tokio::task::spawn_blocking(move || {
            let tokens = tokenizer.encode(&text, add_special)?;
            let strings = tokenizer.token_strings(&tokens)?;
            Ok::<_, engine::BackendError>((tokens, strings))
        })
        .await
        .map_err(|_| RpcError::internal())??;

        Ok(json!({ "tokens": tokens, "token_strings": token_strings }))
    }

    pub async fn batch_tokenize(&self, params: BatchTokenizeParams) -> Result<Value, RpcError> {
        let mut results = Vec::with_capacity(params.texts.len());
        for text in params.texts {
            let outcome = self
                .tokenize(TokenizeParams {
                    model_id: params.model_id.clone(),
                    text,
                    add_special_tokens: params.add_special_tokens,
                })
                .await;
            results.push(match outcome {
                Ok(result) => json!({ "success": true, "result": result }),
                Err(error) => json!({ "success": false, "error": error }),
            });
        }
        Ok(json!({ "results": results }))
    }

    pub fn check_draft(&self, params: CheckDraftParams) -> Result<Value, RpcError> {
        validate::validate_model_id(&params.primary_id)?;
        validate::validate_model_id(&params.draft_id)?;
        let primary = self.registry.get(&params.primary_id)?;
        let draft = self.registry.get(&params.draft_id)?;
        let verdict = check_draft(&primary, &draft);
        serde_json::to_value(verdict).map_err(|_| RpcError::internal())
    }

    pub fn batch_check_draft(&self, params: BatchCheckDraftParams) -> Result<Value, RpcError> {
        let mut results = Vec::with_capacity(params.pairs.len());
        for pair in params.pairs {
            results.push(match self.check_draft(pair) {
                Ok(result) => json!({ "success": true, "result": result }),
                Err(error) => json!({ "success": false, "error": error }),
            });
        }
        Ok(json!({ "results": results }))
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Drain batchers, cancel streams, unload models, stop the GPU
    /// scheduler. Bounded at every stage.
    pub async fn shutdown(&self) -> Value {
        tracing::info!("runtime shutdown initiated");
        self.shutdown.drain(self.config.shutdown_timeout).await;

        // Snapshot first: stopping awaits, and awaiting while holding a
        // map guard would block other map users.
        let batchers: Vec<Arc<ContinuousBatcher>> =
            self.batchers.iter().map(|entry| entry.value().clone()).collect();
        for batcher in batchers {
            batcher.stop().await;
        }
        self.batchers.clear();

        for entry in self.streams.iter() {
            if !entry.value().batched {
                entry.value().cancel.cancel();
            }
        }

        for model_id in self.registry.model_ids() {
            if let Err(e) = self
                .registry
                .remove(&model_id, self.config.shutdown_timeout)
                .await
            {
                tracing::warn!(model_id, error = %e, "unload during shutdown failed");
            }
        }

        self.gpu.stop().await;
        self.kv_pool.clear();
        tracing::info!("runtime shutdown complete");
        json!({ "success": true })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn track_admission(&self) -> Result<shutdown::InFlightGuard, RpcError> {
        self.shutdown
            .track()
            .ok_or_else(|| RpcError::new(codes::GENERATION_FAILURE, "runtime is shutting down"))
    }

    /// Validate generation parameters and resolve the model handle.
    fn prepare_request(
        &self,
        params: &GenerateParams,
    ) -> Result<(Arc<ModelHandle>, GenerateOptions, String), RpcError> {
        validate::validate_model_id(&params.model_id)?;
        let handle = self.registry.get(&params.model_id)?;

        let max_tokens = params
            .max_tokens
            .unwrap_or(self.config.limits.default_max_tokens);
        validate::validate_max_tokens(max_tokens, self.config.limits.max_generation_tokens)?;

        let temperature = params.temperature.unwrap_or(0.7);
        validate::validate_temperature(temperature, self.config.limits.max_temperature)?;

        let options = GenerateOptions {
            max_tokens,
            temperature,
            top_p: params.top_p.unwrap_or(1.0),
            stop_token_ids: params.stop_token_ids.clone().unwrap_or_default(),
            stop_sequences: params.stop_sequences.clone().unwrap_or_default(),
            seed: params.seed,
            timeout: params.timeout_ms.map(Duration::from_millis),
            priority: match params.priority {
                Some(0) => JobPriority::Urgent,
                Some(p) if p >= 2 => JobPriority::Background,
                _ => JobPriority::Default,
            },
        };

        let stream_id = params
            .stream_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok((handle, options, stream_id))
    }

    fn register_stream(&self, stream_id: &str, entry: ActiveStream) -> Result<(), RpcError> {
        match self.streams.entry(stream_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RpcError::new(
                codes::INVALID_PARAMS,
                format!("stream_id already active: {stream_id}"),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    fn spawn_forwarder(
        &self,
        stream_id: String,
        events: scheduler::StreamReceiver,
    ) {
        let outbound = self.outbound.clone();
        let streams = self.streams.clone();
        tokio::spawn(async move {
            forward_stream(stream_id.clone(), events, outbound).await;
            streams.remove(&stream_id);
        });
    }

    async fn encode_prompt(
        &self,
        handle: &Arc<ModelHandle>,
        prompt: &str,
        image: Option<Vec<u8>>,
    ) -> Result<Vec<u32>, RpcError> {
        let tokenizer = handle.tokenizer.clone();
        let backend = handle.backend.clone();
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            let mut tokens = Vec::new();
            if let Some(image) = image {
                tokens.extend(backend.embed_image(&image)?);
            }
            tokens.extend(tokenizer.encode(&prompt, true)?);
            Ok::<_, engine::BackendError>(tokens)
        })
        .await
        .map_err(|_| RpcError::internal())?
        .map_err(RpcError::from)
    }

    /// Fetch or create the continuous batcher for one model. Creation
    /// races resolve through the map entry; `start` is idempotent.
    async fn batcher_for(&self, handle: &Arc<ModelHandle>) -> Arc<ContinuousBatcher> {
        let batcher = self
            .batchers
            .entry(handle.model_id.clone())
            .or_insert_with(|| {
                Arc::new(ContinuousBatcher::new(
                    handle.model_id.clone(),
                    handle.backend.clone(),
                    handle.tokenizer.clone(),
                    self.config.batcher.clone(),
                ))
            })
            .clone();
        batcher.start().await;
        batcher
    }
}

fn handshake(stream_id: &str) -> Value {
    json!({
        "stream_id": stream_id,
        "started_at": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
    })
}

/// Resident and virtual memory of this process, in bytes. Zeroes when
/// the platform does not expose `/proc/self/statm`.
fn process_memory() -> (u64, u64) {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return (0, 0);
    };
    let mut fields = statm.split_whitespace();
    let vms_pages: u64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
    let rss_pages: u64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
    let page_size = 4096;
    (rss_pages * page_size, vms_pages * page_size)
}
