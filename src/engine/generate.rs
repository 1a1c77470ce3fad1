//! Streaming single-request generation driven through the GPU scheduler.
//!
//! The low-traffic path: one request, one KV cache, one scheduled GPU
//! job per decode step. Repeat prompts resume from the KV pool instead
//! of re-running prefill.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use super::{sampling, BackendError, KvBlock, ModelBackend, Tokenizer};
use crate::memory::KvCachePool;
use crate::scheduler::gpu::GpuScheduler;
use crate::scheduler::streaming::{
    CompletionStats, FinishReason, StreamEvent, StreamSendError, StreamSender,
};
use crate::scheduler::JobPriority;

/// Per-request generation options.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub stop_token_ids: Vec<u32>,
    pub stop_sequences: Vec<String>,
    pub seed: Option<u64>,
    pub timeout: Option<Duration>,
    pub priority: JobPriority,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 1.0,
            stop_token_ids: Vec::new(),
            stop_sequences: Vec::new(),
            seed: None,
            timeout: None,
            priority: JobPriority::Default,
        }
    }
}

/// Everything one stream needs, bundled so the decode loop stays
/// readable.
struct StreamContext {
    backend: Arc<dyn ModelBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    gpu: Arc<GpuScheduler>,
    kv_pool: Arc<KvCachePool>,
    prompt: String,
    prompt_tokens: Vec<u32>,
    options: GenerateOptions,
    events: StreamSender,
    cancel: CancellationToken,
    started: Instant,
}

/// Mutable decode-loop state.
struct DecodeState {
    rng: StdRng,
    generated: Vec<u32>,
    cumulative: String,
    first_token_at: Option<Instant>,
    error: Option<String>,
}

/// Drive one stream to its terminal event. Every exit path emits exactly
/// one completion; transport failures downgrade to cancellation.
#[allow(clippy::too_many_arguments)]
pub async fn run_stream(
    backend: Arc<dyn ModelBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    gpu: Arc<GpuScheduler>,
    kv_pool: Arc<KvCachePool>,
    prompt: String,
    prompt_tokens: Vec<u32>,
    options: GenerateOptions,
    events: StreamSender,
    cancel: CancellationToken,
) {
    let rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let ctx = StreamContext {
        backend,
        tokenizer,
        gpu,
        kv_pool,
        prompt,
        prompt_tokens,
        options,
        events,
        cancel,
        started: Instant::now(),
    };
    let mut state = DecodeState {
        rng,
        generated: Vec::new(),
        cumulative: String::new(),
        first_token_at: None,
        error: None,
    };

    let reason = decode_loop(&ctx, &mut state).await;

    let duration = ctx.started.elapsed();
    let stats = CompletionStats {
        finish_reason: reason,
        tokens_generated: state.generated.len(),
        duration_ms: duration.as_secs_f64() * 1000.0,
        ttft_ms: state
            .first_token_at
            .map(|at| at.duration_since(ctx.started).as_secs_f64() * 1000.0)
            .unwrap_or(0.0),
        tokens_per_sec: if duration.as_secs_f64() > 0.0 {
            state.generated.len() as f64 / duration.as_secs_f64()
        } else {
            0.0
        },
        error: state.error,
    };
    if ctx.events.send(StreamEvent::Complete(stats)).await.is_err() {
        tracing::warn!("failed to emit stream completion");
    }
}

async fn decode_loop(ctx: &StreamContext, state: &mut DecodeState) -> FinishReason {
    // Prefill, resuming from the pool when this prompt (or a prefix of
    // it) was computed before.
    let cached = ctx.kv_pool.get(&ctx.prompt);
    let was_hit = cached.is_some();
    let kv = {
        let backend = ctx.backend.clone();
        let tokens = ctx.prompt_tokens.clone();
        let result = ctx
            .gpu
            .schedule(ctx.options.priority, move || async move {
                run_blocking(move || {
                    let kv = backend.prefill(&tokens, cached.as_ref())?;
                    backend.synchronize()?;
                    Ok(kv)
                })
                .await
            })
            .await;
        match result {
            Ok(kv) => kv,
            Err(e) => {
                state.error = Some(e.to_string());
                return FinishReason::Error;
            }
        }
    };
    if !was_hit {
        ctx.kv_pool
            .put(&ctx.prompt, kv.clone(), ctx.prompt_tokens.len());
    }

    let eos_token_id = ctx.backend.eos_token_id();

    loop {
        if ctx.cancel.is_cancelled() {
            return FinishReason::Cancelled;
        }
        if let Some(timeout) = ctx.options.timeout {
            if ctx.started.elapsed() > timeout {
                return FinishReason::Timeout;
            }
        }

        let logits = {
            let backend = ctx.backend.clone();
            let kv: KvBlock = kv.clone();
            let last = state.generated.last().copied();
            let result = ctx
                .gpu
                .schedule(ctx.options.priority, move || async move {
                    run_blocking(move || {
                        let logits = backend.decode_step(&kv, last)?;
                        backend.synchronize()?;
                        Ok(logits)
                    })
                    .await
                })
                .await;
            match result {
                Ok(logits) => logits,
                Err(e) => {
                    state.error = Some(e.to_string());
                    return FinishReason::Error;
                }
            }
        };

        let token_id = sampling::sample_token(
            &mut state.rng,
            &logits,
            ctx.options.temperature,
            ctx.options.top_p,
        );
        let text = match ctx.tokenizer.decode(&[token_id]) {
            Ok(text) => text,
            Err(e) => {
                state.error = Some(e.to_string());
                return FinishReason::Error;
            }
        };

        if state.first_token_at.is_none() {
            state.first_token_at = Some(Instant::now());
        }
        state.generated.push(token_id);
        state.cumulative.push_str(&text);

        match ctx.events.send(StreamEvent::Token { token_id, text }).await {
            Ok(()) => {}
            Err(StreamSendError::ConsumerTooSlow) => {
                state.error = Some("stream consumer too slow".to_string());
                return FinishReason::Error;
            }
            Err(StreamSendError::Closed) => return FinishReason::Cancelled,
        }

        if eos_token_id == Some(token_id) || ctx.options.stop_token_ids.contains(&token_id) {
            return FinishReason::Eos;
        }
        if ctx
            .options
            .stop_sequences
            .iter()
            .any(|stop| !stop.is_empty() && state.cumulative.contains(stop.as_str()))
        {
            return FinishReason::Eos;
        }
        if state.generated.len() >= ctx.options.max_tokens {
            return FinishReason::Length;
        }
    }
}

/// Host a blocking backend call on a worker thread.
async fn run_blocking<T, F>(f: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|join| BackendError::Forward(format!("backend call panicked: {join}")))?
}
