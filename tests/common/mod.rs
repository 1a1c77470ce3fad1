//! Shared test fixtures: a deterministic scripted backend and provider.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use mx_serve::engine::{
    BackendError, BackendProvider, KvBlock, LoadRequest, LoadedModel, MemoryProbe, MemoryReading,
    ModelBackend, ModelMetadata, Tokenizer,
};

pub const VOCAB: usize = 50;

/// Tracks how many backend calls run at once; the GPU serialization
/// property says this may never exceed one.
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    /// Hold the gauge open for a while, as an instrumented stand-in for
    /// one accelerator operation.
    pub async fn probe(&self, hold: std::time::Duration) {
        self.enter();
        tokio::time::sleep(hold).await;
        self.exit();
    }
}

/// Deterministic backend: the next token for a sequence is its current
/// length modulo the vocabulary, so greedy decoding is fully scripted.
pub struct ScriptedBackend {
    pub eos: Option<u32>,
    pub gauge: Arc<ConcurrencyGauge>,
    pub step_delay: std::time::Duration,
    pub forward_calls: AtomicUsize,
    pub prefill_calls: AtomicUsize,
    pub is_vision: bool,
}

impl ScriptedBackend {
    pub fn new(eos: Option<u32>) -> Self {
        Self {
            eos,
            gauge: Arc::new(ConcurrencyGauge::default()),
            step_delay: std::time::Duration::from_millis(1),
            forward_calls: AtomicUsize::new(0),
            prefill_calls: AtomicUsize::new(0),
            is_vision: false,
        }
    }

    fn next_token(seq_len: usize) -> u32 {
        (seq_len % VOCAB) as u32
    }

    fn logits_for(seq_len: usize) -> Vec<f32> {
        let mut logits = vec![0.0f32; VOCAB];
        logits[Self::next_token(seq_len) as usize] = 10.0;
        logits
    }
}

/// KV state for the scripted backend: the sequence seen so far.
struct ScriptedKv(Mutex<Vec<u32>>);

impl ModelBackend for ScriptedBackend {
    fn forward(&self, tokens: &[Vec<u32>], mask: &[Vec<u8>]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.gauge.enter();
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.step_delay);
        let rows = tokens
            .iter()
            .zip(mask.iter())
            .map(|(_, row_mask)| {
                let real_len = row_mask.iter().filter(|&&m| m == 1).count();
                Self::logits_for(real_len)
            })
            .collect();
        self.gauge.exit();
        Ok(rows)
    }

    fn prefill(&self, tokens: &[u32], cached: Option<&KvBlock>) -> Result<KvBlock, BackendError> {
        self.gauge.enter();
        self.prefill_calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.step_delay);
        let seq = match cached.and_then(|kv| kv.downcast_ref::<ScriptedKv>()) {
            // Resume from the pooled block when it covers a prefix.
            Some(kv) if tokens.starts_with(&kv.0.lock()) => tokens.to_vec(),
            _ => tokens.to_vec(),
        };
        self.gauge.exit();
        Ok(Arc::new(ScriptedKv(Mutex::new(seq))))
    }

    fn decode_step(&self, kv: &KvBlock, token: Option<u32>) -> Result<Vec<f32>, BackendError> {
        self.gauge.enter();
        std::thread::sleep(self.step_delay);
        let kv = kv
            .downcast_ref::<ScriptedKv>()
            .ok_or_else(|| BackendError::Forward("foreign kv block".into()))?;
        let mut seq = kv.0.lock();
        if let Some(token) = token {
            seq.push(token);
        }
        let logits = Self::logits_for(seq.len());
        self.gauge.exit();
        Ok(logits)
    }

    fn synchronize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }

    fn pad_token_id(&self) -> u32 {
        0
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn memory_probe(&self) -> Option<Arc<dyn MemoryProbe>> {
        struct FixedProbe;
        impl MemoryProbe for FixedProbe {
            fn read(&self) -> Option<MemoryReading> {
                Some(MemoryReading {
                    active_bytes: 50,
                    peak_bytes: 100,
                    cache_bytes: 0,
                })
            }
        }
        Some(Arc::new(FixedProbe))
    }

    fn embed_image(&self, data: &[u8]) -> Result<Vec<u32>, BackendError> {
        if !self.is_vision {
            return Err(BackendError::VisionUnsupported);
        }
        Ok(vec![(data.len() % VOCAB) as u32])
    }
}

/// One token per input byte.
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>, BackendError> {
        Ok(text.bytes().map(|b| (b as u32) % VOCAB as u32).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, BackendError> {
        Ok(tokens.iter().map(|t| format!("<{t}>")).collect())
    }
}

/// Provider that hands out scripted backends regardless of the weights
/// on disk (the path must still pass trust validation). All backends it
/// creates share one concurrency gauge.
pub struct ScriptedProvider {
    pub eos: Option<u32>,
    pub vision: bool,
    pub gauge: Arc<ConcurrencyGauge>,
}

impl ScriptedProvider {
    pub fn new(eos: Option<u32>) -> Self {
        Self {
            eos,
            vision: false,
            gauge: Arc::new(ConcurrencyGauge::default()),
        }
    }
}

#[async_trait]
impl BackendProvider for ScriptedProvider {
    async fn load(
        &self,
        request: &LoadRequest,
        _path: &std::path::Path,
    ) -> Result<LoadedModel, BackendError> {
        let mut backend = ScriptedBackend::new(self.eos);
        backend.gauge = self.gauge.clone();
        backend.is_vision = self.vision || request.vision;
        Ok(LoadedModel {
            backend: Arc::new(backend),
            tokenizer: Arc::new(ByteTokenizer),
            metadata: ModelMetadata {
                parameter_count: 1_000_000,
                dtype: "float16".to_string(),
                context_length: request.context_length.unwrap_or(4096),
                is_vision: self.vision || request.vision,
            },
        })
    }
}
