//! Backend capability surface for the tensor library.
//!
//! The runtime never links a tensor library directly. It consumes a small
//! trait surface (forward pass, synchronization, memory probing,
//! tokenization) and the embedder supplies concrete implementations at
//! construction time through a [`BackendProvider`].

pub mod generate;
pub mod provider;
pub mod sampling;

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

pub use provider::{BackendProvider, LoadedModel, UnconfiguredProvider};

/// Errors surfaced by backend implementations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("No tensor backend is configured: {0}")]
    Unavailable(String),

    #[error("Forward pass failed: {0}")]
    Forward(String),

    #[error("Tokenizer failed: {0}")]
    Tokenizer(String),

    #[error("Model load failed: {0}")]
    Load(String),

    #[error("Vision input not supported by this model")]
    VisionUnsupported,

    #[error("Invalid image payload: {0}")]
    InvalidImage(String),
}

/// One GPU memory reading: active, peak, and cache bytes.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryReading {
    pub active_bytes: u64,
    pub peak_bytes: u64,
    pub cache_bytes: u64,
}

impl MemoryReading {
    /// active / peak, or the neutral 0.5 when peak is unknown so memory
    /// steering neither grows nor shrinks on missing data.
    pub fn utilization(&self) -> f64 {
        if self.peak_bytes == 0 {
            return 0.5;
        }
        self.active_bytes as f64 / self.peak_bytes as f64
    }
}

/// Capability for reading accelerator memory utilization.
pub trait MemoryProbe: Send + Sync {
    /// Current reading, or `None` when the backend cannot report one.
    fn read(&self) -> Option<MemoryReading>;
}

/// Opaque KV cache handle owned by the backend. The core moves these
/// between the KV pool and generation without inspecting them.
pub type KvBlock = std::sync::Arc<dyn std::any::Any + Send + Sync>;

/// Loaded model weights plus the operations the scheduler core needs.
///
/// All methods may block on accelerator work; the core only calls them
/// from `spawn_blocking` threads or the single commit worker.
pub trait ModelBackend: Send + Sync {
    /// Run one forward pass over `[batch, seq]` token ids with an
    /// attention mask (1 = real token, 0 = pad). Returns the vocabulary
    /// logits at the final position of each row.
    fn forward(&self, tokens: &[Vec<u32>], mask: &[Vec<u8>]) -> Result<Vec<Vec<f32>>, BackendError>;

    /// Process a prompt into a KV cache the backend can decode from.
    /// `cached` supplies a pooled block for this prompt (or a shared
    /// prefix of it) to resume from instead of recomputing.
    fn prefill(&self, tokens: &[u32], cached: Option<&KvBlock>) -> Result<KvBlock, BackendError>;

    /// Advance a prefilled sequence by one token and return the
    /// next-position logits. `token` is `None` on the first step after
    /// prefill.
    fn decode_step(&self, kv: &KvBlock, token: Option<u32>) -> Result<Vec<f32>, BackendError>;

    /// Flush all outstanding accelerator work. Must be called after every
    /// generation step; skipping it corrupts command-buffer state on the
    /// target platform.
    fn synchronize(&self) -> Result<(), BackendError>;

    fn eos_token_id(&self) -> Option<u32>;

    fn pad_token_id(&self) -> u32;

    fn vocab_size(&self) -> usize;

    /// Memory probe for this backend's accelerator, if it has one.
    fn memory_probe(&self) -> Option<Arc<dyn MemoryProbe>> {
        None
    }

    /// Turn a decoded image into prompt tokens. Vision models override.
    fn embed_image(&self, _data: &[u8]) -> Result<Vec<u32>, BackendError> {
        Err(BackendError::VisionUnsupported)
    }
}

/// Text <-> token conversion for one model.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, BackendError>;

    fn decode(&self, tokens: &[u32]) -> Result<String, BackendError>;

    /// Per-token surface strings, used by the tokenize RPC.
    fn token_strings(&self, tokens: &[u32]) -> Result<Vec<String>, BackendError> {
        tokens.iter().map(|&t| self.decode(&[t])).collect()
    }
}

/// Static facts about a loaded model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub parameter_count: u64,
    pub dtype: String,
    pub context_length: usize,
    pub is_vision: bool,
}

/// Parameters forwarded to the provider on load.
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    pub model_id: String,
    pub local_path: std::path::PathBuf,
    pub revision: Option<String>,
    pub quantization: Option<String>,
    pub context_length: Option<usize>,
    pub vision: bool,
}
