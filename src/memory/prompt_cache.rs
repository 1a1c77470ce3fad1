//! Hash-addressed LRU cache of prompt-processing metadata.
//!
//! Unlike the KV pool this stores only bookkeeping; the cached object
//! itself lives in the backend, referenced by `cache_id`. Used by the
//! continuous batcher to skip prefill work for repeat prompts.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Configuration for the prompt cache.
#[derive(Debug, Clone)]
pub struct PromptCacheConfig {
    pub max_size: usize,
    pub max_memory_bytes: usize,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_memory_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Metadata for one cached prompt.
#[derive(Debug, Clone)]
pub struct CachedPrompt {
    pub prompt_hash: String,
    pub prompt_chars: usize,
    pub prompt_tokens: usize,
    /// Backend-side cache identifier, when the backend cached the prompt.
    pub cache_id: Option<String>,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
    /// Zero marks the "refused, not actually cached" sentinel.
    pub memory_bytes: usize,
}

impl CachedPrompt {
    pub fn is_cached(&self) -> bool {
        self.memory_bytes > 0
    }
}

/// Cache statistics for introspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptCacheStats {
    pub cache_size: usize,
    pub total_memory_bytes: usize,
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub eviction_count: u64,
    pub avg_age_seconds: f64,
    pub avg_use_count: f64,
}

struct CacheState {
    entries: HashMap<String, CachedPrompt>,
    total_memory_bytes: usize,
    total_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    eviction_count: u64,
    oversize_warned: bool,
}

/// LRU prompt-metadata cache with a memory budget.
pub struct PromptCache {
    config: PromptCacheConfig,
    state: Mutex<CacheState>,
}

impl PromptCache {
    pub fn new(config: PromptCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total_memory_bytes: 0,
                total_requests: 0,
                cache_hits: 0,
                cache_misses: 0,
                eviction_count: 0,
                oversize_warned: false,
            }),
        }
    }

    /// 16-hex-char truncated SHA-256 of the prompt.
    pub fn prompt_hash(prompt: &str) -> String {
        hex::encode(Sha256::digest(prompt.as_bytes()))[..16].to_string()
    }

    /// Estimated footprint: prompt text plus per-token cache overhead.
    fn estimate_memory_bytes(prompt_chars: usize, prompt_tokens: usize) -> usize {
        prompt_chars * 2 + prompt_tokens * 4
    }

    /// Look up a prompt, refreshing LRU bookkeeping on a hit.
    pub fn get(&self, prompt: &str) -> Option<CachedPrompt> {
        let hash = Self::prompt_hash(prompt);
        let mut state = self.state.lock();
        state.total_requests += 1;

        if let Some(entry) = state.entries.get_mut(&hash) {
            entry.last_used = Instant::now();
            entry.use_count += 1;
            let entry = entry.clone();
            state.cache_hits += 1;
            return Some(entry);
        }

        state.cache_misses += 1;
        None
    }

    /// True when the prompt is already cached, without touching hit/miss
    /// counters or LRU order. Used by retirement paths to avoid
    /// re-caching.
    pub fn contains(&self, prompt: &str) -> bool {
        let hash = Self::prompt_hash(prompt);
        self.state.lock().entries.contains_key(&hash)
    }

    /// Insert prompt metadata, evicting LRU entries to fit. An entry that
    /// alone exceeds the memory budget is returned as a non-cached
    /// sentinel instead of looping over an empty cache.
    pub fn insert(
        &self,
        prompt: &str,
        prompt_tokens: usize,
        cache_id: Option<String>,
    ) -> CachedPrompt {
        let hash = Self::prompt_hash(prompt);
        let prompt_chars = prompt.chars().count();
        let memory_bytes = Self::estimate_memory_bytes(prompt_chars, prompt_tokens);
        let now = Instant::now();

        let mut state = self.state.lock();

        if let Some(old) = state.entries.remove(&hash) {
            state.total_memory_bytes = state.total_memory_bytes.saturating_sub(old.memory_bytes);
        }

        while state.entries.len() >= self.config.max_size
            || state.total_memory_bytes + memory_bytes > self.config.max_memory_bytes
        {
            if state.entries.is_empty() {
                if !state.oversize_warned {
                    state.oversize_warned = true;
                    tracing::warn!(
                        memory_bytes,
                        budget = self.config.max_memory_bytes,
                        "prompt exceeds whole cache budget, not caching"
                    );
                }
                return CachedPrompt {
                    prompt_hash: hash,
                    prompt_chars,
                    prompt_tokens,
                    cache_id: None,
                    created_at: now,
                    last_used: now,
                    use_count: 0,
                    memory_bytes: 0,
                };
            }
            Self::evict_lru(&mut state);
        }

        let entry = CachedPrompt {
            prompt_hash: hash.clone(),
            prompt_chars,
            prompt_tokens,
            cache_id,
            created_at: now,
            last_used: now,
            use_count: 0,
            memory_bytes,
        };
        state.total_memory_bytes += memory_bytes;
        state.entries.insert(hash, entry.clone());
        entry
    }

    fn evict_lru(state: &mut CacheState) {
        let victim = state
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(hash, _)| hash.clone());
        if let Some(hash) = victim {
            if let Some(entry) = state.entries.remove(&hash) {
                state.total_memory_bytes =
                    state.total_memory_bytes.saturating_sub(entry.memory_bytes);
            }
            state.eviction_count += 1;
        }
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.total_memory_bytes = 0;
        tracing::info!(removed = count, "prompt cache cleared");
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn stats(&self) -> PromptCacheStats {
        let state = self.state.lock();
        let hit_rate = if state.total_requests > 0 {
            state.cache_hits as f64 / state.total_requests as f64
        } else {
            0.0
        };
        let (avg_age, avg_use) = if state.entries.is_empty() {
            (0.0, 0.0)
        } else {
            let now = Instant::now();
            let n = state.entries.len() as f64;
            let age: f64 = state
                .entries
                .values()
                .map(|e| now.duration_since(e.created_at).as_secs_f64())
                .sum();
            let uses: u64 = state.entries.values().map(|e| e.use_count).sum();
            (age / n, uses as f64 / n)
        };
        PromptCacheStats {
            cache_size: state.entries.len(),
            total_memory_bytes: state.total_memory_bytes,
            total_requests: state.total_requests,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            hit_rate,
            eviction_count: state.eviction_count,
            avg_age_seconds: avg_age,
            avg_use_count: avg_use,
        }
    }

    /// Reset counters without dropping entries (used by benchmarks).
    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.total_requests = 0;
        state.cache_hits = 0;
        state.cache_misses = 0;
        state.eviction_count = 0;
    }
}
