//! Content-addressed KV cache pool with prefix sharing.
//!
//! Multi-turn conversations repeat prompt prefixes; caching the computed
//! KV tensors keyed by a truncated SHA-256 of the prompt lets repeat
//! prompts skip prefill. An exact hash hit returns the full cache; a
//! prefix-hash hit returns a cache computed for a prompt sharing the
//! first part of this one. Eviction is LRU under a size cap and a memory
//! budget, with TTL expiry on top.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub use crate::engine::KvBlock;

/// Minimum prompt prefix (in chars) worth indexing.
const MIN_PREFIX_CHARS: usize = 10;

/// Configuration for the KV cache pool.
#[derive(Debug, Clone)]
pub struct KvCachePoolConfig {
    pub max_size: usize,
    pub ttl: Duration,
    pub enable_prefix_sharing: bool,
    /// Fraction of the prompt hashed as the shared prefix.
    pub prefix_length_ratio: f64,
    pub max_memory_bytes: usize,
}

impl Default for KvCachePoolConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            ttl: Duration::from_secs(300),
            enable_prefix_sharing: true,
            prefix_length_ratio: 0.6,
            max_memory_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Metadata for one pooled KV cache.
struct KvCacheEntry {
    prefix_hash: Option<String>,
    kv: KvBlock,
    prompt_tokens: usize,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    memory_bytes: usize,
}

/// Outcome of a `put`: stored, or refused because the single entry
/// exceeds the whole memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    Refused,
}

/// Pool statistics for introspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KvPoolStats {
    pub cache_size: usize,
    pub prefix_index_size: usize,
    pub total_memory_bytes: usize,
    pub total_requests: u64,
    pub cache_hits: u64,
    pub prefix_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub lru_evictions: u64,
    pub ttl_evictions: u64,
    pub refused_oversize: u64,
    pub avg_age_seconds: f64,
    pub avg_use_count: f64,
}

struct PoolState {
    entries: HashMap<String, KvCacheEntry>,
    /// Front = least recently used.
    access_order: VecDeque<String>,
    prefix_index: HashMap<String, Vec<String>>,
    total_memory_bytes: usize,
    total_requests: u64,
    cache_hits: u64,
    prefix_hits: u64,
    cache_misses: u64,
    lru_evictions: u64,
    ttl_evictions: u64,
    refused_oversize: u64,
    oversize_warned: bool,
}

/// Content-addressed pool of computed KV caches.
pub struct KvCachePool {
    config: KvCachePoolConfig,
    state: Mutex<PoolState>,
}

impl KvCachePool {
    pub fn new(config: KvCachePoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                access_order: VecDeque::new(),
                prefix_index: HashMap::new(),
                total_memory_bytes: 0,
                total_requests: 0,
                cache_hits: 0,
                prefix_hits: 0,
                cache_misses: 0,
                lru_evictions: 0,
                ttl_evictions: 0,
                refused_oversize: 0,
                oversize_warned: false,
            }),
        }
    }

    /// 16-hex-char truncated SHA-256 of the full prompt.
    pub fn prompt_hash(prompt: &str) -> String {
        hex::encode(Sha256::digest(prompt.as_bytes()))[..16].to_string()
    }

    /// Hash of the prompt's leading `prefix_length_ratio` characters, or
    /// `None` when the prefix is too short to be worth indexing.
    pub fn prefix_hash(&self, prompt: &str) -> Option<String> {
        if !self.config.enable_prefix_sharing {
            return None;
        }
        let char_count = prompt.chars().count();
        let prefix_chars = (char_count as f64 * self.config.prefix_length_ratio) as usize;
        if prefix_chars < MIN_PREFIX_CHARS {
            return None;
        }
        let prefix: String = prompt.chars().take(prefix_chars).collect();
        Some(Self::prompt_hash(&prefix))
    }

    /// Conservative KV memory estimate: 8 bytes per prompt token.
    fn estimate_memory_bytes(prompt_tokens: usize) -> usize {
        prompt_tokens * 8
    }

    /// Look up a cached KV for this prompt: exact hash first, then the
    /// first live prefix candidate.
    pub fn get(&self, prompt: &str) -> Option<KvBlock> {
        let hash = Self::prompt_hash(prompt);
        let prefix = self.prefix_hash(prompt);
        let now = Instant::now();
        let ttl = self.config.ttl;

        let mut state = self.state.lock();
        state.total_requests += 1;

        let exact_expired = state
            .entries
            .get(&hash)
            .map(|entry| now.duration_since(entry.created_at) > ttl);
        match exact_expired {
            Some(true) => {
                Self::remove_entry(&mut state, &hash);
                state.ttl_evictions += 1;
                state.cache_misses += 1;
                return None;
            }
            Some(false) => {
                let kv = {
                    let entry = state.entries.get_mut(&hash).expect("entry checked above");
                    entry.last_used = now;
                    entry.use_count += 1;
                    entry.kv.clone()
                };
                Self::touch(&mut state.access_order, &hash);
                state.cache_hits += 1;
                return Some(kv);
            }
            None => {}
        }

        if let Some(prefix_hash) = prefix {
            let candidates = state
                .prefix_index
                .get(&prefix_hash)
                .cloned()
                .unwrap_or_default();
            for candidate in candidates {
                let kv = {
                    let Some(entry) = state.entries.get_mut(&candidate) else {
                        continue;
                    };
                    if now.duration_since(entry.created_at) > ttl {
                        continue;
                    }
                    entry.last_used = now;
                    entry.use_count += 1;
                    entry.kv.clone()
                };
                Self::touch(&mut state.access_order, &candidate);
                state.prefix_hits += 1;
                return Some(kv);
            }
        }

        state.cache_misses += 1;
        None
    }

    /// Store a computed KV cache, evicting LRU entries until both the
    /// size cap and the memory budget hold.
    pub fn put(&self, prompt: &str, kv: KvBlock, prompt_tokens: usize) -> PutOutcome {
        let hash = Self::prompt_hash(prompt);
        let prefix_hash = self.prefix_hash(prompt);
        let memory_bytes = Self::estimate_memory_bytes(prompt_tokens);
        let now = Instant::now();

        let mut state = self.state.lock();

        // Re-inserting an existing hash replaces it; drop the old entry
        // first so accounting stays exact.
        if state.entries.contains_key(&hash) {
            Self::remove_entry(&mut state, &hash);
        }

        while state.entries.len() >= self.config.max_size
            || state.total_memory_bytes + memory_bytes > self.config.max_memory_bytes
        {
            if state.entries.is_empty() {
                // The single entry alone exceeds the budget. Refusing is
                // the only exit that terminates.
                state.refused_oversize += 1;
                if !state.oversize_warned {
                    state.oversize_warned = true;
                    tracing::warn!(
                        memory_bytes,
                        budget = self.config.max_memory_bytes,
                        "KV entry exceeds whole cache budget, not caching"
                    );
                }
                return PutOutcome::Refused;
            }
            Self::evict_lru(&mut state);
        }

        state.total_memory_bytes += memory_bytes;
        state.entries.insert(
            hash.clone(),
            KvCacheEntry {
                prefix_hash: prefix_hash.clone(),
                kv,
                prompt_tokens,
                created_at: now,
                last_used: now,
                use_count: 0,
                memory_bytes,
            },
        );
        state.access_order.push_back(hash.clone());
        if let Some(prefix_hash) = prefix_hash {
            state.prefix_index.entry(prefix_hash).or_default().push(hash);
        }
        PutOutcome::Stored
    }

    /// Remove all entries past their TTL. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.created_at) > ttl)
            .map(|(hash, _)| hash.clone())
            .collect();

        for hash in &expired {
            Self::remove_entry(&mut state, hash);
            state.ttl_evictions += 1;
        }
        expired.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.access_order.clear();
        state.prefix_index.clear();
        state.total_memory_bytes = 0;
        tracing::info!(removed = count, "KV cache pool cleared");
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn stats(&self) -> KvPoolStats {
        let state = self.state.lock();
        let total_hits = state.cache_hits + state.prefix_hits;
        let hit_rate = if state.total_requests > 0 {
            total_hits as f64 / state.total_requests as f64
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
        KvPoolStats {
            cache_size: state.entries.len(),
            prefix_index_size: state.prefix_index.len(),
            total_memory_bytes: state.total_memory_bytes,
            total_requests: state.total_requests,
            cache_hits: state.cache_hits,
            prefix_hits: state.prefix_hits,
            cache_misses: state.cache_misses,
            hit_rate,
            lru_evictions: state.lru_evictions,
            ttl_evictions: state.ttl_evictions,
            refused_oversize: state.refused_oversize,
            avg_age_seconds: avg_age,
            avg_use_count: avg_use,
        }
    }

    /// Move a hash to the most-recently-used end.
    fn touch(access_order: &mut VecDeque<String>, hash: &str) {
        if let Some(pos) = access_order.iter().position(|h| h == hash) {
            access_order.remove(pos);
        }
        access_order.push_back(hash.to_string());
    }

    /// Remove one entry from the main map, the access order, and the
    /// prefix index. Both indexes must stay consistent.
    fn remove_entry(state: &mut PoolState, hash: &str) {
        let Some(entry) = state.entries.remove(hash) else {
            return;
        };
        state.total_memory_bytes = state.total_memory_bytes.saturating_sub(entry.memory_bytes);
        if let Some(pos) = state.access_order.iter().position(|h| h == hash) {
            state.access_order.remove(pos);
        }
        if let Some(prefix_hash) = &entry.prefix_hash {
            if let Some(siblings) = state.prefix_index.get_mut(prefix_hash) {
                siblings.retain(|h| h != hash);
                if siblings.is_empty() {
                    state.prefix_index.remove(prefix_hash);
                }
            }
        }
    }

    fn evict_lru(state: &mut PoolState) {
        let Some(victim) = state.access_order.front().cloned() else {
            return;
        };
        Self::remove_entry(state, &victim);
        state.lru_evictions += 1;
    }

    #[cfg(test)]
    fn assert_index_consistency(&self) {
        let state = self.state.lock();
        assert_eq!(state.entries.len(), state.access_order.len());
        for (hash, entry) in &state.entries {
            if let Some(prefix_hash) = &entry.prefix_hash {
                let siblings = state
                    .prefix_index
                    .get(prefix_hash)
                    .unwrap_or_else(|| panic!("prefix {prefix_hash} missing for {hash}"));
                assert!(siblings.contains(hash));
            }
        }
        for (prefix_hash, siblings) in &state.prefix_index {
            assert!(!siblings.is_empty(), "empty prefix list {prefix_hash}");
            for hash in siblings {
                assert!(state.entries.contains_key(hash), "dangling {hash}");
            }
        }
        let accounted: usize = state.entries.values().map(|e| e.memory_bytes).sum();
        assert_eq!(accounted, state.total_memory_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn block(tag: u32) -> KvBlock {
        Arc::new(tag)
    }

    fn tag_of(block: &KvBlock) -> u32 {
        *block.downcast_ref::<u32>().expect("test blocks are u32 tags")
    }

    fn pool(max_size: usize) -> KvCachePool {
        KvCachePool::new(KvCachePoolConfig {
            max_size,
            ttl: Duration::from_secs(300),
            max_memory_bytes: 1024 * 1024,
            ..KvCachePoolConfig::default()
        })
    }

    #[test]
    fn test_exact_hit_roundtrip() {
        let pool = pool(10);
        let prompt = "System: you are helpful. User: hello there friend";
        assert!(pool.get(prompt).is_none());
        assert_eq!(pool.put(prompt, block(7), 12), PutOutcome::Stored);

        let hit = pool.get(prompt).expect("exact hit");
        assert_eq!(tag_of(&hit), 7);

        let stats = pool.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        pool.assert_index_consistency();
    }

    #[test]
    fn test_prefix_hit_on_shared_prefix() {
        let pool = pool(10);
        // 60% of these prompts is the identical leading text.
        let base = "System: you are a helpful assistant with a long preamble here. ";
        let first = format!("{base}User: question one");
        let second = format!("{base}User: question two");

        pool.put(&first, block(1), 20);
        // Different full hash, same prefix hash.
        let hit = pool.get(&second);
        assert!(hit.is_some(), "expected prefix hit");
        assert_eq!(pool.stats().prefix_hits, 1);
    }

    #[test]
    fn test_short_prompt_has_no_prefix() {
        let pool = pool(10);
        assert!(pool.prefix_hash("tiny").is_none());
    }

    #[test]
    fn test_size_cap_evicts_lru() {
        let pool = pool(3);
        for i in 0..4 {
            let prompt = format!("prompt number {i} with enough length to index");
            pool.put(&prompt, block(i), 4);
        }
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.stats().lru_evictions, 1);
        // Oldest entry evicted.
        assert!(pool.get("prompt number 0 with enough length to index").is_none());
        pool.assert_index_consistency();
    }

    #[test]
    fn test_read_refreshes_lru_position() {
        let pool = pool(2);
        let a = "first prompt with plenty of characters in it";
        let b = "second prompt with plenty of characters in it";
        let c = "third prompt with plenty of characters in it";
        pool.put(a, block(1), 4);
        pool.put(b, block(2), 4);

        // Touch `a` so `b` becomes the LRU victim.
        assert!(pool.get(a).is_some());
        pool.put(c, block(3), 4);

        assert!(pool.get(a).is_some());
        assert!(pool.get(b).is_none());
        pool.assert_index_consistency();
    }

    #[test]
    fn test_memory_budget_evicts() {
        let pool = KvCachePool::new(KvCachePoolConfig {
            max_size: 100,
            max_memory_bytes: 100, // 12 tokens at 8 bytes each
            ..KvCachePoolConfig::default()
        });
        let a = "aaaaaaaaaa prompt one with enough characters";
        let b = "bbbbbbbbbb prompt two with enough characters";
        pool.put(a, block(1), 8); // 64 bytes
        pool.put(b, block(2), 8); // 64 more: must evict `a`
        assert_eq!(pool.len(), 1);
        assert!(pool.stats().total_memory_bytes <= 100);
        pool.assert_index_consistency();
    }

    #[test]
    fn test_oversize_entry_refused_without_looping() {
        let pool = KvCachePool::new(KvCachePoolConfig {
            max_size: 10,
            max_memory_bytes: 64,
            ..KvCachePoolConfig::default()
        });
        // 100 tokens -> 800 bytes > 64-byte budget.
        let outcome = pool.put("gigantic prompt that cannot possibly fit", block(1), 100);
        assert_eq!(outcome, PutOutcome::Refused);
        assert!(pool.is_empty());
        assert_eq!(pool.stats().refused_oversize, 1);
    }

    #[test]
    fn test_ttl_expiry_on_get() {
        let pool = KvCachePool::new(KvCachePoolConfig {
            ttl: Duration::from_millis(10),
            ..KvCachePoolConfig::default()
        });
        let prompt = "a prompt that will expire before the second read";
        pool.put(prompt, block(1), 4);
        std::thread::sleep(Duration::from_millis(25));

        assert!(pool.get(prompt).is_none());
        let stats = pool.stats();
        assert_eq!(stats.ttl_evictions, 1);
        assert_eq!(stats.cache_size, 0);
        pool.assert_index_consistency();
    }

    #[test]
    fn test_cleanup_expired_counts() {
        let pool = KvCachePool::new(KvCachePoolConfig {
            ttl: Duration::from_millis(10),
            ..KvCachePoolConfig::default()
        });
        pool.put("expiring prompt one with enough characters", block(1), 4);
        pool.put("expiring prompt two with enough characters", block(2), 4);
        std::thread::sleep(Duration::from_millis(25));
        pool.put("fresh prompt three with enough characters", block(3), 4);

        assert_eq!(pool.cleanup_expired(), 2);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.stats().ttl_evictions, 2);
        pool.assert_index_consistency();
    }

    #[test]
    fn test_clear_resets_state() {
        let pool = pool(10);
        pool.put("some cached prompt with enough characters", block(1), 4);
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.stats().total_memory_bytes, 0);
        pool.assert_index_consistency();
    }

    #[test]
    fn test_random_operations_keep_invariants() {
        let pool = KvCachePool::new(KvCachePoolConfig {
            max_size: 8,
            max_memory_bytes: 400,
            ..KvCachePoolConfig::default()
        });
        for round in 0..200u32 {
            let prompt = format!(
                "shared preamble for grouping purposes number {} tail {round}",
                round % 5
            );
            match round % 4 {
                0 | 1 => {
                    pool.put(&prompt, block(round), (round % 10 + 1) as usize);
                }
                2 => {
                    let _ = pool.get(&prompt);
                }
                _ => {
                    pool.cleanup_expired();
                }
            }
            assert!(pool.len() <= 8);
            assert!(pool.stats().total_memory_bytes <= 400);
        }
        pool.assert_index_consistency();
    }
}
