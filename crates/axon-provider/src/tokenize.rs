//! Token-count caching for the `Tokenize` capability.
//!
//! Exact counts from a provider-native endpoint are worth caching: the same
//! prompt prefix is re-counted on every turn while the memory manager
//! decides whether to summarize. Entries carry a TTL and an LRU access
//! timestamp; a background tick sweeps expired entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::debug;

use axon_core::tokens::estimate_message_tokens;
use axon_core::types::Message;

use crate::provider::ChatProvider;

const DEFAULT_CAPACITY: usize = 512;
const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    count: usize,
    expires_at: Instant,
    last_access: Instant,
}

/// Thread-safe TTL + LRU cache for exact token counts.
pub struct TokenCountCache {
    inner: Mutex<HashMap<String, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
    /// Misses recorded for diagnostics; surfaced via [`Self::miss_count`].
    misses: AtomicU64,
}

impl Default for TokenCountCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl TokenCountCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key over the model and the full message payload.
    pub fn key(model: &str, messages: &[Message]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        for msg in messages {
            hasher.update([0u8]);
            hasher.update(msg.role.to_string().as_bytes());
            hasher.update(msg.content.as_bytes());
            for call in &msg.tool_calls {
                hasher.update(call.name.as_bytes());
                hasher.update(call.args.to_string().as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<usize> {
        let mut cache = self.inner.lock().unwrap();
        let now = Instant::now();
        match cache.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = now;
                Some(entry.count)
            }
            Some(_) => {
                cache.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, count: usize) {
        let mut cache = self.inner.lock().unwrap();
        let now = Instant::now();
        if cache.len() >= self.capacity && !cache.contains_key(&key) {
            // Evict the least-recently-used entry.
            let lru_key = cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(k, _)| k.clone());
            if let Some(k) = lru_key {
                cache.remove(&k);
            }
        }
        cache.insert(
            key,
            CacheEntry {
                count,
                expires_at: now + self.ttl,
                last_access: now,
            },
        );
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let mut cache = self.inner.lock().unwrap();
        let now = Instant::now();
        let before = cache.len();
        cache.retain(|_, entry| entry.expires_at > now);
        before - cache.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Spawn a background tick that sweeps expired entries until the cache is
/// dropped by all other holders.
pub fn spawn_sweeper(cache: Arc<TokenCountCache>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if Arc::strong_count(&cache) == 1 {
                return;
            }
            let dropped = cache.sweep_expired();
            if dropped > 0 {
                debug!(dropped, "token cache sweep");
            }
        }
    })
}

/// Count tokens through the provider's tokenizer when present, consulting
/// the cache first; fall back to the char/4 estimate otherwise.
pub async fn count_tokens_cached(
    provider: &dyn ChatProvider,
    cache: &TokenCountCache,
    messages: &[Message],
    model: &str,
) -> usize {
    let Some(tokenizer) = provider.tokenizer() else {
        return estimate_message_tokens(messages);
    };

    let key = TokenCountCache::key(model, messages);
    if let Some(count) = cache.get(&key) {
        return count;
    }

    match tokenizer.count_tokens(messages, model).await {
        Ok(count) => {
            cache.insert(key, count);
            count
        }
        Err(e) => {
            debug!(error = %e, "tokenizer failed, using estimate");
            estimate_message_tokens(messages)
        }
    }
}
