//! Per-origin rate limiting, global fetch concurrency, and result caching.
//!
//! Process-wide state lives here: `RateLimitState` per origin and the
//! TTL cache. Both are reset on restart. Every read-then-write against
//! them happens under a single lock acquisition so concurrent callers
//! observe atomic increment-and-check semantics.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use url::Url;

use crate::error::{PipelineError, Result};

/// Per-origin throttling state.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub last_request_at: Option<Instant>,
    pub window_request_count: u32,
    pub window_reset_at: Instant,
}

/// The rate-limit window length.
const WINDOW: Duration = Duration::from_secs(60);

/// Per-origin gate: minimum inter-request delay plus a rolling
/// per-minute ceiling. State resets when the window expires.
pub struct OriginGate {
    states: Mutex<HashMap<String, RateLimitState>>,
    min_delay: Duration,
    max_per_minute: u32,
}

impl OriginGate {
    pub fn new(min_delay_ms: u64, max_per_minute: u32) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            min_delay: Duration::from_millis(min_delay_ms),
            max_per_minute,
        }
    }

    /// Atomically check the origin's budget and reserve a slot in it.
    /// Returns false when the minimum delay has not elapsed or the
    /// per-minute ceiling is reached.
    pub fn check_and_reserve(&self, origin: &str) -> bool {
        let now = Instant::now();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states.entry(origin.to_string()).or_insert(RateLimitState {
            last_request_at: None,
            window_request_count: 0,
            window_reset_at: now + WINDOW,
        });

        if now >= state.window_reset_at {
            state.window_request_count = 0;
            state.window_reset_at = now + WINDOW;
        }

        if state.window_request_count >= self.max_per_minute {
            return false;
        }

        if let Some(last) = state.last_request_at {
            if now.duration_since(last) < self.min_delay {
                return false;
            }
        }

        state.window_request_count += 1;
        state.last_request_at = Some(now);
        true
    }

    /// Sleep until the origin admits a request, then reserve it.
    pub async fn wait_and_reserve(&self, origin: &str) {
        loop {
            if self.check_and_reserve(origin) {
                return;
            }
            let wait = self.retry_hint(origin);
            debug!(origin, wait_ms = wait.as_millis() as u64, "origin gate full, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// How long a rejected caller should wait before trying again.
    fn retry_hint(&self, origin: &str) -> Duration {
        let now = Instant::now();
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = states.get(origin) else {
            return self.min_delay;
        };

        if state.window_request_count >= self.max_per_minute {
            return state.window_reset_at.saturating_duration_since(now);
        }
        if let Some(last) = state.last_request_at {
            let since = now.duration_since(last);
            if since < self.min_delay {
                return self.min_delay - since;
            }
        }
        Duration::from_millis(10)
    }

    /// Snapshot of an origin's state, for introspection and tests.
    pub fn state_of(&self, origin: &str) -> Option<RateLimitState> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(origin).cloned()
    }
}

/// Derive the rate-limit key (scheme + host + port) from a URL.
pub fn origin_of(url: &Url) -> String {
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), url.host_str().unwrap_or(""), port),
        None => format!("{}://{}", url.scheme(), url.host_str().unwrap_or("")),
    }
}

/// Global fetch concurrency bound. Requests beyond capacity queue
/// unless the caller opts into reject-on-saturation.
pub struct FetchSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl FetchSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a slot. The permit releases the slot when dropped, so a
    /// cancelled caller cannot orphan capacity.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Internal(format!("fetch semaphore closed: {e}")))
    }

    /// Reject-on-saturation variant.
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| PipelineError::RateLimited("fetch capacity saturated".to_string()))
    }
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// TTL cache with insertion-order eviction.
///
/// Entries expire `ttl` after insertion. When the cache is full, the
/// oldest *inserted* entry is evicted — insertion order, not LRU:
/// reads do not refresh an entry's position.
pub struct TtlCache<V> {
    inner: Mutex<CacheInner<V>>,
    ttl: Duration,
    max_entries: usize,
}

struct CacheInner<V> {
    map: HashMap<String, CacheEntry<V>>,
    order: VecDeque<String>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl: Duration::from_secs(ttl_secs),
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.map.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => Some(entry.value.clone()),
            Some(_) => {
                inner.map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, value: V) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if !inner.map.contains_key(key) {
            while inner.map.len() >= self.max_entries {
                // Expired-and-removed keys may linger in the order
                // queue; popping them is a no-op on the map.
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.map.remove(&oldest);
            }
            inner.order.push_back(key.to_string());
        }

        inner.map.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.clear();
        inner.order.clear();
    }
}
