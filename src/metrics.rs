use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Per-message and cache counters for one process.
#[derive(Default)]
pub struct DispatchCounters {
    messages_received: AtomicU64,
    decode_failures: AtomicU64,
    validation_failures: AtomicU64,
    action_successes: AtomicU64,
    action_failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    eviction_flush_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCountersSnapshot {
    pub messages_received: u64,
    pub decode_failures: u64,
    pub validation_failures: u64,
    pub action_successes: u64,
    pub action_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub eviction_flush_failures: u64,
}

static DISPATCH_COUNTERS: OnceLock<DispatchCounters> = OnceLock::new();

pub fn metrics() -> &'static DispatchCounters {
    DISPATCH_COUNTERS.get_or_init(DispatchCounters::default)
}

impl DispatchCounters {
    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_decode_failures(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_validation_failures(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_action_successes(&self) {
        self.action_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_action_failures(&self) {
        self.action_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_evictions(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_eviction_flush_failures(&self) {
        self.eviction_flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchCountersSnapshot {
        DispatchCountersSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            action_successes: self.action_successes.load(Ordering::Relaxed),
            action_failures: self.action_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            eviction_flush_failures: self.eviction_flush_failures.load(Ordering::Relaxed),
        }
    }
}
