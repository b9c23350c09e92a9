#![forbid(unsafe_code)]

//! Bounded least-recently-used cache of per-key resources.
//!
//! Each entry owns one resource (a datastore session). Entries leave the
//! cache only through [`ResourceCache::resolve`] evicting the oldest entry,
//! [`ResourceCache::invalidate`], or [`ResourceCache::close_all`]; in every
//! case the resource is flushed and then closed before the call returns.

use crate::error::Result;
use crate::metrics::metrics;
use async_trait::async_trait;
use lru::LruCache;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;

pub const DEFAULT_CACHE_CAPACITY: usize = 100;

#[async_trait]
pub trait CachedResource: Send {
    /// Persists pending writes.
    async fn flush(&mut self) -> Result<()>;

    /// Releases the underlying connection. Called exactly once, after `flush`.
    async fn close(&mut self) -> Result<()>;
}

pub struct ResourceCache<K, R>
where
    K: Hash + Eq,
{
    owner: String,
    entries: LruCache<K, R>,
}

impl<K, R> ResourceCache<K, R>
where
    K: Hash + Eq + Clone + Display + Send + Sync,
    R: CachedResource,
{
    pub fn new(owner: impl Into<String>, capacity: NonZeroUsize) -> Self {
        Self {
            owner: owner.into(),
            entries: LruCache::new(capacity),
        }
    }

    /// Builds a cache, rejecting a zero capacity.
    pub fn with_capacity(owner: impl Into<String>, capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| crate::err!("resource cache capacity must be at least 1"))?;
        Ok(Self::new(owner, capacity))
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Membership check that leaves recency untouched.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Returns the live resource for `key`, creating it with `factory` on a miss.
    ///
    /// A hit marks the entry most recently used. On a miss with a full cache
    /// the least recently used entry is flushed and closed first, so the
    /// cache never holds more than `capacity` resources. A factory error is
    /// returned as is and nothing is cached for the key.
    pub async fn resolve<F, Fut>(&mut self, key: &K, factory: F) -> Result<&mut R>
    where
        F: FnOnce(K) -> Fut + Send,
        Fut: Future<Output = Result<R>> + Send,
    {
        let counters = metrics();

        if self.entries.contains(key) {
            counters.inc_cache_hits();
            return self
                .entries
                .get_mut(key)
                .ok_or_else(|| crate::err!("cache entry `{key}` disappeared during lookup"));
        }

        counters.inc_cache_misses();

        if self.entries.len() >= self.capacity() {
            if let Some((evicted_key, evicted)) = self.entries.pop_lru() {
                counters.inc_cache_evictions();
                retire(&self.owner, &evicted_key, evicted, "capacity").await;
            }
        }

        let resource = factory(key.clone()).await?;

        tracing::debug!(
            target: "tsm_dispatcher::cache",
            event = "cache_entry_created",
            owner = %self.owner,
            key = %key,
            size = self.entries.len() + 1,
            capacity = self.capacity()
        );

        self.entries.push(key.clone(), resource);
        self.entries
            .get_mut(key)
            .ok_or_else(|| crate::err!("cache entry `{key}` missing after insert"))
    }

    /// Flushes, closes and removes the entry for `key`. Returns whether one existed.
    pub async fn invalidate(&mut self, key: &K) -> bool {
        match self.entries.pop(key) {
            Some(resource) => {
                retire(&self.owner, key, resource, "invalidated").await;
                true
            }
            None => false,
        }
    }

    /// Retires every entry, least recently used first.
    pub async fn close_all(&mut self) {
        while let Some((key, resource)) = self.entries.pop_lru() {
            retire(&self.owner, &key, resource, "shutdown").await;
        }
    }
}

async fn retire<K, R>(owner: &str, key: &K, mut resource: R, reason: &str)
where
    K: Display + Sync,
    R: CachedResource,
{
    if let Err(err) = resource.flush().await {
        metrics().inc_eviction_flush_failures();
        tracing::warn!(
            target: "tsm_dispatcher::cache",
            event = "cache_flush_failed",
            owner = %owner,
            key = %key,
            reason = %reason,
            error = %err
        );
    }

    if let Err(err) = resource.close().await {
        tracing::warn!(
            target: "tsm_dispatcher::cache",
            event = "cache_close_failed",
            owner = %owner,
            key = %key,
            reason = %reason,
            error = %err
        );
    }

    tracing::debug!(
        target: "tsm_dispatcher::cache",
        event = "cache_entry_retired",
        owner = %owner,
        key = %key,
        reason = %reason
    );
}
