// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Byte-budgeted LRU cache of released resources.

use std::rc::Rc;

use lru::LruCache;

use crate::{
    CacheKey, EngineResource,
    trim::{TrimAction, TrimLevel, scale_budget},
};

/// Default memory cache budget when none is configured.
const DEFAULT_MAX_SIZE: usize = 32 * 1024 * 1024;

/// Holds resources that nobody has acquired, so a later load of the same key can skip decoding.
///
/// Entries are evicted least recently used first once their total [`size`](EngineResource::size)
/// exceeds the budget. Evicted resources are handed back to the caller, who recycles them.
#[derive(Debug)]
pub(crate) struct MemoryCache {
    entries: LruCache<CacheKey, Rc<EngineResource>>,
    current_size: usize,
    max_size: usize,
    initial_max_size: usize,
}

/// Builder for a [`MemoryCache`].
#[derive(Debug, Clone)]
pub(crate) struct MemoryCacheBuilder {
    max_size: usize,
}

impl Default for MemoryCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheBuilder {
    pub(crate) fn new() -> Self {
        Self { max_size: DEFAULT_MAX_SIZE }
    }

    /// Sets the budget in bytes.
    #[must_use]
    pub(crate) fn max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }

    pub(crate) fn build(self) -> MemoryCache {
        MemoryCache {
            entries: LruCache::unbounded(),
            current_size: 0,
            max_size: self.max_size,
            initial_max_size: self.max_size,
        }
    }
}

impl MemoryCache {
    pub(crate) fn builder() -> MemoryCacheBuilder {
        MemoryCacheBuilder::new()
    }

    /// Inserts a resource and returns everything that had to leave the cache to make room,
    /// including a replaced entry for the same key.
    ///
    /// A resource larger than the whole budget is returned right away.
    #[must_use]
    pub(crate) fn put(&mut self, key: CacheKey, resource: Rc<EngineResource>) -> Vec<Rc<EngineResource>> {
        if resource.size() > self.max_size {
            return vec![resource];
        }

        let mut evicted = Vec::new();
        self.current_size += resource.size();
        if let Some(replaced) = self.entries.put(key, resource) {
            self.current_size -= replaced.size();
            evicted.push(replaced);
        }
        self.evict_to(self.max_size, &mut evicted);
        evicted
    }

    /// Removes and returns the entry for `key`.
    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<Rc<EngineResource>> {
        let resource = self.entries.pop(key)?;
        self.current_size -= resource.size();
        Some(resource)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn current_size(&self) -> usize {
        self.current_size
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    /// Rescales the budget relative to the configured size.
    #[must_use]
    pub(crate) fn set_size_multiplier(&mut self, multiplier: f32) -> Vec<Rc<EngineResource>> {
        self.max_size = scale_budget(self.initial_max_size, multiplier);
        let mut evicted = Vec::new();
        self.evict_to(self.max_size, &mut evicted);
        evicted
    }

    #[must_use]
    pub(crate) fn trim_memory(&mut self, level: TrimLevel) -> Vec<Rc<EngineResource>> {
        let target = match level.action() {
            TrimAction::Clear => 0,
            TrimAction::Halve => self.max_size / 2,
            TrimAction::Keep => return Vec::new(),
        };
        tracing::debug!(?level, target, "trimming memory cache");
        let mut evicted = Vec::new();
        self.evict_to(target, &mut evicted);
        evicted
    }

    #[must_use]
    pub(crate) fn clear_memory(&mut self) -> Vec<Rc<EngineResource>> {
        let mut evicted = Vec::new();
        self.evict_to(0, &mut evicted);
        evicted
    }

    fn evict_to(&mut self, target: usize, evicted: &mut Vec<Rc<EngineResource>>) {
        while self.current_size > target {
            let Some((_, resource)) = self.entries.pop_lru() else {
                break;
            };
            self.current_size -= resource.size();
            evicted.push(resource);
        }
    }
}
