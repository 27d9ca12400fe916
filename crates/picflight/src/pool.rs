// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A bounded pool of spare bitmap buffers.

use std::collections::{BTreeMap, HashMap};

use lru::LruCache;
use parking_lot::Mutex;

use crate::{
    Bitmap, PixelFormat,
    trim::{TrimAction, TrimLevel, scale_budget},
};

/// Largest ratio between a pooled allocation and the requested size that still counts as a fit.
///
/// Handing out much larger buffers would pin memory that a smaller request does not need.
const MAX_OVERSIZE_FACTOR: usize = 8;

/// A bitmap shape to allocate ahead of time with [`ReusePool::pre_fill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreFillType {
    width: u32,
    height: u32,
    format: PixelFormat,
    weight: u32,
}

impl PreFillType {
    /// A `width` x `height` ARGB shape with weight 1.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Argb8888,
            weight: 1,
        }
    }

    /// Sets the pixel format.
    #[must_use]
    pub const fn format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the share of the free budget this shape gets relative to the others.
    #[must_use]
    pub const fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    const fn byte_size(self) -> usize {
        self.format.byte_size(self.width, self.height)
    }
}

/// A bounded, thread-safe pool of spare [`Bitmap`] buffers.
///
/// Buffers are bucketed by pixel format and allocation size. [`get`](Self::get) returns the
/// smallest pooled buffer of the requested format that is large enough (up to eight times the
/// requested size) and removes it from the pool; a buffer is never handed out twice without
/// being [`put`](Self::put) back in between. When the byte budget is exceeded the least recently
/// pooled buffers are evicted first.
///
/// Trimming only ever touches pooled buffers, never ones currently on loan, so it does not
/// wait for anything but the pool's own lock.
///
/// # Examples
///
/// ```
/// use picflight::{Bitmap, PixelFormat, ReusePool};
///
/// let pool = ReusePool::with_max_size(1024 * 1024);
/// assert!(pool.put(Bitmap::new(100, 100, PixelFormat::Argb8888)));
///
/// let reused = pool.get(50, 50, PixelFormat::Argb8888).unwrap();
/// assert_eq!((reused.width(), reused.height()), (50, 50));
/// assert!(pool.get(50, 50, PixelFormat::Argb8888).is_none());
/// ```
#[derive(Debug)]
pub struct ReusePool {
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    entries: LruCache<u64, Bitmap>,
    buckets: HashMap<PixelFormat, BTreeMap<usize, Vec<u64>>>,
    current_size: usize,
    max_size: usize,
    initial_max_size: usize,
    next_id: u64,
    stats: PoolStats,
}

/// Counters describing how well the pool is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// `get` calls that returned a buffer.
    pub hits: u64,
    /// `get` calls that found nothing suitable.
    pub misses: u64,
    /// Buffers accepted by `put`.
    pub puts: u64,
    /// Buffers evicted to stay within budget.
    pub evictions: u64,
}

impl ReusePool {
    /// Creates a pool that holds at most `max_size` bytes of buffers.
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                entries: LruCache::unbounded(),
                buckets: HashMap::new(),
                current_size: 0,
                max_size,
                initial_max_size: max_size,
                next_id: 0,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Offers a buffer to the pool.
    ///
    /// Returns `false` if the buffer is larger than the whole budget, in which case it is
    /// dropped.
    pub fn put(&self, bitmap: Bitmap) -> bool {
        let mut state = self.state.lock();
        let size = bitmap.allocation_size();
        if size == 0 || size > state.max_size {
            tracing::trace!(size, max_size = state.max_size, "rejected bitmap from reuse pool");
            return false;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.buckets.entry(bitmap.format()).or_default().entry(size).or_default().push(id);
        state.entries.put(id, bitmap);
        state.current_size += size;
        state.stats.puts += 1;

        let max_size = state.max_size;
        state.evict_to(max_size);
        true
    }

    /// Takes the best-fitting pooled buffer, reconfigured to `width` x `height`.
    #[must_use]
    pub fn get(&self, width: u32, height: u32, format: PixelFormat) -> Option<Bitmap> {
        let needed = format.byte_size(width, height);
        if needed == 0 {
            return None;
        }

        let mut state = self.state.lock();
        let Some(mut bitmap) = state.take_best_fit(format, needed) else {
            state.stats.misses += 1;
            return None;
        };
        state.stats.hits += 1;

        let reconfigured = bitmap.reconfigure(width, height, format);
        debug_assert!(reconfigured, "best fit is always large enough");
        Some(bitmap)
    }

    /// Allocates fresh buffers into the free part of the budget, split between `types` by weight.
    ///
    /// Each shape gets as many whole buffers as fit in its share. Shapes are allocated
    /// round-robin, so every shape is represented even if the pool is trimmed meanwhile. Returns
    /// the number of buffers added.
    pub fn pre_fill(&self, types: &[PreFillType]) -> usize {
        let free = {
            let state = self.state.lock();
            state.max_size.saturating_sub(state.current_size)
        };
        let total_weight: u128 = types.iter().map(|kind| u128::from(kind.weight)).sum();
        if free == 0 || total_weight == 0 {
            return 0;
        }

        let mut remaining: Vec<(PreFillType, usize)> = types
            .iter()
            .filter_map(|&kind| {
                let bytes = kind.byte_size();
                if bytes == 0 {
                    return None;
                }
                let share = usize::try_from(free as u128 * u128::from(kind.weight) / total_weight).unwrap_or(free);
                let count = share / bytes;
                (count > 0).then_some((kind, count))
            })
            .collect();

        let mut added = 0;
        while !remaining.is_empty() {
            remaining.retain_mut(|(kind, count)| {
                if self.put(Bitmap::new(kind.width, kind.height, kind.format)) {
                    added += 1;
                }
                *count -= 1;
                *count > 0
            });
        }
        tracing::debug!(added, free, "pre-filled reuse pool");
        added
    }

    /// Rescales the budget relative to the size the pool was created with.
    pub fn set_size_multiplier(&self, multiplier: f32) {
        let mut state = self.state.lock();
        state.max_size = scale_budget(state.initial_max_size, multiplier);
        let max_size = state.max_size;
        state.evict_to(max_size);
    }

    /// Shrinks the pool in response to memory pressure.
    pub fn trim_memory(&self, level: TrimLevel) {
        let mut state = self.state.lock();
        let target = match level.action() {
            TrimAction::Clear => 0,
            TrimAction::Halve => state.max_size / 2,
            TrimAction::Keep => return,
        };
        tracing::debug!(?level, target, "trimming reuse pool");
        state.evict_to(target);
    }

    /// Drops every pooled buffer.
    pub fn clear_memory(&self) {
        self.state.lock().evict_to(0);
    }

    /// Current budget in bytes.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    /// Bytes currently pooled.
    #[must_use]
    pub fn current_size(&self) -> usize {
        self.state.lock().current_size
    }

    /// Number of pooled buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if no buffer is pooled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit, miss, put and eviction counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }
}

impl PoolState {
    fn take_best_fit(&mut self, format: PixelFormat, needed: usize) -> Option<Bitmap> {
        let bucket = self.buckets.get_mut(&format)?;
        let limit = needed.saturating_mul(MAX_OVERSIZE_FACTOR);
        let (&size, ids) = bucket.range_mut(needed..=limit).next()?;
        let id = ids.pop()?;
        if ids.is_empty() {
            bucket.remove(&size);
        }

        let bitmap = self.entries.pop(&id)?;
        self.current_size -= size;
        Some(bitmap)
    }

    fn evict_to(&mut self, target: usize) {
        while self.current_size > target {
            let Some((id, bitmap)) = self.entries.pop_lru() else {
                break;
            };
            let size = bitmap.allocation_size();
            self.forget(bitmap.format(), size, id);
            self.current_size -= size;
            self.stats.evictions += 1;
        }
    }

    fn forget(&mut self, format: PixelFormat, size: usize, id: u64) {
        let Some(bucket) = self.buckets.get_mut(&format) else {
            return;
        };
        if let Some(ids) = bucket.get_mut(&size) {
            ids.retain(|&candidate| candidate != id);
            if ids.is_empty() {
                bucket.remove(&size);
            }
        }
    }
}
