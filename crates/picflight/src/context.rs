// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The application-wide entry point.

use std::{cell::Cell, fmt, io, rc::Rc, sync::Arc};

use crate::{
    DiskCache, DiskCacheClearer, Engine, EngineBuilder, MemoryCategory, ModelLoader, PixelFormat, PreFillType,
    RequestManager, RequestOptions, RequestPool, ResourceDecoder, ResourceError, ReusePool, TransitionOptions, TrimLevel,
    request::DEFAULT_REQUEST_POOL_CAPACITY,
};

const MEMORY_CACHE_TARGET_SCREENS: usize = 2;
const POOL_TARGET_SCREENS: usize = 4;
const MAX_SIZE_PERCENT: usize = 40;
const LOW_MEMORY_MAX_SIZE_PERCENT: usize = 33;

/// Byte budgets of the memory cache and the reuse pool.
///
/// # Examples
///
/// ```
/// use picflight::MemorySizes;
///
/// // A 1080x1920 screen with 512 MiB of heap fits the full targets of two and four screens.
/// let sizes = MemorySizes::for_screen(1080, 1920, 512 * 1024 * 1024, false);
/// assert_eq!(sizes.memory_cache_size(), 2 * 1080 * 1920 * 4);
/// assert_eq!(sizes.pool_size(), 4 * 1080 * 1920 * 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySizes {
    memory_cache_size: usize,
    pool_size: usize,
}

impl MemorySizes {
    /// Explicit budgets.
    #[must_use]
    pub fn new(memory_cache_size: usize, pool_size: usize) -> Self {
        Self {
            memory_cache_size,
            pool_size,
        }
    }

    /// Budgets sized to hold a few screens of full-color pixels.
    ///
    /// The memory cache targets two screens and the pool four. If together they exceed 40% of
    /// `heap_limit` (33% on low-memory devices), that share is split between them in the same
    /// two-to-four ratio.
    #[must_use]
    pub fn for_screen(width: u32, height: u32, heap_limit: usize, is_low_memory: bool) -> Self {
        let percent = if is_low_memory {
            LOW_MEMORY_MAX_SIZE_PERCENT
        } else {
            MAX_SIZE_PERCENT
        };
        let max_size = heap_limit / 100 * percent;
        let screen = PixelFormat::Argb8888.byte_size(width, height);
        let memory_cache_size = screen * MEMORY_CACHE_TARGET_SCREENS;
        let pool_size = screen * POOL_TARGET_SCREENS;

        let sizes = if memory_cache_size + pool_size <= max_size {
            Self::new(memory_cache_size, pool_size)
        } else {
            let part = max_size / (MEMORY_CACHE_TARGET_SCREENS + POOL_TARGET_SCREENS);
            Self::new(part * MEMORY_CACHE_TARGET_SCREENS, part * POOL_TARGET_SCREENS)
        };
        tracing::debug!(
            memory_cache_size = sizes.memory_cache_size,
            pool_size = sizes.pool_size,
            max_size,
            "calculated memory sizes"
        );
        sizes
    }

    /// Memory cache budget in bytes.
    #[must_use]
    pub fn memory_cache_size(&self) -> usize {
        self.memory_cache_size
    }

    /// Reuse pool budget in bytes.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

/// Owns the engine, the pools and the default request options of an application.
///
/// Cloning is cheap and yields a handle to the same loader. Like the [`Engine`], the loader is
/// confined to its owner thread.
#[derive(Clone)]
pub struct ImageLoader {
    inner: Rc<LoaderInner>,
}

struct LoaderInner {
    engine: Engine,
    requests: RequestPool,
    default_options: RequestOptions,
    default_transition: TransitionOptions,
    memory_category: Cell<MemoryCategory>,
}

impl ImageLoader {
    /// Starts configuring a loader that fetches with `loader` and decodes with `decoder`.
    #[must_use]
    pub fn builder(loader: Arc<dyn ModelLoader>, decoder: Arc<dyn ResourceDecoder>) -> ImageLoaderBuilder {
        ImageLoaderBuilder {
            engine: Engine::builder(loader, decoder),
            memory_sizes: None,
            default_options: RequestOptions::new(),
            default_transition: TransitionOptions::default(),
            request_pool_capacity: DEFAULT_REQUEST_POOL_CAPACITY,
        }
    }

    /// The engine.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// The pool of recycled bitmaps.
    #[must_use]
    pub fn reuse_pool(&self) -> &Arc<ReusePool> {
        self.inner.engine.reuse_pool()
    }

    /// The pool of recycled requests.
    #[must_use]
    pub fn request_pool(&self) -> &RequestPool {
        &self.inner.requests
    }

    /// Options every request starts from.
    #[must_use]
    pub fn default_options(&self) -> &RequestOptions {
        &self.inner.default_options
    }

    /// Transition used by requests that do not set one.
    #[must_use]
    pub fn default_transition(&self) -> TransitionOptions {
        self.inner.default_transition
    }

    /// A manager for a new lifecycle scope.
    #[must_use]
    pub fn request_manager(&self) -> RequestManager {
        RequestManager::new(self.clone())
    }

    /// Empties the memory cache, then the reuse pool.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] if a cached resource was already recycled.
    pub fn clear_memory(&self) -> Result<(), ResourceError> {
        self.inner.engine.clear_memory()?;
        self.reuse_pool().clear_memory();
        Ok(())
    }

    /// Shrinks the memory cache and the reuse pool for `level`.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] if a cached resource was already recycled.
    pub fn trim_memory(&self, level: TrimLevel) -> Result<(), ResourceError> {
        self.inner.engine.trim_memory(level)?;
        self.reuse_pool().trim_memory(level);
        Ok(())
    }

    /// Rescales the memory cache and the reuse pool. Returns the previous category.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] if a cached resource was already recycled.
    pub fn set_memory_category(&self, category: MemoryCategory) -> Result<MemoryCategory, ResourceError> {
        let multiplier = category.multiplier();
        self.inner.engine.set_size_multiplier(multiplier)?;
        self.reuse_pool().set_size_multiplier(multiplier);
        Ok(self.inner.memory_category.replace(category))
    }

    /// The current memory category.
    #[must_use]
    pub fn memory_category(&self) -> MemoryCategory {
        self.inner.memory_category.get()
    }

    /// Allocates bitmaps of the given shapes into the free part of the reuse pool.
    ///
    /// Returns the number of bitmaps added. See [`ReusePool::pre_fill`].
    pub fn pre_fill_pool(&self, types: &[PreFillType]) -> usize {
        self.reuse_pool().pre_fill(types)
    }

    /// A handle that clears the disk cache from a background thread.
    #[must_use]
    pub fn disk_cache_clearer(&self) -> DiskCacheClearer {
        self.inner.engine.disk_cache_clearer()
    }

    /// Stops the engine. See [`Engine::shutdown`].
    pub fn shutdown(&self) {
        self.inner.engine.shutdown();
    }
}

impl fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLoader")
            .field("engine", &self.inner.engine)
            .field("requests", &self.inner.requests)
            .field("memory_category", &self.inner.memory_category.get())
            .finish_non_exhaustive()
    }
}

/// Configures and builds an [`ImageLoader`].
pub struct ImageLoaderBuilder {
    engine: EngineBuilder,
    memory_sizes: Option<MemorySizes>,
    default_options: RequestOptions,
    default_transition: TransitionOptions,
    request_pool_capacity: usize,
}

impl ImageLoaderBuilder {
    /// Persists source data in `disk_cache`.
    #[must_use]
    pub fn disk_cache(mut self, disk_cache: Arc<dyn DiskCache>) -> Self {
        self.engine = self.engine.disk_cache(disk_cache);
        self
    }

    /// Sets the memory cache and reuse pool budgets.
    #[must_use]
    pub fn memory_sizes(mut self, sizes: MemorySizes) -> Self {
        self.memory_sizes = Some(sizes);
        self
    }

    /// Sets the options every request starts from.
    #[must_use]
    pub fn default_request_options(mut self, options: RequestOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Sets the transition used by requests that do not set one.
    #[must_use]
    pub fn default_transition(mut self, transition: TransitionOptions) -> Self {
        self.default_transition = transition;
        self
    }

    /// Sets how many recycled requests are kept for reuse.
    #[must_use]
    pub fn request_pool_capacity(mut self, capacity: usize) -> Self {
        self.request_pool_capacity = capacity;
        self
    }

    /// Sets how many source fetches run at once.
    #[must_use]
    pub fn source_threads(mut self, threads: usize) -> Self {
        self.engine = self.engine.source_threads(threads);
        self
    }

    /// Sets how many disk-cache reads run at once.
    #[must_use]
    pub fn disk_cache_threads(mut self, threads: usize) -> Self {
        self.engine = self.engine.disk_cache_threads(threads);
        self
    }

    /// Sets how many fetches of the unlimited source pool run at once.
    #[must_use]
    pub fn unlimited_source_threads(mut self, threads: usize) -> Self {
        self.engine = self.engine.unlimited_source_threads(threads);
        self
    }

    /// Builds the loader on the calling thread, which becomes its owner thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker threads cannot be started.
    pub fn build(self) -> io::Result<ImageLoader> {
        let mut engine = self.engine;
        if let Some(sizes) = self.memory_sizes {
            engine = engine
                .reuse_pool(Arc::new(ReusePool::with_max_size(sizes.pool_size)))
                .memory_cache_size(sizes.memory_cache_size);
        }
        let engine = engine.build()?;
        tracing::debug!(
            memory_cache_size = engine.memory_cache_max_size(),
            pool_size = engine.reuse_pool().max_size(),
            "image loader ready"
        );

        Ok(ImageLoader {
            inner: Rc::new(LoaderInner {
                engine,
                requests: RequestPool::new(self.request_pool_capacity),
                default_options: self.default_options,
                default_transition: self.default_transition,
                memory_category: Cell::new(MemoryCategory::Normal),
            }),
        })
    }
}

impl fmt::Debug for ImageLoaderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLoaderBuilder")
            .field("engine", &self.engine)
            .field("memory_sizes", &self.memory_sizes)
            .field("request_pool_capacity", &self.request_pool_capacity)
            .finish_non_exhaustive()
    }
}
