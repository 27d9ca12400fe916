// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The deduplicating front door for loads.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt, io,
    rc::{Rc, Weak},
    sync::Arc,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    CacheKey, ClearDiskCacheError, DataSource, Dimension, DiskCacheStrategy, EngineResource, LoadFailure, Model,
    Priority, RequestOptions, Resource, ResourceError, ResourceKind, ReusePool, TrimLevel, UsageError,
    active::ActiveResources,
    decode::{Collaborators, Completion, DecodeTask, DiskCache, JobId, ModelLoader, Outcome, ResourceDecoder},
    executor::{Executor, Lane, PoolSizes},
    handle::ResourceListener,
    job::{EngineJob, JobStatus, ResourceCallback},
    memory_cache::MemoryCache,
};

/// Reuse pool budget used when the builder is not given a pool.
const DEFAULT_POOL_SIZE: usize = 16 * 1024 * 1024;

/// Everything that identifies and configures one load.
///
/// The [`CacheKey`] is computed in full when the parameters are created.
#[derive(Debug, Clone)]
pub struct LoadParams {
    key: CacheKey,
    priority: Priority,
    disk_cache_strategy: DiskCacheStrategy,
    is_memory_cacheable: bool,
    use_unlimited_source_pool: bool,
    only_retrieve_from_cache: bool,
}

impl LoadParams {
    /// Derives the parameters of a load of `model` at `width` x `height`.
    #[must_use]
    pub fn new(
        model: Model,
        width: Dimension,
        height: Dimension,
        transcode_kind: ResourceKind,
        options: &RequestOptions,
    ) -> Self {
        let key = CacheKey::new(
            model,
            options.get_signature(),
            width,
            height,
            options.get_transformations().to_vec(),
            options.get_resource_kind(transcode_kind),
            transcode_kind,
            options.get_decode_options().clone(),
        );
        Self {
            key,
            priority: options.get_priority().unwrap_or_default(),
            disk_cache_strategy: options.get_disk_cache_strategy(),
            is_memory_cacheable: options.is_memory_cacheable(),
            use_unlimited_source_pool: options.get_use_unlimited_source_pool(),
            only_retrieve_from_cache: options.get_only_retrieve_from_cache(),
        }
    }

    /// The key of the load.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// A subscription to a running load, returned by [`Engine::load`].
pub struct LoadStatus {
    job: Rc<EngineJob>,
    callback: Rc<dyn ResourceCallback>,
    engine: Weak<EngineInner>,
}

impl LoadStatus {
    /// Stops waiting for the load. If no waiter remains, the load itself is cancelled.
    pub fn cancel(self) {
        match self.engine.upgrade() {
            Some(engine) => engine.remove_waiter(&self.job, &self.callback),
            None => {
                if self.job.remove_waiter(&self.callback) {
                    self.job.cancel();
                }
            }
        }
    }
}

impl fmt::Debug for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadStatus").field("job", &self.job).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JobKey {
    key: CacheKey,
    only_retrieve_from_cache: bool,
}

impl JobKey {
    fn of(job: &EngineJob) -> Self {
        Self {
            key: job.key().clone(),
            only_retrieve_from_cache: job.only_retrieve_from_cache(),
        }
    }
}

/// Starts loads, shares identical ones and keeps decoded resources around for reuse.
///
/// A load is served, in order, from the active resources (resources some request currently
/// holds), from the memory cache, by joining a job already running for the same key, or by
/// starting a new job. Jobs fetch and decode on worker threads; their results come back over a
/// queue that the owner thread drains with [`poll_completions`](Self::poll_completions),
/// [`wait_for_completions`](Self::wait_for_completions) or
/// [`run_until_idle`](Self::run_until_idle). All callbacks run on the owner thread, inside those
/// calls or inside [`load`](Self::load) itself for memory hits.
///
/// The engine is confined to the thread that built it: it is neither `Send` nor `Sync`.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

struct EngineInner {
    state: RefCell<EngineState>,
    collaborators: Collaborators,
    executor: RefCell<Option<Executor>>,
    completions: UnboundedSender<Completion>,
    receiver: RefCell<UnboundedReceiver<Completion>>,
    owner: ThreadId,
}

struct EngineState {
    jobs: HashMap<JobKey, Rc<EngineJob>>,
    in_flight: HashMap<JobId, Rc<EngineJob>>,
    active: ActiveResources,
    memory_cache: MemoryCache,
    next_job_id: JobId,
}

/// Configures and builds an [`Engine`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use picflight::{Engine, ModelLoader, ResourceDecoder, ReusePool};
///
/// # fn build(loader: Arc<dyn ModelLoader>, decoder: Arc<dyn ResourceDecoder>) -> std::io::Result<()> {
/// let engine = Engine::builder(loader, decoder)
///     .reuse_pool(Arc::new(ReusePool::with_max_size(8 * 1024 * 1024)))
///     .memory_cache_size(16 * 1024 * 1024)
///     .source_threads(2)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct EngineBuilder {
    loader: Arc<dyn ModelLoader>,
    decoder: Arc<dyn ResourceDecoder>,
    disk_cache: Option<Arc<dyn DiskCache>>,
    pool: Option<Arc<ReusePool>>,
    memory_cache_size: Option<usize>,
    pool_sizes: PoolSizes,
}

impl EngineBuilder {
    fn new(loader: Arc<dyn ModelLoader>, decoder: Arc<dyn ResourceDecoder>) -> Self {
        Self {
            loader,
            decoder,
            disk_cache: None,
            pool: None,
            memory_cache_size: None,
            pool_sizes: PoolSizes::default(),
        }
    }

    /// Persists source data in `disk_cache`. Without one, every load fetches from its source.
    #[must_use]
    pub fn disk_cache(mut self, disk_cache: Arc<dyn DiskCache>) -> Self {
        self.disk_cache = Some(disk_cache);
        self
    }

    /// Shares `pool` with the decoder and receives recycled bitmaps into it.
    #[must_use]
    pub fn reuse_pool(mut self, pool: Arc<ReusePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the memory cache budget in bytes.
    #[must_use]
    pub fn memory_cache_size(mut self, bytes: usize) -> Self {
        self.memory_cache_size = Some(bytes);
        self
    }

    /// Sets how many disk-cache reads run at once. Defaults to one.
    #[must_use]
    pub fn disk_cache_threads(mut self, threads: usize) -> Self {
        self.pool_sizes.disk_cache = threads;
        self
    }

    /// Sets how many source fetches run at once. Defaults to the number of cores, at most four.
    #[must_use]
    pub fn source_threads(mut self, threads: usize) -> Self {
        self.pool_sizes.source = threads;
        self
    }

    /// Sets how many fetches of the unlimited source pool run at once. Defaults to sixteen.
    #[must_use]
    pub fn unlimited_source_threads(mut self, threads: usize) -> Self {
        self.pool_sizes.unlimited_source = threads;
        self
    }

    /// Builds the engine on the calling thread, which becomes its owner thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker threads cannot be started.
    pub fn build(self) -> io::Result<Engine> {
        let executor = Executor::new(self.pool_sizes)?;
        let mut memory_cache = MemoryCache::builder();
        if let Some(bytes) = self.memory_cache_size {
            memory_cache = memory_cache.max_size(bytes);
        }
        let (completions, receiver) = mpsc::unbounded_channel();

        Ok(Engine {
            inner: Rc::new(EngineInner {
                state: RefCell::new(EngineState {
                    jobs: HashMap::new(),
                    in_flight: HashMap::new(),
                    active: ActiveResources::default(),
                    memory_cache: memory_cache.build(),
                    next_job_id: 0,
                }),
                collaborators: Collaborators {
                    loader: self.loader,
                    decoder: self.decoder,
                    disk_cache: self.disk_cache,
                    pool: self
                        .pool
                        .unwrap_or_else(|| Arc::new(ReusePool::with_max_size(DEFAULT_POOL_SIZE))),
                },
                executor: RefCell::new(Some(executor)),
                completions,
                receiver: RefCell::new(receiver),
                owner: thread::current().id(),
            }),
        })
    }
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("disk_cache", &self.disk_cache.is_some())
            .field("memory_cache_size", &self.memory_cache_size)
            .field("pool_sizes", &self.pool_sizes)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts configuring an engine that fetches with `loader` and decodes with `decoder`.
    #[must_use]
    pub fn builder(loader: Arc<dyn ModelLoader>, decoder: Arc<dyn ResourceDecoder>) -> EngineBuilder {
        EngineBuilder::new(loader, decoder)
    }

    /// Starts or joins a load.
    ///
    /// Memory hits are delivered to `callback` before this returns and yield `None`. Otherwise
    /// the returned [`LoadStatus`] lets the caller stop waiting.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if the engine's bookkeeping was corrupted by a reference-count
    /// misuse.
    pub fn load(&self, params: &LoadParams, callback: Rc<dyn ResourceCallback>) -> Result<Option<LoadStatus>, UsageError> {
        let inner = &self.inner;
        let key = params.key();

        if params.is_memory_cacheable {
            if let Some(resource) = inner.load_from_active(key)? {
                tracing::debug!(%key, "loaded resource from active resources");
                callback.on_resource_ready(resource, DataSource::MemoryCache);
                return Ok(None);
            }
            if let Some(resource) = inner.load_from_cache(key)? {
                tracing::debug!(%key, "loaded resource from memory cache");
                callback.on_resource_ready(resource, DataSource::MemoryCache);
                return Ok(None);
            }
        }

        let job_key = JobKey {
            key: key.clone(),
            only_retrieve_from_cache: params.only_retrieve_from_cache,
        };
        let existing = inner.state.borrow().jobs.get(&job_key).map(Rc::clone);
        if let Some(job) = existing {
            job.add_waiter(Rc::clone(&callback))?;
            tracing::debug!(%key, "added to existing load");
            return Ok(Some(LoadStatus {
                job,
                callback,
                engine: Rc::downgrade(inner),
            }));
        }

        let executor = inner.executor.borrow().as_ref().map(|executor| executor.handle().clone());
        let Some(executor) = executor else {
            callback.on_load_failed(LoadFailure::new("failed to load resource").with_cause("the engine has been shut down"));
            return Ok(None);
        };

        let job = {
            let mut state = inner.state.borrow_mut();
            let id = state.next_job_id;
            state.next_job_id += 1;
            let job = Rc::new(EngineJob::new(
                id,
                key.clone(),
                params.is_memory_cacheable,
                params.only_retrieve_from_cache,
            ));
            state.jobs.insert(job_key, Rc::clone(&job));
            state.in_flight.insert(id, Rc::clone(&job));
            job
        };
        job.add_waiter(Rc::clone(&callback))?;

        DecodeTask {
            job_id: job.id(),
            key: key.clone(),
            priority: params.priority,
            strategy: params.disk_cache_strategy,
            only_retrieve_from_cache: params.only_retrieve_from_cache,
            source_lane: if params.use_unlimited_source_pool {
                Lane::UnlimitedSource
            } else {
                Lane::Source
            },
            cancellation: job.cancellation().clone(),
            collaborators: inner.collaborators.clone(),
            executor,
            completions: inner.completions.clone(),
        }
        .start();
        job.mark_running();
        tracing::trace!(%key, job_id = job.id(), "started new load");

        Ok(Some(LoadStatus {
            job,
            callback,
            engine: Rc::downgrade(inner),
        }))
    }

    /// Releases a resource delivered by a load.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Underflow`] if the resource is not acquired.
    pub fn release(&self, resource: &Rc<EngineResource>) -> Result<(), ResourceError> {
        resource.release()
    }

    /// Delivers every load result that has arrived, without blocking. Returns how many were
    /// handled.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if delivering a result hit a reference-count misuse.
    pub fn poll_completions(&self) -> Result<usize, UsageError> {
        let mut handled = 0;
        loop {
            let next = self.inner.receiver.borrow_mut().try_recv();
            let Ok(completion) = next else {
                return Ok(handled);
            };
            self.inner.handle_completion(completion)?;
            handled += 1;
        }
    }

    /// Like [`poll_completions`](Self::poll_completions), but if nothing has arrived yet and
    /// loads are pending, blocks for up to `timeout` waiting for the next result.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::AsyncContext`] when called from inside an async runtime, and any
    /// error of [`poll_completions`](Self::poll_completions).
    pub fn wait_for_completions(&self, timeout: Duration) -> Result<usize, UsageError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(UsageError::AsyncContext {
                operation: "wait_for_completions",
            });
        }

        let handled = self.poll_completions()?;
        if handled > 0 || self.pending_loads() == 0 {
            return Ok(handled);
        }

        let completion = {
            let executor = self.inner.executor.borrow();
            let Some(executor) = executor.as_ref() else {
                return Ok(0);
            };
            let mut receiver = self.inner.receiver.borrow_mut();
            executor.recv_timeout(&mut receiver, timeout)
        };
        let Some(completion) = completion else {
            return Ok(0);
        };
        self.inner.handle_completion(completion)?;
        Ok(1 + self.poll_completions()?)
    }

    /// Delivers results until no load is pending. Returns `false` if `timeout` elapsed first.
    ///
    /// # Errors
    ///
    /// Returns any error of [`wait_for_completions`](Self::wait_for_completions).
    pub fn run_until_idle(&self, timeout: Duration) -> Result<bool, UsageError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll_completions()?;
            if self.pending_loads() == 0 {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            self.wait_for_completions(remaining)?;
        }
    }

    /// Loads dispatched to workers whose result has not been handled yet, cancelled ones
    /// included.
    #[must_use]
    pub fn pending_loads(&self) -> usize {
        self.inner.state.borrow().in_flight.len()
    }

    /// Number of resources currently held by at least one request.
    #[must_use]
    pub fn active_resources(&self) -> usize {
        self.inner.state.borrow().active.len()
    }

    /// Number of resources in the memory cache.
    #[must_use]
    pub fn memory_cache_len(&self) -> usize {
        self.inner.state.borrow().memory_cache.len()
    }

    /// Bytes held by the memory cache.
    #[must_use]
    pub fn memory_cache_size(&self) -> usize {
        self.inner.state.borrow().memory_cache.current_size()
    }

    /// Memory cache budget in bytes.
    #[must_use]
    pub fn memory_cache_max_size(&self) -> usize {
        self.inner.state.borrow().memory_cache.max_size()
    }

    /// The reuse pool shared with the decoder.
    #[must_use]
    pub fn reuse_pool(&self) -> &Arc<ReusePool> {
        &self.inner.collaborators.pool
    }

    /// Empties the memory cache, recycling its resources.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] if a cached resource was already recycled.
    pub fn clear_memory(&self) -> Result<(), ResourceError> {
        let evicted = self.inner.state.borrow_mut().memory_cache.clear_memory();
        recycle_all(evicted)
    }

    /// Shrinks the memory cache for `level`.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] if a cached resource was already recycled.
    pub fn trim_memory(&self, level: TrimLevel) -> Result<(), ResourceError> {
        let evicted = self.inner.state.borrow_mut().memory_cache.trim_memory(level);
        recycle_all(evicted)
    }

    /// Rescales the memory cache budget.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] if a cached resource was already recycled.
    pub fn set_size_multiplier(&self, multiplier: f32) -> Result<(), ResourceError> {
        let evicted = self.inner.state.borrow_mut().memory_cache.set_size_multiplier(multiplier);
        recycle_all(evicted)
    }

    /// A handle that clears the disk cache from a background thread.
    #[must_use]
    pub fn disk_cache_clearer(&self) -> DiskCacheClearer {
        DiskCacheClearer {
            disk_cache: self.inner.collaborators.disk_cache.clone(),
            owner: self.inner.owner,
        }
    }

    /// Stops the worker pools. Every unfinished load fails; later loads fail right away unless
    /// they hit memory.
    pub fn shutdown(&self) {
        let executor = self.inner.executor.borrow_mut().take();
        let Some(executor) = executor else {
            return;
        };
        executor.shutdown();

        let unfinished: Vec<Rc<EngineJob>> = {
            let mut state = self.inner.state.borrow_mut();
            state.jobs.clear();
            state.in_flight.drain().map(|(_, job)| job).collect()
        };
        let failure = LoadFailure::new("failed to load resource").with_cause("the engine has been shut down");
        for job in unfinished {
            if job.status() != JobStatus::Cancelled {
                job.notify_failed(&failure);
            }
        }
        tracing::debug!("engine shut down");
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Engine")
            .field("jobs", &state.jobs.len())
            .field("pending_loads", &state.in_flight.len())
            .field("active_resources", &state.active.len())
            .field("memory_cache_size", &state.memory_cache.current_size())
            .finish_non_exhaustive()
    }
}

impl EngineInner {
    fn load_from_active(&self, key: &CacheKey) -> Result<Option<Rc<EngineResource>>, ResourceError> {
        let Some(resource) = self.state.borrow().active.get(key) else {
            return Ok(None);
        };
        resource.acquire()?;
        Ok(Some(resource))
    }

    fn load_from_cache(&self, key: &CacheKey) -> Result<Option<Rc<EngineResource>>, ResourceError> {
        let mut state = self.state.borrow_mut();
        let Some(resource) = state.memory_cache.remove(key) else {
            return Ok(None);
        };
        resource.acquire()?;
        state.active.activate(key.clone(), Rc::clone(&resource));
        Ok(Some(resource))
    }

    fn remove_waiter(&self, job: &Rc<EngineJob>, callback: &Rc<dyn ResourceCallback>) {
        if job.remove_waiter(callback) && job.cancel() {
            self.forget_job(job);
        }
    }

    fn forget_job(&self, job: &Rc<EngineJob>) {
        let job_key = JobKey::of(job);
        let mut state = self.state.borrow_mut();
        if state.jobs.get(&job_key).is_some_and(|current| Rc::ptr_eq(current, job)) {
            state.jobs.remove(&job_key);
        }
    }

    fn handle_completion(self: &Rc<Self>, completion: Completion) -> Result<(), UsageError> {
        let job = self.state.borrow_mut().in_flight.remove(&completion.job_id);
        let Some(job) = job else {
            tracing::trace!(job_id = completion.job_id, "dropped result of a load the engine no longer tracks");
            return Ok(());
        };

        if job.status() == JobStatus::Cancelled {
            if let Outcome::Ready {
                resource: Resource::Bitmap(bitmap),
                ..
            } = completion.outcome
            {
                self.collaborators.pool.put(bitmap);
            }
            tracing::trace!(key = %job.key(), "discarded result of cancelled load");
            return Ok(());
        }
        self.forget_job(&job);

        match completion.outcome {
            Outcome::Ready { resource, source } => self.complete(&job, resource, source)?,
            Outcome::Failed(failure) => job.notify_failed(&failure),
            Outcome::Cancelled => job.notify_failed(&LoadFailure::new("load was cancelled")),
        }
        Ok(())
    }

    fn complete(self: &Rc<Self>, job: &EngineJob, resource: Resource, source: DataSource) -> Result<(), ResourceError> {
        let key = job.key().clone();
        let size = resource.size();
        let resource = EngineResource::new(
            key.clone(),
            resource,
            job.is_cacheable(),
            Some(Arc::clone(&self.collaborators.pool)),
        );
        let weak_self: Weak<Self> = Rc::downgrade(self);
        let listener: Weak<dyn ResourceListener> = weak_self;
        resource.set_resource_listener(listener)?;

        // Held across the fan-out so a waiter releasing early cannot send it to the cache.
        resource.acquire()?;
        if job.is_cacheable() {
            self.state.borrow_mut().active.activate(key.clone(), Rc::clone(&resource));
        }
        let notified = job.notify_ready(&resource, source);
        let released = resource.release();
        notified?;
        released?;

        tracing::trace!(%key, %source, size, elapsed_ms = job.elapsed_ms(), "load completed");
        Ok(())
    }
}

impl ResourceListener for EngineInner {
    fn on_resource_released(&self, resource: &Rc<EngineResource>) -> Result<(), ResourceError> {
        let evicted = {
            let mut state = self.state.borrow_mut();
            state.active.deactivate(resource);
            if resource.is_cacheable() {
                state.memory_cache.put(resource.key().clone(), Rc::clone(resource))
            } else {
                vec![Rc::clone(resource)]
            }
        };
        recycle_all(evicted)
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(executor) = self.executor.get_mut().take() {
            executor.shutdown();
        }
    }
}

fn recycle_all(resources: Vec<Rc<EngineResource>>) -> Result<(), ResourceError> {
    for resource in resources {
        resource.recycle()?;
    }
    Ok(())
}

/// Clears the disk cache from a background thread.
///
/// Clearing blocks on I/O, so it is rejected on the engine's owner thread.
#[derive(Clone)]
pub struct DiskCacheClearer {
    disk_cache: Option<Arc<dyn DiskCache>>,
    owner: ThreadId,
}

impl DiskCacheClearer {
    /// Removes every entry from the disk cache. Does nothing when no disk cache is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ClearDiskCacheError::Usage`] when called on the owner thread, and
    /// [`ClearDiskCacheError::Io`] when the disk cache fails to clear.
    pub fn clear(&self) -> Result<(), ClearDiskCacheError> {
        if thread::current().id() == self.owner {
            return Err(UsageError::BackgroundThreadOnly {
                operation: "clear_disk_cache",
            }
            .into());
        }
        if let Some(disk_cache) = &self.disk_cache {
            disk_cache.clear().map_err(|error| {
                tracing::warn!(%error, "failed to clear disk cache");
                ClearDiskCacheError::Io(error)
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for DiskCacheClearer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCacheClearer")
            .field("disk_cache", &self.disk_cache.is_some())
            .field("owner", &self.owner)
            .finish()
    }
}
