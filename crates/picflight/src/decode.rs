// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The worker side of a load: collaborator traits and the task that drives them.

use std::{
    any::Any,
    error::Error as StdError,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    CacheKey, DataSource, DiskCacheKey, DiskCacheStrategy, LoadFailure, Model, Priority, Resource, ReusePool,
    executor::{ExecutorHandle, Lane},
};

/// Boxed error returned by collaborators.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Cooperative cancellation flag shared between the owner thread and a running load.
///
/// Cancellation is best effort: work that already passed its last check runs to completion and
/// its result is discarded.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// Returns `true` once the load has been abandoned by every waiter.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Source data returned by a [`ModelLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedData {
    /// The encoded bytes.
    pub bytes: Bytes,
    /// Where the bytes came from; decides whether they are written to the disk cache.
    pub source: DataSource,
}

/// Resolves a [`Model`] to its encoded bytes.
///
/// Called on a worker thread. Long fetches should poll `cancellation` and give up early.
pub trait ModelLoader: Send + Sync {
    /// Fetches the source data for `model`.
    ///
    /// # Errors
    ///
    /// Returns the reason the data could not be fetched.
    fn fetch(&self, model: &Model, priority: Priority, cancellation: &Cancellation) -> Result<FetchedData, BoxError>;
}

/// Decodes encoded bytes into a display-ready [`Resource`].
///
/// `key` carries the requested size, transformations, resource kind and decoder options.
/// Decoders that produce bitmaps should take their buffer from `pool` when one fits.
pub trait ResourceDecoder: Send + Sync {
    /// Decodes `data`.
    ///
    /// # Errors
    ///
    /// Returns the reason the data could not be decoded.
    fn decode(&self, data: &Bytes, key: &CacheKey, pool: &ReusePool) -> Result<Resource, BoxError>;

    /// Encodes a decoded resource for the resource disk cache.
    ///
    /// Returns `Ok(None)` for resources that cannot be persisted. By default nothing is.
    ///
    /// # Errors
    ///
    /// Returns the reason the resource could not be encoded; the load logs it and continues.
    fn encode(&self, _resource: &Resource, _key: &CacheKey) -> Result<Option<Bytes>, BoxError> {
        Ok(None)
    }

    /// Decodes data written by [`encode`](Self::encode). The data is already transformed.
    ///
    /// # Errors
    ///
    /// Returns the reason the data could not be decoded.
    fn decode_cached(&self, data: &Bytes, key: &CacheKey, pool: &ReusePool) -> Result<Resource, BoxError> {
        self.decode(data, key, pool)
    }
}

/// Persistent cache of source data and transformed resources.
///
/// Every method may block on I/O and is only ever called from worker threads, or from a
/// [`DiskCacheClearer`](crate::DiskCacheClearer) off the owner thread.
pub trait DiskCache: Send + Sync {
    /// Reads cached data.
    ///
    /// # Errors
    ///
    /// Returns the I/O failure; the load treats it as a miss.
    fn get(&self, key: &DiskCacheKey) -> Result<Option<Bytes>, BoxError>;

    /// Writes data.
    ///
    /// # Errors
    ///
    /// Returns the I/O failure; the load logs it and continues.
    fn put(&self, key: &DiskCacheKey, data: &Bytes) -> Result<(), BoxError>;

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Returns the I/O failure.
    fn clear(&self) -> Result<(), BoxError>;
}

/// The collaborators a load needs, shared with every task.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub(crate) loader: Arc<dyn ModelLoader>,
    pub(crate) decoder: Arc<dyn ResourceDecoder>,
    pub(crate) disk_cache: Option<Arc<dyn DiskCache>>,
    pub(crate) pool: Arc<ReusePool>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("disk_cache", &self.disk_cache.is_some())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

pub(crate) type JobId = u64;

/// The single result a task hands back to the owner thread.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) job_id: JobId,
    pub(crate) outcome: Outcome,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Ready { resource: Resource, source: DataSource },
    Failed(LoadFailure),
    Cancelled,
}

/// Drives one load through the disk-cache stage and, on a miss, the source stage.
///
/// The disk-cache stage tries the transformed resource first, then the source data.
#[derive(Debug)]
pub(crate) struct DecodeTask {
    pub(crate) job_id: JobId,
    pub(crate) key: CacheKey,
    pub(crate) priority: Priority,
    pub(crate) strategy: DiskCacheStrategy,
    pub(crate) only_retrieve_from_cache: bool,
    pub(crate) source_lane: Lane,
    pub(crate) cancellation: Cancellation,
    pub(crate) collaborators: Collaborators,
    pub(crate) executor: ExecutorHandle,
    pub(crate) completions: UnboundedSender<Completion>,
}

impl DecodeTask {
    pub(crate) fn start(self) {
        self.submit(Lane::DiskCache, Self::run_disk_stage);
    }

    fn submit(self, lane: Lane, stage: impl FnOnce(Self) + Send + 'static) {
        let executor = self.executor.clone();
        executor.submit(lane, move || {
            let job_id = self.job_id;
            let key = self.key.clone();
            let completions = self.completions.clone();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| stage(self))) {
                let message = panic_message(payload.as_ref());
                tracing::error!(%key, panic = message, "load panicked");
                let failure = LoadFailure::new("failed to load resource").with_cause(format!("load panicked: {message}"));
                send(&completions, job_id, Outcome::Failed(failure));
            }
        });
    }

    fn run_disk_stage(self) {
        if self.cancellation.is_cancelled() {
            return self.finish(Outcome::Cancelled);
        }

        let mut failure = LoadFailure::new("failed to load resource");
        if let Some(disk_cache) = self.collaborators.disk_cache.as_ref().map(Arc::clone) {
            if self.strategy.decode_cached_resource()
                && let Some(resource) =
                    self.read_cached(&*disk_cache, &self.key.resource_disk_key(), Self::decode_cached, &mut failure)
            {
                return self.finish(Outcome::Ready {
                    resource,
                    source: DataSource::ResourceDiskCache,
                });
            }
            if self.strategy.decode_cached_data()
                && let Some(resource) = self.read_cached(&*disk_cache, &self.key.disk_key(), Self::decode, &mut failure)
            {
                return self.deliver(resource, DataSource::DataDiskCache);
            }
        }

        if self.only_retrieve_from_cache {
            failure.add_cause("only retrieve from cache is set and the resource is not cached");
            return self.finish(Outcome::Failed(failure));
        }

        let lane = self.source_lane;
        self.submit(lane, move |task| task.run_source_stage(failure));
    }

    fn run_source_stage(self, mut failure: LoadFailure) {
        if self.cancellation.is_cancelled() {
            return self.finish(Outcome::Cancelled);
        }

        let fetched = match self
            .collaborators
            .loader
            .fetch(self.key.model(), self.priority, &self.cancellation)
        {
            Ok(fetched) => fetched,
            Err(error) => {
                failure.add_cause(error);
                return self.finish(Outcome::Failed(failure));
            }
        };

        if self.strategy.is_data_cacheable(fetched.source)
            && let Some(disk_cache) = &self.collaborators.disk_cache
            && let Err(error) = disk_cache.put(&self.key.disk_key(), &fetched.bytes)
        {
            tracing::warn!(key = %self.key, %error, "failed to write to disk cache");
        }

        if self.cancellation.is_cancelled() {
            return self.finish(Outcome::Cancelled);
        }

        match self.decode(&fetched.bytes) {
            Ok(resource) => self.deliver(resource, fetched.source),
            Err(error) => {
                failure.add_cause(error);
                self.finish(Outcome::Failed(failure));
            }
        }
    }

    fn read_cached(
        &self,
        disk_cache: &dyn DiskCache,
        disk_key: &DiskCacheKey,
        decode: fn(&Self, &Bytes) -> Result<Resource, BoxError>,
        failure: &mut LoadFailure,
    ) -> Option<Resource> {
        match disk_cache.get(disk_key) {
            Ok(Some(data)) => match decode(self, &data) {
                Ok(resource) => Some(resource),
                Err(error) => {
                    failure.add_cause(error);
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "failed to read from disk cache");
                failure.add_cause(error);
                None
            }
        }
    }

    fn decode(&self, data: &Bytes) -> Result<Resource, BoxError> {
        self.collaborators.decoder.decode(data, &self.key, &self.collaborators.pool)
    }

    fn decode_cached(&self, data: &Bytes) -> Result<Resource, BoxError> {
        self.collaborators.decoder.decode_cached(data, &self.key, &self.collaborators.pool)
    }

    /// Writes the resource to the resource disk cache when the strategy asks for it, then
    /// hands it back.
    fn deliver(self, resource: Resource, source: DataSource) {
        if self
            .strategy
            .is_resource_cacheable(source, !self.key.transformations().is_empty())
            && let Some(disk_cache) = &self.collaborators.disk_cache
        {
            match self.collaborators.decoder.encode(&resource, &self.key) {
                Ok(Some(data)) => {
                    if let Err(error) = disk_cache.put(&self.key.resource_disk_key(), &data) {
                        tracing::warn!(key = %self.key, %error, "failed to write resource to disk cache");
                    }
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(key = %self.key, %error, "failed to encode resource"),
            }
        }
        self.finish(Outcome::Ready { resource, source });
    }

    fn finish(self, outcome: Outcome) {
        send(&self.completions, self.job_id, outcome);
    }
}

fn send(completions: &UnboundedSender<Completion>, job_id: JobId, outcome: Outcome) {
    if completions.send(Completion { job_id, outcome }).is_err() {
        tracing::trace!(job_id, "engine shut down before the load finished");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
