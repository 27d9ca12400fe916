// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Worker pools for fetch and decode work.

use std::{io, sync::Arc, time::Duration};

use tokio::{
    runtime::{Builder, Runtime},
    sync::{Semaphore, mpsc::UnboundedReceiver},
};

/// Which pool a stage of a load runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    /// Reads and decodes disk-cached data.
    DiskCache,
    /// Fetches source data.
    Source,
    /// Fetches source data that may block for a long time.
    UnlimitedSource,
}

/// Thread counts of the worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolSizes {
    pub(crate) disk_cache: usize,
    pub(crate) source: usize,
    pub(crate) unlimited_source: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, usize::from);
        Self {
            disk_cache: 1,
            source: cores.min(4),
            unlimited_source: 16,
        }
    }
}

/// Runs blocking work off the owner thread.
///
/// Backed by a single tokio runtime whose blocking pool executes the work. Each [`Lane`] is
/// bounded by its own semaphore so a slow source fetch cannot starve disk-cache reads.
#[derive(Debug)]
pub(crate) struct Executor {
    runtime: Runtime,
    handle: ExecutorHandle,
}

/// A cloneable, `Send` handle for submitting work, used by tasks to schedule their next stage.
#[derive(Debug, Clone)]
pub(crate) struct ExecutorHandle {
    runtime: tokio::runtime::Handle,
    disk_cache: Arc<Semaphore>,
    source: Arc<Semaphore>,
    unlimited_source: Arc<Semaphore>,
}

impl Executor {
    pub(crate) fn new(sizes: PoolSizes) -> io::Result<Self> {
        let blocking_threads = sizes.disk_cache + sizes.source + sizes.unlimited_source;
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(blocking_threads.max(1))
            .thread_name("picflight-worker")
            .enable_time()
            .build()?;

        let handle = ExecutorHandle {
            runtime: runtime.handle().clone(),
            disk_cache: Arc::new(Semaphore::new(sizes.disk_cache.max(1))),
            source: Arc::new(Semaphore::new(sizes.source.max(1))),
            unlimited_source: Arc::new(Semaphore::new(sizes.unlimited_source.max(1))),
        };
        Ok(Self { runtime, handle })
    }

    pub(crate) fn handle(&self) -> &ExecutorHandle {
        &self.handle
    }

    /// Blocks the calling thread until a message arrives or `timeout` elapses.
    ///
    /// Must not be called from inside an async runtime.
    pub(crate) fn recv_timeout<T>(&self, receiver: &mut UnboundedReceiver<T>, timeout: Duration) -> Option<T> {
        self.runtime
            .block_on(async { tokio::time::timeout(timeout, receiver.recv()).await })
            .ok()
            .flatten()
    }

    /// Stops accepting work. Work already running finishes on its own threads.
    pub(crate) fn shutdown(self) {
        self.handle.disk_cache.close();
        self.handle.source.close();
        self.handle.unlimited_source.close();
        self.runtime.shutdown_background();
    }
}

impl ExecutorHandle {
    /// Queues `work` on `lane`. Work queued after shutdown is dropped without running.
    pub(crate) fn submit(&self, lane: Lane, work: impl FnOnce() + Send + 'static) {
        let permits = Arc::clone(match lane {
            Lane::DiskCache => &self.disk_cache,
            Lane::Source => &self.source,
            Lane::UnlimitedSource => &self.unlimited_source,
        });

        drop(self.runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(error) = tokio::task::spawn_blocking(work).await {
                tracing::error!(?lane, %error, "worker task did not complete");
            }
        }));
    }
}
