// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One in-flight load and the callbacks waiting for it.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    time::Instant,
};

use crate::{
    CacheKey, DataSource, EngineResource, LoadFailure, ResourceError, UsageError,
    decode::{Cancellation, JobId},
};

/// Receives the outcome of a load started through [`Engine::load`](crate::Engine::load).
///
/// Exactly one of the two methods is called, once, on the owner thread.
pub trait ResourceCallback {
    /// The load succeeded. `resource` has been acquired on behalf of this callback, which must
    /// eventually [`release`](EngineResource::release) it.
    fn on_resource_ready(&self, resource: Rc<EngineResource>, source: DataSource);

    /// The load failed.
    fn on_load_failed(&self, failure: LoadFailure);
}

/// Lifecycle of an [`EngineJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobStatus {
    Pending,
    Running,
    Complete,
    Cancelled,
}

/// Fans the single result of a load out to every request that asked for the same key.
///
/// Waiters are notified in registration order, each exactly once. A waiter removed while the
/// fan-out is in progress is skipped. Once the job has completed or been cancelled it accepts no
/// new waiters; a later load for the key starts a new job.
pub(crate) struct EngineJob {
    id: JobId,
    key: CacheKey,
    only_retrieve_from_cache: bool,
    is_cacheable: bool,
    status: Cell<JobStatus>,
    waiters: RefCell<Vec<Rc<dyn ResourceCallback>>>,
    cancellation: Cancellation,
    started: Instant,
}

impl EngineJob {
    pub(crate) fn new(id: JobId, key: CacheKey, is_cacheable: bool, only_retrieve_from_cache: bool) -> Self {
        Self {
            id,
            key,
            only_retrieve_from_cache,
            is_cacheable,
            status: Cell::new(JobStatus::Pending),
            waiters: RefCell::new(Vec::new()),
            cancellation: Cancellation::default(),
            started: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn only_retrieve_from_cache(&self) -> bool {
        self.only_retrieve_from_cache
    }

    pub(crate) fn is_cacheable(&self) -> bool {
        self.is_cacheable
    }

    pub(crate) fn status(&self) -> JobStatus {
        self.status.get()
    }

    pub(crate) fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.borrow().len()
    }

    fn is_finished(&self) -> bool {
        matches!(self.status.get(), JobStatus::Complete | JobStatus::Cancelled)
    }

    pub(crate) fn mark_running(&self) {
        if self.status.get() == JobStatus::Pending {
            self.status.set(JobStatus::Running);
        }
    }

    pub(crate) fn add_waiter(&self, callback: Rc<dyn ResourceCallback>) -> Result<(), UsageError> {
        if self.is_finished() {
            return Err(UsageError::JobFinished);
        }
        self.waiters.borrow_mut().push(callback);
        tracing::trace!(key = %self.key, waiters = self.waiter_count(), "added waiter");
        Ok(())
    }

    /// Removes a waiter. Returns `true` if it was the last one of an unfinished job, in which
    /// case the caller cancels the job.
    pub(crate) fn remove_waiter(&self, callback: &Rc<dyn ResourceCallback>) -> bool {
        let is_empty = {
            let mut waiters = self.waiters.borrow_mut();
            waiters.retain(|waiter| !Rc::ptr_eq(waiter, callback));
            waiters.is_empty()
        };
        tracing::trace!(key = %self.key, waiters = self.waiter_count(), "removed waiter");
        is_empty && !self.is_finished()
    }

    /// Cancels the job. Returns `false` if it had already finished.
    pub(crate) fn cancel(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status.set(JobStatus::Cancelled);
        self.cancellation.cancel();
        tracing::trace!(key = %self.key, "cancelled load");
        true
    }

    fn is_waiting(&self, callback: &Rc<dyn ResourceCallback>) -> bool {
        self.waiters.borrow().iter().any(|waiter| Rc::ptr_eq(waiter, callback))
    }

    fn snapshot(&self) -> Vec<Rc<dyn ResourceCallback>> {
        self.waiters.borrow().clone()
    }

    /// Completes the job and hands `resource` to every waiter, acquiring it once for each.
    ///
    /// The caller holds its own reference for the duration of the call, so a waiter releasing
    /// its reference from inside the callback cannot drop the count to zero mid fan-out.
    pub(crate) fn notify_ready(&self, resource: &Rc<EngineResource>, source: DataSource) -> Result<(), ResourceError> {
        self.status.set(JobStatus::Complete);
        for waiter in self.snapshot() {
            if !self.is_waiting(&waiter) {
                continue;
            }
            resource.acquire()?;
            waiter.on_resource_ready(Rc::clone(resource), source);
        }
        Ok(())
    }

    /// Completes the job and delivers `failure` to every waiter.
    pub(crate) fn notify_failed(&self, failure: &LoadFailure) {
        self.status.set(JobStatus::Complete);
        for waiter in self.snapshot() {
            if self.is_waiting(&waiter) {
                waiter.on_load_failed(failure.clone());
            }
        }
    }

    pub(crate) fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

impl fmt::Debug for EngineJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineJob")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &self.status.get())
            .field("waiters", &self.waiter_count())
            .finish_non_exhaustive()
    }
}
