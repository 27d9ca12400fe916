// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types.
//!
//! Two families exist. [`UsageError`] and [`ResourceError`] signal that a caller broke a contract
//! (restarting a running request, releasing a resource one time too many). They are returned
//! immediately and are never retried. [`LoadFailure`] is the expected runtime failure of a load
//! and travels down the failure path of every request that waited on it.

use std::{error::Error as StdError, fmt, sync::Arc};

use thiserror::Error;

/// Misuse of an [`EngineResource`](crate::EngineResource) reference count or lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ResourceError {
    /// The resource was already recycled; its payload is gone.
    #[error("cannot use a resource that has already been recycled")]
    AlreadyRecycled,

    /// `release()` was called while the reference count was already zero.
    #[error("cannot release a resource that is not acquired")]
    Underflow,

    /// The resource cannot be recycled while references to it are outstanding.
    #[error("cannot recycle a resource while it is still acquired ({acquired} references)")]
    StillAcquired {
        /// Outstanding references at the time of the call.
        acquired: usize,
    },

    /// The removal listener may only be set once per resource.
    #[error("the resource listener has already been set")]
    ListenerAlreadySet,
}

/// A caller contract violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum UsageError {
    /// A load was started or cleared from inside a request's own result or failure callback.
    #[error(
        "cannot {operation} a request from inside its target or listener callbacks; defer the call to a later turn of the owner thread"
    )]
    CallingCallbacks {
        /// The rejected operation.
        operation: &'static str,
    },

    /// `begin()` was called on a request that is still running.
    #[error("cannot restart a running request")]
    RestartRunning,

    /// A request was used after it went back to its pool.
    #[error("request has been recycled")]
    RequestRecycled,

    /// A waiter was added to a job that already completed or was cancelled.
    #[error("cannot add a waiter to a finished job; start a new job instead")]
    JobFinished,

    /// The operation blocks the calling thread and cannot run inside an async runtime.
    #[error("{operation} blocks and cannot be called from inside an async runtime")]
    AsyncContext {
        /// The rejected operation.
        operation: &'static str,
    },

    /// The operation blocks and must not run on the owner thread.
    #[error("{operation} blocks and must be called from a background thread")]
    BackgroundThreadOnly {
        /// The rejected operation.
        operation: &'static str,
    },

    /// A resource reference count or lifetime was misused.
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Why [`DiskCacheClearer::clear`](crate::DiskCacheClearer::clear) failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClearDiskCacheError {
    /// The call broke a threading contract.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The disk cache reported an I/O failure.
    #[error("failed to clear the disk cache")]
    Io(#[source] Box<dyn StdError + Send + Sync>),
}

type Cause = Arc<dyn StdError + Send + Sync>;

/// An expected failure to load a resource.
///
/// Carries an ordered list of causes, for example a failed decode of disk-cached data followed
/// by the error of the source fetch that was tried next. Cloning is cheap so a single failure can
/// be delivered to every waiter of a job.
///
/// # Examples
///
/// ```
/// use picflight::LoadFailure;
///
/// let failure = LoadFailure::new("failed to load resource")
///     .with_cause(std::io::Error::other("connection reset"));
///
/// assert_eq!(failure.causes().len(), 1);
/// assert_eq!(failure.root_causes()[0].to_string(), "connection reset");
/// ```
#[derive(Clone)]
pub struct LoadFailure {
    message: Arc<str>,
    causes: Vec<Cause>,
}

impl LoadFailure {
    /// Creates a failure with the given message and no causes.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
            causes: Vec::new(),
        }
    }

    /// Appends a cause and returns `self`.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        self.add_cause(cause);
        self
    }

    /// Appends a cause.
    pub fn add_cause(&mut self, cause: impl Into<Box<dyn StdError + Send + Sync>>) {
        self.causes.push(Arc::from(cause.into()));
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The direct causes, in the order they were recorded.
    #[must_use]
    pub fn causes(&self) -> &[Cause] {
        &self.causes
    }

    /// The innermost error of every cause chain, in cause order.
    ///
    /// Nested `LoadFailure`s are flattened into their own root causes.
    #[must_use]
    pub fn root_causes(&self) -> Vec<&(dyn StdError + 'static)> {
        let mut roots = Vec::new();
        for cause in &self.causes {
            let cause: &(dyn StdError + 'static) = cause.as_ref();
            collect_roots(cause, &mut roots);
        }
        roots
    }

    /// Logs every root cause at `INFO`, numbered.
    pub fn log_root_causes(&self) {
        let roots = self.root_causes();
        let total = roots.len();
        for (index, cause) in roots.into_iter().enumerate() {
            tracing::info!(cause.index = index + 1, cause.total = total, "root cause: {cause}");
        }
    }
}

fn collect_roots<'a>(error: &'a (dyn StdError + 'static), roots: &mut Vec<&'a (dyn StdError + 'static)>) {
    if let Some(nested) = error.downcast_ref::<LoadFailure>() {
        if nested.causes.is_empty() {
            roots.push(error);
        }
        for cause in &nested.causes {
            let cause: &(dyn StdError + 'static) = cause.as_ref();
            collect_roots(cause, roots);
        }
        return;
    }

    let mut current = error;
    while let Some(next) = current.source() {
        current = next;
    }
    roots.push(current);
}

impl fmt::Debug for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadFailure")
            .field("message", &self.message)
            .field("causes", &self.causes.iter().map(ToString::to_string).collect::<Vec<_>>())
            .finish()
    }
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        match self.causes.len() {
            0 => Ok(()),
            1 => write!(f, " (1 cause)"),
            n => write!(f, " ({n} causes)"),
        }
    }
}

impl StdError for LoadFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.causes.first().map(|cause| {
            let cause: &(dyn StdError + 'static) = cause.as_ref();
            cause
        })
    }
}
