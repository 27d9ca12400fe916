// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bulk lifecycle control over a group of requests.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use crate::{Request, UsageError};

/// Tracks the requests of one host lifecycle scope, such as a screen, and pauses, resumes,
/// restarts or clears them together.
///
/// While paused, newly run requests are queued and started on resume.
#[derive(Default)]
pub struct RequestTracker {
    requests: RefCell<Vec<Rc<dyn Request>>>,
    is_paused: Cell<bool>,
}

impl RequestTracker {
    /// An empty, running tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `request` and starts it unless the tracker is paused.
    ///
    /// # Errors
    ///
    /// Returns any error of [`Request::begin`].
    pub fn run_request(&self, request: Rc<dyn Request>) -> Result<(), UsageError> {
        self.requests.borrow_mut().push(Rc::clone(&request));
        if self.is_paused.get() {
            tracing::trace!("tracker paused, queued request");
            return Ok(());
        }
        request.begin()
    }

    /// Stops tracking `request`, then clears and recycles it. Returns `false` if the request
    /// was not tracked here, in which case it is left alone.
    ///
    /// # Errors
    ///
    /// Returns any error of [`Request::clear`] or [`Request::recycle`].
    pub fn clear_remove_and_recycle(&self, request: &Rc<dyn Request>) -> Result<bool, UsageError> {
        let was_tracked = {
            let mut requests = self.requests.borrow_mut();
            let before = requests.len();
            requests.retain(|tracked| !Rc::ptr_eq(tracked, request));
            requests.len() != before
        };
        if was_tracked {
            request.clear()?;
            request.recycle()?;
        }
        Ok(was_tracked)
    }

    /// Returns `true` while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.is_paused.get()
    }

    /// Pauses every running request.
    ///
    /// # Errors
    ///
    /// Returns any error of [`Request::pause`].
    pub fn pause_requests(&self) -> Result<(), UsageError> {
        self.is_paused.set(true);
        for request in self.snapshot() {
            if request.is_running() {
                request.pause()?;
            }
        }
        Ok(())
    }

    /// Starts every request that is neither complete, cancelled nor running.
    ///
    /// # Errors
    ///
    /// Returns any error of [`Request::begin`].
    pub fn resume_requests(&self) -> Result<(), UsageError> {
        self.is_paused.set(false);
        for request in self.snapshot() {
            if !request.is_complete() && !request.is_cancelled() && !request.is_running() {
                request.begin()?;
            }
        }
        Ok(())
    }

    /// Clears and recycles every tracked request.
    ///
    /// # Errors
    ///
    /// Returns any error of [`clear_remove_and_recycle`](Self::clear_remove_and_recycle).
    pub fn clear_requests(&self) -> Result<(), UsageError> {
        for request in self.snapshot() {
            self.clear_remove_and_recycle(&request)?;
        }
        Ok(())
    }

    /// Restarts every request that is neither complete nor cancelled, for example after
    /// connectivity returns. While paused, restarted requests stay queued.
    ///
    /// # Errors
    ///
    /// Returns any error of [`Request::pause`] or [`Request::begin`].
    pub fn restart_requests(&self) -> Result<(), UsageError> {
        for request in self.snapshot() {
            if !request.is_complete() && !request.is_cancelled() {
                request.pause()?;
                if !self.is_paused.get() {
                    request.begin()?;
                }
            }
        }
        Ok(())
    }

    /// Number of tracked requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.borrow().len()
    }

    /// Returns `true` if no request is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Rc<dyn Request>> {
        self.requests.borrow().clone()
    }
}

impl fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTracker")
            .field("requests", &self.len())
            .field("is_paused", &self.is_paused.get())
            .finish()
    }
}
