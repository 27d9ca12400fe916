// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-caller requests and their lifecycle.

use std::any::Any;

use crate::UsageError;

mod single;
mod target;
mod thumbnail;

pub use single::{RequestConfig, RequestPool, RequestStatus, SingleRequest, SizeReadyCallback};
pub use target::{RequestListener, Target};
pub use thumbnail::ThumbnailRequestCoordinator;

/// Number of recycled [`SingleRequest`]s a [`RequestPool`] keeps for reuse.
pub const DEFAULT_REQUEST_POOL_CAPACITY: usize = 150;

/// A load of a resource into a [`Target`].
///
/// All methods must be called on the owner thread. None of them may be called from inside the
/// request's own target or listener callbacks; such calls fail with
/// [`UsageError::CallingCallbacks`].
pub trait Request {
    /// Starts the load.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::RestartRunning`] if the request is already running.
    fn begin(&self) -> Result<(), UsageError>;

    /// Stops the load, releases the resource and shows the placeholder. A cleared request can
    /// be started again.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if called from a callback or after recycling.
    fn clear(&self) -> Result<(), UsageError>;

    /// Clears the request and marks it paused so it is restarted on resume.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if called from a callback or after recycling.
    fn pause(&self) -> Result<(), UsageError>;

    /// Resets the request and returns it to its pool. The request must not be used afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::RequestRecycled`] if the request was already recycled.
    fn recycle(&self) -> Result<(), UsageError>;

    /// Waiting for a size or for the engine.
    fn is_running(&self) -> bool;

    /// Finished with a resource.
    fn is_complete(&self) -> bool;

    /// A resource has been set on the target.
    fn is_resource_set(&self) -> bool;

    /// Cancelled or cleared.
    fn is_cancelled(&self) -> bool;

    /// Cleared.
    fn is_cleared(&self) -> bool;

    /// Failed.
    fn is_failed(&self) -> bool;

    /// Paused.
    fn is_paused(&self) -> bool;

    /// Returns `true` if both requests would load the same thing into a target the same way.
    fn is_equivalent_to(&self, other: &dyn Request) -> bool;

    /// Allows [`is_equivalent_to`](Self::is_equivalent_to) to inspect the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Coordinates requests that share a target, such as a thumbnail and a full image.
pub trait RequestCoordinator {
    /// Returns `true` if `request` may set its resource on the shared target.
    fn can_set_image(&self, request: &dyn Request) -> bool;

    /// Returns `true` if `request` may show placeholders on the shared target.
    fn can_notify_status_changed(&self, request: &dyn Request) -> bool;

    /// Returns `true` if any coordinated request has set a resource.
    fn is_any_resource_set(&self) -> bool;

    /// Told when `request` set its resource.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if a sibling request could not be cleared.
    fn on_request_success(&self, request: &dyn Request) -> Result<(), UsageError>;
}
