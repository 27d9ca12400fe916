// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{rc::Rc, sync::Arc};

use crate::{DataSource, LoadFailure, Model, Placeholder, Resource, Transition};

use super::{Request, SizeReadyCallback};

/// Where a request shows its placeholders and its result.
///
/// Every method is called on the owner thread. Implementations must not call back into the
/// request that is notifying them.
pub trait Target {
    /// Asks for the size to load at. The target calls
    /// [`SizeReadyCallback::on_size_ready`] once its size is known, possibly right away.
    fn get_size(&self, callback: SizeReadyCallback);

    /// Forgets a callback passed to [`get_size`](Self::get_size) that has not fired yet.
    fn remove_callback(&self, callback: &SizeReadyCallback);

    /// The load started.
    fn on_load_started(&self, placeholder: Option<&Placeholder>);

    /// The load finished.
    fn on_resource_ready(&self, resource: Arc<Resource>, transition: Option<Transition>);

    /// The load failed. `error` is the error, fallback or plain placeholder, in that order of
    /// preference.
    fn on_load_failed(&self, error: Option<&Placeholder>);

    /// The request was cleared; any resource previously set must no longer be shown.
    fn on_load_cleared(&self, placeholder: Option<&Placeholder>);

    /// The request currently loading into this target.
    fn request(&self) -> Option<Rc<dyn Request>>;

    /// Stores the request currently loading into this target.
    fn set_request(&self, request: Option<Rc<dyn Request>>);
}

/// Observes a request's outcome and may take over updating the target.
///
/// Each method returns `true` if it updated the target itself, in which case the request does
/// not.
pub trait RequestListener {
    /// The load finished.
    fn on_resource_ready(
        &self,
        resource: &Arc<Resource>,
        model: Option<&Model>,
        source: DataSource,
        is_first_resource: bool,
    ) -> bool {
        let _ = (resource, model, source, is_first_resource);
        false
    }

    /// The load failed.
    fn on_load_failed(&self, failure: &LoadFailure, model: Option<&Model>, is_first_resource: bool) -> bool {
        let _ = (failure, model, is_first_resource);
        false
    }
}
