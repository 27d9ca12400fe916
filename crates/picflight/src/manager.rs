// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lifecycle-scoped request management and the fluent request builder.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use crate::{
    ImageLoader, Model, Priority, Request, RequestConfig, RequestCoordinator, RequestListener,
    RequestOptions, RequestTracker, ResourceKind, Target, ThumbnailRequestCoordinator, TransitionOptions, UsageError,
    is_valid_size,
};

/// Starts, pauses and clears the requests of one host lifecycle scope, such as a screen.
///
/// Forward the host's lifecycle to [`on_start`](Self::on_start), [`on_stop`](Self::on_stop)
/// and [`on_destroy`](Self::on_destroy).
#[derive(Clone)]
pub struct RequestManager {
    inner: Rc<ManagerInner>,
}

struct ManagerInner {
    loader: ImageLoader,
    tracker: RequestTracker,
    targets: RefCell<Vec<Rc<dyn Target>>>,
}

impl RequestManager {
    /// A running manager with no requests.
    #[must_use]
    pub fn new(loader: ImageLoader) -> Self {
        Self {
            inner: Rc::new(ManagerInner {
                loader,
                tracker: RequestTracker::new(),
                targets: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The loader requests are built with.
    #[must_use]
    pub fn loader(&self) -> &ImageLoader {
        &self.inner.loader
    }

    /// The requests of this scope.
    #[must_use]
    pub fn tracker(&self) -> &RequestTracker {
        &self.inner.tracker
    }

    /// Starts building a bitmap request for `model`. An absent model shows the fallback.
    #[must_use]
    pub fn load(&self, model: impl Into<Option<Model>>) -> RequestBuilder {
        RequestBuilder {
            manager: self.clone(),
            model: model.into(),
            transcode_kind: ResourceKind::Bitmap,
            options: RequestOptions::new(),
            transition: None,
            listeners: Vec::new(),
            thumbnail: None,
        }
    }

    /// The scope became visible: resumes paused requests.
    ///
    /// # Errors
    ///
    /// Returns any error of [`RequestTracker::resume_requests`].
    pub fn on_start(&self) -> Result<(), UsageError> {
        self.resume_requests()
    }

    /// The scope was hidden: pauses running requests.
    ///
    /// # Errors
    ///
    /// Returns any error of [`RequestTracker::pause_requests`].
    pub fn on_stop(&self) -> Result<(), UsageError> {
        self.pause_requests()
    }

    /// The scope is gone: clears every target and recycles every request.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if a request could not be cleared.
    pub fn on_destroy(&self) -> Result<(), UsageError> {
        let targets = self.inner.targets.borrow().clone();
        for target in &targets {
            self.clear(target)?;
        }
        self.inner.tracker.clear_requests()?;
        self.inner.targets.borrow_mut().clear();
        Ok(())
    }

    /// Pauses running requests. Requests started while paused are queued.
    ///
    /// # Errors
    ///
    /// Returns any error of [`RequestTracker::pause_requests`].
    pub fn pause_requests(&self) -> Result<(), UsageError> {
        self.inner.tracker.pause_requests()
    }

    /// Resumes paused and queued requests.
    ///
    /// # Errors
    ///
    /// Returns any error of [`RequestTracker::resume_requests`].
    pub fn resume_requests(&self) -> Result<(), UsageError> {
        self.inner.tracker.resume_requests()
    }

    /// Restarts unfinished requests, for example when connectivity returns.
    ///
    /// # Errors
    ///
    /// Returns any error of [`RequestTracker::restart_requests`].
    pub fn restart_requests(&self) -> Result<(), UsageError> {
        self.inner.tracker.restart_requests()
    }

    /// Returns `true` while requests are paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.tracker.is_paused()
    }

    /// Cancels the request loading into `target`, releases its resource and restores the
    /// placeholder. A request this manager tracks is recycled as well.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if the request could not be cleared.
    pub fn clear(&self, target: &Rc<dyn Target>) -> Result<(), UsageError> {
        let Some(request) = target.request() else {
            return Ok(());
        };
        if self.inner.tracker.clear_remove_and_recycle(&request)? {
            self.untrack(target);
        } else {
            request.clear()?;
        }
        target.set_request(None);
        Ok(())
    }

    /// Tracks `request` as the request loading into `target` and runs it, unless paused.
    ///
    /// # Errors
    ///
    /// Returns any error of [`RequestTracker::run_request`].
    pub fn track(&self, target: Rc<dyn Target>, request: Rc<dyn Request>) -> Result<(), UsageError> {
        {
            let mut targets = self.inner.targets.borrow_mut();
            if !targets.iter().any(|tracked| Rc::ptr_eq(tracked, &target)) {
                targets.push(target);
            }
        }
        self.inner.tracker.run_request(request)
    }

    fn untrack(&self, target: &Rc<dyn Target>) {
        self.inner
            .targets
            .borrow_mut()
            .retain(|tracked| !Rc::ptr_eq(tracked, target));
    }
}

impl fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestManager")
            .field("tracker", &self.inner.tracker)
            .field("targets", &self.inner.targets.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Builds a request and starts it into a target.
///
/// # Examples
///
/// ```no_run
/// use std::rc::Rc;
///
/// use picflight::{Dimension, Model, RequestManager, RequestOptions, Target, UsageError};
///
/// fn show(manager: &RequestManager, target: Rc<dyn Target>) -> Result<(), UsageError> {
///     manager
///         .load(Model::Url("https://example.com/large.jpg".into()))
///         .apply(&RequestOptions::new().override_size(Dimension::Pixels(512), Dimension::Pixels(512)))
///         .thumbnail(manager.load(Model::Url("https://example.com/small.jpg".into())))
///         .into_target(target)?;
///     Ok(())
/// }
/// ```
pub struct RequestBuilder {
    manager: RequestManager,
    model: Option<Model>,
    transcode_kind: ResourceKind,
    options: RequestOptions,
    transition: Option<TransitionOptions>,
    listeners: Vec<Rc<dyn RequestListener>>,
    thumbnail: Option<Box<Self>>,
}

impl RequestBuilder {
    /// Layers `options` over the options set so far.
    #[must_use]
    pub fn apply(mut self, options: &RequestOptions) -> Self {
        self.options = self.options.apply(options);
        self
    }

    /// Sets how the resource is animated in.
    #[must_use]
    pub fn transition(mut self, transition: TransitionOptions) -> Self {
        self.transition = Some(transition);
        self
    }

    /// Adds an observer of the outcome.
    #[must_use]
    pub fn listener(mut self, listener: Rc<dyn RequestListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Loads `thumbnail` alongside this request and shows it until this request's resource
    /// arrives.
    ///
    /// Unless set on `thumbnail`, its priority is one step above this request's and its
    /// override size is this request's.
    #[must_use]
    pub fn thumbnail(mut self, thumbnail: Self) -> Self {
        self.thumbnail = Some(Box::new(thumbnail));
        self
    }

    /// Delivers the encoded bytes instead of a decoded bitmap.
    #[must_use]
    pub fn as_encoded(mut self) -> Self {
        self.transcode_kind = ResourceKind::Encoded;
        self
    }

    /// Starts the request into `target`, replacing the target's previous request.
    ///
    /// If the previous request is equivalent, it is kept and restarted unless it is running,
    /// and the new one is recycled. A previous request that completed is not reused when this
    /// request skips the memory cache.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if the previous request could not be cleared or the new one
    /// could not be started.
    pub fn into_target(self, target: Rc<dyn Target>) -> Result<Rc<dyn Request>, UsageError> {
        let manager = self.manager.clone();
        let options = self.merged_options();
        let request = self.build(&target, None);

        if let Some(previous) = target.request()
            && request.is_equivalent_to(&*previous)
            && (options.is_memory_cacheable() || !previous.is_complete())
        {
            request.recycle()?;
            if !previous.is_running() {
                previous.begin()?;
            }
            tracing::trace!("reused equivalent request");
            return Ok(previous);
        }

        manager.clear(&target)?;
        target.set_request(Some(Rc::clone(&request)));
        manager.track(target, Rc::clone(&request))?;
        Ok(request)
    }

    fn merged_options(&self) -> RequestOptions {
        self.manager.loader().default_options().clone().apply(&self.options)
    }

    fn build(self, target: &Rc<dyn Target>, parent: Option<Weak<dyn RequestCoordinator>>) -> Rc<dyn Request> {
        let options = self.merged_options();
        let Self {
            manager,
            model,
            transcode_kind,
            transition,
            listeners,
            thumbnail,
            ..
        } = self;
        let loader = manager.loader();
        let config = |coordinator: Option<Weak<dyn RequestCoordinator>>, options: RequestOptions| RequestConfig {
            engine: loader.engine().clone(),
            model,
            transcode_kind,
            options,
            transition: transition.unwrap_or_else(|| loader.default_transition()),
            target: Rc::clone(target),
            listeners,
            coordinator,
        };

        let Some(thumbnail) = thumbnail else {
            return loader.request_pool().obtain(config(parent, options));
        };

        let coordinator = ThumbnailRequestCoordinator::new(parent);
        let weak = Rc::downgrade(&coordinator);
        let weak: Weak<dyn RequestCoordinator> = weak;
        let own = thumbnail.merged_options();
        let mut thumbnail_options = RequestOptions::new();
        if own.get_priority().is_none() {
            thumbnail_options = thumbnail_options.priority(thumbnail_priority(options.get_priority().unwrap_or_default()));
        }
        if let Some((width, height)) = options.get_override_size()
            && is_valid_size(width, height)
            && !own
                .get_override_size()
                .is_some_and(|(width, height)| is_valid_size(width, height))
        {
            thumbnail_options = thumbnail_options.override_size(width, height);
        }
        let thumbnail = (*thumbnail).apply(&thumbnail_options);

        let full = loader.request_pool().obtain(config(Some(Weak::clone(&weak)), options));
        let thumb = thumbnail.build(target, Some(weak));
        coordinator.set_requests(full, thumb);
        coordinator
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("model", &self.model)
            .field("transcode_kind", &self.transcode_kind)
            .field("options", &self.options)
            .field("thumbnail", &self.thumbnail)
            .finish_non_exhaustive()
    }
}

fn thumbnail_priority(full: Priority) -> Priority {
    match full {
        Priority::Low => Priority::Normal,
        Priority::Normal => Priority::High,
        Priority::High | Priority::Immediate => Priority::Immediate,
    }
}
