// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    sync::Arc,
    time::Instant,
};

use crate::{
    DataSource, Dimension, Engine, EngineResource, LoadFailure, LoadParams, LoadStatus, Model, RequestOptions,
    Resource, ResourceCallback, ResourceKind, TransitionOptions, UsageError, is_valid_size,
};

use super::{DEFAULT_REQUEST_POOL_CAPACITY, Request, RequestCoordinator, RequestListener, Target};

/// Where a [`SingleRequest`] is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestStatus {
    /// Created and not started yet.
    #[default]
    Pending,
    /// Waiting for the engine.
    Running,
    /// Waiting for the target to report its size.
    WaitingForSize,
    /// A resource was delivered.
    Complete,
    /// The load failed.
    Failed,
    /// The load was abandoned; nothing was shown.
    Cancelled,
    /// The resource was released and the placeholder restored.
    Cleared,
    /// Cleared by a pause; restarted on resume.
    Paused,
}

/// The fields a [`SingleRequest`] starts from.
pub struct RequestConfig {
    /// The engine that performs the load.
    pub engine: Engine,
    /// What to load. An absent model fails the request and shows the fallback.
    pub model: Option<Model>,
    /// The kind of resource the target displays.
    pub transcode_kind: ResourceKind,
    /// Request options, already layered over any defaults.
    pub options: RequestOptions,
    /// How the resource is animated in.
    pub transition: TransitionOptions,
    /// Where placeholders and the result are shown.
    pub target: Rc<dyn Target>,
    /// Observers of the outcome, called in order.
    pub listeners: Vec<Rc<dyn RequestListener>>,
    /// Shares the target with sibling requests.
    pub coordinator: Option<Weak<dyn RequestCoordinator>>,
}

impl RequestConfig {
    /// A bitmap load of `model` into `target` with default options.
    #[must_use]
    pub fn new(engine: Engine, model: Option<Model>, target: Rc<dyn Target>) -> Self {
        Self {
            engine,
            model,
            transcode_kind: ResourceKind::Bitmap,
            options: RequestOptions::new(),
            transition: TransitionOptions::default(),
            target,
            listeners: Vec::new(),
            coordinator: None,
        }
    }
}

impl fmt::Debug for RequestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestConfig")
            .field("model", &self.model)
            .field("transcode_kind", &self.transcode_kind)
            .field("options", &self.options)
            .field("transition", &self.transition)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

struct Fields {
    config: RequestConfig,
    resource: Option<Rc<EngineResource>>,
    load_status: Option<LoadStatus>,
    size: Option<(Dimension, Dimension)>,
    started: Instant,
}

impl Fields {
    fn new(config: RequestConfig) -> Self {
        Self {
            config,
            resource: None,
            load_status: None,
            size: None,
            started: Instant::now(),
        }
    }
}

/// Loads one resource into one [`Target`].
///
/// The request asks the target for its size unless an override size is set, then loads through
/// the [`Engine`]. Results are checked against the expected resource kind and handed to the
/// listeners, then to the target. A coordinator may veto setting the resource or showing
/// placeholders when the request shares its target with a sibling.
///
/// Requests come from a [`RequestPool`] and go back to it on [`recycle`](Request::recycle).
/// Every reuse starts from a fresh [`RequestConfig`]. Results and size callbacks addressed to an
/// earlier use are dropped, and their resource is released.
pub struct SingleRequest {
    this: Weak<Self>,
    pool: Weak<PoolInner>,
    fields: RefCell<Option<Fields>>,
    status: Cell<RequestStatus>,
    generation: Cell<u64>,
    is_calling_callbacks: Cell<bool>,
}

struct CallingCallbacks<'a>(&'a Cell<bool>);

impl Drop for CallingCallbacks<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl SingleRequest {
    /// A request that is not pooled.
    #[must_use]
    pub fn new(config: RequestConfig) -> Rc<Self> {
        Self::create(config, Weak::new())
    }

    fn create(config: RequestConfig, pool: Weak<PoolInner>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: Weak::clone(this),
            pool,
            fields: RefCell::new(Some(Fields::new(config))),
            status: Cell::new(RequestStatus::Pending),
            generation: Cell::new(0),
            is_calling_callbacks: Cell::new(false),
        })
    }

    fn init(&self, config: RequestConfig) {
        *self.fields.borrow_mut() = Some(Fields::new(config));
        self.status.set(RequestStatus::Pending);
    }

    /// The current status.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        self.status.get()
    }

    /// Returns `true` between [`recycle`](Request::recycle) and the next reuse.
    #[must_use]
    pub fn is_recycled(&self) -> bool {
        self.fields.borrow().is_none()
    }

    /// The size the load was started with, after applying the size multiplier.
    #[must_use]
    pub fn size(&self) -> Option<(Dimension, Dimension)> {
        self.fields.borrow().as_ref().and_then(|fields| fields.size)
    }

    /// Stops the load without touching the target. A pending size callback is detached.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if called from a callback or after recycling.
    pub fn cancel(&self) -> Result<(), UsageError> {
        self.assert_not_calling_callbacks("cancel")?;
        let (target, load_status) = self.with_fields(|fields| (Rc::clone(&fields.config.target), fields.load_status.take()))?;
        target.remove_callback(&self.size_callback());
        self.status.set(RequestStatus::Cancelled);
        if let Some(load_status) = load_status {
            load_status.cancel();
        }
        Ok(())
    }

    fn with_fields<R>(&self, f: impl FnOnce(&mut Fields) -> R) -> Result<R, UsageError> {
        self.fields.borrow_mut().as_mut().map(f).ok_or(UsageError::RequestRecycled)
    }

    fn assert_not_calling_callbacks(&self, operation: &'static str) -> Result<(), UsageError> {
        if self.is_calling_callbacks.get() {
            return Err(UsageError::CallingCallbacks { operation });
        }
        Ok(())
    }

    fn calling_callbacks(&self) -> CallingCallbacks<'_> {
        self.is_calling_callbacks.set(true);
        CallingCallbacks(&self.is_calling_callbacks)
    }

    fn size_callback(&self) -> SizeReadyCallback {
        SizeReadyCallback {
            request: Weak::clone(&self.this),
            generation: self.generation.get(),
        }
    }

    fn coordinator(&self) -> Option<Rc<dyn RequestCoordinator>> {
        self.fields.borrow().as_ref()?.config.coordinator.as_ref()?.upgrade()
    }

    fn can_set_resource(&self) -> bool {
        self.coordinator().is_none_or(|coordinator| coordinator.can_set_image(self))
    }

    fn can_notify_status_changed(&self) -> bool {
        self.coordinator()
            .is_none_or(|coordinator| coordinator.can_notify_status_changed(self))
    }

    fn is_first_ready_resource(&self) -> bool {
        self.coordinator().is_none_or(|coordinator| !coordinator.is_any_resource_set())
    }

    fn on_size_ready(&self, width: Dimension, height: Dimension) -> Result<(), UsageError> {
        if self.status.get() != RequestStatus::WaitingForSize {
            return Ok(());
        }
        self.status.set(RequestStatus::Running);

        let prepared = self.with_fields(|fields| {
            let multiplier = fields.config.options.get_size_multiplier();
            let (width, height) = (width.scaled(multiplier), height.scaled(multiplier));
            fields.size = Some((width, height));
            let model = fields.config.model.clone()?;
            let params = LoadParams::new(model, width, height, fields.config.transcode_kind, &fields.config.options);
            Some((fields.config.engine.clone(), params))
        })?;
        let Some((engine, params)) = prepared else {
            return Ok(());
        };

        tracing::trace!(key = %params.key(), "size ready, starting load");
        let callback: Rc<dyn ResourceCallback> = Rc::new(RequestCallback {
            request: Weak::clone(&self.this),
            generation: self.generation.get(),
        });
        let load_status = engine.load(&params, callback)?;
        if self.status.get() == RequestStatus::Running {
            self.with_fields(|fields| fields.load_status = load_status)?;
        } else if let Some(load_status) = load_status {
            load_status.cancel();
        }
        Ok(())
    }

    fn replay_resource(&self) -> Result<(), UsageError> {
        let Some(resource) = self.with_fields(|fields| fields.resource.take())? else {
            return Ok(());
        };
        self.on_resource_ready(resource, DataSource::MemoryCache)
    }

    fn on_resource_ready(&self, resource: Rc<EngineResource>, source: DataSource) -> Result<(), UsageError> {
        let (engine, expected) = self.with_fields(|fields| {
            fields.load_status = None;
            (fields.config.engine.clone(), fields.config.transcode_kind)
        })?;

        let payload = match resource.get() {
            Ok(payload) if payload.kind() == expected => payload,
            Ok(payload) => {
                let received = payload.kind();
                drop(payload);
                engine.release(&resource)?;
                let failure = LoadFailure::new(format!(
                    "expected to receive a {expected:?} resource but received a {received:?} resource"
                ));
                return self.on_load_failed(failure, false);
            }
            Err(error) => {
                let failure = LoadFailure::new("received a resource that was already recycled").with_cause(error);
                return self.on_load_failed(failure, false);
            }
        };

        if !self.can_set_resource() {
            drop(payload);
            engine.release(&resource)?;
            self.status.set(RequestStatus::Complete);
            return Ok(());
        }
        self.deliver(resource, payload, source)
    }

    fn deliver(&self, resource: Rc<EngineResource>, payload: Arc<Resource>, source: DataSource) -> Result<(), UsageError> {
        let is_first_resource = self.is_first_ready_resource();
        self.status.set(RequestStatus::Complete);
        let (model, target, listeners, transition, size, started) = self.with_fields(|fields| {
            fields.resource = Some(resource);
            (
                fields.config.model.clone(),
                Rc::clone(&fields.config.target),
                fields.config.listeners.clone(),
                fields.config.transition,
                fields.size,
                fields.started,
            )
        })?;

        tracing::debug!(
            model = ?model,
            %source,
            size = %size_label(size),
            elapsed_ms = started.elapsed().as_millis(),
            "finished loading"
        );

        {
            let _guard = self.calling_callbacks();
            let mut handled = false;
            for listener in &listeners {
                handled |= listener.on_resource_ready(&payload, model.as_ref(), source, is_first_resource);
            }
            if !handled {
                target.on_resource_ready(payload, transition.build(source, is_first_resource));
            }
        }

        match self.coordinator() {
            Some(coordinator) => coordinator.on_request_success(self),
            None => Ok(()),
        }
    }

    fn on_load_failed(&self, failure: LoadFailure, quiet: bool) -> Result<(), UsageError> {
        let (model, size, listeners) = self.with_fields(|fields| {
            fields.load_status = None;
            (fields.config.model.clone(), fields.size, fields.config.listeners.clone())
        })?;

        if quiet {
            tracing::debug!(size = %size_label(size), %failure, "load failed");
        } else {
            tracing::warn!(model = ?model, size = %size_label(size), %failure, "load failed");
            failure.log_root_causes();
        }
        self.status.set(RequestStatus::Failed);

        let is_first_resource = self.is_first_ready_resource();
        let _guard = self.calling_callbacks();
        let mut handled = false;
        for listener in &listeners {
            handled |= listener.on_load_failed(&failure, model.as_ref(), is_first_resource);
        }
        if !handled {
            self.set_error_placeholder()?;
        }
        Ok(())
    }

    fn set_error_placeholder(&self) -> Result<(), UsageError> {
        if !self.can_notify_status_changed() {
            return Ok(());
        }
        let (target, error) = self.with_fields(|fields| {
            let options = &fields.config.options;
            let error = options
                .get_fallback()
                .filter(|_| fields.config.model.is_none())
                .or_else(|| options.get_error())
                .or_else(|| options.get_placeholder())
                .cloned();
            (Rc::clone(&fields.config.target), error)
        })?;
        target.on_load_failed(error.as_ref());
        Ok(())
    }
}

fn size_label(size: Option<(Dimension, Dimension)>) -> String {
    match size {
        Some((width, height)) => format!("{width}x{height}"),
        None => "unknown".to_owned(),
    }
}

impl Request for SingleRequest {
    fn begin(&self) -> Result<(), UsageError> {
        self.assert_not_calling_callbacks("begin")?;
        let (has_model, override_size, target, has_fallback) = self.with_fields(|fields| {
            fields.started = Instant::now();
            let options = &fields.config.options;
            (
                fields.config.model.is_some(),
                options.get_override_size().filter(|&(width, height)| is_valid_size(width, height)),
                Rc::clone(&fields.config.target),
                options.get_fallback().is_some(),
            )
        })?;

        if !has_model {
            if override_size.is_some() {
                self.with_fields(|fields| fields.size = override_size)?;
            }
            // Absent models are expected when a fallback is configured.
            return self.on_load_failed(LoadFailure::new("received an absent model"), has_fallback);
        }

        match self.status.get() {
            RequestStatus::Running => return Err(UsageError::RestartRunning),
            RequestStatus::Complete => return self.replay_resource(),
            RequestStatus::WaitingForSize => target.remove_callback(&self.size_callback()),
            _ => {}
        }

        self.status.set(RequestStatus::WaitingForSize);
        match override_size {
            Some((width, height)) => self.on_size_ready(width, height)?,
            None => target.get_size(self.size_callback()),
        }

        if matches!(self.status.get(), RequestStatus::Running | RequestStatus::WaitingForSize)
            && self.can_notify_status_changed()
        {
            let placeholder = self.with_fields(|fields| fields.config.options.get_placeholder().cloned())?;
            target.on_load_started(placeholder.as_ref());
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), UsageError> {
        self.assert_not_calling_callbacks("clear")?;
        if self.is_recycled() {
            return Err(UsageError::RequestRecycled);
        }
        if self.status.get() == RequestStatus::Cleared {
            return Ok(());
        }
        self.cancel()?;

        let (target, placeholder, resource, engine) = self.with_fields(|fields| {
            (
                Rc::clone(&fields.config.target),
                fields.config.options.get_placeholder().cloned(),
                fields.resource.take(),
                fields.config.engine.clone(),
            )
        })?;
        if self.can_notify_status_changed() {
            target.on_load_cleared(placeholder.as_ref());
        }
        self.status.set(RequestStatus::Cleared);
        // The target dropped its handle above, so a recycled bitmap can go back to the pool.
        if let Some(resource) = resource {
            engine.release(&resource)?;
        }
        Ok(())
    }

    fn pause(&self) -> Result<(), UsageError> {
        self.clear()?;
        self.status.set(RequestStatus::Paused);
        Ok(())
    }

    fn recycle(&self) -> Result<(), UsageError> {
        self.assert_not_calling_callbacks("recycle")?;
        let Some(fields) = self.fields.borrow_mut().take() else {
            return Err(UsageError::RequestRecycled);
        };
        let size_callback = self.size_callback();
        self.generation.set(self.generation.get().wrapping_add(1));
        self.status.set(RequestStatus::Cleared);

        fields.config.target.remove_callback(&size_callback);
        if let Some(load_status) = fields.load_status {
            load_status.cancel();
        }
        if let Some(resource) = fields.resource {
            fields.config.engine.release(&resource)?;
        }

        if let (Some(pool), Some(this)) = (self.pool.upgrade(), self.this.upgrade()) {
            pool.release(this);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        matches!(self.status.get(), RequestStatus::Running | RequestStatus::WaitingForSize)
    }

    fn is_complete(&self) -> bool {
        self.status.get() == RequestStatus::Complete
    }

    fn is_resource_set(&self) -> bool {
        self.is_complete()
    }

    fn is_cancelled(&self) -> bool {
        matches!(self.status.get(), RequestStatus::Cancelled | RequestStatus::Cleared)
    }

    fn is_cleared(&self) -> bool {
        self.status.get() == RequestStatus::Cleared
    }

    fn is_failed(&self) -> bool {
        self.status.get() == RequestStatus::Failed
    }

    fn is_paused(&self) -> bool {
        self.status.get() == RequestStatus::Paused
    }

    fn is_equivalent_to(&self, other: &dyn Request) -> bool {
        let Some(other) = other.as_any().downcast_ref::<Self>() else {
            return false;
        };
        let this = self.fields.borrow();
        let that = other.fields.borrow();
        match (this.as_ref(), that.as_ref()) {
            (Some(this), Some(that)) => {
                this.config.model == that.config.model
                    && this.config.transcode_kind == that.config.transcode_kind
                    && this.config.options == that.config.options
            }
            _ => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for SingleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields.borrow();
        f.debug_struct("SingleRequest")
            .field("status", &self.status.get())
            .field("generation", &self.generation.get())
            .field("model", &fields.as_ref().map(|fields| &fields.config.model))
            .field("size", &fields.as_ref().and_then(|fields| fields.size))
            .finish_non_exhaustive()
    }
}

/// Receives engine results for one use of a request.
struct RequestCallback {
    request: Weak<SingleRequest>,
    generation: u64,
}

impl RequestCallback {
    fn live_request(&self) -> Option<Rc<SingleRequest>> {
        self.request
            .upgrade()
            .filter(|request| request.generation.get() == self.generation && !request.is_recycled())
    }
}

impl ResourceCallback for RequestCallback {
    fn on_resource_ready(&self, resource: Rc<EngineResource>, source: DataSource) {
        let Some(request) = self.live_request() else {
            tracing::trace!(key = %resource.key(), "releasing resource delivered to a recycled request");
            if let Err(error) = resource.release() {
                tracing::error!(%error, "failed to release resource of a recycled request");
            }
            return;
        };
        if let Err(error) = request.on_resource_ready(resource, source) {
            tracing::error!(%error, "failed to deliver resource");
        }
    }

    fn on_load_failed(&self, failure: LoadFailure) {
        if let Some(request) = self.live_request()
            && let Err(error) = request.on_load_failed(failure, false)
        {
            tracing::error!(%error, "failed to deliver load failure");
        }
    }
}

/// Handed to [`Target::get_size`]; reports the target's size back to its request.
///
/// Callbacks addressed to an earlier use of a recycled request do nothing.
#[derive(Clone)]
pub struct SizeReadyCallback {
    request: Weak<SingleRequest>,
    generation: u64,
}

impl SizeReadyCallback {
    /// Starts the load at `width` x `height`. Ignored unless the request is waiting for a size.
    ///
    /// # Errors
    ///
    /// Returns a [`UsageError`] if the engine rejected the load.
    pub fn on_size_ready(&self, width: Dimension, height: Dimension) -> Result<(), UsageError> {
        match self.request.upgrade() {
            Some(request) if request.generation.get() == self.generation => request.on_size_ready(width, height),
            _ => Ok(()),
        }
    }
}

impl PartialEq for SizeReadyCallback {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.request, &other.request) && self.generation == other.generation
    }
}

impl Eq for SizeReadyCallback {}

impl fmt::Debug for SizeReadyCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeReadyCallback")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// A free list of recycled [`SingleRequest`]s.
#[derive(Clone)]
pub struct RequestPool {
    inner: Rc<PoolInner>,
}

struct PoolInner {
    free: RefCell<Vec<Rc<SingleRequest>>>,
    capacity: usize,
}

impl PoolInner {
    fn release(&self, request: Rc<SingleRequest>) {
        let mut free = self.free.borrow_mut();
        if free.len() < self.capacity {
            free.push(request);
        }
    }
}

impl RequestPool {
    /// A pool that keeps up to `capacity` recycled requests.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Rc::new(PoolInner {
                free: RefCell::new(Vec::new()),
                capacity,
            }),
        }
    }

    /// Reuses a recycled request, or creates one, initialized from `config`.
    #[must_use]
    pub fn obtain(&self, config: RequestConfig) -> Rc<SingleRequest> {
        let reused = self.inner.free.borrow_mut().pop();
        match reused {
            Some(request) => {
                request.init(config);
                request
            }
            None => SingleRequest::create(config, Rc::downgrade(&self.inner)),
        }
    }

    /// Number of recycled requests waiting for reuse.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.free.borrow().len()
    }

    /// Returns `true` if no recycled request is waiting for reuse.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recycled requests kept.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_POOL_CAPACITY)
    }
}

impl fmt::Debug for RequestPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPool")
            .field("len", &self.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        Placeholder, Transition,
        testing::{GatedLoader, LogCapture, RecordingTarget, TargetEvent, test_engine},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn model() -> Option<Model> {
        Some(Model::Url("https://example.com/a.png".into()))
    }

    fn config(engine: &Engine, target: &Rc<RecordingTarget>, options: RequestOptions) -> RequestConfig {
        RequestConfig {
            options,
            ..RequestConfig::new(engine.clone(), model(), Rc::clone(target) as Rc<dyn Target>)
        }
    }

    #[test]
    fn override_size_starts_load_and_shows_placeholder() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::default());
        let options = RequestOptions::new()
            .override_size(Dimension::Pixels(10), Dimension::Pixels(10))
            .placeholder(Placeholder::Color(1));
        let request = SingleRequest::new(config(&engine, &target, options));

        request.begin().unwrap();
        assert_eq!(request.status(), RequestStatus::Running);
        assert_eq!(target.events(), [TargetEvent::Started(Some(Placeholder::Color(1)))]);

        engine.run_until_idle(TIMEOUT).unwrap();
        assert!(request.is_complete());
        assert!(request.is_resource_set());
        assert_eq!(target.events().last(), Some(&TargetEvent::Ready(None)));
        assert!(target.resource().is_some());
    }

    #[test]
    fn waits_for_target_size() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::default());
        let request = SingleRequest::new(config(&engine, &target, RequestOptions::new()));

        request.begin().unwrap();
        assert_eq!(request.status(), RequestStatus::WaitingForSize);
        assert!(request.is_running());
        assert_eq!(engine.pending_loads(), 0);

        target.fire_size(Dimension::Pixels(20), Dimension::Pixels(10)).unwrap();
        assert_eq!(request.status(), RequestStatus::Running);
        assert_eq!(engine.pending_loads(), 1);
    }

    #[test]
    fn size_multiplier_scales_target_size() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::with_size(Dimension::Pixels(20), Dimension::Pixels(10)));
        let request = SingleRequest::new(config(&engine, &target, RequestOptions::new().size_multiplier(0.5)));

        request.begin().unwrap();
        engine.run_until_idle(TIMEOUT).unwrap();

        assert_eq!(request.size(), Some((Dimension::Pixels(10), Dimension::Pixels(5))));
        let bitmap = target.resource().unwrap();
        let bitmap = bitmap.as_bitmap().unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (10, 5));
    }

    #[test]
    fn cancel_detaches_pending_size_callback() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::default());
        let request = SingleRequest::new(config(&engine, &target, RequestOptions::new()));

        request.begin().unwrap();
        assert_eq!(target.pending_size_callbacks(), 1);
        request.cancel().unwrap();

        assert_eq!(target.pending_size_callbacks(), 0);
        assert!(request.is_cancelled());
        assert!(!request.is_cleared());
    }

    #[test]
    fn begin_while_running_is_rejected() {
        let loader = Arc::new(GatedLoader::default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::with_size(Dimension::Pixels(10), Dimension::Pixels(10)));
        let request = SingleRequest::new(config(&engine, &target, RequestOptions::new()));

        request.begin().unwrap();
        assert_eq!(request.begin(), Err(UsageError::RestartRunning));
        loader.open();
    }

    #[test]
    fn absent_model_shows_fallback() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::default());
        let options = RequestOptions::new()
            .error(Placeholder::Color(2))
            .fallback(Placeholder::Color(3));
        let request = SingleRequest::new(RequestConfig {
            options,
            ..RequestConfig::new(engine.clone(), None, Rc::clone(&target) as Rc<dyn Target>)
        });

        request.begin().unwrap();
        assert!(request.is_failed());
        assert_eq!(target.events(), [TargetEvent::Failed(Some(Placeholder::Color(3)))]);
        assert_eq!(engine.pending_loads(), 0);
    }

    #[test]
    fn failure_shows_error_placeholder() {
        let loader = Arc::new(GatedLoader::failing());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::with_size(Dimension::Pixels(10), Dimension::Pixels(10)));
        let options = RequestOptions::new()
            .placeholder(Placeholder::Color(1))
            .error(Placeholder::Color(2))
            .fallback(Placeholder::Color(3));
        let request = SingleRequest::new(config(&engine, &target, options));

        request.begin().unwrap();
        engine.run_until_idle(TIMEOUT).unwrap();
        assert!(request.is_failed());
        assert_eq!(target.events().last(), Some(&TargetEvent::Failed(Some(Placeholder::Color(2)))));
    }

    #[test]
    fn failure_is_logged_with_root_causes() {
        let capture = LogCapture::default();
        let loader = Arc::new(GatedLoader::failing());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::with_size(Dimension::Pixels(10), Dimension::Pixels(10)));
        let request = SingleRequest::new(config(&engine, &target, RequestOptions::new()));

        tracing::subscriber::with_default(capture.subscriber(), || {
            request.begin().unwrap();
            engine.run_until_idle(TIMEOUT).unwrap();
        });

        capture.assert_contains("load failed");
        capture.assert_contains("root cause: cannot reach https://example.com/a.png");
    }

    #[test]
    fn clear_releases_resource_after_target_lets_go() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::with_size(Dimension::Pixels(10), Dimension::Pixels(10)));
        let request = SingleRequest::new(config(&engine, &target, RequestOptions::new()));

        request.begin().unwrap();
        engine.run_until_idle(TIMEOUT).unwrap();
        assert_eq!(engine.active_resources(), 1);

        request.clear().unwrap();
        assert!(request.is_cleared());
        assert_eq!(target.events().last(), Some(&TargetEvent::Cleared(None)));
        assert!(target.resource().is_none());
        assert_eq!(engine.active_resources(), 0);
        assert_eq!(engine.memory_cache_len(), 1);

        let events = target.events().len();
        request.clear().unwrap();
        assert_eq!(target.events().len(), events);
    }

    #[test]
    fn complete_request_replays_its_resource() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::with_size(Dimension::Pixels(10), Dimension::Pixels(10)));
        let options = RequestOptions::new();
        let request = SingleRequest::new(RequestConfig {
            transition: TransitionOptions::CrossFade(Duration::from_millis(100)),
            ..config(&engine, &target, options)
        });

        request.begin().unwrap();
        engine.run_until_idle(TIMEOUT).unwrap();
        assert_eq!(
            target.events().last(),
            Some(&TargetEvent::Ready(Some(Transition::CrossFade(Duration::from_millis(100)))))
        );

        request.begin().unwrap();
        assert_eq!(target.events().last(), Some(&TargetEvent::Ready(None)));
        assert_eq!(engine.pending_loads(), 0);
        assert_eq!(loader.fetches(), 1);

        request.clear().unwrap();
        assert_eq!(engine.memory_cache_len(), 1);
    }

    #[test]
    fn callbacks_cannot_reenter_the_request() {
        struct Reentrant {
            request: RefCell<Option<Rc<SingleRequest>>>,
            result: RefCell<Option<Result<(), UsageError>>>,
        }

        impl RequestListener for Reentrant {
            fn on_resource_ready(&self, _: &Arc<Resource>, _: Option<&Model>, _: DataSource, _: bool) -> bool {
                let request = self.request.borrow().as_ref().map(Rc::clone);
                *self.result.borrow_mut() = request.map(|request| request.clear());
                false
            }
        }

        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::with_size(Dimension::Pixels(10), Dimension::Pixels(10)));
        let listener = Rc::new(Reentrant {
            request: RefCell::new(None),
            result: RefCell::new(None),
        });
        let request = SingleRequest::new(RequestConfig {
            listeners: vec![Rc::clone(&listener) as Rc<dyn RequestListener>],
            ..config(&engine, &target, RequestOptions::new())
        });
        *listener.request.borrow_mut() = Some(Rc::clone(&request));

        request.begin().unwrap();
        engine.run_until_idle(TIMEOUT).unwrap();

        assert_eq!(
            listener.result.borrow_mut().take(),
            Some(Err(UsageError::CallingCallbacks { operation: "clear" }))
        );
        assert!(request.is_complete());
        listener.request.borrow_mut().take();
    }

    #[test]
    fn listener_can_take_over_the_target() {
        struct Handles;

        impl RequestListener for Handles {
            fn on_resource_ready(&self, _: &Arc<Resource>, _: Option<&Model>, _: DataSource, _: bool) -> bool {
                true
            }
        }

        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::with_size(Dimension::Pixels(10), Dimension::Pixels(10)));
        let request = SingleRequest::new(RequestConfig {
            listeners: vec![Rc::new(Handles)],
            ..config(&engine, &target, RequestOptions::new())
        });

        request.begin().unwrap();
        engine.run_until_idle(TIMEOUT).unwrap();
        assert!(request.is_complete());
        assert!(target.resource().is_none());
    }

    #[test]
    fn kind_mismatch_fails_and_releases() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::with_size(Dimension::Pixels(10), Dimension::Pixels(10)));
        let options = RequestOptions::new().decode(ResourceKind::Encoded);
        let request = SingleRequest::new(config(&engine, &target, options));

        request.begin().unwrap();
        engine.run_until_idle(TIMEOUT).unwrap();

        assert!(request.is_failed());
        assert_eq!(engine.active_resources(), 0);
        assert_eq!(engine.memory_cache_len(), 1);
    }

    #[test]
    fn pool_reuses_recycled_requests() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::with_size(Dimension::Pixels(10), Dimension::Pixels(10)));
        let pool = RequestPool::new(2);

        let request = pool.obtain(config(&engine, &target, RequestOptions::new()));
        request.begin().unwrap();
        engine.run_until_idle(TIMEOUT).unwrap();
        request.clear().unwrap();
        request.recycle().unwrap();

        assert_eq!(pool.len(), 1);
        assert!(request.is_recycled());
        assert_eq!(request.begin(), Err(UsageError::RequestRecycled));
        assert_eq!(request.recycle(), Err(UsageError::RequestRecycled));

        let reused = pool.obtain(config(&engine, &target, RequestOptions::new()));
        assert!(Rc::ptr_eq(&request, &reused));
        assert_eq!(reused.status(), RequestStatus::Pending);
        assert!(pool.is_empty());
        reused.begin().unwrap();
        assert!(reused.is_complete());
    }

    #[test]
    fn stale_size_callback_is_ignored_after_reuse() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::default());
        let pool = RequestPool::default();

        let request = pool.obtain(config(&engine, &target, RequestOptions::new()));
        request.begin().unwrap();
        let stale = target.take_size_callbacks();
        request.recycle().unwrap();

        let reused = pool.obtain(config(&engine, &target, RequestOptions::new()));
        reused.begin().unwrap();
        for callback in stale {
            callback.on_size_ready(Dimension::Pixels(10), Dimension::Pixels(10)).unwrap();
        }
        assert_eq!(reused.status(), RequestStatus::WaitingForSize);
        assert_eq!(engine.pending_loads(), 0);
    }

    #[test]
    fn equivalent_requests_compare_model_kind_and_options() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        let target = Rc::new(RecordingTarget::default());
        let options = RequestOptions::new().override_size(Dimension::Pixels(10), Dimension::Pixels(10));

        let first = SingleRequest::new(config(&engine, &target, options.clone()));
        let second = SingleRequest::new(config(&engine, &target, options.clone()));
        let bigger = SingleRequest::new(config(
            &engine,
            &target,
            RequestOptions::new().override_size(Dimension::Pixels(20), Dimension::Pixels(20)),
        ));
        let encoded = SingleRequest::new(RequestConfig {
            transcode_kind: ResourceKind::Encoded,
            ..config(&engine, &target, options)
        });

        assert!(first.is_equivalent_to(&*second));
        assert!(!first.is_equivalent_to(&*bigger));
        assert!(!first.is_equivalent_to(&*encoded));
    }
}
