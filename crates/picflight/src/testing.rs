// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fakes shared by the unit tests.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io::{self, Write},
    mem,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt};

use crate::{
    Bitmap, BoxError, CacheKey, Cancellation, DataSource, Dimension, DiskCache, DiskCacheKey, Engine, EngineResource,
    FetchedData, LoadFailure, LoadParams, Model, ModelLoader, PixelFormat, Placeholder, Priority, Request,
    RequestOptions, Resource, ResourceCallback, ResourceDecoder, ResourceKind, ReusePool, SizeReadyCallback, Target,
    Transition, UsageError,
};

pub(crate) fn test_params(name: &str) -> LoadParams {
    LoadParams::new(
        Model::Url(format!("https://example.com/{name}.png")),
        Dimension::Pixels(10),
        Dimension::Pixels(10),
        ResourceKind::Bitmap,
        &RequestOptions::new(),
    )
}

pub(crate) fn test_key(name: &str) -> CacheKey {
    test_params(name).key().clone()
}

pub(crate) fn test_engine(loader: &Arc<GatedLoader>) -> Engine {
    Engine::builder(Arc::clone(loader) as Arc<dyn ModelLoader>, Arc::new(FakeDecoder))
        .reuse_pool(Arc::new(ReusePool::with_max_size(1 << 20)))
        .build()
        .unwrap()
}

#[derive(Debug, Default)]
struct Gate {
    open: bool,
    fetches: usize,
}

/// A loader whose fetches block until the gate opens.
#[derive(Debug, Default)]
pub(crate) struct GatedLoader {
    gate: Mutex<Gate>,
    changed: Condvar,
    fail: bool,
}

impl GatedLoader {
    pub(crate) fn open_by_default() -> Self {
        let loader = Self::default();
        loader.open();
        loader
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::open_by_default()
        }
    }

    pub(crate) fn open(&self) {
        self.gate.lock().open = true;
        self.changed.notify_all();
    }

    pub(crate) fn close(&self) {
        self.gate.lock().open = false;
    }

    pub(crate) fn fetches(&self) -> usize {
        self.gate.lock().fetches
    }

    pub(crate) fn wait_for_fetch(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        while gate.fetches == 0 {
            if self.changed.wait_until(&mut gate, deadline).timed_out() {
                return;
            }
        }
    }
}

impl ModelLoader for GatedLoader {
    fn fetch(&self, model: &Model, _priority: Priority, _cancellation: &Cancellation) -> Result<FetchedData, BoxError> {
        {
            let mut gate = self.gate.lock();
            gate.fetches += 1;
            self.changed.notify_all();
            while !gate.open {
                self.changed.wait(&mut gate);
            }
        }
        if self.fail {
            return Err(io::Error::other(format!("cannot reach {model}")).into());
        }
        Ok(FetchedData {
            bytes: Bytes::from(model.to_string()),
            source: DataSource::Remote,
        })
    }
}

/// Decodes into a bitmap of the requested size, taking buffers from the pool when it can.
#[derive(Debug)]
pub(crate) struct FakeDecoder;

fn pixels(dimension: Dimension) -> u32 {
    match dimension {
        Dimension::Original => 1,
        Dimension::Pixels(pixels) => pixels,
    }
}

impl ResourceDecoder for FakeDecoder {
    fn decode(&self, data: &Bytes, key: &CacheKey, pool: &ReusePool) -> Result<Resource, BoxError> {
        match key.resource_kind() {
            ResourceKind::Encoded => Ok(Resource::Encoded(data.clone())),
            ResourceKind::Bitmap => {
                let (width, height) = (pixels(key.width()), pixels(key.height()));
                let bitmap = pool
                    .get(width, height, PixelFormat::Argb8888)
                    .unwrap_or_else(|| Bitmap::new(width, height, PixelFormat::Argb8888));
                Ok(Resource::Bitmap(bitmap))
            }
        }
    }

    fn encode(&self, resource: &Resource, _key: &CacheKey) -> Result<Option<Bytes>, BoxError> {
        Ok(Some(match resource {
            Resource::Bitmap(bitmap) => Bytes::copy_from_slice(bitmap.pixels()),
            Resource::Encoded(data) => data.clone(),
        }))
    }
}

#[derive(Debug, Default)]
pub(crate) struct InMemoryDiskCache {
    entries: Mutex<HashMap<String, Bytes>>,
    clears: AtomicUsize,
    read_only: bool,
}

impl InMemoryDiskCache {
    /// A cache whose `clear` always fails.
    pub(crate) fn broken() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl DiskCache for InMemoryDiskCache {
    fn get(&self, key: &DiskCacheKey) -> Result<Option<Bytes>, BoxError> {
        Ok(self.entries.lock().get(key.as_str()).cloned())
    }

    fn put(&self, key: &DiskCacheKey, data: &Bytes) -> Result<(), BoxError> {
        self.entries.lock().insert(key.as_str().to_owned(), data.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), BoxError> {
        if self.read_only {
            return Err(io::Error::new(io::ErrorKind::ReadOnlyFilesystem, "disk is read-only").into());
        }
        self.entries.lock().clear();
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Keeps whatever the engine delivers without releasing it.
#[derive(Default)]
pub(crate) struct RecordingCallback {
    ready: RefCell<Option<(Rc<EngineResource>, DataSource)>>,
    failed: Cell<bool>,
}

impl RecordingCallback {
    pub(crate) fn resource(&self) -> Option<Rc<EngineResource>> {
        self.ready.borrow().as_ref().map(|(resource, _)| Rc::clone(resource))
    }

    pub(crate) fn source(&self) -> Option<DataSource> {
        self.ready.borrow().as_ref().map(|(_, source)| *source)
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed.get()
    }
}

impl ResourceCallback for RecordingCallback {
    fn on_resource_ready(&self, resource: Rc<EngineResource>, source: DataSource) {
        *self.ready.borrow_mut() = Some((resource, source));
    }

    fn on_load_failed(&self, _failure: LoadFailure) {
        self.failed.set(true);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TargetEvent {
    Started(Option<Placeholder>),
    Ready(Option<Transition>),
    Failed(Option<Placeholder>),
    Cleared(Option<Placeholder>),
}

/// Records everything a request does to it. Reports `size` right away when one is set.
#[derive(Default)]
pub(crate) struct RecordingTarget {
    size: Option<(Dimension, Dimension)>,
    events: RefCell<Vec<TargetEvent>>,
    callbacks: RefCell<Vec<SizeReadyCallback>>,
    resource: RefCell<Option<Arc<Resource>>>,
    request: RefCell<Option<Rc<dyn Request>>>,
}

impl RecordingTarget {
    pub(crate) fn with_size(width: Dimension, height: Dimension) -> Self {
        Self {
            size: Some((width, height)),
            ..Self::default()
        }
    }

    pub(crate) fn events(&self) -> Vec<TargetEvent> {
        self.events.borrow().clone()
    }

    pub(crate) fn resource(&self) -> Option<Arc<Resource>> {
        self.resource.borrow().as_ref().map(Arc::clone)
    }

    pub(crate) fn pending_size_callbacks(&self) -> usize {
        self.callbacks.borrow().len()
    }

    pub(crate) fn take_size_callbacks(&self) -> Vec<SizeReadyCallback> {
        mem::take(&mut *self.callbacks.borrow_mut())
    }

    pub(crate) fn fire_size(&self, width: Dimension, height: Dimension) -> Result<(), UsageError> {
        for callback in self.take_size_callbacks() {
            callback.on_size_ready(width, height)?;
        }
        Ok(())
    }
}

impl Target for RecordingTarget {
    fn get_size(&self, callback: SizeReadyCallback) {
        match self.size {
            Some((width, height)) => callback.on_size_ready(width, height).unwrap(),
            None => self.callbacks.borrow_mut().push(callback),
        }
    }

    fn remove_callback(&self, callback: &SizeReadyCallback) {
        self.callbacks.borrow_mut().retain(|pending| pending != callback);
    }

    fn on_load_started(&self, placeholder: Option<&Placeholder>) {
        self.events.borrow_mut().push(TargetEvent::Started(placeholder.cloned()));
    }

    fn on_resource_ready(&self, resource: Arc<Resource>, transition: Option<Transition>) {
        *self.resource.borrow_mut() = Some(resource);
        self.events.borrow_mut().push(TargetEvent::Ready(transition));
    }

    fn on_load_failed(&self, error: Option<&Placeholder>) {
        self.events.borrow_mut().push(TargetEvent::Failed(error.cloned()));
    }

    fn on_load_cleared(&self, placeholder: Option<&Placeholder>) {
        self.resource.borrow_mut().take();
        self.events.borrow_mut().push(TargetEvent::Cleared(placeholder.cloned()));
    }

    fn request(&self) -> Option<Rc<dyn Request>> {
        self.request.borrow().as_ref().map(Rc::clone)
    }

    fn set_request(&self, request: Option<Rc<dyn Request>>) {
        *self.request.borrow_mut() = request;
    }
}

/// Captures formatted log output for assertions.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub(crate) fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub(crate) fn assert_contains(&self, expected: &str) {
        let output = self.output();
        assert!(
            output.contains(expected),
            "log output does not contain '{expected}', got:\n{output}"
        );
    }

    /// A subscriber writing into this capture. Install it with `tracing::subscriber::with_default`.
    pub(crate) fn subscriber(&self) -> impl tracing::Subscriber {
        tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_writer(self.clone()).with_ansi(false))
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

pub(crate) struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
