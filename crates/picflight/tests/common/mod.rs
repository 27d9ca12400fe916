// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(dead_code, reason = "Shared by several test binaries")]

//! Host-side fakes for the integration tests.

use std::{
    cell::RefCell,
    io,
    rc::Rc,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use picflight::{
    Bitmap, BoxError, CacheKey, Cancellation, DataSource, Dimension, FetchedData, ImageLoader, MemorySizes, Model,
    ModelLoader, PixelFormat, Placeholder, Priority, Request, RequestOptions, Resource, ResourceDecoder, ResourceKind,
    ReusePool, SizeReadyCallback, Target, Transition,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn url(name: &str) -> Model {
    Model::Url(format!("https://images.example.com/{name}.png"))
}

/// An image loader over `network` with a memory cache of `memory_cache_bytes` and a roomy pool.
pub fn image_loader(network: &Arc<FakeNetwork>, memory_cache_bytes: usize) -> ImageLoader {
    ImageLoader::builder(Arc::clone(network) as Arc<dyn ModelLoader>, Arc::new(PoolingDecoder))
        .memory_sizes(MemorySizes::new(memory_cache_bytes, 1 << 20))
        .default_request_options(
            RequestOptions::new()
                .placeholder(Placeholder::Color(1))
                .error(Placeholder::Color(2)),
        )
        .build()
        .expect("worker pools should start")
}

#[derive(Debug, Default)]
struct Link {
    up: bool,
    fetched: Vec<String>,
}

/// A network whose responses are held back until the test lets them through.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    link: Mutex<Link>,
    changed: Condvar,
    unreachable: bool,
}

impl FakeNetwork {
    pub fn down() -> Self {
        Self::default()
    }

    pub fn up() -> Self {
        let network = Self::default();
        network.connect();
        network
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::up()
        }
    }

    pub fn connect(&self) {
        self.link.lock().up = true;
        self.changed.notify_all();
    }

    pub fn disconnect(&self) {
        self.link.lock().up = false;
    }

    pub fn fetched(&self) -> Vec<String> {
        self.link.lock().fetched.clone()
    }
}

impl ModelLoader for FakeNetwork {
    fn fetch(&self, model: &Model, _priority: Priority, _cancellation: &Cancellation) -> Result<FetchedData, BoxError> {
        {
            let mut link = self.link.lock();
            link.fetched.push(model.to_string());
            while !link.up {
                self.changed.wait(&mut link);
            }
        }
        if self.unreachable {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused").into());
        }
        Ok(FetchedData {
            bytes: Bytes::from(model.to_string()),
            source: DataSource::Remote,
        })
    }
}

/// Decodes into a bitmap of the key's size, reusing a pooled buffer when one fits.
#[derive(Debug)]
pub struct PoolingDecoder;

impl ResourceDecoder for PoolingDecoder {
    fn decode(&self, data: &Bytes, key: &CacheKey, pool: &ReusePool) -> Result<Resource, BoxError> {
        let side = |dimension: Dimension| match dimension {
            Dimension::Pixels(pixels) => pixels,
            Dimension::Original => 1,
        };
        match key.resource_kind() {
            ResourceKind::Encoded => Ok(Resource::Encoded(data.clone())),
            ResourceKind::Bitmap => {
                let (width, height) = (side(key.width()), side(key.height()));
                let bitmap = pool
                    .get(width, height, PixelFormat::Argb8888)
                    .unwrap_or_else(|| Bitmap::new(width, height, PixelFormat::Argb8888));
                Ok(Resource::Bitmap(bitmap))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shown {
    Placeholder(Option<Placeholder>),
    Image(Option<Transition>),
    Error(Option<Placeholder>),
    Cleared(Option<Placeholder>),
}

/// A 10x10 view that remembers what it displayed.
#[derive(Default)]
pub struct FakeView {
    shown: RefCell<Vec<Shown>>,
    image: RefCell<Option<Arc<Resource>>>,
    request: RefCell<Option<Rc<dyn Request>>>,
}

impl FakeView {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn as_target(self: &Rc<Self>) -> Rc<dyn Target> {
        Rc::clone(self) as Rc<dyn Target>
    }

    pub fn shown(&self) -> Vec<Shown> {
        self.shown.borrow().clone()
    }

    pub fn image(&self) -> Option<Arc<Resource>> {
        self.image.borrow().clone()
    }
}

impl Target for FakeView {
    fn get_size(&self, callback: SizeReadyCallback) {
        callback
            .on_size_ready(Dimension::Pixels(10), Dimension::Pixels(10))
            .expect("size delivered outside callbacks");
    }

    fn remove_callback(&self, _callback: &SizeReadyCallback) {}

    fn on_load_started(&self, placeholder: Option<&Placeholder>) {
        self.shown.borrow_mut().push(Shown::Placeholder(placeholder.cloned()));
    }

    fn on_resource_ready(&self, resource: Arc<Resource>, transition: Option<Transition>) {
        *self.image.borrow_mut() = Some(resource);
        self.shown.borrow_mut().push(Shown::Image(transition));
    }

    fn on_load_failed(&self, error: Option<&Placeholder>) {
        self.shown.borrow_mut().push(Shown::Error(error.cloned()));
    }

    fn on_load_cleared(&self, placeholder: Option<&Placeholder>) {
        self.image.borrow_mut().take();
        self.shown.borrow_mut().push(Shown::Cleared(placeholder.cloned()));
    }

    fn request(&self) -> Option<Rc<dyn Request>> {
        self.request.borrow().clone()
    }

    fn set_request(&self, request: Option<Rc<dyn Request>>) {
        *self.request.borrow_mut() = request;
    }
}
