// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Coordinates image loads for a UI host.
//!
//! Given a model (a URL, a path, a resource id or raw bytes) and a target size, `picflight` finds
//! a decoded resource in memory, joins a load that is already in flight for the same key, or
//! starts a new fetch and decode on worker threads. Decoded resources are reference counted; once
//! nobody holds one, it moves to a byte-budgeted memory cache, and once evicted its bitmap buffer
//! goes back to a [`ReusePool`] for the next decode.
//!
//! Fetching, decoding and disk persistence are supplied by the host through [`ModelLoader`],
//! [`ResourceDecoder`] and [`DiskCache`]. Presentation is supplied through [`Target`].
//!
//! # Threading
//!
//! Everything except the collaborators and the [`ReusePool`] lives on one owner thread, usually
//! the UI thread. The owner drives completions by calling [`Engine::poll_completions`] from its
//! event loop, which is where every target and listener callback runs.
//!
//! # Example
//!
//! ```no_run
//! use std::{rc::Rc, sync::Arc, time::Duration};
//!
//! use picflight::{ImageLoader, MemorySizes, Model, ModelLoader, ResourceDecoder, Target};
//!
//! # fn example(
//! #     loader: Arc<dyn ModelLoader>,
//! #     decoder: Arc<dyn ResourceDecoder>,
//! #     target: Rc<dyn Target>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let images = ImageLoader::builder(loader, decoder)
//!     .memory_sizes(MemorySizes::for_screen(1080, 2400, 512 * 1024 * 1024, false))
//!     .build()?;
//! let screen = images.request_manager();
//!
//! screen
//!     .load(Model::Url("https://example.com/cat.jpg".into()))
//!     .into_target(target)?;
//!
//! // From the host's event loop:
//! images.engine().wait_for_completions(Duration::from_millis(16))?;
//! # Ok(())
//! # }
//! ```

mod active;
mod context;
mod decode;
mod engine;
mod error;
mod executor;
mod handle;
mod job;
mod key;
mod manager;
mod memory_cache;
mod options;
mod pool;
mod request;
mod resource;
mod tracker;
mod trim;

#[cfg(test)]
mod testing;

#[doc(inline)]
pub use context::{ImageLoader, ImageLoaderBuilder, MemorySizes};
#[doc(inline)]
pub use decode::{BoxError, Cancellation, DiskCache, FetchedData, ModelLoader, ResourceDecoder};
#[doc(inline)]
pub use engine::{DiskCacheClearer, Engine, EngineBuilder, LoadParams, LoadStatus};
#[doc(inline)]
pub use error::{ClearDiskCacheError, LoadFailure, ResourceError, UsageError};
#[doc(inline)]
pub use handle::EngineResource;
#[doc(inline)]
pub use job::ResourceCallback;
#[doc(inline)]
pub use key::{CacheKey, DecodeOptions, Dimension, DiskCacheKey, Model, Signature, Transformation, is_valid_size};
#[doc(inline)]
pub use manager::{RequestBuilder, RequestManager};
#[doc(inline)]
pub use options::{DataSource, DiskCacheStrategy, Placeholder, Priority, RequestOptions, Transition, TransitionOptions};
#[doc(inline)]
pub use pool::{PoolStats, PreFillType, ReusePool};
#[doc(inline)]
pub use request::{
    DEFAULT_REQUEST_POOL_CAPACITY, Request, RequestConfig, RequestCoordinator, RequestListener, RequestPool,
    RequestStatus, SingleRequest, SizeReadyCallback, Target, ThumbnailRequestCoordinator,
};
#[doc(inline)]
pub use resource::{Bitmap, PixelFormat, Resource, ResourceKind};
#[doc(inline)]
pub use tracker::RequestTracker;
#[doc(inline)]
pub use trim::{MemoryCategory, TrimLevel};
