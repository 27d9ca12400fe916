// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reference-counted wrapper around a decoded resource.

use std::{
    cell::{Cell, OnceCell, RefCell},
    fmt,
    rc::{Rc, Weak},
    sync::Arc,
};

use crate::{CacheKey, Resource, ResourceError, ReusePool};

/// Told when an [`EngineResource`] is no longer acquired by anyone.
pub(crate) trait ResourceListener {
    fn on_resource_released(&self, resource: &Rc<EngineResource>) -> Result<(), ResourceError>;
}

/// A decoded resource shared by every request that loaded the same [`CacheKey`].
///
/// Each holder calls [`acquire`](Self::acquire) once and [`release`](Self::release) once. When
/// the count drops back to zero the owning engine decides whether the resource moves into the
/// memory cache or is recycled. Recycling happens at most once; afterwards every operation on
/// the resource fails with [`ResourceError::AlreadyRecycled`].
///
/// The reference count lives on the owner thread, which is why this type is neither `Send` nor
/// `Sync`.
pub struct EngineResource {
    key: CacheKey,
    payload: RefCell<Option<Arc<Resource>>>,
    size: usize,
    acquired: Cell<usize>,
    is_cacheable: bool,
    recycled: Cell<bool>,
    listener: OnceCell<Weak<dyn ResourceListener>>,
    pool: Option<Arc<ReusePool>>,
}

impl EngineResource {
    /// Wraps a decoded payload.
    ///
    /// When `pool` is given, a recycled bitmap payload is offered back to it.
    #[must_use]
    pub fn new(key: CacheKey, resource: Resource, is_cacheable: bool, pool: Option<Arc<ReusePool>>) -> Rc<Self> {
        Rc::new(Self {
            key,
            size: resource.size(),
            payload: RefCell::new(Some(Arc::new(resource))),
            acquired: Cell::new(0),
            is_cacheable,
            recycled: Cell::new(false),
            listener: OnceCell::new(),
            pool,
        })
    }

    /// The key this resource was loaded for.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The payload.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::AlreadyRecycled`] once the resource has been recycled.
    pub fn get(&self) -> Result<Arc<Resource>, ResourceError> {
        self.payload.borrow().clone().ok_or(ResourceError::AlreadyRecycled)
    }

    /// Bytes the payload occupies.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns `true` if the resource may be kept in memory after its last release.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.is_cacheable
    }

    /// Current reference count.
    #[must_use]
    pub fn acquired(&self) -> usize {
        self.acquired.get()
    }

    /// Returns `true` once the payload has been recycled.
    #[must_use]
    pub fn is_recycled(&self) -> bool {
        self.recycled.get()
    }

    /// Adds a reference.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::AlreadyRecycled`] if the resource has been recycled.
    pub fn acquire(&self) -> Result<(), ResourceError> {
        if self.recycled.get() {
            return Err(ResourceError::AlreadyRecycled);
        }
        self.acquired.set(self.acquired.get() + 1);
        Ok(())
    }

    /// Drops a reference.
    ///
    /// Dropping the last reference hands the resource to its listener, or recycles it if no
    /// listener was set.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Underflow`] if the resource is not acquired.
    pub fn release(self: &Rc<Self>) -> Result<(), ResourceError> {
        let acquired = self.acquired.get();
        if acquired == 0 {
            return Err(ResourceError::Underflow);
        }
        self.acquired.set(acquired - 1);
        if acquired > 1 {
            return Ok(());
        }

        match self.listener.get().and_then(Weak::upgrade) {
            Some(listener) => listener.on_resource_released(self),
            None => self.recycle(),
        }
    }

    /// Sets the listener told about the last release. May be called once.
    pub(crate) fn set_resource_listener(&self, listener: Weak<dyn ResourceListener>) -> Result<(), ResourceError> {
        self.listener.set(listener).map_err(|_| ResourceError::ListenerAlreadySet)
    }

    /// Gives up the payload for good.
    ///
    /// A bitmap nobody else holds goes back to the reuse pool; any other payload is dropped, and
    /// a bitmap still referenced elsewhere is freed once that reference drops.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::AlreadyRecycled`] on a second call, and
    /// [`ResourceError::StillAcquired`] while references are outstanding.
    pub fn recycle(&self) -> Result<(), ResourceError> {
        if self.recycled.get() {
            return Err(ResourceError::AlreadyRecycled);
        }
        let acquired = self.acquired.get();
        if acquired > 0 {
            return Err(ResourceError::StillAcquired { acquired });
        }
        self.recycled.set(true);

        let Some(payload) = self.payload.borrow_mut().take() else {
            return Ok(());
        };
        match (Arc::try_unwrap(payload), &self.pool) {
            (Ok(Resource::Bitmap(bitmap)), Some(pool)) => {
                let pooled = pool.put(bitmap);
                tracing::trace!(key = %self.key, pooled, "recycled bitmap");
            }
            (Ok(_), _) => {}
            (Err(_), _) => {
                tracing::trace!(key = %self.key, "payload still referenced outside the engine, not pooling it");
            }
        }
        Ok(())
    }
}

impl fmt::Debug for EngineResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineResource")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("acquired", &self.acquired.get())
            .field("is_cacheable", &self.is_cacheable)
            .field("recycled", &self.recycled.get())
            .finish_non_exhaustive()
    }
}
