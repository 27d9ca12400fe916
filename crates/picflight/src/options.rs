// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Request options and the small enums that travel with a load.

use std::{fmt, sync::Arc, time::Duration};

use crate::{DecodeOptions, Dimension, Resource, ResourceKind, Signature, Transformation};

/// Scheduling hint for a load, passed through to the [`ModelLoader`](crate::ModelLoader).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Needed right now, for example for the item under the user's finger.
    Immediate,
    /// Visible soon.
    High,
    /// The default.
    #[default]
    Normal,
    /// Speculative work such as preloading.
    Low,
}

/// Provenance of a delivered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSource {
    /// Read from local storage.
    Local,
    /// Fetched from a remote location.
    Remote,
    /// Decoded from source data found in the disk cache.
    DataDiskCache,
    /// Read as an already transformed resource from the disk cache.
    ResourceDiskCache,
    /// Served from the active resources or the memory cache without decoding.
    MemoryCache,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "LOCAL",
            Self::Remote => "REMOTE",
            Self::DataDiskCache => "DATA_DISK_CACHE",
            Self::ResourceDiskCache => "RESOURCE_DISK_CACHE",
            Self::MemoryCache => "MEMORY_CACHE",
        })
    }
}

/// Which source data and transformed resources are written to, and read from, the disk cache.
///
/// Source data is stored under [`CacheKey::disk_key`](crate::CacheKey::disk_key) and shared by
/// every size of an image. Transformed resources are stored under
/// [`CacheKey::resource_disk_key`](crate::CacheKey::resource_disk_key) and only serve loads with
/// an identical key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DiskCacheStrategy {
    /// Cache remote data and every transformed resource.
    All,
    /// Never touch the disk cache.
    None,
    /// Cache any source data that did not itself come from a cache.
    Data,
    /// Cache only transformed resources; source data is never written.
    Resource,
    /// Cache remote data, and transformed resources of local data.
    #[default]
    Automatic,
}

impl DiskCacheStrategy {
    /// Returns `true` if source data from `source` should be written to the disk cache.
    #[must_use]
    pub fn is_data_cacheable(self, source: DataSource) -> bool {
        match self {
            Self::All | Self::Automatic => source == DataSource::Remote,
            Self::None | Self::Resource => false,
            Self::Data => !matches!(source, DataSource::DataDiskCache | DataSource::MemoryCache),
        }
    }

    /// Returns `true` if source data found in the disk cache may be decoded.
    #[must_use]
    pub fn decode_cached_data(self) -> bool {
        matches!(self, Self::All | Self::Data | Self::Automatic)
    }

    /// Returns `true` if a resource decoded from `source` should be written to the disk cache.
    ///
    /// `is_transformed` is `true` when the load applies at least one transformation.
    #[must_use]
    pub fn is_resource_cacheable(self, source: DataSource, is_transformed: bool) -> bool {
        match self {
            Self::All | Self::Resource => !matches!(source, DataSource::ResourceDiskCache | DataSource::MemoryCache),
            Self::Automatic => source == DataSource::Local && is_transformed,
            Self::None | Self::Data => false,
        }
    }

    /// Returns `true` if a transformed resource found in the disk cache may be decoded.
    #[must_use]
    pub fn decode_cached_resource(self) -> bool {
        matches!(self, Self::All | Self::Resource | Self::Automatic)
    }
}

/// A visual shown in place of the requested image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// A resource bundled with the host application.
    ResourceId(u32),
    /// A solid ARGB color.
    Color(u32),
    /// An already decoded image.
    Image(Arc<Resource>),
}

/// A transition the target plays when a resource is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Fade from the current placeholder to the resource.
    CrossFade(Duration),
}

/// How a request animates its result into the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransitionOptions {
    /// Set resources without animation.
    #[default]
    None,
    /// Cross fade resources that were not served from memory.
    CrossFade(Duration),
}

impl TransitionOptions {
    /// Builds the transition for a resource from `source`.
    ///
    /// Memory-cache hits are shown immediately so recycled list items do not flicker.
    #[must_use]
    pub fn build(self, source: DataSource, is_first_resource: bool) -> Option<Transition> {
        match self {
            Self::None => None,
            Self::CrossFade(_) if source == DataSource::MemoryCache || !is_first_resource => None,
            Self::CrossFade(duration) => Some(Transition::CrossFade(duration)),
        }
    }
}

/// Per-request options.
///
/// Every setter records that the field was set, so [`RequestOptions::apply`] can layer request
/// options over defaults without clobbering them with unset values.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    size_multiplier: Option<f32>,
    disk_cache_strategy: Option<DiskCacheStrategy>,
    priority: Option<Priority>,
    placeholder: Option<Placeholder>,
    error: Option<Placeholder>,
    fallback: Option<Placeholder>,
    skip_memory_cache: Option<bool>,
    override_size: Option<(Dimension, Dimension)>,
    signature: Option<Signature>,
    transformations: Option<Vec<Transformation>>,
    decode_options: DecodeOptions,
    resource_kind: Option<ResourceKind>,
    use_unlimited_source_pool: Option<bool>,
    only_retrieve_from_cache: Option<bool>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestOptions {
    /// Options with nothing set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            size_multiplier: None,
            disk_cache_strategy: None,
            priority: None,
            placeholder: None,
            error: None,
            fallback: None,
            skip_memory_cache: None,
            override_size: None,
            signature: None,
            transformations: None,
            decode_options: DecodeOptions::default(),
            resource_kind: None,
            use_unlimited_source_pool: None,
            only_retrieve_from_cache: None,
        }
    }

    /// Loads at a fraction of the target size.
    ///
    /// # Panics
    ///
    /// Panics if `multiplier` is not in `(0, 1]`.
    #[must_use]
    pub fn size_multiplier(mut self, multiplier: f32) -> Self {
        assert!(
            multiplier > 0.0 && multiplier <= 1.0,
            "size multiplier must be in (0, 1], got {multiplier}"
        );
        self.size_multiplier = Some(multiplier);
        self
    }

    /// Sets the disk cache strategy.
    #[must_use]
    pub fn disk_cache_strategy(mut self, strategy: DiskCacheStrategy) -> Self {
        self.disk_cache_strategy = Some(strategy);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Shown while the load runs, and after the request is cleared.
    #[must_use]
    pub fn placeholder(mut self, placeholder: Placeholder) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    /// Shown when the load fails.
    #[must_use]
    pub fn error(mut self, error: Placeholder) -> Self {
        self.error = Some(error);
        self
    }

    /// Shown when the model is absent. Setting one marks absent models as expected.
    #[must_use]
    pub fn fallback(mut self, fallback: Placeholder) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Bypasses the active resources and the memory cache.
    #[must_use]
    pub fn skip_memory_cache(mut self, skip: bool) -> Self {
        self.skip_memory_cache = Some(skip);
        self
    }

    /// Loads at this size instead of asking the target.
    #[must_use]
    pub fn override_size(mut self, width: Dimension, height: Dimension) -> Self {
        self.override_size = Some((width, height));
        self
    }

    /// Sets the signature mixed into cache keys.
    #[must_use]
    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Appends a transformation.
    #[must_use]
    pub fn transform(mut self, transformation: Transformation) -> Self {
        self.transformations.get_or_insert_with(Vec::new).push(transformation);
        self
    }

    /// Removes all transformations, including defaults.
    #[must_use]
    pub fn dont_transform(mut self) -> Self {
        self.transformations = Some(Vec::new());
        self
    }

    /// Sets a decoder option.
    #[must_use]
    pub fn decode_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.decode_options.set(name, value);
        self
    }

    /// Sets the kind the decoder should produce.
    #[must_use]
    pub fn decode(mut self, kind: ResourceKind) -> Self {
        self.resource_kind = Some(kind);
        self
    }

    /// Runs source fetches on the unlimited pool, for loads that may block for a long time.
    #[must_use]
    pub fn use_unlimited_source_pool(mut self, flag: bool) -> Self {
        self.use_unlimited_source_pool = Some(flag);
        self
    }

    /// Fails instead of fetching when neither memory nor disk cache has the resource.
    #[must_use]
    pub fn only_retrieve_from_cache(mut self, flag: bool) -> Self {
        self.only_retrieve_from_cache = Some(flag);
        self
    }

    /// Layers every field set in `other` over `self`.
    #[must_use]
    pub fn apply(mut self, other: &Self) -> Self {
        macro_rules! take_set {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() {
                    self.$field.clone_from(&other.$field);
                })*
            };
        }
        take_set!(
            size_multiplier,
            disk_cache_strategy,
            priority,
            placeholder,
            error,
            fallback,
            skip_memory_cache,
            override_size,
            signature,
            transformations,
            resource_kind,
            use_unlimited_source_pool,
            only_retrieve_from_cache,
        );
        self.decode_options.extend(&other.decode_options);
        self
    }

    /// The size multiplier, `1.0` unless set.
    #[must_use]
    pub fn get_size_multiplier(&self) -> f32 {
        self.size_multiplier.unwrap_or(1.0)
    }

    /// The disk cache strategy.
    #[must_use]
    pub fn get_disk_cache_strategy(&self) -> DiskCacheStrategy {
        self.disk_cache_strategy.unwrap_or_default()
    }

    /// The priority, if one was set.
    #[must_use]
    pub fn get_priority(&self) -> Option<Priority> {
        self.priority
    }

    /// The loading placeholder.
    #[must_use]
    pub fn get_placeholder(&self) -> Option<&Placeholder> {
        self.placeholder.as_ref()
    }

    /// The error visual.
    #[must_use]
    pub fn get_error(&self) -> Option<&Placeholder> {
        self.error.as_ref()
    }

    /// The fallback visual for absent models.
    #[must_use]
    pub fn get_fallback(&self) -> Option<&Placeholder> {
        self.fallback.as_ref()
    }

    /// Returns `false` if loads should bypass memory.
    #[must_use]
    pub fn is_memory_cacheable(&self) -> bool {
        !self.skip_memory_cache.unwrap_or(false)
    }

    /// The override size, if one was set.
    #[must_use]
    pub fn get_override_size(&self) -> Option<(Dimension, Dimension)> {
        self.override_size
    }

    /// The signature.
    #[must_use]
    pub fn get_signature(&self) -> Signature {
        self.signature.clone().unwrap_or_default()
    }

    /// The transformations.
    #[must_use]
    pub fn get_transformations(&self) -> &[Transformation] {
        self.transformations.as_deref().unwrap_or_default()
    }

    /// The decoder options.
    #[must_use]
    pub fn get_decode_options(&self) -> &DecodeOptions {
        &self.decode_options
    }

    /// The kind the decoder should produce, defaulting to `transcode`.
    #[must_use]
    pub fn get_resource_kind(&self, transcode: ResourceKind) -> ResourceKind {
        self.resource_kind.unwrap_or(transcode)
    }

    /// Whether source fetches use the unlimited pool.
    #[must_use]
    pub fn get_use_unlimited_source_pool(&self) -> bool {
        self.use_unlimited_source_pool.unwrap_or(false)
    }

    /// Whether only caches may satisfy the load.
    #[must_use]
    pub fn get_only_retrieve_from_cache(&self) -> bool {
        self.only_retrieve_from_cache.unwrap_or(false)
    }
}
