// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Load identity: models, dimensions and cache keys.

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_128;

use crate::ResourceKind;

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Model {
    /// A network location.
    Url(String),
    /// A local file.
    Path(PathBuf),
    /// A resource bundled with the host application.
    ResourceId(u32),
    /// Encoded bytes already in memory.
    Bytes(Bytes),
}

impl Model {
    fn write_identity(&self, out: &mut Vec<u8>) {
        match self {
            Self::Url(url) => {
                out.push(0);
                out.extend_from_slice(url.as_bytes());
            }
            Self::Path(path) => {
                out.push(1);
                out.extend_from_slice(path.to_string_lossy().as_bytes());
            }
            Self::ResourceId(id) => {
                out.push(2);
                out.extend_from_slice(&id.to_le_bytes());
            }
            Self::Bytes(bytes) => {
                out.push(3);
                out.extend_from_slice(&xxh3_128(bytes).to_le_bytes());
            }
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::ResourceId(id) => write!(f, "resource:{id}"),
            Self::Bytes(bytes) => write!(f, "bytes[{}]", bytes.len()),
        }
    }
}

/// One side of a requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Load at the source's natural size along this axis.
    Original,
    /// An exact size in pixels.
    Pixels(u32),
}

impl Dimension {
    /// Returns `true` for [`Dimension::Original`] and for non-zero pixel sizes.
    #[must_use]
    pub fn is_valid(self) -> bool {
        match self {
            Self::Original => true,
            Self::Pixels(pixels) => pixels > 0,
        }
    }

    /// Scales a pixel size by `multiplier`, rounding to the nearest pixel. `Original` is
    /// left untouched.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        reason = "multipliers are in (0, 1] so the scaled size stays within u32"
    )]
    pub fn scaled(self, multiplier: f32) -> Self {
        match self {
            Self::Original => Self::Original,
            Self::Pixels(pixels) => Self::Pixels((multiplier * pixels as f32).round() as u32),
        }
    }
}

impl Dimension {
    fn write_identity(self, out: &mut Vec<u8>) {
        match self {
            Self::Original => out.push(0),
            Self::Pixels(pixels) => {
                out.push(1);
                out.extend_from_slice(&pixels.to_le_bytes());
            }
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Original => f.write_str("original"),
            Self::Pixels(pixels) => write!(f, "{pixels}"),
        }
    }
}

/// Returns `true` if both dimensions can be used without asking the target.
#[must_use]
pub fn is_valid_size(width: Dimension, height: Dimension) -> bool {
    width.is_valid() && height.is_valid()
}

/// A caller-supplied version tag mixed into every key, used to invalidate cached entries whose
/// model identity did not change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Signature(Option<Arc<str>>);

impl Signature {
    /// Creates a signature from any string, for example a modification time or an etag.
    #[must_use]
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(Some(value.into()))
    }

    /// The empty signature.
    #[must_use]
    pub const fn empty() -> Self {
        Self(None)
    }

    fn write_identity(&self, out: &mut Vec<u8>) {
        if let Some(value) = &self.0 {
            out.push(1);
            out.extend_from_slice(value.as_bytes());
        } else {
            out.push(0);
        }
    }
}

fn write_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u64).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// A transformation applied to the decoded resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Transformation {
    /// Scale to fill the requested size, cropping the overflow.
    CenterCrop,
    /// Scale to fit entirely within the requested size.
    FitCenter,
    /// Like `FitCenter`, but never upscales.
    CenterInside,
    /// Center crop and mask to a circle.
    CircleCrop,
    /// A decoder-specific transformation, identified by name.
    Custom(String),
}

impl Transformation {
    fn write_identity(&self, out: &mut Vec<u8>) {
        match self {
            Self::CenterCrop => out.push(0),
            Self::FitCenter => out.push(1),
            Self::CenterInside => out.push(2),
            Self::CircleCrop => out.push(3),
            Self::Custom(name) => {
                out.push(4);
                write_str(out, name);
            }
        }
    }
}

/// Decoder options that influence the decoded output, sorted so equal sets compare and hash
/// equally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DecodeOptions(BTreeMap<String, String>);

impl DecodeOptions {
    /// Sets an option, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Returns an option's value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Copies every option of `other` into `self`.
    pub fn extend(&mut self, other: &Self) {
        self.0.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    fn write_identity(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.0.len() as u64).to_le_bytes());
        for (name, value) in &self.0 {
            write_str(out, name);
            write_str(out, value);
        }
    }
}

/// Structural identity of a load.
///
/// Two loads with equal keys are the same load and share a job, an active resource or a memory
/// cache entry. The key is computed in full by [`CacheKey::new`]; there is no way to build a
/// partial one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    inner: Arc<KeyFields>,
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct KeyFields {
    model: Model,
    signature: Signature,
    width: Dimension,
    height: Dimension,
    transformations: Vec<Transformation>,
    resource_kind: ResourceKind,
    transcode_kind: ResourceKind,
    options: DecodeOptions,
}

impl CacheKey {
    /// Computes a key from every field that influences the loaded result.
    #[expect(clippy::too_many_arguments, reason = "a key is the product of all these fields")]
    #[must_use]
    pub fn new(
        model: Model,
        signature: Signature,
        width: Dimension,
        height: Dimension,
        transformations: Vec<Transformation>,
        resource_kind: ResourceKind,
        transcode_kind: ResourceKind,
        options: DecodeOptions,
    ) -> Self {
        Self {
            inner: Arc::new(KeyFields {
                model,
                signature,
                width,
                height,
                transformations,
                resource_kind,
                transcode_kind,
                options,
            }),
        }
    }

    /// The model being loaded.
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    /// The caller signature.
    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.inner.signature
    }

    /// Requested width.
    #[must_use]
    pub fn width(&self) -> Dimension {
        self.inner.width
    }

    /// Requested height.
    #[must_use]
    pub fn height(&self) -> Dimension {
        self.inner.height
    }

    /// Transformations applied after decoding.
    #[must_use]
    pub fn transformations(&self) -> &[Transformation] {
        &self.inner.transformations
    }

    /// The kind the decoder produces.
    #[must_use]
    pub fn resource_kind(&self) -> ResourceKind {
        self.inner.resource_kind
    }

    /// The kind delivered to the caller.
    #[must_use]
    pub fn transcode_kind(&self) -> ResourceKind {
        self.inner.transcode_kind
    }

    /// Decoder options.
    #[must_use]
    pub fn options(&self) -> &DecodeOptions {
        &self.inner.options
    }

    /// Key of the source data in the disk cache.
    ///
    /// Source data does not depend on size or transformations, so only model and signature
    /// contribute.
    #[must_use]
    pub fn disk_key(&self) -> DiskCacheKey {
        let mut identity = Vec::new();
        self.inner.model.write_identity(&mut identity);
        self.inner.signature.write_identity(&mut identity);
        DiskCacheKey(format!("{:032x}", xxh3_128(&identity)))
    }

    /// Key of the transformed resource in the disk cache.
    ///
    /// Every field contributes, so a different size or transformation is a different entry.
    #[must_use]
    pub fn resource_disk_key(&self) -> DiskCacheKey {
        let fields = &*self.inner;
        let mut identity = vec![b'r'];
        fields.model.write_identity(&mut identity);
        fields.signature.write_identity(&mut identity);
        fields.width.write_identity(&mut identity);
        fields.height.write_identity(&mut identity);
        identity.extend_from_slice(&(fields.transformations.len() as u64).to_le_bytes());
        for transformation in &fields.transformations {
            transformation.write_identity(&mut identity);
        }
        for kind in [fields.resource_kind, fields.transcode_kind] {
            identity.push(match kind {
                ResourceKind::Bitmap => 0,
                ResourceKind::Encoded => 1,
            });
        }
        fields.options.write_identity(&mut identity);
        DiskCacheKey(format!("{:032x}", xxh3_128(&identity)))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}x{}]", self.inner.model, self.inner.width, self.inner.height)
    }
}

/// A filesystem-safe, stable name for source data in the disk cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskCacheKey(String);

impl DiskCacheKey {
    /// The key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
