// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Decoded payloads.

use std::fmt;

use bytes::Bytes;

/// Pixel layout of a [`Bitmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PixelFormat {
    /// Single 8-bit alpha channel.
    Alpha8,
    /// 16-bit packed RGB.
    Rgb565,
    /// 32-bit RGBA, 8 bits per channel.
    Argb8888,
    /// 64-bit RGBA, half-float per channel.
    RgbaF16,
}

impl PixelFormat {
    /// Bytes used per pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Alpha8 => 1,
            Self::Rgb565 => 2,
            Self::Argb8888 => 4,
            Self::RgbaF16 => 8,
        }
    }

    /// Bytes needed for a `width` x `height` image in this format, saturating at `usize::MAX`.
    #[must_use]
    pub const fn byte_size(self, width: u32, height: u32) -> usize {
        (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(self.bytes_per_pixel())
    }
}

/// A poolable block of decoded pixels.
///
/// The backing allocation may be larger than `width * height` requires; this is what lets the
/// [`ReusePool`](crate::ReusePool) hand a larger buffer to a smaller request.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Vec<u8>,
}

impl Bitmap {
    /// Allocates a zeroed bitmap.
    #[must_use]
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            pixels: vec![0; format.byte_size(width, height)],
        }
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel layout.
    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Pixels of the current configuration.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels[..self.format.byte_size(self.width, self.height)]
    }

    /// Mutable pixels of the current configuration.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        let len = self.format.byte_size(self.width, self.height);
        &mut self.pixels[..len]
    }

    /// Bytes used by the current configuration.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.format.byte_size(self.width, self.height)
    }

    /// Bytes reserved by the backing allocation.
    #[must_use]
    pub fn allocation_size(&self) -> usize {
        self.pixels.len()
    }

    /// Reinterprets the allocation for new dimensions and zeroes the pixels.
    ///
    /// Returns `false`, leaving the bitmap untouched, if the allocation is too small.
    pub fn reconfigure(&mut self, width: u32, height: u32, format: PixelFormat) -> bool {
        if format.byte_size(width, height) > self.pixels.len() {
            return false;
        }
        self.width = width;
        self.height = height;
        self.format = format;
        self.pixels.fill(0);
        true
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("allocation_size", &self.pixels.len())
            .finish()
    }
}

/// The kind of payload a request expects to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A decoded [`Bitmap`].
    Bitmap,
    /// Still-encoded bytes, for example an animated image handed to a separate player.
    Encoded,
}

/// A decoded, display-ready payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Decoded pixels.
    Bitmap(Bitmap),
    /// Encoded bytes passed through untouched.
    Encoded(Bytes),
}

impl Resource {
    /// The kind of this payload.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Bitmap(_) => ResourceKind::Bitmap,
            Self::Encoded(_) => ResourceKind::Encoded,
        }
    }

    /// Bytes this payload occupies, used for memory-cache accounting.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Bitmap(bitmap) => bitmap.allocation_size(),
            Self::Encoded(bytes) => bytes.len(),
        }
    }

    /// Returns the bitmap, if this payload is one.
    #[must_use]
    pub fn as_bitmap(&self) -> Option<&Bitmap> {
        match self {
            Self::Bitmap(bitmap) => Some(bitmap),
            Self::Encoded(_) => None,
        }
    }
}
