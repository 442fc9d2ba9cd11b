//! Pixel-format table and capture-region arithmetic.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Frames larger than this are rejected outright at validation time.
pub const MAX_FRAME_AREA: u32 = 8192 * 8192;

/// Pixel formats accepted on the capture surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuyv,
    Uyvy,
    Rgb565,
    Xrgb8888,
    Nv12,
    Nv16,
}

/// Internal code the pipeline stages understand for a given format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwFormat(pub u32);

/// One row of the format table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FormatEntry {
    pub format: PixelFormat,
    pub code: HwFormat,
    /// Overall bits per pixel across all planes.
    pub depth: u32,
    pub planes: usize,
}

impl FormatEntry {
    /// Byte size of each plane for a `width` x `height` frame.
    /// Unused planes are zero.
    pub fn plane_sizes(&self, width: u32, height: u32) -> [u64; 3] {
        let px = u64::from(width) * u64::from(height);
        match self.format {
            PixelFormat::Nv12 => [px, px / 2, 0],
            PixelFormat::Nv16 => [px, px, 0],
            _ => [px * u64::from(self.depth) / 8, 0, 0],
        }
    }

    /// Total bytes one frame of this format occupies.
    pub fn frame_size(&self, width: u32, height: u32) -> u64 {
        self.plane_sizes(width, height).iter().sum()
    }
}

const BUILTIN_FORMATS: &[FormatEntry] = &[
    FormatEntry { format: PixelFormat::Yuyv, code: HwFormat(0x00), depth: 16, planes: 1 },
    FormatEntry { format: PixelFormat::Uyvy, code: HwFormat(0x01), depth: 16, planes: 1 },
    FormatEntry { format: PixelFormat::Rgb565, code: HwFormat(0x04), depth: 16, planes: 1 },
    FormatEntry { format: PixelFormat::Xrgb8888, code: HwFormat(0x05), depth: 32, planes: 1 },
    FormatEntry { format: PixelFormat::Nv12, code: HwFormat(0x0c), depth: 12, planes: 2 },
    FormatEntry { format: PixelFormat::Nv16, code: HwFormat(0x0e), depth: 16, planes: 2 },
];

/// Linear lookup table mapping external formats to stage codes.
///
/// Injected through [`crate::StreamConfig`] so a stream never reaches for
/// process-wide state; `Default` carries the formats the pipeline supports
/// out of the box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatTable {
    entries: Vec<FormatEntry>,
}

impl Default for FormatTable {
    fn default() -> Self {
        Self { entries: BUILTIN_FORMATS.to_vec() }
    }
}

impl FormatTable {
    pub fn new(entries: Vec<FormatEntry>) -> Self {
        Self { entries }
    }

    pub fn entry(&self, format: PixelFormat) -> Option<&FormatEntry> {
        self.entries.iter().find(|e| e.format == format)
    }

    /// Check `format`/`width`/`height` against the table and the size
    /// bounds, returning the matching entry on success.
    pub fn validate(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<&FormatEntry, ConfigError> {
        let entry = self
            .entry(format)
            .ok_or(ConfigError::UnsupportedFormat(format))?;
        if width == 0 || height == 0 {
            return Err(ConfigError::InvalidSize { width, height });
        }
        if width.saturating_mul(height) >= MAX_FRAME_AREA {
            return Err(ConfigError::InvalidSize { width, height });
        }
        Ok(entry)
    }
}

/// The format a stream is currently configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveFormat {
    pub pixel: PixelFormat,
    pub code: HwFormat,
    pub width: u32,
    pub height: u32,
}

/// A crop or compose region.
///
/// The zero-sized rectangle is the "full frame" sentinel; anything else is
/// programmed into the owning stage verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self { left, top, width, height }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self { left: 0, top: 0, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Resolve the sentinel against the full frame of `width` x `height`.
    pub fn resolve(&self, width: u32, height: u32) -> Rect {
        if self.is_empty() {
            Rect::full(width, height)
        } else {
            *self
        }
    }
}
