//! Intermediate per-file decode results shared by the stream decoder and the
//! container readers. One worker produces one `DecodedFile`; the pipeline
//! merges them without ever mutating frames in place.

use time::OffsetDateTime;

use crate::error::FileFailure;
use crate::meta::MetaMap;
use crate::variant::PixelKind;

/// Pixel payload of a single frame, row-major `(height, width, channels)`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FramePixels {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl FramePixels {
    pub(crate) fn kind(&self) -> PixelKind {
        match self {
            FramePixels::U8(_) => PixelKind::U8,
            FramePixels::U16(_) => PixelKind::U16,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            FramePixels::U8(data) => data.len(),
            FramePixels::U16(data) => data.len(),
        }
    }
}

/// One decoded frame with its metadata and derived timestamp. The timestamp
/// is absent only when metadata was suppressed for the whole call.
#[derive(Debug, Clone)]
pub(crate) struct RawFrame {
    pub pixels: FramePixels,
    pub metadata: MetaMap,
    pub timestamp: Option<OffsetDateTime>,
}

/// Successful per-file result: ordered frames plus the file's geometry.
/// `degraded` carries the last recovered defect when frames survived anyway.
#[derive(Debug)]
pub(crate) struct DecodedFile {
    pub frames: Vec<RawFrame>,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub pixel: PixelKind,
    pub degraded: Option<FileFailure>,
}

impl DecodedFile {
    pub(crate) fn empty(width: usize, height: usize, channels: usize, pixel: PixelKind) -> Self {
        DecodedFile {
            frames: Vec::new(),
            width,
            height,
            channels,
            pixel,
            degraded: None,
        }
    }
}

/// In-place orientation normalization. Instruments store frames bottom-up;
/// rows are reversed to top-down, and one family also mirrors columns.
pub(crate) fn flip_plane<T: Copy>(
    data: &mut [T],
    width: usize,
    height: usize,
    channels: usize,
    vertical: bool,
    horizontal: bool,
) {
    let row = width * channels;
    if vertical {
        for y in 0..height / 2 {
            let (a, b) = (y * row, (height - 1 - y) * row);
            for i in 0..row {
                data.swap(a + i, b + i);
            }
        }
    }
    if horizontal {
        for y in 0..height {
            let base = y * row;
            for x in 0..width / 2 {
                let (a, b) = (base + x * channels, base + (width - 1 - x) * channels);
                for ch in 0..channels {
                    data.swap(a + ch, b + ch);
                }
            }
        }
    }
}
