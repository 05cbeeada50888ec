//! The shared frame decoder for the stream0 PGM-family formats.
//!
//! One state machine serves every PGM instrument; per-instrument differences
//! (geometry, frame-end marker spelling, flip axes, duplicate-key policy)
//! arrive as `CodecVariant` data. Failures are captured into the per-file
//! result and never raised past this boundary.

use std::io::{BufRead, Read};

use log::warn;
use time::OffsetDateTime;

use crate::batch::ReadOptions;
use crate::error::{FileErrorKind, FileFailure};
use crate::filename;
use crate::meta::{self, MetaMap};
use crate::record::{DecodedFile, FramePixels, RawFrame, flip_plane};
use crate::stream;
use crate::variant::{CodecVariant, Geometry, PixelKind};

use super::layout;

/// Decoder protocol states. `Scanning` consumes magic and stray lines, a
/// metadata line opens a block, the frame-end marker arms the dimension and
/// sentinel expectations, and a consumed pixel block returns to `Scanning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Scanning,
    InMetadataBlock,
    AwaitingDimensionLine,
    AwaitingPixelBlock,
    Done,
    Failed,
}

/// Disposition of the frame whose pixel block comes next. Skipped frames
/// still advance the stream over their pixel bytes.
enum PendingFrame {
    None,
    Keep {
        metadata: MetaMap,
        timestamp: Option<OffsetDateTime>,
    },
    Skip,
}

pub(crate) fn decode_file(
    filename: &str,
    variant: &CodecVariant,
    options: &ReadOptions,
) -> Result<DecodedFile, FileFailure> {
    let mut reader = stream::open_stream(variant.extensions, filename)?;
    decode_stream(&mut reader, variant, filename, options)
}

/// Decode one open byte stream into ordered frames. `filename` is used for
/// diagnostics and for the variant's site/device fallback only.
pub(crate) fn decode_stream(
    reader: &mut impl BufRead,
    variant: &CodecVariant,
    filename: &str,
    options: &ReadOptions,
) -> Result<DecodedFile, FileFailure> {
    StreamDecoder::new(reader, variant, filename, options).run()
}

struct StreamDecoder<'a, R: BufRead> {
    reader: &'a mut R,
    variant: &'a CodecVariant,
    filename: &'a str,
    options: &'a ReadOptions,
    state: DecodeState,
    current: MetaMap,
    pending: PendingFrame,
    carried_site: String,
    carried_device: String,
    frames: Vec<RawFrame>,
    /// Frame boundaries and pixel blocks observed, kept or not. Zero frames
    /// with zero observations is a defective file; zero frames with some
    /// observations means everything was filtered out.
    seen_frames: usize,
    width: usize,
    height: usize,
    dimension_line: Option<Vec<u8>>,
    degraded: Option<FileFailure>,
    fatal: Option<FileFailure>,
}

impl<'a, R: BufRead> StreamDecoder<'a, R> {
    fn new(
        reader: &'a mut R,
        variant: &'a CodecVariant,
        filename: &'a str,
        options: &'a ReadOptions,
    ) -> Self {
        let (carried_site, carried_device) =
            filename::site_device_fallback(variant.site_fallback, filename).unwrap_or_default();
        let (width, height) = match variant.geometry {
            Geometry::Fixed { width, height } => (width, height),
            Geometry::FromStream { .. } => (0, 0),
        };
        StreamDecoder {
            reader,
            variant,
            filename,
            options,
            state: DecodeState::Scanning,
            current: MetaMap::new(),
            pending: PendingFrame::None,
            carried_site,
            carried_device,
            frames: Vec::new(),
            seen_frames: 0,
            width,
            height,
            dimension_line: None,
            degraded: None,
            fatal: None,
        }
    }

    fn run(mut self) -> Result<DecodedFile, FileFailure> {
        let mut line = Vec::new();
        while !matches!(self.state, DecodeState::Done | DecodeState::Failed) {
            if self.options.first_record_only && !self.frames.is_empty() {
                self.state = DecodeState::Done;
                continue;
            }
            match stream::read_raw_line(self.reader, &mut line) {
                Ok(Some(())) => {}
                Ok(None) => {
                    self.state = DecodeState::Done;
                    continue;
                }
                Err(err) => {
                    self.fail(FileFailure::new(
                        FileErrorKind::ImageRead,
                        format!("error reading before image data: {err}"),
                    ));
                    continue;
                }
            }

            if line.starts_with(layout::MAGIC_LINE) {
                continue;
            }
            if line.starts_with(layout::METADATA_PREFIX) {
                self.metadata_line(&line);
                continue;
            }
            if line == layout::PIXEL_SENTINEL {
                self.pixel_block();
                continue;
            }
            // anything else is a dimension-line candidate; the last line
            // seen before the sentinel wins
            self.dimension_line = Some(line.clone());
            if self.state == DecodeState::AwaitingDimensionLine {
                self.state = DecodeState::AwaitingPixelBlock;
            }
        }
        self.finish()
    }

    fn metadata_line(&mut self, line: &[u8]) {
        if self.options.suppress_metadata {
            return;
        }
        if self.state == DecodeState::Scanning {
            self.state = DecodeState::InMetadataBlock;
        }
        // metadata is seven-bit on the wire; skip wider lines, keep decoding
        let decoded = match std::str::from_utf8(line) {
            Ok(text) if text.is_ascii() => text,
            _ => {
                let offset = line.iter().position(|byte| !byte.is_ascii()).unwrap_or(0);
                self.recover(
                    FileErrorKind::MetadataDecode,
                    format!("error decoding metadata line: non-ascii byte at offset {offset}"),
                );
                return;
            }
        };
        let parts: Vec<&str> = decoded.split(layout::KEY_QUOTE).collect();
        if parts.len() != 3 {
            if !self.options.quiet {
                warn!(
                    "issue splitting metadata line (line={decoded:?}, file={:?})",
                    self.filename
                );
            }
            return;
        }
        let key = parts[1].to_string();
        let value = parts[2].trim().to_string();
        if self.variant.collect_duplicate_keys {
            self.current.append(key.clone(), value);
        } else {
            self.current.insert(key.clone(), value);
        }

        if self
            .variant
            .frame_end_markers
            .iter()
            .any(|marker| key.starts_with(marker))
        {
            self.frame_boundary();
        }
    }

    /// Frame-boundary logic: filter against the time bounds, inject the
    /// carried site/device IDs, reset the in-progress map.
    fn frame_boundary(&mut self) {
        let mut metadata = std::mem::take(&mut self.current);
        self.seen_frames += 1;
        self.state = DecodeState::AwaitingDimensionLine;

        match metadata.get_text(self.variant.site_key) {
            Some(site) => self.carried_site = site.to_string(),
            None => metadata.insert(self.variant.site_key, self.carried_site.clone()),
        }
        match metadata.get_text(self.variant.device_key) {
            Some(device) => self.carried_device = device.to_string(),
            None => metadata.insert(self.variant.device_key, self.carried_device.clone()),
        }

        let timestamp = metadata
            .get_text(self.variant.timestamp_key)
            .and_then(meta::parse_metadata_timestamp);
        let Some(timestamp) = timestamp else {
            self.recover(
                FileErrorKind::MetadataDecode,
                format!(
                    "missing or invalid frame timestamp under key {:?}",
                    self.variant.timestamp_key
                ),
            );
            self.pending = PendingFrame::Skip;
            return;
        };

        // bounds compare on whole seconds; the stored timestamp keeps its
        // full precision
        let (start, end) = self.options.effective_bounds();
        if meta::within_bounds(meta::truncate_to_second(timestamp), start, end) {
            self.pending = PendingFrame::Keep {
                metadata,
                timestamp: Some(timestamp),
            };
        } else {
            self.pending = PendingFrame::Skip;
        }
    }

    fn pixel_block(&mut self) {
        let (width, height) = match self.block_geometry() {
            Ok(dims) => dims,
            Err(failure) => {
                self.fail(failure);
                return;
            }
        };
        let byte_len = width * height * layout::BYTES_PER_SAMPLE;
        let pending = std::mem::replace(&mut self.pending, PendingFrame::None);
        self.state = DecodeState::Scanning;

        match pending {
            PendingFrame::Skip => {
                if let Err(err) = stream::discard_exact(self.reader, byte_len) {
                    self.recover(
                        FileErrorKind::ImageRead,
                        format!("image data read failure: {err}"),
                    );
                }
            }
            PendingFrame::None if self.options.suppress_metadata => {
                self.seen_frames += 1;
                self.read_frame(width, height, byte_len, MetaMap::new(), None);
            }
            PendingFrame::None => {
                // a pixel block with no completed metadata record cannot be
                // kept without breaking frame/metadata alignment
                self.seen_frames += 1;
                match stream::discard_exact(self.reader, byte_len) {
                    Ok(()) => self.recover(
                        FileErrorKind::MetadataDecode,
                        "pixel block without a preceding metadata record".to_string(),
                    ),
                    Err(err) => self.recover(
                        FileErrorKind::ImageRead,
                        format!("image data read failure: {err}"),
                    ),
                }
            }
            PendingFrame::Keep {
                metadata,
                timestamp,
            } => {
                self.read_frame(width, height, byte_len, metadata, timestamp);
            }
        }
    }

    fn block_geometry(&mut self) -> Result<(usize, usize), FileFailure> {
        match self.variant.geometry {
            Geometry::Fixed { width, height } => Ok((width, height)),
            Geometry::FromStream { .. } => {
                let raw = self.dimension_line.take().ok_or_else(|| {
                    FileFailure::new(
                        FileErrorKind::ImageRead,
                        "image data read failure: missing dimension line before pixel block"
                            .to_string(),
                    )
                })?;
                parse_dimension_line(&raw).ok_or_else(|| {
                    FileFailure::new(
                        FileErrorKind::ImageRead,
                        format!(
                            "image data read failure: malformed dimension line (line={:?})",
                            String::from_utf8_lossy(&raw)
                        ),
                    )
                })
            }
        }
    }

    fn read_frame(
        &mut self,
        width: usize,
        height: usize,
        byte_len: usize,
        metadata: MetaMap,
        timestamp: Option<OffsetDateTime>,
    ) {
        let mut raw = vec![0u8; byte_len];
        if let Err(err) = self.reader.read_exact(&mut raw) {
            self.recover(
                FileErrorKind::ImageRead,
                format!("image data read failure: {err}"),
            );
            return;
        }
        if self.width == 0 {
            self.width = width;
            self.height = height;
        } else if (self.width, self.height) != (width, height) {
            self.recover(
                FileErrorKind::ImageRead,
                format!(
                    "image data read failure: frame geometry changed from {}x{} to {width}x{height}",
                    self.width, self.height
                ),
            );
            return;
        }
        let mut pixels: Vec<u16> = raw
            .chunks_exact(layout::BYTES_PER_SAMPLE)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        flip_plane(
            &mut pixels,
            width,
            height,
            1,
            self.variant.flip_vertical,
            self.variant.flip_horizontal,
        );
        self.frames.push(RawFrame {
            pixels: FramePixels::U16(pixels),
            metadata,
            timestamp,
        });
    }

    /// Recoverable defect: log it, remember the last one, keep decoding.
    fn recover(&mut self, kind: FileErrorKind, message: String) {
        if !self.options.quiet {
            warn!("{message} (file={:?})", self.filename);
        }
        self.degraded = Some(FileFailure::new(kind, message));
    }

    fn fail(&mut self, failure: FileFailure) {
        self.fatal = Some(failure);
        self.state = DecodeState::Failed;
    }

    fn finish(self) -> Result<DecodedFile, FileFailure> {
        if let Some(failure) = self.fatal {
            return Err(failure);
        }
        if self.frames.is_empty() {
            if self.seen_frames == 0 {
                return Err(FileFailure::new(
                    FileErrorKind::NoImageData,
                    "no image data".to_string(),
                ));
            }
            if let Some(failure) = self.degraded {
                // every observed frame was lost to a defect
                return Err(failure);
            }
        }
        let (width, height) = if self.width == 0 {
            self.variant.geometry.expected()
        } else {
            (self.width, self.height)
        };
        Ok(DecodedFile {
            frames: self.frames,
            width,
            height,
            channels: 1,
            pixel: PixelKind::U16,
            degraded: self.degraded,
        })
    }
}

fn parse_dimension_line(raw: &[u8]) -> Option<(usize, usize)> {
    let text = std::str::from_utf8(raw).ok()?;
    let mut parts = text.split_whitespace();
    let width: usize = parts.next()?.parse().ok()?;
    let height: usize = parts.next()?.parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}
