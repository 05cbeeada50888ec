//! Final decoded shapes returned to callers, plus the read-call options.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::{ArrayD, IxDyn};
use time::OffsetDateTime;

use crate::error::ProblematicFile;
use crate::meta::MetaMap;
use crate::riometer::RiometerRecord;
use crate::table::GridRecord;
use crate::variant::PixelKind;

/// Cooperative cancellation shared between the caller and the decode
/// workers. Cancelling mid-decode yields an empty, correctly-typed batch;
/// the merge phase is short by construction and runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Options for one read call. `start_time`/`end_time` are inclusive bounds
/// compared against whole-second frame timestamps. `quiet` silences the
/// per-error diagnostics, never the recorded problematic-file entries.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub n_parallel: usize,
    pub first_record_only: bool,
    pub suppress_metadata: bool,
    pub start_time: Option<OffsetDateTime>,
    pub end_time: Option<OffsetDateTime>,
    pub quiet: bool,
    /// Root for the scoped working directories tar archives extract into.
    /// Defaults to the system temporary directory.
    pub tar_tempdir: Option<PathBuf>,
    pub cancel: Option<CancelToken>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            n_parallel: 1,
            first_record_only: false,
            suppress_metadata: false,
            start_time: None,
            end_time: None,
            quiet: false,
            tar_tempdir: None,
            cancel: None,
        }
    }
}

impl ReadOptions {
    pub(crate) fn workers(&self) -> usize {
        self.n_parallel.max(1)
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Bounds are honored only when metadata is read; the timestamps live in
    /// the metadata blocks.
    pub(crate) fn effective_bounds(&self) -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        if self.suppress_metadata {
            (None, None)
        } else {
            (self.start_time, self.end_time)
        }
    }
}

/// Stacked image data with the frame axis last: `(height, width, frames)`
/// for single-channel instruments, `(height, width, channels, frames)` for
/// colour ones.
#[derive(Debug, Clone)]
pub enum ImageStack {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
}

impl ImageStack {
    pub(crate) fn empty(pixel: PixelKind, channels: usize) -> ImageStack {
        let shape: &[usize] = if channels > 1 { &[0, 0, 0, 0] } else { &[0, 0, 0] };
        match pixel {
            PixelKind::U8 => ImageStack::U8(ArrayD::zeros(IxDyn(shape))),
            PixelKind::U16 => ImageStack::U16(ArrayD::zeros(IxDyn(shape))),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            ImageStack::U8(array) => array.shape(),
            ImageStack::U16(array) => array.shape(),
        }
    }

    /// Length of the trailing frame axis.
    pub fn frame_count(&self) -> usize {
        self.shape().last().copied().unwrap_or(0)
    }
}

/// Decoded payload: one fused frame stack for imager families, or per-file
/// structured records for the grid and riometer families. Records are
/// one-per-file and never merge across files.
#[derive(Debug, Clone)]
pub enum BatchData {
    Images(ImageStack),
    GridRecords(Vec<GridRecord>),
    RiometerRecords(Vec<RiometerRecord>),
}

/// The final aggregate of one read call.
///
/// When metadata is requested, `timestamps`, `metadata`, and the frame axis
/// of `data` share one length; suppressing metadata empties both lists while
/// `data` keeps its frames. For record families the metadata list holds one
/// entry per record and `timestamps` the leading timestamp of each record.
#[derive(Debug)]
pub struct DecodedBatch {
    pub data: BatchData,
    pub timestamps: Vec<OffsetDateTime>,
    pub metadata: Vec<MetaMap>,
    pub problematic_files: Vec<ProblematicFile>,
}

impl DecodedBatch {
    pub fn frame_count(&self) -> usize {
        match &self.data {
            BatchData::Images(stack) => stack.frame_count(),
            BatchData::GridRecords(records) => records.len(),
            BatchData::RiometerRecords(records) => records.len(),
        }
    }
}
