//! Core decoding library for raw auroral instrument files.
//!
//! This crate implements the decode pipeline used by the CLI: a dataset
//! name routes each input file to the matching reader (stream-framed PGM,
//! burst PNG archives, tabular containers, grid products, riometer text),
//! files decode independently on a bounded worker pool, and the per-file
//! results merge into one uniform batch. Readers are stream-oriented and
//! side-effect free; all I/O is isolated in `stream` and the container
//! layer behind [`TableSource`].
//!
//! Invariants:
//! - Output frame order always equals input file order, at any worker count.
//! - A bad file never fails the batch; it lands in `problematic_files`.
//! - Imager families fuse into one stack; grid and riometer files stay
//!   per-file records and never merge.
//!
//! # Examples
//! ```no_run
//! use allsky_core::{read, Dataset, ReadOptions};
//!
//! let options = ReadOptions {
//!     n_parallel: 4,
//!     ..ReadOptions::default()
//! };
//! let batch = read(
//!     Dataset::ThemisAsiRaw,
//!     ["20210205_0600_gill_themis19_full.pgm.gz"],
//!     &options,
//! )?;
//! println!("decoded {} frames", batch.frame_count());
//! # Ok::<(), allsky_core::ReadError>(())
//! ```

mod batch;
mod burst;
mod dataset;
mod error;
mod filename;
mod meta;
mod pgm;
mod pipeline;
mod record;
mod riometer;
mod stream;
mod table;
mod variant;

pub use batch::{BatchData, CancelToken, DecodedBatch, ImageStack, ReadOptions};
pub use dataset::{is_supported, list_supported, Dataset};
pub use error::{FileErrorKind, IssueKind, ProblematicFile, ReadError};
pub use meta::{MetaMap, MetaValue};
pub use riometer::RiometerRecord;
pub use table::{GridRecord, TableError, TableFile, TableSource};

/// Decode `files` as `dataset` and merge the results into a single batch.
///
/// Tabular datasets need a container reader; route them through
/// [`read_with_tables`] instead, or this returns
/// [`ReadError::UnsupportedDataset`].
pub fn read<I, S>(dataset: Dataset, files: I, options: &ReadOptions) -> Result<DecodedBatch, ReadError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let files: Vec<String> = files.into_iter().map(Into::into).collect();
    pipeline::read_files(dataset, &files, options, None)
}

/// Like [`read`], with a container reader for the tabular dataset forms.
/// Datasets that never touch a container ignore `tables`.
pub fn read_with_tables<I, S>(
    dataset: Dataset,
    files: I,
    options: &ReadOptions,
    tables: &dyn TableSource,
) -> Result<DecodedBatch, ReadError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let files: Vec<String> = files.into_iter().map(Into::into).collect();
    pipeline::read_files(dataset, &files, options, Some(tables))
}
