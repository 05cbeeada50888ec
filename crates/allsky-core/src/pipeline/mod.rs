//! The two-tier decode pipeline.
//!
//! Tier one fans the file list across a bounded worker pool; each worker
//! decodes one file end to end and returns a per-file result. Tier two
//! computes per-file offsets in input order and merges the results into a
//! single batch. Output order therefore always equals input order, no
//! matter how the workers interleave.

mod assemble;

use std::panic::{self, AssertUnwindSafe};

use log::{error, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::batch::{BatchData, DecodedBatch, ImageStack, ReadOptions};
use crate::burst;
use crate::dataset::{Dataset, ReaderRoute};
use crate::error::{FileErrorKind, FileFailure, IssueKind, ProblematicFile, ReadError};
use crate::pgm;
use crate::record::DecodedFile;
use crate::riometer;
use crate::table::{self, TableSource};
use crate::variant::{variant_for, CodecVariant};

/// Decode `files` for `dataset` and merge the results into one batch.
/// `tables` supplies the container reader for the tabular forms; routes
/// that never touch a container ignore it.
pub(crate) fn read_files(
    dataset: Dataset,
    files: &[String],
    options: &ReadOptions,
    tables: Option<&dyn TableSource>,
) -> Result<DecodedBatch, ReadError> {
    match dataset.route() {
        ReaderRoute::Pgm => read_image_files(dataset, ImageReader::Pgm, files, options, tables),
        ReaderRoute::PgmOrTable => {
            read_image_files(dataset, ImageReader::PgmOrTable, files, options, tables)
        }
        ReaderRoute::Burst => read_image_files(dataset, ImageReader::Burst, files, options, tables),
        ReaderRoute::Table => {
            require_tables(dataset, tables)?;
            read_image_files(dataset, ImageReader::Table, files, options, tables)
        }
        ReaderRoute::Grid => {
            let tables = require_tables(dataset, tables)?;
            Ok(read_grid_files(files, options, tables))
        }
        ReaderRoute::Riometer => Ok(read_riometer_files(files, options)),
    }
}

/// The tabular routes cannot run without a container reader; asking for one
/// without it is a caller error, not a data problem.
fn require_tables<'a>(
    dataset: Dataset,
    tables: Option<&'a dyn TableSource>,
) -> Result<&'a dyn TableSource, ReadError> {
    tables.ok_or_else(|| ReadError::UnsupportedDataset(dataset.name().to_string()))
}

/// Reader selection within the image families. Grid and riometer files
/// decode to per-file records through their own paths.
#[derive(Debug, Clone, Copy)]
enum ImageReader {
    Pgm,
    PgmOrTable,
    Burst,
    Table,
}

fn read_image_files(
    dataset: Dataset,
    reader: ImageReader,
    files: &[String],
    options: &ReadOptions,
    tables: Option<&dyn TableSource>,
) -> Result<DecodedBatch, ReadError> {
    let Some(variant) = variant_for(dataset) else {
        return Err(ReadError::UnsupportedDataset(dataset.name().to_string()));
    };
    if options.suppress_metadata
        && (options.start_time.is_some() || options.end_time.is_some())
        && !options.quiet
    {
        // frame timestamps live in the metadata blocks; suppression wins
        warn!("time filtering is skipped when metadata is suppressed");
    }
    let pool = build_pool(options);
    let results = decode_pool(files, options, pool.as_ref(), |file| {
        decode_one_image(file, reader, variant, options, tables)
    });
    let Some(results) = results else {
        return Ok(empty_batch(BatchData::Images(ImageStack::empty(
            variant.pixel,
            variant.channels,
        ))));
    };
    Ok(assemble::merge_images(
        files,
        results,
        variant,
        options,
        pool.as_ref(),
    ))
}

fn decode_one_image(
    filename: &str,
    reader: ImageReader,
    variant: &CodecVariant,
    options: &ReadOptions,
    tables: Option<&dyn TableSource>,
) -> Result<DecodedFile, FileFailure> {
    match reader {
        ImageReader::Pgm => pgm::decode_file(filename, variant, options),
        ImageReader::Burst => burst::decode_file(filename, variant, options),
        ImageReader::Table => decode_table_image(filename, variant, options, tables),
        ImageReader::PgmOrTable => {
            // the colour imager shipped three container generations; the
            // extension picks the reader per file
            if filename.ends_with(".h5") {
                decode_table_image(filename, variant, options, tables)
            } else if filename.ends_with(".png") || filename.ends_with(".png.tar") {
                burst::decode_file(filename, variant, options)
            } else {
                pgm::decode_file(filename, variant, options)
            }
        }
    }
}

fn decode_table_image(
    filename: &str,
    variant: &CodecVariant,
    options: &ReadOptions,
    tables: Option<&dyn TableSource>,
) -> Result<DecodedFile, FileFailure> {
    match tables {
        Some(tables) => table::decode_image_file(filename, variant, options, tables),
        None => Err(FileFailure::new(
            FileErrorKind::ImageRead,
            "error reading image file: no table source configured",
        )),
    }
}

fn read_grid_files(
    files: &[String],
    options: &ReadOptions,
    tables: &dyn TableSource,
) -> DecodedBatch {
    let pool = build_pool(options);
    let results = decode_pool(files, options, pool.as_ref(), |file| {
        table::decode_grid_file(file, options, tables)
    });
    let Some(results) = results else {
        return empty_batch(BatchData::GridRecords(Vec::new()));
    };
    let mut records = Vec::new();
    let mut timestamps = Vec::new();
    let mut metadata = Vec::new();
    let mut problematic = Vec::new();
    for (filename, result) in files.iter().zip(results) {
        match result {
            Ok(Some(record)) => {
                if let Some(first) = record.timestamps.first() {
                    timestamps.push(*first);
                }
                if !options.suppress_metadata {
                    metadata.push(record.metadata.first().cloned().unwrap_or_default());
                }
                records.push(record);
            }
            Ok(None) => {}
            Err(failure) => record_error(&mut problematic, filename, failure, options),
        }
    }
    DecodedBatch {
        data: BatchData::GridRecords(records),
        timestamps,
        metadata,
        problematic_files: problematic,
    }
}

fn read_riometer_files(files: &[String], options: &ReadOptions) -> DecodedBatch {
    let pool = build_pool(options);
    let results = decode_pool(files, options, pool.as_ref(), |file| {
        riometer::decode_file(file, options)
    });
    let Some(results) = results else {
        return empty_batch(BatchData::RiometerRecords(Vec::new()));
    };
    let mut records = Vec::new();
    let mut timestamps = Vec::new();
    let mut metadata = Vec::new();
    let mut problematic = Vec::new();
    for (filename, result) in files.iter().zip(results) {
        match result {
            Ok(decoded) => {
                if let Some(failure) = decoded.degraded {
                    problematic.push(ProblematicFile::new(filename, failure, IssueKind::Warning));
                }
                let record = decoded.record;
                if let Some(first) = record.timestamps.first() {
                    timestamps.push(*first);
                }
                if !options.suppress_metadata {
                    metadata.push(record.metadata.clone());
                }
                records.push(record);
            }
            Err(failure) => record_error(&mut problematic, filename, failure, options),
        }
    }
    DecodedBatch {
        data: BatchData::RiometerRecords(records),
        timestamps,
        metadata,
        problematic_files: problematic,
    }
}

/// One bounded pool serves both tiers. `None` means run in the calling
/// thread, either because a single worker was requested or because thread
/// spawning failed.
fn build_pool(options: &ReadOptions) -> Option<ThreadPool> {
    if options.workers() == 1 {
        return None;
    }
    match ThreadPoolBuilder::new()
        .num_threads(options.workers())
        .build()
    {
        Ok(pool) => Some(pool),
        Err(err) => {
            if !options.quiet {
                warn!("worker pool unavailable, decoding sequentially: {err}");
            }
            None
        }
    }
}

/// Decode every file, one worker each, preserving input order. Returns
/// `None` when the run was cancelled or a worker panicked; partial output
/// is never surfaced.
fn decode_pool<T, F>(
    files: &[String],
    options: &ReadOptions,
    pool: Option<&ThreadPool>,
    decode: F,
) -> Option<Vec<T>>
where
    T: Send,
    F: Fn(&str) -> T + Sync,
{
    let run_one = |file: &String| -> Option<T> {
        if options.cancelled() {
            return None;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| decode(file))) {
            Ok(result) => Some(result),
            Err(_) => {
                if !options.quiet {
                    warn!("decode worker panicked (file={file:?})");
                }
                None
            }
        }
    };
    let results: Vec<Option<T>> = match pool {
        Some(pool) => pool.install(|| files.par_iter().map(run_one).collect()),
        None => files.iter().map(run_one).collect(),
    };
    results.into_iter().collect()
}

fn record_error(
    problematic: &mut Vec<ProblematicFile>,
    filename: &str,
    failure: FileFailure,
    options: &ReadOptions,
) {
    if !options.quiet {
        error!("{} (file={filename:?})", failure.message);
    }
    problematic.push(ProblematicFile::new(filename, failure, IssueKind::Error));
}

fn empty_batch(data: BatchData) -> DecodedBatch {
    DecodedBatch {
        data,
        timestamps: Vec::new(),
        metadata: Vec::new(),
        problematic_files: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::CancelToken;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("file-{i}")).collect()
    }

    #[test]
    fn pool_results_keep_input_order() {
        let files = names(16);
        let options = ReadOptions {
            n_parallel: 4,
            ..ReadOptions::default()
        };
        let pool = build_pool(&options);
        assert!(pool.is_some());
        let results = decode_pool(&files, &options, pool.as_ref(), |file| file.to_string())
            .expect("results");
        assert_eq!(results, files);
    }

    #[test]
    fn panicking_worker_aborts_the_run() {
        let files = names(4);
        let options = ReadOptions {
            quiet: true,
            ..ReadOptions::default()
        };
        let results = decode_pool(&files, &options, None, |file| {
            if file.ends_with('2') {
                panic!("boom");
            }
            1usize
        });
        assert!(results.is_none());
    }

    #[test]
    fn cancellation_yields_no_results() {
        let token = CancelToken::new();
        token.cancel();
        let options = ReadOptions {
            cancel: Some(token),
            ..ReadOptions::default()
        };
        let results = decode_pool(&names(3), &options, None, |_| 1usize);
        assert!(results.is_none());
    }

    #[test]
    fn single_worker_runs_without_a_pool() {
        let options = ReadOptions {
            n_parallel: 1,
            ..ReadOptions::default()
        };
        assert!(build_pool(&options).is_none());
        let results = decode_pool(&names(3), &options, None, |file| file.len());
        assert_eq!(results, Some(vec![6, 6, 6]));
    }

    #[test]
    fn tabular_routes_require_a_table_source() {
        let options = ReadOptions::default();
        let err = read_files(Dataset::SmileAsiRaw, &[], &options, None)
            .expect_err("image tables required");
        assert!(matches!(err, ReadError::UnsupportedDataset(_)));
        let err = read_files(Dataset::TrexRgb5577GridMosv001, &[], &options, None)
            .expect_err("grid tables required");
        assert!(matches!(err, ReadError::UnsupportedDataset(_)));
    }

    #[test]
    fn riometer_read_collects_records_and_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("gil_rio_2021_02_01_v0.txt");
        std::fs::write(&good, "01/02/21 06:00:00 1.25\n01/02/21 06:00:01 1.50\n")
            .expect("write good");
        let bad = dir.path().join("mystery_2021_02_01.dat");
        std::fs::write(&bad, "whatever\n").expect("write bad");
        let files = vec![
            good.to_string_lossy().into_owned(),
            bad.to_string_lossy().into_owned(),
        ];
        let options = ReadOptions {
            quiet: true,
            ..ReadOptions::default()
        };
        let batch =
            read_files(Dataset::NorstarRiometerK0Txt, &files, &options, None).expect("batch");
        let BatchData::RiometerRecords(records) = &batch.data else {
            panic!("expected riometer records");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].raw_signal, vec![1.25, 1.50]);
        assert_eq!(batch.timestamps.len(), 1);
        assert_eq!(batch.metadata.len(), 1);
        assert_eq!(batch.problematic_files.len(), 1);
        assert_eq!(
            batch.problematic_files[0].error_message,
            "error reading file, unknown file type"
        );
    }

    #[test]
    fn cancelled_image_read_returns_an_empty_batch() {
        let token = CancelToken::new();
        token.cancel();
        let options = ReadOptions {
            cancel: Some(token),
            quiet: true,
            ..ReadOptions::default()
        };
        let files = vec!["never-opened.pgm.gz".to_string()];
        let batch = read_files(Dataset::ThemisAsiRaw, &files, &options, None).expect("batch");
        assert_eq!(batch.frame_count(), 0);
        assert!(batch.problematic_files.is_empty());
        let BatchData::Images(stack) = &batch.data else {
            panic!("expected an image stack");
        };
        assert_eq!(stack.shape(), &[0, 0, 0]);
    }
}
