//! Tabular-container reading: frame selection, normalization, and flip for
//! the self-describing image and grid products.
//!
//! Container access goes through the [`TableSource`] boundary so this crate
//! carries the selection logic while the columnar-file wrapper stays outside
//! it. A source opens one file at a time; the returned [`TableFile`] exposes
//! the stored timestamp table, the image or grid blocks (read by index, so
//! filtered-out frames are never materialized), and the two attribute
//! levels.

use ndarray::{ArrayD, Axis};
use thiserror::Error;
use time::OffsetDateTime;

use crate::batch::ReadOptions;
use crate::error::{FileErrorKind, FileFailure};
use crate::filename;
use crate::meta::{self, MetaMap, MetaValue};
use crate::record::{DecodedFile, FramePixels, RawFrame, flip_plane};
use crate::variant::CodecVariant;

/// Grid files without an explicit fill-value attribute use this marker.
const DEFAULT_GRID_FILL: f64 = -999.0;

/// Error raised by a tabular-container backend.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Format(String),
}

impl TableError {
    pub fn format(message: impl Into<String>) -> Self {
        TableError::Format(message.into())
    }
}

/// Opens tabular containers on behalf of the readers. Implementations wrap
/// whichever columnar-file library the application links; tests substitute
/// in-memory fakes.
pub trait TableSource: Sync {
    fn open(&self, filename: &str) -> Result<Box<dyn TableFile>, TableError>;
}

/// One open tabular container.
pub trait TableFile {
    /// Stored frame timestamp strings, in table order.
    fn timestamps(&mut self) -> Result<Vec<String>, TableError>;

    /// `(height, width, channels)` of the image block, available without
    /// materializing any frame.
    fn image_geometry(&mut self) -> Result<(usize, usize, usize), TableError>;

    /// Image frames at the given table indices, stacked on the last axis:
    /// `(height, width, channels, len(indices))`. A single selected frame
    /// may come back 3-D; the reader normalizes it.
    fn read_images(&mut self, indices: &[usize]) -> Result<ArrayD<u8>, TableError>;

    /// Grid frames at the given table indices, frame axis last.
    fn read_grid(&mut self, indices: &[usize]) -> Result<ArrayD<f32>, TableError>;

    /// Auxiliary grid blocks, one per contributing data source.
    fn source_info(&mut self, indices: &[usize]) -> Result<Vec<(String, ArrayD<f32>)>, TableError>;

    /// File-level attributes.
    fn file_attributes(&mut self) -> Result<MetaMap, TableError>;

    /// Frame-level attributes for one original table index.
    fn frame_attributes(&mut self, index: usize) -> Result<MetaMap, TableError>;
}

/// One grid file's decoded content. Grid products are one record per file
/// and never merge across files.
#[derive(Debug, Clone)]
pub struct GridRecord {
    pub filename: String,
    /// Grid block with the frame axis last, rows top-down.
    pub grid: ArrayD<f32>,
    pub timestamps: Vec<OffsetDateTime>,
    /// Per-source auxiliary blocks, in container order, native orientation.
    pub source_info: Vec<(String, ArrayD<f32>)>,
    /// Marker for cells no source contributed to.
    pub fill_value: f64,
    /// One map per kept frame; empty when metadata is suppressed.
    pub metadata: Vec<MetaMap>,
}

fn table_failure(err: impl std::fmt::Display) -> FileFailure {
    FileFailure::new(
        FileErrorKind::ImageRead,
        format!("error reading image file: {err}"),
    )
}

/// Indices of the frames to keep, with their parsed timestamps. First-record
/// mode considers only table index 0; the time bounds then prune whatever is
/// left. With metadata suppressed nothing is parsed and everything is kept.
fn select_indices(
    stamps: &[String],
    options: &ReadOptions,
) -> Result<(Vec<usize>, Vec<OffsetDateTime>), FileFailure> {
    let candidates: Vec<usize> = if options.first_record_only {
        (0..stamps.len().min(1)).collect()
    } else {
        (0..stamps.len()).collect()
    };
    if options.suppress_metadata {
        return Ok((candidates, Vec::new()));
    }

    let (start, end) = options.effective_bounds();
    let mut indices = Vec::with_capacity(candidates.len());
    let mut times = Vec::with_capacity(candidates.len());
    for i in candidates {
        let raw = &stamps[i];
        let ts = meta::parse_metadata_timestamp(raw).ok_or_else(|| {
            table_failure(format_args!("invalid frame timestamp {raw:?}"))
        })?;
        if meta::within_bounds(meta::truncate_to_second(ts), start, end) {
            indices.push(i);
            times.push(ts);
        }
    }
    Ok((indices, times))
}

/// Decode one tabular image container (colour imager or SMILE form).
pub(crate) fn decode_image_file(
    filename: &str,
    variant: &CodecVariant,
    options: &ReadOptions,
    tables: &dyn TableSource,
) -> Result<DecodedFile, FileFailure> {
    // the SMILE form is pre-filtered by the minute encoded in the basename,
    // skipping the container open entirely for out-of-range files
    if variant.prefilter_filename_time {
        let file_time = filename::file_start_time(filename).ok_or_else(|| {
            FileFailure::new(
                FileErrorKind::MetadataDecode,
                "failed to extract timestamp from filename".to_string(),
            )
        })?;
        let (start, end) = options.effective_bounds();
        let floored = (
            start.map(meta::truncate_to_minute),
            end.map(meta::truncate_to_minute),
        );
        if !meta::within_bounds(file_time, floored.0, floored.1) {
            return Ok(DecodedFile::empty(0, 0, variant.channels, variant.pixel));
        }
    }

    let mut file = tables.open(filename).map_err(table_failure)?;
    let stamps = file.timestamps().map_err(table_failure)?;
    let (height, width, channels) = file.image_geometry().map_err(table_failure)?;
    let (indices, times) = select_indices(&stamps, options)?;
    if indices.is_empty() {
        return Ok(DecodedFile::empty(width, height, channels, variant.pixel));
    }

    let block = file.read_images(&indices).map_err(table_failure)?;
    let block = if block.ndim() == 3 {
        block.insert_axis(Axis(3))
    } else {
        block
    };
    if block.ndim() != 4
        || block.shape()[0] != height
        || block.shape()[1] != width
        || block.shape()[2] != channels
        || block.shape()[3] != indices.len()
    {
        return Err(table_failure(format_args!(
            "unexpected image block shape {:?}",
            block.shape()
        )));
    }

    let file_attrs = if options.suppress_metadata {
        MetaMap::new()
    } else {
        file.file_attributes().map_err(table_failure)?
    };

    let mut frames = Vec::with_capacity(indices.len());
    for (k, &index) in indices.iter().enumerate() {
        let mut pixels: Vec<u8> = block.index_axis(Axis(3), k).iter().copied().collect();
        flip_plane(
            &mut pixels,
            width,
            height,
            channels,
            variant.flip_vertical,
            variant.flip_horizontal,
        );
        let (metadata, timestamp) = if options.suppress_metadata {
            (MetaMap::new(), None)
        } else {
            let mut metadata = file_attrs.clone();
            for (key, value) in file.frame_attributes(index).map_err(table_failure)?.iter() {
                metadata.insert(key, value.clone());
            }
            (metadata, Some(times[k]))
        };
        frames.push(RawFrame {
            pixels: FramePixels::U8(pixels),
            metadata,
            timestamp,
        });
    }

    Ok(DecodedFile {
        frames,
        width,
        height,
        channels,
        pixel: variant.pixel,
        degraded: None,
    })
}

/// Decode one grid container into its per-file record. `Ok(None)` means the
/// whole file fell outside the requested bounds.
pub(crate) fn decode_grid_file(
    filename: &str,
    options: &ReadOptions,
    tables: &dyn TableSource,
) -> Result<Option<GridRecord>, FileFailure> {
    let mut file = tables.open(filename).map_err(table_failure)?;
    let stamps = file.timestamps().map_err(table_failure)?;
    let (indices, times) = select_indices(&stamps, options)?;
    if indices.is_empty() {
        return Ok(None);
    }

    let grid = file.read_grid(&indices).map_err(table_failure)?;
    if grid.ndim() != 3 && grid.ndim() != 4 {
        return Err(table_failure("unexpected grid data shape"));
    }
    // rows come bottom-up off the instrument; present them top-down
    let mut grid = grid;
    grid.invert_axis(Axis(0));
    let grid = grid.as_standard_layout().into_owned();

    let source_info = file.source_info(&indices).map_err(table_failure)?;

    // the fill value lives in the file attributes whether or not metadata
    // was requested
    let file_attrs = file.file_attributes().map_err(table_failure)?;
    let fill_value = match file_attrs.get("fill_value") {
        Some(MetaValue::Number(v)) => *v,
        Some(MetaValue::Text(v)) => v.parse().unwrap_or(DEFAULT_GRID_FILL),
        _ => DEFAULT_GRID_FILL,
    };

    let metadata = if options.suppress_metadata {
        Vec::new()
    } else {
        let mut per_frame = Vec::with_capacity(indices.len());
        for &index in &indices {
            let mut map = file_attrs.clone();
            for (key, value) in file.frame_attributes(index).map_err(table_failure)?.iter() {
                map.insert(key, value.clone());
            }
            per_frame.push(map);
        }
        per_frame
    };

    Ok(Some(GridRecord {
        filename: filename.to_string(),
        grid,
        timestamps: times,
        source_info,
        fill_value,
        metadata,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use ndarray::{Array3, Array4};
    use time::macros::datetime;

    use super::*;
    use crate::dataset::Dataset;
    use crate::variant::variant_for;

    #[derive(Clone, Default)]
    struct FakeTable {
        stamps: Vec<String>,
        images: Option<ArrayD<u8>>,
        grid: Option<ArrayD<f32>>,
        source_info: Vec<(String, ArrayD<f32>)>,
        file_attrs: MetaMap,
        frame_attrs: HashMap<usize, MetaMap>,
        /// Makes `image_geometry` disagree with the stored block.
        geometry_override: Option<(usize, usize, usize)>,
    }

    impl TableFile for FakeTable {
        fn timestamps(&mut self) -> Result<Vec<String>, TableError> {
            Ok(self.stamps.clone())
        }

        fn image_geometry(&mut self) -> Result<(usize, usize, usize), TableError> {
            if let Some(geometry) = self.geometry_override {
                return Ok(geometry);
            }
            let shape = self
                .images
                .as_ref()
                .ok_or_else(|| TableError::format("no image block"))?
                .shape()
                .to_vec();
            Ok((shape[0], shape[1], shape[2]))
        }

        fn read_images(&mut self, indices: &[usize]) -> Result<ArrayD<u8>, TableError> {
            let images = self
                .images
                .as_ref()
                .ok_or_else(|| TableError::format("no image block"))?;
            Ok(images.select(Axis(images.ndim() - 1), indices))
        }

        fn read_grid(&mut self, indices: &[usize]) -> Result<ArrayD<f32>, TableError> {
            let grid = self
                .grid
                .as_ref()
                .ok_or_else(|| TableError::format("no grid block"))?;
            if grid.ndim() < 3 {
                return Ok(grid.clone());
            }
            Ok(grid.select(Axis(grid.ndim() - 1), indices))
        }

        fn source_info(
            &mut self,
            indices: &[usize],
        ) -> Result<Vec<(String, ArrayD<f32>)>, TableError> {
            Ok(self
                .source_info
                .iter()
                .map(|(name, block)| {
                    (name.clone(), block.select(Axis(block.ndim() - 1), indices))
                })
                .collect())
        }

        fn file_attributes(&mut self) -> Result<MetaMap, TableError> {
            Ok(self.file_attrs.clone())
        }

        fn frame_attributes(&mut self, index: usize) -> Result<MetaMap, TableError> {
            Ok(self.frame_attrs.get(&index).cloned().unwrap_or_default())
        }
    }

    struct FakeSource {
        files: HashMap<String, FakeTable>,
    }

    impl FakeSource {
        fn single(name: &str, table: FakeTable) -> Self {
            let mut files = HashMap::new();
            files.insert(name.to_string(), table);
            FakeSource { files }
        }
    }

    impl TableSource for FakeSource {
        fn open(&self, filename: &str) -> Result<Box<dyn TableFile>, TableError> {
            self.files
                .get(filename)
                .cloned()
                .map(|table| Box::new(table) as Box<dyn TableFile>)
                .ok_or_else(|| TableError::format(format!("no such file: {filename}")))
        }
    }

    fn smile_variant() -> &'static CodecVariant {
        variant_for(Dataset::SmileAsiRaw).expect("variant")
    }

    fn image_table() -> FakeTable {
        // 2x2 rgb, 3 frames; every sample of frame k equals 10*k
        let mut images = Array4::<u8>::zeros((2, 2, 3, 3));
        for k in 0..3 {
            images
                .index_axis_mut(Axis(3), k)
                .mapv_inplace(|_| (10 * k) as u8);
        }
        // distinguish the top-left pixel of each frame for flip checks
        for k in 0..3 {
            images[[0, 0, 0, k]] = 200 + k as u8;
        }
        let mut file_attrs = MetaMap::new();
        file_attrs.insert("Site unique ID", "luck");
        file_attrs.insert("Imager unique ID", "smile-07");
        let mut frame_attrs = HashMap::new();
        for k in 0..3 {
            let mut map = MetaMap::new();
            map.insert("Exposure", format!("{k} ms"));
            frame_attrs.insert(k, map);
        }
        FakeTable {
            stamps: vec![
                "2025-01-01 06:00:00.123456 UTC".to_string(),
                "2025-01-01 06:00:03.123456 UTC".to_string(),
                "2025-01-01 06:00:06.123456 UTC".to_string(),
            ],
            images: Some(images.into_dyn()),
            file_attrs,
            frame_attrs,
            ..FakeTable::default()
        }
    }

    #[test]
    fn selects_frames_within_bounds_with_metadata_overlay() {
        let name = "20250101_0600_luck_smile-07_full.h5";
        let source = FakeSource::single(name, image_table());
        let options = ReadOptions {
            start_time: Some(datetime!(2025-01-01 06:00:02 UTC)),
            end_time: Some(datetime!(2025-01-01 06:00:04 UTC)),
            ..ReadOptions::default()
        };
        let decoded =
            decode_image_file(name, smile_variant(), &options, &source).expect("decoded");
        assert_eq!(decoded.frames.len(), 1);
        assert_eq!((decoded.width, decoded.height, decoded.channels), (2, 2, 3));

        let frame = &decoded.frames[0];
        assert_eq!(frame.timestamp, Some(datetime!(2025-01-01 06:00:03.123456 UTC)));
        assert_eq!(frame.metadata.get_text("Site unique ID"), Some("luck"));
        assert_eq!(frame.metadata.get_text("Exposure"), Some("1 ms"));
        // vertical flip moved the marked top-left pixel to the bottom row
        match &frame.pixels {
            FramePixels::U8(data) => {
                assert_eq!(data[2 * 3], 201);
                assert_eq!(data[0], 10);
            }
            other => panic!("unexpected pixels: {other:?}"),
        }
    }

    #[test]
    fn first_record_reads_only_the_leading_frame() {
        let name = "20250101_0600_luck_smile-07_full.h5";
        let source = FakeSource::single(name, image_table());
        let options = ReadOptions {
            first_record_only: true,
            ..ReadOptions::default()
        };
        let decoded =
            decode_image_file(name, smile_variant(), &options, &source).expect("decoded");
        assert_eq!(decoded.frames.len(), 1);
        assert_eq!(
            decoded.frames[0].timestamp,
            Some(datetime!(2025-01-01 06:00:00.123456 UTC)),
        );
    }

    #[test]
    fn empty_selection_keeps_geometry() {
        let name = "20250101_0600_luck_smile-07_full.h5";
        let source = FakeSource::single(name, image_table());
        let options = ReadOptions {
            start_time: Some(datetime!(2026-01-01 00:00:00 UTC)),
            ..ReadOptions::default()
        };
        let decoded =
            decode_image_file(name, smile_variant(), &options, &source).expect("decoded");
        assert!(decoded.frames.is_empty());
        assert_eq!((decoded.width, decoded.height), (2, 2));
    }

    #[test]
    fn filename_prefilter_skips_out_of_range_files_without_opening() {
        // the source holds no files, so reaching open() would fail
        let source = FakeSource { files: HashMap::new() };
        let options = ReadOptions {
            end_time: Some(datetime!(2020-01-01 00:00:00 UTC)),
            ..ReadOptions::default()
        };
        let decoded = decode_image_file(
            "20250101_0600_luck_smile-07_full.h5",
            smile_variant(),
            &options,
            &source,
        )
        .expect("prefiltered");
        assert!(decoded.frames.is_empty());
    }

    #[test]
    fn undated_filename_fails_when_prefiltering() {
        let source = FakeSource { files: HashMap::new() };
        let err = decode_image_file(
            "mystery.h5",
            smile_variant(),
            &ReadOptions::default(),
            &source,
        )
        .expect_err("filename");
        assert_eq!(err.kind, FileErrorKind::MetadataDecode);
        assert_eq!(err.message, "failed to extract timestamp from filename");
    }

    #[test]
    fn malformed_container_timestamp_fails_the_file() {
        let name = "20250101_0600_luck_smile-07_full.h5";
        let mut table = image_table();
        table.stamps[1] = "garbage".to_string();
        let source = FakeSource::single(name, table);
        let err = decode_image_file(name, smile_variant(), &ReadOptions::default(), &source)
            .expect_err("timestamp");
        assert_eq!(err.kind, FileErrorKind::ImageRead);
        assert!(err.message.starts_with("error reading image file:"));
    }

    #[test]
    fn image_block_mismatching_declared_geometry_fails_the_file() {
        let name = "20250101_0600_luck_smile-07_full.h5";
        let mut table = image_table();
        // the container claims 4x4 planes but stores 2x2 frames
        table.geometry_override = Some((4, 4, 3));
        let source = FakeSource::single(name, table);
        let err = decode_image_file(name, smile_variant(), &ReadOptions::default(), &source)
            .expect_err("shape");
        assert_eq!(err.kind, FileErrorKind::ImageRead);
        assert!(err.message.contains("unexpected image block shape"));
    }

    fn grid_table() -> FakeTable {
        let mut grid = Array3::<f32>::zeros((2, 3, 2));
        grid[[0, 0, 0]] = 1.0;
        grid[[1, 0, 0]] = 2.0;
        grid[[0, 0, 1]] = 3.0;
        let mut file_attrs = MetaMap::new();
        file_attrs.insert("fill_value", -1.0_f64);
        file_attrs.insert("grid_algorithm", "mosv001");
        FakeTable {
            stamps: vec![
                "2023-02-24 06:15:00 UTC".to_string(),
                "2023-02-24 06:15:01 UTC".to_string(),
            ],
            grid: Some(grid.into_dyn()),
            source_info: vec![(
                "confidence".to_string(),
                Array3::<f32>::ones((2, 3, 2)).into_dyn(),
            )],
            file_attrs,
            ..FakeTable::default()
        }
    }

    #[test]
    fn grid_record_is_selected_flipped_and_filled() {
        let name = "20230224_0615_grid_mosv001.h5";
        let source = FakeSource::single(name, grid_table());
        let record = decode_grid_file(name, &ReadOptions::default(), &source)
            .expect("decoded")
            .expect("record");
        assert_eq!(record.grid.shape(), &[2, 3, 2]);
        // rows reversed: the 1.0 written at [0,0,0] now sits on the last row
        assert_eq!(record.grid[[1, 0, 0]], 1.0);
        assert_eq!(record.grid[[0, 0, 0]], 2.0);
        assert_eq!(record.fill_value, -1.0);
        assert_eq!(record.timestamps.len(), 2);
        assert_eq!(record.timestamps[0], datetime!(2023-02-24 06:15:00 UTC));
        assert_eq!(record.metadata.len(), 2);
        assert_eq!(
            record.metadata[0].get_text("grid_algorithm"),
            Some("mosv001"),
        );
        // auxiliary blocks keep their native orientation
        assert_eq!(record.source_info[0].1.shape(), &[2, 3, 2]);
    }

    #[test]
    fn grid_outside_bounds_produces_no_record() {
        let name = "20230224_0615_grid_mosv001.h5";
        let source = FakeSource::single(name, grid_table());
        let options = ReadOptions {
            start_time: Some(datetime!(2024-01-01 00:00:00 UTC)),
            ..ReadOptions::default()
        };
        let record = decode_grid_file(name, &options, &source).expect("decoded");
        assert!(record.is_none());
    }

    #[test]
    fn flat_grid_shape_is_rejected() {
        let name = "20230224_0615_grid_mosv001.h5";
        let mut table = grid_table();
        table.grid = Some(ndarray::Array2::<f32>::zeros((2, 3)).into_dyn());
        let source = FakeSource::single(name, table);
        let err = decode_grid_file(name, &ReadOptions::default(), &source).expect_err("shape");
        assert_eq!(err.kind, FileErrorKind::ImageRead);
        assert_eq!(err.message, "error reading image file: unexpected grid data shape");
    }

    #[test]
    fn suppressed_metadata_still_reads_the_fill_value() {
        let name = "20230224_0615_grid_mosv001.h5";
        let source = FakeSource::single(name, grid_table());
        let options = ReadOptions {
            suppress_metadata: true,
            ..ReadOptions::default()
        };
        let record = decode_grid_file(name, &options, &source)
            .expect("decoded")
            .expect("record");
        assert_eq!(record.fill_value, -1.0);
        assert!(record.metadata.is_empty());
        assert!(record.timestamps.is_empty());
    }
}
