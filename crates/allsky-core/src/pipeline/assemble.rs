//! Merging per-file results into the fused frame stack.
//!
//! Offsets come from the real per-file frame counts in input order, so the
//! output buffer is allocated exactly once at its final size. Each kept
//! file owns a disjoint window of the frame axis and the window copies run
//! concurrently without locks.

use ndarray::{ArrayD, IxDyn};
use rayon::ThreadPool;
use time::OffsetDateTime;

use crate::batch::{BatchData, DecodedBatch, ImageStack, ReadOptions};
use crate::error::{FileErrorKind, FileFailure, IssueKind, ProblematicFile};
use crate::meta::MetaMap;
use crate::record::{DecodedFile, FramePixels};
use crate::variant::{CodecVariant, PixelKind};

/// Stack geometry negotiated from the first file that contributed frames.
/// Mixed forms of one dataset can disagree on more than the frame size (the
/// colour imager shipped single-channel 16-bit files alongside
/// three-channel 8-bit ones), so every axis takes part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StackGeometry {
    width: usize,
    height: usize,
    channels: usize,
    pixel: PixelKind,
}

pub(super) fn merge_images(
    files: &[String],
    results: Vec<Result<DecodedFile, FileFailure>>,
    variant: &CodecVariant,
    options: &ReadOptions,
    pool: Option<&ThreadPool>,
) -> DecodedBatch {
    let mut problematic: Vec<ProblematicFile> = Vec::new();
    let mut kept: Vec<DecodedFile> = Vec::new();
    let mut negotiated: Option<StackGeometry> = None;

    for (filename, result) in files.iter().zip(results) {
        let file = match result {
            Ok(file) => file,
            Err(failure) => {
                super::record_error(&mut problematic, filename, failure, options);
                continue;
            }
        };
        if file.frames.is_empty() {
            continue;
        }
        let geometry = StackGeometry {
            width: file.width,
            height: file.height,
            channels: file.channels,
            pixel: file.pixel,
        };
        match negotiated {
            None => negotiated = Some(geometry),
            Some(expected) if expected != geometry => {
                super::record_error(
                    &mut problematic,
                    filename,
                    FileFailure::new(
                        FileErrorKind::ImageRead,
                        format!(
                            "mismatched image geometry ({}x{}x{} {} vs {}x{}x{} {})",
                            geometry.width,
                            geometry.height,
                            geometry.channels,
                            pixel_name(geometry.pixel),
                            expected.width,
                            expected.height,
                            expected.channels,
                            pixel_name(expected.pixel),
                        ),
                    ),
                    options,
                );
                continue;
            }
            Some(_) => {}
        }
        if let Some(failure) = file.degraded.clone() {
            problematic.push(ProblematicFile::new(filename, failure, IssueKind::Warning));
        }
        kept.push(file);
    }

    let geometry = negotiated.unwrap_or_else(|| {
        let (width, height) = variant.geometry.expected();
        StackGeometry {
            width,
            height,
            channels: variant.channels,
            pixel: variant.pixel,
        }
    });

    let stack = match geometry.pixel {
        PixelKind::U8 => ImageStack::U8(fused(&kept, geometry, pool, u8_frame)),
        PixelKind::U16 => ImageStack::U16(fused(&kept, geometry, pool, u16_frame)),
    };

    let mut timestamps: Vec<OffsetDateTime> = Vec::new();
    let mut metadata: Vec<MetaMap> = Vec::new();
    if !options.suppress_metadata {
        for file in &mut kept {
            for frame in file.frames.drain(..) {
                if let Some(stamp) = frame.timestamp {
                    timestamps.push(stamp);
                }
                metadata.push(frame.metadata);
            }
        }
    }

    DecodedBatch {
        data: BatchData::Images(stack),
        timestamps,
        metadata,
        problematic_files: problematic,
    }
}

fn pixel_name(pixel: PixelKind) -> &'static str {
    match pixel {
        PixelKind::U8 => "u8",
        PixelKind::U16 => "u16",
    }
}

/// Copy every kept file into one frame-major buffer, then permute the axes
/// to the frame-axis-last shape. The permutation adjusts strides only; no
/// data moves after the window copies.
fn fused<T>(
    files: &[DecodedFile],
    geometry: StackGeometry,
    pool: Option<&ThreadPool>,
    frame_samples: fn(&FramePixels) -> &[T],
) -> ArrayD<T>
where
    T: Copy + Default + Send + Sync,
{
    let frame_len = geometry.height * geometry.width * geometry.channels;
    let total: usize = files.iter().map(|file| file.frames.len()).sum();
    let mut buffer = vec![T::default(); total * frame_len];
    match pool {
        Some(pool) => pool.install(|| copy_windows(&mut buffer, files, frame_len, frame_samples)),
        None => {
            let mut rest: &mut [T] = &mut buffer;
            for file in files {
                let (window, tail) = rest.split_at_mut(file.frames.len() * frame_len);
                rest = tail;
                copy_file(window, file, frame_len, frame_samples);
            }
        }
    }
    let (shape, order): (Vec<usize>, Vec<usize>) = if geometry.channels > 1 {
        (
            vec![total, geometry.height, geometry.width, geometry.channels],
            vec![1, 2, 3, 0],
        )
    } else {
        (vec![total, geometry.height, geometry.width], vec![1, 2, 0])
    };
    match ArrayD::from_shape_vec(IxDyn(&shape), buffer) {
        Ok(array) => array.permuted_axes(IxDyn(&order)),
        // the buffer length always matches the shape product
        Err(_) => ArrayD::default(IxDyn(&vec![0; shape.len()])),
    }
}

fn copy_windows<T>(
    buffer: &mut [T],
    files: &[DecodedFile],
    frame_len: usize,
    frame_samples: fn(&FramePixels) -> &[T],
) where
    T: Copy + Send + Sync,
{
    rayon::scope(|scope| {
        let mut rest: &mut [T] = buffer;
        for file in files {
            let (window, tail) = rest.split_at_mut(file.frames.len() * frame_len);
            rest = tail;
            scope.spawn(move |_| copy_file(window, file, frame_len, frame_samples));
        }
    });
}

fn copy_file<T: Copy>(
    window: &mut [T],
    file: &DecodedFile,
    frame_len: usize,
    frame_samples: fn(&FramePixels) -> &[T],
) {
    for (index, frame) in file.frames.iter().enumerate() {
        window[index * frame_len..(index + 1) * frame_len]
            .copy_from_slice(frame_samples(&frame.pixels));
    }
}

// pixel kinds are screened during geometry negotiation, before any copy
fn u8_frame(pixels: &FramePixels) -> &[u8] {
    match pixels {
        FramePixels::U8(samples) => samples,
        FramePixels::U16(_) => &[],
    }
}

fn u16_frame(pixels: &FramePixels) -> &[u16] {
    match pixels {
        FramePixels::U16(samples) => samples,
        FramePixels::U8(_) => &[],
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::dataset::Dataset;
    use crate::record::RawFrame;
    use crate::variant::variant_for;

    fn themis() -> &'static CodecVariant {
        variant_for(Dataset::ThemisAsiRaw).expect("variant")
    }

    fn frame(samples: Vec<u16>, seq: f64, stamp: OffsetDateTime) -> RawFrame {
        let mut metadata = MetaMap::new();
        metadata.insert("seq", seq);
        RawFrame {
            pixels: FramePixels::U16(samples),
            metadata,
            timestamp: Some(stamp),
        }
    }

    fn file(frames: Vec<RawFrame>, width: usize, height: usize) -> DecodedFile {
        DecodedFile {
            frames,
            width,
            height,
            channels: 1,
            pixel: PixelKind::U16,
            degraded: None,
        }
    }

    fn unpack_u16(batch: &DecodedBatch) -> &ArrayD<u16> {
        match &batch.data {
            BatchData::Images(ImageStack::U16(array)) => array,
            other => panic!("expected a u16 stack, got {other:?}"),
        }
    }

    #[test]
    fn files_merge_in_input_order_with_exact_size() {
        let t0 = datetime!(2021-02-05 06:00:00 UTC);
        let first = file(
            vec![
                frame(vec![1, 2], 0.0, t0),
                frame(vec![3, 4], 1.0, t0 + time::Duration::seconds(3)),
            ],
            2,
            1,
        );
        let second = file(
            vec![frame(vec![5, 6], 2.0, t0 + time::Duration::seconds(6))],
            2,
            1,
        );
        let files = vec!["a.pgm".to_string(), "b.pgm".to_string()];
        let batch = merge_images(
            &files,
            vec![Ok(first), Ok(second)],
            themis(),
            &ReadOptions::default(),
            None,
        );
        let array = unpack_u16(&batch);
        assert_eq!(array.shape(), &[1, 2, 3]);
        assert_eq!(array[[0, 0, 0]], 1);
        assert_eq!(array[[0, 1, 0]], 2);
        assert_eq!(array[[0, 0, 1]], 3);
        assert_eq!(array[[0, 0, 2]], 5);
        assert_eq!(array[[0, 1, 2]], 6);
        assert_eq!(batch.timestamps.len(), 3);
        assert!(batch.timestamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(batch.metadata.len(), 3);
        assert_eq!(batch.metadata[2].get("seq"), Some(&crate::meta::MetaValue::Number(2.0)));
        assert!(batch.problematic_files.is_empty());
    }

    #[test]
    fn failed_file_is_recorded_and_skipped() {
        let t0 = datetime!(2021-02-05 06:00:00 UTC);
        let good = file(vec![frame(vec![7, 8], 0.0, t0)], 2, 1);
        let files = vec!["bad.pgm".to_string(), "good.pgm".to_string()];
        let batch = merge_images(
            &files,
            vec![
                Err(FileFailure::new(
                    FileErrorKind::OpenFailure,
                    "failed to open file: missing",
                )),
                Ok(good),
            ],
            themis(),
            &ReadOptions {
                quiet: true,
                ..ReadOptions::default()
            },
            None,
        );
        assert_eq!(unpack_u16(&batch).shape(), &[1, 2, 1]);
        assert_eq!(batch.problematic_files.len(), 1);
        assert_eq!(batch.problematic_files[0].filename, "bad.pgm");
        assert_eq!(batch.problematic_files[0].error_kind, IssueKind::Error);
    }

    #[test]
    fn geometry_mismatch_drops_the_later_file() {
        let t0 = datetime!(2021-02-05 06:00:00 UTC);
        let narrow = file(vec![frame(vec![1, 2], 0.0, t0)], 2, 1);
        let wide = file(vec![frame(vec![7, 8, 9], 1.0, t0)], 3, 1);
        let files = vec!["narrow.pgm".to_string(), "wide.pgm".to_string()];
        let batch = merge_images(
            &files,
            vec![Ok(narrow), Ok(wide)],
            themis(),
            &ReadOptions {
                quiet: true,
                ..ReadOptions::default()
            },
            None,
        );
        assert_eq!(unpack_u16(&batch).shape(), &[1, 2, 1]);
        assert_eq!(batch.problematic_files.len(), 1);
        assert!(
            batch.problematic_files[0]
                .error_message
                .starts_with("mismatched image geometry"),
        );
    }

    #[test]
    fn pixel_type_mismatch_is_problematic() {
        let t0 = datetime!(2021-02-05 06:00:00 UTC);
        let sixteen = file(vec![frame(vec![1, 2], 0.0, t0)], 2, 1);
        let eight = DecodedFile {
            frames: vec![RawFrame {
                pixels: FramePixels::U8(vec![9, 9]),
                metadata: MetaMap::new(),
                timestamp: Some(t0),
            }],
            width: 2,
            height: 1,
            channels: 1,
            pixel: PixelKind::U8,
            degraded: None,
        };
        let files = vec!["deep.pgm".to_string(), "shallow.png".to_string()];
        let batch = merge_images(
            &files,
            vec![Ok(sixteen), Ok(eight)],
            themis(),
            &ReadOptions {
                quiet: true,
                ..ReadOptions::default()
            },
            None,
        );
        assert_eq!(unpack_u16(&batch).shape(), &[1, 2, 1]);
        assert_eq!(batch.problematic_files.len(), 1);
    }

    #[test]
    fn degraded_file_still_contributes_with_a_warning() {
        let t0 = datetime!(2021-02-05 06:00:00 UTC);
        let mut damaged = file(vec![frame(vec![1, 2], 0.0, t0)], 2, 1);
        damaged.degraded = Some(FileFailure::new(
            FileErrorKind::ImageRead,
            "image data read failure: early end of file",
        ));
        let files = vec!["damaged.pgm".to_string()];
        let batch = merge_images(
            &files,
            vec![Ok(damaged)],
            themis(),
            &ReadOptions::default(),
            None,
        );
        assert_eq!(unpack_u16(&batch).shape(), &[1, 2, 1]);
        assert_eq!(batch.problematic_files.len(), 1);
        assert_eq!(batch.problematic_files[0].error_kind, IssueKind::Warning);
    }

    #[test]
    fn suppressed_metadata_keeps_frames_but_empties_the_lists() {
        let bare = DecodedFile {
            frames: vec![
                RawFrame {
                    pixels: FramePixels::U16(vec![1, 2]),
                    metadata: MetaMap::new(),
                    timestamp: None,
                },
                RawFrame {
                    pixels: FramePixels::U16(vec![3, 4]),
                    metadata: MetaMap::new(),
                    timestamp: None,
                },
            ],
            width: 2,
            height: 1,
            channels: 1,
            pixel: PixelKind::U16,
            degraded: None,
        };
        let files = vec!["a.pgm".to_string()];
        let batch = merge_images(
            &files,
            vec![Ok(bare)],
            themis(),
            &ReadOptions {
                suppress_metadata: true,
                ..ReadOptions::default()
            },
            None,
        );
        assert_eq!(unpack_u16(&batch).shape(), &[1, 2, 2]);
        assert!(batch.timestamps.is_empty());
        assert!(batch.metadata.is_empty());
    }

    #[test]
    fn no_contributing_files_fall_back_to_the_expected_shape() {
        let batch = merge_images(&[], Vec::new(), themis(), &ReadOptions::default(), None);
        let (width, height) = themis().geometry.expected();
        assert_eq!(unpack_u16(&batch).shape(), &[height, width, 0]);
        assert!(batch.timestamps.is_empty());
        assert!(batch.problematic_files.is_empty());
    }

    #[test]
    fn multichannel_frames_keep_sample_order() {
        let colour = DecodedFile {
            frames: vec![RawFrame {
                pixels: FramePixels::U8(vec![10, 20, 30]),
                metadata: MetaMap::new(),
                timestamp: Some(datetime!(2023-03-22 05:34:05 UTC)),
            }],
            width: 1,
            height: 1,
            channels: 3,
            pixel: PixelKind::U8,
            degraded: None,
        };
        let files = vec!["frame.png".to_string()];
        let batch = merge_images(
            &files,
            vec![Ok(colour)],
            variant_for(Dataset::TrexRgbRawBurst).expect("variant"),
            &ReadOptions::default(),
            None,
        );
        let array = match &batch.data {
            BatchData::Images(ImageStack::U8(array)) => array,
            other => panic!("expected a u8 stack, got {other:?}"),
        };
        assert_eq!(array.shape(), &[1, 1, 3, 1]);
        assert_eq!(array[[0, 0, 0, 0]], 10);
        assert_eq!(array[[0, 0, 1, 0]], 20);
        assert_eq!(array[[0, 0, 2, 0]], 30);
    }

    #[test]
    fn concurrent_and_sequential_merges_agree() {
        let t0 = datetime!(2021-02-05 06:00:00 UTC);
        let build = || {
            (0..6)
                .map(|i| {
                    Ok(file(
                        vec![frame(
                            vec![i as u16, i as u16 + 100],
                            f64::from(i),
                            t0 + time::Duration::seconds(i64::from(i) * 3),
                        )],
                        2,
                        1,
                    ))
                })
                .collect::<Vec<Result<DecodedFile, FileFailure>>>()
        };
        let files: Vec<String> = (0..6).map(|i| format!("f{i}.pgm")).collect();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(3)
            .build()
            .expect("pool");
        let sequential = merge_images(&files, build(), themis(), &ReadOptions::default(), None);
        let threaded = merge_images(
            &files,
            build(),
            themis(),
            &ReadOptions::default(),
            Some(&pool),
        );
        assert_eq!(unpack_u16(&sequential), unpack_u16(&threaded));
        assert_eq!(sequential.timestamps, threaded.timestamps);
    }
}
