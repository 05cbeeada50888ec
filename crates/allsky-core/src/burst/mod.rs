//! TREx RGB burst-mode reading: single PNG frames and tar archives of them.
//!
//! Burst frames carry no embedded metadata block; identity, exposure, and the
//! sub-second timestamp all come from the member file name. Tar archives are
//! extracted into a scoped working directory that is removed on every exit
//! path, and member selection happens before extraction so filtered-out
//! frames are never unpacked.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::warn;
use tempfile::TempDir;

use crate::batch::ReadOptions;
use crate::error::{FileErrorKind, FileFailure};
use crate::filename;
use crate::meta::{self, MetaMap};
use crate::record::{DecodedFile, FramePixels, RawFrame, flip_plane};
use crate::variant::CodecVariant;

const TAR_SUFFIX: &str = ".png.tar";
const PNG_SUFFIX: &str = ".png";

pub(crate) fn decode_file(
    filename: &str,
    variant: &CodecVariant,
    options: &ReadOptions,
) -> Result<DecodedFile, FileFailure> {
    if filename.ends_with(TAR_SUFFIX) {
        decode_archive(filename, variant, options)
    } else if filename.ends_with(PNG_SUFFIX) {
        let names = vec![filename.to_string()];
        let members: Vec<PathBuf> = select_members(&names, options)
            .iter()
            .map(PathBuf::from)
            .collect();
        decode_members(&members, names.len(), variant, options)
    } else {
        Err(FileFailure::new(
            FileErrorKind::UnrecognizedExtension,
            format!("unrecognized file type: {filename}"),
        ))
    }
}

fn decode_archive(
    filename: &str,
    variant: &CodecVariant,
    options: &ReadOptions,
) -> Result<DecodedFile, FileFailure> {
    let names = archive_member_names(filename)?;
    let selected = select_members(&names, options);
    if selected.is_empty() {
        return finish(Vec::new(), None, None, names.len(), variant);
    }

    // the working directory is scoped to this call; dropping it removes the
    // extracted members even on an error return
    let workdir = scoped_workdir(options)?;
    let members = extract_members(filename, &selected, workdir.path())?;
    decode_members(&members, names.len(), variant, options)
}

/// Member names of a burst archive, sorted; frame order follows name order,
/// not archive order.
fn archive_member_names(filename: &str) -> Result<Vec<String>, FileFailure> {
    let file = File::open(filename).map_err(open_failure)?;
    let mut archive = tar::Archive::new(file);
    let mut names = Vec::new();
    for entry in archive.entries().map_err(open_failure)? {
        let entry = entry.map_err(open_failure)?;
        let path = entry.path().map_err(open_failure)?;
        names.push(path.to_string_lossy().into_owned());
    }
    names.sort_unstable();
    Ok(names)
}

/// Candidate members in decode order: first-record mode keeps only the first
/// sorted name, then the time bounds prune by member-name timestamp. Names
/// that do not parse stay selected; deriving their metadata fails properly
/// during decoding.
fn select_members(names: &[String], options: &ReadOptions) -> Vec<String> {
    let mut candidates: Vec<String> = names.to_vec();
    if options.first_record_only {
        candidates.truncate(1);
    }
    let (start, end) = options.effective_bounds();
    if start.is_none() && end.is_none() {
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|name| match filename::burst_frame_metadata(name) {
            Ok((_, ts)) => meta::within_bounds(meta::truncate_to_second(ts), start, end),
            Err(_) => true,
        })
        .collect()
}

fn scoped_workdir(options: &ReadOptions) -> Result<TempDir, FileFailure> {
    let root = options
        .tar_tempdir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&root).map_err(open_failure)?;
    tempfile::Builder::new()
        .prefix("burst-")
        .tempdir_in(&root)
        .map_err(open_failure)
}

/// Unpack only the selected members. Returned paths follow the selection
/// (sorted-name) order.
fn extract_members(
    filename: &str,
    selected: &[String],
    dir: &Path,
) -> Result<Vec<PathBuf>, FileFailure> {
    let wanted: HashSet<&str> = selected.iter().map(String::as_str).collect();
    let file = File::open(filename).map_err(open_failure)?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries().map_err(open_failure)? {
        let mut entry = entry.map_err(open_failure)?;
        let name = entry
            .path()
            .map_err(open_failure)?
            .to_string_lossy()
            .into_owned();
        if wanted.contains(name.as_str()) {
            entry.unpack_in(dir).map_err(open_failure)?;
        }
    }
    Ok(selected.iter().map(|name| dir.join(name)).collect())
}

fn open_failure(err: impl std::fmt::Display) -> FileFailure {
    FileFailure::new(
        FileErrorKind::OpenFailure,
        format!("failed to open file: {err}"),
    )
}

fn decode_members(
    members: &[PathBuf],
    total_members: usize,
    variant: &CodecVariant,
    options: &ReadOptions,
) -> Result<DecodedFile, FileFailure> {
    let mut frames: Vec<RawFrame> = Vec::new();
    let mut degraded: Option<FileFailure> = None;
    let mut geometry: Option<(usize, usize)> = None;

    for member in members {
        let member_name = member.to_string_lossy();
        let (metadata, timestamp) = if options.suppress_metadata {
            (MetaMap::new(), None)
        } else {
            match filename::burst_frame_metadata(&member_name) {
                Ok((metadata, ts)) => (metadata, Some(ts)),
                Err(err) => {
                    // without a member-name timestamp the remaining frames
                    // cannot be aligned either; stop here
                    if !options.quiet {
                        warn!("failed to read metadata from file {member_name:?}: {err}");
                    }
                    degraded = Some(FileFailure::new(
                        FileErrorKind::MetadataDecode,
                        format!("failed to read metadata: {err}"),
                    ));
                    break;
                }
            }
        };

        let (mut pixels, width, height) = match read_png_frame(member, variant.channels) {
            Ok(decoded) => decoded,
            Err(message) => {
                record_image_failure(&mut degraded, options, &member_name, message);
                continue;
            }
        };
        match geometry {
            None => geometry = Some((width, height)),
            Some(dims) if dims != (width, height) => {
                record_image_failure(
                    &mut degraded,
                    options,
                    &member_name,
                    format!(
                        "image data read failure: frame geometry changed from {}x{} to {width}x{height}",
                        dims.0, dims.1
                    ),
                );
                continue;
            }
            Some(_) => {}
        }
        flip_plane(
            &mut pixels,
            width,
            height,
            variant.channels,
            variant.flip_vertical,
            variant.flip_horizontal,
        );
        frames.push(RawFrame {
            pixels: FramePixels::U8(pixels),
            metadata,
            timestamp,
        });
    }

    finish(frames, degraded, geometry, total_members, variant)
}

fn finish(
    frames: Vec<RawFrame>,
    degraded: Option<FileFailure>,
    geometry: Option<(usize, usize)>,
    total_members: usize,
    variant: &CodecVariant,
) -> Result<DecodedFile, FileFailure> {
    if frames.is_empty() {
        if total_members == 0 {
            return Err(FileFailure::new(
                FileErrorKind::NoImageData,
                "no image data".to_string(),
            ));
        }
        if let Some(failure) = degraded {
            // every member was lost to a defect
            return Err(failure);
        }
    }
    let (width, height) = geometry.unwrap_or_else(|| variant.geometry.expected());
    Ok(DecodedFile {
        frames,
        width,
        height,
        channels: variant.channels,
        pixel: variant.pixel,
        degraded,
    })
}

fn record_image_failure(
    degraded: &mut Option<FileFailure>,
    options: &ReadOptions,
    member_name: &str,
    message: String,
) {
    if !options.quiet {
        warn!("{message} (file={member_name:?})");
    }
    *degraded = Some(FileFailure::new(FileErrorKind::ImageRead, message));
}

/// Decode one PNG member to 8-bit samples with the requested channel count.
/// Palette and sub-byte images expand and 16-bit depth narrows; the channel
/// match then drops alpha or replicates luma.
fn read_png_frame(path: &Path, channels: usize) -> Result<(Vec<u8>, usize, usize), String> {
    let file = File::open(path).map_err(|err| format!("image data read failure: {err}"))?;
    let mut decoder = png::Decoder::new(BufReader::new(file));
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder
        .read_info()
        .map_err(|err| format!("image data read failure: {err}"))?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buf)
        .map_err(|err| format!("image data read failure: {err}"))?;
    buf.truncate(info.buffer_size());

    let samples = info.color_type.samples();
    let pixels = match (samples, channels) {
        (s, c) if s == c => buf,
        // drop the alpha channel
        (4, 3) => buf
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        // replicate luma across the colour channels
        (1, 3) => buf.iter().flat_map(|&v| [v, v, v]).collect(),
        (2, 3) => buf
            .chunks_exact(2)
            .flat_map(|px| [px[0], px[0], px[0]])
            .collect(),
        (s, c) => {
            return Err(format!(
                "image data read failure: unexpected channel count {s} (expected {c})"
            ));
        }
    };
    Ok((pixels, info.width as usize, info.height as usize))
}
