//! NORSTAR riometer text products: k0 raw-signal and k2 absorption files.
//!
//! These are plain ASCII tables, one row per second, preceded by a
//! `#`-prefixed header block. A riometer file decodes to one structured
//! record; records never merge across files the way imager frames do.

use std::io::BufRead;

use log::warn;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::batch::ReadOptions;
use crate::error::{FileErrorKind, FileFailure};
use crate::filename;
use crate::meta::{self, MetaMap};
use crate::stream;
use crate::variant::{Compression, ExtensionRule};

const EXTENSIONS: &[ExtensionRule] = &[
    ExtensionRule {
        suffix: "txt.gz",
        compression: Compression::Gzip,
    },
    ExtensionRule {
        suffix: "txt.bz2",
        compression: Compression::Bzip2,
    },
    ExtensionRule {
        suffix: "txt",
        compression: Compression::Plain,
    },
];

/// A run of twelve dashes ends the header block.
const HEADER_END: &str = "------------";

/// Header processing dates arrive in ctime form, e.g.
/// `Fri Jul 23 18:59:02 2021`; stored metadata carries the ISO form.
const PROCESSING_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short] [month repr:short] [day padding:none] [hour]:[minute]:[second] [year]"
);

const PROCESSING_DATE_ISO: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// One decoded riometer file. `absorption` is present only for the k2
/// product; both data vectors share the length of `timestamps`.
#[derive(Debug, Clone)]
pub struct RiometerRecord {
    pub filename: String,
    pub timestamps: Vec<OffsetDateTime>,
    pub raw_signal: Vec<f32>,
    pub absorption: Option<Vec<f32>>,
    pub metadata: MetaMap,
}

/// Per-file decode result: the record plus the recovered defect, if any,
/// that should surface as a warning entry.
#[derive(Debug)]
pub(crate) struct DecodedRiometer {
    pub record: RiometerRecord,
    pub degraded: Option<FileFailure>,
}

/// Which riometer product a file holds, decided from its name. The dataset
/// alone cannot distinguish archived naming schemes, so both riometer
/// datasets share this detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    K0,
    K2,
}

impl FileKind {
    fn detect(filename: &str) -> Option<FileKind> {
        let base = filename::basename(filename);
        if base.contains("_k0_") || base.contains("v0.txt") {
            Some(FileKind::K0)
        } else if base.contains("_k2_") || base.contains("v1a.txt") {
            Some(FileKind::K2)
        } else {
            None
        }
    }

    fn columns(self) -> usize {
        match self {
            FileKind::K0 => 3,
            FileKind::K2 => 4,
        }
    }
}

/// Decode one riometer text file.
pub(crate) fn decode_file(
    filename: &str,
    options: &ReadOptions,
) -> Result<DecodedRiometer, FileFailure> {
    let Some(kind) = FileKind::detect(filename) else {
        return Err(FileFailure::new(
            FileErrorKind::UnrecognizedExtension,
            "error reading file, unknown file type",
        ));
    };
    let mut reader = stream::open_stream(EXTENSIONS, filename)?;
    decode_stream(&mut reader, kind, filename, options)
}

fn decode_stream(
    reader: &mut impl BufRead,
    kind: FileKind,
    filename: &str,
    options: &ReadOptions,
) -> Result<DecodedRiometer, FileFailure> {
    let mut metadata = MetaMap::new();
    let mut deferred_site: Option<String> = None;
    let mut timestamps = Vec::new();
    let mut raw_signal: Vec<f32> = Vec::new();
    let mut absorption: Vec<f32> = Vec::new();
    let mut in_header = true;

    let mut line = String::new();
    loop {
        line.clear();
        let n = match reader.read_line(&mut line) {
            Ok(n) => n,
            Err(err) if in_header && !options.suppress_metadata => {
                return Err(metadata_failure(err));
            }
            Err(err) => return Err(timestamp_failure(err)),
        };
        if n == 0 {
            break;
        }
        if in_header {
            if line.starts_with('#') {
                if line.contains(HEADER_END) {
                    in_header = false;
                } else if !options.suppress_metadata {
                    parse_header_line(&line, &mut metadata, &mut deferred_site)
                        .map_err(metadata_failure)?;
                }
                continue;
            }
            in_header = false;
        }
        let row = line.trim();
        if row.is_empty() || row.starts_with('#') {
            continue;
        }
        let Some((stamp, signal, db)) = parse_data_row(row, kind).map_err(timestamp_failure)?
        else {
            continue;
        };
        // Bounds always apply here; the timestamps are data columns, not
        // metadata, so suppressing metadata does not disable them.
        if !meta::within_bounds(stamp, options.start_time, options.end_time) {
            continue;
        }
        timestamps.push(stamp);
        raw_signal.push(signal);
        if let Some(db) = db {
            absorption.push(db);
        }
    }

    let degraded = if options.suppress_metadata {
        None
    } else {
        resolve_site(filename, deferred_site, &mut metadata, options.quiet)
    };

    Ok(DecodedRiometer {
        record: RiometerRecord {
            filename: filename.to_string(),
            timestamps,
            raw_signal,
            absorption: match kind {
                FileKind::K0 => None,
                FileKind::K2 => Some(absorption),
            },
            metadata,
        },
        degraded,
    })
}

fn metadata_failure(err: impl std::fmt::Display) -> FileFailure {
    FileFailure::new(
        FileErrorKind::MetadataDecode,
        format!("error reading metadata: {err}"),
    )
}

fn timestamp_failure(err: impl std::fmt::Display) -> FileFailure {
    FileFailure::new(
        FileErrorKind::ImageRead,
        format!("error processing timestamps: {err}"),
    )
}

/// One `#` header line. Most are `Key: value` pairs; the version line and
/// the dashed summary line carry no colon and keep their whole text.
fn parse_header_line(
    raw: &str,
    metadata: &mut MetaMap,
    deferred_site: &mut Option<String>,
) -> Result<(), String> {
    let line = raw.trim();
    let line = line.strip_prefix('#').unwrap_or(line);
    if line.contains("Version") {
        metadata.insert("version", line.trim());
        return Ok(());
    }
    if line.contains("----") {
        metadata.insert("summary", line.trim());
        return Ok(());
    }
    let (key, value) = line
        .split_once(':')
        .map(|(key, value)| (key.trim(), value.trim()))
        .ok_or_else(|| format!("malformed header line (line={line:?})"))?;
    let lower = line.to_ascii_lowercase();
    if lower.contains("processing date") {
        metadata.insert("processing_date", reformat_processing_date(value)?);
    } else if lower.contains("site unique id") {
        // Not all files carry this line; it is deferred so the resolved
        // value always lands at the end of the map.
        *deferred_site = Some(value.to_ascii_lowercase());
    } else {
        metadata.insert(key.to_ascii_lowercase().replace(' ', "_"), value);
    }
    Ok(())
}

fn reformat_processing_date(value: &str) -> Result<String, String> {
    let stamp = PrimitiveDateTime::parse(value, PROCESSING_DATE)
        .map_err(|err| format!("bad processing date (value={value:?}): {err}"))?;
    stamp
        .format(PROCESSING_DATE_ISO)
        .map_err(|err| format!("bad processing date (value={value:?}): {err}"))
}

/// One data row: `dd/mm/yy hh:mm:ss [absorption] raw_signal`. Returns
/// `None` for rows stamped in the 24th hour, which the files carry at the
/// day boundary; those are dropped rather than wrapped into the next day.
fn parse_data_row(
    row: &str,
    kind: FileKind,
) -> Result<Option<(OffsetDateTime, f32, Option<f32>)>, String> {
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() != kind.columns() {
        return Err(format!(
            "expected {} columns, found {} (line={row:?})",
            kind.columns(),
            fields.len(),
        ));
    }
    let signal = parse_signal(fields[kind.columns() - 1], row)?;
    let db = match kind {
        FileKind::K0 => None,
        FileKind::K2 => Some(parse_signal(fields[2], row)?),
    };
    if fields[1].get(..2) == Some("24") {
        return Ok(None);
    }
    let stamp = parse_row_timestamp(fields[0], fields[1])?;
    Ok(Some((stamp, signal, db)))
}

fn parse_signal(token: &str, row: &str) -> Result<f32, String> {
    token
        .parse()
        .map_err(|_| format!("bad numeric column (line={row:?})"))
}

/// Row timestamps carry a two-digit year; years 00 through 68 land in the
/// 2000s, the rest in the 1900s.
fn parse_row_timestamp(date: &str, time: &str) -> Result<OffsetDateTime, String> {
    let invalid = || format!("bad row timestamp (date={date:?}, time={time:?})");
    let (day, month, year) = split3(date, '/').ok_or_else(invalid)?;
    let (hour, minute, second) = split3(time, ':').ok_or_else(invalid)?;
    let year: i32 = year.parse().map_err(|_| invalid())?;
    if !(0..=99).contains(&year) {
        return Err(invalid());
    }
    let year = if year <= 68 { 2000 + year } else { 1900 + year };
    let month = month
        .parse::<u8>()
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .ok_or_else(invalid)?;
    let day: u8 = day.parse().map_err(|_| invalid())?;
    let date = Date::from_calendar_date(year, month, day).map_err(|_| invalid())?;
    let hour: u8 = hour.parse().map_err(|_| invalid())?;
    let minute: u8 = minute.parse().map_err(|_| invalid())?;
    let second: u8 = second.parse().map_err(|_| invalid())?;
    let time = Time::from_hms(hour, minute, second).map_err(|_| invalid())?;
    Ok(PrimitiveDateTime::new(date, time).assume_utc())
}

fn split3(text: &str, sep: char) -> Option<(&str, &str, &str)> {
    let mut parts = text.split(sep);
    let triple = (parts.next()?, parts.next()?, parts.next()?);
    match parts.next() {
        Some(_) => None,
        None => Some(triple),
    }
}

/// The resolved site unique ID is appended after the header block: the
/// deferred header value wins, then the file name, then `"unknown"` plus a
/// warning entry (an ambiguous inference is flagged, not defaulted silently).
fn resolve_site(
    filename: &str,
    deferred: Option<String>,
    metadata: &mut MetaMap,
    quiet: bool,
) -> Option<FileFailure> {
    match deferred.or_else(|| filename::riometer_site(filename)) {
        Some(site) => {
            metadata.insert("site_unique_id", site);
            None
        }
        None => {
            if !quiet {
                warn!("unable to determine site unique id (file={filename:?})");
            }
            metadata.insert("site_unique_id", "unknown");
            Some(FileFailure::new(
                FileErrorKind::MetadataDecode,
                "unable to determine site unique id",
            ))
        }
    }
}
