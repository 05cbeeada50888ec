//! Filename-derived facts: start times, site/device fallbacks, burst frame
//! metadata, riometer site codes.
//!
//! Several instrument formats encode identity and timing in the file name
//! rather than (or in addition to) the stream itself. Keeping the extraction
//! here as plain functions makes the inference rules testable on their own.

use std::path::Path;

use thiserror::Error;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::meta::{MetaMap, format_metadata_timestamp};
use crate::variant::SiteFallback;

/// Riometer site codes: full four-letter site unique ID paired with the
/// three-letter code older file names carry.
const RIOMETER_SITE_CODES: &[(&str, &str)] = &[
    ("chur", "chu"),
    ("cont", "con"),
    ("daws", "daw"),
    ("arvi", "esk"),
    ("fsim", "sim"),
    ("fsmi", "smi"),
    ("gill", "gil"),
    ("isll", "isl"),
    ("mcmu", "mcm"),
    ("pina", "pin"),
    ("rabb", "rab"),
    ("rank", "ran"),
    ("talo", "tal"),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum NameError {
    #[error("file name has too few underscore-delimited tokens: {0}")]
    TooFewTokens(String),
    #[error("invalid timestamp tokens in file name: {0}")]
    BadTimestamp(String),
    #[error("invalid exposure token in file name: {0}")]
    BadExposure(String),
}

pub(crate) fn basename(filename: &str) -> &str {
    Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(filename)
}

fn parse_compact_date(token: &str) -> Option<Date> {
    if token.len() != 8 {
        return None;
    }
    let year: i32 = token.get(0..4)?.parse().ok()?;
    let month: u8 = token.get(4..6)?.parse().ok()?;
    let day: u8 = token.get(6..8)?.parse().ok()?;
    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}

fn parse_compact_time(token: &str) -> Option<Time> {
    if token.len() != 6 {
        return None;
    }
    let hour: u8 = token.get(0..2)?.parse().ok()?;
    let minute: u8 = token.get(2..4)?.parse().ok()?;
    let second: u8 = token.get(4..6)?.parse().ok()?;
    Time::from_hms(hour, minute, second).ok()
}

/// Fractional-second token: one to six digits, zero-padded on the right to
/// microseconds.
fn parse_fractional_micros(token: &str) -> Option<u32> {
    if token.is_empty() || token.len() > 6 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    format!("{token:0<6}").parse().ok()
}

/// Nominal start time encoded in the leading `YYYYMMDD_hhmm` of a basename.
/// Returns `None` when the name does not carry one.
pub(crate) fn file_start_time(filename: &str) -> Option<OffsetDateTime> {
    let base = basename(filename);
    let stamp = base.get(0..13)?;
    if stamp.as_bytes()[8] != b'_' {
        return None;
    }
    let date = parse_compact_date(stamp.get(0..8)?)?;
    let hour: u8 = stamp.get(9..11)?.parse().ok()?;
    let minute: u8 = stamp.get(11..13)?.parse().ok()?;
    Some(date.with_hms(hour, minute, 0).ok()?.assume_utc())
}

/// Site/device unique IDs inferred from underscore-delimited name tokens.
/// Position conventions differ per instrument; spectrograph names shift the
/// IDs right by one for dark-frame and unstacked files.
pub(crate) fn site_device_fallback(
    fallback: SiteFallback,
    filename: &str,
) -> Option<(String, String)> {
    let base = basename(filename);
    let tokens: Vec<&str> = base.split('_').collect();
    let (site, device) = match fallback {
        SiteFallback::None => return None,
        SiteFallback::Tokens { site, device } => (site, device),
        SiteFallback::SpectrographTokens => match tokens.len() {
            5 => (2, 3),
            n if n > 5 => (3, 4),
            _ => return None,
        },
    };
    Some(((*tokens.get(site)?).to_string(), (*tokens.get(device)?).to_string()))
}

/// Burst PNG frames have no embedded metadata block; everything comes from
/// the member name, e.g. `20230322_053405_057114_gill_rgb-04_3ms_burst.png`.
pub(crate) fn burst_frame_metadata(
    member_name: &str,
) -> Result<(MetaMap, OffsetDateTime), NameError> {
    let base = basename(member_name);
    let tokens: Vec<&str> = base.split('_').collect();
    if tokens.len() < 7 {
        return Err(NameError::TooFewTokens(base.to_string()));
    }

    let site_uid = tokens[3];
    let device_uid = tokens[4];
    let exposure_ms: f64 = tokens[5]
        .strip_suffix("ms")
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| NameError::BadExposure(base.to_string()))?;
    let mode_uid = tokens[6].strip_suffix(".png").unwrap_or(tokens[6]);

    let date = parse_compact_date(tokens[0])
        .ok_or_else(|| NameError::BadTimestamp(base.to_string()))?;
    let time = parse_compact_time(tokens[1])
        .ok_or_else(|| NameError::BadTimestamp(base.to_string()))?;
    let mut timestamp = PrimitiveDateTime::new(date, time).assume_utc();
    if base.contains("burst") || base.contains("mode-b") {
        let micros = parse_fractional_micros(tokens[2])
            .ok_or_else(|| NameError::BadTimestamp(base.to_string()))?;
        timestamp = timestamp
            .replace_microsecond(micros)
            .map_err(|_| NameError::BadTimestamp(base.to_string()))?;
    }

    let mut metadata = MetaMap::new();
    metadata.insert("project_unique_id", "trex");
    metadata.insert("site_unique_id", site_uid);
    metadata.insert("imager_unique_id", device_uid);
    metadata.insert("mode_unique_id", mode_uid);
    metadata.insert(
        "image_request_start_timestamp",
        format_metadata_timestamp(timestamp),
    );
    metadata.insert(
        "subframe_requested_exposure",
        format!("{exposure_ms:.3} ms"),
    );

    Ok((metadata, timestamp))
}

/// Riometer site unique ID from the file name. Older names start with a
/// three-letter code followed by an underscore; newer ones embed the full
/// code after a `rio-` device marker. `None` means undetermined.
pub(crate) fn riometer_site(filename: &str) -> Option<String> {
    let base = basename(filename);
    if base.as_bytes().get(3) == Some(&b'_') {
        let prefix = base.get(0..3)?;
        RIOMETER_SITE_CODES
            .iter()
            .find(|(_, code)| *code == prefix)
            .map(|(site, _)| (*site).to_string())
    } else {
        let idx = base.find("rio-")?;
        base.get(idx + 4..idx + 8).map(str::to_ascii_lowercase)
    }
}
