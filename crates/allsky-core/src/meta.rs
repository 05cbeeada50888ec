//! Per-frame metadata maps and the timestamp formats shared by the readers.
//!
//! Metadata is an insertion-ordered string-keyed map: downstream consumers
//! iterate it in file order, so a hash map would lose information the files
//! actually carry. Values are strings, numbers, or lists of strings (lists
//! appear when a format repeats a key within one frame).

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// One metadata value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetaValue {
    Text(String),
    Number(f64),
    List(Vec<String>),
}

impl MetaValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Number(value)
    }
}

/// Insertion-ordered string-keyed metadata map.
///
/// Inserting an existing key overwrites the value in place, keeping the key's
/// original position. `append` implements the collect policy used by formats
/// that repeat keys: the second occurrence turns the value into a list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaMap {
    entries: Vec<(String, MetaValue)>,
}

impl MetaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetaValue::as_text)
    }

    /// Insert with overwrite semantics; the key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Insert with collect semantics: a repeated key accumulates its values
    /// into a list instead of overwriting.
    pub fn append(&mut self, key: impl Into<String>, value: String) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => match existing {
                MetaValue::List(items) => items.push(value),
                MetaValue::Text(prev) => {
                    *existing = MetaValue::List(vec![std::mem::take(prev), value]);
                }
                MetaValue::Number(n) => {
                    *existing = MetaValue::List(vec![n.to_string(), value]);
                }
            },
            None => self.entries.push((key, MetaValue::Text(value))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Serialize for MetaMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Format of the `Image request start` metadata value and of the timestamps
/// stored inside tabular containers, e.g. `2022-01-01 06:00:00.123456 UTC`.
pub(crate) const METADATA_TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond] UTC");

/// Same as [`METADATA_TIMESTAMP`] but without fractional seconds; grid
/// containers store timestamps at second precision.
pub(crate) const METADATA_TIMESTAMP_WHOLE: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second] UTC");

/// Fixed six-digit fractional form, used when synthesizing metadata values.
pub(crate) const METADATA_TIMESTAMP_MICROS: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6] UTC");

/// Parse a metadata timestamp value, with or without fractional seconds.
/// The stored value is naive; the instruments record UTC.
pub(crate) fn parse_metadata_timestamp(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value, METADATA_TIMESTAMP)
        .or_else(|_| PrimitiveDateTime::parse(value, METADATA_TIMESTAMP_WHOLE))
        .map(|dt| dt.assume_utc())
        .ok()
}

pub(crate) fn format_metadata_timestamp(ts: OffsetDateTime) -> String {
    ts.format(METADATA_TIMESTAMP_MICROS)
        .unwrap_or_else(|_| ts.to_string())
}

/// Truncate to whole seconds for bound comparison. Stored timestamps keep
/// their full precision; only the filter comparison drops microseconds.
pub(crate) fn truncate_to_second(ts: OffsetDateTime) -> OffsetDateTime {
    ts.replace_nanosecond(0).unwrap_or(ts)
}

/// Truncate to whole minutes; filename prefilters carry minute precision.
pub(crate) fn truncate_to_minute(ts: OffsetDateTime) -> OffsetDateTime {
    truncate_to_second(ts).replace_second(0).unwrap_or(ts)
}

/// Inclusive containment test against optional bounds.
pub(crate) fn within_bounds(
    ts: OffsetDateTime,
    start: Option<OffsetDateTime>,
    end: Option<OffsetDateTime>,
) -> bool {
    start.is_none_or(|s| ts >= s) && end.is_none_or(|e| ts <= e)
}
