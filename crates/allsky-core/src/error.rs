//! Error taxonomy.
//!
//! Per-file failures are data, not exceptions: workers capture them as
//! [`FileFailure`] values and the pipeline turns them into
//! [`ProblematicFile`] entries on the returned batch. The single fatal error
//! is requesting a dataset with no registered codec variant, which indicates
//! a caller bug rather than a data-quality problem.

use serde::Serialize;
use thiserror::Error;

/// Classification of a per-file decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileErrorKind {
    /// Missing file, permission denied, or an unreadable compressed stream.
    OpenFailure,
    /// The file extension maps to no reader for the dataset.
    UnrecognizedExtension,
    /// Malformed or undecodable metadata.
    MetadataDecode,
    /// Pixel block shorter than expected, reshape mismatch, or a read error
    /// in the middle of the stream.
    ImageRead,
    /// The file contained no usable frames at all.
    NoImageData,
}

/// Severity attached to a [`ProblematicFile`] entry. `Error` means the file
/// contributed no frames; `Warning` marks a recovered degradation (corrupt
/// frame discarded, metadata line skipped, ambiguous filename inference).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Error,
    Warning,
}

/// One captured per-file failure or recovered issue.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct FileFailure {
    pub kind: FileErrorKind,
    pub message: String,
}

impl FileFailure {
    pub fn new(kind: FileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A file that could not be fully decoded; recorded on the batch, never
/// thrown. Callers must inspect this list rather than assume success from a
/// non-failing call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProblematicFile {
    pub filename: String,
    pub error_message: String,
    pub error_kind: IssueKind,
}

impl ProblematicFile {
    pub(crate) fn new(filename: impl Into<String>, failure: FileFailure, kind: IssueKind) -> Self {
        Self {
            filename: filename.into(),
            error_message: failure.message,
            error_kind: kind,
        }
    }
}

/// Fatal read errors. Everything else is captured per file.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("dataset does not have a supported read function: {0}")]
    UnsupportedDataset(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&IssueKind::Warning).expect("serialize"),
            "\"warning\""
        );
    }

    #[test]
    fn problematic_file_keeps_message() {
        let failure = FileFailure::new(FileErrorKind::NoImageData, "no image data");
        let entry = ProblematicFile::new("a.pgm", failure, IssueKind::Error);
        assert_eq!(entry.error_message, "no image data");
        assert_eq!(entry.error_kind, IssueKind::Error);
    }
}
