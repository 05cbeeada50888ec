//! Opening instrument files: extension dispatch and decompression.
//!
//! Compression is decided by file extension alone, never by content
//! sniffing. Streams are exposed as buffered readers; compressed streams
//! cannot seek, so skipping a pixel block is a bounded discard read.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;

use crate::error::{FileErrorKind, FileFailure};
use crate::variant::{Compression, ExtensionRule};

pub(crate) type InstrumentStream = BufReader<Box<dyn Read + Send>>;

/// First matching rule wins, so compressed suffixes must be listed before
/// their plain tails.
pub(crate) fn match_extension(rules: &[ExtensionRule], filename: &str) -> Option<Compression> {
    rules
        .iter()
        .find(|rule| filename.ends_with(rule.suffix))
        .map(|rule| rule.compression)
}

/// Open `filename` according to its matched extension rule. Unrecognized
/// extensions and open errors are captured, not raised.
pub(crate) fn open_stream(
    rules: &[ExtensionRule],
    filename: &str,
) -> Result<InstrumentStream, FileFailure> {
    let compression = match_extension(rules, filename).ok_or_else(|| {
        FileFailure::new(
            FileErrorKind::UnrecognizedExtension,
            format!("unrecognized file type: {filename}"),
        )
    })?;
    let file = File::open(filename).map_err(|err| {
        FileFailure::new(
            FileErrorKind::OpenFailure,
            format!("failed to open file: {err}"),
        )
    })?;
    // compressed files may hold several concatenated members; all of them
    // belong to the stream
    let inner: Box<dyn Read + Send> = match compression {
        Compression::Plain => Box::new(file),
        Compression::Gzip => Box::new(MultiGzDecoder::new(file)),
        Compression::Bzip2 => Box::new(MultiBzDecoder::new(file)),
    };
    Ok(BufReader::new(inner))
}

/// Advance the stream past exactly `count` bytes without materializing them.
pub(crate) fn discard_exact(reader: &mut impl BufRead, mut count: usize) -> io::Result<()> {
    while count > 0 {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a skipped pixel block",
            ));
        }
        let used = available.len().min(count);
        reader.consume(used);
        count -= used;
    }
    Ok(())
}

/// Read one line including its trailing newline, like the underlying
/// formats expect. Returns `None` at end of stream.
pub(crate) fn read_raw_line(
    reader: &mut impl BufRead,
    buf: &mut Vec<u8>,
) -> io::Result<Option<()>> {
    buf.clear();
    let n = reader.read_until(b'\n', buf)?;
    if n == 0 { Ok(None) } else { Ok(Some(())) }
}
