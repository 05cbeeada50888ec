//! Wire constants of the stream0 PGM container.

/// Magic line opening each frame section. Prefix-matched, like the formats
/// themselves do.
pub(crate) const MAGIC_LINE: &[u8] = b"P5\n";

/// Metadata lines start with `#"`; the key sits between the quotes and the
/// value follows the closing one.
pub(crate) const METADATA_PREFIX: &[u8] = b"#\"";

/// Maximum-sample-value line separating a frame's header from its pixel
/// block. Matched exactly.
pub(crate) const PIXEL_SENTINEL: &[u8] = b"65535\n";

/// Quote character delimiting metadata keys.
pub(crate) const KEY_QUOTE: char = '"';

/// Every PGM-family instrument writes 16-bit big-endian samples.
pub(crate) const BYTES_PER_SAMPLE: usize = 2;
