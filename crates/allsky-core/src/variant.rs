//! Codec variants: per-instrument configuration consumed by the decoders.
//!
//! The PGM-family instruments share one wire format with small differences
//! (pixel geometry, inline vs. fixed dimensions, frame-end marker spelling,
//! flip axes, duplicate-key handling). Those differences live here as data so
//! that a single decoder implementation serves every family.

use crate::dataset::Dataset;

/// Pixel element type of an imager dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelKind {
    U8,
    U16,
}

/// How a stream is decompressed, decided by file extension alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compression {
    Plain,
    Gzip,
    Bzip2,
}

/// One permitted extension and the compression it implies. Rules are matched
/// in declaration order; longer suffixes must precede their tails.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtensionRule {
    pub suffix: &'static str,
    pub compression: Compression,
}

/// Frame geometry: fixed by the variant, or declared inline in the stream on
/// the line preceding the pixel sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Geometry {
    Fixed { width: usize, height: usize },
    FromStream { width: usize, height: usize },
}

impl Geometry {
    pub(crate) fn expected(&self) -> (usize, usize) {
        match *self {
            Geometry::Fixed { width, height } | Geometry::FromStream { width, height } => {
                (width, height)
            }
        }
    }
}

/// Where the site/device unique IDs come from when the stream lacks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SiteFallback {
    /// No filename fallback; carried values start empty.
    None,
    /// Underscore-delimited token positions in the basename.
    Tokens { site: usize, device: usize },
    /// Spectrograph naming: five-token names put the IDs at tokens 2/3,
    /// longer (dark-frame) names shift them to 3/4.
    SpectrographTokens,
}

/// Per-instrument configuration, pure data.
#[derive(Debug, Clone)]
pub(crate) struct CodecVariant {
    pub dataset: Dataset,
    pub geometry: Geometry,
    pub extensions: &'static [ExtensionRule],
    /// Key prefixes that close a frame's metadata block. Formats evolved
    /// their spelling over time; every alias is accepted.
    pub frame_end_markers: &'static [&'static str],
    pub timestamp_key: &'static str,
    pub site_key: &'static str,
    pub device_key: &'static str,
    pub flip_vertical: bool,
    pub flip_horizontal: bool,
    /// Repeated metadata keys collect into a list instead of overwriting.
    pub collect_duplicate_keys: bool,
    pub site_fallback: SiteFallback,
    pub channels: usize,
    pub pixel: PixelKind,
    /// Skip files whose basename minute lies outside the requested bounds
    /// without opening them.
    pub prefilter_filename_time: bool,
}

const PGM_FULL: &[ExtensionRule] = &[
    ExtensionRule {
        suffix: "pgm.gz",
        compression: Compression::Gzip,
    },
    ExtensionRule {
        suffix: "pgm.bz2",
        compression: Compression::Bzip2,
    },
    ExtensionRule {
        suffix: "pgm",
        compression: Compression::Plain,
    },
];

const PGM_GZ_ONLY: &[ExtensionRule] = &[
    ExtensionRule {
        suffix: "pgm.gz",
        compression: Compression::Gzip,
    },
    ExtensionRule {
        suffix: "pgm",
        compression: Compression::Plain,
    },
];

const THEMIS_MARKERS: &[&str] = &[
    "Exposure plus initial readout",
    "Exposure duration plus readout",
];

const TIMESTAMP_KEY: &str = "Image request start";
const SITE_KEY: &str = "Site unique ID";
const DEVICE_KEY: &str = "Imager unique ID";

static THEMIS: CodecVariant = CodecVariant {
    dataset: Dataset::ThemisAsiRaw,
    geometry: Geometry::Fixed {
        width: 256,
        height: 256,
    },
    extensions: PGM_FULL,
    frame_end_markers: THEMIS_MARKERS,
    timestamp_key: TIMESTAMP_KEY,
    site_key: SITE_KEY,
    device_key: DEVICE_KEY,
    flip_vertical: true,
    flip_horizontal: false,
    collect_duplicate_keys: false,
    site_fallback: SiteFallback::None,
    channels: 1,
    pixel: PixelKind::U16,
    prefilter_filename_time: false,
};

static REGO: CodecVariant = CodecVariant {
    dataset: Dataset::RegoRaw,
    geometry: Geometry::Fixed {
        width: 512,
        height: 512,
    },
    extensions: PGM_FULL,
    frame_end_markers: THEMIS_MARKERS,
    timestamp_key: TIMESTAMP_KEY,
    site_key: SITE_KEY,
    device_key: DEVICE_KEY,
    flip_vertical: true,
    flip_horizontal: false,
    collect_duplicate_keys: false,
    site_fallback: SiteFallback::Tokens { site: 2, device: 3 },
    channels: 1,
    pixel: PixelKind::U16,
    prefilter_filename_time: false,
};

static TREX_NIR: CodecVariant = CodecVariant {
    dataset: Dataset::TrexNirRaw,
    geometry: Geometry::FromStream {
        width: 256,
        height: 256,
    },
    extensions: PGM_GZ_ONLY,
    frame_end_markers: THEMIS_MARKERS,
    timestamp_key: TIMESTAMP_KEY,
    site_key: SITE_KEY,
    device_key: DEVICE_KEY,
    flip_vertical: true,
    flip_horizontal: false,
    collect_duplicate_keys: false,
    site_fallback: SiteFallback::Tokens { site: 2, device: 3 },
    channels: 1,
    pixel: PixelKind::U16,
    prefilter_filename_time: false,
};

static TREX_BLUE: CodecVariant = CodecVariant {
    dataset: Dataset::TrexBlueRaw,
    geometry: Geometry::FromStream {
        width: 256,
        height: 256,
    },
    extensions: PGM_GZ_ONLY,
    frame_end_markers: THEMIS_MARKERS,
    timestamp_key: TIMESTAMP_KEY,
    site_key: SITE_KEY,
    device_key: DEVICE_KEY,
    flip_vertical: true,
    flip_horizontal: true,
    collect_duplicate_keys: false,
    site_fallback: SiteFallback::Tokens { site: 2, device: 3 },
    channels: 1,
    pixel: PixelKind::U16,
    prefilter_filename_time: false,
};

static TREX_RGB_NOMINAL: CodecVariant = CodecVariant {
    dataset: Dataset::TrexRgbRawNominal,
    geometry: Geometry::FromStream {
        width: 553,
        height: 480,
    },
    extensions: PGM_GZ_ONLY,
    frame_end_markers: &["Effective image exposure"],
    timestamp_key: TIMESTAMP_KEY,
    site_key: SITE_KEY,
    device_key: DEVICE_KEY,
    flip_vertical: true,
    flip_horizontal: false,
    collect_duplicate_keys: true,
    site_fallback: SiteFallback::Tokens { site: 3, device: 4 },
    channels: 3,
    pixel: PixelKind::U8,
    prefilter_filename_time: false,
};

static TREX_RGB_BURST: CodecVariant = CodecVariant {
    dataset: Dataset::TrexRgbRawBurst,
    geometry: Geometry::FromStream {
        width: 553,
        height: 480,
    },
    extensions: &[],
    frame_end_markers: &[],
    timestamp_key: "image_request_start_timestamp",
    site_key: "site_unique_id",
    device_key: "imager_unique_id",
    flip_vertical: true,
    flip_horizontal: false,
    collect_duplicate_keys: false,
    site_fallback: SiteFallback::Tokens { site: 3, device: 4 },
    channels: 3,
    pixel: PixelKind::U8,
    prefilter_filename_time: false,
};

static TREX_SPECTROGRAPH: CodecVariant = CodecVariant {
    dataset: Dataset::TrexSpectrographRaw,
    geometry: Geometry::FromStream {
        width: 256,
        height: 1024,
    },
    extensions: PGM_GZ_ONLY,
    frame_end_markers: &["Exposure plus readout"],
    timestamp_key: TIMESTAMP_KEY,
    site_key: SITE_KEY,
    device_key: DEVICE_KEY,
    flip_vertical: false,
    flip_horizontal: false,
    collect_duplicate_keys: false,
    site_fallback: SiteFallback::SpectrographTokens,
    channels: 1,
    pixel: PixelKind::U16,
    prefilter_filename_time: false,
};

static SMILE: CodecVariant = CodecVariant {
    dataset: Dataset::SmileAsiRaw,
    geometry: Geometry::FromStream {
        width: 0,
        height: 0,
    },
    extensions: &[],
    frame_end_markers: &[],
    timestamp_key: TIMESTAMP_KEY,
    site_key: SITE_KEY,
    device_key: DEVICE_KEY,
    flip_vertical: true,
    flip_horizontal: false,
    collect_duplicate_keys: false,
    site_fallback: SiteFallback::None,
    channels: 3,
    pixel: PixelKind::U8,
    prefilter_filename_time: true,
};

/// Variant lookup for image datasets. Record datasets (grid, riometer) carry
/// their configuration inside their own readers.
pub(crate) fn variant_for(dataset: Dataset) -> Option<&'static CodecVariant> {
    match dataset {
        Dataset::ThemisAsiRaw => Some(&THEMIS),
        Dataset::RegoRaw => Some(&REGO),
        Dataset::TrexNirRaw => Some(&TREX_NIR),
        Dataset::TrexBlueRaw => Some(&TREX_BLUE),
        Dataset::TrexRgbRawNominal => Some(&TREX_RGB_NOMINAL),
        Dataset::TrexRgbRawBurst => Some(&TREX_RGB_BURST),
        Dataset::TrexSpectrographRaw => Some(&TREX_SPECTROGRAPH),
        Dataset::SmileAsiRaw => Some(&SMILE),
        Dataset::TrexRgb5577GridMosv001
        | Dataset::NorstarRiometerK0Txt
        | Dataset::NorstarRiometerK2Txt => None,
    }
}
