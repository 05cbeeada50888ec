//! Dataset registry: the instrument identities this crate can decode and the
//! reader each one routes to.

use std::fmt;

/// A dataset with a registered codec variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dataset {
    ThemisAsiRaw,
    RegoRaw,
    TrexNirRaw,
    TrexBlueRaw,
    TrexRgbRawNominal,
    TrexRgbRawBurst,
    TrexSpectrographRaw,
    SmileAsiRaw,
    TrexRgb5577GridMosv001,
    NorstarRiometerK0Txt,
    NorstarRiometerK2Txt,
}

/// Which reader family handles a dataset's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderRoute {
    /// PGM-family stream decoding only.
    Pgm,
    /// PGM-family streams plus tabular containers, dispatched per file by
    /// extension (the colour imager shipped both over its lifetime).
    PgmOrTable,
    /// PNG frames, single or tar-archived bursts.
    Burst,
    /// Tabular image containers.
    Table,
    /// Tabular grid containers, decoded to per-file records.
    Grid,
    /// Riometer text files, decoded to per-file records.
    Riometer,
}

impl Dataset {
    pub const ALL: &'static [Dataset] = &[
        Dataset::ThemisAsiRaw,
        Dataset::RegoRaw,
        Dataset::TrexNirRaw,
        Dataset::TrexBlueRaw,
        Dataset::TrexRgbRawNominal,
        Dataset::TrexRgbRawBurst,
        Dataset::TrexSpectrographRaw,
        Dataset::SmileAsiRaw,
        Dataset::TrexRgb5577GridMosv001,
        Dataset::NorstarRiometerK0Txt,
        Dataset::NorstarRiometerK2Txt,
    ];

    /// Canonical dataset name as used by the archive catalog.
    pub fn name(self) -> &'static str {
        match self {
            Dataset::ThemisAsiRaw => "THEMIS_ASI_RAW",
            Dataset::RegoRaw => "REGO_RAW",
            Dataset::TrexNirRaw => "TREX_NIR_RAW",
            Dataset::TrexBlueRaw => "TREX_BLUE_RAW",
            Dataset::TrexRgbRawNominal => "TREX_RGB_RAW_NOMINAL",
            Dataset::TrexRgbRawBurst => "TREX_RGB_RAW_BURST",
            Dataset::TrexSpectrographRaw => "TREX_SPECTROGRAPH_RAW",
            Dataset::SmileAsiRaw => "SMILE_ASI_RAW",
            Dataset::TrexRgb5577GridMosv001 => "TREX_RGB5577_GRID_MOSV001",
            Dataset::NorstarRiometerK0Txt => "NORSTAR_RIOMETER_K0_TXT",
            Dataset::NorstarRiometerK2Txt => "NORSTAR_RIOMETER_K2_TXT",
        }
    }

    /// Look a dataset up by its catalog name.
    pub fn from_name(name: &str) -> Option<Dataset> {
        Dataset::ALL.iter().copied().find(|d| d.name() == name)
    }

    pub(crate) fn route(self) -> ReaderRoute {
        match self {
            Dataset::ThemisAsiRaw
            | Dataset::RegoRaw
            | Dataset::TrexNirRaw
            | Dataset::TrexBlueRaw
            | Dataset::TrexSpectrographRaw => ReaderRoute::Pgm,
            Dataset::TrexRgbRawNominal => ReaderRoute::PgmOrTable,
            Dataset::TrexRgbRawBurst => ReaderRoute::Burst,
            Dataset::SmileAsiRaw => ReaderRoute::Table,
            Dataset::TrexRgb5577GridMosv001 => ReaderRoute::Grid,
            Dataset::NorstarRiometerK0Txt | Dataset::NorstarRiometerK2Txt => {
                ReaderRoute::Riometer
            }
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sorted names of every dataset with a read function.
pub fn list_supported() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Dataset::ALL.iter().map(|d| d.name()).collect();
    names.sort_unstable();
    names
}

pub fn is_supported(name: &str) -> bool {
    Dataset::from_name(name).is_some()
}
