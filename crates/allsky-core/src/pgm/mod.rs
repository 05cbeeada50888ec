//! Stream0 PGM-family decoding: THEMIS, REGO, the TREx single-channel
//! imagers, the TREx colour imager's nominal mode, and the spectrograph.

mod layout;
mod parser;

pub(crate) use parser::decode_file;
