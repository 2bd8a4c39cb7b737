//! Data handling: sample decoding and time-series assembly.

pub mod codec;
pub mod timeseries;

pub use codec::{decode_words, words_to_voltage, ByteOrder, WordFormat};
pub use timeseries::{assemble, SyncEventSet, TimeSeriesRecord};
