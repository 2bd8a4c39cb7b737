//! Custom error types for the crate.
//!
//! Each layer has its own `thiserror` enum so that callers can match on the
//! failure they care about, and `DaqError` consolidates them for code that
//! spans layers (the ADC driver, the CLI).
//!
//! ## Error Hierarchy
//!
//! - **`DiscoveryError`**: fatal to a discovery call. Transient open failures
//!   are retried a bounded number of times before one of these is returned.
//! - **`TransportError`**: fatal to the current operation on an open link.
//!   There is no partial-frame recovery; a malformed frame is discarded and
//!   the caller decides whether to issue the whole request again.
//! - **`CodecError`**: a framing bug upstream (word width does not divide the
//!   buffer). Never silently truncated.
//! - **`ConfigError`**: load or validation failure of the settings.
//!
//! By using `#[from]`, `DaqError` can be created from any of the layer
//! errors, so driver code can use the `?` operator throughout.

use std::time::Duration;

use thiserror::Error;

pub use crate::config::ConfigError;
use crate::config::TransportKind;

/// Convenience alias for results using the crate-wide error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Failure to locate and open an instrument.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No {0} resources found")]
    NoResourcesFound(TransportKind),

    #[error("Device '{name}' not found after probing {probed} candidate(s)")]
    DeviceNotFound { name: String, probed: usize },

    #[error("Resource '{resource}' still busy after {attempts} attempt(s)")]
    ResourceBusy { resource: String, attempts: u32 },

    #[error("Failed to enumerate {kind} resources: {message}")]
    Enumeration { kind: TransportKind, message: String },

    #[error("{0} support not enabled. Rebuild with --features {1}")]
    FeatureDisabled(TransportKind, &'static str),
}

/// Failure of an operation on an open link.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("No data received, attempted to read {expected} bytes")]
    EmptyRead { expected: usize },

    #[error("Frame marker mismatch: expected '#', got 0x{actual:02x}")]
    MarkerMismatch { actual: u8 },

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Timeout of {expected:?} plus {margin:?} margin overflows")]
    TimeoutOverflow { expected: Duration, margin: Duration },

    #[error("Invalid response to '{command}': {response:?}")]
    InvalidResponse { command: String, response: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Link backend error: {0}")]
    Backend(String),
}

/// Failure to decode a sample buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Buffer of {len} bytes is not a multiple of the {word_width}-byte word width")]
    MisalignedBuffer { len: usize, word_width: usize },

    #[error("Unsupported word width {0} (must be 1..=8 bytes)")]
    InvalidWordWidth(usize),

    #[error("Frame of {words} x {word_width}-byte words exceeds the {max_bytes}-byte limit")]
    FrameTooLarge {
        words: usize,
        word_width: usize,
        max_bytes: usize,
    },
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Sample count must be at least 1, got {0}")]
    InvalidSampleCount(usize),

    #[error("Motor still rotating after {0:?}")]
    MotorTimeout(Duration),

    #[error("Settings file error: {0}")]
    Settings(String),
}
