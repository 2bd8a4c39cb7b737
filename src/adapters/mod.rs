//! Link adapters
//!
//! A link is an opaque duplex byte channel with a timeout. The `Transport`
//! owns exactly one boxed link and layers the line-oriented SCPI contract on
//! top of it; the adapters here only move bytes.

use std::time::Duration;

use crate::config::{LinkConfig, TransportKind};
use crate::error::{DiscoveryError, TransportError};

pub mod mock;
pub mod serial_adapter;
pub mod visa_adapter;

pub use mock::{MockAdapter, MockHandle, MockProvider};
pub use serial_adapter::{SerialAdapter, SerialProvider};
pub use visa_adapter::{VisaAdapter, VisaProvider};

/// Who is responsible for line terminators on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// The link appends the write terminator and strips the read terminator
    /// itself once `configure_terminators` has been called.
    Builtin,
    /// The transport appends and strips terminators explicitly.
    Manual,
}

/// Low-level byte channel to one instrument.
pub trait Link: Send {
    /// Resource name or port path this link was opened on.
    fn resource(&self) -> &str;

    /// Terminator handling of this link.
    fn framing(&self) -> Framing;

    /// Hand the terminators to links with built-in framing.
    fn configure_terminators(&mut self, _read: &str, _write: &str) -> Result<(), TransportError> {
        Ok(())
    }

    /// Send all of `bytes`.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read one textual message.
    ///
    /// Manual framing returns bytes up to and including the first occurrence
    /// of the last byte of `terminator` (see [`ends_line`]); built-in framing
    /// returns the message as delivered by the bus.
    fn read_message(&mut self, terminator: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Read up to `n` bytes, stopping early only on timeout or end of stream.
    fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>, TransportError>;

    /// Current read timeout.
    fn timeout(&self) -> Duration;

    /// Change the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Release the underlying resource.
    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Why a candidate resource could not be opened.
#[derive(Debug)]
pub enum OpenError {
    /// Held by another session; may clear on its own.
    Busy(String),
    /// Any other failure.
    Failed(TransportError),
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenError::Busy(msg) => write!(f, "resource busy: {}", msg),
            OpenError::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Source of candidate links for discovery.
pub trait LinkProvider {
    /// Link kind produced by this provider.
    fn kind(&self) -> TransportKind;

    /// Enumerate candidate resource names in probe order.
    fn candidates(&self) -> Result<Vec<String>, DiscoveryError>;

    /// Open one candidate with the given link parameters.
    fn open(&self, resource: &str, config: &LinkConfig) -> Result<Box<dyn Link>, OpenError>;
}

/// Remove any trailing characters that appear in `terminator`, the way a
/// line reader strips `"\r\n"` whether or not both characters arrived.
pub fn strip_terminator<'a>(line: &'a str, terminator: &str) -> &'a str {
    line.trim_end_matches(|c| terminator.contains(c))
}

/// True once `message` ends with the final byte of `terminator`.
///
/// A board that sends a bare `"\n"` where `"\r\n"` is configured still
/// completes the line; [`strip_terminator`] removes whatever arrived.
pub fn ends_line(message: &[u8], terminator: &[u8]) -> bool {
    match terminator.last() {
        Some(last) => message.last() == Some(last),
        None => !message.is_empty(),
    }
}
