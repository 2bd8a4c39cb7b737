//! Line-oriented SCPI transport over a single link.
//!
//! `Transport` owns exactly one boxed [`Link`] and gives bus and serial links
//! the same contract: `write_line`, `read_line`, `query`, `read_bytes`,
//! `identify`, `reset`, `close`. Every I/O method takes `&mut self`, so a
//! transport can have only one request in flight.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::adapters::{strip_terminator, Framing, Link};
use crate::config::LinkConfig;
use crate::error::TransportError;

/// SCPI identification query.
pub const IDENTIFY_COMMAND: &str = "*IDN?";
/// SCPI reset command.
pub const RESET_COMMAND: &str = "*RST";

/// An open connection to one instrument.
pub struct Transport {
    link: Option<Box<dyn Link>>,
    resource: String,
    config: LinkConfig,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("resource", &self.resource)
            .field("kind", &self.config.kind)
            .field("open", &self.link.is_some())
            .finish()
    }
}

impl Transport {
    /// Wrap an opened link, applying the terminators and base timeout from
    /// `config`.
    pub fn open(mut link: Box<dyn Link>, config: LinkConfig) -> Result<Self, TransportError> {
        link.configure_terminators(&config.read_terminator, &config.write_terminator)?;
        link.set_timeout(config.timeout())?;
        let resource = link.resource().to_string();
        debug!(
            resource = %resource,
            kind = %config.kind,
            timeout_ms = config.timeout_ms,
            "Transport opened"
        );
        Ok(Self {
            link: Some(link),
            resource,
            config,
        })
    }

    fn link(&mut self) -> Result<&mut Box<dyn Link>, TransportError> {
        self.link.as_mut().ok_or(TransportError::Closed)
    }

    /// Resource name or port path of the underlying link.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Link parameters this transport was opened with.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// True until `close` has been called.
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Send one command line.
    pub fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let terminator = self.config.write_terminator.clone();
        let link = self.link()?;
        let mut bytes = line.as_bytes().to_vec();
        if link.framing() == Framing::Manual {
            bytes.extend_from_slice(terminator.as_bytes());
        }
        link.write_all(&bytes)?;
        debug!(resource = %self.resource, command = line, "write");
        Ok(())
    }

    /// Read one reply line with the read terminator removed.
    pub fn read_line(&mut self) -> Result<String, TransportError> {
        let terminator = self.config.read_terminator.clone();
        let raw = self.link()?.read_message(terminator.as_bytes())?;
        let text = String::from_utf8_lossy(&raw);
        let line = strip_terminator(&text, &terminator).to_string();
        debug!(resource = %self.resource, response = %line, "read");
        Ok(line)
    }

    /// `write_line` followed by `read_line`.
    pub fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write_line(command)?;
        self.read_line()
    }

    /// Query and parse the reply, reporting the raw text on failure.
    pub fn query_parse<T: std::str::FromStr>(&mut self, command: &str) -> Result<T, TransportError> {
        let response = self.query(command)?;
        response
            .trim()
            .parse()
            .map_err(|_| TransportError::InvalidResponse {
                command: command.to_string(),
                response,
            })
    }

    /// Read exactly `n` bytes.
    ///
    /// # Errors
    /// `ShortRead` if the link delivers fewer bytes before its timeout.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let bytes = self.link()?.read_up_to(n)?;
        trace!(resource = %self.resource, expected = n, actual = bytes.len(), "read bytes");
        if bytes.len() != n {
            return Err(TransportError::ShortRead {
                expected: n,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Instrument identity (`*IDN?`).
    pub fn identify(&mut self) -> Result<String, TransportError> {
        self.query(IDENTIFY_COMMAND)
    }

    /// Reset the instrument (`*RST`); no reply is expected.
    pub fn reset(&mut self) -> Result<(), TransportError> {
        self.write_line(RESET_COMMAND)
    }

    /// Current read timeout.
    pub fn timeout(&self) -> Result<Duration, TransportError> {
        self.link
            .as_ref()
            .map(|link| link.timeout())
            .ok_or(TransportError::Closed)
    }

    /// Change the read timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.link()?.set_timeout(timeout)
    }

    /// Make sure the timeout covers an operation expected to take `expected`.
    ///
    /// If `expected` exceeds the current timeout minus `margin`, the timeout
    /// is raised to `expected + margin` until the returned guard is dropped.
    /// Fails with `TimeoutOverflow` when that sum is not a valid `Duration`.
    pub fn widen_timeout(
        &mut self,
        expected: Duration,
        margin: Duration,
    ) -> Result<TimeoutGuard<'_>, TransportError> {
        let previous = self.timeout()?;
        let widened = expected > previous.saturating_sub(margin);
        if widened {
            let timeout = expected
                .checked_add(margin)
                .ok_or(TransportError::TimeoutOverflow { expected, margin })?;
            debug!(
                resource = %self.resource,
                previous_ms = previous.as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "Widening timeout"
            );
            self.set_timeout(timeout)?;
        }
        Ok(TimeoutGuard {
            transport: self,
            previous,
            widened,
        })
    }

    /// Release the link. Later operations fail with `Closed`; closing again
    /// is a no-op.
    pub fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut link) = self.link.take() {
            link.close()?;
            debug!(resource = %self.resource, "Transport closed");
        }
        Ok(())
    }
}

/// Restores a transport's previous timeout when dropped.
///
/// Dereferences to the transport so the guarded operation runs through it.
pub struct TimeoutGuard<'a> {
    transport: &'a mut Transport,
    previous: Duration,
    widened: bool,
}

impl TimeoutGuard<'_> {
    /// Timeout that will be restored.
    pub fn previous(&self) -> Duration {
        self.previous
    }
}

impl Deref for TimeoutGuard<'_> {
    type Target = Transport;

    fn deref(&self) -> &Transport {
        self.transport
    }
}

impl DerefMut for TimeoutGuard<'_> {
    fn deref_mut(&mut self) -> &mut Transport {
        self.transport
    }
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        if !self.widened || !self.transport.is_open() {
            return;
        }
        if let Err(e) = self.transport.set_timeout(self.previous) {
            warn!(
                resource = %self.transport.resource,
                error = %e,
                "Failed to restore timeout"
            );
        }
    }
}
