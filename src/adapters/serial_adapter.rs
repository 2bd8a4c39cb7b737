//! Serial link over a USB-CDC or USB-serial port.
//!
//! Terminators are not handled by the port, so this link uses
//! `Framing::Manual`: the transport appends the write terminator and this
//! adapter reads until the read terminator arrives.

use std::time::Duration;

use tracing::debug;

use super::{Framing, Link, LinkProvider, OpenError};
use crate::config::{LinkConfig, TransportKind};
use crate::error::{DiscoveryError, TransportError};

#[cfg(feature = "instrument_serial")]
use super::ends_line;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::io::{ErrorKind, Read, Write};
#[cfg(feature = "instrument_serial")]
use std::time::Instant;

/// Serial adapter for USB-modem / USB-serial instruments
///
/// Wraps the `serialport` crate. All I/O is blocking and bounded by the
/// port timeout.
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyACM0", "/dev/cu.usbmodem1101", "COM3")
    port_name: String,

    /// Baud rate (ignored by USB-CDC devices but still applied)
    baud_rate: u32,

    /// Read timeout
    timeout: Duration,

    #[cfg(feature = "instrument_serial")]
    port: Option<Box<dyn SerialPort>>,
}

impl SerialAdapter {
    /// Open `port_name` at `baud_rate` with the given read timeout.
    #[cfg(feature = "instrument_serial")]
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, OpenError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(classify_open_error)?;

        // Discard anything the device sent before we were listening.
        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            debug!(port = port_name, error = %e, "Could not clear serial buffers");
        }

        debug!(port = port_name, baud_rate, ?timeout, "Serial port opened");
        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            timeout,
            port: Some(port),
        })
    }

    /// Open `port_name` (always fails when serial support is not compiled in).
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, OpenError> {
        let _ = (port_name, baud_rate, timeout);
        Err(OpenError::Failed(TransportError::Backend(
            "Serial support not enabled. Rebuild with --features instrument_serial".to_string(),
        )))
    }

    /// Baud rate the port was opened with.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

#[cfg(feature = "instrument_serial")]
fn classify_open_error(e: serialport::Error) -> OpenError {
    if e.description.to_lowercase().contains("busy") {
        OpenError::Busy(e.description)
    } else {
        OpenError::Failed(TransportError::Backend(e.to_string()))
    }
}

#[cfg(feature = "instrument_serial")]
impl Link for SerialAdapter {
    fn resource(&self) -> &str {
        &self.port_name
    }

    fn framing(&self) -> Framing {
        Framing::Manual
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_message(&mut self, terminator: &[u8]) -> Result<Vec<u8>, TransportError> {
        let timeout = self.timeout;
        let port = self.port()?;
        let start = Instant::now();
        let mut response = Vec::new();
        let mut byte = [0u8; 1];

        while !ends_line(&response, terminator) {
            if start.elapsed() > timeout {
                return Err(TransportError::Timeout(timeout));
            }
            match port.read(&mut byte) {
                Ok(1) => response.push(byte[0]),
                Ok(_) => {
                    return Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "Unexpected EOF from serial port",
                    )
                    .into())
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout(timeout))
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(response)
    }

    fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let timeout = self.timeout;
        let port = self.port()?;
        let start = Instant::now();
        let mut buf = vec![0u8; n];
        let mut filled = 0;

        while filled < n {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if start.elapsed() > timeout {
                break;
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.port()?
            .set_timeout(timeout)
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        self.timeout = timeout;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }
}

/// Enumerates serial ports whose names match the USB naming patterns.
#[derive(Debug, Clone)]
pub struct SerialProvider {
    patterns: Vec<String>,
}

impl SerialProvider {
    /// Provider accepting ports that contain any of `patterns`.
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    /// Order `ports` by the first pattern each one matches, dropping ports
    /// that match none. Ports matching the same pattern keep their order.
    pub fn filter_ports(&self, ports: &[String]) -> Vec<String> {
        self.patterns
            .iter()
            .flat_map(|pattern| ports.iter().filter(move |p| p.contains(pattern.as_str())))
            .fold(Vec::new(), |mut acc, port| {
                if !acc.contains(port) {
                    acc.push(port.clone());
                }
                acc
            })
    }
}

impl LinkProvider for SerialProvider {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    #[cfg(feature = "instrument_serial")]
    fn candidates(&self) -> Result<Vec<String>, DiscoveryError> {
        let ports: Vec<String> = serialport::available_ports()
            .map_err(|e| DiscoveryError::Enumeration {
                kind: TransportKind::Serial,
                message: e.to_string(),
            })?
            .into_iter()
            .map(|info| info.port_name)
            .collect();
        debug!(?ports, "Enumerated serial ports");
        Ok(self.filter_ports(&ports))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn candidates(&self) -> Result<Vec<String>, DiscoveryError> {
        Err(DiscoveryError::FeatureDisabled(
            TransportKind::Serial,
            "instrument_serial",
        ))
    }

    #[cfg(feature = "instrument_serial")]
    fn open(&self, resource: &str, config: &LinkConfig) -> Result<Box<dyn Link>, OpenError> {
        let adapter = SerialAdapter::open(resource, config.baud_rate, config.timeout())?;
        Ok(Box::new(adapter))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn open(&self, resource: &str, config: &LinkConfig) -> Result<Box<dyn Link>, OpenError> {
        let _ = (resource, config);
        Err(OpenError::Failed(TransportError::Backend(
            "Serial support not enabled. Rebuild with --features instrument_serial".to_string(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filter_keeps_usb_ports_in_pattern_order() {
        let provider = SerialProvider::new(names(&["usbmodem", "usbserial"]));
        let ports = names(&[
            "/dev/cu.Bluetooth-Incoming-Port",
            "/dev/cu.usbserial-A1",
            "/dev/cu.usbmodem1101",
            "/dev/cu.usbmodem1201",
        ]);
        assert_eq!(
            provider.filter_ports(&ports),
            names(&["/dev/cu.usbmodem1101", "/dev/cu.usbmodem1201", "/dev/cu.usbserial-A1"])
        );
    }

    #[test]
    fn test_filter_linux_names() {
        let provider = SerialProvider::new(names(&["ttyACM", "ttyUSB"]));
        let ports = names(&["/dev/ttyS0", "/dev/ttyUSB0", "/dev/ttyACM0"]);
        assert_eq!(
            provider.filter_ports(&ports),
            names(&["/dev/ttyACM0", "/dev/ttyUSB0"])
        );
    }

    #[test]
    fn test_port_matching_two_patterns_listed_once() {
        let provider = SerialProvider::new(names(&["usb", "usbmodem"]));
        let ports = names(&["/dev/cu.usbmodem1"]);
        assert_eq!(provider.filter_ports(&ports).len(), 1);
    }

    #[test]
    fn test_provider_kind() {
        assert_eq!(SerialProvider::new(vec![]).kind(), TransportKind::Serial);
    }
}
