//! VISA bus link for USB-TMC/GPIB/LXI instruments
//!
//! The bus delivers whole messages, so this link uses `Framing::Builtin`:
//! it appends the write terminator and strips the read terminator itself.
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x0957::0x1507::MY48005679::INSTR" (USB-TMC)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use std::time::Duration;

use super::{Framing, Link, LinkProvider, OpenError};
use crate::config::{LinkConfig, TransportKind};
use crate::error::{DiscoveryError, TransportError};

#[cfg(feature = "instrument_visa")]
use std::ffi::CString;
#[cfg(feature = "instrument_visa")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Resource expression matching every instrument session.
pub const INSTR_EXPRESSION: &str = "?*INSTR";

#[cfg(feature = "instrument_visa")]
const READ_CHUNK: usize = 4096;

/// VISA adapter for bus instruments
pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::1::INSTR")
    resource_string: String,

    /// I/O timeout
    #[cfg(feature = "instrument_visa")]
    timeout: Duration,

    #[cfg(feature = "instrument_visa")]
    read_terminator: String,
    #[cfg(feature = "instrument_visa")]
    write_terminator: String,

    #[cfg(feature = "instrument_visa")]
    instrument: Option<Instrument>,
}

#[cfg(feature = "instrument_visa")]
fn backend_error(context: &str, e: impl std::fmt::Debug) -> TransportError {
    TransportError::Backend(format!("{}: {:?}", context, e))
}

#[cfg(feature = "instrument_visa")]
fn visa_string(s: &str) -> Result<VisaString, TransportError> {
    CString::new(s)
        .map(VisaString::from)
        .map_err(|e| backend_error("Invalid VISA string", e))
}

impl VisaAdapter {
    /// Open a VISA resource with the given I/O timeout.
    #[cfg(feature = "instrument_visa")]
    pub fn open(resource_string: &str, timeout: Duration) -> Result<Self, OpenError> {
        let rm = DefaultRM::new()
            .map_err(|e| OpenError::Failed(backend_error("Failed to create VISA resource manager", e)))?;
        let name = visa_string(resource_string).map_err(OpenError::Failed)?;
        let instrument = rm
            .open(&name, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .map_err(|e| {
                let detail = format!("{:?}", e);
                if detail.contains("RsrcBusy") {
                    OpenError::Busy(detail)
                } else {
                    OpenError::Failed(backend_error("Failed to open VISA resource", detail))
                }
            })?;

        let mut adapter = Self {
            resource_string: resource_string.to_string(),
            timeout,
            read_terminator: "\n".to_string(),
            write_terminator: "\n".to_string(),
            instrument: Some(instrument),
        };
        adapter.set_timeout(timeout).map_err(OpenError::Failed)?;

        debug!(
            resource = resource_string,
            timeout_ms = timeout.as_millis() as u64,
            "VISA resource opened"
        );
        Ok(adapter)
    }

    /// Open a VISA resource (always fails when VISA support is not compiled in).
    #[cfg(not(feature = "instrument_visa"))]
    pub fn open(resource_string: &str, timeout: Duration) -> Result<Self, OpenError> {
        let _ = (resource_string, timeout);
        Err(OpenError::Failed(TransportError::Backend(
            "VISA support not enabled. Rebuild with --features instrument_visa".to_string(),
        )))
    }

    /// Resource string this adapter was opened on.
    pub fn resource_string(&self) -> &str {
        &self.resource_string
    }

    #[cfg(feature = "instrument_visa")]
    fn instrument(&mut self) -> Result<&mut Instrument, TransportError> {
        self.instrument.as_mut().ok_or(TransportError::Closed)
    }
}

#[cfg(feature = "instrument_visa")]
impl Link for VisaAdapter {
    fn resource(&self) -> &str {
        &self.resource_string
    }

    fn framing(&self) -> Framing {
        Framing::Builtin
    }

    fn configure_terminators(&mut self, read: &str, write: &str) -> Result<(), TransportError> {
        self.read_terminator = read.to_string();
        self.write_terminator = write.to_string();
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut message = bytes.to_vec();
        message.extend_from_slice(self.write_terminator.as_bytes());
        let instrument = self.instrument()?;
        instrument.write_all(&message)?;
        Ok(())
    }

    fn read_message(&mut self, _terminator: &[u8]) -> Result<Vec<u8>, TransportError> {
        let read_terminator = self.read_terminator.clone();
        let instrument = self.instrument()?;
        let mut message = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let count = instrument.read(&mut chunk)?;
            message.extend_from_slice(&chunk[..count]);
            // A short chunk means the bus signalled end of message.
            if count < READ_CHUNK || message.ends_with(read_terminator.as_bytes()) {
                break;
            }
        }
        while message
            .last()
            .is_some_and(|b| read_terminator.as_bytes().contains(b))
        {
            message.pop();
        }
        Ok(message)
    }

    fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let instrument = self.instrument()?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            match instrument.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                // Timeouts surface as I/O errors; what arrived so far is kept.
                Err(_) if filled > 0 => break,
                Err(e) if format!("{:?}", e).contains("Tmo") => break,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let attr = attribute::AttrTmoValue::new_checked(timeout_ms)
            .ok_or_else(|| backend_error("Invalid VISA timeout", timeout))?;
        self.instrument()?
            .set_attr(attr)
            .map_err(|e| backend_error("Failed to set VISA timeout", e))?;
        self.timeout = timeout;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.instrument.take().is_some() {
            debug!(resource = %self.resource_string, "VISA resource closed");
        }
        Ok(())
    }
}

/// Enumerates every instrument known to the VISA resource manager.
#[derive(Debug, Clone, Default)]
pub struct VisaProvider;

impl LinkProvider for VisaProvider {
    fn kind(&self) -> TransportKind {
        TransportKind::Bus
    }

    #[cfg(feature = "instrument_visa")]
    fn candidates(&self) -> Result<Vec<String>, DiscoveryError> {
        let enumeration = |message: String| DiscoveryError::Enumeration {
            kind: TransportKind::Bus,
            message,
        };
        let rm = DefaultRM::new().map_err(|e| enumeration(format!("{:?}", e)))?;
        let expression =
            visa_string(INSTR_EXPRESSION).map_err(|e| enumeration(e.to_string()))?;
        let mut list = match rm.find_res_list(&expression) {
            Ok(list) => list,
            // VISA reports an empty search as an error rather than an empty list.
            Err(e) if format!("{:?}", e).contains("RsrcNfound") => return Ok(Vec::new()),
            Err(e) => return Err(enumeration(format!("{:?}", e))),
        };
        let mut resources = Vec::new();
        while let Some(name) = list
            .find_next()
            .map_err(|e| enumeration(format!("{:?}", e)))?
        {
            resources.push(name.to_string_lossy().into_owned());
        }
        debug!(?resources, "Enumerated VISA resources");
        Ok(resources)
    }

    #[cfg(not(feature = "instrument_visa"))]
    fn candidates(&self) -> Result<Vec<String>, DiscoveryError> {
        Err(DiscoveryError::FeatureDisabled(
            TransportKind::Bus,
            "instrument_visa",
        ))
    }

    #[cfg(feature = "instrument_visa")]
    fn open(&self, resource: &str, config: &LinkConfig) -> Result<Box<dyn Link>, OpenError> {
        Ok(Box::new(VisaAdapter::open(resource, config.timeout())?))
    }

    #[cfg(not(feature = "instrument_visa"))]
    fn open(&self, resource: &str, config: &LinkConfig) -> Result<Box<dyn Link>, OpenError> {
        let _ = (resource, config);
        Err(OpenError::Failed(TransportError::Backend(
            "VISA support not enabled. Rebuild with --features instrument_visa".to_string(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind() {
        assert_eq!(VisaProvider.kind(), TransportKind::Bus);
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[test]
    fn test_disabled_feature_is_reported() {
        assert!(matches!(
            VisaProvider.candidates(),
            Err(DiscoveryError::FeatureDisabled(TransportKind::Bus, "instrument_visa"))
        ));
        assert!(VisaAdapter::open("GPIB0::1::INSTR", Duration::from_secs(1)).is_err());
    }
}
