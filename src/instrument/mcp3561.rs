//! MCP3561 ADC development board driver.
//!
//! The board samples at a fixed rate and answers `MEASURE?` with a binary
//! frame: one `#` marker byte followed by `n_samples` twos-complement words.
//! A sideband records the sample indices at which an external reference
//! pulse arrived (`SYNC:NUMPOINTS?`, `SYNC:DATA?`), using the same framing.
//!
//! ## Configuration
//!
//! ```toml
//! [adc]
//! sampling_frequency_hz = 9765.65
//! n_samples = 1000
//! bytes_per_word = 3
//! byte_order = "msb"
//! bits = 24
//! full_scale_v = 3.3
//! offset_v = 3.12512
//! ```

use tracing::{debug, info};

use crate::config::{AdcConfig, MotorConfig, Settings};
use crate::data::codec::words_to_voltage;
use crate::data::timeseries::{assemble, SyncEventSet, TimeSeriesRecord};
use crate::discovery::discover;
use crate::error::{AppResult, DaqError, TransportError};
use crate::instrument::motor::Motor;
use crate::limits::frame_len;
use crate::transport::Transport;

/// First byte of every binary frame.
pub const FRAME_MARKER: u8 = b'#';

/// Sample count the board is configured for after power-up.
pub const POWER_ON_SAMPLES: usize = 1;

/// Read one marker-prefixed frame of `words` words and return its payload.
///
/// Errors are reported in order: nothing received, frame cut short, wrong
/// marker byte.
pub fn read_frame(
    transport: &mut Transport,
    words: usize,
    word_width: usize,
) -> Result<Vec<u8>, DaqError> {
    let len = frame_len(words, word_width)?;
    let mut frame = match transport.read_bytes(len) {
        Err(TransportError::ShortRead {
            expected,
            actual: 0,
        }) => return Err(TransportError::EmptyRead { expected }.into()),
        result => result?,
    };
    if frame[0] != FRAME_MARKER {
        return Err(TransportError::MarkerMismatch { actual: frame[0] }.into());
    }
    frame.remove(0);
    Ok(frame)
}

/// Driver for the MCP3561 development board.
#[derive(Debug)]
pub struct Mcp3561 {
    transport: Transport,
    config: AdcConfig,
    motor_config: MotorConfig,
    n_samples: usize,
}

impl Mcp3561 {
    /// Wrap an open transport and apply the configured sample count.
    ///
    /// `config` is validated first; nothing is sent to the board if it is
    /// rejected.
    pub fn new(transport: Transport, config: AdcConfig) -> AppResult<Self> {
        config.validate()?;
        let n_samples = config.n_samples;
        let mut adc = Self {
            transport,
            config,
            motor_config: MotorConfig::default(),
            n_samples: POWER_ON_SAMPLES,
        };
        adc.set_n_samples(n_samples)?;
        Ok(adc)
    }

    /// Discover the board named in `settings.discovery` and construct it.
    pub fn connect(settings: &Settings) -> AppResult<Self> {
        let transport = discover(
            settings.link.kind,
            &settings.discovery.device_name,
            &settings.link,
            &settings.discovery,
        )?;
        info!(resource = %transport.resource(), "Connected to ADC board");
        Ok(Self::new(transport, settings.adc.clone())?.with_motor_config(settings.motor.clone()))
    }

    /// Replace the motor parameters.
    pub fn with_motor_config(mut self, motor_config: MotorConfig) -> Self {
        self.motor_config = motor_config;
        self
    }

    /// Samples per measurement.
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Change the samples per measurement.
    ///
    /// The configure command is only sent when `n_samples` differs from the
    /// current value. Counts whose measurement time cannot be represented
    /// are rejected.
    pub fn set_n_samples(&mut self, n_samples: usize) -> AppResult<()> {
        if n_samples == 0 {
            return Err(DaqError::InvalidSampleCount(n_samples));
        }
        self.config.measurement_time(n_samples)?;
        if n_samples == self.n_samples {
            return Ok(());
        }
        let command = format!("{} {}", self.config.commands.configure, n_samples);
        self.transport.write_line(&command)?;
        debug!(n_samples, "Sample count configured");
        self.n_samples = n_samples;
        Ok(())
    }

    /// Acquisition parameters.
    pub fn config(&self) -> &AdcConfig {
        &self.config
    }

    /// Measure and return the raw sample payload (marker removed).
    pub fn measure_raw(&mut self) -> AppResult<Vec<u8>> {
        let n_samples = self.n_samples;
        let expected = self.config.measurement_time(n_samples)?;
        let mut guard = self
            .transport
            .widen_timeout(expected, self.config.timeout_margin())?;
        guard.write_line(&self.config.commands.measure)?;
        let payload = read_frame(&mut guard, n_samples, self.config.bytes_per_word)?;
        debug!(n_samples, bytes = payload.len(), "Measurement frame received");
        Ok(payload)
    }

    /// Measure and decode to raw counts.
    pub fn measure(&mut self) -> AppResult<Vec<i64>> {
        let payload = self.measure_raw()?;
        Ok(self.config.word_format().decode(&payload)?)
    }

    /// Measure and convert to volts. The zero-point offset is not removed.
    pub fn measure_voltages(&mut self) -> AppResult<Vec<f64>> {
        let words = self.measure()?;
        Ok(words_to_voltage(
            &words,
            self.config.bits,
            self.config.full_scale_v,
        ))
    }

    /// Number of reference pulses recorded during the last measurement.
    pub fn sync_point_count(&mut self) -> AppResult<usize> {
        let command = self.config.commands.sync_count.clone();
        Ok(self.transport.query_parse(&command)?)
    }

    /// Sample indices of the reference pulses, restricted to the sample
    /// window.
    pub fn sync_event_indices(&mut self) -> AppResult<SyncEventSet> {
        let count = self.sync_point_count()?;
        self.transport.write_line(&self.config.commands.sync_data)?;
        let payload = read_frame(&mut self.transport, count, self.config.bytes_per_word)?;
        let raw = self.config.word_format().decode(&payload)?;
        let events = SyncEventSet::from_raw(&raw, self.n_samples);
        debug!(reported = count, kept = events.len(), "Sync events read");
        Ok(events)
    }

    /// Measure and assemble an offset-corrected time series.
    ///
    /// With `sync == false` the pulse sideband is not queried and every
    /// record's sync flag is false.
    pub fn acquire(&mut self, sync: bool) -> AppResult<Vec<TimeSeriesRecord>> {
        let voltages = self.measure_voltages()?;
        let events = if sync {
            self.sync_event_indices()?
        } else {
            SyncEventSet::new()
        };
        Ok(assemble(
            &voltages,
            &events,
            self.config.sampling_frequency_hz,
            self.config.offset_v,
        ))
    }

    /// Stepper motor attached to the board.
    pub fn motor(&mut self) -> Motor<'_> {
        Motor::new(&mut self.transport, &self.motor_config)
    }

    /// Underlying transport.
    pub fn transport(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Close the transport.
    pub fn close(&mut self) -> AppResult<()> {
        Ok(self.transport.close()?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapters::{MockAdapter, MockHandle};
    use crate::config::LinkConfig;
    use crate::data::codec::{encode_words, ByteOrder};

    fn frame(words: &[i64]) -> Vec<u8> {
        let mut bytes = vec![FRAME_MARKER];
        bytes.extend(encode_words(words, 3, ByteOrder::MsbFirst).unwrap());
        bytes
    }

    fn board(mock: MockAdapter, n_samples: usize) -> (Mcp3561, MockHandle) {
        let handle = mock.handle();
        let transport = Transport::open(Box::new(mock), LinkConfig::default()).unwrap();
        let config = AdcConfig {
            n_samples,
            ..AdcConfig::default()
        };
        (Mcp3561::new(transport, config).unwrap(), handle)
    }

    #[test]
    fn test_power_on_count_skips_configure() {
        let (adc, handle) = board(MockAdapter::serial("p"), 1);
        assert_eq!(adc.n_samples(), 1);
        assert!(handle.written().is_empty());
    }

    #[test]
    fn test_configure_sent_only_on_change() {
        let (mut adc, handle) = board(MockAdapter::serial("p"), 10);
        adc.set_n_samples(10).unwrap();
        adc.set_n_samples(20).unwrap();
        adc.set_n_samples(20).unwrap();
        assert_eq!(
            handle.written(),
            vec!["CONFIGURE 10".to_string(), "CONFIGURE 20".to_string()]
        );
    }

    #[test]
    fn test_zero_samples_rejected() {
        let (mut adc, handle) = board(MockAdapter::serial("p"), 1);
        assert!(matches!(
            adc.set_n_samples(0),
            Err(DaqError::InvalidSampleCount(0))
        ));
        assert_eq!(adc.n_samples(), 1);
        assert!(handle.written().is_empty());
    }

    #[test]
    fn test_measure_decodes_frame() {
        let mock = MockAdapter::serial("p").with_response("MEASURE?", frame(&[-1, 6_619_135]));
        let (mut adc, handle) = board(mock, 2);
        assert_eq!(adc.measure().unwrap(), vec![-1, 6_619_135]);
        assert_eq!(handle.written().last().unwrap(), "MEASURE?");
    }

    #[test]
    fn test_measure_voltages_uses_signed_range() {
        let mock = MockAdapter::serial("p").with_response("MEASURE?", frame(&[1 << 23, 0]));
        let (mut adc, _) = board(mock, 2);
        let volts = adc.measure_voltages().unwrap();
        assert!((volts[0] - 3.3).abs() < 1e-12);
        assert_eq!(volts[1], 0.0);
    }

    #[test]
    fn test_marker_mismatch() {
        let mock = MockAdapter::serial("p").with_response("MEASURE?", vec![0x41, 0xFF, 0xFF, 0xFF]);
        let (mut adc, _) = board(mock, 1);
        assert!(matches!(
            adc.measure_raw(),
            Err(DaqError::Transport(TransportError::MarkerMismatch { actual: 0x41 }))
        ));
    }

    #[test]
    fn test_no_reply_is_empty_read() {
        let (mut adc, _) = board(MockAdapter::serial("p"), 1);
        assert!(matches!(
            adc.measure_raw(),
            Err(DaqError::Transport(TransportError::EmptyRead { expected: 4 }))
        ));
    }

    #[test]
    fn test_truncated_frame_is_short_read() {
        let mock = MockAdapter::serial("p").with_response("MEASURE?", vec![FRAME_MARKER, 0xFF]);
        let (mut adc, _) = board(mock, 1);
        assert!(matches!(
            adc.measure_raw(),
            Err(DaqError::Transport(TransportError::ShortRead {
                expected: 4,
                actual: 2
            }))
        ));
    }

    #[test]
    fn test_long_measurement_widens_and_restores_timeout() {
        let n = 10_000;
        let mock = MockAdapter::serial("p").with_response("MEASURE?", frame(&vec![0; n]));
        let (mut adc, handle) = board(mock, n);
        assert_eq!(adc.measure().unwrap().len(), n);

        let history = handle.timeout_history();
        assert_eq!(history.len(), 3);
        assert!(history[1] >= Duration::from_secs_f64(1.1236));
        assert_eq!(history[2], Duration::from_millis(50));
        assert_eq!(adc.transport().timeout().unwrap(), Duration::from_millis(50));
    }

    #[test]
    fn test_timeout_restored_after_failed_measurement() {
        let n = 10_000;
        let (mut adc, handle) = board(MockAdapter::serial("p"), n);
        assert!(adc.measure().is_err());
        assert_eq!(handle.timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_sync_events_filtered_to_window() {
        let mock = MockAdapter::serial("p")
            .with_line("SYNC:NUMPOINTS?", "4")
            .with_response("SYNC:DATA?", frame(&[5, 2, 20, -3]));
        let (mut adc, _) = board(mock, 10);
        assert_eq!(adc.sync_point_count().unwrap(), 4);
        let events = adc.sync_event_indices().unwrap();
        assert_eq!(events.as_slice(), &[2, 5]);
    }

    #[test]
    fn test_no_sync_points_reads_bare_marker() {
        let mock = MockAdapter::serial("p")
            .with_line("SYNC:NUMPOINTS?", "0")
            .with_response("SYNC:DATA?", vec![FRAME_MARKER]);
        let (mut adc, _) = board(mock, 10);
        assert!(adc.sync_event_indices().unwrap().is_empty());
    }

    #[test]
    fn test_acquire_with_sync() {
        let mock = MockAdapter::serial("p")
            .with_response("MEASURE?", frame(&[0, 1 << 22, 0]))
            .with_line("SYNC:NUMPOINTS?", "1")
            .with_response("SYNC:DATA?", frame(&[1]));
        let (mut adc, _) = board(mock, 3);
        let records = adc.acquire(true).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.sync).collect::<Vec<_>>(),
            vec![false, true, false]
        );
        assert!((records[1].voltage - (1.65 - 3.12512)).abs() < 1e-9);
        assert!((records[2].time - 2.0 / 9765.65).abs() < 1e-12);
    }

    #[test]
    fn test_acquire_without_sync_skips_sideband() {
        let mock = MockAdapter::serial("p").with_response("MEASURE?", frame(&[0, 0]));
        let (mut adc, handle) = board(mock, 2);
        let records = adc.acquire(false).unwrap();
        assert!(records.iter().all(|r| !r.sync));
        assert!(!handle.written().iter().any(|c| c.starts_with("SYNC")));
    }

    #[test]
    fn test_closed_board_rejects_measurement() {
        let (mut adc, handle) = board(MockAdapter::serial("p"), 1);
        adc.close().unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            adc.measure(),
            Err(DaqError::Transport(TransportError::Closed))
        ));
    }

    #[test]
    fn test_invalid_config_rejected_before_io() {
        for frequency in [0.0, -1.0, f64::NAN, 1e-30] {
            let mock = MockAdapter::serial("p");
            let handle = mock.handle();
            let transport = Transport::open(Box::new(mock), LinkConfig::default()).unwrap();
            let config = AdcConfig {
                sampling_frequency_hz: frequency,
                n_samples: 10,
                ..AdcConfig::default()
            };
            assert!(matches!(
                Mcp3561::new(transport, config),
                Err(DaqError::Config(_))
            ));
            assert!(handle.written().is_empty());
        }
    }

    #[test]
    fn test_unrepresentable_measurement_time_rejected() {
        let mock = MockAdapter::serial("p");
        let handle = mock.handle();
        let transport = Transport::open(Box::new(mock), LinkConfig::default()).unwrap();
        let config = AdcConfig {
            sampling_frequency_hz: 1e-10,
            ..AdcConfig::default()
        };
        let mut adc = Mcp3561::new(transport, config).unwrap();
        assert!(matches!(
            adc.set_n_samples(10_000_000_000),
            Err(DaqError::Config(_))
        ));
        assert_eq!(adc.n_samples(), 1);
        assert!(handle.written().is_empty());
    }
}
