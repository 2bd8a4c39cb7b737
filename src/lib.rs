//! SCPI instrument transport and binary sample acquisition.
//!
//! This library finds an instrument on a VISA bus or a serial port by its
//! `*IDN?` reply, talks to it through one line-oriented [`Transport`], and
//! drives the MCP3561 ADC development board: binary sample frames, the sync
//! pulse sideband, and the stepper motor on the same board.
//!
//! ```no_run
//! use rust_scpi::{config::Settings, instrument::Mcp3561};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load()?;
//!     let mut adc = Mcp3561::connect(&settings)?;
//!     adc.set_n_samples(1000)?;
//!     let records = adc.acquire(true)?;
//!     println!("{} samples", records.len());
//!     adc.close()?;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod config;
pub mod data;
pub mod discovery;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod limits;
pub mod logging;
pub mod transport;

pub use config::{Settings, TransportKind};
pub use discovery::{discover, discover_with};
pub use error::{AppResult, DaqError};
pub use transport::Transport;
