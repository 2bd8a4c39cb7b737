//! Instrument drivers built on [`Transport`](crate::transport::Transport).
//!
//! - [`mcp3561`]: MCP3561 ADC development board (sample acquisition, sync
//!   pulse sideband)
//! - [`motor`]: stepper motor on the same board and monochromator
//!   wavelength tracking

pub mod mcp3561;
pub mod motor;

pub use mcp3561::Mcp3561;
pub use motor::{Direction, Monochromator, Motor};
