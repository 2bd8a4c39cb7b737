//! CLI entry point for rust_scpi
//!
//! ```bash
//! rust_scpi list
//! rust_scpi --device "MCP3561 Dev Board v1" identify
//! rust_scpi measure --samples 10000 > trace.csv
//! rust_scpi --kind bus --device "" identify
//! ```

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_scpi::config::{Settings, TransportKind, DEFAULT_CONFIG_PATH};
use rust_scpi::discovery::{discover, list_resources};
use rust_scpi::instrument::Mcp3561;
use rust_scpi::logging;
use rust_scpi::transport::Transport;
use tracing::info;

#[derive(Parser)]
#[command(name = "rust_scpi")]
#[command(about = "Discover SCPI instruments and acquire ADC board samples", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Link kind, overriding `link.kind`
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    /// Identity to match, overriding `discovery.device_name` (empty accepts
    /// the first instrument)
    #[arg(long)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum KindArg {
    Bus,
    Serial,
}

impl From<KindArg> for TransportKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Bus => TransportKind::Bus,
            KindArg::Serial => TransportKind::Serial,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate resources
    List,

    /// Print the instrument's *IDN? reply
    Identify,

    /// Send *RST
    Reset,

    /// Acquire a time series and write it as CSV
    Measure {
        /// Samples to acquire, overriding `adc.n_samples`
        #[arg(long)]
        samples: Option<usize>,

        /// Skip the sync pulse query
        #[arg(long)]
        no_sync: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    if let Some(kind) = cli.kind {
        settings.link.kind = kind.into();
    }
    if let Some(device) = cli.device {
        settings.discovery.device_name = device;
    }
    logging::init_from_config(&settings);

    match cli.command {
        Commands::List => list(&settings),
        Commands::Identify => {
            let mut transport = connect(&settings)?;
            println!("{}", transport.identify()?);
            transport.close()?;
            Ok(())
        }
        Commands::Reset => {
            let mut transport = connect(&settings)?;
            transport.reset()?;
            transport.close()?;
            Ok(())
        }
        Commands::Measure { samples, no_sync } => measure(settings, samples, !no_sync),
    }
}

fn list(settings: &Settings) -> Result<()> {
    let resources = list_resources(settings.link.kind, &settings.discovery)?;
    if resources.is_empty() {
        eprintln!("No {} resources found", settings.link.kind);
    }
    for resource in resources {
        println!("{}", resource);
    }
    Ok(())
}

fn connect(settings: &Settings) -> Result<Transport> {
    let transport = discover(
        settings.link.kind,
        &settings.discovery.device_name,
        &settings.link,
        &settings.discovery,
    )?;
    Ok(transport)
}

fn apply_sample_override(settings: &mut Settings, samples: Option<usize>) {
    if let Some(samples) = samples {
        settings.adc.n_samples = samples;
    }
}

fn measure(mut settings: Settings, samples: Option<usize>, sync: bool) -> Result<()> {
    apply_sample_override(&mut settings, samples);
    let mut adc = Mcp3561::connect(&settings)?;
    let records = adc.acquire(sync)?;
    adc.close()?;
    info!(samples = records.len(), "Acquisition complete");

    let mut writer = csv::Writer::from_writer(io::stdout().lock());
    for record in &records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_scpi::adapters::MockAdapter;
    use rust_scpi::config::LinkConfig;

    fn measure_args(args: &[&str]) -> Option<usize> {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Measure { samples, .. } => samples,
            _ => panic!("not a measure command"),
        }
    }

    #[test]
    fn test_samples_flag_is_optional() {
        assert_eq!(measure_args(&["rust_scpi", "measure"]), None);
        assert_eq!(
            measure_args(&["rust_scpi", "measure", "--samples", "250"]),
            Some(250)
        );
    }

    #[test]
    fn test_configured_samples_reach_board() {
        let mut settings = Settings::default();
        settings.adc.n_samples = 10_000;
        apply_sample_override(&mut settings, None);
        assert_eq!(settings.adc.n_samples, 10_000);

        let mock = MockAdapter::serial("/dev/ttyACM0");
        let handle = mock.handle();
        let transport = Transport::open(Box::new(mock), LinkConfig::default()).unwrap();
        let adc = Mcp3561::new(transport, settings.adc.clone()).unwrap();
        assert_eq!(adc.n_samples(), 10_000);
        assert_eq!(handle.written(), vec!["CONFIGURE 10000".to_string()]);
    }

    #[test]
    fn test_samples_flag_overrides_config() {
        let mut settings = Settings::default();
        settings.adc.n_samples = 10_000;
        apply_sample_override(&mut settings, Some(5));
        assert_eq!(settings.adc.n_samples, 5);
    }
}
