use std::fs;

use rust_scpi::adapters::MockAdapter;
use rust_scpi::config::{Settings, TransportKind};
use rust_scpi::data::ByteOrder;
use rust_scpi::instrument::Mcp3561;
use rust_scpi::Transport;
use serial_test::serial;
use tempfile::tempdir;

fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("RUST_SCPI_") {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    clear_env();
    let dir = tempdir().unwrap();
    let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
#[serial]
fn test_file_values_override_defaults() {
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("rust_scpi.toml");
    fs::write(
        &path,
        r#"
[link]
kind = "bus"
timeout_ms = 2000

[adc]
n_samples = 500
byte_order = "lsb"
"#,
    )
    .unwrap();

    let settings = Settings::load_from(&path).unwrap();
    assert_eq!(settings.link.kind, TransportKind::Bus);
    assert_eq!(settings.link.timeout_ms, 2000);
    assert_eq!(settings.link.read_terminator, "\r\n");
    assert_eq!(settings.adc.n_samples, 500);
    assert_eq!(settings.adc.byte_order, ByteOrder::LsbFirst);
    assert_eq!(settings.adc.bits, 24);
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("rust_scpi.toml");
    fs::write(&path, "[adc]\nn_samples = 500\n").unwrap();

    std::env::set_var("RUST_SCPI_ADC__N_SAMPLES", "10000");
    std::env::set_var("RUST_SCPI_APPLICATION__LOG_LEVEL", "debug");
    let result = Settings::load_from(&path);
    clear_env();

    let settings = result.unwrap();
    assert_eq!(settings.adc.n_samples, 10_000);
    assert_eq!(settings.application.log_level, "debug");
}

#[test]
#[serial]
fn test_env_sample_count_configures_board() {
    clear_env();
    let dir = tempdir().unwrap();
    std::env::set_var("RUST_SCPI_ADC__N_SAMPLES", "10000");
    let result = Settings::load_from(dir.path().join("absent.toml"));
    clear_env();
    let settings = result.unwrap();

    let mock = MockAdapter::serial("/dev/ttyACM0");
    let handle = mock.handle();
    let transport = Transport::open(Box::new(mock), settings.link.clone()).unwrap();
    Mcp3561::new(transport, settings.adc).unwrap();
    assert_eq!(handle.written(), vec!["CONFIGURE 10000".to_string()]);
}

#[test]
#[serial]
fn test_invalid_file_values_rejected() {
    clear_env();
    let dir = tempdir().unwrap();
    let path = dir.path().join("rust_scpi.toml");
    fs::write(&path, "[adc]\nbytes_per_word = 9\n").unwrap();
    let err = Settings::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("bytes_per_word"));
}

#[test]
#[serial]
fn test_shipped_config_matches_defaults() {
    clear_env();
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/rust_scpi.toml");
    let settings = Settings::load_from(path).unwrap();
    let defaults = Settings::default();
    assert_eq!(settings.link, defaults.link);
    assert_eq!(settings.discovery, defaults.discovery);
    assert_eq!(settings.adc, defaults.adc);
    assert!((settings.motor.microsteps_per_nm - defaults.motor.microsteps_per_nm).abs() < 1e-9);
}
