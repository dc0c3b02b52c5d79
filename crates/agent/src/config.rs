//! TOML config file loading, environment overrides and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub cloud: CloudConfig,
    pub hardware: HardwareConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive_sec: u64,
    pub publish_interval_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "agri-agent".into(),
            topic_prefix: "agri".into(),
            keep_alive_sec: 30,
            publish_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub relay_pin: u8,
    pub button_pin: u8,
    /// Many common relay boards are active-low. If yours is active-high, set false.
    pub relay_active_low: bool,
    pub soil_channel: u8,
    pub rain_channel: u8,
    pub spi_clock_hz: u32,
    /// IIO device directory exposed by the kernel `dht11` overlay.
    pub climate_device: String,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            relay_pin: 27,
            button_pin: 16,
            relay_active_low: true,
            soil_channel: 0,
            rain_channel: 1,
            spi_clock_hz: 1_000_000,
            climate_device: "/sys/bus/iio/devices/iio:device0".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub sensor_interval_ms: u64,
    pub climate_attempts: u32,
    pub climate_backoff_ms: u64,
    pub button_poll_ms: u64,
    pub button_debounce_samples: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sensor_interval_ms: 1000,
            climate_attempts: 3,
            climate_backoff_ms: 2000,
            button_poll_ms: 100,
            button_debounce_samples: 2,
        }
    }
}

impl TimingConfig {
    pub fn sensor_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_interval_ms)
    }

    pub fn climate_backoff(&self) -> Duration {
        Duration::from_millis(self.climate_backoff_ms)
    }

    pub fn button_poll(&self) -> Duration {
        Duration::from_millis(self.button_poll_ms)
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

/// MCP3008 has eight single-ended inputs.
const MAX_ADC_CHANNEL: u8 = 7;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_endpoints(&mut errors);
        self.validate_hardware(&mut errors);
        self.validate_timing(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_endpoints(&self, errors: &mut Vec<String>) {
        if self.http.host.trim().is_empty() {
            errors.push("http.host is empty".into());
        }
        if self.cloud.host.trim().is_empty() {
            errors.push("cloud.host is empty".into());
        }
        if self.cloud.client_id.trim().is_empty() {
            errors.push("cloud.client_id is empty".into());
        }
        let prefix = &self.cloud.topic_prefix;
        if prefix.trim().is_empty() {
            errors.push("cloud.topic_prefix is empty".into());
        } else if prefix.trim() != prefix {
            errors.push(format!(
                "cloud.topic_prefix '{prefix}' has leading or trailing whitespace"
            ));
        } else if prefix.contains(['+', '#']) {
            errors.push(format!(
                "cloud.topic_prefix '{prefix}' must not contain MQTT wildcards"
            ));
        }
        if self.cloud.keep_alive_sec == 0 {
            errors.push("cloud.keep_alive_sec must be positive".into());
        }
        if self.cloud.publish_interval_ms == 0 {
            errors.push("cloud.publish_interval_ms must be positive".into());
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let hw = &self.hardware;

        for (name, pin) in [("relay_pin", hw.relay_pin), ("button_pin", hw.button_pin)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "hardware.{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if hw.relay_pin == hw.button_pin {
            errors.push(format!(
                "hardware.relay_pin and hardware.button_pin are both {}",
                hw.relay_pin
            ));
        }

        for (name, ch) in [("soil_channel", hw.soil_channel), ("rain_channel", hw.rain_channel)] {
            if ch > MAX_ADC_CHANNEL {
                errors.push(format!(
                    "hardware.{name} {ch} out of MCP3008 range [0, {MAX_ADC_CHANNEL}]"
                ));
            }
        }
        if hw.soil_channel == hw.rain_channel {
            errors.push(format!(
                "hardware.soil_channel and hardware.rain_channel are both {}",
                hw.soil_channel
            ));
        }

        if hw.spi_clock_hz == 0 {
            errors.push("hardware.spi_clock_hz must be positive".into());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        for (name, value) in [
            ("sensor_interval_ms", t.sensor_interval_ms),
            ("button_poll_ms", t.button_poll_ms),
        ] {
            if value == 0 {
                errors.push(format!("timing.{name} must be positive"));
            }
        }
        if t.climate_attempts == 0 {
            errors.push("timing.climate_attempts must be positive".into());
        }
        if t.button_debounce_samples == 0 {
            errors.push("timing.button_debounce_samples must be positive".into());
        }
    }

    /// Apply `WEB_PORT`, `MQTT_HOST`, `MQTT_PORT` and `RELAY_ACTIVE_LOW`
    /// as resolved by `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("WEB_PORT").and_then(|s| s.parse().ok()) {
            self.http.port = port;
        }
        if let Some(host) = lookup("MQTT_HOST") {
            self.cloud.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.cloud.port = port;
        }
        if let Some(v) = lookup("RELAY_ACTIVE_LOW") {
            self.hardware.relay_active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply env overrides and validate a TOML config file.
/// A missing file yields the defaults.
pub fn load(path: &str) -> Result<Config> {
    load_with(path, |key| env::var(key).ok())
}

fn load_with(path: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };

    config.apply_overrides(lookup);
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
