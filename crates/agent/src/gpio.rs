//! Raspberry Pi peripherals: MCP3008 ADC over SPI0, DHT11 through the kernel
//! IIO driver, relay and button on BCM GPIO. The rppal-backed parts are gated
//! behind the `gpio` feature.
#![cfg_attr(not(feature = "gpio"), allow(dead_code))]

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::hw::{ClimateReading, ClimateSensor};

#[cfg(feature = "gpio")]
use {
    crate::config::HardwareConfig,
    crate::hw::{AnalogInput, ButtonInput, Level, Peripherals, RelayLine},
    anyhow::{anyhow, ensure},
    rppal::gpio::{self, Gpio, InputPin, OutputPin},
    rppal::spi::{Bus, Mode, SlaveSelect, Spi},
    std::sync::{Arc, Mutex},
    tracing::info,
};

// ── MCP3008 framing ─────────────────────────────────────────────────────────
//
// Three-byte full-duplex transfer:
//   tx: [start bit, SGL/DIFF=1 + channel in bits 6:4, don't care]
//   rx: [x, null bit + B9..B8 in bits 1:0, B7..B0]

/// Highest single-ended MCP3008 input.
const MAX_CHANNEL: u8 = 7;

fn mcp3008_request(channel: u8) -> [u8; 3] {
    [0x01, (0x08 + channel) << 4, 0x00]
}

fn mcp3008_decode(rx: [u8; 3]) -> u16 {
    (u16::from(rx[1] & 0x03) << 8) | u16::from(rx[2])
}

/// MCP3008 driver backed by `rppal::spi`.
#[cfg(feature = "gpio")]
pub struct Mcp3008 {
    // rppal's Spi is Send but not Sync; readers on two tasks share it.
    spi: Mutex<Spi>,
}

#[cfg(feature = "gpio")]
impl Mcp3008 {
    pub fn new(clock_hz: u32) -> Result<Self> {
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, clock_hz, Mode::Mode0)
            .context("failed to open SPI0.0")?;
        info!(clock_hz, "mcp3008 initialised");
        Ok(Self {
            spi: Mutex::new(spi),
        })
    }
}

#[cfg(feature = "gpio")]
impl AnalogInput for Mcp3008 {
    fn read_channel(&self, channel: u8) -> Result<u16> {
        ensure!(
            channel <= MAX_CHANNEL,
            "MCP3008 channel {channel} out of range (0-{MAX_CHANNEL})"
        );
        let tx = mcp3008_request(channel);
        let mut rx = [0u8; 3];
        self.spi
            .lock()
            .map_err(|_| anyhow!("spi bus lock poisoned"))?
            .transfer(&mut rx, &tx)
            .with_context(|| format!("spi transfer failed on channel {channel}"))?;
        Ok(mcp3008_decode(rx))
    }
}

// ── DHT11 via IIO ───────────────────────────────────────────────────────────

/// DHT11/DHT22 exposed by the `dht11` device-tree overlay. The kernel does
/// the bit timing; reads fail with EIO/ETIMEDOUT on a bad transfer.
pub struct IioClimate {
    dir: PathBuf,
}

impl IioClimate {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Read a milli-unit attribute. I/O errors are transient faults; unparsable
/// content is an invalid reading.
fn read_milli(path: &Path) -> Result<Option<f64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(raw.trim().parse::<i64>().ok().map(|m| m as f64 / 1000.0))
}

impl ClimateSensor for IioClimate {
    fn read(&self) -> Result<Option<ClimateReading>> {
        let celsius = read_milli(&self.dir.join("in_temp_input"))?;
        let humidity = read_milli(&self.dir.join("in_humidityrelative_input"))?;
        Ok(match (celsius, humidity) {
            (Some(celsius), Some(humidity))
                if (-40.0..=80.0).contains(&celsius) && (0.0..=100.0).contains(&humidity) =>
            {
                Some(ClimateReading { celsius, humidity })
            }
            _ => None,
        })
    }
}

// ── Relay + button ──────────────────────────────────────────────────────────

#[cfg(feature = "gpio")]
pub struct GpioRelay {
    pin: Option<OutputPin>,
}

#[cfg(feature = "gpio")]
impl RelayLine for GpioRelay {
    fn write(&mut self, level: Level) -> Result<()> {
        let pin = self
            .pin
            .as_mut()
            .ok_or_else(|| anyhow!("relay pin already released"))?;
        match level {
            Level::Low => pin.set_low(),
            Level::High => pin.set_high(),
        }
        Ok(())
    }

    fn release(&mut self) {
        // Dropping the pin restores its original mode.
        if let Some(pin) = self.pin.take() {
            info!(pin = pin.pin(), "relay pin released");
        }
    }
}

#[cfg(feature = "gpio")]
pub struct GpioButton {
    pin: InputPin,
}

#[cfg(feature = "gpio")]
impl ButtonInput for GpioButton {
    fn level(&mut self) -> Level {
        match self.pin.read() {
            gpio::Level::Low => Level::Low,
            gpio::Level::High => Level::High,
        }
    }
}

#[cfg(feature = "gpio")]
pub fn open(cfg: &HardwareConfig) -> Result<Peripherals> {
    let gpio = Gpio::new().context("failed to open GPIO")?;

    // Fail-safe: the relay comes up de-energised.
    let relay_pin = gpio
        .get(cfg.relay_pin)
        .with_context(|| format!("failed to claim relay pin {}", cfg.relay_pin))?;
    let relay_pin = if cfg.relay_active_low {
        relay_pin.into_output_high()
    } else {
        relay_pin.into_output_low()
    };

    let button_pin = gpio
        .get(cfg.button_pin)
        .with_context(|| format!("failed to claim button pin {}", cfg.button_pin))?
        .into_input_pullup();

    info!(
        relay_pin = cfg.relay_pin,
        button_pin = cfg.button_pin,
        active_low = cfg.relay_active_low,
        climate_device = %cfg.climate_device,
        "gpio peripherals initialised"
    );

    Ok(Peripherals {
        adc: Arc::new(Mcp3008::new(cfg.spi_clock_hz)?),
        climate: Arc::new(IioClimate::new(&cfg.climate_device)),
        relay: Box::new(GpioRelay {
            pin: Some(relay_pin),
        }),
        button: Box::new(GpioButton { pin: button_pin }),
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Fresh IIO-like directory under the system temp dir.
    fn iio_dir(name: &str, temp: Option<&str>, humidity: Option<&str>) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "agri-agent-iio-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        if let Some(t) = temp {
            fs::write(dir.join("in_temp_input"), t).unwrap();
        }
        if let Some(h) = humidity {
            fs::write(dir.join("in_humidityrelative_input"), h).unwrap();
        }
        dir
    }

    // -- MCP3008 framing -----------------------------------------------------

    #[test]
    fn request_frame_channel_0() {
        assert_eq!(mcp3008_request(0), [0x01, 0x80, 0x00]);
    }

    #[test]
    fn request_frame_channel_1() {
        assert_eq!(mcp3008_request(1), [0x01, 0x90, 0x00]);
    }

    #[test]
    fn request_frame_channel_7() {
        assert_eq!(mcp3008_request(7), [0x01, 0xF0, 0x00]);
    }

    #[test]
    fn decode_full_scale() {
        assert_eq!(mcp3008_decode([0x00, 0x03, 0xFF]), 1023);
    }

    #[test]
    fn decode_ignores_high_bits_of_second_byte() {
        assert_eq!(mcp3008_decode([0xFF, 0xFE, 0x10]), (2 << 8) | 0x10);
    }

    #[test]
    fn decode_zero() {
        assert_eq!(mcp3008_decode([0x00, 0x00, 0x00]), 0);
    }

    // -- IIO climate ---------------------------------------------------------

    #[test]
    fn iio_reading_in_milli_units() {
        let dir = iio_dir("ok", Some("23000\n"), Some("48000\n"));
        let reading = IioClimate::new(&dir).read().unwrap().unwrap();
        assert_eq!(reading.celsius, 23.0);
        assert_eq!(reading.humidity, 48.0);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn iio_missing_attribute_is_transient_error() {
        let dir = iio_dir("missing", Some("23000"), None);
        assert!(IioClimate::new(&dir).read().is_err());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn iio_garbage_is_invalid_reading() {
        let dir = iio_dir("garbage", Some("??"), Some("48000"));
        assert_eq!(IioClimate::new(&dir).read().unwrap(), None);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn iio_out_of_range_is_invalid_reading() {
        let dir = iio_dir("range", Some("23000"), Some("148000"));
        assert_eq!(IioClimate::new(&dir).read().unwrap(), None);
        fs::remove_dir_all(dir).unwrap();
    }
}
