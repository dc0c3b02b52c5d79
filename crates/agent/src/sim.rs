//! Simulated peripherals for running the agent without a Raspberry Pi.
//!
//! Models enough physical behaviour to make the dashboard interesting:
//! - Soil and rain readings random-walk with mean reversion and ADC noise
//! - Soil slowly dries out and gets wetter while the relay is energised
//! - The climate sensor occasionally times out or returns garbage
//! - The button is never pressed

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::config::HardwareConfig;
use crate::hw::{
    relay_level, AnalogInput, ButtonInput, ClimateReading, ClimateSensor, Level, Peripherals,
    RelayLine, ADC_MAX,
};

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Analog channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct ChannelModel {
    /// Current "true" value in ADC units. High = dry.
    base: f64,
    center: f64,
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    /// Applied per sample while the pump runs (negative = wetter).
    wet_rate: f64,
}

impl ChannelModel {
    fn soil() -> Self {
        Self {
            base: 600.0,
            center: 600.0,
            drift: 0.5,
            walk_sigma: 4.0,
            mean_reversion: 0.01,
            noise_sigma: 3.0,
            wet_rate: -12.0,
        }
    }

    fn rain() -> Self {
        Self {
            base: 980.0,
            center: 980.0,
            drift: 0.0,
            walk_sigma: 6.0,
            mean_reversion: 0.05,
            noise_sigma: 4.0,
            wet_rate: 0.0,
        }
    }

    fn sample(&mut self, watering: bool) -> u16 {
        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if watering { self.wet_rate } else { 0.0 };
        self.base = (self.base + self.drift + pull + walk + wet).clamp(0.0, f64::from(ADC_MAX));

        let reading = self.base + gaussian(0.0, self.noise_sigma);
        reading.round().clamp(0.0, f64::from(ADC_MAX)) as u16
    }
}

pub struct SimAdc {
    soil_channel: u8,
    rain_channel: u8,
    models: Mutex<(ChannelModel, ChannelModel)>,
    watering: Arc<AtomicBool>,
}

impl SimAdc {
    fn new(soil_channel: u8, rain_channel: u8, watering: Arc<AtomicBool>) -> Self {
        Self {
            soil_channel,
            rain_channel,
            models: Mutex::new((ChannelModel::soil(), ChannelModel::rain())),
            watering,
        }
    }
}

impl AnalogInput for SimAdc {
    fn read_channel(&self, channel: u8) -> Result<u16> {
        let watering = self.watering.load(Ordering::Relaxed);
        let mut models = self
            .models
            .lock()
            .map_err(|_| anyhow!("sim adc state poisoned"))?;

        if channel == self.soil_channel {
            Ok(models.0.sample(watering))
        } else if channel == self.rain_channel {
            Ok(models.1.sample(false))
        } else {
            // Floating input.
            Ok(fastrand::u16(0..=ADC_MAX))
        }
    }
}

// ---------------------------------------------------------------------------
// Climate sensor
// ---------------------------------------------------------------------------

pub struct SimClimate {
    fault_prob: f64,
    invalid_prob: f64,
}

impl ClimateSensor for SimClimate {
    fn read(&self) -> Result<Option<ClimateReading>> {
        let roll = fastrand::f64();
        if roll < self.fault_prob {
            return Err(anyhow!("simulated checksum mismatch"));
        }
        if roll < self.fault_prob + self.invalid_prob {
            return Ok(None);
        }
        // DHT11 reports whole units.
        Ok(Some(ClimateReading {
            celsius: gaussian(24.0, 1.5).round(),
            humidity: gaussian(55.0, 4.0).round().clamp(20.0, 90.0),
        }))
    }
}

// ---------------------------------------------------------------------------
// Relay + button
// ---------------------------------------------------------------------------

pub struct SimRelay {
    active_low: bool,
    watering: Arc<AtomicBool>,
}

impl RelayLine for SimRelay {
    fn write(&mut self, level: Level) -> Result<()> {
        let energised = level == relay_level(true, self.active_low);
        self.watering.store(energised, Ordering::Relaxed);
        info!(?level, energised, "[sim] relay line written");
        Ok(())
    }

    fn release(&mut self) {
        info!("[sim] relay line released");
    }
}

pub struct SimButton;

impl ButtonInput for SimButton {
    fn level(&mut self) -> Level {
        Level::High
    }
}

pub fn open(cfg: &HardwareConfig) -> Peripherals {
    let watering = Arc::new(AtomicBool::new(false));
    info!(
        soil_channel = cfg.soil_channel,
        rain_channel = cfg.rain_channel,
        "[sim] peripherals initialised (no hardware)"
    );
    Peripherals {
        adc: Arc::new(SimAdc::new(
            cfg.soil_channel,
            cfg.rain_channel,
            Arc::clone(&watering),
        )),
        climate: Arc::new(SimClimate {
            fault_prob: 0.15,
            invalid_prob: 0.02,
        }),
        relay: Box::new(SimRelay {
            active_low: cfg.relay_active_low,
            watering,
        }),
        button: Box::new(SimButton),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
