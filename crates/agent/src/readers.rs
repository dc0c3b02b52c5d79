//! Periodic sensor pollers. Each loop owns one slice of [`SharedSensors`]
//! and never waits on another reader.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::hw::{AnalogInput, ClimateReading, ClimateSensor, ADC_MAX};
use crate::state::SharedSensors;

/// Map a raw ADC sample to a percentage. The probes read high when dry, so
/// the scale is inverted: 0 -> 100 %, 1023 -> 0 %.
pub fn raw_to_percent(raw: u16) -> f64 {
    let raw = raw.min(ADC_MAX);
    100.0 - (f64::from(raw) / f64::from(ADC_MAX)) * 100.0
}

// ---------------------------------------------------------------------------
// Analog readers (soil moisture, rain)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogKind {
    Soil,
    Rain,
}

impl AnalogKind {
    fn name(self) -> &'static str {
        match self {
            Self::Soil => "soil_moisture",
            Self::Rain => "rain",
        }
    }
}

/// One analog cycle. A failed ADC transfer leaves the previous value in place.
pub async fn sample_analog(
    adc: &dyn AnalogInput,
    channel: u8,
    kind: AnalogKind,
    sensors: &SharedSensors,
) {
    let raw = match adc.read_channel(channel) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(sensor = kind.name(), channel, "adc read failed: {e:#}");
            return;
        }
    };

    let percent = raw_to_percent(raw);
    debug!(sensor = kind.name(), channel, raw, percent, "analog sample");

    match kind {
        AnalogKind::Soil => sensors.set_soil(percent).await,
        AnalogKind::Rain => sensors.set_rain(percent).await,
    }
}

pub async fn run_analog(
    adc: Arc<dyn AnalogInput>,
    channel: u8,
    kind: AnalogKind,
    sensors: SharedSensors,
    interval: Duration,
) {
    tracing::info!(sensor = kind.name(), channel, "analog reader started");
    loop {
        sample_analog(adc.as_ref(), channel, kind, &sensors).await;
        sleep(interval).await;
    }
}

// ---------------------------------------------------------------------------
// Climate reader (temperature + humidity)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClimateOutcome {
    Stored(ClimateReading),
    /// Sensor answered without a usable value; cycle skipped.
    Invalid,
    /// Every attempt hit a transient fault; cycle skipped.
    Exhausted,
}

/// One climate cycle: up to `policy.attempts` reads with `policy.backoff`
/// between failed attempts. Only a successful read touches `sensors`.
pub async fn sample_climate(
    sensor: &dyn ClimateSensor,
    policy: RetryPolicy,
    sensors: &SharedSensors,
) -> ClimateOutcome {
    for attempt in 1..=policy.attempts {
        match sensor.read() {
            Ok(Some(reading)) => {
                sensors
                    .set_temp_humidity(reading.celsius, reading.humidity)
                    .await;
                debug!(
                    celsius = reading.celsius,
                    humidity = reading.humidity,
                    attempt,
                    "climate sample"
                );
                return ClimateOutcome::Stored(reading);
            }
            Ok(None) => {
                warn!("invalid climate sensor reading, skipping cycle");
                return ClimateOutcome::Invalid;
            }
            Err(e) => {
                warn!(attempt, attempts = policy.attempts, "climate read failed: {e:#}");
                if attempt < policy.attempts {
                    sleep(policy.backoff).await;
                }
            }
        }
    }

    warn!(attempts = policy.attempts, "climate sensor gave up this cycle");
    ClimateOutcome::Exhausted
}

pub async fn run_climate(
    sensor: Arc<dyn ClimateSensor>,
    policy: RetryPolicy,
    sensors: SharedSensors,
    interval: Duration,
) {
    tracing::info!(
        attempts = policy.attempts,
        backoff_ms = policy.backoff.as_millis() as u64,
        "climate reader started"
    );
    loop {
        sample_climate(sensor.as_ref(), policy, &sensors).await;
        sleep(interval).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
