//! Hardware boundary. Everything above this module talks to these traits;
//! the `gpio` feature wires them to real Raspberry Pi peripherals, otherwise
//! the simulator in `sim.rs` stands in.

use anyhow::Result;
use std::sync::Arc;

/// Full-scale value of the 10-bit MCP3008 ADC.
pub const ADC_MAX: u16 = 1023;

// ---------------------------------------------------------------------------
// Line levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Output level that puts the relay in the requested logical state.
///
/// Active-low boards energise on LOW: `on` -> LOW, `off` -> HIGH.
pub fn relay_level(on: bool, active_low: bool) -> Level {
    match (on, active_low) {
        (true, true) | (false, false) => Level::Low,
        (false, true) | (true, false) => Level::High,
    }
}

// ---------------------------------------------------------------------------
// Peripheral traits
// ---------------------------------------------------------------------------

/// Multi-channel analog input (soil moisture and rain sensors share one ADC).
pub trait AnalogInput: Send + Sync {
    /// Raw 10-bit sample from `channel`, in `0..=ADC_MAX`.
    fn read_channel(&self, channel: u8) -> Result<u16>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    pub celsius: f64,
    pub humidity: f64,
}

/// DHT-style temperature/humidity sensor.
pub trait ClimateSensor: Send + Sync {
    /// `Err` is a transient fault worth retrying; `Ok(None)` means the sensor
    /// answered but produced no usable value.
    fn read(&self) -> Result<Option<ClimateReading>>;
}

/// The pump relay output line.
pub trait RelayLine: Send {
    fn write(&mut self, level: Level) -> Result<()>;

    /// Hand the line back to the OS. Called once, after the final write.
    fn release(&mut self) {}
}

/// Momentary push button wired with a pull-up (idle HIGH, pressed LOW).
pub trait ButtonInput: Send {
    fn level(&mut self) -> Level;
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// All peripherals the agent drives, boxed behind the traits above.
pub struct Peripherals {
    pub adc: Arc<dyn AnalogInput>,
    pub climate: Arc<dyn ClimateSensor>,
    pub relay: Box<dyn RelayLine>,
    pub button: Box<dyn ButtonInput>,
}

#[cfg(feature = "gpio")]
pub fn open(cfg: &crate::config::HardwareConfig) -> Result<Peripherals> {
    crate::gpio::open(cfg)
}

#[cfg(not(feature = "gpio"))]
pub fn open(cfg: &crate::config::HardwareConfig) -> Result<Peripherals> {
    Ok(crate::sim::open(cfg))
}

// ===========================================================================
// Test doubles
// ===========================================================================
