use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Latest value of every sensor field. `None` until the owning reader has
/// completed its first successful cycle; serialises as `null`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorSnapshot {
    #[serde(rename = "soil_moisture")]
    pub soil_moisture_percent: Option<f64>,
    #[serde(rename = "rain_sensor")]
    pub rain_percent: Option<f64>,
    pub temperature_c: Option<f64>,
    pub temperature_f: Option<f64>,
    #[serde(rename = "humidity")]
    pub humidity_percent: Option<f64>,
}

pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Shared sensor state. Each field has exactly one writer; readers always
/// get a whole snapshot taken under the lock.
#[derive(Clone, Default)]
pub struct SharedSensors {
    inner: Arc<RwLock<SensorSnapshot>>,
}

impl SharedSensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> SensorSnapshot {
        *self.inner.read().await
    }

    pub async fn set_soil(&self, percent: f64) {
        self.inner.write().await.soil_moisture_percent = Some(percent);
    }

    pub async fn set_rain(&self, percent: f64) {
        self.inner.write().await.rain_percent = Some(percent);
    }

    /// Store temperature (both scales) and humidity as one update.
    pub async fn set_temp_humidity(&self, celsius: f64, humidity: f64) {
        let fahrenheit = celsius_to_fahrenheit(celsius);
        let mut st = self.inner.write().await;
        st.temperature_c = Some(celsius);
        st.temperature_f = Some(fahrenheit);
        st.humidity_percent = Some(humidity);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
