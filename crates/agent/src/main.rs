mod button;
mod cloud;
mod config;
mod gpio;
mod hw;
mod pump;
mod readers;
#[cfg_attr(feature = "gpio", allow(dead_code))]
mod sim;
mod state;
mod web;

use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, sync::Arc, time::Duration};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cloud::CloudChannel;
use pump::PumpArbiter;
use readers::{AnalogKind, RetryPolicy};
use state::SharedSensors;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // Bind before touching hardware so a busy port fails fast.
    let listener = web::bind(&cfg.http.host, cfg.http.port).await?;

    // ── Hardware + shared state ─────────────────────────────────────
    let periph = hw::open(&cfg.hardware)?;

    let (echo_tx, echo_rx) = mpsc::unbounded_channel();
    let arbiter = Arc::new(PumpArbiter::new(
        periph.relay,
        cfg.hardware.relay_active_low,
        echo_tx,
    )?);
    let sensors = SharedSensors::new();

    // ── Sensor readers + button ─────────────────────────────────────
    let interval = cfg.timing.sensor_interval();
    tokio::spawn(readers::run_analog(
        Arc::clone(&periph.adc),
        cfg.hardware.soil_channel,
        AnalogKind::Soil,
        sensors.clone(),
        interval,
    ));
    tokio::spawn(readers::run_analog(
        periph.adc,
        cfg.hardware.rain_channel,
        AnalogKind::Rain,
        sensors.clone(),
        interval,
    ));
    tokio::spawn(readers::run_climate(
        periph.climate,
        RetryPolicy {
            attempts: cfg.timing.climate_attempts,
            backoff: cfg.timing.climate_backoff(),
        },
        sensors.clone(),
        interval,
    ));
    tokio::spawn(button::run(
        periph.button,
        Arc::clone(&arbiter),
        cfg.timing.button_poll(),
        cfg.timing.button_debounce_samples,
    ));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        sensors: sensors.clone(),
        arbiter: Arc::clone(&arbiter),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(listener, web_state).await {
            error!("{e:#}");
        }
    });

    // ── Cloud channel ───────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.cloud.client_id, &cfg.cloud.host, cfg.cloud.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.cloud.keep_alive_sec));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    let mut cloud = CloudChannel::new(client, cfg.cloud.topic_prefix.clone());
    cloud::register_pump_handler(&mut cloud, Arc::clone(&arbiter));

    info!(
        http_port = cfg.http.port,
        broker = %format!("{}:{}", cfg.cloud.host, cfg.cloud.port),
        "agent running"
    );

    let outcome = tokio::select! {
        _ = cloud::drive(
            cloud,
            eventloop,
            sensors,
            echo_rx,
            Duration::from_millis(cfg.cloud.publish_interval_ms),
        ) => Err(anyhow!("cloud driver stopped")),
        _ = shutdown_signal() => Ok(()),
        _ = arbiter.wait_for_fault() => Err(anyhow!("relay fault, pump state unknown")),
    };

    // ── Shutdown: relay OFF, line released ──────────────────────────
    info!("shutting down");
    if let Err(e) = arbiter.shutdown().await {
        error!("{e:#}");
    }
    info!("relay released");

    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received"),
        _ = terminate => info!("terminate received"),
    }
}
