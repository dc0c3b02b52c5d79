//! Cloud dashboard channel over MQTT.
//!
//! The dashboard addresses "virtual pins". Each pin maps to a topic:
//! `<prefix>/vpin/<n>` for values we push, `<prefix>/vpin/<n>/set` for
//! commands we receive. Payloads are plain-text numbers.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::pump::{PumpArbiter, Source};
use crate::state::{SensorSnapshot, SharedSensors};

// ---------------------------------------------------------------------------
// Virtual pins
// ---------------------------------------------------------------------------

pub const VPIN_HUMIDITY: u8 = 0;
pub const VPIN_TEMPERATURE: u8 = 1;
pub const VPIN_SOIL: u8 = 2;
pub const VPIN_RAIN: u8 = 3;
/// Pump switch: inbound command and outbound echo of button presses.
pub const VPIN_PUMP: u8 = 4;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

pub(crate) fn value_topic(prefix: &str, pin: u8) -> String {
    format!("{prefix}/vpin/{pin}")
}

pub(crate) fn command_filter(prefix: &str) -> String {
    format!("{prefix}/vpin/+/set")
}

/// Extract the pin from "<prefix>/vpin/<n>/set".
pub(crate) fn extract_command_pin(prefix: &str, topic: &str) -> Option<u8> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() == 3 && parts[0] == "vpin" && parts[2] == "set" {
        parts[1].parse().ok()
    } else {
        None
    }
}

/// Parse an integer-like switch payload: nonzero is on, zero is off.
pub(crate) fn parse_switch_value(value: &str) -> Result<bool, String> {
    let s = value.trim();
    if let Ok(n) = s.parse::<i64>() {
        return Ok(n != 0);
    }
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(f != 0.0),
        _ => Err(format!("unrecognised switch value '{s}'")),
    }
}

/// Pin/value pairs for every sensor field that currently has a value.
pub fn status_points(snap: &SensorSnapshot) -> Vec<(u8, f64)> {
    [
        (VPIN_HUMIDITY, snap.humidity_percent),
        (VPIN_TEMPERATURE, snap.temperature_c),
        (VPIN_SOIL, snap.soil_moisture_percent),
        (VPIN_RAIN, snap.rain_percent),
    ]
    .into_iter()
    .filter_map(|(pin, value)| value.map(|v| (pin, v)))
    .collect()
}

// ---------------------------------------------------------------------------
// Channel + handler registry
// ---------------------------------------------------------------------------

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Box<dyn Fn(String) -> HandlerFuture + Send + Sync>;

pub struct CloudChannel {
    client: AsyncClient,
    prefix: String,
    handlers: HashMap<u8, Handler>,
}

impl CloudChannel {
    pub fn new(client: AsyncClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for writes to virtual pin `pin`.
    pub fn on<F, Fut>(&mut self, pin: u8, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .insert(pin, Box::new(move |value| -> HandlerFuture { Box::pin(handler(value)) }));
    }

    /// Queue a value for a virtual pin. Never waits: if the client queue is
    /// full the value is dropped and `false` returned.
    pub fn virtual_write(&self, pin: u8, value: impl Display) -> bool {
        let topic = value_topic(&self.prefix, pin);
        match self
            .client
            .try_publish(&topic, QoS::AtMostOnce, false, value.to_string())
        {
            Ok(()) => true,
            Err(e) => {
                debug!(%topic, "cloud publish dropped: {e}");
                false
            }
        }
    }

    /// Queue the command subscription. `false` if the client queue is full.
    fn subscribe(&self) -> bool {
        let filter = command_filter(&self.prefix);
        match self.client.try_subscribe(&filter, QoS::AtLeastOnce) {
            Ok(()) => {
                info!(%filter, "cloud subscribed");
                true
            }
            Err(e) => {
                warn!(%filter, "cloud subscribe deferred: {e}");
                false
            }
        }
    }

    /// Route an inbound publish to its pin handler. Returns `false` when the
    /// topic is not a command topic or no handler is registered.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(pin) = extract_command_pin(&self.prefix, topic) else {
            return false;
        };
        let Some(handler) = self.handlers.get(&pin) else {
            return false;
        };
        let value = String::from_utf8_lossy(payload).trim().to_string();
        debug!(pin, %value, "cloud command");
        handler(value).await;
        true
    }

    /// Push every present sensor field. Returns how many values were queued.
    pub async fn publish_status(&self, sensors: &SharedSensors) -> usize {
        let snap = sensors.get().await;
        status_points(&snap)
            .into_iter()
            .filter(|&(pin, v)| self.virtual_write(pin, format!("{v:.2}")))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Inbound pump command
// ---------------------------------------------------------------------------

pub async fn handle_pump_command(arbiter: &PumpArbiter, value: &str) {
    let on = match parse_switch_value(value) {
        Ok(on) => on,
        Err(msg) => {
            warn!("cloud pump command ignored: {msg}");
            return;
        }
    };
    if let Err(e) = arbiter.set_pump(on, Source::Remote).await {
        error!("cloud pump command failed: {e:#}");
    }
}

/// Register the pump switch handler on [`VPIN_PUMP`].
pub fn register_pump_handler(cloud: &mut CloudChannel, arbiter: Arc<PumpArbiter>) {
    cloud.on(VPIN_PUMP, move |value| {
        let arbiter = Arc::clone(&arbiter);
        async move { handle_pump_command(&arbiter, &value).await }
    });
}

// ---------------------------------------------------------------------------
// Driver loop
// ---------------------------------------------------------------------------

/// Per-connection bookkeeping for [`drive`].
struct Driver {
    cloud: CloudChannel,
    sensors: SharedSensors,
    /// Set on ConnAck, cleared once the command subscription is queued.
    subscribe_pending: bool,
}

impl Driver {
    fn new(cloud: CloudChannel, sensors: SharedSensors) -> Self {
        Self {
            cloud,
            sensors,
            subscribe_pending: false,
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::Publish(p)) => {
                if !self.cloud.dispatch(&p.topic, &p.payload).await {
                    debug!(topic = %p.topic, "unhandled cloud topic");
                }
            }
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("cloud connected");
                self.subscribe_pending = true;
                self.retry_subscribe();
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("cloud disconnected");
            }
            _ => {}
        }
    }

    /// The request queue may still be full of status pushes from while the
    /// broker was away, so a failed subscribe is retried on every tick.
    fn retry_subscribe(&mut self) {
        if self.subscribe_pending && self.cloud.subscribe() {
            self.subscribe_pending = false;
        }
    }

    async fn tick(&mut self) -> usize {
        self.retry_subscribe();
        self.cloud.publish_status(&self.sensors).await
    }

    fn echo(&self, on: bool) -> bool {
        self.cloud.virtual_write(VPIN_PUMP, u8::from(on))
    }
}

/// Cooperative driver: pumps the MQTT event loop, fires the status push
/// timer, and mirrors button-originated pump changes to [`VPIN_PUMP`].
pub async fn drive(
    cloud: CloudChannel,
    mut eventloop: EventLoop,
    sensors: SharedSensors,
    mut echo: mpsc::UnboundedReceiver<bool>,
    publish_every: Duration,
) {
    let mut ticker = tokio::time::interval(publish_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        prefix = %cloud.prefix,
        publish_ms = publish_every.as_millis() as u64,
        "cloud driver started"
    );
    let mut driver = Driver::new(cloud, sensors);

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(event) => driver.handle_event(event).await,
                Err(e) => {
                    warn!("cloud connection error: {e}. reconnecting...");
                    sleep(RECONNECT_DELAY).await;
                }
            },
            _ = ticker.tick() => {
                let pushed = driver.tick().await;
                debug!(pushed, "status pushed");
            }
            Some(on) = echo.recv() => {
                driver.echo(on);
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::RecordingRelay;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, Request};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Client whose event loop is never polled; requests just queue up.
    /// The event loop must stay alive for the duration of the test.
    fn test_mqtt(cap: usize) -> (AsyncClient, EventLoop) {
        let opts = rumqttc::MqttOptions::new("test-cloud", "127.0.0.1", 1883);
        AsyncClient::new(opts, cap)
    }

    fn test_arbiter() -> Arc<PumpArbiter> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(PumpArbiter::new(Box::new(RecordingRelay::default()), true, tx).unwrap())
    }

    // -- topics ---------------------------------------------------------------

    #[test]
    fn value_topic_format() {
        assert_eq!(value_topic("agri", 2), "agri/vpin/2");
        assert_eq!(value_topic("farm/field-7", 4), "farm/field-7/vpin/4");
    }

    #[test]
    fn command_filter_format() {
        assert_eq!(command_filter("agri"), "agri/vpin/+/set");
    }

    #[test]
    fn extract_command_pin_valid() {
        assert_eq!(extract_command_pin("agri", "agri/vpin/4/set"), Some(4));
        assert_eq!(
            extract_command_pin("farm/field-7", "farm/field-7/vpin/0/set"),
            Some(0)
        );
    }

    #[test]
    fn extract_command_pin_wrong_prefix() {
        assert_eq!(extract_command_pin("agri", "other/vpin/4/set"), None);
        assert_eq!(extract_command_pin("agri", "agrix/vpin/4/set"), None);
    }

    #[test]
    fn extract_command_pin_value_topic_is_not_a_command() {
        assert_eq!(extract_command_pin("agri", "agri/vpin/4"), None);
    }

    #[test]
    fn extract_command_pin_non_numeric() {
        assert_eq!(extract_command_pin("agri", "agri/vpin/pump/set"), None);
        assert_eq!(extract_command_pin("agri", "agri/vpin/300/set"), None);
    }

    // -- switch payloads ------------------------------------------------------

    #[test]
    fn switch_value_integers() {
        assert_eq!(parse_switch_value("1"), Ok(true));
        assert_eq!(parse_switch_value("0"), Ok(false));
        assert_eq!(parse_switch_value("255"), Ok(true));
        assert_eq!(parse_switch_value("-1"), Ok(true));
    }

    #[test]
    fn switch_value_with_whitespace_and_decimals() {
        assert_eq!(parse_switch_value(" 1 \n"), Ok(true));
        assert_eq!(parse_switch_value("0.0"), Ok(false));
        assert_eq!(parse_switch_value("1.0"), Ok(true));
    }

    #[test]
    fn switch_value_garbage() {
        assert!(parse_switch_value("on").is_err());
        assert!(parse_switch_value("").is_err());
        assert!(parse_switch_value("NaN").is_err());
    }

    // -- status points --------------------------------------------------------

    #[test]
    fn status_points_skip_absent_fields() {
        let snap = SensorSnapshot {
            soil_moisture_percent: Some(33.0),
            ..SensorSnapshot::default()
        };
        assert_eq!(status_points(&snap), vec![(VPIN_SOIL, 33.0)]);
    }

    #[test]
    fn status_points_empty_snapshot() {
        assert!(status_points(&SensorSnapshot::default()).is_empty());
    }

    #[test]
    fn status_points_full_snapshot_order() {
        let snap = SensorSnapshot {
            soil_moisture_percent: Some(40.0),
            rain_percent: Some(10.0),
            temperature_c: Some(22.0),
            temperature_f: Some(71.6),
            humidity_percent: Some(55.0),
        };
        let pins: Vec<u8> = status_points(&snap).into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            pins,
            vec![VPIN_HUMIDITY, VPIN_TEMPERATURE, VPIN_SOIL, VPIN_RAIN]
        );
    }

    // -- channel --------------------------------------------------------------

    #[tokio::test]
    async fn dispatch_routes_to_registered_pin() {
        let (client, _el) = test_mqtt(10);
        let mut cloud = CloudChannel::new(client, "agri");
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            cloud.on(7, move |value| {
                let hits = Arc::clone(&hits);
                async move {
                    assert_eq!(value, "42");
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        assert!(cloud.dispatch("agri/vpin/7/set", b" 42 ").await);
        assert!(!cloud.dispatch("agri/vpin/8/set", b"1").await);
        assert!(!cloud.dispatch("agri/vpin/7", b"1").await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pump_command_drives_arbiter() {
        let (client, _el) = test_mqtt(10);
        let mut cloud = CloudChannel::new(client, "agri");
        let arbiter = test_arbiter();
        register_pump_handler(&mut cloud, Arc::clone(&arbiter));

        assert!(cloud.dispatch("agri/vpin/4/set", b"1").await);
        let st = arbiter.state().await;
        assert!(st.on);
        assert_eq!(st.source, Some(Source::Remote));

        assert!(cloud.dispatch("agri/vpin/4/set", b"0").await);
        assert!(!arbiter.state().await.on);
    }

    #[tokio::test]
    async fn garbage_pump_command_leaves_state() {
        let arbiter = test_arbiter();
        arbiter.set_pump(true, Source::Button).await.unwrap();

        handle_pump_command(&arbiter, "sideways").await;

        let st = arbiter.state().await;
        assert!(st.on);
        assert_eq!(st.source, Some(Source::Button));
    }

    #[tokio::test]
    async fn publish_status_pushes_present_fields_only() {
        let (client, _el) = test_mqtt(10);
        let cloud = CloudChannel::new(client, "agri");
        let sensors = SharedSensors::new();

        assert_eq!(cloud.publish_status(&sensors).await, 0);

        sensors.set_temp_humidity(20.0, 45.0).await;
        assert_eq!(cloud.publish_status(&sensors).await, 2);
    }

    #[tokio::test]
    async fn virtual_write_drops_when_queue_full() {
        let (client, _el) = test_mqtt(1);
        let cloud = CloudChannel::new(client, "agri");

        assert!(cloud.virtual_write(VPIN_PUMP, 1));
        assert!(!cloud.virtual_write(VPIN_PUMP, 0));
    }

    // -- driver ---------------------------------------------------------------

    /// Take everything queued on the client, as the event loop would on flush.
    fn drain(el: &mut EventLoop) -> Vec<Request> {
        el.clean();
        el.pending.drain(..).collect()
    }

    fn published(reqs: &[Request]) -> Vec<(String, String)> {
        reqs.iter()
            .filter_map(|r| match r {
                Request::Publish(p) => Some((
                    p.topic.clone(),
                    String::from_utf8_lossy(&p.payload).into_owned(),
                )),
                _ => None,
            })
            .collect()
    }

    fn subscribed(reqs: &[Request]) -> Vec<String> {
        reqs.iter()
            .filter_map(|r| match r {
                Request::Subscribe(s) => Some(s.filters.iter().map(|f| f.path.clone())),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn connack() -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )))
    }

    #[tokio::test]
    async fn connack_subscribes_to_commands() {
        let (client, mut el) = test_mqtt(10);
        let mut driver = Driver::new(CloudChannel::new(client, "agri"), SharedSensors::new());

        driver.handle_event(connack()).await;

        assert!(!driver.subscribe_pending);
        assert_eq!(subscribed(&drain(&mut el)), vec!["agri/vpin/+/set"]);
    }

    #[tokio::test]
    async fn subscription_retried_when_queue_full_at_connack() {
        let (client, mut el) = test_mqtt(4);
        let sensors = SharedSensors::new();
        sensors.set_soil(40.0).await;
        sensors.set_rain(10.0).await;
        sensors.set_temp_humidity(22.0, 55.0).await;
        let mut driver = Driver::new(CloudChannel::new(client, "agri"), sensors);

        // Broker away: status pushes fill the queue.
        assert_eq!(driver.tick().await, 4);
        driver.handle_event(connack()).await;
        assert!(driver.subscribe_pending);
        assert!(subscribed(&drain(&mut el)).is_empty());

        // Queue flushed after reconnect; the next tick subscribes first.
        driver.tick().await;
        assert!(!driver.subscribe_pending);
        let reqs = drain(&mut el);
        assert!(matches!(reqs.first(), Some(Request::Subscribe(_))));
        assert_eq!(subscribed(&reqs), vec!["agri/vpin/+/set"]);

        // Only once.
        driver.tick().await;
        assert!(subscribed(&drain(&mut el)).is_empty());
    }

    #[tokio::test]
    async fn tick_pushes_status_values() {
        let (client, mut el) = test_mqtt(10);
        let sensors = SharedSensors::new();
        sensors.set_soil(33.0).await;
        let mut driver = Driver::new(CloudChannel::new(client, "agri"), sensors);

        assert_eq!(driver.tick().await, 1);
        assert_eq!(
            published(&drain(&mut el)),
            vec![("agri/vpin/2".to_string(), "33.00".to_string())]
        );
    }

    #[tokio::test]
    async fn button_echo_published_on_pump_pin() {
        let (client, mut el) = test_mqtt(10);
        let driver = Driver::new(CloudChannel::new(client, "agri"), SharedSensors::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = RecordingRelay::default();
        let arbiter = PumpArbiter::new(Box::new(relay), true, tx).unwrap();

        arbiter.set_pump(true, Source::Button).await.unwrap();
        arbiter.set_pump(false, Source::Remote).await.unwrap();
        arbiter.set_pump(true, Source::Button).await.unwrap();
        while let Ok(on) = rx.try_recv() {
            assert!(driver.echo(on));
        }

        assert_eq!(
            published(&drain(&mut el)),
            vec![
                ("agri/vpin/4".to_string(), "1".to_string()),
                ("agri/vpin/4".to_string(), "1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn inbound_pump_command_event_reaches_arbiter() {
        let (client, _el) = test_mqtt(10);
        let mut cloud = CloudChannel::new(client, "agri");
        let arbiter = test_arbiter();
        register_pump_handler(&mut cloud, Arc::clone(&arbiter));
        let mut driver = Driver::new(cloud, SharedSensors::new());

        let publish = Publish::new("agri/vpin/4/set", QoS::AtLeastOnce, "1");
        driver
            .handle_event(Event::Incoming(Packet::Publish(publish)))
            .await;

        assert!(arbiter.state().await.on);
    }
}
