//! Pump arbiter: the only owner of the relay line and of the logical pump
//! state. Button and remote commands all funnel through [`PumpArbiter::set_pump`].

use anyhow::{bail, Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info};

use crate::hw::{relay_level, RelayLine};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Button,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PumpState {
    pub on: bool,
    /// Who caused the last transition; `None` before the first one.
    pub source: Option<Source>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub changed_at: Option<OffsetDateTime>,
}

impl PumpState {
    fn off() -> Self {
        Self {
            on: false,
            source: None,
            changed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Switched,
    Unchanged,
}

struct Inner {
    state: PumpState,
    relay: Box<dyn RelayLine>,
    /// Set after a failed relay write; the physical state is unknown from then on.
    faulted: bool,
    released: bool,
}

// ---------------------------------------------------------------------------
// Arbiter
// ---------------------------------------------------------------------------

pub struct PumpArbiter {
    inner: Mutex<Inner>,
    active_low: bool,
    /// Button-originated transitions, mirrored to the cloud dashboard.
    echo: mpsc::UnboundedSender<bool>,
    fault: Notify,
}

impl PumpArbiter {
    /// Take ownership of the relay and drive it to OFF.
    pub fn new(
        mut relay: Box<dyn RelayLine>,
        active_low: bool,
        echo: mpsc::UnboundedSender<bool>,
    ) -> Result<Self> {
        relay
            .write(relay_level(false, active_low))
            .context("failed to drive relay OFF at startup")?;

        Ok(Self {
            inner: Mutex::new(Inner {
                state: PumpState::off(),
                relay,
                faulted: false,
                released: false,
            }),
            active_low,
            echo,
            fault: Notify::new(),
        })
    }

    /// Request the pump `on` or off. Calls are applied one at a time, each
    /// including its relay write. Repeating the current state is a no-op.
    ///
    /// Fails only if the relay is unusable (faulted or released); a failed
    /// write latches the fault and wakes [`Self::wait_for_fault`].
    pub async fn set_pump(&self, on: bool, source: Source) -> Result<Outcome> {
        let mut inner = self.inner.lock().await;

        if inner.faulted {
            bail!("pump relay is faulted");
        }
        if inner.released {
            bail!("pump relay has been released");
        }

        if inner.state.on == on {
            debug!(on, ?source, "pump already in requested state");
            return Ok(Outcome::Unchanged);
        }

        if let Err(e) = inner.relay.write(relay_level(on, self.active_low)) {
            inner.faulted = true;
            error!(on, ?source, "relay write failed, pump state unknown: {e:#}");
            self.fault.notify_one();
            return Err(e.context("relay write failed"));
        }

        inner.state = PumpState {
            on,
            source: Some(source),
            changed_at: Some(OffsetDateTime::now_utc()),
        };
        info!(on, ?source, "pump switched {}", if on { "ON" } else { "OFF" });

        // Sent under the lock so echoes leave in the order transitions were applied.
        if source == Source::Button && self.echo.send(on).is_err() {
            debug!("pump echo receiver gone");
        }

        Ok(Outcome::Switched)
    }

    pub async fn state(&self) -> PumpState {
        self.inner.lock().await.state
    }

    /// Resolves once a relay write has failed.
    pub async fn wait_for_fault(&self) {
        self.fault.notified().await;
    }

    /// Drive the relay OFF and release the line. Later `set_pump` calls fail.
    pub async fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.released {
            return Ok(());
        }

        let result = inner.relay.write(relay_level(false, self.active_low));
        inner.relay.release();
        inner.released = true;
        inner.state.on = false;

        result.context("failed to drive relay OFF during shutdown")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::RecordingRelay;
    use crate::hw::Level;
    use std::sync::Arc;

    fn arbiter() -> (PumpArbiter, RecordingRelay, mpsc::UnboundedReceiver<bool>) {
        let relay = RecordingRelay::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let arb = PumpArbiter::new(Box::new(relay.clone()), true, tx).unwrap();
        (arb, relay, rx)
    }

    #[test]
    fn new_drives_relay_off() {
        let (_arb, relay, _rx) = arbiter();
        assert_eq!(relay.writes(), vec![Level::High]);
    }

    #[test]
    fn new_fails_if_relay_cannot_be_written() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let res = PumpArbiter::new(Box::new(RecordingRelay::failing()), true, tx);
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn initial_state_is_off() {
        let (arb, _relay, _rx) = arbiter();
        let st = arb.state().await;
        assert!(!st.on);
        assert_eq!(st.source, None);
        assert_eq!(st.changed_at, None);
    }

    #[tokio::test]
    async fn on_drives_low_off_drives_high() {
        let (arb, relay, _rx) = arbiter();
        arb.set_pump(true, Source::Remote).await.unwrap();
        arb.set_pump(false, Source::Remote).await.unwrap();
        assert_eq!(relay.writes(), vec![Level::High, Level::Low, Level::High]);
    }

    #[tokio::test]
    async fn repeated_command_writes_once() {
        let (arb, relay, _rx) = arbiter();
        assert_eq!(
            arb.set_pump(true, Source::Remote).await.unwrap(),
            Outcome::Switched
        );
        assert_eq!(
            arb.set_pump(true, Source::Button).await.unwrap(),
            Outcome::Unchanged
        );
        assert_eq!(relay.writes(), vec![Level::High, Level::Low]);
        // Source tag belongs to the transition, not the no-op.
        assert_eq!(arb.state().await.source, Some(Source::Remote));
    }

    #[tokio::test]
    async fn button_transitions_are_echoed() {
        let (arb, _relay, mut rx) = arbiter();
        arb.set_pump(true, Source::Button).await.unwrap();
        arb.set_pump(false, Source::Button).await.unwrap();
        assert_eq!(rx.try_recv(), Ok(true));
        assert_eq!(rx.try_recv(), Ok(false));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_transitions_are_not_echoed() {
        let (arb, _relay, mut rx) = arbiter();
        arb.set_pump(true, Source::Remote).await.unwrap();
        assert!(arb.state().await.on);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unchanged_button_command_is_not_echoed() {
        let (arb, _relay, mut rx) = arbiter();
        arb.set_pump(false, Source::Button).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_write_latches_fault() {
        let relay = RecordingRelay::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let arb = PumpArbiter::new(Box::new(relay), true, tx).unwrap();
        // Swap in a failing line behind the arbiter's back.
        arb.inner.lock().await.relay = Box::new(RecordingRelay::failing());

        assert!(arb.set_pump(true, Source::Remote).await.is_err());
        tokio::time::timeout(std::time::Duration::from_secs(1), arb.wait_for_fault())
            .await
            .expect("fault should be signalled");

        let err = arb.set_pump(false, Source::Button).await.unwrap_err();
        assert!(format!("{err:#}").contains("faulted"));
        assert!(!arb.state().await.on);
    }

    #[tokio::test]
    async fn shutdown_forces_off_and_releases() {
        let (arb, relay, _rx) = arbiter();
        arb.set_pump(true, Source::Button).await.unwrap();
        arb.shutdown().await.unwrap();

        assert_eq!(relay.writes().last(), Some(&Level::High));
        assert!(relay.released());
        assert!(!arb.state().await.on);
        assert!(arb.set_pump(true, Source::Remote).await.is_err());

        // Second shutdown is a no-op.
        arb.shutdown().await.unwrap();
        assert_eq!(relay.writes().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commands_are_totally_ordered() {
        let (arb, relay, _rx) = arbiter();
        let arb = Arc::new(arb);

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let arb = Arc::clone(&arb);
                let source = if i % 3 == 0 { Source::Button } else { Source::Remote };
                tokio::spawn(async move { arb.set_pump(i % 2 == 0, source).await.unwrap() })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let writes = relay.writes();
        // Every admitted transition flips the line; a no-op never writes.
        assert!(
            writes.windows(2).all(|w| w[0] != w[1]),
            "duplicate consecutive writes: {writes:?}"
        );
        let last = *writes.last().unwrap();
        assert_eq!(last, relay_level(arb.state().await.on, true));
    }
}
