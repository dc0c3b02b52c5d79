//! Physical button monitor. Holding the button runs the pump; releasing it
//! stops the pump.
//!
//! ```text
//! Released ──[stable LOW]──▶ Pressed   (set_pump(true, Button))
//!    ▲                          │
//!    └──────[stable HIGH]───────┘      (set_pump(false, Button))
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{error, info};

use crate::hw::{ButtonInput, Level};
use crate::pump::{PumpArbiter, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Released,
    Pressed,
}

impl ButtonState {
    /// Pull-up wiring: the line idles HIGH and a press pulls it LOW.
    pub fn from_level(level: Level) -> Self {
        match level {
            Level::Low => Self::Pressed,
            Level::High => Self::Released,
        }
    }
}

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

/// Accepts a new button state only after `required` consecutive samples agree.
#[derive(Debug)]
pub struct Debouncer {
    stable: ButtonState,
    candidate: ButtonState,
    streak: u32,
    required: u32,
}

impl Debouncer {
    pub fn new(initial: ButtonState, required: u32) -> Self {
        Self {
            stable: initial,
            candidate: initial,
            streak: 0,
            required: required.max(1),
        }
    }

    pub fn state(&self) -> ButtonState {
        self.stable
    }

    /// Feed one sample; returns the new stable state on a transition.
    pub fn sample(&mut self, level: Level) -> Option<ButtonState> {
        let observed = ButtonState::from_level(level);

        if observed == self.stable {
            self.candidate = observed;
            self.streak = 0;
            return None;
        }

        if observed == self.candidate {
            self.streak += 1;
        } else {
            self.candidate = observed;
            self.streak = 1;
        }

        if self.streak >= self.required {
            self.stable = observed;
            self.streak = 0;
            Some(observed)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor loop
// ---------------------------------------------------------------------------

/// Apply one debounced edge to the arbiter.
pub async fn apply_edge(arbiter: &PumpArbiter, edge: ButtonState) -> Result<()> {
    let on = edge == ButtonState::Pressed;
    info!(?edge, "button edge");
    arbiter.set_pump(on, Source::Button).await?;
    Ok(())
}

/// Poll the button forever. Returns only if the arbiter refuses a command
/// (relay fault or shutdown).
pub async fn run(
    mut button: Box<dyn ButtonInput>,
    arbiter: Arc<PumpArbiter>,
    poll: Duration,
    debounce_samples: u32,
) {
    // The pump starts OFF, so assume Released unless the arbiter says otherwise.
    let initial = if arbiter.state().await.on {
        ButtonState::Pressed
    } else {
        ButtonState::Released
    };
    let mut debouncer = Debouncer::new(initial, debounce_samples);

    info!(
        poll_ms = poll.as_millis() as u64,
        debounce_samples,
        state = ?debouncer.state(),
        "button monitor started"
    );

    loop {
        if let Some(edge) = debouncer.sample(button.level()) {
            if let Err(e) = apply_edge(&arbiter, edge).await {
                error!(state = ?debouncer.state(), "button monitor stopping: {e:#}");
                return;
            }
        }
        sleep(poll).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
