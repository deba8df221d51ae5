//! # Rotation Trigger
//!
//! Coalescing wake-up signal for the ingestion loop.
//!
//! [`RotationTrigger::raise`] stores at most one pending wake-up, so any
//! number of raises before the loop gets to them cause a single rotation
//! check. The user override travels next to it as a flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Shared {
    notify: Notify,
    override_requested: AtomicBool,
}

/// Handle shared by everything that may ask for a rotation
#[derive(Debug, Clone, Default)]
pub struct RotationTrigger {
    shared: Arc<Shared>,
}

impl RotationTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to evaluate the rotation policy
    pub fn raise(&self) {
        self.shared.notify.notify_one();
    }

    /// Ask for a rotation regardless of the policy (user button)
    pub fn request_override(&self) {
        self.shared.override_requested.store(true, Ordering::Release);
        self.raise();
    }

    /// Consume a pending override
    pub fn take_override(&self) -> bool {
        self.shared.override_requested.swap(false, Ordering::AcqRel)
    }

    /// Wait for the next raise
    pub async fn raised(&self) {
        self.shared.notify.notified().await;
    }
}

/// Raise `trigger` every `period`
///
/// Picks up calendar-day rollovers even when the GNSS receiver is silent,
/// and retries after a failed rotation.
pub fn spawn_rollover_ticker(trigger: RotationTrigger, period: Duration) -> JoinHandle<()> {
    info!("Rotation check every {:?}", period);
    tokio::spawn(async move {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            debug!("Rollover tick");
            trigger.raise();
        }
    })
}
