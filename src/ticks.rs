//! Tick Sources
//!
//! Periodic work (live polling, confirmation checks, reconciliation) waits on
//! a `TickSource` instead of sleeping, so tests can drive logical time.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};

/// Source of "run now" signals
#[async_trait]
pub trait TickSource: Send {
    /// Wait for the next tick; `false` once the source is exhausted
    async fn tick(&mut self) -> bool;
}

/// Wall-clock ticks
pub struct IntervalTicks {
    interval: Interval,
}

impl IntervalTicks {
    /// First tick fires immediately
    pub fn new(period: Duration) -> Self {
        Self::from_interval(interval(period.max(Duration::from_millis(1))))
    }

    /// First tick fires one full period from now
    pub fn after_first_period(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self::from_interval(interval_at(Instant::now() + period, period))
    }

    fn from_interval(mut interval: Interval) -> Self {
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl TickSource for IntervalTicks {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticks fired by hand through a `TickHandle`
pub struct ManualTicks {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Sender side of `ManualTicks`; dropping every handle ends the source
#[derive(Clone)]
pub struct TickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl TickHandle {
    /// Queue one tick; false when the source is gone
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// Create a manually driven tick source
pub fn manual() -> (TickHandle, ManualTicks) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TickHandle { tx }, ManualTicks { rx })
}

#[async_trait]
impl TickSource for ManualTicks {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}
