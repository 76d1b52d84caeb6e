use crate::grid_meter::{SharedMeter, AC_POWER};
use chrono::{DateTime, Local};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::info;

/// What the last heartbeat saw
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Heartbeat {
    pub count: u64,
    pub last_update: Option<DateTime<Local>>,
    pub power: f64,
}

/// Heartbeat log so a quiet service can be told apart from a dead one
pub struct SignOfLife {
    meter: SharedMeter,
    period: Duration,
    beats: watch::Sender<Heartbeat>,
}

impl SignOfLife {
    pub fn new(meter: SharedMeter, period: Duration) -> Self {
        let (beats, _) = watch::channel(Heartbeat::default());
        Self {
            meter,
            period,
            beats,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Heartbeat> {
        self.beats.subscribe()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            // First report after one full period
            let mut ticks = interval_at(Instant::now() + self.period, self.period);
            loop {
                ticks.tick().await;
                self.report().await;
            }
        })
    }

    async fn report(&self) {
        let (last_update, power) = {
            let meter = self.meter.lock().await;
            (meter.last_update(), meter.number(AC_POWER))
        };

        info!("--- Start: sign of life ---");
        match last_update {
            Some(t) => info!("Last update: {}", t.format("%Y-%m-%d %H:%M:%S")),
            None => info!("Last update: never"),
        }
        info!("Last '{AC_POWER}': {power}");
        info!("--- End: sign of life ---");

        self.beats.send_modify(|beat| {
            beat.count += 1;
            beat.last_update = last_update;
            beat.power = power;
        });
    }
}
