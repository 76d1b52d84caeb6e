use crate::shelly_em_api::{EmeterReading, ShellyEmApi};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Periodically reads the Shelly EM and forwards the configured channel
pub struct MeterPoller {
    api: ShellyEmApi,
    period: Duration,
    update_sender: Sender<EmeterReading>,
}

impl MeterPoller {
    pub fn new(api: ShellyEmApi, period: Duration, update_sender: Sender<EmeterReading>) -> Self {
        Self {
            api,
            period,
            update_sender,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            "Polling {} every {}ms",
            self.api.status_url(),
            self.period.as_millis()
        );

        let mut poll_interval = interval(self.period);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            poll_interval.tick().await;

            match self.read_channel().await {
                Ok(reading) => {
                    debug!("Shelly reading {}W at {}V", reading.power, reading.voltage);
                    if self.update_sender.send(reading).await.is_err() {
                        info!("Update handler is gone, stopping the poller");
                        break;
                    }
                }
                // Skipped until the next tick
                Err(e) => error!("Error at update: {e:#}"),
            }
        }
    }

    async fn read_channel(&self) -> anyhow::Result<EmeterReading> {
        let status = self.api.fetch_status().await?;
        Ok(self.api.channel_reading(&status)?.clone())
    }
}
