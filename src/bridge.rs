use crate::config::Config;
use crate::dbus_service::VeDbusService;
use crate::grid_meter::{
    DeviceInfo, GridMeter, SharedMeter, AC_ENERGY_FORWARD, AC_ENERGY_REVERSE, AC_POWER,
};
use crate::meter_poller::MeterPoller;
use crate::shelly_em_api::{EmeterReading, ShellyEmApi};
use crate::sign_of_life::SignOfLife;
use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc::{self, Receiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Announces changed paths to whoever consumes the meter
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    async fn publish(&self, paths: &[String]) -> anyhow::Result<()>;
}

/// Applies each reading to the meter, then publishes what changed
pub struct UpdateHandler<P> {
    meter: SharedMeter,
    publisher: P,
}

impl<P: ChangePublisher + 'static> UpdateHandler<P> {
    pub fn new(meter: SharedMeter, publisher: P) -> Self {
        Self { meter, publisher }
    }

    pub fn spawn(self, mut updates: Receiver<EmeterReading>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(reading) = updates.recv().await {
                if let Err(e) = self.handle(&reading).await {
                    error!("Error at update: {e:#}");
                }
            }
            info!("Reading channel closed, update handler exiting");
        })
    }

    pub async fn handle(&self, reading: &EmeterReading) -> anyhow::Result<()> {
        let changed = {
            let mut meter = self.meter.lock().await;
            let changed = meter.apply_reading(reading)?;
            debug!("House Consumption ({AC_POWER}): {}", meter.number(AC_POWER));
            debug!(
                "House Forward ({AC_ENERGY_FORWARD}): {}",
                meter.number(AC_ENERGY_FORWARD)
            );
            debug!(
                "House Reverse ({AC_ENERGY_REVERSE}): {}",
                meter.number(AC_ENERGY_REVERSE)
            );
            changed
        };
        self.publisher
            .publish(&changed)
            .await
            .context("Failed to publish changed values")
    }
}

/// Owns the running pieces of the Shelly EM to grid meter bridge
pub struct GridMeterBridge {
    meter: SharedMeter,
    poller: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl GridMeterBridge {
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let api = ShellyEmApi::new(
            &config.host,
            &config.username,
            &config.password,
            config.channel,
        );

        let serial = api
            .fetch_serial()
            .await
            .with_context(|| format!("Failed to read serial from {}", api.status_url()))?;
        info!(
            "Shelly EM {serial} on channel {} mapped to {}",
            config.channel, config.phase
        );

        let meter = GridMeter::new(
            &DeviceInfo {
                device_instance: config.device_instance,
                custom_name: config.custom_name.clone(),
                serial,
            },
            config.phase,
        )
        .into_shared();

        let service =
            VeDbusService::register(config.bus, &config.service_name(), meter.clone()).await?;

        let (reading_tx, reading_rx) = mpsc::channel(32);
        let mut background = vec![UpdateHandler::new(meter.clone(), service).spawn(reading_rx)];
        let poller = MeterPoller::new(api, config.poll_interval, reading_tx).spawn();

        match config.sign_of_life {
            Some(period) => {
                info!("Sign of life every {}s", period.as_secs());
                background.push(SignOfLife::new(meter.clone(), period).spawn());
            }
            None => info!("Sign of life log disabled"),
        }

        Ok(Self {
            meter,
            poller,
            background,
        })
    }

    pub fn meter(&self) -> SharedMeter {
        self.meter.clone()
    }

    /// Resolves once the poller has stopped
    pub async fn wait(&mut self) {
        if let Err(e) = (&mut self.poller).await {
            error!("Poller task failed: {e}");
        }
    }

    pub fn shutdown(self) {
        self.poller.abort();
        for task in self.background {
            task.abort();
        }
    }
}
