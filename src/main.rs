use shelly_em_grid_meter::{Config, GridMeterBridge};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_logging(None)?;
            error!("Error at startup: {e:#}");
            return Err(e);
        }
    };
    init_logging(config.log_file.as_deref())?;

    info!("Starting Shelly EM grid meter bridge");
    let mut bridge = match GridMeterBridge::start(&config).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Error at startup: {e:#}");
            return Err(e);
        }
    };
    info!("Connected to dbus, serving {}", config.service_name());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = bridge.wait() => error!("Poller stopped unexpectedly"),
    }
    bridge.shutdown();

    Ok(())
}

/// Logs to stderr and, when configured, to a file as well.
/// `RUST_LOG` overrides the default `info` level.
fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()?;
    Ok(())
}
