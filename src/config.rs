use anyhow::{anyhow, bail, Context};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// The three grid phases a Shelly EM channel can be clamped on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::L1 => "L1",
            Phase::L2 => "L2",
            Phase::L3 => "L3",
        };
        f.write_str(name)
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "L1" => Ok(Phase::L1),
            "L2" => Ok(Phase::L2),
            "L3" => Ok(Phase::L3),
            _ => bail!("Phase {s} is not supported, must be one of 'L1', 'L2', 'L3'"),
        }
    }
}

/// Which message bus the grid meter service is registered on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(BusKind::System),
            "session" => Ok(BusKind::Session),
            _ => bail!("DBUS_BUS {s} is not supported, must be 'system' or 'session'"),
        }
    }
}

/// Runtime settings, read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub username: String,
    pub password: String,
    pub channel: usize,
    pub device_instance: u8,
    pub custom_name: String,
    pub phase: Phase,
    pub poll_interval: Duration,
    /// `None` when the heartbeat log is disabled
    pub sign_of_life: Option<Duration>,
    pub bus: BusKind,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let access_type = get("ACCESS_TYPE").unwrap_or_else(|| "OnPremise".to_string());
        if access_type != "OnPremise" {
            bail!("AccessType {access_type} is not supported");
        }

        let host = get("SHELLY_HOST")
            .ok_or_else(|| anyhow!("Required to add Shelly host (SHELLY_HOST env var)"))?;

        let sign_of_life_minutes: u64 = parse_or("SIGN_OF_LIFE_LOG", get("SIGN_OF_LIFE_LOG"), 0)?;

        Ok(Self {
            host,
            username: get("SHELLY_USERNAME").unwrap_or_default(),
            password: get("SHELLY_PASSWORD").unwrap_or_default(),
            channel: parse_or("SHELLY_CHANNEL", get("SHELLY_CHANNEL"), 0)?,
            device_instance: parse_or("DEVICE_INSTANCE", get("DEVICE_INSTANCE"), 40)?,
            custom_name: get("CUSTOM_NAME").unwrap_or_else(|| "Shelly EM".to_string()),
            phase: parse_or("PHASE", get("PHASE"), Phase::L1)?,
            poll_interval: Duration::from_millis(parse_or(
                "POLL_INTERVAL_MS",
                get("POLL_INTERVAL_MS"),
                250,
            )?),
            sign_of_life: (sign_of_life_minutes > 0)
                .then(|| Duration::from_secs(sign_of_life_minutes * 60)),
            bus: parse_or("DBUS_BUS", get("DBUS_BUS"), BusKind::System)?,
            log_file: get("LOG_FILE").map(PathBuf::from),
        })
    }

    /// Well-known name the meter is published under
    pub fn service_name(&self) -> String {
        format!("com.victronenergy.grid.http_{:02}", self.device_instance)
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("Invalid value '{raw}' for {key}")),
    }
}
