//! Shelly EM grid meter bridge
//!
//! Polls a Shelly EM energy meter over HTTP and republishes its readings on
//! the D-Bus so that Victron Venus OS sees it as a grid meter.

pub mod bridge;
pub mod bus_item;
pub mod config;
pub mod dbus_service;
pub mod grid_meter;
pub mod meter_poller;
pub mod shelly_em_api;
pub mod sign_of_life;

// Re-export commonly used types for easier access
pub use bridge::{ChangePublisher, GridMeterBridge, UpdateHandler};
pub use config::{Config, Phase};
pub use grid_meter::{GridMeter, SharedMeter};
pub use meter_poller::MeterPoller;
pub use shelly_em_api::ShellyEmApi;
