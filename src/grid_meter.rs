use crate::bus_item::{BusItem, BusValue, TextFormat};
use crate::config::Phase;
use crate::shelly_em_api::EmeterReading;
use anyhow::bail;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const PRODUCT_NAME: &str = "Shelly EM";
pub const CONNECTION: &str = "Shelly EM HTTP JSON service";
pub const PRODUCT_ID: i32 = 0xB023;
/// ET340 energy meter
pub const DEVICE_TYPE: i32 = 345;

pub const UPDATE_INDEX: &str = "/UpdateIndex";
pub const AC_POWER: &str = "/Ac/Power";
pub const AC_CURRENT: &str = "/Ac/Current";
pub const AC_VOLTAGE: &str = "/Ac/Voltage";
pub const AC_ENERGY_FORWARD: &str = "/Ac/Energy/Forward";
pub const AC_ENERGY_REVERSE: &str = "/Ac/Energy/Reverse";

/// Static identity of the published device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub device_instance: u8,
    pub custom_name: String,
    pub serial: String,
}

/// Result of another bus client writing a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Accepted,
    /// Same value as before, nothing to publish
    Unchanged,
    NotWriteable,
    UnknownPath,
}

impl SetOutcome {
    /// Return code of `SetValue`
    pub fn code(self) -> i32 {
        match self {
            SetOutcome::Accepted | SetOutcome::Unchanged => 0,
            SetOutcome::NotWriteable => 1,
            SetOutcome::UnknownPath => 2,
        }
    }
}

/// Electrical values of one phase as published
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseReading {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    /// kWh
    pub energy_forward: f64,
    /// kWh
    pub energy_reverse: f64,
}

impl PhaseReading {
    pub fn from_emeter(emeter: &EmeterReading) -> anyhow::Result<Self> {
        if emeter.voltage == 0.0 {
            bail!(
                "Shelly reports 0V, cannot derive current from {}W",
                emeter.power
            );
        }
        Ok(Self {
            voltage: emeter.voltage,
            current: emeter.power / emeter.voltage,
            power: emeter.power,
            energy_forward: emeter.total / 1000.0,
            energy_reverse: emeter.total_returned / 1000.0,
        })
    }
}

fn phase_path(phase: Phase, quantity: &str) -> String {
    format!("/Ac/{phase}/{quantity}")
}

/// The meter as shared between the update handler, the heartbeat and the bus
pub type SharedMeter = Arc<Mutex<GridMeter>>;

/// The value map of the virtual grid meter
pub struct GridMeter {
    items: BTreeMap<String, BusItem>,
    phase: Phase,
    last_update: Option<DateTime<Local>>,
}

impl GridMeter {
    pub fn new(info: &DeviceInfo, phase: Phase) -> Self {
        let mut items = BTreeMap::new();
        let mut add = |path: &str, item: BusItem| {
            items.insert(path.to_string(), item);
        };

        add("/Mgmt/ProcessName", BusItem::constant(env!("CARGO_PKG_NAME")));
        add(
            "/Mgmt/ProcessVersion",
            BusItem::constant(env!("CARGO_PKG_VERSION")),
        );
        add("/Mgmt/Connection", BusItem::constant(CONNECTION));

        add(
            "/DeviceInstance",
            BusItem::constant(i32::from(info.device_instance)),
        );
        add("/ProductId", BusItem::constant(PRODUCT_ID));
        add("/DeviceType", BusItem::constant(DEVICE_TYPE));
        add("/ProductName", BusItem::constant(PRODUCT_NAME));
        add("/CustomName", BusItem::constant(info.custom_name.as_str()));
        add("/Latency", BusItem::constant(BusValue::Invalid));
        add("/FirmwareVersion", BusItem::constant(0.1));
        add("/HardwareVersion", BusItem::constant(0));
        add("/Connected", BusItem::constant(1));
        add("/Role", BusItem::constant("grid"));
        add("/Position", BusItem::constant(0));
        add("/Serial", BusItem::constant(info.serial.as_str()));
        add(UPDATE_INDEX, BusItem::constant(0));

        add(AC_ENERGY_FORWARD, BusItem::measurement(TextFormat::KiloWattHours));
        add(AC_ENERGY_REVERSE, BusItem::measurement(TextFormat::KiloWattHours));
        add(AC_POWER, BusItem::measurement(TextFormat::Watts));
        add(AC_CURRENT, BusItem::measurement(TextFormat::Amps));
        add(AC_VOLTAGE, BusItem::measurement(TextFormat::Volts));
        for phase in Phase::ALL {
            let measurements = [
                ("Voltage", TextFormat::Volts),
                ("Current", TextFormat::Amps),
                ("Power", TextFormat::Watts),
                ("Energy/Forward", TextFormat::KiloWattHours),
                ("Energy/Reverse", TextFormat::KiloWattHours),
            ];
            for (quantity, format) in measurements {
                add(phase_path(phase, quantity).as_str(), BusItem::measurement(format));
            }
        }

        Self {
            items,
            phase,
            last_update: None,
        }
    }

    pub fn into_shared(self) -> SharedMeter {
        Arc::new(Mutex::new(self))
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn item(&self, path: &str) -> Option<&BusItem> {
        self.items.get(path)
    }

    pub fn value(&self, path: &str) -> Option<&BusValue> {
        self.items.get(path).map(|item| &item.value)
    }

    pub fn items(&self) -> impl Iterator<Item = (&String, &BusItem)> {
        self.items.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.items.keys()
    }

    pub fn update_index(&self) -> i32 {
        match self.value(UPDATE_INDEX) {
            Some(BusValue::Int(index)) => *index,
            _ => 0,
        }
    }

    pub fn last_update(&self) -> Option<DateTime<Local>> {
        self.last_update
    }

    /// Numeric value of a path, zero when unset or not a number
    pub fn number(&self, path: &str) -> f64 {
        self.value(path).and_then(BusValue::as_f64).unwrap_or_default()
    }

    /// Maps one Shelly channel reading onto the phases and refreshes the totals.
    /// Nothing is changed when the reading cannot be mapped.
    /// Returns the paths whose value changed.
    pub fn apply_reading(&mut self, emeter: &EmeterReading) -> anyhow::Result<Vec<String>> {
        if !emeter.is_valid {
            warn!("Shelly flags the reading as invalid, publishing it anyway");
        }
        let measured = PhaseReading::from_emeter(emeter)?;

        let mut updates: Vec<(String, BusValue)> = Vec::new();
        let mut total = PhaseReading::default();
        for phase in Phase::ALL {
            let reading = if phase == self.phase {
                measured
            } else {
                PhaseReading::default()
            };
            updates.push((phase_path(phase, "Voltage"), reading.voltage.into()));
            updates.push((phase_path(phase, "Current"), reading.current.into()));
            updates.push((phase_path(phase, "Power"), reading.power.into()));
            updates.push((
                phase_path(phase, "Energy/Forward"),
                reading.energy_forward.into(),
            ));
            updates.push((
                phase_path(phase, "Energy/Reverse"),
                reading.energy_reverse.into(),
            ));

            total.current += reading.current;
            total.power += reading.power;
            total.energy_forward += reading.energy_forward;
            total.energy_reverse += reading.energy_reverse;
        }
        updates.push((AC_CURRENT.to_string(), total.current.into()));
        updates.push((AC_POWER.to_string(), total.power.into()));
        updates.push((AC_ENERGY_FORWARD.to_string(), total.energy_forward.into()));
        updates.push((AC_ENERGY_REVERSE.to_string(), total.energy_reverse.into()));
        updates.push((AC_VOLTAGE.to_string(), measured.voltage.into()));

        let next_index = (self.update_index() + 1) % 256;
        updates.push((UPDATE_INDEX.to_string(), BusValue::Int(next_index)));

        let mut changed = Vec::new();
        for (path, value) in updates {
            if let Some(item) = self.items.get_mut(&path) {
                if item.value != value {
                    item.value = value;
                    changed.push(path);
                }
            }
        }
        self.last_update = Some(Local::now());

        Ok(changed)
    }

    /// Handles a write from another bus client
    pub fn set_external(&mut self, path: &str, value: BusValue) -> SetOutcome {
        let Some(item) = self.items.get_mut(path) else {
            return SetOutcome::UnknownPath;
        };
        if !item.writeable {
            return SetOutcome::NotWriteable;
        }
        if item.value == value {
            return SetOutcome::Unchanged;
        }
        debug!("someone else updated {path} to {value}");
        item.value = value;
        SetOutcome::Accepted
    }
}
