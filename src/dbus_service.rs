//! Publishes the grid meter value map on the D-Bus.
//!
//! Every path is its own object implementing `com.victronenergy.BusItem`, the
//! root object `/` answers for the whole tree at once. Changes go out as a
//! `PropertiesChanged` signal per path plus one batched `ItemsChanged` on `/`.

use crate::bridge::ChangePublisher;
use crate::bus_item::{BusItem, BusValue};
use crate::config::BusKind;
use crate::grid_meter::{SetOutcome, SharedMeter};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{error, info, warn};
use zbus::object_server::SignalContext;
use zbus::zvariant::{OwnedValue, Value};
use zbus::{interface, Connection};

type ItemEntry = HashMap<String, Value<'static>>;

fn item_entry(item: &BusItem) -> ItemEntry {
    HashMap::from([
        ("Value".to_string(), item.value.to_variant()),
        ("Text".to_string(), Value::from(item.text())),
    ])
}

/// One published path
struct ItemObject {
    path: String,
    meter: SharedMeter,
}

#[interface(name = "com.victronenergy.BusItem")]
impl ItemObject {
    async fn get_value(&self) -> Value<'static> {
        let meter = self.meter.lock().await;
        match meter.value(&self.path) {
            Some(value) => value.to_variant(),
            None => BusValue::Invalid.to_variant(),
        }
    }

    async fn get_text(&self) -> String {
        let meter = self.meter.lock().await;
        meter
            .item(&self.path)
            .map(BusItem::text)
            .unwrap_or_else(|| "---".to_string())
    }

    async fn set_value(
        &self,
        value: OwnedValue,
        #[zbus(connection)] connection: &Connection,
    ) -> i32 {
        let Some(value) = BusValue::from_variant(&value) else {
            warn!("Rejected write to {} with unsupported type", self.path);
            return SetOutcome::UnknownPath.code();
        };
        let outcome = self.meter.lock().await.set_external(&self.path, value);
        if outcome == SetOutcome::Accepted {
            if let Err(e) = emit_changes(connection, &self.meter, &[self.path.clone()]).await {
                error!("Failed to announce change of {}: {e}", self.path);
            }
        }
        outcome.code()
    }

    #[zbus(signal)]
    async fn properties_changed(
        ctxt: &SignalContext<'_>,
        changes: HashMap<String, Value<'_>>,
    ) -> zbus::Result<()>;
}

/// The `/` object, answers for every path
struct RootObject {
    meter: SharedMeter,
}

#[interface(name = "com.victronenergy.BusItem")]
impl RootObject {
    async fn get_items(&self) -> HashMap<String, ItemEntry> {
        let meter = self.meter.lock().await;
        meter
            .items()
            .map(|(path, item)| (path.clone(), item_entry(item)))
            .collect()
    }

    /// Values keyed by path relative to the root
    async fn get_value(&self) -> HashMap<String, Value<'static>> {
        let meter = self.meter.lock().await;
        meter
            .items()
            .map(|(path, item)| (relative(path), item.value.to_variant()))
            .collect()
    }

    async fn get_text(&self) -> HashMap<String, String> {
        let meter = self.meter.lock().await;
        meter
            .items()
            .map(|(path, item)| (relative(path), item.text()))
            .collect()
    }

    #[zbus(signal)]
    async fn items_changed(
        ctxt: &SignalContext<'_>,
        items: HashMap<String, ItemEntry>,
    ) -> zbus::Result<()>;
}

fn relative(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

async fn emit_changes(
    connection: &Connection,
    meter: &SharedMeter,
    paths: &[String],
) -> zbus::Result<()> {
    let changed: Vec<(String, BusItem)> = {
        let meter = meter.lock().await;
        paths
            .iter()
            .filter_map(|path| meter.item(path).map(|item| (path.clone(), item.clone())))
            .collect()
    };
    if changed.is_empty() {
        return Ok(());
    }

    let mut items = HashMap::new();
    for (path, item) in changed {
        let ctxt = SignalContext::new(connection, path.as_str())?;
        ItemObject::properties_changed(&ctxt, item_entry(&item)).await?;
        items.insert(path, item_entry(&item));
    }
    let root = SignalContext::new(connection, "/")?;
    RootObject::items_changed(&root, items).await
}

/// Exports the root object and one object per path, returns the number of paths
async fn export_objects(connection: &Connection, meter: &SharedMeter) -> anyhow::Result<usize> {
    let paths: Vec<String> = meter.lock().await.paths().cloned().collect();
    let object_server = connection.object_server();
    object_server
        .at(
            "/",
            RootObject {
                meter: meter.clone(),
            },
        )
        .await?;
    for path in &paths {
        object_server
            .at(
                path.as_str(),
                ItemObject {
                    path: path.clone(),
                    meter: meter.clone(),
                },
            )
            .await
            .with_context(|| format!("Failed to export {path}"))?;
    }
    Ok(paths.len())
}

/// The grid meter as a `com.victronenergy.grid` service
pub struct VeDbusService {
    connection: Connection,
    meter: SharedMeter,
}

impl VeDbusService {
    /// Registers every path of the meter, then claims the service name
    pub async fn register(
        bus: BusKind,
        service_name: &str,
        meter: SharedMeter,
    ) -> anyhow::Result<Self> {
        let connection = match bus {
            BusKind::System => Connection::system().await,
            BusKind::Session => Connection::session().await,
        }
        .with_context(|| format!("Failed to connect to the {bus:?} bus"))?;

        let exported = export_objects(&connection, &meter).await?;
        connection
            .request_name(service_name)
            .await
            .with_context(|| format!("Failed to claim {service_name}"))?;
        info!("Registered {service_name} with {exported} paths");

        Ok(Self { connection, meter })
    }
}

#[async_trait]
impl ChangePublisher for VeDbusService {
    async fn publish(&self, paths: &[String]) -> anyhow::Result<()> {
        emit_changes(&self.connection, &self.meter, paths).await?;
        Ok(())
    }
}
