pub mod bthome;
pub mod serial;

use std::collections::HashMap;
use std::sync::Arc;

use bthome::BthomeDecoder;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, span, warn, Level};

use crate::cache::CoalescingCache;
use crate::store::error::StoreError;
use crate::store::Store;

/// One raw broadcast advertisement as delivered by a transport adapter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Advertisement {
    pub address: String,
    pub service_data: Vec<u8>,
    pub received: Timestamp,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ScanSensorConfig {
    pub name: String,
    pub address: String,
    /// state names worth storing; everything else the device advertises
    /// is dropped
    pub entities: Vec<String>,
}

/// Name→id lookup tables, resolved once at startup and cached for the
/// process lifetime. Missing sensors and entities are registered on the
/// way.
pub struct EntityIndex {
    /// BLE address (lowercase) -> state name -> entity id
    by_address: HashMap<String, HashMap<String, i64>>,
    /// serial entity name -> entity id
    serial: HashMap<String, i64>,
}

impl EntityIndex {
    pub async fn resolve(
        store: &Store,
        scan: &[ScanSensorConfig],
        serial_sensor: Option<&str>,
    ) -> Result<Self, StoreError> {
        let span = span!(Level::INFO, "Entity Index");
        let _enter = span.enter();

        let mut by_address = HashMap::new();
        for sensor_cfg in scan {
            let address = sensor_cfg.address.to_lowercase();
            let entities = resolve_sensor(
                store,
                &sensor_cfg.name,
                Some(address.clone()),
                &sensor_cfg.entities,
            )
            .await?;
            by_address.insert(address, entities);
        }

        let serial = match serial_sensor {
            Some(name) => {
                let entities: Vec<String> = serial::poll::POLL_COMMANDS
                    .iter()
                    .map(|(_, _, entity)| entity.to_string())
                    .collect();
                resolve_sensor(store, name, None, &entities).await?
            }
            None => HashMap::new(),
        };

        info!(
            "resolved {} scan sensors, {} serial entities",
            by_address.len(),
            serial.len()
        );
        Ok(Self { by_address, serial })
    }

    pub fn ble_entity(&self, address: &str, state_name: &str) -> Option<i64> {
        self.by_address.get(address)?.get(state_name).copied()
    }

    pub fn serial_entity(&self, name: &str) -> Option<i64> {
        self.serial.get(name).copied()
    }

    pub fn monitored_addresses(&self) -> impl Iterator<Item = &String> {
        self.by_address.keys()
    }
}

async fn resolve_sensor(
    store: &Store,
    name: &str,
    address: Option<String>,
    entity_names: &[impl AsRef<str>],
) -> Result<HashMap<String, i64>, StoreError> {
    let sensor = match store.sensor_by_name(name).await? {
        Some(sensor) => sensor,
        None => store.create_sensor(name, address, None).await?,
    };

    let mut entities: HashMap<String, i64> = store
        .entities_by_sensor(sensor.id)
        .await?
        .into_iter()
        .map(|e| (e.name, e.id))
        .collect();

    for entity_name in entity_names {
        let entity_name = entity_name.as_ref();
        if !entities.contains_key(entity_name) {
            let entity = store.create_entity(sensor.id, entity_name, None).await?;
            entities.insert(entity.name, entity.id);
        }
    }

    Ok(entities)
}

/// Drain advertisements from the transport adapter, decode, map state
/// names onto registered entities and push through the cache. One decoder
/// instance per monitored address carries the replay state.
pub async fn bthome_task(
    mut advertisements: mpsc::Receiver<Advertisement>,
    index: Arc<EntityIndex>,
    store: Store,
    cache: Arc<CoalescingCache>,
) {
    let span = span!(Level::INFO, "BTHome Scan");
    let _enter = span.enter();
    debug!("running");

    let mut decoders: HashMap<String, BthomeDecoder> = index
        .monitored_addresses()
        .map(|a| (a.clone(), BthomeDecoder::new()))
        .collect();

    while let Some(adv) = advertisements.recv().await {
        let address = adv.address.to_lowercase();
        let Some(decoder) = decoders.get_mut(&address) else {
            continue;
        };

        let decoded = match decoder.decode(&address, &adv.service_data, adv.received) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("{address}: {e}");
                continue;
            }
        };

        let effective = decoded.address.to_lowercase();
        for (state_name, measurement) in &decoded.measurements {
            let Some(entity_id) = index.ble_entity(&effective, state_name) else {
                debug!("state {state_name} not registered for {effective}");
                continue;
            };
            let value = measurement.value.to_string();
            if let Err(e) = cache.observe(&store, entity_id, &value, adv.received).await {
                error!("storing {state_name} for {effective}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_config() -> Vec<ScanSensorConfig> {
        vec![ScanSensorConfig {
            name: "bedroom".to_string(),
            address: "7C:C6:B6:61:E5:68".to_string(),
            entities: vec!["temperature".to_string(), "battery".to_string()],
        }]
    }

    #[tokio::test]
    async fn resolve_registers_missing_sensors_and_entities() {
        let store = Store::open_in_memory().await.unwrap();
        let index = EntityIndex::resolve(&store, &scan_config(), Some("camper"))
            .await
            .unwrap();

        assert!(index.ble_entity("7c:c6:b6:61:e5:68", "temperature").is_some());
        assert!(index.ble_entity("7c:c6:b6:61:e5:68", "humidity").is_none());
        assert!(index.serial_entity("household_voltage").is_some());
        assert!(index.serial_entity("pump_state").is_some());

        let sensor = store.sensor_by_name("bedroom").await.unwrap().unwrap();
        assert_eq!(sensor.address.as_deref(), Some("7c:c6:b6:61:e5:68"));
        assert_eq!(store.entities_by_sensor(sensor.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resolve_is_stable_across_restarts() {
        let store = Store::open_in_memory().await.unwrap();
        let first = EntityIndex::resolve(&store, &scan_config(), Some("camper"))
            .await
            .unwrap();
        let second = EntityIndex::resolve(&store, &scan_config(), Some("camper"))
            .await
            .unwrap();

        assert_eq!(
            first.ble_entity("7c:c6:b6:61:e5:68", "battery"),
            second.ble_entity("7c:c6:b6:61:e5:68", "battery"),
        );
        assert_eq!(
            first.serial_entity("water_state"),
            second.serial_entity("water_state"),
        );
    }
}
