//! Ingestion path: decoder / entity index / coalescing cache / store,
//! wired together the way the running hub wires them.

use caravan::cache::CoalescingCache;
use caravan::ingest::bthome::BthomeDecoder;
use caravan::ingest::{EntityIndex, ScanSensorConfig};
use caravan::store::Store;
use jiff::Timestamp;

fn at(seconds: i64) -> Timestamp {
    Timestamp::from_second(seconds).unwrap()
}

#[tokio::test]
async fn coalescing_window_persists_first_value_and_serves_latest() {
    let store = Store::open_in_memory().await.unwrap();
    let sensor = store.create_sensor("camper", None, None).await.unwrap();
    let battery = store.create_entity(sensor.id, "battery", None).await.unwrap();

    // 60s coalescing window
    let cache = CoalescingCache::new(1, 5);

    cache.observe(&store, battery.id, "90", at(0)).await.unwrap();
    cache.observe(&store, battery.id, "88", at(30)).await.unwrap();

    // exactly one durable row, the window-opening value
    let rows = store.states_after(None, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, "90");
    assert_eq!(rows[0].created, at(0));

    // a read inside the window sees the latest observation
    let current = cache.current(&store, battery.id, at(45)).await.unwrap();
    assert_eq!(current, Some(("88".to_string(), at(0))));
}

#[tokio::test]
async fn decoded_advertisement_flows_into_store_through_cache() {
    let store = Store::open_in_memory().await.unwrap();
    let scan = vec![ScanSensorConfig {
        name: "bedroom".to_string(),
        address: "7C:C6:B6:61:E5:68".to_string(),
        entities: vec!["temperature".to_string(), "battery".to_string()],
    }];
    let index = EntityIndex::resolve(&store, &scan, None).await.unwrap();
    let cache = CoalescingCache::new(5, 5);

    // battery 90%, temperature 25.0°C, packet id 7
    let service_data = [0x40, 0x00, 0x07, 0x01, 90, 0x45, 0xfa, 0x00];
    let mut decoder = BthomeDecoder::new();
    let decoded = decoder
        .decode("7c:c6:b6:61:e5:68", &service_data, at(0))
        .unwrap();

    for (state_name, measurement) in &decoded.measurements {
        if let Some(entity_id) = index.ble_entity(&decoded.address, state_name) {
            cache
                .observe(&store, entity_id, &measurement.value.to_string(), at(0))
                .await
                .unwrap();
        }
    }

    let rows = store.states_after(None, 10).await.unwrap();
    assert_eq!(rows.len(), 2);
    let mut states: Vec<(&str, &str)> = rows
        .iter()
        .map(|r| (r.entity.as_str(), r.state.as_str()))
        .collect();
    states.sort();
    assert_eq!(states, vec![("battery", "90"), ("temperature", "25")]);

    // the same advertisement again is replay-suppressed end to end
    let decoded = decoder
        .decode("7c:c6:b6:61:e5:68", &service_data, at(1))
        .unwrap();
    assert!(decoded.measurements.is_empty());
}
