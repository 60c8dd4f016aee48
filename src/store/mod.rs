pub mod error;

use error::StoreError;
use jiff::Timestamp;
use rusqlite::OptionalExtension;
use serde::Serialize;
use tokio_rusqlite::Connection;

use crate::cache::ReadingStore;

#[derive(Debug, Clone, Serialize)]
pub struct Sensor {
    pub id: i64,
    pub name: String,
    pub address: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub id: i64,
    pub sensor_id: i64,
    pub name: String,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateRow {
    pub state: String,
    pub created: Timestamp,
}

/// One durable reading joined with its sensor/entity names, the shape the
/// uploader sends.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRow {
    pub sensor: String,
    pub entity: String,
    pub state: String,
    pub created: Timestamp,
}

/// Readings are stored with microsecond precision so SQL ordering and
/// cursor comparisons are exact integer comparisons.
fn timestamp_column(micros: i64, idx: usize) -> rusqlite::Result<Timestamp> {
    Timestamp::from_microsecond(micros).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
    })
}

#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open(path).await?).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            Ok(conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS sensors (
                    id      INTEGER PRIMARY KEY AUTOINCREMENT,
                    name    TEXT NOT NULL UNIQUE,
                    address TEXT,
                    key     TEXT
                );
                CREATE TABLE IF NOT EXISTS entities (
                    id        INTEGER PRIMARY KEY AUTOINCREMENT,
                    sensor_id INTEGER NOT NULL REFERENCES sensors(id),
                    name      TEXT NOT NULL,
                    unit      TEXT
                );
                CREATE INDEX IF NOT EXISTS entities_sensor ON entities(sensor_id);
                CREATE TABLE IF NOT EXISTS states (
                    id        INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_id INTEGER NOT NULL REFERENCES entities(id),
                    state     TEXT NOT NULL,
                    created   INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS states_created ON states(created);
                CREATE INDEX IF NOT EXISTS states_entity_created ON states(entity_id, created);
                CREATE TABLE IF NOT EXISTS parameters (
                    id    INTEGER PRIMARY KEY AUTOINCREMENT,
                    name  TEXT NOT NULL UNIQUE,
                    value TEXT
                );",
            )?)
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, name, address, key FROM sensors ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(Sensor {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            address: row.get(2)?,
                            key: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn sensor_by_name(&self, name: &str) -> Result<Option<Sensor>, StoreError> {
        let name = name.to_string();
        let sensor = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, address, key FROM sensors WHERE name = ?1",
                        [name],
                        |row| {
                            Ok(Sensor {
                                id: row.get(0)?,
                                name: row.get(1)?,
                                address: row.get(2)?,
                                key: row.get(3)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await?;
        Ok(sensor)
    }

    pub async fn create_sensor(
        &self,
        name: &str,
        address: Option<String>,
        key: Option<String>,
    ) -> Result<Sensor, StoreError> {
        let name = name.to_string();
        let sensor = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sensors (name, address, key) VALUES (?1, ?2, ?3)",
                    (&name, &address, &key),
                )?;
                Ok(Sensor { id: conn.last_insert_rowid(), name, address, key })
            })
            .await?;
        Ok(sensor)
    }

    pub async fn entities_by_sensor(&self, sensor_id: i64) -> Result<Vec<Entity>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sensor_id, name, unit FROM entities WHERE sensor_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([sensor_id], |row| {
                        Ok(Entity {
                            id: row.get(0)?,
                            sensor_id: row.get(1)?,
                            name: row.get(2)?,
                            unit: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn create_entity(
        &self,
        sensor_id: i64,
        name: &str,
        unit: Option<String>,
    ) -> Result<Entity, StoreError> {
        let name = name.to_string();
        let entity = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO entities (sensor_id, name, unit) VALUES (?1, ?2, ?3)",
                    (sensor_id, &name, &unit),
                )?;
                Ok(Entity { id: conn.last_insert_rowid(), sensor_id, name, unit })
            })
            .await?;
        Ok(entity)
    }

    pub async fn append_state(
        &self,
        entity_id: i64,
        state: &str,
        created: Timestamp,
    ) -> Result<(), StoreError> {
        let state = state.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO states (entity_id, state, created) VALUES (?1, ?2, ?3)",
                    (entity_id, state, created.as_microsecond()),
                )?)
            })
            .await?;
        Ok(())
    }

    /// Newest reading for an entity no older than `not_before`, the
    /// freshness bound for cache-miss fallback reads.
    pub async fn latest_state(
        &self,
        entity_id: i64,
        not_before: Timestamp,
    ) -> Result<Option<(String, Timestamp)>, StoreError> {
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT state, created FROM states
                         WHERE entity_id = ?1 AND created >= ?2
                         ORDER BY created DESC, id DESC LIMIT 1",
                        (entity_id, not_before.as_microsecond()),
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()?)
            })
            .await?;
        match row {
            Some((state, micros)) => Ok(Some((
                state,
                timestamp_column(micros, 1).map_err(tokio_rusqlite::Error::from)?,
            ))),
            None => Ok(None),
        }
    }

    pub async fn recent_states(
        &self,
        entity_id: i64,
        limit: usize,
    ) -> Result<Vec<StateRow>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT state, created FROM states WHERE entity_id = ?1
                     ORDER BY created DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map((entity_id, limit as i64), |row| {
                        Ok(StateRow {
                            state: row.get(0)?,
                            created: timestamp_column(row.get(1)?, 1)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Readings strictly newer than `after`, oldest first, one upload page
    /// per call.
    pub async fn states_after(
        &self,
        after: Option<Timestamp>,
        limit: usize,
    ) -> Result<Vec<UploadRow>, StoreError> {
        let after = after.map(|t| t.as_microsecond()).unwrap_or(i64::MIN);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sensors.name, entities.name, states.state, states.created
                     FROM states
                     JOIN entities ON entities.id = states.entity_id
                     JOIN sensors ON sensors.id = entities.sensor_id
                     WHERE states.created > ?1
                     ORDER BY states.created ASC, states.id ASC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map((after, limit as i64), |row| {
                        Ok(UploadRow {
                            sensor: row.get(0)?,
                            entity: row.get(1)?,
                            state: row.get(2)?,
                            created: timestamp_column(row.get(3)?, 3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn parameter(&self, name: &str) -> Result<Option<String>, StoreError> {
        let name = name.to_string();
        let value = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM parameters WHERE name = ?1",
                        [name],
                        |row| row.get::<_, Option<String>>(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(value.flatten())
    }

    pub async fn set_parameter(&self, name: &str, value: &str) -> Result<(), StoreError> {
        let name = name.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO parameters (name, value) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                    (name, value),
                )?)
            })
            .await?;
        Ok(())
    }

    /// Retention sweep, returns the number of deleted readings.
    pub async fn delete_states_before(&self, threshold: Timestamp) -> Result<usize, StoreError> {
        let deleted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM states WHERE created < ?1",
                    [threshold.as_microsecond()],
                )?)
            })
            .await?;
        Ok(deleted)
    }
}

impl ReadingStore for Store {
    async fn append_state(
        &self,
        entity_id: i64,
        state: &str,
        created: Timestamp,
    ) -> Result<(), StoreError> {
        Store::append_state(self, entity_id, state, created).await
    }

    async fn latest_state(
        &self,
        entity_id: i64,
        not_before: Timestamp,
    ) -> Result<Option<(String, Timestamp)>, StoreError> {
        Store::latest_state(self, entity_id, not_before).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> Timestamp {
        Timestamp::from_second(seconds).unwrap()
    }

    async fn seeded() -> (Store, Entity) {
        let store = Store::open_in_memory().await.unwrap();
        let sensor = store
            .create_sensor("camper", Some("aa:bb".to_string()), None)
            .await
            .unwrap();
        let entity = store
            .create_entity(sensor.id, "household_voltage", Some("V".to_string()))
            .await
            .unwrap();
        (store, entity)
    }

    #[tokio::test]
    async fn registration_roundtrip() {
        let (store, entity) = seeded().await;

        let sensor = store.sensor_by_name("camper").await.unwrap().unwrap();
        assert_eq!(sensor.address.as_deref(), Some("aa:bb"));
        assert!(store.sensor_by_name("unknown").await.unwrap().is_none());

        let entities = store.entities_by_sensor(sensor.id).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id, entity.id);
        assert_eq!(entities[0].name, "household_voltage");
    }

    #[tokio::test]
    async fn states_after_pages_in_ascending_order() {
        let (store, entity) = seeded().await;
        for i in 0..5 {
            store
                .append_state(entity.id, &format!("{i}"), at(i))
                .await
                .unwrap();
        }

        let page = store.states_after(None, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].state, "0");
        assert_eq!(page[1].state, "1");
        assert_eq!(page[0].sensor, "camper");
        assert_eq!(page[0].entity, "household_voltage");

        // strictly newer than the cursor
        let page = store.states_after(Some(page[1].created), 10).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].state, "2");
    }

    #[tokio::test]
    async fn latest_state_honors_freshness_bound() {
        let (store, entity) = seeded().await;
        store.append_state(entity.id, "12.4", at(100)).await.unwrap();

        let hit = store.latest_state(entity.id, at(50)).await.unwrap();
        assert_eq!(hit, Some(("12.4".to_string(), at(100))));

        let miss = store.latest_state(entity.id, at(101)).await.unwrap();
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn parameter_set_overwrites() {
        let (store, _) = seeded().await;
        assert_eq!(store.parameter("last_upload").await.unwrap(), None);

        store.set_parameter("last_upload", "100").await.unwrap();
        store.set_parameter("last_upload", "200").await.unwrap();
        assert_eq!(
            store.parameter("last_upload").await.unwrap(),
            Some("200".to_string())
        );
    }

    #[tokio::test]
    async fn retention_deletes_only_older_rows() {
        let (store, entity) = seeded().await;
        store.append_state(entity.id, "old", at(10)).await.unwrap();
        store.append_state(entity.id, "new", at(20)).await.unwrap();

        let deleted = store.delete_states_before(at(15)).await.unwrap();
        assert_eq!(deleted, 1);

        let rows = store.states_after(None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "new");
    }
}
