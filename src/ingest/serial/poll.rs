use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, span, warn, Level};

use super::{LineTransport, SerialLink};
use crate::cache::CoalescingCache;
use crate::ingest::serial::error::SerialError;
use crate::ingest::EntityIndex;
use crate::store::Store;

/// One poll cycle's exchanges: (command, parameter, entity the value is
/// stored under).
pub const POLL_COMMANDS: [(&str, &str, &str); 7] = [
    ("VOLTAGE", "household", "household_voltage"),
    ("VOLTAGE", "starter", "starter_voltage"),
    ("VOLTAGE", "mains", "mains_voltage"),
    ("HOUSEHOLD", "?", "household_state"),
    ("WATER", "?", "water_state"),
    ("WASTE", "?", "waste_state"),
    ("PUMP", "?", "pump_state"),
];

/// Status pixels on the control board, turned off periodically since the
/// board re-enables them on its own resets.
const HOUSEKEEPING_COMMANDS: [(&str, &str); 2] = [("NEOPIXEL1", "black"), ("NEOPIXEL2", "black")];

#[derive(Debug, Clone, Copy)]
pub enum Actuator {
    Household,
    Pump,
}

impl Actuator {
    fn command(self) -> &'static str {
        match self {
            Actuator::Household => "HOUSEHOLD",
            Actuator::Pump => "PUMP",
        }
    }

    fn entity(self) -> &'static str {
        match self {
            Actuator::Household => "household_state",
            Actuator::Pump => "pump_state",
        }
    }
}

/// One-shot actuator invocation, serialized through the owning poll task
/// so it never overlaps an in-flight poll exchange.
pub struct ActuateRequest {
    pub actuator: Actuator,
    pub state: String,
    pub reply: oneshot::Sender<Result<String, SerialError>>,
}

pub async fn task<T: LineTransport>(
    mut link: SerialLink<T>,
    poll_interval: Duration,
    monitor_interval: Duration,
    index: Arc<EntityIndex>,
    store: Store,
    cache: Arc<CoalescingCache>,
    mut requests: mpsc::Receiver<ActuateRequest>,
) {
    let span = span!(Level::INFO, "Serial Poll");
    let _enter = span.enter();
    debug!("running");

    let cycles_per_monitor =
        (monitor_interval.as_secs() / poll_interval.as_secs().max(1)).max(1) as u32;
    let mut monitor_counter = 0u32;

    let mut interval = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                poll_cycle(&mut link, &index, &store, &cache).await;

                if monitor_counter == 0 {
                    monitor_counter = cycles_per_monitor;
                    for (cmd, param) in HOUSEKEEPING_COMMANDS {
                        if let Err(e) = link.command(cmd, param).await {
                            error!("{cmd} {param}: {e}");
                        }
                    }
                } else {
                    monitor_counter -= 1;
                }
            }

            Some(req) = requests.recv() => {
                actuate(&mut link, req, &index, &store, &cache).await;
            }
        }
    }
}

/// Errors are isolated per exchange: a failing command logs and the cycle
/// continues with the next one.
async fn poll_cycle<T: LineTransport>(
    link: &mut SerialLink<T>,
    index: &EntityIndex,
    store: &Store,
    cache: &CoalescingCache,
) {
    for (cmd, param, entity) in POLL_COMMANDS {
        match link.command(cmd, param).await {
            Ok(value) => record(entity, &value, index, store, cache).await,
            Err(e) => error!("{cmd} {param}: {e}"),
        }
    }
}

async fn actuate<T: LineTransport>(
    link: &mut SerialLink<T>,
    req: ActuateRequest,
    index: &EntityIndex,
    store: &Store,
    cache: &CoalescingCache,
) {
    let result = link.command(req.actuator.command(), &req.state).await;
    if let Ok(ref value) = result {
        record(req.actuator.entity(), value, index, store, cache).await;
    }
    if req.reply.send(result).is_err() {
        debug!("actuate caller went away before the reply");
    }
}

async fn record(
    entity: &str,
    value: &str,
    index: &EntityIndex,
    store: &Store,
    cache: &CoalescingCache,
) {
    let Some(entity_id) = index.serial_entity(entity) else {
        warn!("entity {entity} is not registered");
        return;
    };
    if let Err(e) = cache.observe(store, entity_id, value, Timestamp::now()).await {
        error!("storing {entity}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;
    use crate::ingest::serial::Terminator;

    #[derive(Default)]
    struct ScriptedTransport {
        reads: VecDeque<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn with_reads(reads: &[&[u8]]) -> Self {
            Self { reads: reads.iter().map(|r| r.to_vec()).collect() }
        }
    }

    impl LineTransport for ScriptedTransport {
        async fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn write_all(&mut self, _buf: &[u8]) -> io::Result<()> {
            Ok(())
        }

        async fn read_line(&mut self) -> io::Result<Vec<u8>> {
            Ok(self.reads.pop_front().unwrap_or_default())
        }
    }

    async fn seeded() -> (Store, Arc<EntityIndex>, CoalescingCache) {
        let store = Store::open_in_memory().await.unwrap();
        let index = EntityIndex::resolve(&store, &[], Some("camper")).await.unwrap();
        (store, Arc::new(index), CoalescingCache::new(5, 5))
    }

    #[tokio::test]
    async fn failing_exchange_does_not_stop_the_cycle() {
        let (store, index, cache) = seeded().await;

        // the starter exchange echoes garbage and dies, the rest go through
        let transport = ScriptedTransport::with_reads(&[
            b"VOLTAGE household\r\n",
            b"VOLTAGE v=12.6\r\n",
            b"VOLTAGE startr\r\n",
            b"VOLTAGE mains\r\n",
            b"VOLTAGE v=0.0\r\n",
            b"HOUSEHOLD ?\r\n",
            b"HOUSEHOLD state=1\r\n",
            b"WATER ?\r\n",
            b"WATER level=80\r\n",
            b"WASTE ?\r\n",
            b"WASTE level=20\r\n",
            b"PUMP ?\r\n",
            b"PUMP state=0\r\n",
        ]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        poll_cycle(&mut link, &index, &store, &cache).await;

        let rows = store.states_after(None, 100).await.unwrap();
        assert_eq!(rows.len(), POLL_COMMANDS.len() - 1);
        let entities: Vec<&str> = rows.iter().map(|r| r.entity.as_str()).collect();
        assert!(!entities.contains(&"starter_voltage"));

        let household = rows.iter().find(|r| r.entity == "household_voltage").unwrap();
        assert_eq!(household.state, "12.6");
        let pump = rows.iter().find(|r| r.entity == "pump_state").unwrap();
        assert_eq!(pump.state, "0");
    }

    #[tokio::test]
    async fn actuator_result_is_recorded_like_a_polled_reading() {
        let (store, index, cache) = seeded().await;

        let transport = ScriptedTransport::with_reads(&[b"PUMP 1\r\n", b"PUMP state=1\r\n"]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ActuateRequest {
            actuator: Actuator::Pump,
            state: "1".to_string(),
            reply: reply_tx,
        };
        actuate(&mut link, request, &index, &store, &cache).await;

        assert_eq!(reply_rx.await.unwrap().unwrap(), "1");
        let rows = store.states_after(None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity, "pump_state");
        assert_eq!(rows[0].state, "1");
    }

    #[tokio::test]
    async fn failed_actuator_reports_the_error_and_stores_nothing() {
        let (store, index, cache) = seeded().await;

        // silent board: no echo at all
        let transport = ScriptedTransport::with_reads(&[]);
        let mut link = SerialLink::new(transport, Terminator::CrLf);

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ActuateRequest {
            actuator: Actuator::Household,
            state: "1".to_string(),
            reply: reply_tx,
        };
        actuate(&mut link, request, &index, &store, &cache).await;

        assert!(matches!(reply_rx.await.unwrap(), Err(SerialError::NoEcho)));
        assert!(store.states_after(None, 10).await.unwrap().is_empty());
    }
}
