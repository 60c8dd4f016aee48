use std::{error::Error, sync::Arc};

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::{
    cache::CoalescingCache,
    config::Config,
    ingest::{
        self,
        serial::{poll::ActuateRequest, SerialLink, SerialPortTransport},
        Advertisement, EntityIndex,
    },
    replicate, retention,
    store::Store,
};

pub struct HubState {
    pub store: Store,
    pub cache: Arc<CoalescingCache>,
    pub index: Arc<EntityIndex>,
    /// transport adapters push raw advertisements here
    pub advertisements: mpsc::Sender<Advertisement>,
    /// None on installations without a control board
    pub actuate: Option<mpsc::Sender<ActuateRequest>>,
}

impl HubState {
    /// Build every subsystem and spawn the periodic tasks.
    pub async fn init(cfg: Config) -> Result<Arc<Self>, Box<dyn Error>> {
        let store = Store::connect(&cfg.database_path).await?;
        let index = Arc::new(
            EntityIndex::resolve(&store, &cfg.scan, cfg.serial.as_ref().map(|s| s.sensor.as_str()))
                .await?,
        );
        let cache = Arc::new(CoalescingCache::new(
            cfg.cache.ttl_minutes,
            cfg.cache.freshness_minutes,
        ));

        let (adv_tx, adv_rx) = mpsc::channel::<Advertisement>(64);
        tokio::spawn(ingest::bthome_task(
            adv_rx,
            index.clone(),
            store.clone(),
            cache.clone(),
        ));

        let actuate = match cfg.serial {
            Some(serial_cfg) => {
                let transport = SerialPortTransport::open(
                    &serial_cfg.port,
                    serial_cfg.baud,
                    Duration::from_secs(serial_cfg.timeout_secs),
                )?;
                let link = SerialLink::new(transport, serial_cfg.terminator);
                let (tx, rx) = mpsc::channel::<ActuateRequest>(8);
                tokio::spawn(ingest::serial::poll::task(
                    link,
                    Duration::from_secs(serial_cfg.poll_interval_secs),
                    Duration::from_secs(serial_cfg.monitor_interval_secs),
                    index.clone(),
                    store.clone(),
                    cache.clone(),
                    rx,
                ));
                Some(tx)
            }
            None => None,
        };

        tokio::spawn(replicate::task(store.clone(), cfg.upload));
        tokio::spawn(retention::task(store.clone(), cfg.retention));

        info!("all tasks running");
        Ok(Arc::new(Self {
            store,
            cache,
            index,
            advertisements: adv_tx,
            actuate,
        }))
    }
}
