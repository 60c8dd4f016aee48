pub mod error;
pub mod remote;

use std::time::{Duration, Instant};

use error::UploadError;
use jiff::Timestamp;
use remote::{EndpointConfig, Session};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, span, Level};

use crate::store::{Store, UploadRow};

/// Parameter holding the observed-at of the most recently
/// confirmed-uploaded reading.
pub const CURSOR_PARAMETER: &str = "last_upload";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    pub table: String,
    pub chunk_size: usize,
    pub run_timeout_secs: u64,
    pub interval_secs: u64,
    pub startup_delay_secs: u64,
    /// candidates are probed in order each run
    pub endpoints: Vec<EndpointConfig>,
}

/// Destination of one page of readings. Implemented by the negotiated
/// remote session, mocked in tests.
pub trait RowSink {
    fn send(&mut self, rows: &[UploadRow]) -> impl Future<Output = Result<(), UploadError>> + Send;
}

/// Fixed-interval replication task. A failed run only logs, the next tick
/// retries from the committed cursor.
pub async fn task(store: Store, cfg: UploadConfig) {
    let span = span!(Level::INFO, "Replicator");
    let _enter = span.enter();

    tokio::time::sleep(Duration::from_secs(cfg.startup_delay_secs)).await;
    debug!("running");

    loop {
        let started = Instant::now();
        match run_once(&store, &cfg).await {
            Ok(Some(cursor)) => info!("uploaded readings through {cursor}"),
            Ok(None) => debug!("nothing to upload"),
            Err(e) => error!("upload run failed: {e}"),
        }

        let interval = Duration::from_secs(cfg.interval_secs);
        tokio::time::sleep(interval.saturating_sub(started.elapsed())).await;
    }
}

/// One replication run: negotiate a session, drain the backlog past the
/// persisted cursor, commit the new cursor if any page went through.
pub async fn run_once(store: &Store, cfg: &UploadConfig) -> Result<Option<Timestamp>, UploadError> {
    let mut session = Session::connect(&cfg.endpoints, &cfg.table, PROBE_TIMEOUT).await?;
    let cursor = read_cursor(store).await?;

    let (candidate, outcome) = drain_backlog(
        store,
        &mut session,
        cursor,
        cfg.chunk_size,
        Duration::from_secs(cfg.run_timeout_secs),
    )
    .await;

    // pages that fully uploaded are committed even when a later one failed,
    // so the next run never resends them
    if let Some(ts) = candidate {
        store
            .set_parameter(CURSOR_PARAMETER, &ts.as_microsecond().to_string())
            .await?;
    }
    outcome?;
    Ok(candidate)
}

async fn read_cursor(store: &Store) -> Result<Option<Timestamp>, UploadError> {
    match store.parameter(CURSOR_PARAMETER).await? {
        Some(raw) => {
            let micros: i64 = raw.parse().map_err(|_| UploadError::BadCursor(raw.clone()))?;
            Ok(Some(
                Timestamp::from_microsecond(micros).map_err(|_| UploadError::BadCursor(raw))?,
            ))
        }
        None => Ok(None),
    }
}

/// Upload pages of readings strictly newer than `cursor`, oldest first,
/// advancing the candidate cursor after each fully-uploaded page. Stops on
/// a short page (backlog drained) or when the run budget is spent; a large
/// backlog resumes from the candidate next run.
pub async fn drain_backlog<S: RowSink>(
    store: &Store,
    sink: &mut S,
    cursor: Option<Timestamp>,
    chunk_size: usize,
    run_timeout: Duration,
) -> (Option<Timestamp>, Result<(), UploadError>) {
    let started = Instant::now();
    let mut candidate: Option<Timestamp> = None;

    loop {
        let after = candidate.or(cursor);
        let rows = match store.states_after(after, chunk_size).await {
            Ok(rows) => rows,
            Err(e) => return (candidate, Err(e.into())),
        };
        if rows.is_empty() {
            break;
        }

        if let Err(e) = sink.send(&rows).await {
            return (candidate, Err(e));
        }
        if let Some(last) = rows.last() {
            candidate = Some(last.created);
        }

        if rows.len() < chunk_size {
            break;
        }
        if started.elapsed() >= run_timeout {
            info!("run budget spent with backlog remaining, resuming next run");
            break;
        }
    }

    (candidate, Ok(()))
}
