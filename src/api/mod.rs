use std::{error::Error, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

use crate::ingest::serial::poll::{ActuateRequest, Actuator};
use crate::ingest::Advertisement;
use crate::state::HubState;
use crate::store::StateRow;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: err.to_string() }),
    )
}

pub async fn init(state: Arc<HubState>, listen: &str) -> Result<(), Box<dyn Error>> {
    let app = Router::new()
        .route("/sensors", get(get_sensors))
        .route("/sensors/{id}/entities", get(get_sensor_entities))
        .route("/entities/{id}/state", get(get_current_state))
        .route("/entities/{id}/states", get(get_states))
        .route("/advertisements", post(post_advertisement))
        .route("/household", post(post_household))
        .route("/pump", post(post_pump))
        .with_state(state);

    info!("listening on {listen}");
    let listener = TcpListener::bind(listen).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn get_sensors(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    match state.store.sensors().await {
        Ok(sensors) => Json(sensors).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_sensor_entities(
    State(state): State<Arc<HubState>>,
    Path(sensor_id): Path<i64>,
) -> impl IntoResponse {
    match state.store.entities_by_sensor(sensor_id).await {
        Ok(entities) => Json(entities).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

/// Current value through the cache: a hit never touches durable storage,
/// a miss falls back to the freshest recent durable row.
async fn get_current_state(
    State(state): State<Arc<HubState>>,
    Path(entity_id): Path<i64>,
) -> impl IntoResponse {
    match state
        .cache
        .current(&state.store, entity_id, Timestamp::now())
        .await
    {
        Ok(Some((value, created))) => Json(StateRow { state: value, created }).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct StatesQuery {
    limit: Option<usize>,
}

async fn get_states(
    State(state): State<Arc<HubState>>,
    Path(entity_id): Path<i64>,
    Query(query): Query<StatesQuery>,
) -> impl IntoResponse {
    match state
        .store
        .recent_states(entity_id, query.limit.unwrap_or(100))
        .await
    {
        Ok(states) => Json(states).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct AdvertisementBody {
    address: String,
    /// service data as a hex string
    service_data: String,
}

/// Gateway entry point: a BLE bridge forwards raw service data here, the
/// scan task decodes it like a locally received advertisement.
async fn post_advertisement(
    State(state): State<Arc<HubState>>,
    Json(body): Json<AdvertisementBody>,
) -> impl IntoResponse {
    let Some(service_data) = parse_hex(&body.service_data) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: "service_data is not valid hex".to_string() }),
        )
            .into_response();
    };

    let adv = Advertisement {
        address: body.address,
        service_data,
        received: Timestamp::now(),
    };
    match state.advertisements.send(adv).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Deserialize)]
struct ActuateBody {
    state: String,
}

#[derive(Serialize)]
struct ActuateResponse {
    state: String,
}

async fn post_household(
    State(state): State<Arc<HubState>>,
    Json(body): Json<ActuateBody>,
) -> impl IntoResponse {
    actuate(&state, Actuator::Household, body.state).await
}

async fn post_pump(
    State(state): State<Arc<HubState>>,
    Json(body): Json<ActuateBody>,
) -> impl IntoResponse {
    actuate(&state, Actuator::Pump, body.state).await
}

/// Route a one-shot command through the serial task so it never overlaps
/// a poll exchange; its result lands in the cache like a polled reading.
async fn actuate(state: &HubState, actuator: Actuator, value: String) -> axum::response::Response {
    let Some(ref actuate_tx) = state.actuate else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse { error: "no serial interface configured".to_string() }),
        )
            .into_response();
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = ActuateRequest { actuator, state: value, reply: reply_tx };
    if actuate_tx.send(request).await.is_err() {
        return internal_error("serial task is gone").into_response();
    }

    match reply_rx.await {
        Ok(Ok(new_state)) => Json(ActuateResponse { state: new_state }).into_response(),
        Ok(Err(e)) => (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_payloads() {
        assert_eq!(parse_hex("40015a"), Some(vec![0x40, 0x01, 0x5a]));
        assert_eq!(parse_hex("DEAD"), Some(vec![0xde, 0xad]));
        assert_eq!(parse_hex("abc"), None);
        assert_eq!(parse_hex("zz"), None);
    }
}
