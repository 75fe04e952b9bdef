use axum::{extract::State, http::StatusCode, Json};
use rookery_core::AppState;
use rookery_federation::client::ServerInfo;
use rookery_federation::{DeliveryOutcome, FederationEnvelope, PostEventResponse};
use serde_json::{json, Value};

use crate::error::ApiError;

pub const FEDERATION_PREFIX: &str = "/_rookery/federation/v1";

pub async fn well_known(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let service = &state.federation;
    let federation_endpoint = match state.config.public_url.as_deref() {
        Some(base) => format!("{}{FEDERATION_PREFIX}", base.trim_end_matches('/')),
        None => FEDERATION_PREFIX.to_string(),
    };
    let key = service.server_key();
    let info = ServerInfo {
        server_name: service.server_name().to_string(),
        federation_endpoint,
        key_id: key.as_ref().map(|k| k.key_id.clone()),
        public_key: key.map(|k| k.public_key),
    };
    let mut payload = json!(info);
    payload["enabled"] = json!(service.is_enabled());
    Ok(Json(payload))
}

pub async fn get_keys(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let service = &state.federation;
    let keys: Vec<_> = if service.is_enabled() {
        service.server_key().into_iter().collect()
    } else {
        Vec::new()
    };
    Ok(Json(json!({
        "server_name": service.server_name(),
        "keys": keys,
    })))
}

/// Inbound federation delivery. Answers 202 for applied and duplicate
/// events and 409 for events that wait on an earlier one.
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(envelope): Json<FederationEnvelope>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let event_id = envelope.event.event_id.clone();
    let outcome = rookery_core::inbound::receive(&state, envelope).await?;
    let response = PostEventResponse {
        event_id,
        inserted: outcome == DeliveryOutcome::Applied,
    };
    Ok((StatusCode::ACCEPTED, Json(json!(response))))
}
