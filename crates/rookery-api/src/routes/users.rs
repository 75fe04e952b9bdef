use axum::{extract::State, http::StatusCode, Json};
use rookery_core::AppState;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
}

/// Provision an identity on this server and hand back a token for it.
pub async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let username = body.username.trim();
    let identity = rookery_core::membership::register_local(&state, username).await?;
    let token = rookery_core::auth::create_token(
        identity.id,
        &state.config.jwt_secret,
        state.config.jwt_expiry_seconds,
    )
    .map_err(|e| ApiError::Internal(anyhow::anyhow!(e.to_string())))?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "identity": identity,
            "handle": identity.handle(),
            "token": token,
        })),
    ))
}

pub async fn get_me(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state
        .db
        .acquire()
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    let identity = state.identities.get(&mut conn, auth.identity_id).await?;
    Ok(Json(json!({
        "identity": identity,
        "handle": identity.handle(),
    })))
}
