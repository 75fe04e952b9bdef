use axum::{
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use rookery_core::AppState;
use serde_json::json;

pub mod error;
pub mod middleware;
pub mod routes;

pub fn build_router() -> Router<AppState> {
    let cors = build_cors_layer();
    Router::new()
        // Health
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        // Federation discovery and transport
        .route(
            "/.well-known/rookery/server",
            get(routes::federation::well_known),
        )
        .route(
            "/_rookery/federation/v1/keys",
            get(routes::federation::get_keys),
        )
        .route(
            "/_rookery/federation/v1/event",
            post(routes::federation::ingest_event),
        )
        // Identities
        .route("/api/v1/users", post(routes::users::create_user))
        .route("/api/v1/users/@me", get(routes::users::get_me))
        // Rooms
        .route(
            "/api/v1/rooms",
            get(routes::rooms::list_rooms).post(routes::rooms::create_room),
        )
        .route(
            "/api/v1/rooms/{room_id}",
            get(routes::rooms::get_room)
                .patch(routes::rooms::update_room)
                .delete(routes::rooms::delete_room),
        )
        .route(
            "/api/v1/rooms/{room_id}/leave",
            post(routes::rooms::leave_room),
        )
        .route(
            "/api/v1/rooms/{room_id}/messages",
            get(routes::rooms::get_messages),
        )
        .route(
            "/api/v1/rooms/{room_id}/events",
            get(routes::realtime::stream_room_events),
        )
        // Members
        .route(
            "/api/v1/rooms/{room_id}/members",
            get(routes::members::list_members).post(routes::members::invite_members),
        )
        .route(
            "/api/v1/rooms/{room_id}/members/{handle}",
            delete(routes::members::remove_member),
        )
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn build_cors_layer() -> tower_http::cors::CorsLayer {
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "rookery" })),
    )
}
