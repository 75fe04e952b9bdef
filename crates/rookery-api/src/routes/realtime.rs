use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream;
use rookery_core::events::ServerEvent;
use rookery_core::membership;
use rookery_core::AppState;
use rookery_models::gateway;
use rookery_models::room::RoomKind;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use crate::error::ApiError;
use crate::middleware::AuthUser;

struct RoomStreamState {
    room_id: String,
    viewer_id: i64,
    private: bool,
    sequence: u64,
    finished: bool,
    receiver: tokio::sync::broadcast::Receiver<ServerEvent>,
}

impl RoomStreamState {
    /// The room is gone, or the viewer lost the right to see a private room.
    fn closes_stream(&self, event: &ServerEvent) -> bool {
        match event.event_type.as_str() {
            gateway::EVENT_ROOM_DELETE => true,
            gateway::EVENT_ROOM_MEMBER_REMOVE => {
                self.private
                    && event.payload["identity"]["id"].as_i64() == Some(self.viewer_id)
            }
            _ => false,
        }
    }
}

/// Server-sent stream of one room's bus notifications, for anyone allowed
/// to view the room.
pub async fn stream_room_events(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<String>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe before the access check so nothing published in between is lost.
    let receiver = state.event_bus.subscribe();
    let view = membership::room_view(&state, &room_id, auth.identity_id).await?;
    tracing::debug!(room_id = %view.room.room_id, viewer = auth.identity_id, "realtime: stream opened");

    let stream_state = RoomStreamState {
        room_id: view.room.room_id,
        viewer_id: auth.identity_id,
        private: view.room.kind == RoomKind::Private,
        sequence: 0,
        finished: false,
        receiver,
    };

    let event_stream = stream::unfold(stream_state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            match st.receiver.recv().await {
                Ok(event) if event.room_id.as_deref() == Some(st.room_id.as_str()) => {
                    st.finished = st.closes_stream(&event);
                    st.sequence = st.sequence.saturating_add(1);
                    let data = json!({
                        "t": &event.event_type,
                        "s": st.sequence,
                        "d": &event.payload,
                    })
                    .to_string();
                    let sse_event = Event::default()
                        .event(event.event_type)
                        .id(st.sequence.to_string())
                        .data(data);
                    return Some((Ok(sse_event), st));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    st.sequence = st.sequence.saturating_add(1);
                    let data = json!({ "reason": "lagged", "skipped": skipped }).to_string();
                    let sse_event = Event::default()
                        .event("LAGGED")
                        .id(st.sequence.to_string())
                        .data(data);
                    return Some((Ok(sse_event), st));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
