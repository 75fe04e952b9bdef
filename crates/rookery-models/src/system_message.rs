use serde::{Deserialize, Serialize};

/// A room timeline entry generated by a membership or room change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub id: i64,
    pub room_id: i64,
    pub event_id: String,
    pub author: String,
    pub text: String,
    pub created_at_ms: i64,
}

pub const LEFT_CHANNEL: &str = "left the channel";

pub fn added(handle: &str) -> String {
    format!("added {handle}")
}

pub fn removed(handle: &str) -> String {
    format!("removed {handle}")
}

pub fn renamed(name: &str) -> String {
    format!("changed room name to {name}")
}

pub fn topic_changed(topic: &str) -> String {
    format!("changed room topic to {topic}")
}
