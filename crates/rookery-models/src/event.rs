use serde::{Deserialize, Serialize};

use crate::room::RoomSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "m.room.invite")]
    Invite,
    #[serde(rename = "m.room.remove")]
    Remove,
    #[serde(rename = "m.room.leave")]
    Leave,
    #[serde(rename = "m.room.name")]
    Rename,
    #[serde(rename = "m.room.topic")]
    TopicChange,
    #[serde(rename = "m.room.delete")]
    Delete,
    /// The origin's current state, sent to a server that lost events.
    #[serde(rename = "m.room.sync")]
    Sync,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invite => "m.room.invite",
            Self::Remove => "m.room.remove",
            Self::Leave => "m.room.leave",
            Self::Rename => "m.room.name",
            Self::TopicChange => "m.room.topic",
            Self::Delete => "m.room.delete",
            Self::Sync => "m.room.sync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "m.room.invite" => Some(Self::Invite),
            "m.room.remove" => Some(Self::Remove),
            "m.room.leave" => Some(Self::Leave),
            "m.room.name" => Some(Self::Rename),
            "m.room.topic" => Some(Self::TopicChange),
            "m.room.delete" => Some(Self::Delete),
            "m.room.sync" => Some(Self::Sync),
            _ => None,
        }
    }

    /// Kinds carrying a target identity.
    pub fn has_target(self) -> bool {
        matches!(self, Self::Invite | Self::Remove)
    }

    /// Kinds that replace what a peer holds rather than extend it, and so
    /// are never followed up by a resync when they fail to arrive.
    pub fn supersedes_history(self) -> bool {
        matches!(self, Self::Delete | Self::Sync)
    }
}

/// One ordered fact about a room, replicated to every server hosting it.
///
/// `sequence` is assigned by the room's origin server. A value of zero marks
/// a proposal: a change made on a non-origin server that still has to be
/// sequenced by the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub event_id: String,
    pub room_id: String,
    pub kind: EventKind,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub origin_server: String,
    pub sequence: i64,
    pub origin_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<RoomSnapshot>,
}

impl MembershipEvent {
    pub fn is_proposal(&self) -> bool {
        self.sequence == 0
    }
}

/// Event id for a locally created event: `$<kind>_<id>:<domain>`.
pub fn local_event_id(kind: EventKind, unique: i64, domain: &str) -> String {
    format!("${}_{}:{}", kind.as_str().replace('.', "_"), unique, domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_wire_names() {
        for kind in [
            EventKind::Invite,
            EventKind::Remove,
            EventKind::Leave,
            EventKind::Rename,
            EventKind::TopicChange,
            EventKind::Delete,
            EventKind::Sync,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.as_str().to_string()));
        }
    }

    #[test]
    fn optional_payload_is_omitted_from_wire_form() {
        let event = MembershipEvent {
            event_id: local_event_id(EventKind::Leave, 9, "s2.example"),
            room_id: "!1:s1.example".to_string(),
            kind: EventKind::Leave,
            actor: "bob:s2.example".to_string(),
            target: None,
            origin_server: "s2.example".to_string(),
            sequence: 0,
            origin_ts: 1,
            name: None,
            topic: None,
            snapshot: None,
        };
        assert!(event.is_proposal());
        assert_eq!(event.event_id, "$m_room_leave_9:s2.example");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("snapshot").is_none());
        assert!(json.get("target").is_none());
    }
}
