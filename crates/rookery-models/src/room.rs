use serde::{Deserialize, Serialize};

use crate::membership::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum RoomKind {
    /// Public channel.
    Public = 0,
    /// Private group.
    Private = 1,
}

impl RoomKind {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Public),
            1 => Some(Self::Private),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedRoom {
    pub id: i64,
    /// Federation-wide identifier, `!<id>:<origin domain>`.
    pub room_id: String,
    pub name: String,
    pub topic: Option<String>,
    pub kind: RoomKind,
    pub origin_server: String,
    pub is_federated: bool,
    pub owner_id: i64,
    /// Last sequence assigned (origin) or applied (replica).
    pub sequence: i64,
    pub created_at_ms: i64,
}

impl FederatedRoom {
    pub fn is_origin(&self, local_domain: &str) -> bool {
        self.origin_server.eq_ignore_ascii_case(local_domain)
    }
}

/// Build the federation-wide room id for a locally created room.
pub fn federated_room_id(local_id: i64, origin_domain: &str) -> String {
    format!("!{local_id}:{origin_domain}")
}

/// Domain part of a federated room id.
pub fn room_origin_domain(room_id: &str) -> Option<&str> {
    room_id
        .strip_prefix('!')
        .and_then(|rest| rest.split_once(':'))
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMember {
    pub handle: String,
    pub role: Role,
}

/// Full room state shipped to a server the first time one of its users joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub name: String,
    pub topic: Option<String>,
    pub kind: RoomKind,
    pub owner: String,
    pub members: Vec<SnapshotMember>,
}
