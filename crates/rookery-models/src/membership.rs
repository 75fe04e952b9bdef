use serde::{Deserialize, Serialize};

use crate::identity::FederatedIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum Role {
    Owner = 0,
    Member = 1,
}

impl Role {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Owner),
            1 => Some(Self::Member),
            _ => None,
        }
    }
}

/// A membership joined with its identity, as shown in member lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub identity: FederatedIdentity,
    pub role: Role,
    pub joined_at_ms: i64,
    /// Rendered for the viewing server.
    pub display: String,
}
