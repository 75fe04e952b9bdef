use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoomPermissions: i64 {
        const ADD_MEMBERS    = 1 << 0;
        const REMOVE_MEMBERS = 1 << 1;
        const RENAME_ROOM    = 1 << 2;
        const CHANGE_TOPIC   = 1 << 3;
        const DELETE_ROOM    = 1 << 4;
        const LEAVE_ROOM     = 1 << 5;
    }
}

impl RoomPermissions {
    /// Everything the owner on the room's origin server may do.
    pub fn owner() -> Self {
        Self::all() - Self::LEAVE_ROOM
    }
}

impl Serialize for RoomPermissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.bits())
    }
}

impl<'de> Deserialize<'de> for RoomPermissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = i64::deserialize(deserializer)?;
        Ok(RoomPermissions::from_bits_truncate(bits))
    }
}
