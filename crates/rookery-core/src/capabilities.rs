use rookery_models::capabilities::RoomCapabilities;
use rookery_models::room::FederatedRoom;

/// Features available in a room. Calls, threads and discussions do not
/// cross server boundaries, so federated rooms get none of them.
pub fn capabilities_for(room: &FederatedRoom, defaults: RoomCapabilities) -> RoomCapabilities {
    if room.is_federated {
        RoomCapabilities::empty()
    } else {
        defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rookery_models::room::RoomKind;

    #[test]
    fn federated_rooms_lose_every_capability() {
        let mut room = FederatedRoom {
            id: 1,
            room_id: "!1:s1.example".to_string(),
            name: "general".to_string(),
            topic: None,
            kind: RoomKind::Private,
            origin_server: "s1.example".to_string(),
            is_federated: false,
            owner_id: 1,
            sequence: 0,
            created_at_ms: 0,
        };
        let defaults = RoomCapabilities::CALLS | RoomCapabilities::THREADS;
        assert_eq!(capabilities_for(&room, defaults), defaults);
        room.is_federated = true;
        assert_eq!(
            capabilities_for(&room, defaults),
            RoomCapabilities::empty()
        );
    }
}
