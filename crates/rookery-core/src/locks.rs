use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per federated room. Every mutation of a room's members,
/// sequence or queue rows happens while holding it.
#[derive(Default)]
pub struct RoomLocks {
    rooms: DashMap<String, Arc<Mutex<()>>>,
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, room_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop the mutex of a deleted room once nobody holds it.
    pub fn forget(&self, room_id: &str) {
        self.rooms
            .remove_if(room_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_room_serializes_other_rooms_do_not() {
        let locks = RoomLocks::new();
        let held = locks.lock("!a:s1").await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("!b:s1")).await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("!a:s1")).await;
        assert!(same.is_err());

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.lock("!a:s1")).await;
        assert!(again.is_ok());
    }
}
