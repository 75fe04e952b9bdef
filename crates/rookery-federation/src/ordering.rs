use dashmap::DashMap;
use std::collections::BTreeMap;

/// Per-room holding area for sequenced events that arrived ahead of a gap.
///
/// The buffer is keyed by room id and then by sequence. Callers serialize
/// access per room (the room lock), so the only concurrency handled here is
/// between different rooms.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    rooms: DashMap<String, BTreeMap<i64, T>>,
    per_room_capacity: usize,
}

/// Where an offered item ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum Offer<T> {
    /// Next in line; apply it now.
    Ready(T),
    /// At or below the cursor; already applied.
    Stale,
    /// Kept until the gap before it closes.
    Buffered,
    /// Ahead of a gap but the room's buffer is full; the sender must resend.
    Full,
}

impl<T> ReorderBuffer<T> {
    pub fn new(per_room_capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            per_room_capacity: per_room_capacity.max(1),
        }
    }

    /// Offer `item` carrying `sequence` to a room whose cursor is `cursor`.
    pub fn offer(&self, room_id: &str, cursor: i64, sequence: i64, item: T) -> Offer<T> {
        if sequence <= cursor {
            return Offer::Stale;
        }
        if sequence == cursor + 1 {
            return Offer::Ready(item);
        }
        let mut pending = self.rooms.entry(room_id.to_string()).or_default();
        if pending.contains_key(&sequence) {
            return Offer::Buffered;
        }
        if pending.len() >= self.per_room_capacity {
            return Offer::Full;
        }
        pending.insert(sequence, item);
        Offer::Buffered
    }

    /// Pop the buffered item that directly follows `cursor`, discarding any
    /// entries the cursor has already passed.
    pub fn take_next(&self, room_id: &str, cursor: i64) -> Option<T> {
        let mut pending = self.rooms.get_mut(room_id)?;
        while let Some(entry) = pending.first_entry() {
            if *entry.key() <= cursor {
                entry.remove();
                continue;
            }
            if *entry.key() == cursor + 1 {
                let item = entry.remove();
                let now_empty = pending.is_empty();
                drop(pending);
                if now_empty {
                    self.rooms.remove_if(room_id, |_, map| map.is_empty());
                }
                return Some(item);
            }
            break;
        }
        None
    }

    pub fn pending(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|map| map.len()).unwrap_or(0)
    }

    /// Drop everything held for a room.
    pub fn clear_room(&self, room_id: &str) {
        self.rooms.remove(room_id);
    }
}
