use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Federated room id this event belongs to, if applicable.
    pub room_id: Option<String>,
}

/// Broadcast-based bus notifying local subscribers of room changes.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ServerEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    pub fn dispatch(&self, event_type: &str, payload: serde_json::Value, room_id: Option<&str>) {
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload,
            room_id: room_id.map(str::to_string),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
