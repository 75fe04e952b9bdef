use crate::{FederationEnvelope, FederationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where to reach a peer server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub server_name: String,
    /// Base federation URL, e.g. `https://s2.example/_rookery/federation/v1`.
    pub federation_endpoint: String,
}

/// What a peer did with an envelope it accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Applied for the first time.
    Applied,
    /// Already applied earlier; acknowledged.
    Duplicate,
    /// Held back until an earlier event arrives; resend later.
    Deferred,
}

impl DeliveryOutcome {
    /// True when the sender can drop its queue row.
    pub fn is_acknowledged(self) -> bool {
        matches!(self, Self::Applied | Self::Duplicate)
    }
}

/// Response body of the event ingest endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostEventResponse {
    pub event_id: String,
    pub inserted: bool,
}

/// Outbound half of server-to-server delivery.
#[async_trait]
pub trait FederationTransport: Send + Sync {
    async fn send_event(
        &self,
        peer: &PeerEndpoint,
        envelope: &FederationEnvelope,
    ) -> Result<DeliveryOutcome, FederationError>;
}

/// Inbound half: whatever applies events received from peers.
#[async_trait]
pub trait InboundEventHandler: Send + Sync {
    async fn on_event(
        &self,
        envelope: FederationEnvelope,
    ) -> Result<DeliveryOutcome, FederationError>;
}
