pub mod client;
pub mod ordering;
pub mod queue;
pub mod transport;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rookery_db::DbPool;
use rookery_models::event::MembershipEvent;
use serde::{Deserialize, Serialize};

pub use transport::{
    DeliveryOutcome, FederationTransport, InboundEventHandler, PeerEndpoint, PostEventResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("federation is disabled")]
    Disabled,
    #[error("missing signing key")]
    MissingSigningKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http error: {0}")]
    Http(String),
    #[error("remote server error: {0}")]
    RemoteError(String),
    /// The peer refused the event and will keep refusing it.
    #[error("rejected by peer: {0}")]
    Rejected(String),
    #[error("unknown server: {0}")]
    UnknownServer(String),
    #[error("delivery cancelled")]
    Cancelled,
}

impl FederationError {
    /// Errors that retrying cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::UnknownServer(_))
    }
}

#[derive(Debug, Clone)]
pub struct FederationConfig {
    pub enabled: bool,
    pub server_name: String,
    pub key_id: String,
    pub signing_key: Option<SigningKey>,
    pub allow_discovery: bool,
}

impl FederationConfig {
    pub fn disabled(server_name: impl Into<String>) -> Self {
        Self {
            enabled: false,
            server_name: server_name.into(),
            key_id: "ed25519:auto".to_string(),
            signing_key: None,
            allow_discovery: false,
        }
    }
}

/// A membership event as it travels between servers, signed by the server
/// that sent it. `sender` is not necessarily the event's origin: a leave
/// proposed by one server is relayed to everyone else by the room's origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationEnvelope {
    pub sender: String,
    pub key_id: String,
    pub event: MembershipEvent,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationServerKey {
    pub server_name: String,
    pub key_id: String,
    pub public_key: String,
}

#[derive(Debug, Clone)]
pub struct FederationService {
    config: FederationConfig,
}

impl FederationService {
    pub fn new(config: FederationConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    pub fn key_id(&self) -> &str {
        &self.config.key_id
    }

    pub fn allow_discovery(&self) -> bool {
        self.config.allow_discovery
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn signing_public_key(&self) -> Option<String> {
        self.config
            .signing_key
            .as_ref()
            .map(|key| hex_encode(&key.verifying_key().to_bytes()))
    }

    pub fn server_key(&self) -> Option<FederationServerKey> {
        self.signing_public_key().map(|public_key| FederationServerKey {
            server_name: self.config.server_name.clone(),
            key_id: self.config.key_id.clone(),
            public_key,
        })
    }

    pub fn sign_payload(&self, payload: &[u8]) -> Result<String, FederationError> {
        if !self.config.enabled {
            return Err(FederationError::Disabled);
        }
        let signing_key = self
            .config
            .signing_key
            .as_ref()
            .ok_or(FederationError::MissingSigningKey)?;
        let signature = signing_key.sign(payload);
        Ok(hex_encode(&signature.to_bytes()))
    }

    pub fn verify_payload(
        &self,
        payload: &[u8],
        signature_hex: &str,
        public_key_hex: &str,
    ) -> Result<(), FederationError> {
        let signature_bytes = hex_decode(signature_hex).ok_or(FederationError::InvalidSignature)?;
        let public_key_bytes =
            hex_decode(public_key_hex).ok_or(FederationError::InvalidSignature)?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| FederationError::InvalidSignature)?;
        let key_bytes: [u8; 32] = public_key_bytes
            .try_into()
            .map_err(|_| FederationError::InvalidSignature)?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| FederationError::InvalidSignature)?;
        verifying_key
            .verify(payload, &signature)
            .map_err(|_| FederationError::InvalidSignature)
    }

    /// Wrap an event for sending, signed with this server's key.
    pub fn seal(&self, event: MembershipEvent) -> Result<FederationEnvelope, FederationError> {
        let sender = self.config.server_name.clone();
        let key_id = self.config.key_id.clone();
        let signature = self.sign_payload(&canonical_envelope_bytes(&sender, &key_id, &event))?;
        Ok(FederationEnvelope {
            sender,
            key_id,
            event,
            signature,
        })
    }

    /// Check an inbound envelope against the sender's published key.
    pub fn verify_envelope(
        &self,
        envelope: &FederationEnvelope,
        public_key_hex: &str,
    ) -> Result<(), FederationError> {
        let canonical =
            canonical_envelope_bytes(&envelope.sender, &envelope.key_id, &envelope.event);
        self.verify_payload(&canonical, &envelope.signature, public_key_hex)
    }
}

/// Load the persisted server keypair, generating and storing one on first
/// start.
pub async fn load_or_generate_signing_key(
    pool: &DbPool,
    key_id: &str,
) -> Result<SigningKey, FederationError> {
    if let Some(row) = rookery_db::federation::get_server_keypair(pool).await? {
        let bytes = hex_decode(&row.signing_key_hex).ok_or(FederationError::MissingSigningKey)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FederationError::MissingSigningKey)?;
        return Ok(SigningKey::from_bytes(&bytes));
    }

    let seed: [u8; 32] = rand::random();
    let signing_key = SigningKey::from_bytes(&seed);
    let public_hex = hex_encode(&signing_key.verifying_key().to_bytes());
    rookery_db::federation::upsert_server_keypair(pool, key_id, &hex_encode(&seed), &public_hex)
        .await?;
    tracing::info!(key_id, "federation: generated new server signing key");
    Ok(signing_key)
}

/// Canonical bytes signed for an envelope. Object keys are emitted in sorted
/// order, so both ends produce identical bytes for the same event.
pub fn canonical_envelope_bytes(sender: &str, key_id: &str, event: &MembershipEvent) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "sender": sender,
        "key_id": key_id,
        "event": event,
    }))
    .unwrap_or_default()
}

/// Retry time after `attempt_count` failed deliveries: base delay doubled per
/// attempt, capped.
pub fn next_retry_ts(now_ms: i64, attempt_count: i64, base_ms: i64, max_ms: i64) -> i64 {
    let exp = attempt_count.clamp(0, 30) as u32;
    let delay_ms = base_ms.saturating_mul(1_i64 << exp);
    now_ms.saturating_add(delay_ms.min(max_ms))
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn hex_decode(value: &str) -> Option<Vec<u8>> {
    if !value.len().is_multiple_of(2) || !value.is_ascii() {
        return None;
    }
    let mut out = Vec::with_capacity(value.len() / 2);
    let mut i = 0;
    while i < value.len() {
        let byte = u8::from_str_radix(&value[i..i + 2], 16).ok()?;
        out.push(byte);
        i += 2;
    }
    Some(out)
}
