#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use ed25519_dalek::SigningKey;
use rookery_core::{membership, now_ms, AppConfig, AppState};
use rookery_federation::queue::DeliverySettings;
use rookery_federation::{
    DeliveryOutcome, FederationConfig, FederationEnvelope, FederationError, FederationService,
    FederationTransport, InboundEventHandler, PeerEndpoint,
};
use rookery_models::identity::FederatedIdentity;
use std::sync::Arc;

pub const KEY_ID: &str = "ed25519:test";

/// In-process network: envelopes go straight to the destination's handler.
#[derive(Default)]
pub struct Loopback {
    handlers: DashMap<String, Arc<dyn InboundEventHandler>>,
    down: DashSet<String>,
}

impl Loopback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make sends to `domain` fail as if the host were unreachable.
    pub fn take_down(&self, domain: &str) {
        self.down.insert(domain.to_string());
    }

    pub fn bring_up(&self, domain: &str) {
        self.down.remove(domain);
    }
}

#[async_trait]
impl FederationTransport for Loopback {
    async fn send_event(
        &self,
        peer: &PeerEndpoint,
        envelope: &FederationEnvelope,
    ) -> Result<DeliveryOutcome, FederationError> {
        if self.down.contains(&peer.server_name) {
            return Err(FederationError::Http(format!(
                "{}: connection refused",
                peer.server_name
            )));
        }
        let handler = self
            .handlers
            .get(&peer.server_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FederationError::UnknownServer(peer.server_name.clone()))?;
        handler.on_event(envelope.clone()).await
    }
}

pub fn delivery_settings() -> DeliverySettings {
    DeliverySettings {
        max_attempts: 3,
        base_backoff_ms: 1_000,
        max_backoff_ms: 60_000,
        batch_size: 100,
    }
}

pub fn federation_for(domain: &str, seed: u8) -> FederationService {
    FederationService::new(FederationConfig {
        enabled: true,
        server_name: domain.to_string(),
        key_id: KEY_ID.to_string(),
        signing_key: Some(SigningKey::from_bytes(&[seed; 32])),
        allow_discovery: false,
    })
}

/// A server on the loopback network with its own in-memory database.
pub async fn server(net: &Arc<Loopback>, domain: &str, seed: u8) -> anyhow::Result<AppState> {
    let db = rookery_db::create_pool("sqlite::memory:", 1).await?;
    rookery_db::run_migrations(&db).await?;
    let mut config = AppConfig::new(domain, "integration-test-secret");
    config.worker_id = u16::from(seed);
    let state = AppState::new(
        db,
        config,
        federation_for(domain, seed),
        net.clone(),
        delivery_settings(),
    );
    net.handlers
        .insert(domain.to_string(), Arc::new(state.clone()));
    Ok(state)
}

/// Register every server as a trusted peer of every other one.
pub async fn link(servers: &[&AppState]) -> anyhow::Result<()> {
    for local in servers {
        for peer in servers {
            if local.local_domain() == peer.local_domain() {
                continue;
            }
            let public_key = peer
                .federation
                .signing_public_key()
                .ok_or_else(|| anyhow::anyhow!("peer has no key"))?;
            rookery_core::propagation::register_peer(
                local,
                peer.local_domain(),
                &format!("loopback://{}", peer.local_domain()),
                Some(&public_key),
                Some(KEY_ID),
            )
            .await?;
        }
    }
    Ok(())
}

/// Drain every queue, answering resync requests along the way, until a
/// full round does nothing. Each round moves the clock an hour ahead so that
/// any backoff has expired.
pub async fn settle(servers: &[&AppState]) -> anyhow::Result<()> {
    let base = now_ms();
    for round in 0..32i64 {
        let now = base + round * 3_600_000;
        let mut attempted = 0;
        for server in servers {
            attempted += server.outbound.deliver_due(now).await?.attempted();
        }
        for server in servers {
            attempted += rookery_core::propagation::resync_peers(server, now).await?;
        }
        if attempted == 0 {
            return Ok(());
        }
    }
    anyhow::bail!("queues did not settle")
}

pub async fn user(state: &AppState, username: &str) -> anyhow::Result<FederatedIdentity> {
    Ok(membership::register_local(state, username).await?)
}

pub async fn member_displays(
    state: &AppState,
    room_id: &str,
    viewer: &FederatedIdentity,
) -> anyhow::Result<Vec<String>> {
    let mut displays: Vec<String> = membership::members(state, room_id, viewer.id)
        .await?
        .into_iter()
        .map(|member| member.display)
        .collect();
    displays.sort();
    Ok(displays)
}

/// `(author, text)` for each timeline entry, oldest first.
pub async fn timeline(
    state: &AppState,
    room_id: &str,
    viewer: &FederatedIdentity,
) -> anyhow::Result<Vec<(String, String)>> {
    Ok(membership::timeline(state, room_id, viewer.id)
        .await?
        .into_iter()
        .map(|message| (message.author, message.text))
        .collect())
}

/// Queued envelopes on `state`, ordered by room sequence.
pub async fn queued_envelopes(state: &AppState) -> anyhow::Result<Vec<FederationEnvelope>> {
    let mut envelopes = Vec::new();
    for row in rookery_db::federation::list_outbound_events(&state.db).await? {
        envelopes.push(serde_json::from_str::<FederationEnvelope>(&row.envelope)?);
    }
    envelopes.sort_by_key(|envelope| envelope.event.sequence);
    Ok(envelopes)
}
