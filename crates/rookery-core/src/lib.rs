pub mod auth;
pub mod capabilities;
pub mod error;
pub mod events;
pub mod identity;
pub mod inbound;
pub mod locks;
pub mod membership;
pub mod permissions;
pub mod propagation;

use rookery_db::rooms::RoomRow;
use rookery_db::DbPool;
use rookery_federation::ordering::ReorderBuffer;
use rookery_federation::queue::{DeliverySettings, OutboundQueue};
use rookery_federation::{FederationService, FederationTransport};
use rookery_models::capabilities::RoomCapabilities;
use rookery_models::event::MembershipEvent;
use rookery_models::room::{FederatedRoom, RoomKind};
use std::sync::Arc;
use tokio::sync::Notify;

use error::CoreError;
use identity::IdentityResolver;
use locks::RoomLocks;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Domain this server is authoritative for; also its federation name.
    pub server_name: String,
    /// Externally reachable base URL, advertised in discovery.
    pub public_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_expiry_seconds: u64,
    /// Snowflake worker id for locally generated ids.
    pub worker_id: u16,
    /// Capabilities of rooms that are not federated.
    pub capability_defaults: RoomCapabilities,
    /// How long applied event ids are remembered for deduplication.
    pub dedupe_window_ms: i64,
    /// Events held per room while waiting for a sequence gap to close.
    pub reorder_capacity: usize,
}

impl AppConfig {
    pub fn new(server_name: impl Into<String>, jwt_secret: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into().to_ascii_lowercase(),
            public_url: None,
            jwt_secret: jwt_secret.into(),
            jwt_expiry_seconds: 7 * 24 * 3600,
            worker_id: 1,
            capability_defaults: RoomCapabilities::default(),
            dedupe_window_ms: 7 * 24 * 3_600_000,
            reorder_capacity: 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub event_bus: events::EventBus,
    pub config: AppConfig,
    pub federation: FederationService,
    pub outbound: Arc<OutboundQueue>,
    pub identities: Arc<IdentityResolver>,
    pub room_locks: Arc<RoomLocks>,
    /// Sequenced events that arrived ahead of a gap, per room.
    pub reorder: Arc<ReorderBuffer<MembershipEvent>>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: AppConfig,
        federation: FederationService,
        transport: Arc<dyn FederationTransport>,
        delivery: DeliverySettings,
    ) -> Self {
        let outbound = Arc::new(OutboundQueue::new(db.clone(), transport, delivery));
        let identities = Arc::new(IdentityResolver::new(
            config.server_name.clone(),
            config.worker_id,
        ));
        let reorder = Arc::new(ReorderBuffer::new(config.reorder_capacity));
        Self {
            db,
            event_bus: events::EventBus::default(),
            config,
            federation,
            outbound,
            identities,
            room_locks: Arc::new(RoomLocks::new()),
            reorder,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn local_domain(&self) -> &str {
        &self.config.server_name
    }

    pub(crate) fn next_id(&self) -> i64 {
        rookery_util::snowflake::generate(self.config.worker_id)
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn room_from_row(row: RoomRow) -> Result<FederatedRoom, CoreError> {
    let kind = i16::try_from(row.kind)
        .ok()
        .and_then(RoomKind::from_i16)
        .ok_or_else(|| CoreError::Internal(format!("room {} has unknown kind {}", row.id, row.kind)))?;
    Ok(FederatedRoom {
        id: row.id,
        room_id: row.room_id,
        name: row.name,
        topic: row.topic,
        kind,
        origin_server: row.origin_server,
        is_federated: row.is_federated,
        owner_id: row.owner_id,
        sequence: row.sequence,
        created_at_ms: row.created_at_ms,
    })
}
