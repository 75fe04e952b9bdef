use rookery_federation::FederationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid handle format: {0}")]
    InvalidHandleFormat(String),
    #[error("'{username}' matches several users: {}", .candidates.join(", "))]
    AmbiguousIdentity {
        username: String,
        candidates: Vec<String>,
    },
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("server {0} is not part of this room's federation")]
    UnknownPeer(String),
    #[error("unknown room: {0}")]
    UnknownRoom(String),
    #[error("event {0} was already applied")]
    DuplicateEvent(String),
    #[error("event for {room_id} is ahead of sequence {cursor} (got {sequence})")]
    OutOfOrder {
        room_id: String,
        cursor: i64,
        sequence: i64,
    },
    #[error("event {0} was not delivered in time")]
    PropagationTimeout(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("database error: {0}")]
    Database(#[from] rookery_db::DbError),
    #[error("federation error: {0}")]
    Federation(#[from] FederationError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(value: sqlx::Error) -> Self {
        Self::Database(rookery_db::DbError::Sqlx(value))
    }
}

impl CoreError {
    /// Errors a peer will get again no matter how often it resends.
    pub fn is_permanent_rejection(&self) -> bool {
        match self {
            Self::InvalidHandleFormat(_)
            | Self::AmbiguousIdentity { .. }
            | Self::UnknownIdentity(_)
            | Self::PermissionDenied
            | Self::UnknownPeer(_)
            | Self::UnknownRoom(_)
            | Self::BadRequest(_) => true,
            Self::Federation(err) => matches!(
                err,
                FederationError::InvalidSignature
                    | FederationError::Disabled
                    | FederationError::UnknownServer(_)
            ),
            _ => false,
        }
    }
}
