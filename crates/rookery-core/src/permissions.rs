use crate::error::CoreError;
use rookery_models::identity::FederatedIdentity;
use rookery_models::permissions::RoomPermissions;
use rookery_models::room::FederatedRoom;

/// An operation an actor wants to perform on a room.
#[derive(Debug, Clone, Copy)]
pub enum RoomAction<'a> {
    AddMember,
    RemoveMember { target: &'a FederatedIdentity },
    LeaveRoom,
    RenameRoom,
    ChangeTopic,
    DeleteRoom,
}

impl RoomAction<'_> {
    fn required(&self) -> RoomPermissions {
        match self {
            Self::AddMember => RoomPermissions::ADD_MEMBERS,
            Self::RemoveMember { .. } => RoomPermissions::REMOVE_MEMBERS,
            Self::LeaveRoom => RoomPermissions::LEAVE_ROOM,
            Self::RenameRoom => RoomPermissions::RENAME_ROOM,
            Self::ChangeTopic => RoomPermissions::CHANGE_TOPIC,
            Self::DeleteRoom => RoomPermissions::DELETE_ROOM,
        }
    }
}

/// Effective permissions of `actor` in `room`. Only the owner, acting on
/// the room's origin server, administers it; other members may only leave.
pub fn compute_room_permissions(
    actor: &FederatedIdentity,
    room: &FederatedRoom,
    is_member: bool,
) -> RoomPermissions {
    if actor.id == room.owner_id && actor.is_homed_on(&room.origin_server) {
        return RoomPermissions::owner();
    }
    if is_member {
        return RoomPermissions::LEAVE_ROOM;
    }
    RoomPermissions::empty()
}

/// Check if permission set contains required permission, returning error if not
pub fn require_permission(
    perms: RoomPermissions,
    required: RoomPermissions,
) -> Result<(), CoreError> {
    if !perms.contains(required) {
        return Err(CoreError::PermissionDenied);
    }
    Ok(())
}

pub fn authorize(
    actor: &FederatedIdentity,
    room: &FederatedRoom,
    is_member: bool,
    action: RoomAction<'_>,
) -> Result<(), CoreError> {
    let perms = compute_room_permissions(actor, room, is_member);
    require_permission(perms, action.required())?;
    if let RoomAction::RemoveMember { target } = action {
        // The owner cannot be removed; there is no ownership transfer.
        if target.id == room.owner_id {
            return Err(CoreError::PermissionDenied);
        }
    }
    Ok(())
}
