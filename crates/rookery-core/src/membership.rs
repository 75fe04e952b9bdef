//! Authoritative room state: creation, membership changes and room
//! settings, each applied under the room lock and handed to propagation.

use crate::capabilities::capabilities_for;
use crate::error::CoreError;
use crate::identity::identity_from_row;
use crate::permissions::{self, authorize, compute_room_permissions, RoomAction};
use crate::propagation::{federation_set, record_and_enqueue};
use crate::{now_ms, room_from_row, AppState};
use rookery_db::{members, messages, rooms};
use rookery_models::capabilities::RoomCapabilities;
use rookery_models::event::{local_event_id, EventKind, MembershipEvent};
use rookery_models::gateway;
use rookery_models::identity::FederatedIdentity;
use rookery_models::membership::{Member, Role};
use rookery_models::permissions::RoomPermissions;
use rookery_models::room::{
    federated_room_id, FederatedRoom, RoomKind, RoomSnapshot, SnapshotMember,
};
use rookery_models::system_message::{self, SystemMessage};
use rookery_util::validation::{validate_room_name, validate_topic};
use serde::Serialize;
use serde_json::json;
use sqlx::AnyConnection;

/// Outcome of an invite. Identities that were already members are listed
/// separately and produce no event.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedInvite {
    pub added: Vec<Member>,
    pub already_members: Vec<String>,
    pub event_ids: Vec<String>,
}

/// Outcome of a single-event operation. `event_id` is `None` when the
/// operation changed nothing.
#[derive(Debug, Clone, Serialize)]
pub struct Applied {
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomView {
    #[serde(flatten)]
    pub room: FederatedRoom,
    pub owner: String,
    pub capabilities: RoomCapabilities,
}

/// A local bus notification, published once the transaction has committed.
pub(crate) struct Dispatch {
    pub event_type: &'static str,
    pub payload: serde_json::Value,
}

pub(crate) fn publish_dispatches(state: &AppState, room_id: &str, dispatches: Vec<Dispatch>) {
    for dispatch in dispatches {
        state
            .event_bus
            .dispatch(dispatch.event_type, dispatch.payload, Some(room_id));
    }
}

/// Load a live room by federated id.
pub(crate) async fn load_room(
    conn: &mut AnyConnection,
    room_id: &str,
) -> Result<FederatedRoom, CoreError> {
    match rooms::get_room_by_federated_id(&mut *conn, room_id).await? {
        Some(row) if !row.deleted => room_from_row(row),
        _ => Err(CoreError::UnknownRoom(room_id.to_string())),
    }
}

pub(crate) async fn is_member(
    conn: &mut AnyConnection,
    room: &FederatedRoom,
    identity_id: i64,
) -> Result<bool, CoreError> {
    Ok(members::get_member(&mut *conn, room.id, identity_id)
        .await?
        .is_some())
}

pub(crate) fn member_from_row(state: &AppState, row: members::MemberRow) -> Member {
    let identity = FederatedIdentity {
        id: row.identity_id,
        username: row.username,
        domain: row.domain,
    };
    Member {
        display: state.identities.display_name(&identity),
        role: i16::try_from(row.role)
            .ok()
            .and_then(Role::from_i16)
            .unwrap_or(Role::Member),
        joined_at_ms: row.joined_at_ms,
        identity,
    }
}

/// Render a handle with the display rule, whether or not it maps to a
/// stored identity.
pub(crate) fn display_handle(state: &AppState, handle: &str) -> String {
    match crate::identity::parse_handle(handle) {
        Ok((username, domain)) if domain == state.local_domain() => username,
        Ok((username, domain)) => format!("{username}:{domain}"),
        Err(_) => handle.to_string(),
    }
}

pub(crate) async fn append_system_message(
    state: &AppState,
    conn: &mut AnyConnection,
    room: &FederatedRoom,
    event_id: &str,
    author: &str,
    text: &str,
    dispatches: &mut Vec<Dispatch>,
) -> Result<(), CoreError> {
    let message = SystemMessage {
        id: state.next_id(),
        room_id: room.id,
        event_id: event_id.to_string(),
        author: author.to_string(),
        text: text.to_string(),
        created_at_ms: now_ms(),
    };
    let inserted = messages::insert_system_message(
        &mut *conn,
        message.id,
        message.room_id,
        &message.event_id,
        &message.author,
        &message.text,
        message.created_at_ms,
    )
    .await?;
    if inserted {
        dispatches.push(Dispatch {
            event_type: gateway::EVENT_SYSTEM_MESSAGE_CREATE,
            payload: json!(message),
        });
    }
    Ok(())
}

pub(crate) async fn build_snapshot(
    conn: &mut AnyConnection,
    room: &FederatedRoom,
) -> Result<RoomSnapshot, CoreError> {
    let owner = rookery_db::identities::get_identity(&mut *conn, room.owner_id)
        .await?
        .map(identity_from_row)
        .ok_or_else(|| CoreError::Internal(format!("owner of {} is missing", room.room_id)))?;
    let members = members::list_members(&mut *conn, room.id)
        .await?
        .into_iter()
        .map(|row| SnapshotMember {
            handle: format!("{}:{}", row.username, row.domain),
            role: i16::try_from(row.role)
                .ok()
                .and_then(Role::from_i16)
                .unwrap_or(Role::Member),
        })
        .collect();
    Ok(RoomSnapshot {
        name: room.name.clone(),
        topic: room.topic.clone(),
        kind: room.kind,
        owner: owner.handle(),
        members,
    })
}

fn new_event(
    state: &AppState,
    room: &FederatedRoom,
    kind: EventKind,
    actor: &FederatedIdentity,
    target: Option<&FederatedIdentity>,
    sequence: i64,
) -> MembershipEvent {
    MembershipEvent {
        event_id: local_event_id(kind, state.next_id(), state.local_domain()),
        room_id: room.room_id.clone(),
        kind,
        actor: actor.handle(),
        target: target.map(FederatedIdentity::handle),
        origin_server: state.local_domain().to_string(),
        sequence,
        origin_ts: now_ms(),
        name: None,
        topic: None,
        snapshot: None,
    }
}

/// Read the room and actor and check the actor holds `required`, before
/// any lock is taken or anything is written.
async fn gate(
    state: &AppState,
    room_id: &str,
    actor_id: i64,
    required: RoomPermissions,
) -> Result<(FederatedRoom, FederatedIdentity), CoreError> {
    let mut conn = state.db.acquire().await?;
    let room = load_room(&mut conn, room_id).await?;
    let actor = state.identities.get(&mut conn, actor_id).await?;
    let member = is_member(&mut conn, &room, actor.id).await?;
    permissions::require_permission(compute_room_permissions(&actor, &room, member), required)?;
    Ok((room, actor))
}

/// Reload the room once its lock is held and repeat the permission check
/// against the stored state, which may have moved since [`gate`].
async fn reload_authorized(
    conn: &mut AnyConnection,
    room_id: &str,
    actor: &FederatedIdentity,
    action: RoomAction<'_>,
) -> Result<FederatedRoom, CoreError> {
    let room = load_room(conn, room_id).await?;
    let member = is_member(conn, &room, actor.id).await?;
    authorize(actor, &room, member, action)?;
    Ok(room)
}

/// Create a room owned by `creator`, then invite `invitees` into it.
pub async fn create_room(
    state: &AppState,
    creator_id: i64,
    name: &str,
    kind: RoomKind,
    federated: bool,
    invitees: &[String],
) -> Result<(RoomView, Option<AppliedInvite>), CoreError> {
    let name = name.trim();
    validate_room_name(name).map_err(|e| CoreError::BadRequest(format!("invalid room name: {e}")))?;

    let creator = {
        let mut conn = state.db.acquire().await?;
        let creator = state.identities.get(&mut conn, creator_id).await?;
        if !creator.is_homed_on(state.local_domain()) {
            return Err(CoreError::PermissionDenied);
        }
        // Resolve invitees up front so a bad handle creates nothing.
        for handle in invitees {
            state.identities.resolve_any(&mut conn, handle, None).await?;
        }
        creator
    };
    if federated && !state.federation.is_enabled() {
        return Err(CoreError::BadRequest("federation is disabled".to_string()));
    }

    let id = state.next_id();
    let room_id = federated_room_id(id, state.local_domain());
    let now = now_ms();
    let mut tx = state.db.begin().await?;
    let row = rooms::create_room(
        &mut *tx,
        rooms::NewRoom {
            id,
            room_id: &room_id,
            name,
            topic: None,
            kind: i64::from(kind.as_i16()),
            origin_server: state.local_domain(),
            is_federated: federated,
            owner_id: creator.id,
            sequence: 0,
            created_at_ms: now,
        },
    )
    .await?;
    members::add_member(&mut *tx, id, creator.id, i64::from(Role::Owner.as_i16()), now).await?;
    tx.commit().await?;

    let room = room_from_row(row)?;
    tracing::info!(room_id = %room.room_id, owner = %creator.handle(), federated, "room created");
    let view = RoomView {
        owner: state.identities.display_name(&creator),
        capabilities: capabilities_for(&room, state.config.capability_defaults),
        room,
    };
    state
        .event_bus
        .dispatch(gateway::EVENT_ROOM_CREATE, json!(view), Some(&view.room.room_id));

    if invitees.is_empty() {
        return Ok((view, None));
    }
    let applied = invite(state, &view.room.room_id, creator.id, invitees).await?;
    let view = room_view(state, &view.room.room_id, creator.id).await?;
    Ok((view, Some(applied)))
}

/// Add identities to a room. Already-present members are reported and
/// skipped; each new member produces one invite event.
pub async fn invite(
    state: &AppState,
    room_id: &str,
    actor_id: i64,
    handles: &[String],
) -> Result<AppliedInvite, CoreError> {
    let (room, actor) = gate(state, room_id, actor_id, RoomPermissions::ADD_MEMBERS).await?;
    if handles.is_empty() {
        return Err(CoreError::BadRequest("no handles to invite".to_string()));
    }

    let mut targets: Vec<FederatedIdentity> = Vec::with_capacity(handles.len());
    {
        let mut conn = state.db.acquire().await?;
        for handle in handles {
            let target = state
                .identities
                .resolve_any(&mut conn, handle, Some(room.id))
                .await?;
            if !targets.iter().any(|t| t.id == target.id) {
                targets.push(target);
            }
        }
    }
    let remote = targets
        .iter()
        .any(|t| !t.is_homed_on(state.local_domain()));
    if remote && !state.federation.is_enabled() {
        return Err(CoreError::BadRequest("federation is disabled".to_string()));
    }

    let _guard = state.room_locks.lock(&room.room_id).await;
    let mut tx = state.db.begin().await?;
    let mut room = reload_authorized(&mut tx, room_id, &actor, RoomAction::AddMember).await?;
    let mut domains = members::list_member_domains(&mut *tx, room.id).await?;
    let actor_display = state.identities.display_name(&actor);
    let now = now_ms();

    let mut applied = AppliedInvite {
        added: Vec::new(),
        already_members: Vec::new(),
        event_ids: Vec::new(),
    };
    let mut dispatches = Vec::new();

    for target in &targets {
        let display = state.identities.display_name(target);
        let role = i64::from(Role::Member.as_i16());
        if !members::add_member(&mut *tx, room.id, target.id, role, now).await? {
            applied.already_members.push(display);
            continue;
        }

        let before = domains.clone();
        let new_server = !before.iter().any(|d| target.is_homed_on(d));
        if new_server {
            domains.push(target.domain.clone());
        }
        if !target.is_homed_on(state.local_domain()) && !room.is_federated {
            rooms::set_federated(&mut *tx, room.id).await?;
            room.is_federated = true;
            tracing::info!(room_id = %room.room_id, "room became federated");
        }

        room.sequence = rooms::next_sequence(&mut *tx, room.id).await?;
        let mut event = new_event(state, &room, EventKind::Invite, &actor, Some(target), room.sequence);
        if new_server && !target.is_homed_on(state.local_domain()) {
            event.snapshot = Some(build_snapshot(&mut tx, &room).await?);
        }

        append_system_message(
            state,
            &mut tx,
            &room,
            &event.event_id,
            &actor_display,
            &system_message::added(&display),
            &mut dispatches,
        )
        .await?;
        let destinations = federation_set(&room.origin_server, &before, &domains, state.local_domain());
        record_and_enqueue(state, &mut tx, &event, &destinations, now).await?;

        let member = Member {
            identity: target.clone(),
            role: Role::Member,
            joined_at_ms: now,
            display,
        };
        dispatches.push(Dispatch {
            event_type: gateway::EVENT_ROOM_MEMBER_ADD,
            payload: json!({ "room_id": room.room_id, "member": member }),
        });
        applied.event_ids.push(event.event_id);
        applied.added.push(member);
    }
    tx.commit().await?;

    tracing::info!(
        room_id = %room.room_id,
        added = applied.added.len(),
        already = applied.already_members.len(),
        "members invited"
    );
    publish_dispatches(state, &room.room_id, dispatches);
    state.outbound.notify();
    Ok(applied)
}

/// Remove `target_handle` from the room. Owner only; the owner itself
/// cannot be removed.
pub async fn remove(
    state: &AppState,
    room_id: &str,
    actor_id: i64,
    target_handle: &str,
) -> Result<Applied, CoreError> {
    let (room, actor) = gate(state, room_id, actor_id, RoomPermissions::REMOVE_MEMBERS).await?;
    let target = {
        let mut conn = state.db.acquire().await?;
        state
            .identities
            .resolve_any(&mut conn, target_handle, Some(room.id))
            .await?
    };

    let _guard = state.room_locks.lock(&room.room_id).await;
    let mut tx = state.db.begin().await?;
    let mut room =
        reload_authorized(&mut tx, room_id, &actor, RoomAction::RemoveMember { target: &target }).await?;
    let before = members::list_member_domains(&mut *tx, room.id).await?;
    if !members::remove_member(&mut *tx, room.id, target.id).await? {
        return Ok(Applied { event_id: None });
    }
    let after = members::list_member_domains(&mut *tx, room.id).await?;

    room.sequence = rooms::next_sequence(&mut *tx, room.id).await?;
    let event = new_event(state, &room, EventKind::Remove, &actor, Some(&target), room.sequence);
    let mut dispatches = Vec::new();
    let target_display = state.identities.display_name(&target);
    append_system_message(
        state,
        &mut tx,
        &room,
        &event.event_id,
        &state.identities.display_name(&actor),
        &system_message::removed(&target_display),
        &mut dispatches,
    )
    .await?;
    let destinations = federation_set(&room.origin_server, &before, &after, state.local_domain());
    record_and_enqueue(state, &mut tx, &event, &destinations, now_ms()).await?;
    tx.commit().await?;

    tracing::info!(room_id = %room.room_id, target = %target.handle(), "member removed");
    dispatches.push(Dispatch {
        event_type: gateway::EVENT_ROOM_MEMBER_REMOVE,
        payload: json!({ "room_id": room.room_id, "identity": target }),
    });
    publish_dispatches(state, &room.room_id, dispatches);
    state.outbound.notify();
    Ok(Applied {
        event_id: Some(event.event_id),
    })
}

/// The actor leaves the room. On the origin server the leave is sequenced
/// and fanned out; elsewhere it is applied locally and proposed to the
/// origin, which sequences it for everyone.
pub async fn leave(state: &AppState, room_id: &str, actor_id: i64) -> Result<Applied, CoreError> {
    let (room, actor) = gate(state, room_id, actor_id, RoomPermissions::LEAVE_ROOM).await?;

    let _guard = state.room_locks.lock(&room.room_id).await;
    let mut tx = state.db.begin().await?;
    let mut room = load_room(&mut tx, room_id).await?;
    let before = members::list_member_domains(&mut *tx, room.id).await?;
    if !members::remove_member(&mut *tx, room.id, actor.id).await? {
        return Ok(Applied { event_id: None });
    }
    let after = members::list_member_domains(&mut *tx, room.id).await?;

    let local = state.local_domain();
    let (event, destinations) = if room.is_origin(local) {
        room.sequence = rooms::next_sequence(&mut *tx, room.id).await?;
        let event = new_event(state, &room, EventKind::Leave, &actor, None, room.sequence);
        (event, federation_set(&room.origin_server, &before, &after, local))
    } else {
        let event = new_event(state, &room, EventKind::Leave, &actor, None, 0);
        (event, vec![room.origin_server.to_ascii_lowercase()])
    };

    let mut dispatches = Vec::new();
    append_system_message(
        state,
        &mut tx,
        &room,
        &event.event_id,
        &state.identities.display_name(&actor),
        system_message::LEFT_CHANNEL,
        &mut dispatches,
    )
    .await?;
    record_and_enqueue(state, &mut tx, &event, &destinations, now_ms()).await?;
    tx.commit().await?;

    tracing::info!(
        room_id = %room.room_id,
        actor = %actor.handle(),
        proposal = event.is_proposal(),
        "member left"
    );
    dispatches.push(Dispatch {
        event_type: gateway::EVENT_ROOM_MEMBER_REMOVE,
        payload: json!({ "room_id": room.room_id, "identity": actor }),
    });
    publish_dispatches(state, &room.room_id, dispatches);
    state.outbound.notify();
    Ok(Applied {
        event_id: Some(event.event_id),
    })
}

pub async fn rename(
    state: &AppState,
    room_id: &str,
    actor_id: i64,
    name: &str,
) -> Result<Applied, CoreError> {
    let name = name.trim();
    validate_room_name(name).map_err(|e| CoreError::BadRequest(format!("invalid room name: {e}")))?;
    let (room, actor) = gate(state, room_id, actor_id, RoomPermissions::RENAME_ROOM).await?;

    let _guard = state.room_locks.lock(&room.room_id).await;
    let mut tx = state.db.begin().await?;
    let mut room = reload_authorized(&mut tx, room_id, &actor, RoomAction::RenameRoom).await?;
    if room.name == name {
        return Ok(Applied { event_id: None });
    }
    rooms::update_name(&mut *tx, room.id, name).await?;
    room.name = name.to_string();
    room.sequence = rooms::next_sequence(&mut *tx, room.id).await?;
    let mut event = new_event(state, &room, EventKind::Rename, &actor, None, room.sequence);
    event.name = Some(room.name.clone());

    let event_id = settings_event(state, tx, &room, &actor, event, &system_message::renamed(name)).await?;
    Ok(Applied {
        event_id: Some(event_id),
    })
}

pub async fn change_topic(
    state: &AppState,
    room_id: &str,
    actor_id: i64,
    topic: &str,
) -> Result<Applied, CoreError> {
    let topic = topic.trim();
    validate_topic(topic).map_err(|e| CoreError::BadRequest(format!("invalid topic: {e}")))?;
    let (room, actor) = gate(state, room_id, actor_id, RoomPermissions::CHANGE_TOPIC).await?;

    let _guard = state.room_locks.lock(&room.room_id).await;
    let mut tx = state.db.begin().await?;
    let mut room = reload_authorized(&mut tx, room_id, &actor, RoomAction::ChangeTopic).await?;
    let new_topic = (!topic.is_empty()).then(|| topic.to_string());
    if room.topic == new_topic {
        return Ok(Applied { event_id: None });
    }
    rooms::update_topic(&mut *tx, room.id, new_topic.as_deref()).await?;
    room.topic = new_topic;
    room.sequence = rooms::next_sequence(&mut *tx, room.id).await?;
    let mut event = new_event(state, &room, EventKind::TopicChange, &actor, None, room.sequence);
    event.topic = Some(topic.to_string());

    let event_id =
        settings_event(state, tx, &room, &actor, event, &system_message::topic_changed(topic)).await?;
    Ok(Applied {
        event_id: Some(event_id),
    })
}

/// Shared tail of rename and topic change: system message, propagation to
/// every member server, commit and notify.
async fn settings_event(
    state: &AppState,
    mut tx: sqlx::Transaction<'_, sqlx::Any>,
    room: &FederatedRoom,
    actor: &FederatedIdentity,
    event: MembershipEvent,
    text: &str,
) -> Result<String, CoreError> {
    let mut dispatches = Vec::new();
    append_system_message(
        state,
        &mut tx,
        room,
        &event.event_id,
        &state.identities.display_name(actor),
        text,
        &mut dispatches,
    )
    .await?;
    let domains = members::list_member_domains(&mut *tx, room.id).await?;
    let destinations = federation_set(&room.origin_server, &domains, &domains, state.local_domain());
    record_and_enqueue(state, &mut tx, &event, &destinations, now_ms()).await?;
    tx.commit().await?;

    tracing::info!(room_id = %room.room_id, kind = event.kind.as_str(), "room updated");
    dispatches.push(Dispatch {
        event_type: gateway::EVENT_ROOM_UPDATE,
        payload: json!(room),
    });
    publish_dispatches(state, &room.room_id, dispatches);
    state.outbound.notify();
    Ok(event.event_id)
}

/// Delete the room everywhere. Older deliveries still queued for it are
/// cancelled; only the delete event itself goes out.
pub async fn delete(state: &AppState, room_id: &str, actor_id: i64) -> Result<Applied, CoreError> {
    let (room, actor) = gate(state, room_id, actor_id, RoomPermissions::DELETE_ROOM).await?;

    let guard = state.room_locks.lock(&room.room_id).await;
    let mut tx = state.db.begin().await?;
    let mut room = reload_authorized(&mut tx, room_id, &actor, RoomAction::DeleteRoom).await?;
    let domains = members::list_member_domains(&mut *tx, room.id).await?;
    room.sequence = rooms::next_sequence(&mut *tx, room.id).await?;
    let event = new_event(state, &room, EventKind::Delete, &actor, None, room.sequence);
    rooms::mark_deleted(&mut *tx, room.id).await?;
    members::delete_room_members(&mut *tx, room.id).await?;
    let destinations = federation_set(&room.origin_server, &domains, &domains, state.local_domain());
    record_and_enqueue(state, &mut tx, &event, &destinations, now_ms()).await?;
    tx.commit().await?;

    state.outbound.cancel_room(&room.room_id, &event.event_id).await?;
    state.reorder.clear_room(&room.room_id);
    drop(guard);
    state.room_locks.forget(&room.room_id);

    tracing::info!(room_id = %room.room_id, "room deleted");
    state.event_bus.dispatch(
        gateway::EVENT_ROOM_DELETE,
        json!({ "room_id": room.room_id }),
        Some(&room.room_id),
    );
    state.outbound.notify();
    Ok(Applied {
        event_id: Some(event.event_id),
    })
}

/// Viewing rights: anyone on this server for public rooms, members only for
/// private ones.
async fn ensure_can_view(
    conn: &mut AnyConnection,
    room: &FederatedRoom,
    viewer_id: i64,
) -> Result<(), CoreError> {
    if room.kind == RoomKind::Private && !is_member(conn, room, viewer_id).await? {
        return Err(CoreError::PermissionDenied);
    }
    Ok(())
}

pub async fn room_view(state: &AppState, room_id: &str, viewer_id: i64) -> Result<RoomView, CoreError> {
    let mut conn = state.db.acquire().await?;
    let room = load_room(&mut conn, room_id).await?;
    ensure_can_view(&mut conn, &room, viewer_id).await?;
    let owner = state.identities.get(&mut conn, room.owner_id).await?;
    Ok(RoomView {
        owner: state.identities.display_name(&owner),
        capabilities: capabilities_for(&room, state.config.capability_defaults),
        room,
    })
}

/// Rooms the identity belongs to.
pub async fn rooms_for(state: &AppState, identity_id: i64) -> Result<Vec<FederatedRoom>, CoreError> {
    rooms::list_rooms_for_identity(&state.db, identity_id)
        .await?
        .into_iter()
        .map(room_from_row)
        .collect()
}

pub async fn members(state: &AppState, room_id: &str, viewer_id: i64) -> Result<Vec<Member>, CoreError> {
    let mut conn = state.db.acquire().await?;
    let room = load_room(&mut conn, room_id).await?;
    ensure_can_view(&mut conn, &room, viewer_id).await?;
    Ok(members::list_members(&mut *conn, room.id)
        .await?
        .into_iter()
        .map(|row| member_from_row(state, row))
        .collect())
}

/// System messages of the room, oldest first.
pub async fn timeline(
    state: &AppState,
    room_id: &str,
    viewer_id: i64,
) -> Result<Vec<SystemMessage>, CoreError> {
    let mut conn = state.db.acquire().await?;
    let room = load_room(&mut conn, room_id).await?;
    ensure_can_view(&mut conn, &room, viewer_id).await?;
    Ok(messages::list_system_messages(&mut *conn, room.id)
        .await?
        .into_iter()
        .map(|row| SystemMessage {
            id: row.id,
            room_id: row.room_id,
            event_id: row.event_id,
            author: row.author,
            text: row.text,
            created_at_ms: row.created_at_ms,
        })
        .collect())
}

/// Provision a local identity.
pub async fn register_local(state: &AppState, username: &str) -> Result<FederatedIdentity, CoreError> {
    let mut conn = state.db.acquire().await?;
    state.identities.register_local(&mut conn, username).await
}
