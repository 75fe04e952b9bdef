//! Applying events received from peer servers.
//!
//! Sequenced events come only from the room's origin and are applied in
//! sequence order; proposals (sequence zero) come from member servers and
//! are sequenced here when this server is the origin.

use crate::error::CoreError;
use crate::identity::parse_handle;
use crate::membership::{append_system_message, display_handle, publish_dispatches, Dispatch};
use crate::propagation::{federation_set, record_and_enqueue, record_applied};
use crate::{now_ms, room_from_row, AppState};
use async_trait::async_trait;
use rookery_db::federation as fed_db;
use rookery_db::{members, rooms};
use rookery_federation::ordering::Offer;
use rookery_federation::{DeliveryOutcome, FederationEnvelope, FederationError, InboundEventHandler};
use rookery_models::event::{EventKind, MembershipEvent};
use rookery_models::gateway;
use rookery_models::identity::FederatedIdentity;
use rookery_models::membership::Role;
use rookery_models::room::{room_origin_domain, FederatedRoom, RoomSnapshot};
use rookery_models::system_message;
use serde_json::json;
use sqlx::{Any, AnyConnection, Transaction};
use tokio::sync::OwnedMutexGuard;

/// Verify and apply one inbound envelope. Duplicates are acknowledged with
/// [`DeliveryOutcome::Duplicate`]; an event ahead of a sequence gap fails
/// with [`CoreError::OutOfOrder`] so the sender keeps it queued.
pub async fn receive(
    state: &AppState,
    envelope: FederationEnvelope,
) -> Result<DeliveryOutcome, CoreError> {
    let sender = authenticate(state, &envelope).await?;
    let event = envelope.event;
    let origin = room_origin_domain(&event.room_id)
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| CoreError::BadRequest(format!("malformed room id {}", event.room_id)))?;
    if event.kind.has_target() && event.target.is_none() {
        return Err(CoreError::BadRequest(format!(
            "{} event {} has no target",
            event.kind.as_str(),
            event.event_id
        )));
    }
    if event.sequence < 0 {
        return Err(CoreError::BadRequest(format!(
            "negative sequence in {}",
            event.event_id
        )));
    }

    let event_id = event.event_id.clone();
    let result = if event.is_proposal() {
        accept_proposal(state, &sender, &origin, event).await
    } else {
        accept_sequenced(state, &sender, &origin, event).await
    };
    match result {
        Err(CoreError::DuplicateEvent(_)) => {
            tracing::debug!(event_id = %event_id, peer = %sender, "inbound: duplicate acknowledged");
            Ok(DeliveryOutcome::Duplicate)
        }
        other => other,
    }
}

/// Check the sender is a trusted peer and the envelope carries its
/// signature. Returns the lower-cased sender name.
async fn authenticate(state: &AppState, envelope: &FederationEnvelope) -> Result<String, CoreError> {
    if !state.federation.is_enabled() {
        return Err(FederationError::Disabled.into());
    }
    let sender = envelope.sender.to_ascii_lowercase();
    let peer = fed_db::get_federated_server(&state.db, &sender)
        .await?
        .filter(|peer| peer.trusted)
        .ok_or_else(|| CoreError::UnknownPeer(sender.clone()))?;
    let public_key = peer
        .public_key_hex
        .as_deref()
        .ok_or_else(|| CoreError::UnknownPeer(sender.clone()))?;
    if peer.key_id.as_deref().is_some_and(|key_id| key_id != envelope.key_id) {
        return Err(FederationError::InvalidSignature.into());
    }
    state.federation.verify_envelope(envelope, public_key)?;
    fed_db::touch_federated_server(&state.db, &sender, now_ms()).await?;
    Ok(sender)
}

/// A member server asks the origin to sequence a leave.
async fn accept_proposal(
    state: &AppState,
    sender: &str,
    origin: &str,
    event: MembershipEvent,
) -> Result<DeliveryOutcome, CoreError> {
    let local = state.local_domain();
    if origin != local {
        return Err(CoreError::UnknownRoom(event.room_id));
    }
    if event.kind != EventKind::Leave {
        return Err(CoreError::PermissionDenied);
    }
    if !event.origin_server.eq_ignore_ascii_case(sender) {
        return Err(CoreError::UnknownPeer(sender.to_string()));
    }

    let _guard = state.room_locks.lock(&event.room_id).await;
    let mut tx = state.db.begin().await?;
    if fed_db::has_applied_event(&mut *tx, &event.event_id).await? {
        return Err(CoreError::DuplicateEvent(event.event_id));
    }
    let mut room = match rooms::get_room_by_federated_id(&mut *tx, &event.room_id).await? {
        Some(row) if row.deleted => return Err(CoreError::DuplicateEvent(event.event_id)),
        Some(row) => room_from_row(row)?,
        None => return Err(CoreError::UnknownRoom(event.room_id)),
    };

    let before = members::list_member_domains(&mut *tx, room.id).await?;
    if !before.iter().any(|domain| domain.eq_ignore_ascii_case(sender)) {
        return Err(CoreError::UnknownPeer(sender.to_string()));
    }
    let actor = state.identities.resolve(&mut tx, &event.actor).await?;
    if !actor.is_homed_on(sender) || actor.id == room.owner_id {
        return Err(CoreError::PermissionDenied);
    }
    if !members::remove_member(&mut *tx, room.id, actor.id).await? {
        return Err(CoreError::DuplicateEvent(event.event_id));
    }
    let after = members::list_member_domains(&mut *tx, room.id).await?;

    room.sequence = rooms::next_sequence(&mut *tx, room.id).await?;
    let sequenced = MembershipEvent {
        sequence: room.sequence,
        ..event
    };
    let mut dispatches = Vec::new();
    append_system_message(
        state,
        &mut tx,
        &room,
        &sequenced.event_id,
        &state.identities.display_name(&actor),
        system_message::LEFT_CHANNEL,
        &mut dispatches,
    )
    .await?;
    let destinations = federation_set(&room.origin_server, &before, &after, local);
    record_and_enqueue(state, &mut tx, &sequenced, &destinations, now_ms()).await?;
    tx.commit().await?;

    tracing::info!(
        room_id = %room.room_id,
        actor = %actor.handle(),
        sequence = room.sequence,
        "inbound: sequenced leave proposal"
    );
    dispatches.push(Dispatch {
        event_type: gateway::EVENT_ROOM_MEMBER_REMOVE,
        payload: json!({ "room_id": room.room_id, "identity": actor }),
    });
    publish_dispatches(state, &room.room_id, dispatches);
    state.outbound.notify();
    Ok(DeliveryOutcome::Applied)
}

/// An origin-sequenced event for a room this server hosts a replica of, or
/// is about to.
async fn accept_sequenced(
    state: &AppState,
    sender: &str,
    origin: &str,
    event: MembershipEvent,
) -> Result<DeliveryOutcome, CoreError> {
    if sender != origin {
        return Err(CoreError::UnknownPeer(sender.to_string()));
    }

    let room_id = event.room_id.clone();
    let guard = state.room_locks.lock(&room_id).await;
    let mut tx = state.db.begin().await?;
    let mut dispatches = Vec::new();

    let existing = rooms::get_room_by_federated_id(&mut *tx, &room_id).await?;
    if event.kind == EventKind::Sync {
        let room = resync_replica(state, &mut tx, existing, &event, origin, &mut dispatches).await?;
        let next = state.reorder.take_next(&room_id, room.sequence);
        return apply_in_order(state, guard, tx, room, next, dispatches).await;
    }

    let room = match (existing, event.snapshot.as_ref()) {
        (Some(row), _) if row.deleted => {
            return Err(CoreError::DuplicateEvent(event.event_id.clone()))
        }
        (Some(row), snapshot) => {
            let mut room = room_from_row(row)?;
            if let Some(snapshot) = snapshot.filter(|_| event.sequence > room.sequence + 1) {
                rebase_replica(state, &mut tx, &mut room, snapshot, event.sequence - 1).await?;
            }
            Some(room)
        }
        (None, Some(snapshot)) => {
            Some(create_replica(state, &mut tx, &event, snapshot, origin).await?)
        }
        (None, None) => None,
    };

    let Some(room) = room else {
        if event.kind == EventKind::Delete {
            return Err(CoreError::DuplicateEvent(event.event_id));
        }
        // Nothing to apply against until the snapshot-bearing invite lands.
        if event.sequence == 1 {
            return Err(CoreError::UnknownRoom(room_id));
        }
        let sequence = event.sequence;
        return match state.reorder.offer(&room_id, 0, sequence, event) {
            Offer::Stale | Offer::Ready(_) => Err(CoreError::UnknownRoom(room_id)),
            Offer::Buffered | Offer::Full => Err(CoreError::OutOfOrder {
                room_id,
                cursor: 0,
                sequence,
            }),
        };
    };

    let cursor = room.sequence;
    let sequence = event.sequence;
    let ready = if event.kind == EventKind::Delete && sequence > cursor {
        // A delete supersedes whatever is still missing before it; those
        // deliveries were cancelled at the origin.
        event
    } else {
        match state.reorder.offer(&room_id, cursor, sequence, event) {
            Offer::Ready(event) => event,
            Offer::Stale => return Err(CoreError::DuplicateEvent(format!("{room_id}#{sequence}"))),
            Offer::Buffered => {
                tracing::debug!(room_id = %room_id, cursor, sequence, "inbound: buffered ahead of gap");
                return Err(CoreError::OutOfOrder { room_id, cursor, sequence });
            }
            Offer::Full => {
                tracing::warn!(room_id = %room_id, cursor, sequence, "inbound: reorder buffer full");
                return Err(CoreError::OutOfOrder { room_id, cursor, sequence });
            }
        }
    };
    apply_in_order(state, guard, tx, room, Some(ready), dispatches).await
}

/// Apply `first` and then every buffered event that follows it, commit, and
/// publish the result.
async fn apply_in_order(
    state: &AppState,
    guard: OwnedMutexGuard<()>,
    mut tx: Transaction<'static, Any>,
    mut room: FederatedRoom,
    first: Option<MembershipEvent>,
    mut dispatches: Vec<Dispatch>,
) -> Result<DeliveryOutcome, CoreError> {
    let room_id = room.room_id.clone();
    let mut applied = 0usize;
    let mut deleted = false;
    let mut next = first;
    while let Some(event) = next.take() {
        apply_sequenced(state, &mut tx, &mut room, &event, &mut dispatches).await?;
        applied += 1;
        if event.kind == EventKind::Delete {
            deleted = true;
            break;
        }
        next = state.reorder.take_next(&room_id, room.sequence);
    }
    tx.commit().await?;

    if applied > 1 {
        tracing::info!(room_id = %room_id, applied, cursor = room.sequence, "inbound: drained buffered events");
    }
    publish_dispatches(state, &room_id, dispatches);
    if deleted {
        state.reorder.clear_room(&room_id);
        drop(guard);
        state.room_locks.forget(&room_id);
    }
    Ok(DeliveryOutcome::Applied)
}

/// The origin lost events on their way here and sent its current state
/// instead. An existing replica is rebased onto the snapshot; a missing one
/// is created when the snapshot lists someone homed here.
async fn resync_replica(
    state: &AppState,
    conn: &mut AnyConnection,
    existing: Option<rooms::RoomRow>,
    event: &MembershipEvent,
    origin: &str,
    dispatches: &mut Vec<Dispatch>,
) -> Result<FederatedRoom, CoreError> {
    let snapshot = event
        .snapshot
        .as_ref()
        .ok_or_else(|| CoreError::BadRequest(format!("{} carries no snapshot", event.event_id)))?;
    let room = match existing {
        Some(row) if row.deleted => return Err(CoreError::DuplicateEvent(event.event_id.clone())),
        Some(row) => {
            let mut room = room_from_row(row)?;
            if event.sequence <= room.sequence {
                return Err(CoreError::DuplicateEvent(event.event_id.clone()));
            }
            rebase_replica(state, conn, &mut room, snapshot, event.sequence).await?;
            room
        }
        None => {
            let local = state.local_domain();
            let hosts_member = snapshot.members.iter().any(|member| {
                parse_handle(&member.handle).is_ok_and(|(_, domain)| domain == local)
            });
            if !hosts_member {
                return Err(CoreError::DuplicateEvent(event.event_id.clone()));
            }
            let mut room = create_replica(state, conn, event, snapshot, origin).await?;
            rooms::advance_sequence(&mut *conn, room.id, event.sequence).await?;
            room.sequence = event.sequence;
            room
        }
    };
    record_applied(conn, event, now_ms()).await?;
    dispatches.push(Dispatch {
        event_type: gateway::EVENT_ROOM_UPDATE,
        payload: json!(room),
    });
    Ok(room)
}

/// Apply one in-order event to a replica and move its cursor.
async fn apply_sequenced(
    state: &AppState,
    conn: &mut AnyConnection,
    room: &mut FederatedRoom,
    event: &MembershipEvent,
    dispatches: &mut Vec<Dispatch>,
) -> Result<(), CoreError> {
    if fed_db::has_applied_event(&mut *conn, &event.event_id).await? {
        // Our own proposal, now sequenced by the origin.
        rooms::advance_sequence(&mut *conn, room.id, event.sequence).await?;
        room.sequence = event.sequence;
        return Ok(());
    }

    let actor = resolve_lenient(state, conn, &event.actor).await?;
    let actor_display = actor
        .as_ref()
        .map(|identity| state.identities.display_name(identity))
        .unwrap_or_else(|| display_handle(state, &event.actor));
    let now = now_ms();

    match event.kind {
        EventKind::Invite | EventKind::Remove => {
            let handle = event.target.as_deref().unwrap_or_default();
            let target = resolve_lenient(state, conn, handle).await?;
            let display = target
                .as_ref()
                .map(|identity| state.identities.display_name(identity))
                .unwrap_or_else(|| display_handle(state, handle));
            let text = if event.kind == EventKind::Invite {
                if let Some(target) = &target {
                    let role = i64::from(Role::Member.as_i16());
                    if members::add_member(&mut *conn, room.id, target.id, role, now).await? {
                        dispatches.push(member_dispatch(gateway::EVENT_ROOM_MEMBER_ADD, room, target));
                    }
                }
                system_message::added(&display)
            } else {
                if let Some(target) = &target {
                    if members::remove_member(&mut *conn, room.id, target.id).await? {
                        dispatches.push(member_dispatch(gateway::EVENT_ROOM_MEMBER_REMOVE, room, target));
                    }
                }
                system_message::removed(&display)
            };
            append_system_message(state, conn, room, &event.event_id, &actor_display, &text, dispatches)
                .await?;
        }
        EventKind::Leave => {
            if let Some(actor) = &actor {
                if members::remove_member(&mut *conn, room.id, actor.id).await? {
                    dispatches.push(member_dispatch(gateway::EVENT_ROOM_MEMBER_REMOVE, room, actor));
                }
            }
            append_system_message(
                state,
                conn,
                room,
                &event.event_id,
                &actor_display,
                system_message::LEFT_CHANNEL,
                dispatches,
            )
            .await?;
        }
        EventKind::Rename => {
            let name = event
                .name
                .as_deref()
                .ok_or_else(|| CoreError::BadRequest(format!("{} carries no name", event.event_id)))?;
            rooms::update_name(&mut *conn, room.id, name).await?;
            room.name = name.to_string();
            append_system_message(
                state,
                conn,
                room,
                &event.event_id,
                &actor_display,
                &system_message::renamed(name),
                dispatches,
            )
            .await?;
            dispatches.push(Dispatch {
                event_type: gateway::EVENT_ROOM_UPDATE,
                payload: json!(room),
            });
        }
        EventKind::TopicChange => {
            let topic = event.topic.as_deref().unwrap_or_default();
            let stored = (!topic.is_empty()).then_some(topic);
            rooms::update_topic(&mut *conn, room.id, stored).await?;
            room.topic = stored.map(str::to_string);
            append_system_message(
                state,
                conn,
                room,
                &event.event_id,
                &actor_display,
                &system_message::topic_changed(topic),
                dispatches,
            )
            .await?;
            dispatches.push(Dispatch {
                event_type: gateway::EVENT_ROOM_UPDATE,
                payload: json!(room),
            });
        }
        // Resyncs are handled before ordering and never buffered.
        EventKind::Sync => {}
        EventKind::Delete => {
            rooms::mark_deleted(&mut *conn, room.id).await?;
            members::delete_room_members(&mut *conn, room.id).await?;
            dispatches.push(Dispatch {
                event_type: gateway::EVENT_ROOM_DELETE,
                payload: json!({ "room_id": room.room_id }),
            });
        }
    }

    rooms::advance_sequence(&mut *conn, room.id, event.sequence).await?;
    room.sequence = event.sequence;
    record_applied(conn, event, now).await?;
    tracing::debug!(
        room_id = %room.room_id,
        event_id = %event.event_id,
        kind = event.kind.as_str(),
        sequence = event.sequence,
        "inbound: applied"
    );
    Ok(())
}

fn member_dispatch(event_type: &'static str, room: &FederatedRoom, identity: &FederatedIdentity) -> Dispatch {
    Dispatch {
        event_type,
        payload: json!({ "room_id": room.room_id, "identity": identity }),
    }
}

/// Resolve a handle named by a peer. A local user that does not exist here
/// is skipped with a warning rather than failing the whole event.
async fn resolve_lenient(
    state: &AppState,
    conn: &mut AnyConnection,
    handle: &str,
) -> Result<Option<FederatedIdentity>, CoreError> {
    match state.identities.resolve(conn, handle).await {
        Ok(identity) => Ok(Some(identity)),
        Err(CoreError::UnknownIdentity(_)) => {
            tracing::warn!(handle, "inbound: event names a local user that does not exist");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// First event for a room this server has not seen: build the replica from
/// the snapshot, positioned just before the event.
async fn create_replica(
    state: &AppState,
    conn: &mut AnyConnection,
    event: &MembershipEvent,
    snapshot: &RoomSnapshot,
    origin: &str,
) -> Result<FederatedRoom, CoreError> {
    let owner = state.identities.resolve(conn, &snapshot.owner).await?;
    let id = state.next_id();
    let row = rooms::create_room(
        &mut *conn,
        rooms::NewRoom {
            id,
            room_id: &event.room_id,
            name: &snapshot.name,
            topic: snapshot.topic.as_deref(),
            kind: i64::from(snapshot.kind.as_i16()),
            origin_server: origin,
            is_federated: true,
            owner_id: owner.id,
            sequence: event.sequence - 1,
            created_at_ms: now_ms(),
        },
    )
    .await?;
    let room = room_from_row(row)?;
    sync_members(state, conn, &room, snapshot).await?;
    tracing::info!(
        room_id = %room.room_id,
        origin,
        members = snapshot.members.len(),
        "inbound: created replica"
    );
    Ok(room)
}

/// A replica that fell behind while this server had no members in the room.
/// Replace its state with the snapshot and move the cursor to `cursor`.
async fn rebase_replica(
    state: &AppState,
    conn: &mut AnyConnection,
    room: &mut FederatedRoom,
    snapshot: &RoomSnapshot,
    cursor: i64,
) -> Result<(), CoreError> {
    if snapshot.kind != room.kind {
        tracing::warn!(room_id = %room.room_id, "inbound: snapshot kind differs from replica");
    }
    rooms::update_name(&mut *conn, room.id, &snapshot.name).await?;
    rooms::update_topic(&mut *conn, room.id, snapshot.topic.as_deref()).await?;
    rooms::advance_sequence(&mut *conn, room.id, cursor).await?;
    room.name = snapshot.name.clone();
    room.topic = snapshot.topic.clone();
    let from = room.sequence;
    room.sequence = cursor;

    let keep = sync_members(state, conn, room, snapshot).await?;
    for member in members::list_members(&mut *conn, room.id).await? {
        if !keep.contains(&member.identity_id) {
            members::remove_member(&mut *conn, room.id, member.identity_id).await?;
        }
    }
    tracing::info!(room_id = %room.room_id, from, to = cursor, "inbound: rebased stale replica");
    Ok(())
}

/// Add every snapshot member to the replica. Returns the identity ids that
/// belong in the room.
async fn sync_members(
    state: &AppState,
    conn: &mut AnyConnection,
    room: &FederatedRoom,
    snapshot: &RoomSnapshot,
) -> Result<Vec<i64>, CoreError> {
    let now = now_ms();
    let mut keep = Vec::with_capacity(snapshot.members.len());
    for member in &snapshot.members {
        let Some(identity) = resolve_lenient(state, conn, &member.handle).await? else {
            continue;
        };
        members::add_member(&mut *conn, room.id, identity.id, i64::from(member.role.as_i16()), now)
            .await?;
        keep.push(identity.id);
    }
    Ok(keep)
}

#[async_trait]
impl InboundEventHandler for AppState {
    async fn on_event(&self, envelope: FederationEnvelope) -> Result<DeliveryOutcome, FederationError> {
        match receive(self, envelope).await {
            Ok(outcome) => Ok(outcome),
            Err(CoreError::OutOfOrder { .. }) => Ok(DeliveryOutcome::Deferred),
            Err(err) if err.is_permanent_rejection() => Err(FederationError::Rejected(err.to_string())),
            Err(err) => Err(FederationError::RemoteError(err.to_string())),
        }
    }
}
