//! Turning applied room changes into queued federation deliveries, plus the
//! maintenance around the queue and the dedupe set.

use crate::error::CoreError;
use crate::membership::build_snapshot;
use crate::{room_from_row, AppState};
use rookery_db::federation as fed_db;
use rookery_db::rooms;
use rookery_models::event::{local_event_id, EventKind, MembershipEvent};
use sqlx::AnyConnection;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Servers that must hear about a change: the room's origin plus every
/// server with a member before or after it, minus this server.
pub fn federation_set(origin: &str, before: &[String], after: &[String], local: &str) -> Vec<String> {
    let mut set: Vec<String> = Vec::new();
    for domain in std::iter::once(origin)
        .chain(before.iter().map(String::as_str))
        .chain(after.iter().map(String::as_str))
    {
        let domain = domain.to_ascii_lowercase();
        if domain != local && !set.contains(&domain) {
            set.push(domain);
        }
    }
    set
}

/// Remember `event` as applied here and queue it for `destinations`. Runs on
/// the caller's transaction so state, dedupe entry and queue rows commit
/// together.
pub(crate) async fn record_and_enqueue(
    state: &AppState,
    conn: &mut AnyConnection,
    event: &MembershipEvent,
    destinations: &[String],
    now: i64,
) -> Result<(), CoreError> {
    record_applied(conn, event, now).await?;
    if destinations.is_empty() {
        return Ok(());
    }
    let envelope = state.federation.seal(event.clone())?;
    let queued = state
        .outbound
        .enqueue(conn, &envelope, destinations, now)
        .await?;
    tracing::debug!(
        event_id = %event.event_id,
        kind = event.kind.as_str(),
        sequence = event.sequence,
        peers = queued,
        "propagation: event queued"
    );
    Ok(())
}

pub(crate) async fn record_applied(
    conn: &mut AnyConnection,
    event: &MembershipEvent,
    now: i64,
) -> Result<bool, CoreError> {
    let payload = serde_json::to_string(event)
        .map_err(|e| CoreError::Internal(format!("event encode failed: {e}")))?;
    let inserted = fed_db::insert_applied_event(
        &mut *conn,
        &event.event_id,
        &event.room_id,
        event.kind.as_str(),
        event.sequence,
        &event.origin_server,
        &payload,
        now,
    )
    .await?;
    Ok(inserted)
}

/// Wait until no peer has `event_id` queued any more. Fails with
/// `PropagationTimeout` when rows are still pending after `timeout`; the
/// rows themselves stay queued and keep being retried.
pub async fn await_delivery(
    state: &AppState,
    event_id: &str,
    timeout: Duration,
) -> Result<(), CoreError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let pending = fed_db::count_outbound_for_event(&state.db, event_id).await?;
        if pending == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CoreError::PropagationTimeout(event_id.to_string()));
        }
        state.outbound.notify();
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Events that exhausted their retries or were refused by a peer.
pub async fn dead_letter_report(state: &AppState) -> Result<Vec<fed_db::DeadLetterRow>, CoreError> {
    Ok(fed_db::list_dead_letters(&state.db).await?)
}

/// Answer open resync requests. Each peer gets one `m.room.sync` event
/// carrying the room's snapshot at its current sequence, which lets the
/// peer rebuild or rebase its replica past whatever it lost. Returns how
/// many were queued.
pub async fn resync_peers(state: &AppState, now: i64) -> Result<usize, CoreError> {
    let requests =
        fed_db::list_resync_requests(&state.db, state.outbound.settings().batch_size).await?;
    let mut queued = 0usize;
    for request in requests {
        match resync_peer(state, &request.destination_server, &request.room_id, now).await {
            Ok(true) => queued += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(
                peer = %request.destination_server,
                room_id = %request.room_id,
                "propagation: resync failed: {e}"
            ),
        }
    }
    if queued > 0 {
        state.outbound.notify();
    }
    Ok(queued)
}

async fn resync_peer(state: &AppState, peer: &str, room_id: &str, now: i64) -> Result<bool, CoreError> {
    let local = state.local_domain();
    let guard = state.room_locks.lock(room_id).await;
    let mut tx = state.db.begin().await?;
    fed_db::delete_resync_request(&mut *tx, peer, room_id).await?;
    let room = match rooms::get_room_by_federated_id(&mut *tx, room_id).await? {
        Some(row) if !row.deleted => Some(room_from_row(row)?),
        _ => None,
    };
    // Deleted rooms reach peers through the delete event; replicas and
    // rooms without events have nothing to offer.
    let Some(room) = room.filter(|room| room.is_origin(local) && room.sequence > 0) else {
        tx.commit().await?;
        drop(guard);
        state.room_locks.forget(room_id);
        return Ok(false);
    };

    let snapshot = build_snapshot(&mut tx, &room).await?;
    let event = MembershipEvent {
        event_id: local_event_id(EventKind::Sync, state.next_id(), local),
        room_id: room.room_id.clone(),
        kind: EventKind::Sync,
        actor: snapshot.owner.clone(),
        target: None,
        origin_server: local.to_string(),
        sequence: room.sequence,
        origin_ts: now,
        name: None,
        topic: None,
        snapshot: Some(snapshot),
    };
    record_and_enqueue(state, &mut tx, &event, &[peer.to_ascii_lowercase()], now).await?;
    tx.commit().await?;
    tracing::info!(
        peer,
        room_id = %room.room_id,
        sequence = room.sequence,
        "propagation: queued room resync"
    );
    Ok(true)
}

/// Answer resync requests on every tick until shutdown.
pub async fn run_resync_worker(state: AppState, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = resync_peers(&state, crate::now_ms()).await {
            tracing::warn!("propagation: resync pass failed: {e}");
        }
    }
    tracing::info!("propagation: resync worker stopped");
}

/// Forget applied event ids older than the configured window.
pub async fn prune_dedupe_set(state: &AppState, now: i64) -> Result<u64, CoreError> {
    let cutoff = now.saturating_sub(state.config.dedupe_window_ms);
    let pruned = fed_db::prune_applied_events(&state.db, cutoff).await?;
    if pruned > 0 {
        tracing::info!(pruned, "propagation: pruned dedupe entries");
    }
    Ok(pruned)
}

/// Add or update a peer this server exchanges events with.
pub async fn register_peer(
    state: &AppState,
    server_name: &str,
    federation_endpoint: &str,
    public_key_hex: Option<&str>,
    key_id: Option<&str>,
) -> Result<(), CoreError> {
    let server_name = server_name.to_ascii_lowercase();
    fed_db::upsert_federated_server(
        &state.db,
        &server_name,
        federation_endpoint,
        public_key_hex,
        key_id,
        true,
        crate::now_ms(),
    )
    .await?;
    tracing::info!(peer = %server_name, endpoint = federation_endpoint, "propagation: peer registered");
    Ok(())
}
