//! Durable outbound delivery: one queue row per (peer, event), drained by a
//! single worker with exponential backoff and a dead-letter table.
//!
//! A peer that can no longer be brought up to date event by event (a row for
//! it was dead-lettered, or it keeps waiting on an event that is no longer
//! queued) gets a resync request; the room layer answers those with a
//! snapshot of the room.

use crate::transport::{DeliveryOutcome, FederationTransport, PeerEndpoint};
use crate::{next_retry_ts, FederationEnvelope, FederationError};
use dashmap::DashMap;
use rookery_db::federation as db;
use rookery_db::DbPool;
use sqlx::AnyConnection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Failed attempts after which a row is dead-lettered.
    pub max_attempts: i64,
    pub base_backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub batch_size: i64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            base_backoff_ms: 5_000,
            max_backoff_ms: 3_600_000,
            batch_size: 100,
        }
    }
}

/// Counts from one pass over the due rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub deferred: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
    pub resyncs_requested: usize,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.deferred + self.retried + self.dead_lettered + self.cancelled
    }
}

pub struct OutboundQueue {
    pool: DbPool,
    transport: Arc<dyn FederationTransport>,
    settings: DeliverySettings,
    room_tokens: DashMap<String, CancellationToken>,
    wake: Notify,
}

impl OutboundQueue {
    pub fn new(
        pool: DbPool,
        transport: Arc<dyn FederationTransport>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            pool,
            transport,
            settings,
            room_tokens: DashMap::new(),
            wake: Notify::new(),
        }
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    /// Queue `envelope` for every destination, on the caller's connection so
    /// the rows commit together with the state change that produced them.
    pub async fn enqueue(
        &self,
        conn: &mut AnyConnection,
        envelope: &FederationEnvelope,
        destinations: &[String],
        now_ms: i64,
    ) -> Result<usize, FederationError> {
        if destinations.is_empty() {
            return Ok(0);
        }
        let payload = serde_json::to_string(envelope)
            .map_err(|e| FederationError::Http(format!("envelope encode failed: {e}")))?;
        for destination in destinations {
            db::enqueue_outbound_event(
                &mut *conn,
                destination,
                &envelope.event.event_id,
                &envelope.event.room_id,
                envelope.event.sequence,
                &payload,
                now_ms,
            )
            .await?;
        }
        Ok(destinations.len())
    }

    /// Wake the delivery worker.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    fn room_token(&self, room_id: &str) -> CancellationToken {
        self.room_tokens
            .entry(room_id.to_string())
            .or_default()
            .clone()
    }

    /// Abort in-flight sends for a room and drop its queued rows, except the
    /// event that supersedes them.
    pub async fn cancel_room(
        &self,
        room_id: &str,
        keep_event_id: &str,
    ) -> Result<u64, FederationError> {
        if let Some((_, token)) = self.room_tokens.remove(room_id) {
            token.cancel();
        }
        let dropped = db::cancel_room_outbound_events(&self.pool, room_id, keep_event_id).await?;
        if dropped > 0 {
            tracing::info!(room_id, dropped, "federation: cancelled queued deliveries");
        }
        Ok(dropped)
    }

    /// Attempt every row due at `now_ms` once.
    pub async fn deliver_due(&self, now_ms: i64) -> Result<DeliveryReport, FederationError> {
        let due = db::fetch_due_outbound_events(&self.pool, now_ms, self.settings.batch_size).await?;
        let mut report = DeliveryReport::default();

        for row in due {
            let envelope: FederationEnvelope = match serde_json::from_str(&row.envelope) {
                Ok(envelope) => envelope,
                Err(e) => {
                    let err_msg = format!("undecodable envelope: {e}");
                    self.dead_letter(&row, None, &err_msg, now_ms, None).await?;
                    report.dead_lettered += 1;
                    continue;
                }
            };
            let peer = PeerEndpoint {
                server_name: row.destination_server.clone(),
                federation_endpoint: row.federation_endpoint.clone(),
            };
            let token = self.room_token(&row.room_id);

            let started = Instant::now();
            let result = tokio::select! {
                _ = token.cancelled() => Err(FederationError::Cancelled),
                sent = self.transport.send_event(&peer, &envelope) => sent,
            };
            let latency_ms = started.elapsed().as_millis() as i64;

            match result {
                Ok(outcome) if outcome.is_acknowledged() => {
                    db::record_delivery_attempt(
                        &self.pool,
                        &row.destination_server,
                        &row.event_id,
                        true,
                        None,
                        Some(latency_ms),
                        now_ms,
                    )
                    .await?;
                    db::mark_outbound_event_delivered(&self.pool, &row.destination_server, &row.event_id)
                        .await?;
                    tracing::debug!(
                        peer = %row.destination_server,
                        event_id = %row.event_id,
                        duplicate = outcome == DeliveryOutcome::Duplicate,
                        "federation: delivered"
                    );
                    report.delivered += 1;
                }
                Ok(_) => {
                    if db::has_earlier_outbound_event(
                        &self.pool,
                        &row.destination_server,
                        &row.room_id,
                        row.room_sequence,
                    )
                    .await?
                    {
                        let retry_at = now_ms.saturating_add(self.settings.base_backoff_ms);
                        db::defer_outbound_event(
                            &self.pool,
                            &row.destination_server,
                            &row.event_id,
                            retry_at,
                            now_ms,
                        )
                        .await?;
                        tracing::debug!(
                            peer = %row.destination_server,
                            event_id = %row.event_id,
                            "federation: peer is waiting on an earlier event, resending later"
                        );
                        report.deferred += 1;
                        continue;
                    }

                    // Nothing queued here can close the peer's gap.
                    let err_msg = "peer is waiting on an event that is no longer queued";
                    if self.request_resync(&self.pool, &row, &envelope, "stalled", now_ms).await? {
                        report.resyncs_requested += 1;
                    }
                    if row.attempt_count + 1 >= self.settings.max_attempts {
                        self.dead_letter(&row, None, err_msg, now_ms, Some(latency_ms))
                            .await?;
                        report.dead_lettered += 1;
                    } else {
                        self.retry_later(&row, err_msg, now_ms, latency_ms).await?;
                        report.deferred += 1;
                    }
                }
                Err(FederationError::Cancelled) => {
                    report.cancelled += 1;
                }
                Err(e) if e.is_permanent() || row.attempt_count + 1 >= self.settings.max_attempts => {
                    if self
                        .dead_letter(&row, Some(&envelope), &e.to_string(), now_ms, Some(latency_ms))
                        .await?
                    {
                        report.resyncs_requested += 1;
                    }
                    report.dead_lettered += 1;
                }
                Err(e) => {
                    self.retry_later(&row, &e.to_string(), now_ms, latency_ms).await?;
                    report.retried += 1;
                }
            }
        }
        Ok(report)
    }

    async fn retry_later(
        &self,
        row: &db::OutboundEventRow,
        err_msg: &str,
        now_ms: i64,
        latency_ms: i64,
    ) -> Result<(), FederationError> {
        let retry_at = next_retry_ts(
            now_ms,
            row.attempt_count,
            self.settings.base_backoff_ms,
            self.settings.max_backoff_ms,
        );
        db::record_delivery_attempt(
            &self.pool,
            &row.destination_server,
            &row.event_id,
            false,
            Some(err_msg),
            Some(latency_ms),
            now_ms,
        )
        .await?;
        db::mark_outbound_event_retry(
            &self.pool,
            &row.destination_server,
            &row.event_id,
            retry_at,
            Some(err_msg),
            now_ms,
        )
        .await?;
        tracing::warn!(
            peer = %row.destination_server,
            event_id = %row.event_id,
            attempt = row.attempt_count + 1,
            retry_at,
            "federation: delivery failed: {err_msg}"
        );
        Ok(())
    }

    /// Record that the peer needs a snapshot of the row's room. Proposals and
    /// events that already replace the peer's state never ask for one.
    async fn request_resync<'e, E>(
        &self,
        executor: E,
        row: &'e db::OutboundEventRow,
        envelope: &FederationEnvelope,
        reason: &'e str,
        now_ms: i64,
    ) -> Result<bool, FederationError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Any> + 'e,
    {
        if envelope.event.is_proposal() || envelope.event.kind.supersedes_history() {
            return Ok(false);
        }
        let requested =
            db::request_resync(executor, &row.destination_server, &row.room_id, reason, now_ms).await?;
        if requested {
            tracing::info!(
                peer = %row.destination_server,
                room_id = %row.room_id,
                reason,
                "federation: peer needs a room resync"
            );
        }
        Ok(requested)
    }

    /// Move a row to the dead-letter table. With the decoded envelope at
    /// hand, the same transaction asks for the peer to be resynced. Returns
    /// whether a new resync request was recorded.
    async fn dead_letter(
        &self,
        row: &db::OutboundEventRow,
        envelope: Option<&FederationEnvelope>,
        err_msg: &str,
        now_ms: i64,
        latency_ms: Option<i64>,
    ) -> Result<bool, FederationError> {
        let mut tx = self.pool.begin().await?;
        db::record_delivery_attempt(
            &mut *tx,
            &row.destination_server,
            &row.event_id,
            false,
            Some(err_msg),
            latency_ms,
            now_ms,
        )
        .await?;
        db::dead_letter_outbound_event(&mut tx, &row.destination_server, &row.event_id, Some(err_msg), now_ms)
            .await?;
        let resync = match envelope {
            Some(envelope) => {
                self.request_resync(&mut *tx, row, envelope, "dead-lettered", now_ms)
                    .await?
            }
            None => false,
        };
        tx.commit().await?;
        tracing::error!(
            peer = %row.destination_server,
            event_id = %row.event_id,
            room_id = %row.room_id,
            attempts = row.attempt_count + 1,
            "federation: event dead-lettered: {err_msg}"
        );
        Ok(resync)
    }

    /// Drain due rows whenever woken or on every tick, until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            let now_ms = chrono::Utc::now().timestamp_millis();
            match self.deliver_due(now_ms).await {
                Ok(report) if report.attempted() as i64 >= self.settings.batch_size => {
                    // Full batch, there may be more due right now.
                    self.notify();
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("federation: outbound queue pass failed: {e}"),
            }
        }
        tracing::info!("federation: delivery worker stopped");
    }
}
