use crate::bool_from_any_row;
use sqlx::{Any, AnyConnection, Executor, Row};

#[derive(Debug, Clone)]
pub struct FederatedServerRow {
    pub server_name: String,
    pub federation_endpoint: String,
    pub public_key_hex: Option<String>,
    pub key_id: Option<String>,
    pub trusted: bool,
    pub last_seen_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for FederatedServerRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            server_name: row.try_get("server_name")?,
            federation_endpoint: row.try_get("federation_endpoint")?,
            public_key_hex: row.try_get("public_key_hex")?,
            key_id: row.try_get("key_id")?,
            trusted: bool_from_any_row(row, "trusted")?,
            last_seen_at_ms: row.try_get("last_seen_at_ms")?,
            created_at_ms: row.try_get("created_at_ms")?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerKeypairRow {
    pub id: i64,
    pub key_id: String,
    pub signing_key_hex: String,
    pub public_key_hex: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedEventRow {
    pub event_id: String,
    pub room_id: String,
    pub event_type: String,
    pub sequence: i64,
    pub origin_server: String,
    pub payload: String,
    pub applied_at_ms: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboundEventRow {
    pub destination_server: String,
    pub federation_endpoint: String,
    pub event_id: String,
    pub room_id: String,
    pub room_sequence: i64,
    pub envelope: String,
    pub attempt_count: i64,
    pub next_attempt_at_ms: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResyncRequestRow {
    pub destination_server: String,
    pub room_id: String,
    pub reason: String,
    pub requested_at_ms: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterRow {
    pub destination_server: String,
    pub event_id: String,
    pub room_id: String,
    pub envelope: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub dead_at_ms: i64,
}

/// Insert or update a known federated server.
pub async fn upsert_federated_server<'e, E>(
    executor: E,
    server_name: &'e str,
    federation_endpoint: &'e str,
    public_key_hex: Option<&'e str>,
    key_id: Option<&'e str>,
    trusted: bool,
    now_ms: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query(
        "INSERT INTO federated_servers (server_name, federation_endpoint, public_key_hex, key_id, trusted, created_at_ms)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (server_name) DO UPDATE SET
             federation_endpoint = EXCLUDED.federation_endpoint,
             public_key_hex = COALESCE(EXCLUDED.public_key_hex, federated_servers.public_key_hex),
             key_id = COALESCE(EXCLUDED.key_id, federated_servers.key_id),
             trusted = EXCLUDED.trusted",
    )
    .bind(server_name)
    .bind(federation_endpoint)
    .bind(public_key_hex)
    .bind(key_id)
    .bind(trusted)
    .bind(now_ms)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_federated_server<'e, E>(
    executor: E,
    server_name: &'e str,
) -> Result<Option<FederatedServerRow>, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query_as::<_, FederatedServerRow>(
        "SELECT server_name, federation_endpoint, public_key_hex, key_id, trusted, last_seen_at_ms, created_at_ms
         FROM federated_servers WHERE server_name = $1",
    )
    .bind(server_name)
    .fetch_optional(executor)
    .await
}

/// Record that a peer was heard from.
pub async fn touch_federated_server<'e, E>(
    executor: E,
    server_name: &'e str,
    now_ms: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query("UPDATE federated_servers SET last_seen_at_ms = $2 WHERE server_name = $1")
        .bind(server_name)
        .bind(now_ms)
        .execute(executor)
        .await?;
    Ok(())
}

/// Remember an applied event. Returns false when the id was already known.
#[allow(clippy::too_many_arguments)]
pub async fn insert_applied_event<'e, E>(
    executor: E,
    event_id: &'e str,
    room_id: &'e str,
    event_type: &'e str,
    sequence: i64,
    origin_server: &'e str,
    payload: &'e str,
    applied_at_ms: i64,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query(
        "INSERT INTO federation_events (event_id, room_id, event_type, sequence, origin_server, payload, applied_at_ms)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (event_id) DO NOTHING",
    )
    .bind(event_id)
    .bind(room_id)
    .bind(event_type)
    .bind(sequence)
    .bind(origin_server)
    .bind(payload)
    .bind(applied_at_ms)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn has_applied_event<'e, E>(executor: E, event_id: &'e str) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM federation_events WHERE event_id = $1 LIMIT 1")
            .bind(event_id)
            .fetch_optional(executor)
            .await?;
    Ok(row.is_some())
}

/// Applied events of a room in sequence order.
pub async fn list_applied_events<'e, E>(
    executor: E,
    room_id: &'e str,
) -> Result<Vec<AppliedEventRow>, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query_as::<_, AppliedEventRow>(
        "SELECT event_id, room_id, event_type, sequence, origin_server, payload, applied_at_ms
         FROM federation_events
         WHERE room_id = $1
         ORDER BY sequence ASC, applied_at_ms ASC",
    )
    .bind(room_id)
    .fetch_all(executor)
    .await
}

/// Forget applied event ids older than the dedupe window.
pub async fn prune_applied_events<'e, E>(executor: E, older_than_ms: i64) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query("DELETE FROM federation_events WHERE applied_at_ms < $1")
        .bind(older_than_ms)
        .execute(executor)
        .await?
        .rows_affected();
    Ok(rows)
}

/// Queue an envelope for one peer. `room_sequence` orders rows of the same
/// room queued in the same instant.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue_outbound_event<'e, E>(
    executor: E,
    destination_server: &'e str,
    event_id: &'e str,
    room_id: &'e str,
    room_sequence: i64,
    envelope: &'e str,
    now_ms: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query(
        "INSERT INTO federation_outbound_queue (
             destination_server, event_id, room_id, room_sequence, envelope, attempt_count,
             next_attempt_at_ms, last_error, created_at_ms, updated_at_ms
         ) VALUES ($1, $2, $3, $4, $5, 0, $6, NULL, $6, $6)
         ON CONFLICT (destination_server, event_id) DO UPDATE SET
             next_attempt_at_ms = CASE WHEN federation_outbound_queue.next_attempt_at_ms < EXCLUDED.next_attempt_at_ms THEN federation_outbound_queue.next_attempt_at_ms ELSE EXCLUDED.next_attempt_at_ms END,
             updated_at_ms = EXCLUDED.updated_at_ms",
    )
    .bind(destination_server)
    .bind(event_id)
    .bind(room_id)
    .bind(room_sequence)
    .bind(envelope)
    .bind(now_ms)
    .execute(executor)
    .await?;
    Ok(())
}

/// Queue rows whose next attempt is due, for trusted peers only.
pub async fn fetch_due_outbound_events<'e, E>(
    executor: E,
    now_ms: i64,
    limit: i64,
) -> Result<Vec<OutboundEventRow>, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query_as::<_, OutboundEventRow>(
        "SELECT
             q.destination_server,
             fs.federation_endpoint,
             q.event_id,
             q.room_id,
             q.room_sequence,
             q.envelope,
             q.attempt_count,
             q.next_attempt_at_ms,
             q.last_error
         FROM federation_outbound_queue q
         INNER JOIN federated_servers fs
           ON fs.server_name = q.destination_server
         WHERE q.next_attempt_at_ms <= $1
           AND fs.trusted = TRUE
         ORDER BY q.next_attempt_at_ms ASC, q.created_at_ms ASC, q.room_id ASC, q.room_sequence ASC
         LIMIT $2",
    )
    .bind(now_ms)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// Everything still queued, due or not.
pub async fn list_outbound_events<'e, E>(executor: E) -> Result<Vec<OutboundEventRow>, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query_as::<_, OutboundEventRow>(
        "SELECT
             q.destination_server,
             COALESCE(fs.federation_endpoint, '') AS federation_endpoint,
             q.event_id,
             q.room_id,
             q.room_sequence,
             q.envelope,
             q.attempt_count,
             q.next_attempt_at_ms,
             q.last_error
         FROM federation_outbound_queue q
         LEFT JOIN federated_servers fs
           ON fs.server_name = q.destination_server
         ORDER BY q.created_at_ms ASC, q.destination_server ASC, q.event_id ASC",
    )
    .fetch_all(executor)
    .await
}

/// Peers that still have `event_id` queued.
pub async fn count_outbound_for_event<'e, E>(executor: E, event_id: &'e str) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query_scalar("SELECT COUNT(*) FROM federation_outbound_queue WHERE event_id = $1")
        .bind(event_id)
        .fetch_one(executor)
        .await
}

pub async fn mark_outbound_event_delivered<'e, E>(
    executor: E,
    destination_server: &'e str,
    event_id: &'e str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query(
        "DELETE FROM federation_outbound_queue
         WHERE destination_server = $1 AND event_id = $2",
    )
    .bind(destination_server)
    .bind(event_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn mark_outbound_event_retry<'e, E>(
    executor: E,
    destination_server: &'e str,
    event_id: &'e str,
    next_attempt_at_ms: i64,
    error: Option<&'e str>,
    now_ms: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query(
        "UPDATE federation_outbound_queue
         SET
             attempt_count = attempt_count + 1,
             next_attempt_at_ms = $3,
             last_error = $4,
             updated_at_ms = $5
         WHERE destination_server = $1
           AND event_id = $2",
    )
    .bind(destination_server)
    .bind(event_id)
    .bind(next_attempt_at_ms)
    .bind(error)
    .bind(now_ms)
    .execute(executor)
    .await?;
    Ok(())
}

/// Push a row back without counting an attempt, used when the peer asked us
/// to resend later because it is still waiting on an earlier event.
pub async fn defer_outbound_event<'e, E>(
    executor: E,
    destination_server: &'e str,
    event_id: &'e str,
    next_attempt_at_ms: i64,
    now_ms: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query(
        "UPDATE federation_outbound_queue
         SET next_attempt_at_ms = $3, updated_at_ms = $4
         WHERE destination_server = $1
           AND event_id = $2",
    )
    .bind(destination_server)
    .bind(event_id)
    .bind(next_attempt_at_ms)
    .bind(now_ms)
    .execute(executor)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn record_delivery_attempt<'e, E>(
    executor: E,
    destination_server: &'e str,
    event_id: &'e str,
    success: bool,
    error: Option<&'e str>,
    latency_ms: Option<i64>,
    attempted_at_ms: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query(
        "INSERT INTO federation_delivery_attempts (
             destination_server, event_id, success, error, latency_ms, attempted_at_ms
         ) VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(destination_server)
    .bind(event_id)
    .bind(success)
    .bind(error)
    .bind(latency_ms)
    .bind(attempted_at_ms)
    .execute(executor)
    .await?;
    Ok(())
}

/// Move a queue row to the dead-letter table. Both statements run on the
/// given connection, normally inside the caller's transaction.
pub async fn dead_letter_outbound_event(
    conn: &mut AnyConnection,
    destination_server: &str,
    event_id: &str,
    last_error: Option<&str>,
    now_ms: i64,
) -> Result<bool, sqlx::Error> {
    let moved = sqlx::query(
        "INSERT INTO federation_dead_letters (
             destination_server, event_id, room_id, envelope, attempt_count, last_error, dead_at_ms
         )
         SELECT destination_server, event_id, room_id, envelope, attempt_count + 1, COALESCE($3, last_error), $4
         FROM federation_outbound_queue
         WHERE destination_server = $1 AND event_id = $2
         ON CONFLICT (destination_server, event_id) DO NOTHING",
    )
    .bind(destination_server)
    .bind(event_id)
    .bind(last_error)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    sqlx::query(
        "DELETE FROM federation_outbound_queue
         WHERE destination_server = $1 AND event_id = $2",
    )
    .bind(destination_server)
    .bind(event_id)
    .execute(&mut *conn)
    .await?;
    Ok(moved > 0)
}

pub async fn list_dead_letters<'e, E>(executor: E) -> Result<Vec<DeadLetterRow>, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query_as::<_, DeadLetterRow>(
        "SELECT destination_server, event_id, room_id, envelope, attempt_count, last_error, dead_at_ms
         FROM federation_dead_letters
         ORDER BY dead_at_ms ASC, destination_server ASC",
    )
    .fetch_all(executor)
    .await
}

/// Drop every queued row of a room except `keep_event_id`.
pub async fn cancel_room_outbound_events<'e, E>(
    executor: E,
    room_id: &'e str,
    keep_event_id: &'e str,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query(
        "DELETE FROM federation_outbound_queue
         WHERE room_id = $1 AND event_id <> $2",
    )
    .bind(room_id)
    .bind(keep_event_id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Whether `destination_server` still has a row of `room_id` queued that
/// comes before `room_sequence`.
pub async fn has_earlier_outbound_event<'e, E>(
    executor: E,
    destination_server: &'e str,
    room_id: &'e str,
    room_sequence: i64,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM federation_outbound_queue
         WHERE destination_server = $1 AND room_id = $2
           AND room_sequence > 0 AND room_sequence < $3",
    )
    .bind(destination_server)
    .bind(room_id)
    .bind(room_sequence)
    .fetch_one(executor)
    .await?;
    Ok(count > 0)
}

/// Ask for `destination_server` to be sent a fresh snapshot of `room_id`.
/// An open request for the same pair is kept as is.
pub async fn request_resync<'e, E>(
    executor: E,
    destination_server: &'e str,
    room_id: &'e str,
    reason: &'e str,
    now_ms: i64,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query(
        "INSERT INTO federation_resync_requests (destination_server, room_id, reason, requested_at_ms)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (destination_server, room_id) DO NOTHING",
    )
    .bind(destination_server)
    .bind(room_id)
    .bind(reason)
    .bind(now_ms)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn list_resync_requests<'e, E>(
    executor: E,
    limit: i64,
) -> Result<Vec<ResyncRequestRow>, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query_as::<_, ResyncRequestRow>(
        "SELECT destination_server, room_id, reason, requested_at_ms
         FROM federation_resync_requests
         ORDER BY requested_at_ms ASC, destination_server ASC, room_id ASC
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(executor)
    .await
}

pub async fn delete_resync_request<'e, E>(
    executor: E,
    destination_server: &'e str,
    room_id: &'e str,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query(
        "DELETE FROM federation_resync_requests
         WHERE destination_server = $1 AND room_id = $2",
    )
    .bind(destination_server)
    .bind(room_id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Store or replace the local server's ed25519 keypair (singleton row, id=1).
pub async fn upsert_server_keypair<'e, E>(
    executor: E,
    key_id: &'e str,
    signing_key_hex: &'e str,
    public_key_hex: &'e str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query(
        "INSERT INTO server_keypair (id, key_id, signing_key_hex, public_key_hex)
         VALUES (1, $1, $2, $3)
         ON CONFLICT (id) DO UPDATE SET
             key_id = EXCLUDED.key_id,
             signing_key_hex = EXCLUDED.signing_key_hex,
             public_key_hex = EXCLUDED.public_key_hex",
    )
    .bind(key_id)
    .bind(signing_key_hex)
    .bind(public_key_hex)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_server_keypair<'e, E>(executor: E) -> Result<Option<ServerKeypairRow>, sqlx::Error>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query_as::<_, ServerKeypairRow>(
        "SELECT id, key_id, signing_key_hex, public_key_hex FROM server_keypair WHERE id = 1",
    )
    .fetch_optional(executor)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool_with_peer() -> crate::DbPool {
        let pool = crate::test_pool().await;
        upsert_federated_server(&pool, "s2.example", "http://s2", None, None, true, 1)
            .await
            .expect("peer");
        pool
    }

    #[tokio::test]
    async fn upsert_keeps_known_key_when_none_given() {
        let pool = pool_with_peer().await;
        upsert_federated_server(&pool, "s2.example", "http://s2", Some("ab"), Some("k1"), true, 2)
            .await
            .expect("with key");
        upsert_federated_server(&pool, "s2.example", "http://s2:8080", None, None, false, 3)
            .await
            .expect("without key");
        let row = get_federated_server(&pool, "s2.example")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(row.public_key_hex.as_deref(), Some("ab"));
        assert_eq!(row.federation_endpoint, "http://s2:8080");
        assert!(!row.trusted);
        assert_eq!(row.created_at_ms, 1);
    }

    #[tokio::test]
    async fn applied_events_dedupe_and_prune() {
        let pool = crate::test_pool().await;
        assert!(insert_applied_event(&pool, "$e1", "!1:s1", "m.room.leave", 1, "s1", "{}", 100)
            .await
            .expect("insert"));
        assert!(!insert_applied_event(&pool, "$e1", "!1:s1", "m.room.leave", 1, "s1", "{}", 200)
            .await
            .expect("duplicate"));
        assert!(has_applied_event(&pool, "$e1").await.expect("has"));

        assert_eq!(prune_applied_events(&pool, 150).await.expect("prune"), 1);
        assert!(!has_applied_event(&pool, "$e1").await.expect("has"));
    }

    #[tokio::test]
    async fn queue_retry_and_dead_letter() {
        let pool = pool_with_peer().await;
        enqueue_outbound_event(&pool, "s2.example", "$e1", "!1:s1", 1, "{}", 10)
            .await
            .expect("enqueue");

        let due = fetch_due_outbound_events(&pool, 10, 10).await.expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].federation_endpoint, "http://s2");

        mark_outbound_event_retry(&pool, "s2.example", "$e1", 5_010, Some("boom"), 10)
            .await
            .expect("retry");
        assert!(fetch_due_outbound_events(&pool, 11, 10)
            .await
            .expect("due")
            .is_empty());

        let mut conn = pool.acquire().await.expect("conn");
        assert!(
            dead_letter_outbound_event(&mut conn, "s2.example", "$e1", None, 20)
                .await
                .expect("dead letter")
        );
        drop(conn);

        let dead = list_dead_letters(&pool).await.expect("dead");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt_count, 2);
        assert_eq!(dead[0].last_error.as_deref(), Some("boom"));
        assert!(list_outbound_events(&pool).await.expect("queue").is_empty());
    }

    #[tokio::test]
    async fn earlier_rows_are_found_per_peer_and_room() {
        let pool = pool_with_peer().await;
        enqueue_outbound_event(&pool, "s2.example", "$a", "!1:s1", 2, "{}", 10)
            .await
            .expect("enqueue");
        enqueue_outbound_event(&pool, "s2.example", "$other", "!2:s1", 1, "{}", 10)
            .await
            .expect("enqueue other room");

        assert!(has_earlier_outbound_event(&pool, "s2.example", "!1:s1", 3)
            .await
            .expect("earlier"));
        assert!(!has_earlier_outbound_event(&pool, "s2.example", "!1:s1", 2)
            .await
            .expect("same sequence"));
        assert!(!has_earlier_outbound_event(&pool, "s3.example", "!1:s1", 3)
            .await
            .expect("other peer"));
    }

    #[tokio::test]
    async fn resync_requests_collapse_per_peer_and_room() {
        let pool = crate::test_pool().await;
        assert!(request_resync(&pool, "s2.example", "!1:s1", "dead-lettered", 10)
            .await
            .expect("request"));
        assert!(!request_resync(&pool, "s2.example", "!1:s1", "deferred", 20)
            .await
            .expect("repeat"));
        request_resync(&pool, "s3.example", "!1:s1", "deferred", 30)
            .await
            .expect("second peer");

        let open = list_resync_requests(&pool, 10).await.expect("list");
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].destination_server, "s2.example");
        assert_eq!(open[0].reason, "dead-lettered");

        assert!(delete_resync_request(&pool, "s2.example", "!1:s1")
            .await
            .expect("delete"));
        assert_eq!(list_resync_requests(&pool, 10).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn cancelling_room_keeps_the_delete_event() {
        let pool = pool_with_peer().await;
        for event in ["$a", "$b", "$delete"] {
            enqueue_outbound_event(&pool, "s2.example", event, "!1:s1", 1, "{}", 10)
                .await
                .expect("enqueue");
        }
        enqueue_outbound_event(&pool, "s2.example", "$other", "!2:s1", 1, "{}", 10)
            .await
            .expect("enqueue other room");

        assert_eq!(
            cancel_room_outbound_events(&pool, "!1:s1", "$delete")
                .await
                .expect("cancel"),
            2
        );
        let left: Vec<String> = list_outbound_events(&pool)
            .await
            .expect("queue")
            .into_iter()
            .map(|row| row.event_id)
            .collect();
        assert_eq!(left, vec!["$delete".to_string(), "$other".to_string()]);
    }
}
