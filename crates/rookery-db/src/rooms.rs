use crate::{bool_from_any_row, DbError};
use sqlx::{Any, Executor, Row};

#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: i64,
    pub room_id: String,
    pub name: String,
    pub topic: Option<String>,
    pub kind: i64,
    pub origin_server: String,
    pub is_federated: bool,
    pub owner_id: i64,
    pub sequence: i64,
    pub created_at_ms: i64,
    pub deleted: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for RoomRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            room_id: row.try_get("room_id")?,
            name: row.try_get("name")?,
            topic: row.try_get("topic")?,
            kind: row.try_get("kind")?,
            origin_server: row.try_get("origin_server")?,
            is_federated: bool_from_any_row(row, "is_federated")?,
            owner_id: row.try_get("owner_id")?,
            sequence: row.try_get("sequence")?,
            created_at_ms: row.try_get("created_at_ms")?,
            deleted: bool_from_any_row(row, "deleted")?,
        })
    }
}

/// Column values for a new room row, either locally created or a replica.
#[derive(Debug, Clone, Copy)]
pub struct NewRoom<'a> {
    pub id: i64,
    pub room_id: &'a str,
    pub name: &'a str,
    pub topic: Option<&'a str>,
    pub kind: i64,
    pub origin_server: &'a str,
    pub is_federated: bool,
    pub owner_id: i64,
    pub sequence: i64,
    pub created_at_ms: i64,
}

pub async fn create_room<'e, E>(executor: E, room: NewRoom<'e>) -> Result<RoomRow, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let row = sqlx::query_as::<_, RoomRow>(
        "INSERT INTO rooms (id, room_id, name, topic, kind, origin_server, is_federated, owner_id, sequence, created_at_ms, deleted)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE)
         RETURNING id, room_id, name, topic, kind, origin_server, is_federated, owner_id, sequence, created_at_ms, deleted",
    )
        .bind(room.id)
        .bind(room.room_id)
        .bind(room.name)
        .bind(room.topic)
        .bind(room.kind)
        .bind(room.origin_server)
        .bind(room.is_federated)
        .bind(room.owner_id)
        .bind(room.sequence)
        .bind(room.created_at_ms)
        .fetch_one(executor)
        .await?;
    Ok(row)
}

pub async fn get_room<'e, E>(executor: E, id: i64) -> Result<Option<RoomRow>, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let row = sqlx::query_as::<_, RoomRow>(
        "SELECT id, room_id, name, topic, kind, origin_server, is_federated, owner_id, sequence, created_at_ms, deleted
         FROM rooms WHERE id = $1",
    )
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// Look a room up by its federation-wide id. Deleted rooms are returned too
/// so callers can tell "never seen" from "already deleted".
pub async fn get_room_by_federated_id<'e, E>(
    executor: E,
    room_id: &'e str,
) -> Result<Option<RoomRow>, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let row = sqlx::query_as::<_, RoomRow>(
        "SELECT id, room_id, name, topic, kind, origin_server, is_federated, owner_id, sequence, created_at_ms, deleted
         FROM rooms WHERE room_id = $1",
    )
        .bind(room_id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// Live rooms the identity is a member of.
pub async fn list_rooms_for_identity<'e, E>(
    executor: E,
    identity_id: i64,
) -> Result<Vec<RoomRow>, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query_as::<_, RoomRow>(
        "SELECT r.id, r.room_id, r.name, r.topic, r.kind, r.origin_server, r.is_federated,
                r.owner_id, r.sequence, r.created_at_ms, r.deleted
         FROM rooms r
         INNER JOIN room_members m ON m.room_id = r.id
         WHERE m.identity_id = $1 AND r.deleted = FALSE
         ORDER BY r.created_at_ms ASC, r.id ASC",
    )
        .bind(identity_id)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

pub async fn set_federated<'e, E>(executor: E, id: i64) -> Result<(), DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query("UPDATE rooms SET is_federated = TRUE WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn update_name<'e, E>(executor: E, id: i64, name: &'e str) -> Result<(), DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let result = sqlx::query("UPDATE rooms SET name = $2 WHERE id = $1")
        .bind(id)
        .bind(name)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn update_topic<'e, E>(
    executor: E,
    id: i64,
    topic: Option<&'e str>,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let result = sqlx::query("UPDATE rooms SET topic = $2 WHERE id = $1")
        .bind(id)
        .bind(topic)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Allocate the next sequence number for a room this server originates.
pub async fn next_sequence<'e, E>(executor: E, id: i64) -> Result<i64, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let sequence: Option<i64> = sqlx::query_scalar(
        "UPDATE rooms SET sequence = sequence + 1 WHERE id = $1 RETURNING sequence",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    sequence.ok_or(DbError::NotFound)
}

/// Advance a replica's applied-sequence cursor. Never moves it backwards.
pub async fn advance_sequence<'e, E>(executor: E, id: i64, sequence: i64) -> Result<(), DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query("UPDATE rooms SET sequence = $2 WHERE id = $1 AND sequence < $2")
        .bind(id)
        .bind(sequence)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn mark_deleted<'e, E>(executor: E, id: i64) -> Result<(), DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    sqlx::query("UPDATE rooms SET deleted = TRUE WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identities::insert_identity_if_absent;

    async fn seeded() -> crate::DbPool {
        let pool = crate::test_pool().await;
        insert_identity_if_absent(&pool, 1, "alice", "s1.example", 0)
            .await
            .expect("owner");
        pool
    }

    fn new_room(id: i64) -> NewRoom<'static> {
        NewRoom {
            id,
            room_id: "!100:s1.example",
            name: "general",
            topic: None,
            kind: 0,
            origin_server: "s1.example",
            is_federated: false,
            owner_id: 1,
            sequence: 0,
            created_at_ms: 5,
        }
    }

    #[tokio::test]
    async fn created_room_round_trips_flags() {
        let pool = seeded().await;
        let created = create_room(&pool, new_room(100)).await.expect("create");
        assert!(!created.is_federated);
        assert!(!created.deleted);

        set_federated(&pool, 100).await.expect("federate");
        update_topic(&pool, 100, Some("plans")).await.expect("topic");
        let loaded = get_room_by_federated_id(&pool, "!100:s1.example")
            .await
            .expect("lookup")
            .expect("exists");
        assert!(loaded.is_federated);
        assert_eq!(loaded.topic.as_deref(), Some("plans"));
    }

    #[tokio::test]
    async fn sequence_allocation_is_monotonic() {
        let pool = seeded().await;
        create_room(&pool, new_room(100)).await.expect("create");
        assert_eq!(next_sequence(&pool, 100).await.expect("seq"), 1);
        assert_eq!(next_sequence(&pool, 100).await.expect("seq"), 2);

        advance_sequence(&pool, 100, 1).await.expect("no-op");
        let room = get_room(&pool, 100).await.expect("get").expect("exists");
        assert_eq!(room.sequence, 2);

        assert!(matches!(
            next_sequence(&pool, 999).await,
            Err(DbError::NotFound)
        ));
    }
}
