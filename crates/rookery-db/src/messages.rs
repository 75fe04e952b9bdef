use crate::DbError;
use sqlx::{Any, Executor};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SystemMessageRow {
    pub id: i64,
    pub room_id: i64,
    pub event_id: String,
    pub author: String,
    pub text: String,
    pub created_at_ms: i64,
}

/// Append a system message for an applied event. A second message for the
/// same event in the same room is ignored; returns whether a row was added.
pub async fn insert_system_message<'e, E>(
    executor: E,
    id: i64,
    room_id: i64,
    event_id: &'e str,
    author: &'e str,
    text: &'e str,
    created_at_ms: i64,
) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query(
        "INSERT INTO system_messages (id, room_id, event_id, author, text, created_at_ms)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (room_id, event_id) DO NOTHING",
    )
    .bind(id)
    .bind(room_id)
    .bind(event_id)
    .bind(author)
    .bind(text)
    .bind(created_at_ms)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn list_system_messages<'e, E>(
    executor: E,
    room_id: i64,
) -> Result<Vec<SystemMessageRow>, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query_as::<_, SystemMessageRow>(
        "SELECT id, room_id, event_id, author, text, created_at_ms
         FROM system_messages
         WHERE room_id = $1
         ORDER BY created_at_ms ASC, id ASC",
    )
    .bind(room_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}
