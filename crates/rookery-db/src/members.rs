use crate::DbError;
use sqlx::{Any, Executor};

/// A membership joined with the member's identity.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MemberRow {
    pub room_id: i64,
    pub identity_id: i64,
    pub role: i64,
    pub joined_at_ms: i64,
    pub username: String,
    pub domain: String,
}

/// Returns false when the identity was already a member.
pub async fn add_member<'e, E>(
    executor: E,
    room_id: i64,
    identity_id: i64,
    role: i64,
    joined_at_ms: i64,
) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query(
        "INSERT INTO room_members (room_id, identity_id, role, joined_at_ms)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (room_id, identity_id) DO NOTHING",
    )
    .bind(room_id)
    .bind(identity_id)
    .bind(role)
    .bind(joined_at_ms)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Returns false when the identity was not a member.
pub async fn remove_member<'e, E>(
    executor: E,
    room_id: i64,
    identity_id: i64,
) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND identity_id = $2")
        .bind(room_id)
        .bind(identity_id)
        .execute(executor)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

pub async fn get_member<'e, E>(
    executor: E,
    room_id: i64,
    identity_id: i64,
) -> Result<Option<MemberRow>, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let row = sqlx::query_as::<_, MemberRow>(
        "SELECT m.room_id, m.identity_id, m.role, m.joined_at_ms, i.username, i.domain
         FROM room_members m
         INNER JOIN identities i ON i.id = m.identity_id
         WHERE m.room_id = $1 AND m.identity_id = $2",
    )
    .bind(room_id)
    .bind(identity_id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

pub async fn list_members<'e, E>(executor: E, room_id: i64) -> Result<Vec<MemberRow>, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query_as::<_, MemberRow>(
        "SELECT m.room_id, m.identity_id, m.role, m.joined_at_ms, i.username, i.domain
         FROM room_members m
         INNER JOIN identities i ON i.id = m.identity_id
         WHERE m.room_id = $1
         ORDER BY m.joined_at_ms ASC, m.identity_id ASC",
    )
    .bind(room_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Distinct home domains of the room's current members.
pub async fn list_member_domains<'e, E>(executor: E, room_id: i64) -> Result<Vec<String>, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT i.domain
         FROM room_members m
         INNER JOIN identities i ON i.id = m.identity_id
         WHERE m.room_id = $1
         ORDER BY i.domain ASC",
    )
    .bind(room_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

pub async fn delete_room_members<'e, E>(executor: E, room_id: i64) -> Result<u64, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query("DELETE FROM room_members WHERE room_id = $1")
        .bind(room_id)
        .execute(executor)
        .await?
        .rows_affected();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identities::insert_identity_if_absent;
    use crate::rooms::{create_room, NewRoom};

    async fn room_with_owner() -> crate::DbPool {
        let pool = crate::test_pool().await;
        insert_identity_if_absent(&pool, 1, "alice", "s1.example", 0)
            .await
            .expect("alice");
        insert_identity_if_absent(&pool, 2, "bob", "s2.example", 0)
            .await
            .expect("bob");
        create_room(
            &pool,
            NewRoom {
                id: 10,
                room_id: "!10:s1.example",
                name: "general",
                topic: None,
                kind: 0,
                origin_server: "s1.example",
                is_federated: true,
                owner_id: 1,
                sequence: 0,
                created_at_ms: 0,
            },
        )
        .await
        .expect("room");
        add_member(&pool, 10, 1, 0, 1).await.expect("owner");
        pool
    }

    #[tokio::test]
    async fn membership_is_set_like() {
        let pool = room_with_owner().await;
        assert!(add_member(&pool, 10, 2, 1, 2).await.expect("add"));
        assert!(!add_member(&pool, 10, 2, 1, 3).await.expect("re-add"));

        let members = list_members(&pool, 10).await.expect("list");
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].username, "bob");
        assert_eq!(members[1].joined_at_ms, 2);

        let domains = list_member_domains(&pool, 10).await.expect("domains");
        assert_eq!(domains, vec!["s1.example", "s2.example"]);

        assert!(remove_member(&pool, 10, 2).await.expect("remove"));
        assert!(!remove_member(&pool, 10, 2).await.expect("remove again"));
        assert!(get_member(&pool, 10, 2).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn deleting_room_members_clears_everything() {
        let pool = room_with_owner().await;
        add_member(&pool, 10, 2, 1, 2).await.expect("add");
        assert_eq!(delete_room_members(&pool, 10).await.expect("delete"), 2);
        assert!(list_members(&pool, 10).await.expect("list").is_empty());
    }
}
