use crate::DbError;
use sqlx::{Any, Executor};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IdentityRow {
    pub id: i64,
    pub username: String,
    pub domain: String,
    pub created_at_ms: i64,
}

/// Insert an identity unless (username, domain) already exists.
/// Returns true when a row was created.
pub async fn insert_identity_if_absent<'e, E>(
    executor: E,
    id: i64,
    username: &'e str,
    domain: &'e str,
    now_ms: i64,
) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query(
        "INSERT INTO identities (id, username, domain, created_at_ms)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (username, domain) DO NOTHING",
    )
    .bind(id)
    .bind(username)
    .bind(domain)
    .bind(now_ms)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn get_identity<'e, E>(executor: E, id: i64) -> Result<Option<IdentityRow>, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let row = sqlx::query_as::<_, IdentityRow>(
        "SELECT id, username, domain, created_at_ms FROM identities WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

pub async fn get_identity_by_handle<'e, E>(
    executor: E,
    username: &'e str,
    domain: &'e str,
) -> Result<Option<IdentityRow>, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let row = sqlx::query_as::<_, IdentityRow>(
        "SELECT id, username, domain, created_at_ms
         FROM identities
         WHERE username = $1 AND domain = $2",
    )
    .bind(username)
    .bind(domain)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Every identity carrying this bare username, across all domains.
pub async fn list_identities_by_username<'e, E>(
    executor: E,
    username: &'e str,
) -> Result<Vec<IdentityRow>, DbError>
where
    E: Executor<'e, Database = Any> + 'e,
{
    let rows = sqlx::query_as::<_, IdentityRow>(
        "SELECT id, username, domain, created_at_ms
         FROM identities
         WHERE username = $1
         ORDER BY id ASC",
    )
    .bind(username)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_is_idempotent_per_handle() {
        let pool = crate::test_pool().await;
        assert!(insert_identity_if_absent(&pool, 1, "bob", "s2.example", 10)
            .await
            .expect("insert"));
        assert!(!insert_identity_if_absent(&pool, 2, "bob", "s2.example", 11)
            .await
            .expect("insert again"));
        assert!(insert_identity_if_absent(&pool, 3, "bob", "s3.example", 12)
            .await
            .expect("other domain"));

        let found = get_identity_by_handle(&pool, "bob", "s2.example")
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(found.id, 1);

        let all = list_identities_by_username(&pool, "bob")
            .await
            .expect("list");
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
    }
}
