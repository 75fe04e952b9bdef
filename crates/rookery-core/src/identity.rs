//! Mapping federated handles to local identity records.
//!
//! Remote users get a proxy identity the first time they are referenced;
//! the `(username, domain)` unique index makes creation race-free.
//!
//! A proxy is created on the caller's connection, usually inside a
//! transaction that may still roll back, so the cache only learns about it
//! once [`PROXY_SETTLE`] has passed.

use crate::error::CoreError;
use rookery_db::identities::{self, IdentityRow};
use rookery_models::identity::FederatedIdentity;
use rookery_util::validation::{validate_domain, validate_username};
use sqlx::AnyConnection;
use std::time::Duration;

type HandleKey = (String, String);

/// How long a freshly created proxy stays out of the cache.
const PROXY_SETTLE: Duration = Duration::from_secs(60);

pub struct IdentityResolver {
    local_domain: String,
    worker_id: u16,
    cache: moka::future::Cache<HandleKey, FederatedIdentity>,
    /// Proxies this resolver inserted that may not be committed yet.
    unsettled: moka::future::Cache<HandleKey, i64>,
}

pub(crate) fn identity_from_row(row: IdentityRow) -> FederatedIdentity {
    FederatedIdentity {
        id: row.id,
        username: row.username,
        domain: row.domain,
    }
}

/// Split `user:domain` or `@user:domain` into its parts. The domain is
/// lower-cased; it may carry a port.
pub fn parse_handle(handle: &str) -> Result<(String, String), CoreError> {
    let trimmed = handle.trim();
    let bare = trimmed.strip_prefix('@').unwrap_or(trimmed);
    let (username, domain) = bare
        .split_once(':')
        .ok_or_else(|| CoreError::InvalidHandleFormat(handle.to_string()))?;
    let domain = domain.to_ascii_lowercase();
    validate_username(username).map_err(|_| CoreError::InvalidHandleFormat(handle.to_string()))?;
    validate_domain(&domain).map_err(|_| CoreError::InvalidHandleFormat(handle.to_string()))?;
    Ok((username.to_string(), domain))
}

impl IdentityResolver {
    pub fn new(local_domain: impl Into<String>, worker_id: u16) -> Self {
        Self {
            local_domain: local_domain.into().to_ascii_lowercase(),
            worker_id,
            cache: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(600))
                .build(),
            unsettled: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(PROXY_SETTLE)
                .build(),
        }
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    /// Bare on the identity's home server, `user:domain` elsewhere.
    pub fn display_name(&self, identity: &FederatedIdentity) -> String {
        identity.display_for(&self.local_domain)
    }

    /// Resolve a fully qualified handle. Unknown remote handles get a proxy
    /// identity; unknown local ones are an error.
    pub async fn resolve(
        &self,
        conn: &mut AnyConnection,
        handle: &str,
    ) -> Result<FederatedIdentity, CoreError> {
        let (username, domain) = parse_handle(handle)?;
        let key = (username, domain);
        if let Some(identity) = self.cache.get(&key).await {
            return Ok(identity);
        }
        let (username, domain) = &key;

        if let Some(row) = identities::get_identity_by_handle(&mut *conn, username, domain).await? {
            let identity = identity_from_row(row);
            self.remember(&key, &identity).await;
            return Ok(identity);
        }
        if *domain == self.local_domain {
            return Err(CoreError::UnknownIdentity(format!("{username}:{domain}")));
        }

        let id = rookery_util::snowflake::generate(self.worker_id);
        let now = crate::now_ms();
        if identities::insert_identity_if_absent(&mut *conn, id, username, domain, now).await? {
            tracing::debug!(handle = %format!("{username}:{domain}"), "identity: created remote proxy");
            self.unsettled.insert(key.clone(), id).await;
        }
        // Someone else may have won the insert; read back whichever row exists.
        let row = identities::get_identity_by_handle(&mut *conn, username, domain)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("proxy for {username}:{domain} vanished")))?;
        let identity = identity_from_row(row);
        self.remember(&key, &identity).await;
        Ok(identity)
    }

    /// Cache a row unless it is a proxy this resolver created whose
    /// transaction may not have committed.
    async fn remember(&self, key: &HandleKey, identity: &FederatedIdentity) {
        if self.unsettled.get(key).await == Some(identity.id) {
            return;
        }
        self.cache.insert(key.clone(), identity.clone()).await;
    }

    /// Resolve a username typed without a domain. When several servers have
    /// a user by that name, the one already in `room` wins.
    pub async fn resolve_bare_username(
        &self,
        conn: &mut AnyConnection,
        username: &str,
        room: Option<i64>,
    ) -> Result<FederatedIdentity, CoreError> {
        let username = username.trim().trim_start_matches('@');
        validate_username(username)
            .map_err(|_| CoreError::InvalidHandleFormat(username.to_string()))?;

        let mut candidates: Vec<FederatedIdentity> =
            identities::list_identities_by_username(&mut *conn, username)
                .await?
                .into_iter()
                .map(identity_from_row)
                .collect();
        match candidates.len() {
            0 => return Err(CoreError::UnknownIdentity(username.to_string())),
            1 => return Ok(candidates.remove(0)),
            _ => {}
        }

        if let Some(room_id) = room {
            let mut in_room = Vec::new();
            for candidate in &candidates {
                if rookery_db::members::get_member(&mut *conn, room_id, candidate.id)
                    .await?
                    .is_some()
                {
                    in_room.push(candidate.clone());
                }
            }
            if in_room.len() == 1 {
                return Ok(in_room.remove(0));
            }
        }

        Err(CoreError::AmbiguousIdentity {
            username: username.to_string(),
            candidates: candidates.iter().map(FederatedIdentity::handle).collect(),
        })
    }

    /// Qualified handles go through [`resolve`](Self::resolve), bare names
    /// through [`resolve_bare_username`](Self::resolve_bare_username).
    pub async fn resolve_any(
        &self,
        conn: &mut AnyConnection,
        handle: &str,
        room: Option<i64>,
    ) -> Result<FederatedIdentity, CoreError> {
        if handle.contains(':') {
            self.resolve(conn, handle).await
        } else {
            self.resolve_bare_username(conn, handle, room).await
        }
    }

    /// Provision an account homed on this server.
    pub async fn register_local(
        &self,
        conn: &mut AnyConnection,
        username: &str,
    ) -> Result<FederatedIdentity, CoreError> {
        validate_username(username)
            .map_err(|e| CoreError::BadRequest(format!("invalid username: {e}")))?;
        let id = rookery_util::snowflake::generate(self.worker_id);
        let inserted = identities::insert_identity_if_absent(
            &mut *conn,
            id,
            username,
            &self.local_domain,
            crate::now_ms(),
        )
        .await?;
        if !inserted {
            return Err(CoreError::BadRequest(format!(
                "username '{username}' is already registered"
            )));
        }
        tracing::info!(username, "identity: registered local user");
        Ok(FederatedIdentity {
            id,
            username: username.to_string(),
            domain: self.local_domain.clone(),
        })
    }

    pub async fn get(
        &self,
        conn: &mut AnyConnection,
        id: i64,
    ) -> Result<FederatedIdentity, CoreError> {
        identities::get_identity(&mut *conn, id)
            .await?
            .map(identity_from_row)
            .ok_or_else(|| CoreError::UnknownIdentity(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (rookery_db::DbPool, IdentityResolver) {
        let pool = rookery_db::create_pool("sqlite::memory:", 1)
            .await
            .expect("pool");
        rookery_db::run_migrations(&pool).await.expect("migrations");
        (pool, IdentityResolver::new("s1.example", 1))
    }

    #[test]
    fn handles_parse_with_or_without_sigil() {
        assert_eq!(
            parse_handle("@bob:S2.example").expect("matrix id"),
            ("bob".to_string(), "s2.example".to_string())
        );
        assert_eq!(
            parse_handle("bob:localhost:8448").expect("port"),
            ("bob".to_string(), "localhost:8448".to_string())
        );
        for bad in ["bob", "bob:", ":s2.example", "b@b:s2.example", "bob:s2 example"] {
            assert!(
                matches!(parse_handle(bad), Err(CoreError::InvalidHandleFormat(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn remote_handles_get_one_proxy() {
        let (pool, resolver) = setup().await;
        let mut conn = pool.acquire().await.expect("conn");
        let first = resolver.resolve(&mut conn, "bob:s2.example").await.expect("resolve");
        let second = resolver
            .resolve(&mut conn, "@bob:s2.example")
            .await
            .expect("resolve again");
        assert_eq!(first, second);
        assert_eq!(resolver.display_name(&first), "bob:s2.example");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM identities")
            .fetch_one(&mut *conn)
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rolled_back_proxy_is_not_served_from_cache() {
        let (pool, resolver) = setup().await;
        let mut tx = pool.begin().await.expect("begin");
        let doomed = resolver.resolve(&mut tx, "dave:s9.example").await.expect("proxy");
        // A second lookup in the same transaction reads the uncommitted row.
        let again = resolver.resolve(&mut tx, "dave:s9.example").await.expect("again");
        assert_eq!(doomed, again);
        tx.rollback().await.expect("rollback");

        let mut conn = pool.acquire().await.expect("conn");
        let dave = resolver.resolve(&mut conn, "dave:s9.example").await.expect("resolve");
        let stored = identities::get_identity(&mut *conn, dave.id)
            .await
            .expect("get")
            .expect("proxy row exists");
        assert_eq!(stored.username, "dave");
        assert_eq!(stored.domain, "s9.example");
    }

    #[tokio::test]
    async fn unknown_local_user_is_not_invented() {
        let (pool, resolver) = setup().await;
        let mut conn = pool.acquire().await.expect("conn");
        assert!(matches!(
            resolver.resolve(&mut conn, "ghost:s1.example").await,
            Err(CoreError::UnknownIdentity(_))
        ));
        let alice = resolver.register_local(&mut conn, "alice").await.expect("register");
        assert_eq!(resolver.display_name(&alice), "alice");
        assert_eq!(
            resolver.resolve(&mut conn, "alice:s1.example").await.expect("resolve"),
            alice
        );
        assert!(matches!(
            resolver.register_local(&mut conn, "alice").await,
            Err(CoreError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn bare_usernames_need_a_unique_match() {
        let (pool, resolver) = setup().await;
        let mut conn = pool.acquire().await.expect("conn");
        assert!(matches!(
            resolver.resolve_bare_username(&mut conn, "bob", None).await,
            Err(CoreError::UnknownIdentity(_))
        ));

        let remote = resolver.resolve(&mut conn, "bob:s2.example").await.expect("proxy");
        assert_eq!(
            resolver
                .resolve_any(&mut conn, "bob", None)
                .await
                .expect("single candidate"),
            remote
        );

        resolver.resolve(&mut conn, "bob:s3.example").await.expect("second proxy");
        match resolver.resolve_bare_username(&mut conn, "bob", None).await {
            Err(CoreError::AmbiguousIdentity { candidates, .. }) => {
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }
}
