use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use ed25519_dalek::SigningKey;
use futures_util::StreamExt;
use rookery_core::{AppConfig, AppState};
use rookery_federation::client::FederationClient;
use rookery_federation::queue::DeliverySettings;
use rookery_federation::{FederationConfig, FederationEnvelope, FederationService};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

const KEY_ID: &str = "ed25519:test";

struct TestHarness {
    app: Router,
    state: AppState,
}

impl TestHarness {
    async fn new(domain: &str, seed: u8) -> anyhow::Result<Self> {
        let db = rookery_db::create_pool("sqlite::memory:", 1).await?;
        rookery_db::run_migrations(&db).await?;
        let mut config = AppConfig::new(domain, "integration-test-secret");
        config.public_url = Some(format!("https://{domain}"));
        config.worker_id = u16::from(seed);
        let federation = FederationService::new(FederationConfig {
            enabled: true,
            server_name: domain.to_string(),
            key_id: KEY_ID.to_string(),
            signing_key: Some(SigningKey::from_bytes(&[seed; 32])),
            allow_discovery: false,
        });
        let state = AppState::new(
            db,
            config,
            federation,
            Arc::new(FederationClient::new()?),
            DeliverySettings::default(),
        );
        let app = rookery_api::build_router().with_state(state.clone());
        Ok(Self { app, state })
    }

    async fn trust(&self, peer: &TestHarness) -> anyhow::Result<()> {
        let public_key = peer
            .state
            .federation
            .signing_public_key()
            .ok_or_else(|| anyhow::anyhow!("peer has no key"))?;
        rookery_core::propagation::register_peer(
            &self.state,
            peer.state.local_domain(),
            &format!("https://{}/_rookery/federation/v1", peer.state.local_domain()),
            Some(&public_key),
            Some(KEY_ID),
        )
        .await?;
        Ok(())
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, Value)> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };
        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let payload = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body)
                .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(&body) }))
        };
        Ok((status, payload))
    }

    /// Create a local user and return its token.
    async fn register(&self, username: &str) -> anyhow::Result<String> {
        let (status, body) = self
            .request(
                Method::POST,
                "/api/v1/users",
                None,
                Some(json!({ "username": username })),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        Ok(body["token"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("no token in {body}"))?
            .to_string())
    }

    async fn queued(&self) -> anyhow::Result<Vec<FederationEnvelope>> {
        let mut envelopes = Vec::new();
        for row in rookery_db::federation::list_outbound_events(&self.state.db).await? {
            envelopes.push(serde_json::from_str::<FederationEnvelope>(&row.envelope)?);
        }
        envelopes.sort_by_key(|envelope| envelope.event.sequence);
        Ok(envelopes)
    }
}

#[tokio::test]
async fn room_routes_require_a_token() -> anyhow::Result<()> {
    let harness = TestHarness::new("s1.example", 1).await?;
    let (status, _) = harness
        .request(Method::GET, "/api/v1/rooms", None, None)
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = harness
        .request(Method::GET, "/api/v1/rooms", Some("not-a-token"), None)
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = harness.register("alice").await?;
    let (status, body) = harness
        .request(Method::GET, "/api/v1/users/@me", Some(&token), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["handle"], "alice:s1.example");

    let (status, body) = harness
        .request(
            Method::POST,
            "/api/v1/users",
            None,
            Some(json!({ "username": "alice" })),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
    Ok(())
}

#[tokio::test]
async fn owner_manages_a_local_room() -> anyhow::Result<()> {
    let harness = TestHarness::new("s1.example", 1).await?;
    let alice = harness.register("alice").await?;
    let carol = harness.register("carol").await?;

    let (status, room) = harness
        .request(
            Method::POST,
            "/api/v1/rooms",
            Some(&alice),
            Some(json!({ "name": "general", "invitees": ["carol"] })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED, "{room}");
    assert_eq!(room["kind"], "public");
    assert_eq!(room["is_federated"], false);
    assert_eq!(room["capabilities"], json!({ "calls": true, "threads": true, "discussions": true }));
    assert_eq!(room["invite"]["added"][0]["display"], "carol");
    let room_id = room["room_id"].as_str().unwrap_or_default().to_string();

    let (status, members) = harness
        .request(
            Method::GET,
            &format!("/api/v1/rooms/{room_id}/members"),
            Some(&carol),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(members.as_array().map(Vec::len), Some(2));

    let (status, body) = harness
        .request(
            Method::PATCH,
            &format!("/api/v1/rooms/{room_id}"),
            Some(&carol),
            Some(json!({ "name": "mine" })),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (status, body) = harness
        .request(
            Method::PATCH,
            &format!("/api/v1/rooms/{room_id}"),
            Some(&alice),
            Some(json!({ "name": "plans", "topic": "q3" })),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["name"], "plans");
    assert_eq!(body["event_ids"].as_array().map(Vec::len), Some(2));

    let (status, body) = harness
        .request(
            Method::POST,
            &format!("/api/v1/rooms/{room_id}/members"),
            Some(&alice),
            Some(json!({ "handles": ["bob:"] })),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_handle");

    let (status, body) = harness
        .request(
            Method::POST,
            &format!("/api/v1/rooms/{room_id}/members"),
            Some(&alice),
            Some(json!({ "handles": ["nobody"] })),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "unknown_identity");

    let (status, body) = harness
        .request(
            Method::POST,
            &format!("/api/v1/rooms/{room_id}/leave"),
            Some(&carol),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body["event_id"].is_string());

    let (status, messages) = harness
        .request(
            Method::GET,
            &format!("/api/v1/rooms/{room_id}/messages"),
            Some(&alice),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let texts: Vec<&str> = messages
        .as_array()
        .map(|items| items.iter().filter_map(|m| m["text"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(
        texts,
        vec![
            "added carol",
            "changed room name to plans",
            "changed room topic to q3",
            "left the channel",
        ]
    );

    let (status, _) = harness
        .request(
            Method::DELETE,
            &format!("/api/v1/rooms/{room_id}"),
            Some(&alice),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = harness
        .request(
            Method::GET,
            &format!("/api/v1/rooms/{room_id}"),
            Some(&alice),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
    Ok(())
}

#[tokio::test]
async fn private_rooms_are_hidden_from_non_members() -> anyhow::Result<()> {
    let harness = TestHarness::new("s1.example", 1).await?;
    let alice = harness.register("alice").await?;
    let dave = harness.register("dave").await?;
    let (_, room) = harness
        .request(
            Method::POST,
            "/api/v1/rooms",
            Some(&alice),
            Some(json!({ "name": "ops", "kind": "private" })),
        )
        .await?;
    let room_id = room["room_id"].as_str().unwrap_or_default().to_string();

    let (status, _) = harness
        .request(
            Method::GET,
            &format!("/api/v1/rooms/{room_id}/members"),
            Some(&dave),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, rooms) = harness
        .request(Method::GET, "/api/v1/rooms", Some(&alice), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rooms.as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn room_event_stream_carries_member_changes() -> anyhow::Result<()> {
    let harness = TestHarness::new("s1.example", 1).await?;
    let alice = harness.register("alice").await?;
    let carol = harness.register("carol").await?;
    let dave = harness.register("dave").await?;
    let (_, room) = harness
        .request(
            Method::POST,
            "/api/v1/rooms",
            Some(&alice),
            Some(json!({ "name": "ops", "kind": "private", "invitees": ["carol"] })),
        )
        .await?;
    let room_id = room["room_id"].as_str().unwrap_or_default().to_string();
    let events_uri = format!("/api/v1/rooms/{room_id}/events");

    let (status, _) = harness
        .request(Method::GET, &events_uri, Some(&dave), None)
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::builder()
        .method(Method::GET)
        .uri(&events_uri)
        .header(header::AUTHORIZATION, format!("Bearer {carol}"))
        .body(Body::empty())?;
    let response = harness.app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");

    let (status, _) = harness
        .request(
            Method::DELETE,
            &format!("/api/v1/rooms/{room_id}/members/carol"),
            Some(&alice),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    // Carol can no longer see the private room, so her stream ends after
    // the removal itself.
    let mut frames = response.into_body().into_data_stream();
    let mut text = String::new();
    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(5), frames.next()).await? {
        text.push_str(std::str::from_utf8(&chunk?)?);
    }
    let message = text
        .find("SYSTEM_MESSAGE_CREATE")
        .ok_or_else(|| anyhow::anyhow!("no system message in {text}"))?;
    let removal = text
        .find("ROOM_MEMBER_REMOVE")
        .ok_or_else(|| anyhow::anyhow!("no removal in {text}"))?;
    assert!(message < removal);
    assert!(text.contains("removed carol"));
    Ok(())
}

#[tokio::test]
async fn federation_ingest_acknowledges_and_orders_events() -> anyhow::Result<()> {
    let s1 = TestHarness::new("s1.example", 1).await?;
    let s2 = TestHarness::new("s2.example", 2).await?;
    s1.trust(&s2).await?;
    s2.trust(&s1).await?;
    let bob = s1.register("bob").await?;
    let alice = s2.register("alice").await?;

    let (status, room) = s2
        .request(
            Method::POST,
            "/api/v1/rooms",
            Some(&alice),
            Some(json!({ "name": "general", "federated": true, "invitees": ["bob:s1.example"] })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED, "{room}");
    assert_eq!(room["capabilities"], json!({ "calls": false, "threads": false, "discussions": false }));
    let room_id = room["room_id"].as_str().unwrap_or_default().to_string();
    s2.request(
        Method::PATCH,
        &format!("/api/v1/rooms/{room_id}"),
        Some(&alice),
        Some(json!({ "name": "plans" })),
    )
    .await?;
    s2.request(
        Method::PATCH,
        &format!("/api/v1/rooms/{room_id}"),
        Some(&alice),
        Some(json!({ "topic": "q3" })),
    )
    .await?;
    let queued = s2.queued().await?;
    assert_eq!(queued.len(), 3);

    let ingest = "/_rookery/federation/v1/event";
    let (status, _) = s1
        .request(Method::POST, ingest, None, Some(json!(queued[2])))
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = s1
        .request(Method::POST, ingest, None, Some(json!(queued[0])))
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["inserted"], true);
    assert_eq!(body["event_id"], queued[0].event.event_id);

    let (status, body) = s1
        .request(Method::POST, ingest, None, Some(json!(queued[0])))
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["inserted"], false);

    let (status, _) = s1
        .request(Method::POST, ingest, None, Some(json!(queued[1])))
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, view) = s1
        .request(Method::GET, &format!("/api/v1/rooms/{room_id}"), Some(&bob), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["name"], "plans");
    assert_eq!(view["topic"], "q3");
    assert_eq!(view["owner"], "alice:s2.example");

    let mut forged = queued[1].clone();
    forged.event.name = Some("evil".to_string());
    forged.event.sequence = 4;
    let (status, body) = s1
        .request(Method::POST, ingest, None, Some(json!(forged)))
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN, "{body}");
    Ok(())
}

#[tokio::test]
async fn unknown_servers_are_refused() -> anyhow::Result<()> {
    let s1 = TestHarness::new("s1.example", 1).await?;
    let s3 = TestHarness::new("s3.example", 3).await?;
    s3.trust(&s1).await?;
    s1.register("bob").await?;
    let carol = s3.register("carol").await?;
    s3.request(
        Method::POST,
        "/api/v1/rooms",
        Some(&carol),
        Some(json!({ "name": "general", "federated": true, "invitees": ["bob:s1.example"] })),
    )
    .await?;
    let queued = s3.queued().await?;

    let (status, body) = s1
        .request(
            Method::POST,
            "/_rookery/federation/v1/event",
            None,
            Some(json!(queued[0])),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
    Ok(())
}

#[tokio::test]
async fn discovery_publishes_the_signing_key() -> anyhow::Result<()> {
    let harness = TestHarness::new("s1.example", 1).await?;
    let (status, info) = harness
        .request(Method::GET, "/.well-known/rookery/server", None, None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["server_name"], "s1.example");
    assert_eq!(
        info["federation_endpoint"],
        "https://s1.example/_rookery/federation/v1"
    );
    assert_eq!(info["key_id"], KEY_ID);

    let (status, keys) = harness
        .request(Method::GET, "/_rookery/federation/v1/keys", None, None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(keys["keys"][0]["public_key"], info["public_key"]);
    Ok(())
}
