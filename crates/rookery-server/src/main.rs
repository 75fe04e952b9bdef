use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ed25519_dalek::SigningKey;
use rookery_core::{AppConfig, AppState};
use rookery_federation::client::FederationClient;
use rookery_federation::{FederationService, FederationTransport};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

const DEDUPE_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    init_tracing(args.json_logs);

    let config = config::Config::load(&args.config)?;
    ensure_data_dirs(&config);

    let db = rookery_db::create_pool(&config.database.url, config.database.max_connections).await?;
    rookery_db::run_migrations(&db).await?;

    let server_name = config.server.server_name.trim().to_ascii_lowercase();
    let signing_key = if config.federation.enabled {
        Some(load_signing_key(&config.federation, &db).await?)
    } else {
        None
    };
    let federation = FederationService::new(rookery_federation::FederationConfig {
        enabled: config.federation.enabled,
        server_name: server_name.clone(),
        key_id: config.federation.key_id.clone(),
        signing_key,
        allow_discovery: config.federation.allow_discovery,
    });

    let client = Arc::new(FederationClient::with_origin(server_name.clone())?);
    let transport: Arc<dyn FederationTransport> = client.clone();

    let mut app_config = AppConfig::new(server_name, config.auth.jwt_secret.clone());
    app_config.public_url = config.server.public_url.clone();
    app_config.jwt_expiry_seconds = config.auth.jwt_expiry_seconds;
    app_config.worker_id = config.server.worker_id;
    app_config.capability_defaults = config.rooms.capabilities();
    app_config.dedupe_window_ms = config.propagation.dedupe_window_ms;
    app_config.reorder_capacity = config.propagation.reorder_capacity;

    let state = AppState::new(
        db,
        app_config,
        federation,
        transport,
        config.propagation.delivery_settings(),
    );

    if state.federation.is_enabled() {
        register_peers(&state, &client, &config.federation.peers).await;
    }

    // ── Background workers ───────────────────────────────────────────────────
    let workers = CancellationToken::new();
    let worker_interval = Duration::from_millis(config.propagation.worker_interval_ms);
    let delivery = tokio::spawn(state.outbound.clone().run(worker_interval, workers.clone()));
    let resync = tokio::spawn(rookery_core::propagation::run_resync_worker(
        state.clone(),
        worker_interval,
        workers.clone(),
    ));
    let pruner = tokio::spawn(prune_dedupe_loop(state.clone(), workers.clone()));

    let app = rookery_api::build_router().with_state(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;

    print_startup_banner(
        &config.server.bind_address,
        state.local_domain(),
        &config.server.public_url,
        &config.database.url,
        state.federation.is_enabled(),
    );

    let shutdown_notify = state.shutdown.clone();
    let shutdown_signal = {
        let workers = workers.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    tracing::info!("Shutting down (ctrl-c)...");
                }
                _ = shutdown_notify.notified() => {
                    tracing::info!("Shutting down (requested)...");
                }
            }
            workers.cancel();
        }
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    workers.cancel();
    let _ = delivery.await;
    let _ = resync.await;
    let _ = pruner.await;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rookery=info,tower_http=debug"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Ensure the SQLite database directory exists before connecting.
fn ensure_data_dirs(config: &config::Config) {
    if let Some(db_path) = config
        .database
        .url
        .strip_prefix("sqlite://")
        .and_then(|s| s.split('?').next())
    {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!("Could not create directory '{}': {}", parent.display(), e);
                }
            }
        }
    }
}

/// Read the signing seed from `signing_key_path`, creating the file on first
/// start. Without a path the keypair is kept in the database.
async fn load_signing_key(
    federation: &config::FederationConfig,
    db: &rookery_db::DbPool,
) -> Result<SigningKey> {
    let Some(path) = federation.signing_key_path.as_deref() else {
        return Ok(rookery_federation::load_or_generate_signing_key(db, &federation.key_id).await?);
    };

    if std::path::Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading federation signing key '{path}'"))?;
        let seed: [u8; 32] = rookery_federation::hex_decode(contents.trim())
            .and_then(|bytes| bytes.try_into().ok())
            .with_context(|| format!("'{path}' does not hold a 32-byte hex seed"))?;
        return Ok(SigningKey::from_bytes(&seed));
    }

    let seed: [u8; 32] = rand::random();
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, rookery_federation::hex_encode(&seed))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    tracing::info!(path, "federation: generated new signing key");
    Ok(SigningKey::from_bytes(&seed))
}

/// Record the configured peers, filling in endpoints and keys through
/// discovery where allowed. A peer that cannot be reached is skipped and
/// picked up again on the next start.
async fn register_peers(state: &AppState, client: &FederationClient, peers: &[config::PeerConfig]) {
    for peer in peers {
        match resolve_peer(state, client, peer).await {
            Ok((endpoint, key_id, public_key)) => {
                if let Err(e) = rookery_core::propagation::register_peer(
                    state,
                    &peer.server_name,
                    &endpoint,
                    Some(&public_key),
                    Some(&key_id),
                )
                .await
                {
                    tracing::warn!(peer = %peer.server_name, "federation: could not store peer: {e}");
                }
            }
            Err(e) => {
                tracing::warn!(peer = %peer.server_name, "federation: peer skipped: {e:#}");
            }
        }
    }
}

async fn resolve_peer(
    state: &AppState,
    client: &FederationClient,
    peer: &config::PeerConfig,
) -> Result<(String, String, String)> {
    let configured_key_id = peer.key_id.clone();
    if let (Some(endpoint), Some(public_key)) = (&peer.federation_endpoint, &peer.public_key) {
        let key_id = configured_key_id.unwrap_or_else(|| "ed25519:auto".to_string());
        return Ok((endpoint.clone(), key_id, public_key.clone()));
    }
    if !state.federation.allow_discovery() {
        anyhow::bail!("discovery is disabled and the peer has no pinned endpoint and key");
    }

    let endpoint = match (&peer.federation_endpoint, &peer.base_url) {
        (Some(endpoint), _) => endpoint.clone(),
        (None, Some(base_url)) => {
            let info = client.fetch_server_info(base_url).await?;
            if !info.server_name.eq_ignore_ascii_case(&peer.server_name) {
                anyhow::bail!(
                    "'{}' identifies itself as '{}'",
                    base_url,
                    info.server_name
                );
            }
            absolute_endpoint(base_url, &info.federation_endpoint)
        }
        (None, None) => anyhow::bail!("no base_url or federation_endpoint"),
    };

    if let Some(public_key) = &peer.public_key {
        let key_id = configured_key_id.unwrap_or_else(|| "ed25519:auto".to_string());
        return Ok((endpoint, key_id, public_key.clone()));
    }

    let keys = client.fetch_server_keys(&endpoint).await?;
    let key = keys
        .keys
        .into_iter()
        .find(|key| {
            configured_key_id
                .as_deref()
                .is_none_or(|wanted| key.key_id == wanted)
        })
        .context("peer published no matching signing key")?;
    Ok((endpoint, key.key_id, key.public_key))
}

/// Discovery may advertise the endpoint relative to the peer's base URL.
fn absolute_endpoint(base_url: &str, advertised: &str) -> String {
    if advertised.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), advertised)
    } else {
        advertised.to_string()
    }
}

async fn prune_dedupe_loop(state: AppState, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(DEDUPE_PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = rookery_core::propagation::prune_dedupe_set(&state, rookery_core::now_ms()).await {
            tracing::warn!("propagation: dedupe prune failed: {e}");
        }
    }
}

fn print_startup_banner(
    bind_address: &str,
    server_name: &str,
    public_url: &Option<String>,
    db_url: &str,
    federation_enabled: bool,
) {
    println!();
    println!("  rookery {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  Listening:   http://{}", bind_address);
    println!("  Domain:      {}", server_name);
    if let Some(url) = public_url {
        println!("  Public URL:  {}", url);
    }
    println!("  Database:    {}", db_url);
    println!(
        "  Federation:  {}",
        if federation_enabled { "Enabled" } else { "Disabled" }
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::absolute_endpoint;

    #[test]
    fn relative_endpoints_are_joined_to_the_base_url() {
        assert_eq!(
            absolute_endpoint("https://s2.example/", "/_rookery/federation/v1"),
            "https://s2.example/_rookery/federation/v1"
        );
        assert_eq!(
            absolute_endpoint("https://s2.example", "https://fed.s2.example/v1"),
            "https://fed.s2.example/v1"
        );
    }
}
