use anyhow::Result;
use rand::Rng;
use rookery_federation::queue::DeliverySettings;
use rookery_models::capabilities::RoomCapabilities;
use serde::{Deserialize, Serialize};
use std::fs;

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub propagation: PropagationConfig,
    #[serde(default)]
    pub rooms: RoomsConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Domain this server is authoritative for.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Public URL of this server (e.g., https://rooms.example.com).
    /// Advertised to peers through discovery.
    pub public_url: Option<String>,
    #[serde(default = "default_worker_id")]
    pub worker_id: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
            server_name: default_server_name(),
            public_url: None,
            worker_id: default_worker_id(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/rookery.db?mode=rwc".into(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
            jwt_expiry_seconds: default_jwt_expiry(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FederationConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "default_key_id")]
    pub key_id: String,
    /// Hex-encoded ed25519 seed. When unset the key lives in the database.
    #[serde(default)]
    pub signing_key_path: Option<String>,
    /// Fetch missing peer endpoints and keys over `.well-known` at startup.
    #[serde(default = "default_true")]
    pub allow_discovery: bool,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_id: default_key_id(),
            signing_key_path: None,
            allow_discovery: true,
            peers: Vec::new(),
        }
    }
}

/// A server this one exchanges room events with.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    pub server_name: String,
    /// Base URL used for discovery, e.g. https://rooms.example.org
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub federation_endpoint: Option<String>,
    /// Hex-encoded ed25519 public key.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PropagationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: i64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: i64,
    #[serde(default = "default_worker_interval_ms")]
    pub worker_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_dedupe_window_ms")]
    pub dedupe_window_ms: i64,
    #[serde(default = "default_reorder_capacity")]
    pub reorder_capacity: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            worker_interval_ms: default_worker_interval_ms(),
            batch_size: default_batch_size(),
            dedupe_window_ms: default_dedupe_window_ms(),
            reorder_capacity: default_reorder_capacity(),
        }
    }
}

impl PropagationConfig {
    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            max_attempts: self.max_attempts.max(1),
            base_backoff_ms: self.base_backoff_ms.max(1),
            max_backoff_ms: self.max_backoff_ms.max(self.base_backoff_ms),
            batch_size: self.batch_size.max(1),
        }
    }
}

/// Features offered in rooms that are not federated. Federated rooms never
/// get them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoomsConfig {
    #[serde(default = "default_true")]
    pub calls: bool,
    #[serde(default = "default_true")]
    pub threads: bool,
    #[serde(default = "default_true")]
    pub discussions: bool,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            calls: true,
            threads: true,
            discussions: true,
        }
    }
}

impl RoomsConfig {
    pub fn capabilities(&self) -> RoomCapabilities {
        let mut caps = RoomCapabilities::empty();
        caps.set(RoomCapabilities::CALLS, self.calls);
        caps.set(RoomCapabilities::THREADS, self.threads);
        caps.set(RoomCapabilities::DISCUSSIONS, self.discussions);
        caps
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_server_name() -> String {
    "localhost".into()
}
fn default_worker_id() -> u16 {
    1
}
fn default_max_connections() -> u32 {
    20
}
fn default_jwt_expiry() -> u64 {
    7 * 24 * 3600
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_key_id() -> String {
    "ed25519:auto".into()
}
fn default_max_attempts() -> i64 {
    12
}
fn default_base_backoff_ms() -> i64 {
    5_000
}
fn default_max_backoff_ms() -> i64 {
    3_600_000
}
fn default_worker_interval_ms() -> u64 {
    1_000
}
fn default_batch_size() -> i64 {
    100
}
fn default_dedupe_window_ms() -> i64 {
    7 * 24 * 3_600_000
}
fn default_reorder_capacity() -> usize {
    1024
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.starts_with("example")
        || normalized == "secret"
}

fn validate_configuration(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters) and never leave placeholder values"
        );
    }
    if config.server.server_name.trim().is_empty() || config.server.server_name.contains(':') {
        anyhow::bail!(
            "Invalid server.server_name '{}': expected a bare domain",
            config.server.server_name
        );
    }
    for peer in &config.federation.peers {
        if peer.base_url.is_none() && peer.federation_endpoint.is_none() {
            anyhow::bail!(
                "Federation peer '{}' needs a base_url or a federation_endpoint",
                peer.server_name
            );
        }
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Rookery Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"
# Domain users of this server are homed on, e.g. alice:{server_name}
server_name = "{server_name}"
worker_id = {worker_id}
# Advertised to peers; set explicitly for internet-facing deployments:
# public_url = "https://rooms.example.com"

[database]
url = "{db_url}"
max_connections = {max_connections}

[auth]
jwt_secret = "{jwt_secret}"
jwt_expiry_seconds = {jwt_expiry}

[federation]
enabled = {federation_enabled}
key_id = "{key_id}"
# signing_key_path = "./data/federation.key"
allow_discovery = {allow_discovery}

# [[federation.peers]]
# server_name = "rooms.example.org"
# base_url = "https://rooms.example.org"
# # Skip discovery by pinning the endpoint and key:
# # federation_endpoint = "https://rooms.example.org/_rookery/federation/v1"
# # public_key = "<64 hex chars>"

[propagation]
max_attempts = {max_attempts}
base_backoff_ms = {base_backoff_ms}
max_backoff_ms = {max_backoff_ms}
worker_interval_ms = {worker_interval_ms}
batch_size = {batch_size}
dedupe_window_ms = {dedupe_window_ms}
reorder_capacity = {reorder_capacity}

[rooms]
# Features offered in non-federated rooms.
calls = {calls}
threads = {threads}
discussions = {discussions}
"#,
        bind_address = config.server.bind_address,
        server_name = config.server.server_name,
        worker_id = config.server.worker_id,
        db_url = config.database.url,
        max_connections = config.database.max_connections,
        jwt_secret = config.auth.jwt_secret,
        jwt_expiry = config.auth.jwt_expiry_seconds,
        federation_enabled = config.federation.enabled,
        key_id = config.federation.key_id,
        allow_discovery = config.federation.allow_discovery,
        max_attempts = config.propagation.max_attempts,
        base_backoff_ms = config.propagation.base_backoff_ms,
        max_backoff_ms = config.propagation.max_backoff_ms,
        worker_interval_ms = config.propagation.worker_interval_ms,
        batch_size = config.propagation.batch_size,
        dedupe_window_ms = config.propagation.dedupe_window_ms,
        reorder_capacity = config.propagation.reorder_capacity,
        calls = config.rooms.calls,
        threads = config.rooms.threads,
        discussions = config.rooms.discussions,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!(
                "Config file not found at '{}', generating defaults...",
                path
            );
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            let template = generate_config_template(&config);
            fs::write(path, &template)?;
            let _ = harden_secret_file_permissions(path);
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        // Environment variable overrides
        if let Ok(value) = std::env::var("ROOKERY_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("ROOKERY_SERVER_NAME") {
            config.server.server_name = value;
        }
        if let Ok(value) = std::env::var("ROOKERY_PUBLIC_URL") {
            config.server.public_url = Some(value);
        }
        if let Ok(value) = std::env::var("ROOKERY_WORKER_ID") {
            if let Ok(parsed) = value.parse::<u16>() {
                config.server.worker_id = parsed;
            }
        }
        if let Ok(value) = std::env::var("ROOKERY_DATABASE_URL") {
            config.database.url = value;
        }
        if let Ok(value) = std::env::var("ROOKERY_DATABASE_MAX_CONNECTIONS") {
            if let Ok(parsed) = value.parse::<u32>() {
                config.database.max_connections = parsed;
            }
        }
        if let Ok(value) = std::env::var("ROOKERY_JWT_SECRET") {
            config.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("ROOKERY_JWT_EXPIRY_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.auth.jwt_expiry_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("ROOKERY_FEDERATION_ENABLED") {
            if let Ok(parsed) = value.parse::<bool>() {
                config.federation.enabled = parsed;
            }
        }
        if let Ok(value) = std::env::var("ROOKERY_FEDERATION_KEY_ID") {
            if !value.trim().is_empty() {
                config.federation.key_id = value;
            }
        }
        if let Ok(value) = std::env::var("ROOKERY_FEDERATION_SIGNING_KEY_PATH") {
            config.federation.signing_key_path = if value.trim().is_empty() {
                None
            } else {
                Some(value)
            };
        }
        if let Ok(value) = std::env::var("ROOKERY_FEDERATION_ALLOW_DISCOVERY") {
            if let Ok(parsed) = value.parse::<bool>() {
                config.federation.allow_discovery = parsed;
            }
        }
        if let Ok(value) = std::env::var("ROOKERY_PROPAGATION_MAX_ATTEMPTS") {
            if let Ok(parsed) = value.parse::<i64>() {
                config.propagation.max_attempts = parsed.clamp(1, 1000);
            }
        }
        if let Ok(value) = std::env::var("ROOKERY_PROPAGATION_BASE_BACKOFF_MS") {
            if let Ok(parsed) = value.parse::<i64>() {
                config.propagation.base_backoff_ms = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("ROOKERY_PROPAGATION_MAX_BACKOFF_MS") {
            if let Ok(parsed) = value.parse::<i64>() {
                config.propagation.max_backoff_ms = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("ROOKERY_PROPAGATION_WORKER_INTERVAL_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.propagation.worker_interval_ms = parsed.max(10);
            }
        }

        validate_configuration(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, PropagationConfig, RoomsConfig};
    use rookery_models::capabilities::RoomCapabilities;

    #[test]
    fn generated_template_loads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("nested").join("rookery.toml");
        let path = config_path.to_str().expect("config path utf8");

        let generated = Config::load(path).expect("generate config");
        assert!(config_path.exists());
        let reloaded = Config::load(path).expect("reload config");
        assert_eq!(generated.auth.jwt_secret, reloaded.auth.jwt_secret);
        assert_eq!(reloaded.auth.jwt_secret.len(), 64);
        assert!(reloaded.federation.peers.is_empty());
        assert_eq!(
            reloaded.rooms.capabilities(),
            RoomCapabilities::default()
        );
    }

    #[test]
    fn peers_and_room_defaults_parse_from_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind_address = "127.0.0.1:9000"
            server_name = "s1.example"

            [database]
            url = "sqlite::memory:"

            [auth]
            jwt_secret = "0123456789abcdef0123456789abcdef"

            [federation]
            enabled = true

            [[federation.peers]]
            server_name = "s2.example"
            base_url = "https://s2.example"

            [rooms]
            calls = false
            "#,
        )
        .expect("parse");
        assert!(config.federation.enabled);
        assert_eq!(config.federation.peers[0].server_name, "s2.example");
        assert!(config.federation.peers[0].public_key.is_none());
        assert_eq!(
            config.rooms.capabilities(),
            RoomCapabilities::THREADS | RoomCapabilities::DISCUSSIONS
        );
        assert_eq!(config.propagation.max_attempts, 12);
    }

    #[test]
    fn delivery_settings_are_clamped() {
        let propagation = PropagationConfig {
            max_attempts: 0,
            base_backoff_ms: 10_000,
            max_backoff_ms: 1_000,
            ..PropagationConfig::default()
        };
        let settings = propagation.delivery_settings();
        assert_eq!(settings.max_attempts, 1);
        assert_eq!(settings.max_backoff_ms, 10_000);
        assert!(RoomsConfig::default().calls);
    }

    #[test]
    fn env_override_reaches_propagation_settings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("rookery-env.toml");
        std::env::set_var("ROOKERY_PROPAGATION_WORKER_INTERVAL_MS", "250");
        let config =
            Config::load(config_path.to_str().expect("config path utf8")).expect("load config");
        std::env::remove_var("ROOKERY_PROPAGATION_WORKER_INTERVAL_MS");
        assert_eq!(config.propagation.worker_interval_ms, 250);
    }
}
