use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration for the producer.
///
/// Loaded from a TOML file when one exists, then overlaid with environment
/// variables (`AGNOX_*`) so container deployments can run file-less.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

impl Config {
    /// Load from `path` when it exists, then apply environment overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let text =
                    std::fs::read_to_string(&p).map_err(|e| ConfigError::Io(e.to_string()))?;
                toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            _ => Config::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Overlay `AGNOX_*` environment variables onto the loaded file values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("AGNOX_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("AGNOX_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("AGNOX_PRODUCTION") {
            self.server.production = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("AGNOX_DATABASE_PATH") {
            self.store.path = v;
        }
        if let Ok(v) = std::env::var("AGNOX_REDIS_URL") {
            self.cache.url = Some(v);
        }
        if let Ok(v) = std::env::var("AGNOX_AMQP_URL") {
            self.queue.url = Some(v);
        }
        if let Ok(v) = std::env::var("AGNOX_JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Ok(v) = std::env::var("AGNOX_WORKER_SECRET") {
            self.auth.worker_secret = v;
        }
        if let Ok(v) = std::env::var("AGNOX_WORKER_CALLBACK_TRANSITION") {
            self.auth.worker_callback_transition = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("AGNOX_ENV_KEY") {
            self.security.env_encryption_key = v;
        }
        if let Ok(v) = std::env::var("AGNOX_REPORT_TOKEN_SECRET") {
            self.security.report_token_secret = v;
        }
        if let Ok(v) = std::env::var("AGNOX_INJECT_ENV_VARS") {
            self.security.inject_env_vars = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("AGNOX_REPORTS_DIR") {
            self.reports.dir = v;
        }
        if let Ok(v) = std::env::var("AGNOX_CORS_ORIGINS") {
            self.cors.allowed_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("AGNOX_DEFAULT_IMAGE") {
            self.defaults.image = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enables HSTS and the strict CORS allow-list.
    #[serde(default)]
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            production: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    4000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path; `:memory:` for ephemeral runs.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "agnox.db".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis URL. `None` starts the in-process fallback immediately.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// AMQP URL. `None` runs with the in-memory queue (dev/tests only).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

fn default_queue_name() -> String {
    "test_queue".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret for user JWTs.
    #[serde(default)]
    pub jwt_secret: String,
    /// Token lifetime in seconds.
    #[serde(default = "default_jwt_ttl")]
    pub jwt_ttl_secs: u64,
    /// Shared secret presented by workers on callback endpoints.
    #[serde(default)]
    pub worker_secret: String,
    /// Migration window: accept unauthenticated worker callbacks with a
    /// warning. Scheduled for removal.
    #[serde(default)]
    pub worker_callback_transition: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_ttl_secs: default_jwt_ttl(),
            worker_secret: String::new(),
            worker_callback_transition: false,
        }
    }
}

fn default_jwt_ttl() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Base64-encoded 32-byte AES-256-GCM key for env-var secrets.
    #[serde(default)]
    pub env_encryption_key: String,
    /// HMAC secret for report tokens.
    #[serde(default)]
    pub report_token_secret: String,
    /// Process env-var names copied into every dispatched task.
    #[serde(default)]
    pub inject_env_vars: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    #[serde(default = "default_reports_dir")]
    pub dir: String,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: default_reports_dir(),
        }
    }
}

fn default_reports_dir() -> String {
    "reports".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Exact origins allowed in production. Localhost origins are always
    /// allowed outside production.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Image used when an execution request omits one.
    #[serde(default = "default_image")]
    pub image: String,
    /// Base URL per environment, surfaced to the dashboard bootstrap.
    #[serde(default)]
    pub base_urls: HashMap<String, String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            base_urls: HashMap::new(),
        }
    }
}

fn default_image() -> String {
    "agnox/runner:latest".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 4000);
        assert_eq!(cfg.queue.queue_name, "test_queue");
        assert!(!cfg.auth.worker_callback_transition);
        assert!(cfg.cache.url.is_none());
    }

    #[test]
    fn toml_round_trip() {
        let text = r#"
            [server]
            port = 8080
            production = true

            [auth]
            jwt_secret = "s3cret"

            [security]
            inject_env_vars = ["CI", "BUILD_ID"]
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.server.production);
        assert_eq!(cfg.auth.jwt_secret, "s3cret");
        assert_eq!(cfg.security.inject_env_vars, vec!["CI", "BUILD_ID"]);
        // Untouched sections fall back to defaults.
        assert_eq!(cfg.store.path, "agnox.db");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Some(PathBuf::from("/definitely/not/here.toml"))).unwrap();
        assert_eq!(cfg.server.host, "127.0.0.1");
    }
}
