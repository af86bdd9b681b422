use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JWT secret key for validating bearer tokens
    pub auth_jwt_secret: Option<String>,

    /// Database URL
    pub db_url: Option<String>,

    /// Minimum interval between snapshot flushes while a room stays dirty
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,

    /// How long an empty room's engine is kept alive awaiting rejoins
    #[serde(default = "default_room_grace_secs")]
    pub room_grace_secs: u64,

    /// Bound on the initial snapshot load when a room activates
    #[serde(default = "default_room_load_timeout_ms")]
    pub room_load_timeout_ms: u64,

    /// Idle cutoff for websocket connections (liveness timeout)
    #[serde(default = "default_ws_idle_timeout_secs")]
    pub ws_idle_timeout_secs: u64,

    /// Per-connection outbound queue depth; slow consumers beyond this are
    /// disconnected
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Install the loaded configuration for global access.
pub fn set_config(config: Config) {
    let _ = CONFIG.set(config);
}

/// Get the global configuration. Falls back to defaults if `set_config` was
/// never called (tests).
pub fn get_config() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn flush_debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn room_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.room_grace_secs)
    }

    pub fn room_load_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.room_load_timeout_ms)
    }

    pub fn ws_idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ws_idle_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            auth_jwt_secret: None,
            db_url: None,
            flush_debounce_ms: default_flush_debounce_ms(),
            room_grace_secs: default_room_grace_secs(),
            room_load_timeout_ms: default_room_load_timeout_ms(),
            ws_idle_timeout_secs: default_ws_idle_timeout_secs(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_flush_debounce_ms() -> u64 {
    5_000
}

fn default_room_grace_secs() -> u64 {
    30
}

fn default_room_load_timeout_ms() -> u64 {
    5_000
}

fn default_ws_idle_timeout_secs() -> u64 {
    60
}

fn default_outbound_queue() -> usize {
    64
}
