//! Configuration management for the Redline game server
//!
//! Centralized configuration with validation, defaults, and environment
//! variable support. Loaded once at startup from an optional TOML file,
//! then overridden by `REDLINE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::IpAddr;
use std::path::Path;

use crate::errors::{Error, Result};
use crate::money::Money;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RedlineConfig {
    pub server: ServerConfig,
    pub game: GameConfig,
    pub token: TokenConfig,
    pub farming: FarmingConfig,
    pub daily_limits: DailyLimitsConfig,
    pub admin: AdminConfig,
    pub platform: PlatformConfig,
    pub fairness: FairnessConfig,
    pub rate_limits: RateLimitsConfig,
    pub storage: StorageConfig,
    pub limits: RuntimeLimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

/// Round timing and wagering bounds. Monetary values are minor units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub min_bet: i64,
    pub max_bet: i64,
    pub default_balance: i64,
    /// House edge in basis points (100 = 1%).
    pub edge_bps: u32,
    pub countdown_secs: u64,
    pub tick_ms: u64,
    pub post_crash_pause_secs: u64,
    pub history_len: usize,
    /// Optional operator-published client seed mixed into every round.
    pub client_seed: String,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            min_bet: 100,           // 1.00
            max_bet: 100_000,       // 1000.00
            default_balance: 100_000,
            edge_bps: 100,
            countdown_secs: 5,
            tick_ms: 50,
            post_crash_pause_secs: 3,
            history_len: 10,
            client_seed: String::new(),
        }
    }
}

impl GameConfig {
    pub fn min_bet_money(&self) -> Money {
        Money::from_minor(self.min_bet)
    }

    pub fn max_bet_money(&self) -> Money {
        Money::from_minor(self.max_bet)
    }

    pub fn default_balance_money(&self) -> Money {
        Money::from_minor(self.default_balance)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    /// Sessions idle longer than this are reaped.
    pub session_idle_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "change-me-in-production-0123456789ab".to_string(),
            access_ttl_secs: 7 * 24 * 3600,
            refresh_ttl_secs: 30 * 24 * 3600,
            session_idle_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmingConfig {
    pub cycle_secs: i64,
    /// Reward per claim in minor units.
    pub reward: i64,
}

impl Default for FarmingConfig {
    fn default() -> Self {
        Self {
            cycle_secs: 6 * 3600,
            reward: 6000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyLimitsConfig {
    pub default_max_wager: i64,
    pub default_max_loss: i64,
    pub default_max_games: i64,
}

impl Default for DailyLimitsConfig {
    fn default() -> Self {
        Self {
            default_max_wager: 1_000_000,
            default_max_loss: 500_000,
            default_max_games: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// When non-empty, admin routes require the caller IP to be listed.
    pub ip_allowlist: Vec<IpAddr>,
    pub registration_enabled: bool,
    pub registration_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            ip_allowlist: Vec::new(),
            registration_enabled: false,
            registration_key: String::new(),
        }
    }
}

/// External messaging-platform login validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub secret: String,
    pub login_max_age_secs: i64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            login_max_age_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairnessConfig {
    /// Server seeds stay hidden for this long after a round ends.
    pub seed_reveal_grace_secs: i64,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            seed_reveal_grace_secs: 300,
        }
    }
}

/// Token-bucket parameters for one route family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouteLimit {
    pub per_minute: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    pub auth: RouteLimit,
    pub admin: RouteLimit,
    pub settings_read: RouteLimit,
    pub settings_write: RouteLimit,
    pub fairness: RouteLimit,
    pub leaderboard: RouteLimit,
    pub farming: RouteLimit,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            auth: RouteLimit {
                per_minute: 10,
                burst: 5,
            },
            admin: RouteLimit {
                per_minute: 30,
                burst: 10,
            },
            settings_read: RouteLimit {
                per_minute: 300,
                burst: 60,
            },
            settings_write: RouteLimit {
                per_minute: 12,
                burst: 4,
            },
            fairness: RouteLimit {
                per_minute: 60,
                burst: 20,
            },
            leaderboard: RouteLimit {
                per_minute: 60,
                burst: 20,
            },
            farming: RouteLimit {
                per_minute: 30,
                burst: 10,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./redline.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeLimitsConfig {
    /// Inbound websocket messages per second per session.
    pub ws_inbound_per_sec: u32,
    /// Bounded mailbox behind the round engine.
    pub engine_mailbox: usize,
    /// Users with fewer games are excluded from win-rate leaderboards.
    pub leaderboard_min_games: i64,
}

impl Default for RuntimeLimitsConfig {
    fn default() -> Self {
        Self {
            ws_inbound_per_sec: 10,
            engine_mailbox: 1024,
            leaderboard_min_games: 10,
        }
    }
}

/// Configuration loader with environment variable support.
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path.
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables.
    pub fn load(&self) -> Result<RedlineConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            self.load_from_file(path)?
        } else {
            RedlineConfig::default()
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> Result<RedlineConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::internal(format!("failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| Error::invalid(format!("failed to parse {}: {}", path, e)))
    }

    fn apply_env_overrides(&self, config: &mut RedlineConfig) -> Result<()> {
        if let Ok(host) = env::var("REDLINE_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = env::var("REDLINE_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| Error::invalid(format!("REDLINE_PORT: invalid port '{}'", port)))?;
        }
        if let Ok(path) = env::var("REDLINE_DB_PATH") {
            config.storage.path = path;
        }
        if let Ok(secret) = env::var("REDLINE_TOKEN_SECRET") {
            config.token.secret = secret;
        }
        if let Ok(secret) = env::var("REDLINE_PLATFORM_SECRET") {
            config.platform.secret = secret;
        }
        if let Ok(key) = env::var("REDLINE_ADMIN_REGISTRATION_KEY") {
            config.admin.registration_key = key;
        }
        if let Ok(enabled) = env::var("REDLINE_ADMIN_REGISTRATION_ENABLED") {
            config.admin.registration_enabled = enabled.parse().map_err(|_| {
                Error::invalid(format!(
                    "REDLINE_ADMIN_REGISTRATION_ENABLED: invalid boolean '{}'",
                    enabled
                ))
            })?;
        }
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self, config: &RedlineConfig) -> Result<()> {
        let mut details = Vec::new();

        if config.server.port == 0 {
            details.push("server.port cannot be zero".to_string());
        }
        if config.game.min_bet <= 0 {
            details.push("game.min_bet must be positive".to_string());
        }
        if config.game.min_bet > config.game.max_bet {
            details.push("game.min_bet must not exceed game.max_bet".to_string());
        }
        if config.game.default_balance < 0 {
            details.push("game.default_balance must be non-negative".to_string());
        }
        if config.game.edge_bps >= 10_000 {
            details.push("game.edge_bps must be below 10000".to_string());
        }
        if config.game.tick_ms < 10 {
            details.push("game.tick_ms must be at least 10".to_string());
        }
        if config.game.history_len == 0 {
            details.push("game.history_len cannot be zero".to_string());
        }
        if config.token.secret.len() < 32 {
            details.push("token.secret must be at least 32 bytes".to_string());
        }
        if config.token.access_ttl_secs <= 0 || config.token.refresh_ttl_secs <= 0 {
            details.push("token TTLs must be positive".to_string());
        }
        if config.storage.path.is_empty() {
            details.push("storage.path cannot be empty".to_string());
        }
        if config.limits.engine_mailbox == 0 {
            details.push("limits.engine_mailbox cannot be zero".to_string());
        }
        if config.fairness.seed_reveal_grace_secs < 0 {
            details.push("fairness.seed_reveal_grace_secs must be non-negative".to_string());
        }

        if details.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_with("configuration invalid", details))
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, config: &RedlineConfig, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| Error::internal(format!("failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| Error::internal(format!("failed to write {}: {}", path, e)))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
