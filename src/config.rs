//! Cache configuration from environment variables and TOML.
//!
//! Every option has a default. `load()` reads `GG_CACHE_*` environment
//! variables over the defaults; invalid values fall back to the default
//! without crashing. A TOML file can supply the base instead, with the
//! environment still taking precedence through [`CoreConfig::with_env_overrides`].
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_CACHE_CAPACITY_MB` | 4096 | Budget for resident models (MB) |
//! | `GG_CACHE_ARENA_SIZE_MB` | 512 | Arena reservation (MB) |
//! | `GG_CACHE_ALIGNMENT` | 32 | Default arena alignment (bytes) |
//! | `GG_CACHE_SESSION_TIMEOUT` | 1800 | Session idle timeout (secs) |
//! | `GG_CACHE_MAX_SESSIONS` | 1000 | Session count cap |
//! | `GG_CACHE_SESSION_MEMORY_MB` | 1024 | Session memory ceiling (MB) |
//! | `GG_CACHE_EVICTION_POLICY` | recency | `recency` or `scored` |
//! | `GG_CACHE_HOT_RELOAD_STRATEGY` | graceful | `immediate`, `graceful` or `scheduled` |
//! | `GG_CACHE_LOAD_TIMEOUT` | 300 | Load wait bound (secs) |
//! | `GG_CACHE_LOAD_TIMEOUT_BEHAVIOR` | continue | `continue` or `cancel` |
//! | `GG_CACHE_DRAIN_TIMEOUT` | 30 | Graceful reload drain bound (secs) |
//! | `GG_CACHE_PRELOAD_INTERVAL` | 300 | Preloader tick (secs) |
//! | `GG_CACHE_PRELOAD_STRATEGY` | moderate | `aggressive`, `moderate` or `conservative` |
//! | `GG_CACHE_RELOAD_POLL_INTERVAL` | 10 | Hot reload poll (secs) |
//! | `GG_CACHE_VERIFY_CHECKSUMS` | false | Verify revisions before reload |
//! | `GG_CACHE_COMPACTION_THRESHOLD` | 0.3 | Arena fragmentation threshold |
//! | `GG_CACHE_BACK_WITH_ARENA` | false | Charge resident models to the arena |
//! | `GG_CACHE_STATS_INTERVAL` | 60 | Stats export period (secs) |
//! | `GG_CACHE_LOG_LEVEL` | info | Tracing filter |
//! | `GG_CACHE_LOG_FORMAT` | json | `json` or `pretty` |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{ArenaConfig, SessionConfig};
use crate::models::{
    CacheConfig, EvictionPolicyKind, HotReloadConfig, HotReloadStrategy, PreloadStrategy,
    TimeoutBehavior,
};
use crate::telemetry::{LogConfig, LogFormat};

const MB: usize = 1024 * 1024;
/// Largest megabyte count whose byte size fits in `usize`.
const MAX_SIZE_MB: usize = usize::MAX / MB;
const DEFAULT_ALIGNMENT: usize = 32;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Every recognised option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cache_capacity_mb: u64,
    pub arena_size_mb: usize,
    pub alignment: usize,
    pub session_timeout_secs: u64,
    pub max_sessions: usize,
    pub session_memory_limit_mb: usize,
    pub eviction_policy: EvictionPolicyKind,
    pub hot_reload_strategy: HotReloadStrategy,
    pub load_timeout_secs: u64,
    pub load_timeout_behavior: TimeoutBehavior,
    pub drain_timeout_secs: u64,
    pub preload_interval_secs: u64,
    pub preload_strategy: PreloadStrategy,
    pub reload_poll_interval_secs: u64,
    pub verify_checksums: bool,
    pub compaction_threshold: f64,
    pub back_cache_with_arena: bool,
    pub stats_interval_secs: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity_mb: 4096,
            arena_size_mb: 512,
            alignment: DEFAULT_ALIGNMENT,
            session_timeout_secs: 1800,
            max_sessions: 1000,
            session_memory_limit_mb: 1024,
            eviction_policy: EvictionPolicyKind::Recency,
            hot_reload_strategy: HotReloadStrategy::Graceful,
            load_timeout_secs: 300,
            load_timeout_behavior: TimeoutBehavior::Continue,
            drain_timeout_secs: 30,
            preload_interval_secs: 300,
            preload_strategy: PreloadStrategy::Moderate,
            reload_poll_interval_secs: 10,
            verify_checksums: false,
            compaction_threshold: 0.3,
            back_cache_with_arena: false,
            stats_interval_secs: 60,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub cache_capacity_mb: u64,
    pub arena_size_bytes: usize,
    pub alignment: usize,
    pub session_timeout_secs: u64,
    pub max_sessions: usize,
    pub session_memory_limit_bytes: usize,
    pub eviction_policy: EvictionPolicyKind,
    pub hot_reload_strategy: HotReloadStrategy,
    pub load_timeout_secs: u64,
    pub load_timeout_behavior: TimeoutBehavior,
    pub drain_timeout_secs: u64,
    pub preload_interval_secs: u64,
    pub preload_strategy: PreloadStrategy,
    pub reload_poll_interval_secs: u64,
    pub verify_checksums: bool,
    pub compaction_threshold: f64,
    pub back_cache_with_arena: bool,
    pub stats_interval_secs: u64,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    parse_env(key, default)
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    parse_env(key, default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    let value: f64 = parse_env(key, default);
    if value.is_finite() {
        value
    } else {
        default
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Parse any `FromStr` env var, returning `default` on missing or invalid.
fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Load configuration from environment variables over the defaults.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> CoreConfig {
    CoreConfig::default().with_env_overrides()
}

impl CoreConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = toml::from_str(source)?;
        Ok(config.normalized())
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Apply any `GG_CACHE_*` variables on top of `self`.
    pub fn with_env_overrides(self) -> Self {
        let config = Self {
            cache_capacity_mb: parse_u64("GG_CACHE_CAPACITY_MB", self.cache_capacity_mb),
            arena_size_mb: parse_usize("GG_CACHE_ARENA_SIZE_MB", self.arena_size_mb),
            alignment: parse_usize("GG_CACHE_ALIGNMENT", self.alignment),
            session_timeout_secs: parse_u64("GG_CACHE_SESSION_TIMEOUT", self.session_timeout_secs),
            max_sessions: parse_usize("GG_CACHE_MAX_SESSIONS", self.max_sessions),
            session_memory_limit_mb: parse_usize("GG_CACHE_SESSION_MEMORY_MB", self.session_memory_limit_mb),
            eviction_policy: parse_env("GG_CACHE_EVICTION_POLICY", self.eviction_policy),
            hot_reload_strategy: parse_env("GG_CACHE_HOT_RELOAD_STRATEGY", self.hot_reload_strategy),
            load_timeout_secs: parse_u64("GG_CACHE_LOAD_TIMEOUT", self.load_timeout_secs),
            load_timeout_behavior: parse_env("GG_CACHE_LOAD_TIMEOUT_BEHAVIOR", self.load_timeout_behavior),
            drain_timeout_secs: parse_u64("GG_CACHE_DRAIN_TIMEOUT", self.drain_timeout_secs),
            preload_interval_secs: parse_u64("GG_CACHE_PRELOAD_INTERVAL", self.preload_interval_secs),
            preload_strategy: parse_env("GG_CACHE_PRELOAD_STRATEGY", self.preload_strategy),
            reload_poll_interval_secs: parse_u64("GG_CACHE_RELOAD_POLL_INTERVAL", self.reload_poll_interval_secs),
            verify_checksums: parse_bool("GG_CACHE_VERIFY_CHECKSUMS", self.verify_checksums),
            compaction_threshold: parse_f64("GG_CACHE_COMPACTION_THRESHOLD", self.compaction_threshold),
            back_cache_with_arena: parse_bool("GG_CACHE_BACK_WITH_ARENA", self.back_cache_with_arena),
            stats_interval_secs: parse_u64("GG_CACHE_STATS_INTERVAL", self.stats_interval_secs),
            log_level: std::env::var("GG_CACHE_LOG_LEVEL").unwrap_or(self.log_level),
            log_format: parse_env("GG_CACHE_LOG_FORMAT", self.log_format),
        };
        config.normalized()
    }

    /// Apply floors and clamps.
    pub fn normalized(mut self) -> Self {
        self.cache_capacity_mb = self.cache_capacity_mb.max(1);
        self.arena_size_mb = self.arena_size_mb.min(MAX_SIZE_MB);
        self.session_memory_limit_mb = self.session_memory_limit_mb.min(MAX_SIZE_MB);
        if self.back_cache_with_arena {
            // Every admitted load must be placeable once the arena is empty.
            let capacity_mb = usize::try_from(self.cache_capacity_mb).unwrap_or(usize::MAX);
            self.arena_size_mb = self.arena_size_mb.max(capacity_mb.min(MAX_SIZE_MB));
        }
        self.alignment = self.alignment.max(8).checked_next_power_of_two().unwrap_or(DEFAULT_ALIGNMENT);
        self.max_sessions = self.max_sessions.max(1);
        self.session_timeout_secs = self.session_timeout_secs.max(1);
        self.load_timeout_secs = self.load_timeout_secs.max(1);
        self.drain_timeout_secs = self.drain_timeout_secs.max(1);
        self.preload_interval_secs = self.preload_interval_secs.max(1);
        self.reload_poll_interval_secs = self.reload_poll_interval_secs.max(1);
        self.stats_interval_secs = self.stats_interval_secs.max(1);
        self.compaction_threshold = if self.compaction_threshold.is_finite() {
            self.compaction_threshold.clamp(0.0, 1.0)
        } else {
            0.3
        };
        self
    }

    pub fn arena_config(&self) -> ArenaConfig {
        ArenaConfig {
            size_bytes: self.arena_size_mb.saturating_mul(MB),
            alignment: self.alignment,
            compaction_threshold: self.compaction_threshold,
            ..ArenaConfig::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_sessions: self.max_sessions,
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            memory_limit_bytes: self.session_memory_limit_mb.saturating_mul(MB),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity_mb: self.cache_capacity_mb,
            load_timeout: Duration::from_secs(self.load_timeout_secs),
            timeout_behavior: self.load_timeout_behavior,
        }
    }

    pub fn hot_reload_config(&self) -> HotReloadConfig {
        HotReloadConfig {
            strategy: self.hot_reload_strategy,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            poll_interval: Duration::from_secs(self.reload_poll_interval_secs),
            verify_checksums: self.verify_checksums,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            format: self.log_format,
            level: self.log_level.clone(),
            output_path: None,
        }
    }

    /// Return a serializable summary of all effective values.
    pub fn effective(&self) -> EffectiveConfig {
        EffectiveConfig {
            cache_capacity_mb: self.cache_capacity_mb,
            arena_size_bytes: self.arena_size_mb.saturating_mul(MB),
            alignment: self.alignment,
            session_timeout_secs: self.session_timeout_secs,
            max_sessions: self.max_sessions,
            session_memory_limit_bytes: self.session_memory_limit_mb.saturating_mul(MB),
            eviction_policy: self.eviction_policy,
            hot_reload_strategy: self.hot_reload_strategy,
            load_timeout_secs: self.load_timeout_secs,
            load_timeout_behavior: self.load_timeout_behavior,
            drain_timeout_secs: self.drain_timeout_secs,
            preload_interval_secs: self.preload_interval_secs,
            preload_strategy: self.preload_strategy,
            reload_poll_interval_secs: self.reload_poll_interval_secs,
            verify_checksums: self.verify_checksums,
            compaction_threshold: self.compaction_threshold,
            back_cache_with_arena: self.back_cache_with_arena,
            stats_interval_secs: self.stats_interval_secs,
        }
    }
}
