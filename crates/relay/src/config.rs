// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Every setting is read once at startup; nothing here is
// mutable at runtime.

use std::{net::SocketAddr, time::Duration};

use crate::db::pool::PoolConfig;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_MAX_HISTORY: usize = 10_000;
const DEFAULT_HISTORY_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_ROOM_IDLE_SECS: u64 = 30 * 60;
const DEFAULT_REAP_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_OUTBOUND_QUEUE: usize = 1024;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
pub const DEFAULT_PERSIST_QUEUE: usize = 8192;
pub const DEFAULT_DOCUMENT: &str = "default";

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. `None` keeps history in process memory.
    pub database_url: Option<String>,
    /// Reject PostgreSQL URLs that do not require TLS.
    pub database_require_tls: bool,
    pub pool: PoolConfig,
    /// Comma-separated CORS origins for the admin API (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `ydoc_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    pub rooms: RoomSettings,
    pub liveness: LivenessSettings,
    /// Retention applied to a durable fragment list on every append.
    pub history_ttl: Duration,
    /// Fragments waiting for the history store; overflow is dropped.
    pub persist_queue: usize,
    /// How often the idle reaper sweeps the registry.
    pub reap_interval: Duration,
    /// Bound on draining sessions and the persistence queue at shutdown.
    pub shutdown_grace: Duration,
}

/// Per-room policy shared by every room the registry creates.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Maximum fragments retained in a room's replay buffer.
    pub max_history: usize,
    /// An empty room untouched for this long is reclaimed by the reaper.
    pub idle_after: Duration,
    /// Capacity of each session's outbound fragment queue.
    pub outbound_queue: usize,
    /// Replay the room buffer to a session right after admission.
    pub replay_on_join: bool,
    /// Document id used when a connection addresses the root path.
    pub default_document: String,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            idle_after: Duration::from_secs(DEFAULT_ROOM_IDLE_SECS),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            replay_on_join: true,
            default_document: DEFAULT_DOCUMENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessSettings {
    /// Interval between liveness probes.
    pub probe_interval: Duration,
    /// A session silent for longer than this is closed.
    pub timeout: Duration,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        let probe_interval = Duration::from_secs(DEFAULT_PING_INTERVAL_SECS);
        Self { probe_interval, timeout: probe_interval * 2 }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `YDOC_RELAY_HOST` | `0.0.0.0` |
    /// | `YDOC_RELAY_PORT` | `3001` |
    /// | `YDOC_RELAY_DATABASE_URL` | *(none, in-memory history)* |
    /// | `YDOC_RELAY_DB_REQUIRE_TLS` | `false` |
    /// | `YDOC_RELAY_DB_MIN_CONNECTIONS` | `2` |
    /// | `YDOC_RELAY_DB_MAX_CONNECTIONS` | `20` |
    /// | `YDOC_RELAY_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    /// | `YDOC_RELAY_CORS_ORIGINS` | *(none, localhost dev origins)* |
    /// | `YDOC_RELAY_LOG_FILTER` | `RUST_LOG`, then `info` |
    /// | `YDOC_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `YDOC_RELAY_MAX_HISTORY` | `10000` |
    /// | `YDOC_RELAY_HISTORY_TTL_SECS` | `604800` |
    /// | `YDOC_RELAY_PERSIST_QUEUE` | `8192` |
    /// | `YDOC_RELAY_ROOM_IDLE_SECS` | `1800` |
    /// | `YDOC_RELAY_REAP_INTERVAL_SECS` | `300` |
    /// | `YDOC_RELAY_PING_INTERVAL_SECS` | `30` |
    /// | `YDOC_RELAY_LIVENESS_TIMEOUT_SECS` | twice the ping interval |
    /// | `YDOC_RELAY_OUTBOUND_QUEUE` | `1024` |
    /// | `YDOC_RELAY_REPLAY_ON_JOIN` | `true` |
    /// | `YDOC_RELAY_DEFAULT_DOCUMENT` | `default` |
    /// | `YDOC_RELAY_SHUTDOWN_GRACE_SECS` | `5` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("YDOC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_positive(&env, "YDOC_RELAY_PORT").unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url =
            env("YDOC_RELAY_DATABASE_URL").ok().filter(|value| !value.trim().is_empty());
        let database_require_tls = parse_flag(&env, "YDOC_RELAY_DB_REQUIRE_TLS").unwrap_or(false);
        let pool = PoolConfig::from_env_fn(&env);
        let cors_origins = env("YDOC_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("YDOC_RELAY_LOG_FILTER")
            .or_else(|_| env("RUST_LOG"))
            .unwrap_or_else(|_| "info".into());
        let log_format = match env("YDOC_RELAY_LOG_FORMAT").ok().as_deref().map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let defaults = RoomSettings::default();
        let rooms = RoomSettings {
            max_history: parse_positive(&env, "YDOC_RELAY_MAX_HISTORY")
                .unwrap_or(defaults.max_history),
            idle_after: parse_secs(&env, "YDOC_RELAY_ROOM_IDLE_SECS")
                .unwrap_or(defaults.idle_after),
            outbound_queue: parse_positive(&env, "YDOC_RELAY_OUTBOUND_QUEUE")
                .unwrap_or(defaults.outbound_queue),
            replay_on_join: parse_flag(&env, "YDOC_RELAY_REPLAY_ON_JOIN")
                .unwrap_or(defaults.replay_on_join),
            default_document: env("YDOC_RELAY_DEFAULT_DOCUMENT")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.default_document),
        };

        let probe_interval = parse_secs(&env, "YDOC_RELAY_PING_INTERVAL_SECS")
            .unwrap_or(Duration::from_secs(DEFAULT_PING_INTERVAL_SECS));
        let liveness = LivenessSettings {
            probe_interval,
            timeout: parse_secs(&env, "YDOC_RELAY_LIVENESS_TIMEOUT_SECS")
                .unwrap_or(probe_interval * 2),
        };

        Self {
            listen_addr,
            database_url,
            database_require_tls,
            pool,
            cors_origins,
            log_filter,
            log_format,
            rooms,
            liveness,
            history_ttl: parse_secs(&env, "YDOC_RELAY_HISTORY_TTL_SECS")
                .unwrap_or(Duration::from_secs(DEFAULT_HISTORY_TTL_SECS)),
            persist_queue: parse_positive(&env, "YDOC_RELAY_PERSIST_QUEUE")
                .unwrap_or(DEFAULT_PERSIST_QUEUE),
            reap_interval: parse_secs(&env, "YDOC_RELAY_REAP_INTERVAL_SECS")
                .unwrap_or(Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS)),
            shutdown_grace: parse_secs(&env, "YDOC_RELAY_SHUTDOWN_GRACE_SECS")
                .unwrap_or(Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS)),
        }
    }
}

fn parse_positive<F, T>(env: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr + PartialOrd + Default,
{
    env(key).ok().and_then(|value| value.trim().parse::<T>().ok()).filter(|v| *v > T::default())
}

fn parse_secs<F>(env: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    parse_positive::<F, u64>(env, key).map(Duration::from_secs)
}

fn parse_flag<F>(env: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match env(key).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
