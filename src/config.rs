//! Worker configuration loaded from environment variables.
//!
//! Required settings are validated once at startup; a missing or
//! placeholder-looking value is fatal before any sync work happens.
//! Optional infrastructure (cache, broadcast, queue) is enabled purely by the
//! presence of its connection string.

use std::env;
use std::time::Duration;

/// Default cron schedule: every 15 minutes (seconds field first).
pub const DEFAULT_SYNC_SCHEDULE: &str = "0 */15 * * * *";

/// Default queue name for out-of-band sync requests.
pub const DEFAULT_QUEUE_NAME: &str = "practice-sync";

/// Worker configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Database ---
    /// SQLite database location (`sqlite://path` or a bare path)
    pub database_url: String,
    /// Maximum pooled connections
    pub database_pool_size: u32,

    // --- Practice-management API ---
    /// FHIR base URL, e.g. `https://api.example.com/fhir`
    pub api_base_url: String,
    /// OAuth2 token endpoint
    pub api_token_url: String,
    /// OAuth2 client ID
    pub api_client_id: String,
    /// OAuth2 client secret
    pub api_client_secret: String,
    /// Optional OAuth2 scope for the client-credentials grant
    pub api_scope: Option<String>,
    /// Maximum outbound requests per minute
    pub api_rate_limit: u32,
    /// Timeout applied to every outbound HTTP call
    pub http_timeout: Duration,

    // --- Scheduling ---
    /// Six-field cron expression
    pub sync_schedule: String,
    /// Timezone the schedule is evaluated in
    pub sync_timezone: chrono_tz::Tz,
    /// Run one pass shortly after startup
    pub run_on_startup: bool,
    /// Settle delay before the startup pass
    pub startup_delay: Duration,
    /// Days of past appointments to pull
    pub lookback_days: i64,
    /// Days of future appointments and slots to pull
    pub lookahead_days: i64,
    /// How long an in-progress pass may run after a shutdown signal
    pub shutdown_grace: Duration,

    // --- Health server ---
    pub health_port: u16,

    // --- Optional real-time infrastructure ---
    /// Redis URL for the cache (absent = cache disabled)
    pub redis_url: Option<String>,
    /// Redis URL for pub/sub broadcast (absent = broadcast disabled)
    pub broadcast_redis_url: Option<String>,
    /// Redis URL for the trigger queue (absent = queue disabled)
    pub queue_redis_url: Option<String>,
    pub queue_name: String,
    /// Prefix for cache keys and broadcast channels
    pub cache_namespace: String,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let credential = |key: &'static str| {
            let value = required(key)?;
            if looks_like_placeholder(&value) {
                return Err(ConfigError::Placeholder(key));
            }
            Ok(value)
        };

        let database_url = required("DATABASE_URL")?;
        let api_base_url = credential("PRACTICE_API_BASE_URL")?
            .trim_end_matches('/')
            .to_string();
        let api_token_url = credential("PRACTICE_API_TOKEN_URL")?;
        let api_client_id = credential("PRACTICE_API_CLIENT_ID")?;
        let api_client_secret = credential("PRACTICE_API_CLIENT_SECRET")?;

        let sync_timezone = match get("SYNC_TIMEZONE") {
            Some(name) => name
                .parse::<chrono_tz::Tz>()
                .map_err(|_| ConfigError::Invalid("SYNC_TIMEZONE", name))?,
            None => chrono_tz::UTC,
        };

        let config = Self {
            database_url,
            database_pool_size: parse_or(&get, "DATABASE_POOL_SIZE", 4)?,
            api_base_url,
            api_token_url,
            api_client_id,
            api_client_secret,
            api_scope: get("PRACTICE_API_SCOPE"),
            api_rate_limit: parse_or(&get, "PRACTICE_API_RATE_LIMIT", 60)?,
            http_timeout: Duration::from_secs(parse_or(&get, "HTTP_TIMEOUT_SECS", 30)?),
            sync_schedule: get("SYNC_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_SYNC_SCHEDULE.to_string()),
            sync_timezone,
            run_on_startup: parse_bool_or(&get, "SYNC_RUN_ON_STARTUP", true)?,
            startup_delay: Duration::from_secs(parse_or(&get, "SYNC_STARTUP_DELAY_SECS", 10)?),
            lookback_days: parse_or(&get, "SYNC_LOOKBACK_DAYS", 7)?,
            lookahead_days: parse_or(&get, "SYNC_LOOKAHEAD_DAYS", 60)?,
            shutdown_grace: Duration::from_secs(parse_or(&get, "SHUTDOWN_GRACE_SECS", 30)?),
            health_port: parse_or(&get, "HEALTH_PORT", 8080)?,
            redis_url: get("REDIS_URL"),
            broadcast_redis_url: get("BROADCAST_REDIS_URL"),
            queue_redis_url: get("QUEUE_REDIS_URL"),
            queue_name: get("QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            cache_namespace: get("CACHE_NAMESPACE").unwrap_or_else(|| "practice".to_string()),
        };

        if config.api_rate_limit == 0 {
            return Err(ConfigError::Invalid("PRACTICE_API_RATE_LIMIT", "0".to_string()));
        }

        config.warn_missing_optional();
        Ok(config)
    }

    fn warn_missing_optional(&self) {
        if self.redis_url.is_none() {
            tracing::warn!("REDIS_URL not set, cache invalidation disabled");
        }
        if self.broadcast_redis_url.is_none() {
            tracing::warn!("BROADCAST_REDIS_URL not set, real-time broadcast disabled");
        }
        if self.queue_redis_url.is_none() {
            tracing::warn!("QUEUE_REDIS_URL not set, queue-triggered syncs disabled");
        }
    }
}

/// Heuristic check for credentials that were never filled in.
///
/// Matches template values such as `your-client-id`, `<secret>`,
/// `changeme` or anything containing `placeholder`.
pub fn looks_like_placeholder(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return true;
    }
    if lower.starts_with('<') && lower.ends_with('>') {
        return true;
    }
    const MARKERS: [&str; 6] = [
        "placeholder",
        "your-",
        "your_",
        "changeme",
        "replace-me",
        "xxxx",
    ];
    MARKERS.iter().any(|m| lower.contains(m))
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key, raw)),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::Invalid(key, v)),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Environment variable {0} looks like a placeholder value")]
    Placeholder(&'static str),

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
