use crate::error::ConfigError;

/// Development-only fingerprint salt. Release builds refuse to start with it;
/// see [`Config::from_env`].
pub const DEV_FINGERPRINT_SALT: &str = "anteroom-dev-salt";

/// Default HTTP listen port.
pub const DEFAULT_PORT: u16 = 8080;
/// Default store address (Redis protocol).
pub const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
/// Default event bus address.
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
/// Default log level when neither `RUST_LOG` nor `ANTEROOM_LOG_LEVEL` is set.
pub const DEFAULT_LOG_LEVEL: &str = "info";
/// Default reaper cadence, seconds.
pub const DEFAULT_CLEANUP_INTERVAL_S: u64 = 5;
/// Default reaper batch bound per queue per tick.
pub const DEFAULT_REAP_BATCH: usize = 100;
/// Default heartbeat event sampling: publish one in N.
pub const DEFAULT_HEARTBEAT_SAMPLE: u64 = 10;
/// Default waiting-credential lifetime, seconds.
pub const DEFAULT_WAITING_TTL_S: u64 = 1_800;
/// Default graceful-shutdown window, seconds.
pub const DEFAULT_SHUTDOWN_GRACE_S: u64 = 30;
/// Default `source` stamped on published events.
pub const DEFAULT_EVENT_SOURCE: &str = "anteroom-server";

/// Process configuration, loaded from `ANTEROOM_*` environment keys.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_url: String,
    pub nats_url: String,
    pub fingerprint_salt: String,
    /// Shared secret for the admin surface. `None` disables admin routes.
    pub admin_key: Option<String>,
    pub log_level: String,
    pub event_source: String,
    pub cleanup_interval_s: u64,
    pub reap_batch: usize,
    pub heartbeat_sample: u64,
    pub waiting_ttl_s: u64,
    pub shutdown_grace_s: u64,
    /// Accept credentials whose fingerprint binding no longer matches the
    /// presenter (NAT and address churn). Default strict.
    pub lenient_binding: bool,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// The fingerprint salt has no production default: release builds return
    /// [`ConfigError::MissingSalt`] when `ANTEROOM_FINGERPRINT_SALT` is
    /// unset. Debug builds fall back to [`DEV_FINGERPRINT_SALT`] with a
    /// warning so local runs stay zero-config.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup (testable seam).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let fingerprint_salt = match lookup("ANTEROOM_FINGERPRINT_SALT") {
            Some(salt) if !salt.is_empty() => salt,
            _ if cfg!(debug_assertions) => {
                tracing::warn!("ANTEROOM_FINGERPRINT_SALT unset, using development salt");
                DEV_FINGERPRINT_SALT.to_string()
            }
            _ => return Err(ConfigError::MissingSalt("ANTEROOM_FINGERPRINT_SALT")),
        };

        Ok(Config {
            port: parse(&lookup, "ANTEROOM_PORT", DEFAULT_PORT)?,
            store_url: lookup("ANTEROOM_STORE_URL").unwrap_or_else(|| DEFAULT_STORE_URL.into()),
            nats_url: lookup("ANTEROOM_NATS_URL").unwrap_or_else(|| DEFAULT_NATS_URL.into()),
            fingerprint_salt,
            admin_key: lookup("ANTEROOM_ADMIN_KEY").filter(|k| !k.is_empty()),
            log_level: lookup("ANTEROOM_LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.into()),
            event_source: lookup("ANTEROOM_EVENT_SOURCE")
                .unwrap_or_else(|| DEFAULT_EVENT_SOURCE.into()),
            cleanup_interval_s: parse(
                &lookup,
                "ANTEROOM_CLEANUP_INTERVAL_S",
                DEFAULT_CLEANUP_INTERVAL_S,
            )?,
            reap_batch: parse(&lookup, "ANTEROOM_REAP_BATCH", DEFAULT_REAP_BATCH)?,
            heartbeat_sample: parse(
                &lookup,
                "ANTEROOM_HEARTBEAT_SAMPLE",
                DEFAULT_HEARTBEAT_SAMPLE,
            )?,
            waiting_ttl_s: parse(&lookup, "ANTEROOM_WAITING_TTL_S", DEFAULT_WAITING_TTL_S)?,
            shutdown_grace_s: parse(
                &lookup,
                "ANTEROOM_SHUTDOWN_GRACE_S",
                DEFAULT_SHUTDOWN_GRACE_S,
            )?,
            lenient_binding: parse(&lookup, "ANTEROOM_LENIENT_BINDING", false)?,
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}
