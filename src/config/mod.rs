//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{
    BrokerOverrides, CliArgs, Command, ServeArgs, ServeOverrides, StoreOverrides, SubscribeArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "quire";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CACHE_KEY_PREFIX: &str = "quire";
const DEFAULT_STORE_MEMORY_CAPACITY: usize = 1000;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;
const DEFAULT_BUS_PORT: u16 = 61613;
pub const DEFAULT_BUS_TOPIC: &str = "/topic/ella";
const DEFAULT_BUS_CONNECT_TIMEOUT_MS: u64 = 2000;
const DEFAULT_BUS_SEND_TIMEOUT_MS: u64 = 1000;
const DEFAULT_BUS_RECONNECT_BACKOFF_MS: u64 = 5000;
const DEFAULT_BUS_REGISTRATION_RETENTION_SECONDS: u64 = 24 * 60 * 60;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub bus: BusSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Response cache policy.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Default TTL applied when a response carries no `max-age`.
    pub timeout: Duration,
    pub key_prefix: String,
    pub anonymous_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
    pub memory_capacity: NonZeroUsize,
    /// Upper bound for a single store round-trip.
    pub timeout: Duration,
}

/// Message bus used for invalidation publishing.
///
/// `host == None` keeps the publisher in no-op mode.
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub host: Option<String>,
    pub port: u16,
    pub topic: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    /// Sends fail immediately for this long after a failed connect.
    pub reconnect_backoff: Duration,
    /// Subscriber-side lifetime of a page's registrations without renewal.
    pub registration_retention: Duration,
    pub invalidate_before_commit: bool,
    pub subscribe_in_process: bool,
}

impl BusSettings {
    pub fn is_configured(&self) -> bool {
        self.host.is_some()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("QUIRE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Subscribe(args)) => {
            raw.apply_broker_overrides(&args.broker);
            raw.apply_store_overrides(&args.store);
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    store: RawStoreSettings,
    bus: RawBusSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(seconds) = overrides.cache_timeout_seconds {
            self.cache.timeout_seconds = Some(seconds);
        }
        if let Some(prefix) = overrides.cache_key_prefix.as_ref() {
            self.cache.key_prefix = Some(prefix.clone());
        }
        if let Some(anonymous_only) = overrides.cache_anonymous_only {
            self.cache.anonymous_only = Some(anonymous_only);
        }

        self.apply_broker_overrides(&overrides.broker);
        self.apply_store_overrides(&overrides.store);
    }

    fn apply_broker_overrides(&mut self, overrides: &BrokerOverrides) {
        if let Some(host) = overrides.bus_host.as_ref() {
            self.bus.host = Some(host.clone());
        }
        if let Some(port) = overrides.bus_port {
            self.bus.port = Some(port);
        }
        if let Some(topic) = overrides.bus_topic.as_ref() {
            self.bus.topic = Some(topic.clone());
        }
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(backend) = overrides.store_backend.as_ref() {
            self.store.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.store_redis_url.as_ref() {
            self.store.redis_url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            store,
            bus,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            store: build_store_settings(store)?,
            bus: build_bus_settings(bus)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let timeout_seconds = cache.timeout_seconds.unwrap_or(DEFAULT_CACHE_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "cache.timeout_seconds",
            "must be greater than zero",
        ));
    }
    if timeout_seconds > crate::cache::MAX_TTL.as_secs() {
        return Err(LoadError::invalid(
            "cache.timeout_seconds",
            format!("must not exceed {}", crate::cache::MAX_TTL.as_secs()),
        ));
    }

    let key_prefix = match cache.key_prefix {
        Some(prefix) => {
            let trimmed = prefix.trim();
            if trimmed.is_empty() {
                return Err(LoadError::invalid(
                    "cache.key_prefix",
                    "prefix must not be empty",
                ));
            }
            if trimmed.contains(char::is_whitespace) {
                return Err(LoadError::invalid(
                    "cache.key_prefix",
                    "prefix must not contain whitespace",
                ));
            }
            trimmed.to_string()
        }
        None => DEFAULT_CACHE_KEY_PREFIX.to_string(),
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        timeout: Duration::from_secs(timeout_seconds),
        key_prefix,
        anonymous_only: cache.anonymous_only.unwrap_or(false),
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let backend = match store.backend.as_deref().map(str::trim) {
        None | Some("memory") => StoreBackend::Memory,
        Some("redis") => StoreBackend::Redis,
        Some(other) => {
            return Err(LoadError::invalid(
                "store.backend",
                format!("unknown backend `{other}` (expected memory|redis)"),
            ));
        }
    };

    let redis_url = store.redis_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if backend == StoreBackend::Redis && redis_url.is_none() {
        return Err(LoadError::invalid(
            "store.redis_url",
            "required when store.backend = \"redis\"",
        ));
    }

    let capacity = store
        .memory_capacity
        .unwrap_or(DEFAULT_STORE_MEMORY_CAPACITY);
    let memory_capacity = NonZeroUsize::new(capacity)
        .ok_or_else(|| LoadError::invalid("store.memory_capacity", "must be greater than zero"))?;

    let timeout = positive_millis(
        store.timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
        "store.timeout_ms",
    )?;

    Ok(StoreSettings {
        backend,
        redis_url,
        memory_capacity,
        timeout,
    })
}

fn build_bus_settings(bus: RawBusSettings) -> Result<BusSettings, LoadError> {
    let host = bus.host.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let port = bus.port.unwrap_or(DEFAULT_BUS_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "bus.port",
            "port must be greater than zero",
        ));
    }

    let topic = bus.topic.unwrap_or_else(|| DEFAULT_BUS_TOPIC.to_string());
    if !topic.starts_with('/') {
        return Err(LoadError::invalid(
            "bus.topic",
            "destination must start with `/`",
        ));
    }

    Ok(BusSettings {
        host,
        port,
        topic,
        login: bus.login,
        passcode: bus.passcode,
        connect_timeout: positive_millis(
            bus.connect_timeout_ms
                .unwrap_or(DEFAULT_BUS_CONNECT_TIMEOUT_MS),
            "bus.connect_timeout_ms",
        )?,
        send_timeout: positive_millis(
            bus.send_timeout_ms.unwrap_or(DEFAULT_BUS_SEND_TIMEOUT_MS),
            "bus.send_timeout_ms",
        )?,
        reconnect_backoff: Duration::from_millis(
            bus.reconnect_backoff_ms
                .unwrap_or(DEFAULT_BUS_RECONNECT_BACKOFF_MS),
        ),
        registration_retention: positive_millis(
            bus.registration_retention_seconds
                .unwrap_or(DEFAULT_BUS_REGISTRATION_RETENTION_SECONDS)
                .saturating_mul(1000),
            "bus.registration_retention_seconds",
        )?,
        invalidate_before_commit: bus.invalidate_before_commit.unwrap_or(false),
        subscribe_in_process: bus.subscribe_in_process.unwrap_or(true),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    timeout_seconds: Option<u64>,
    key_prefix: Option<String>,
    anonymous_only: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<String>,
    redis_url: Option<String>,
    memory_capacity: Option<usize>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBusSettings {
    host: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
    login: Option<String>,
    passcode: Option<String>,
    connect_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    reconnect_backoff_ms: Option<u64>,
    registration_retention_seconds: Option<u64>,
    invalidate_before_commit: Option<bool>,
    subscribe_in_process: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

#[cfg(test)]
mod tests;
