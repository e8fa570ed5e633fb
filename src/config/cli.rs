use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the quire binary.
#[derive(Debug, Parser)]
#[command(name = "quire", version, about = "Quire publishing server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "QUIRE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the public HTTP service with the response cache.
    Serve(Box<ServeArgs>),
    /// Consume invalidation messages from the broker and evict cached pages.
    Subscribe(SubscribeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SubscribeArgs {
    #[command(flatten)]
    pub broker: BrokerOverrides,

    #[command(flatten)]
    pub store: StoreOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BrokerOverrides {
    /// Override the STOMP broker host; enables invalidation publishing.
    #[arg(long = "bus-host", value_name = "HOST")]
    pub bus_host: Option<String>,

    /// Override the STOMP broker port.
    #[arg(long = "bus-port", value_name = "PORT")]
    pub bus_port: Option<u16>,

    /// Override the invalidation topic.
    #[arg(long = "bus-topic", value_name = "DESTINATION")]
    pub bus_topic: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the response store backend (memory|redis).
    #[arg(long = "store-backend", value_name = "BACKEND")]
    pub store_backend: Option<String>,

    /// Override the Redis connection URL.
    #[arg(long = "store-redis-url", value_name = "URL")]
    pub store_redis_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub broker: BrokerOverrides,

    #[command(flatten)]
    pub store: StoreOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the default TTL of cached responses.
    #[arg(long = "cache-timeout-seconds", value_name = "SECONDS")]
    pub cache_timeout_seconds: Option<u64>,

    /// Override the cache key namespace.
    #[arg(long = "cache-key-prefix", value_name = "PREFIX")]
    pub cache_key_prefix: Option<String>,

    /// Restrict caching to anonymous requests.
    #[arg(
        long = "cache-anonymous-only",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_anonymous_only: Option<bool>,
}
