//! Runtime configuration.
//!
//! Layered the usual way: built-in defaults, an optional TOML/JSON/YAML file,
//! then `MDSYNC__`-prefixed environment variables (`MDSYNC__RECONNECT__ENABLED=true`).

use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StreamError;
use crate::stream::client::ClientOptions;
use crate::stream::connection::{ConnectionSettings, HeartbeatPolicy, ReconnectPolicy};
use crate::stream::state::CacheLimits;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub trades_limit: usize,
    pub orders_limit: usize,
    pub ohlcv_limit: usize,
    pub order_book_depth: Option<usize>,
    pub new_updates: bool,
    pub watch_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub upbit: UpbitConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            trades_limit: 1000,
            orders_limit: 1000,
            ohlcv_limit: 1000,
            order_book_depth: Some(15),
            new_updates: true,
            watch_timeout_ms: None,
            connect_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            upbit: UpbitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub reconnect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 10,
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            reconnect_timeout_ms: 60_000,
        }
    }
}

/// Pings are off unless `ping_interval_ms` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub ping_interval_ms: Option<u64>,
    pub pong_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpbitConfig {
    pub hostname: String,
    /// Overrides the URL derived from `hostname`.
    pub ws_url: Option<String>,
    pub rest_url: Option<String>,
    /// Pre-signed JWT for `myOrder` / `myAsset`.
    pub token: Option<String>,
}

impl Default for UpbitConfig {
    fn default() -> Self {
        Self { hostname: "api.upbit.com".into(), ws_url: None, rest_url: None, token: None }
    }
}

impl UpbitConfig {
    pub fn ws_url(&self) -> String {
        self.ws_url.clone().unwrap_or_else(|| format!("wss://{}/websocket/v1", self.hostname))
    }

    pub fn rest_url(&self) -> String {
        self.rest_url.clone().unwrap_or_else(|| format!("https://{}", self.hostname))
    }
}

impl StreamConfig {
    /// Defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, StreamError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading config file");
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("MDSYNC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let config = builder.build().map_err(|e| StreamError::Config(e.to_string()))?;
        let parsed: StreamConfig = config.try_deserialize().map_err(|e| StreamError::Config(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.reconnect.enabled && self.reconnect.max_attempts == 0 {
            return Err(StreamError::Config("reconnect.max_attempts must be at least 1".into()));
        }
        if self.heartbeat.pong_timeout_ms.is_some() && self.heartbeat.ping_interval_ms.is_none() {
            return Err(StreamError::Config("heartbeat.pong_timeout_ms needs ping_interval_ms".into()));
        }
        if self.heartbeat.ping_interval_ms == Some(0) || self.heartbeat.pong_timeout_ms == Some(0) {
            return Err(StreamError::Config("heartbeat intervals must be positive".into()));
        }
        self.connection_settings().validate()
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        let reconnect = self.reconnect.enabled.then(|| ReconnectPolicy {
            max_attempts: self.reconnect.max_attempts,
            initial_backoff: Duration::from_millis(self.reconnect.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.reconnect.max_backoff_ms),
            reconnect_timeout: Duration::from_millis(self.reconnect.reconnect_timeout_ms),
        });
        let heartbeat = self.heartbeat.ping_interval_ms.map(|ping| HeartbeatPolicy {
            ping_interval: Duration::from_millis(ping),
            pong_timeout: Duration::from_millis(self.heartbeat.pong_timeout_ms.unwrap_or(ping)),
        });
        ConnectionSettings { connect_timeout: Duration::from_millis(self.connect_timeout_ms), reconnect, heartbeat }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            limits: CacheLimits {
                trades: self.trades_limit,
                orders: self.orders_limit,
                ohlcv: self.ohlcv_limit,
                order_book_depth: self.order_book_depth,
            },
            new_updates: self.new_updates,
            watch_timeout: self.watch_timeout_ms.map(Duration::from_millis),
            connection: self.connection_settings(),
        }
    }
}
