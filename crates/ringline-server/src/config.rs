//! Server configuration.
//!
//! Configuration is layered:
//! - Defaults baked into the structs below
//! - A TOML file (`--config`, or the first of the search paths that exists)
//! - Environment variables (`RINGLINE__SECTION__KEY`, e.g. `RINGLINE__PRESENCE__GRACE_PERIOD_MS`)
//!
//! Durations are milliseconds. A zero disables optional timers.

use anyhow::{Context, Result};
use ringline_core::{CallConfig, PresenceConfig, RateLimitConfig, RateRule, RouterConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files tried, in order, when no path is given.
const SEARCH_PATHS: [&str; 3] = [
    "ringline.toml",
    "/etc/ringline/ringline.toml",
    "~/.config/ringline/ringline.toml",
];

const ENV_PREFIX: &str = "RINGLINE";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub presence: PresenceSection,

    #[serde(default)]
    pub calls: CallsSection,

    #[serde(default)]
    pub rate_limits: RateLimitsSection,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which listener accepts WebSocket clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Listener {
    /// axum HTTP server upgrading requests on `websocket_path`.
    Axum,
    /// Bare tokio-tungstenite listener; any path is accepted.
    Tungstenite,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_listener")]
    pub listener: Listener,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Time a client has to send its `connect` frame.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Presence tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSection {
    /// Silence after which an identity goes offline.
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,

    /// Silence after which an identity is reported away. Zero disables.
    #[serde(default = "default_away_after")]
    pub away_after_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Push presence changes to every connected client.
    #[serde(default = "default_true")]
    pub broadcast: bool,
}

/// Call lifecycle timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsSection {
    #[serde(default = "default_ringing_timeout")]
    pub ringing_timeout_ms: u64,

    /// Zero disables the inactivity timeout.
    #[serde(default = "default_inactivity_timeout")]
    pub connected_inactivity_timeout_ms: u64,

    /// How long ended calls stay queryable.
    #[serde(default = "default_terminal_retention")]
    pub terminal_retention_ms: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,
}

/// One sliding-window budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub window_ms: u64,
    pub max: u32,
}

impl RuleConfig {
    fn to_rule(self) -> RateRule {
        RateRule::new(self.max, Duration::from_millis(self.window_ms))
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.window_ms == 0 {
            anyhow::bail!("rate_limits.{name}.window_ms must be positive");
        }
        if self.max == 0 {
            anyhow::bail!("rate_limits.{name}.max must be positive");
        }
        Ok(())
    }
}

/// Rate limits per action class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsSection {
    #[serde(default = "default_call_initiate")]
    pub call_initiate: RuleConfig,

    #[serde(default = "default_signaling_message")]
    pub signaling_message: RuleConfig,

    #[serde(default = "default_heartbeat")]
    pub heartbeat: RuleConfig,

    /// Budget shared by both participants of a call. `max = 0` disables.
    #[serde(default = "default_per_call")]
    pub per_call: RuleConfig,
}

/// Transition audit log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSON-lines file to append transitions to. Logged through tracing when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_listener() -> Listener {
    Listener::Axum
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_grace_period() -> u64 {
    30_000
}

fn default_away_after() -> u64 {
    15_000
}

fn default_sweep_interval() -> u64 {
    5_000
}

fn default_ringing_timeout() -> u64 {
    60_000
}

fn default_inactivity_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_terminal_retention() -> u64 {
    60_000
}

fn default_reap_interval() -> u64 {
    10_000
}

fn default_call_initiate() -> RuleConfig {
    RuleConfig {
        window_ms: 60_000,
        max: 5,
    }
}

fn default_signaling_message() -> RuleConfig {
    RuleConfig {
        window_ms: 10_000,
        max: 200,
    }
}

fn default_heartbeat() -> RuleConfig {
    RuleConfig {
        window_ms: 60_000,
        max: 20,
    }
}

fn default_per_call() -> RuleConfig {
    RuleConfig {
        window_ms: 10_000,
        max: 400,
    }
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            presence: PresenceSection::default(),
            calls: CallsSection::default(),
            rate_limits: RateLimitsSection::default(),
            audit: AuditConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listener: default_listener(),
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period(),
            away_after_ms: default_away_after(),
            sweep_interval_ms: default_sweep_interval(),
            broadcast: true,
        }
    }
}

impl Default for CallsSection {
    fn default() -> Self {
        Self {
            ringing_timeout_ms: default_ringing_timeout(),
            connected_inactivity_timeout_ms: default_inactivity_timeout(),
            terminal_retention_ms: default_terminal_retention(),
            reap_interval_ms: default_reap_interval(),
        }
    }
}

impl Default for RateLimitsSection {
    fn default() -> Self {
        Self {
            call_initiate: default_call_initiate(),
            signaling_message: default_signaling_message(),
            heartbeat: default_heartbeat(),
            per_call: default_per_call(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| millis(ms))
}

impl Config {
    /// Load configuration.
    ///
    /// Reads `path` if given, else the first search path that exists, then
    /// applies `RINGLINE__*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit path is missing or if any source
    /// cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Some(path.to_path_buf())
            }
            None => Self::find_file(),
        };

        let mut builder = ::config::Config::builder();
        if let Some(file) = &file {
            tracing::debug!("Loading config from {}", file.display());
            builder = builder.add_source(::config::File::from(file.as_path()));
        }
        let layered = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        let config: Self = layered.try_deserialize().with_context(|| match &file {
            Some(file) => format!("Failed to parse config file: {}", file.display()),
            None => "Failed to parse configuration from environment".to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn find_file() -> Option<PathBuf> {
        SEARCH_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the services cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.transport.max_message_size == 0 {
            anyhow::bail!("transport.max_message_size must be positive");
        }
        if self.transport.handshake_timeout_ms == 0 {
            anyhow::bail!("transport.handshake_timeout_ms must be positive");
        }

        let presence = &self.presence;
        if presence.grace_period_ms == 0 {
            anyhow::bail!("presence.grace_period_ms must be positive");
        }
        if presence.sweep_interval_ms == 0 {
            anyhow::bail!("presence.sweep_interval_ms must be positive");
        }
        if presence.away_after_ms >= presence.grace_period_ms {
            anyhow::bail!(
                "presence.away_after_ms ({}) must be below presence.grace_period_ms ({})",
                presence.away_after_ms,
                presence.grace_period_ms
            );
        }

        if self.calls.ringing_timeout_ms == 0 {
            anyhow::bail!("calls.ringing_timeout_ms must be positive");
        }
        if self.calls.reap_interval_ms == 0 {
            anyhow::bail!("calls.reap_interval_ms must be positive");
        }

        let limits = &self.rate_limits;
        limits.call_initiate.validate("call_initiate")?;
        limits.signaling_message.validate("signaling_message")?;
        limits.heartbeat.validate("heartbeat")?;
        // max = 0 switches the per-call budget off.
        if limits.per_call.max > 0 {
            limits.per_call.validate("per_call")?;
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    pub fn handshake_timeout(&self) -> Duration {
        millis(self.transport.handshake_timeout_ms)
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            grace_period: millis(self.presence.grace_period_ms),
            away_after: optional_millis(self.presence.away_after_ms),
            sweep_interval: millis(self.presence.sweep_interval_ms),
            ..PresenceConfig::default()
        }
    }

    pub fn call_config(&self) -> CallConfig {
        CallConfig {
            ringing_timeout: millis(self.calls.ringing_timeout_ms),
            connected_inactivity_timeout: optional_millis(
                self.calls.connected_inactivity_timeout_ms,
            ),
            terminal_retention: millis(self.calls.terminal_retention_ms),
            reap_interval: millis(self.calls.reap_interval_ms),
            ..CallConfig::default()
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let limits = &self.rate_limits;
        RateLimitConfig {
            call_initiate: limits.call_initiate.to_rule(),
            signaling_message: limits.signaling_message.to_rule(),
            heartbeat: limits.heartbeat.to_rule(),
            per_call: (limits.per_call.max > 0).then(|| limits.per_call.to_rule()),
            ..RateLimitConfig::default()
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            presence_broadcast: self.presence.broadcast,
        }
    }
}
