use crate::error::GateError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gatekeeper
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// TCP gatekeeper settings
    pub gate: GateConfig,

    /// Control-plane HTTP API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Container engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Settings for the TCP listener and connection lifecycle
#[derive(Debug, Deserialize, Clone)]
pub struct GateConfig {
    /// TCP port to listen on (required)
    pub port: u16,

    /// Container image to provision for each session (required)
    pub image: String,

    /// Port the in-container service listens on (required)
    pub container_port: u16,

    /// Keep one container warm per source address instead of one per
    /// connection (default: false)
    #[serde(default)]
    pub reuse: bool,

    /// Minimum spacing between admissions per source address, in
    /// milliseconds (default: 0 = disabled). Only applies when `reuse`
    /// is false.
    #[serde(default)]
    pub rate_limit_ms: u64,

    /// Hard cap on session duration in milliseconds (default: 0 = unlimited)
    #[serde(default)]
    pub timeout_ms: u64,

    /// How long a reused container survives with zero active connections
    /// before it is reclaimed, in milliseconds (default: 60000)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Process-count cap passed through to the container engine.
    /// Unset containers still get a cap of 20.
    pub pids_limit: Option<i64>,
}

/// Settings for the control-plane HTTP API
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Port for the control-plane API on loopback (default: 0 = disabled)
    #[serde(default)]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 0 }
    }
}

/// Settings for connecting to the container engine
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    /// Docker host URL, e.g. "unix:///var/run/docker.sock" or
    /// "tcp://127.0.0.1:2375". Falls back to DOCKER_HOST and then the
    /// platform socket default.
    pub docker_host: Option<String>,
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

impl GateConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Hard session cap, or `None` when unlimited
    pub fn session_deadline(&self) -> Option<Duration> {
        if self.timeout_ms > 0 {
            Some(Duration::from_millis(self.timeout_ms))
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<(), GateError> {
        if self.port == 0 {
            return Err(GateError::MissingField("gate.port"));
        }
        if self.image.is_empty() {
            return Err(GateError::MissingField("gate.image"));
        }
        if self.container_port == 0 {
            return Err(GateError::MissingField("gate.container_port"));
        }
        if self.reuse && self.idle_timeout_ms == 0 {
            return Err(GateError::Config(
                "gate.idle_timeout_ms must be nonzero when reuse is enabled".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration before any listener is started
    pub fn validate(&self) -> anyhow::Result<()> {
        self.gate.validate()?;
        Ok(())
    }
}
