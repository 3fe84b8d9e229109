use crate::rules::RuleConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upstream endpoints, in fleet order. Fleet order is also the
    /// tie-break order for quorum reads.
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub endpoint: EndpointTuning,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub abi: AbiConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Stable name used in logs and recovery messages.
    pub name: String,
    /// JSON-RPC URL the endpoint reads from.
    pub rpc_url: String,
    #[serde(default)]
    pub role: RoleKind,
    /// Required when `role = "managed"`.
    #[serde(default)]
    pub container: Option<ContainerConfig>,
    /// Administrative method used to re-point a managed node at a new upstream.
    #[serde(default = "default_reset_method")]
    pub reset_method: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Managed,
    #[default]
    Unmanaged,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    /// Container image, e.g. "ghcr.io/foundry-rs/foundry:latest".
    pub image: String,
    /// Container name; defaults to the node name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Extra arguments appended after the image (the node's command line).
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointTuning {
    /// Readiness poll attempts after a start or reset.
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,
    /// Spacing between readiness poll attempts.
    #[serde(default = "default_readiness_interval_ms")]
    pub readiness_interval_ms: u64,
    /// Wait before re-probing an unmanaged endpoint during recovery.
    #[serde(default = "default_recovery_backoff_ms")]
    pub recovery_backoff_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream archive URL managed nodes fork from. Empty = leave as started.
    #[serde(default)]
    pub fork_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CycleConfig {
    #[serde(default = "default_cycle_interval_secs")]
    pub interval_secs: u64,
    /// Healthchecks-style ping URL. Empty = log-only signals.
    #[serde(default)]
    pub heartbeat_url: String,
    /// Where outbound transactions are appended (JSON lines).
    #[serde(default = "default_queue_path")]
    pub queue_path: String,
    /// Default in-flight ceiling for fan-out rules.
    #[serde(default = "default_fan_out_concurrency")]
    pub fan_out_concurrency: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AbiConfig {
    /// Etherscan-compatible API base URL. Empty = inline ABIs only.
    #[serde(default)]
    pub explorer_url: String,
    /// Loaded from env SENTINEL_EXPLORER_API_KEY.
    #[serde(default)]
    pub explorer_api_key: String,
    /// address (any case) → ABI JSON
    #[serde(default)]
    pub inline: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_reset_method() -> String {
    "anvil_reset".to_string()
}
fn default_readiness_attempts() -> u32 {
    8
}
fn default_readiness_interval_ms() -> u64 {
    3_000
}
fn default_recovery_backoff_ms() -> u64 {
    10_000
}
fn default_cycle_interval_secs() -> u64 {
    60
}
fn default_queue_path() -> String {
    "sentinel-queue.jsonl".to_string()
}
fn default_fan_out_concurrency() -> usize {
    8
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EndpointTuning {
    fn default() -> Self {
        Self {
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_ms: default_readiness_interval_ms(),
            recovery_backoff_ms: default_recovery_backoff_ms(),
        }
    }
}

impl EndpointTuning {
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn recovery_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_ms)
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cycle_interval_secs(),
            heartbeat_url: String::new(),
            queue_path: default_queue_path(),
            fan_out_concurrency: default_fan_out_concurrency(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.overlay_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without touching the environment.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Build a config from env only (no file needed). Every URL in
    /// SENTINEL_RPC_URLS becomes an unmanaged endpoint.
    pub fn from_env() -> Result<Self, ConfigError> {
        let urls = std::env::var("SENTINEL_RPC_URLS")
            .map_err(|_| ConfigError::MissingEnv("SENTINEL_RPC_URLS".to_string()))?;

        let nodes: Vec<NodeConfig> = urls
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .enumerate()
            .map(|(i, url)| NodeConfig {
                name: format!("rpc-{}", i + 1),
                rpc_url: url.to_string(),
                role: RoleKind::Unmanaged,
                container: None,
                reset_method: default_reset_method(),
            })
            .collect();

        let mut config = Config {
            nodes,
            endpoint: EndpointTuning::default(),
            upstream: UpstreamConfig::default(),
            cycle: CycleConfig::default(),
            abi: AbiConfig::default(),
            rules: Vec::new(),
            logging: LoggingConfig::default(),
        };
        config.overlay_env();
        config.validate()?;
        Ok(config)
    }

    // Secrets never live in the config file.
    fn overlay_env(&mut self) {
        if let Ok(key) = std::env::var("SENTINEL_EXPLORER_API_KEY") {
            self.abi.explorer_api_key = key;
        }
        if let Ok(url) = std::env::var("SENTINEL_HEARTBEAT_URL") {
            self.cycle.heartbeat_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("at least one node is required".to_string()));
        }
        if self.cycle.fan_out_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "cycle.fan_out_concurrency must be at least 1".to_string(),
            ));
        }
        for node in &self.nodes {
            if node.role == RoleKind::Managed && node.container.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "node {} is managed but has no [container] section",
                    node.name
                )));
            }
        }
        Ok(())
    }
}
