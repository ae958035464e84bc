//! Configuration management for Sluice.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then environment variable overrides (`ALGORITHM`, `FAIL_MODE`, `STORE_*`,
//! `BREAKER_*`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LimiterError, Result};

/// Admission algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
}

impl FromStr for AlgorithmKind {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token_bucket" => Ok(AlgorithmKind::TokenBucket),
            "fixed_window" => Ok(AlgorithmKind::FixedWindow),
            "sliding_window" => Ok(AlgorithmKind::SlidingWindow),
            other => Err(LimiterError::Config(format!(
                "unknown algorithm: {other:?} (expected token_bucket, fixed_window or sliding_window)"
            ))),
        }
    }
}

impl std::fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlgorithmKind::TokenBucket => "token_bucket",
            AlgorithmKind::FixedWindow => "fixed_window",
            AlgorithmKind::SlidingWindow => "sliding_window",
        };
        write!(f, "{name}")
    }
}

/// Behaviour when the backing store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit requests while the store is down.
    Open,
    /// Reject requests with 503 while the store is down.
    Closed,
}

impl FromStr for FailMode {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            other => Err(LimiterError::Config(format!(
                "unknown fail mode: {other:?} (expected open or closed)"
            ))),
        }
    }
}

impl std::fmt::Display for FailMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailMode::Open => write!(f, "open"),
            FailMode::Closed => write!(f, "closed"),
        }
    }
}

/// Main configuration for the Sluice service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Service name used in logs and the health response
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            service_name: default_service_name(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8000".parse().unwrap()
}

fn default_service_name() -> String {
    "limiter".to_string()
}

/// Backing store (Redis) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_host")]
    pub host: String,

    #[serde(default = "default_store_port")]
    pub port: u16,

    #[serde(default)]
    pub db: u32,

    /// Per-call deadline in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: default_store_port(),
            db: 0,
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Connection URL for the backing store.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    /// Per-call deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    6379
}

fn default_store_timeout_ms() -> u64 {
    100
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds to wait in OPEN before admitting a probe
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Selected admission algorithm
    #[serde(default = "default_algorithm")]
    pub algorithm: AlgorithmKind,

    /// Behaviour on store failure
    #[serde(default = "default_fail_mode")]
    pub fail_mode: FailMode,

    /// Path to a rate limit rules file
    pub rules_path: Option<String>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            fail_mode: default_fail_mode(),
            rules_path: None,
        }
    }
}

fn default_algorithm() -> AlgorithmKind {
    AlgorithmKind::TokenBucket
}

fn default_fail_mode() -> FailMode {
    FailMode::Open
}

impl LimiterConfig {
    /// Load configuration: defaults, then the optional file, then environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    fn apply_env_from<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = var("ALGORITHM") {
            self.rate_limiting.algorithm = value.parse()?;
        }
        if let Some(value) = var("FAIL_MODE") {
            self.rate_limiting.fail_mode = value.parse()?;
        }
        if let Some(value) = var("RULES_PATH") {
            self.rate_limiting.rules_path = Some(value);
        }
        if let Some(value) = var("STORE_HOST") {
            self.store.host = value;
        }
        if let Some(value) = var("STORE_PORT") {
            self.store.port = parse_env("STORE_PORT", &value)?;
        }
        if let Some(value) = var("STORE_DB") {
            self.store.db = parse_env("STORE_DB", &value)?;
        }
        if let Some(value) = var("STORE_TIMEOUT_MS") {
            self.store.timeout_ms = parse_env("STORE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("BREAKER_THRESHOLD") {
            self.breaker.failure_threshold = parse_env("BREAKER_THRESHOLD", &value)?;
        }
        if let Some(value) = var("BREAKER_COOLDOWN_SECONDS") {
            self.breaker.cooldown_secs = parse_env("BREAKER_COOLDOWN_SECONDS", &value)?;
        }
        if let Some(value) = var("SERVICE_NAME") {
            self.server.service_name = value;
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| LimiterError::Config(format!("invalid value for {name}: {value:?}")))
}
