//! Guard Orchestrator Configuration Module
//!
//! Handles loading, validation, and management of orchestrator configuration
//! from files, environment variables, and command-line arguments.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::ServiceConfig;
use crate::{circuit_breaker_defaults, dispatch_defaults, health_check};

/// Main orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deployment environment name
    pub environment: String,

    /// Server configuration
    pub server: ServerConfig,

    /// Service registry configuration
    pub registry: RegistryConfig,

    /// Health monitoring configuration
    pub health: HealthConfig,

    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,

    /// Dispatch configuration
    pub dispatch: DispatchConfig,

    /// Service discovery configuration
    pub discovery: DiscoveryConfig,

    /// Statically configured services, registered at init
    pub services: Vec<ServiceConfig>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Maximum request body size in bytes
    pub body_limit_bytes: usize,

    /// Time background tasks get to finish at shutdown, in milliseconds
    pub shutdown_grace_period_ms: u64,
}

impl ServerConfig {
    /// Get the server socket address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Invalid server address")
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: crate::DEFAULT_PORT,
            body_limit_bytes: 1024 * 1024,
            shutdown_grace_period_ms: 5_000,
        }
    }
}

/// Service registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Production mode rejects loopback service URLs
    pub production: bool,

    /// Allow loopback URLs even in production
    pub allow_localhost: bool,
}

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Run the background health loop
    pub enabled: bool,

    /// Probe interval in seconds
    pub interval_secs: u64,

    /// Per-probe timeout in milliseconds
    pub timeout_ms: u64,

    /// Successful probes slower than this are reported as degraded
    pub degraded_threshold_ms: u64,

    /// Maximum concurrent probes
    pub max_concurrent_probes: usize,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn degraded_threshold(&self) -> Duration {
        Duration::from_millis(self.degraded_threshold_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: crate::DEFAULT_HEALTH_CHECK_INTERVAL,
            timeout_ms: health_check::DEFAULT_TIMEOUT_MS,
            degraded_threshold_ms: health_check::DEFAULT_DEGRADED_THRESHOLD_MS,
            max_concurrent_probes: crate::MAX_CONCURRENT_HEALTH_CHECKS,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// How long an open breaker rejects calls, in milliseconds
    pub open_duration_ms: u64,

    /// Per-service overrides keyed by service name
    pub overrides: HashMap<String, CircuitBreakerOverride>,
}

/// Per-service circuit breaker override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerOverride {
    pub failure_threshold: Option<u32>,
    pub open_duration_ms: Option<u64>,
}

/// Effective breaker settings for one service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl CircuitBreakerConfig {
    /// Resolve settings for a service, applying any override
    pub fn settings_for(&self, service_name: &str) -> BreakerSettings {
        let overrides = self.overrides.get(service_name);
        BreakerSettings {
            failure_threshold: overrides
                .and_then(|o| o.failure_threshold)
                .unwrap_or(self.failure_threshold)
                .max(1),
            open_duration: Duration::from_millis(
                overrides
                    .and_then(|o| o.open_duration_ms)
                    .unwrap_or(self.open_duration_ms),
            ),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: circuit_breaker_defaults::DEFAULT_FAILURE_THRESHOLD,
            open_duration_ms: circuit_breaker_defaults::DEFAULT_OPEN_DURATION_MS,
            overrides: HashMap::new(),
        }
    }
}

/// Dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Timeout used when neither the request nor the service sets one
    pub default_timeout_ms: u64,

    /// User agent sent on dispatch and probe requests
    pub user_agent: String,
}

impl DispatchConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: dispatch_defaults::DEFAULT_TIMEOUT_MS,
            user_agent: dispatch_defaults::USER_AGENT.to_string(),
        }
    }
}

/// Service discovery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// YAML or JSON manifest listing services
    pub manifest_path: Option<PathBuf>,

    /// Discovery endpoint returning a JSON list of services
    pub endpoint: Option<String>,

    /// Re-run discovery every N seconds; discovery runs once at init otherwise
    pub interval_secs: Option<u64>,
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level / env filter directive
    pub level: String,

    /// Output format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(
    name = "guard-orchestrator",
    about = "Guard orchestration gateway",
    version
)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/guard-orchestrator.yaml")]
    pub config: PathBuf,

    /// Environment (development, production)
    #[arg(short, long, env = "GUARD_ORCHESTRATOR_ENV", default_value = "development")]
    pub environment: String,

    /// Server port (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Force production registry validation
    #[arg(long)]
    pub production: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl OrchestratorConfig {
    /// Load configuration from file and environment variables
    pub fn load(args: &Args) -> Result<Self> {
        let mut settings = config::Config::builder();

        // Load base configuration file
        if args.config.exists() {
            settings = settings.add_source(config::File::from(args.config.clone()).required(false));
        }

        // Add environment-specific overrides
        let env_file = format!("config/guard-orchestrator-{}", args.environment);
        settings = settings.add_source(config::File::with_name(&env_file).required(false));

        // Add environment variables with prefix
        settings = settings.add_source(
            config::Environment::with_prefix("GUARD_ORCHESTRATOR").separator("__"),
        );

        let mut config: OrchestratorConfig = settings
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.environment = args.environment.clone();

        // Apply command-line overrides
        if let Some(port) = args.port {
            config.server.port = port;
        }

        if let Some(ref log_level) = args.log_level {
            config.logging.level = log_level.clone();
        }

        if args.debug {
            config.logging.level = "debug".to_string();
        }

        if args.production || config.environment == "production" {
            config.registry.production = true;
        }

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.health.enabled {
            if self.health.interval_secs == 0 {
                return Err(anyhow::anyhow!(
                    "Health check interval must be greater than 0"
                ));
            }

            if self.health.timeout() >= self.health.interval() {
                return Err(anyhow::anyhow!(
                    "Health check timeout must be less than interval"
                ));
            }
        }

        if self.health.max_concurrent_probes == 0 {
            return Err(anyhow::anyhow!(
                "Health check concurrency must be greater than 0"
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(anyhow::anyhow!(
                "Circuit breaker failure threshold must be greater than 0"
            ));
        }

        if self.dispatch.default_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Dispatch timeout must be greater than 0"));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format: {}. Valid formats: {:?}",
                self.logging.format,
                valid_formats
            ));
        }

        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            health: HealthConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dispatch: DispatchConfig::default(),
            discovery: DiscoveryConfig::default(),
            services: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.registry.production);
        assert_eq!(config.health.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = OrchestratorConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.health.timeout_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_breaker_overrides() {
        let mut config = CircuitBreakerConfig::default();
        config.overrides.insert(
            "bias-slow".to_string(),
            CircuitBreakerOverride {
                failure_threshold: Some(10),
                open_duration_ms: None,
            },
        );

        let slow = config.settings_for("bias-slow");
        assert_eq!(slow.failure_threshold, 10);
        assert_eq!(
            slow.open_duration,
            Duration::from_millis(circuit_breaker_defaults::DEFAULT_OPEN_DURATION_MS)
        );

        let other = config.settings_for("token-a");
        assert_eq!(
            other.failure_threshold,
            circuit_breaker_defaults::DEFAULT_FAILURE_THRESHOLD
        );
    }

    #[test]
    fn test_load_from_file_with_cli_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
server:
  port: 9100
circuit_breaker:
  failure_threshold: 3
services:
  - name: token-a
    base_url: https://token-a.internal
    service_type: token
    priority: 1
"#
        )
        .unwrap();

        let args = Args {
            config: file.path().to_path_buf(),
            environment: "staging".to_string(),
            port: None,
            log_level: Some("debug".to_string()),
            production: true,
            debug: false,
        };

        let config = OrchestratorConfig::load(&args).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].health_endpoint, "/health");
        assert_eq!(config.logging.level, "debug");
        assert!(config.registry.production);
        assert_eq!(config.environment, "staging");
    }
}
