//! Guard Orchestrator Library
//!
//! Routing gateway for the backend "guard" microservices (token, trust,
//! context, bias and health analysis).
//!
//! This library provides:
//! - A service registry with URL/name validation and priority ordering
//! - Active health monitoring with bounded concurrency
//! - Per-service circuit breakers (closed / open / half-open)
//! - An orchestrator that dispatches a request to the best live instance
//!   and falls back to the next one on failure
//! - Static and manifest/endpoint based service discovery
//!
//! # Quick Start
//!
//! ```no_run
//! use guard_orchestrator::{
//!     config::OrchestratorConfig,
//!     models::{GuardServiceType, OrchestrationRequest, ServiceConfig},
//!     orchestrator::Orchestrator,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Arc::new(Orchestrator::with_http_dispatcher(
//!         OrchestratorConfig::default(),
//!     )?);
//!     orchestrator.init().await?;
//!
//!     orchestrator.register_service(ServiceConfig::new(
//!         "token-primary",
//!         "https://token.guards.internal",
//!         GuardServiceType::Token,
//!     ))?;
//!
//!     let response = orchestrator
//!         .orchestrate(OrchestrationRequest::new("token", serde_json::Map::new()))
//!         .await?;
//!     println!("served by {:?}", response.service_used);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod registry;

// Re-export commonly used types
pub use circuit_breaker::CircuitBreakerService;
pub use config::{Args, OrchestratorConfig};
pub use discovery::{HttpDiscovery, ManifestDiscovery, ServiceDiscovery};
pub use dispatch::{DispatchCall, GuardDispatcher, HttpDispatcher};
pub use error::{DispatchError, OrchestratorError, Result};
pub use health::{HealthMonitor, HealthMonitoringStats};
pub use models::{
    CircuitBreakerSnapshot, CircuitState, DispatchErrorKind, GuardServiceType, HealthStatus,
    OrchestrationRequest, OrchestrationResponse, ServiceConfig, ServiceHealth,
};
pub use orchestrator::Orchestrator;
pub use registry::ServiceRegistry;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default gateway port
pub const DEFAULT_PORT: u16 = 8080;

/// Default health check interval in seconds
pub const DEFAULT_HEALTH_CHECK_INTERVAL: u64 = 30;

/// Maximum number of concurrent health probes
pub const MAX_CONCURRENT_HEALTH_CHECKS: usize = 16;

/// Maximum length of a service name
pub const MAX_SERVICE_NAME_LENGTH: usize = 100;

/// Circuit breaker default settings
pub mod circuit_breaker_defaults {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_OPEN_DURATION_MS: u64 = 30_000;
}

/// Health check default settings
pub mod health_check {
    pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
    pub const DEFAULT_DEGRADED_THRESHOLD_MS: u64 = 2_000;
    pub const DEFAULT_HTTP_PATH: &str = "/health";
}

/// Dispatch default settings
pub mod dispatch_defaults {
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
    pub const USER_AGENT: &str = concat!("guard-orchestrator/", env!("CARGO_PKG_VERSION"));
}

/// Utility functions and helpers
pub mod utils {
    use crate::OrchestratorError;
    use once_cell::sync::Lazy;
    use regex::Regex;

    static SERVICE_NAME_PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("service name pattern is valid"));

    /// Validate a service name: ASCII letters, digits, `_` and `-` only
    pub fn validate_service_name(name: &str) -> Result<(), OrchestratorError> {
        if name.is_empty() {
            return Err(OrchestratorError::invalid_config(
                "name",
                "service name must not be empty",
            ));
        }

        if name.len() > crate::MAX_SERVICE_NAME_LENGTH {
            return Err(OrchestratorError::invalid_config(
                "name",
                format!(
                    "service name exceeds {} characters",
                    crate::MAX_SERVICE_NAME_LENGTH
                ),
            ));
        }

        if !SERVICE_NAME_PATTERN.is_match(name) {
            return Err(OrchestratorError::invalid_config(
                "name",
                format!("service name '{}' contains invalid characters", name),
            ));
        }

        Ok(())
    }

    /// Join a base URL and a relative path with exactly one `/` between them.
    pub fn join_url(base: &str, path: &str) -> String {
        let base = base.trim_end_matches('/');
        if path.is_empty() {
            return base.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        config::OrchestratorConfig,
        dispatch::{GuardDispatcher, HttpDispatcher},
        models::{
            GuardServiceType, HealthStatus, OrchestrationRequest, OrchestrationResponse,
            ServiceConfig, ServiceHealth,
        },
        orchestrator::Orchestrator,
        utils, OrchestratorError, Result,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_validate_service_name() {
        assert!(utils::validate_service_name("svc-a").is_ok());
        assert!(utils::validate_service_name("token_guard_2").is_ok());
        assert!(utils::validate_service_name("").is_err());
        assert!(utils::validate_service_name("bad name!").is_err());
        assert!(utils::validate_service_name("../etc/passwd").is_err());
        assert!(utils::validate_service_name("svc;rm -rf").is_err());
        assert!(utils::validate_service_name(&"a".repeat(101)).is_err());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            utils::join_url("http://svc:8000/", "/health"),
            "http://svc:8000/health"
        );
        assert_eq!(
            utils::join_url("http://svc:8000", "health"),
            "http://svc:8000/health"
        );
        assert_eq!(utils::join_url("http://svc:8000/", ""), "http://svc:8000");
    }
}
