//! Guard Orchestrator Models
//!
//! Core data structures for the guard orchestration gateway.
//! Provides types for service configuration, health snapshots, circuit breaker
//! state, and orchestration requests/responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::utils;

/// Kind of guard a backend service performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardServiceType {
    /// Token validation
    Token,
    /// Trust scoring
    Trust,
    /// Context analysis
    Context,
    /// Bias detection
    Bias,
    /// Content health analysis
    Health,
}

impl GuardServiceType {
    pub const ALL: [GuardServiceType; 5] = [
        GuardServiceType::Token,
        GuardServiceType::Trust,
        GuardServiceType::Context,
        GuardServiceType::Bias,
        GuardServiceType::Health,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GuardServiceType::Token => "token",
            GuardServiceType::Trust => "trust",
            GuardServiceType::Context => "context",
            GuardServiceType::Bias => "bias",
            GuardServiceType::Health => "health",
        }
    }
}

impl fmt::Display for GuardServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuardServiceType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        GuardServiceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| OrchestratorError::invalid_service_type(s))
    }
}

fn default_health_endpoint() -> String {
    crate::health_check::DEFAULT_HTTP_PATH.to_string()
}

fn default_enabled() -> bool {
    true
}

/// Configuration of one backend guard service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name (`[A-Za-z0-9_-]+`)
    pub name: String,

    /// Base URL of the service (http or https)
    pub base_url: String,

    /// Kind of guard this service performs
    pub service_type: GuardServiceType,

    /// Health endpoint path relative to `base_url`
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,

    /// Dispatch path relative to `base_url` (empty posts to `base_url` itself)
    #[serde(default)]
    pub dispatch_path: String,

    /// Selection priority (lower number = preferred)
    #[serde(default)]
    pub priority: i32,

    /// Disabled services are never selected
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Free-form discovery tags
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Credential sent as a bearer token on dispatch
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,

    /// Per-service dispatch timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ServiceConfig {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        service_type: GuardServiceType,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            service_type,
            health_endpoint: default_health_endpoint(),
            dispatch_path: String::new(),
            priority: 0,
            enabled: true,
            tags: BTreeSet::new(),
            auth_token: None,
            timeout_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_health_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.health_endpoint = endpoint.into();
        self
    }

    pub fn with_dispatch_path(mut self, path: impl Into<String>) -> Self {
        self.dispatch_path = path.into();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Full URL of the health endpoint
    pub fn health_url(&self) -> String {
        utils::join_url(&self.base_url, &self.health_endpoint)
    }

    /// Full URL dispatch requests are posted to
    pub fn dispatch_url(&self) -> String {
        utils::join_url(&self.base_url, &self.dispatch_path)
    }

    /// Per-service dispatch timeout, if configured
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// Health status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Whether a service in this state may be selected at all
    pub fn is_selectable(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }

    /// Ordering rank among services of equal priority (lower is preferred)
    pub fn selection_rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy | HealthStatus::Unknown => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

/// Latest observed health of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,

    /// Timestamp of the most recent probe; `None` until first probed
    pub last_check: Option<DateTime<Utc>>,

    /// Probe response time in seconds
    pub response_time: Option<f64>,

    /// Error from the last failed probe
    pub error_message: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceHealth {
    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: None,
            response_time: None,
            error_message: None,
            metadata: HashMap::new(),
        }
    }
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub open_duration_ms: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Classification of a failed dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    Timeout,
    Connection,
    Status,
    ServiceReported,
    InvalidResponse,
    CircuitOpen,
}

impl DispatchErrorKind {
    /// Unavailability (the service could not be reached) as opposed to a
    /// protocol failure (the service answered badly).
    pub fn is_unavailability(&self) -> bool {
        matches!(
            self,
            DispatchErrorKind::Timeout
                | DispatchErrorKind::Connection
                | DispatchErrorKind::CircuitOpen
        )
    }
}

fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_fallback_enabled() -> bool {
    true
}

/// Typed request handed to the orchestrator by the gateway layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    /// Correlation id; generated when the caller does not supply one
    #[serde(default = "generate_request_id")]
    pub request_id: String,

    /// Requested guard type, validated by the orchestrator
    pub service_type: String,

    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub priority: i32,

    /// Per-attempt timeout in seconds
    #[serde(default)]
    pub timeout: Option<f64>,

    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,

    /// Per-call credential override; never written into shared config
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
}

impl OrchestrationRequest {
    pub fn new(
        service_type: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            request_id: generate_request_id(),
            service_type: service_type.into(),
            payload,
            user_id: None,
            session_id: None,
            priority: 0,
            timeout: None,
            fallback_enabled: true,
            auth_token: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>, session_id: Option<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.session_id = session_id;
        self
    }

    /// Requested timeout, ignoring non-positive or non-finite values
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Result of one orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResponse {
    pub request_id: String,
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<DispatchErrorKind>,

    /// Wall-clock time spent in seconds
    pub processing_time: f64,

    /// Service that produced the result (or the last one attempted)
    pub service_used: Option<String>,

    /// True when the answering service was not the first candidate
    pub fallback_used: bool,

    /// Services attempted, in order
    pub attempts: Vec<String>,

    pub timestamp: DateTime<Utc>,
}

/// Partial update of a registered service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateServiceRequest {
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
    pub auth_token: Option<String>,
}

/// Orchestrator request counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub fallback_responses: u64,
    pub unavailable_responses: u64,
    pub registered_services: u64,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_service_type_parsing() {
        assert_eq!(
            "token".parse::<GuardServiceType>().unwrap(),
            GuardServiceType::Token
        );
        assert_eq!(
            " Bias ".parse::<GuardServiceType>().unwrap(),
            GuardServiceType::Bias
        );
        let err = "quantum".parse::<GuardServiceType>().unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidServiceType { .. }));
    }

    #[test]
    fn test_service_config_defaults_from_json() {
        let config: ServiceConfig = serde_json::from_value(serde_json::json!({
            "name": "trust-1",
            "base_url": "https://trust.internal/",
            "service_type": "trust",
            "auth_token": "secret"
        }))
        .unwrap();

        assert_eq!(config.health_endpoint, "/health");
        assert!(config.enabled);
        assert_eq!(config.priority, 0);
        assert_eq!(config.health_url(), "https://trust.internal/health");
        assert_eq!(config.dispatch_url(), "https://trust.internal");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));

        // Credentials never leave through serialization
        let serialized = serde_json::to_value(&config).unwrap();
        assert!(serialized.get("auth_token").is_none());
    }

    #[test]
    fn test_request_defaults() {
        let request: OrchestrationRequest = serde_json::from_value(serde_json::json!({
            "service_type": "context",
            "payload": {"text": "hello"}
        }))
        .unwrap();

        assert!(request.fallback_enabled);
        assert!(Uuid::parse_str(&request.request_id).is_ok());
        assert_eq!(request.timeout_duration(), None);
    }

    #[test]
    fn test_request_timeout_duration() {
        let mut request = OrchestrationRequest::new("token", serde_json::Map::new());
        request.timeout = Some(1.5);
        assert_eq!(request.timeout_duration(), Some(Duration::from_millis(1500)));

        request.timeout = Some(-1.0);
        assert_eq!(request.timeout_duration(), None);

        request.timeout = Some(f64::NAN);
        assert_eq!(request.timeout_duration(), None);
    }

    #[test]
    fn test_health_selection_rank() {
        assert!(HealthStatus::Healthy.selection_rank() < HealthStatus::Degraded.selection_rank());
        assert_eq!(
            HealthStatus::Unknown.selection_rank(),
            HealthStatus::Healthy.selection_rank()
        );
        assert!(!HealthStatus::Unhealthy.is_selectable());
        assert!(HealthStatus::Degraded.is_selectable());
    }
}
