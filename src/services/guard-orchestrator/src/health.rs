//! Health Monitoring Module
//!
//! Provides active HTTP health checking for registered guard services.
//! Probes run concurrently under a semaphore; results are cached so lookups
//! never touch the network.

use crate::config::HealthConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::{HealthStatus, ServiceConfig, ServiceHealth};
use crate::registry::ServiceRegistry;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health monitoring statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitoringStats {
    /// Total services being monitored
    pub total_services: u64,

    pub healthy_services: u64,
    pub degraded_services: u64,
    pub unhealthy_services: u64,
    pub unknown_services: u64,

    /// Total health checks performed
    pub total_health_checks: u64,

    /// Average health check response time in milliseconds
    pub avg_response_time_ms: f64,

    /// Share of checks that found the service unhealthy (0.0 to 1.0)
    pub error_rate: f64,

    /// Last updated timestamp
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default)]
struct ProbeCounters {
    total_checks: u64,
    failed_checks: u64,
    total_response_time_ms: f64,
    timed_checks: u64,
}

/// Health monitor
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,

    /// HTTP client for health checks
    http_client: Client,

    /// Latest snapshot per tracked service
    entries: RwLock<HashMap<String, ServiceHealth>>,

    /// Semaphore to limit concurrent health checks
    check_semaphore: Arc<Semaphore>,

    counters: Mutex<ProbeCounters>,
}

impl HealthMonitor {
    /// Create a new health monitor instance
    pub fn new(config: HealthConfig, user_agent: &str) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout())
            .user_agent(user_agent)
            .build()
            .map_err(|e| {
                OrchestratorError::internal(format!("failed to build health check client: {}", e))
            })?;

        let check_semaphore = Arc::new(Semaphore::new(config.max_concurrent_probes.max(1)));

        Ok(Self {
            config,
            http_client,
            entries: RwLock::new(HashMap::new()),
            check_semaphore,
            counters: Mutex::new(ProbeCounters::default()),
        })
    }

    /// Start tracking a service with an `unknown` snapshot, replacing any
    /// previous one
    pub fn track(&self, service_name: &str) {
        self.entries
            .write()
            .insert(service_name.to_string(), ServiceHealth::unknown());
    }

    /// Stop tracking a service
    pub fn untrack(&self, service_name: &str) -> bool {
        self.entries.write().remove(service_name).is_some()
    }

    /// Cached snapshot of one service
    pub fn get(&self, service_name: &str) -> Result<ServiceHealth> {
        self.entries
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(service_name))
    }

    /// Cached snapshots of every tracked service
    pub fn get_all(&self) -> BTreeMap<String, ServiceHealth> {
        self.entries
            .read()
            .iter()
            .map(|(name, health)| (name.clone(), health.clone()))
            .collect()
    }

    /// Cached status, `Unknown` for untracked services
    pub fn status(&self, service_name: &str) -> HealthStatus {
        self.entries
            .read()
            .get(service_name)
            .map(|h| h.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Probe a single service. Failures are reported in the returned
    /// snapshot, never as an error.
    pub async fn probe_one(&self, service: &ServiceConfig) -> ServiceHealth {
        let url = service.health_url();
        let started = Instant::now();

        let mut metadata = HashMap::new();
        metadata.insert("url".to_string(), url.clone());

        let outcome = timeout(self.config.timeout(), self.http_client.get(&url).send()).await;
        let elapsed = started.elapsed();

        let (status, response_time, error_message) = match outcome {
            Ok(Ok(response)) => {
                let code = response.status();
                metadata.insert("status_code".to_string(), code.as_u16().to_string());

                if !code.is_success() {
                    (
                        HealthStatus::Degraded,
                        Some(elapsed.as_secs_f64()),
                        Some(format!("health endpoint returned status {}", code.as_u16())),
                    )
                } else if elapsed > self.config.degraded_threshold() {
                    (HealthStatus::Degraded, Some(elapsed.as_secs_f64()), None)
                } else {
                    (HealthStatus::Healthy, Some(elapsed.as_secs_f64()), None)
                }
            }
            Ok(Err(e)) if e.is_timeout() => (
                HealthStatus::Unhealthy,
                None,
                Some(format!(
                    "health check timed out after {}ms",
                    self.config.timeout_ms
                )),
            ),
            Ok(Err(e)) => (HealthStatus::Unhealthy, None, Some(e.to_string())),
            Err(_) => (
                HealthStatus::Unhealthy,
                None,
                Some(format!(
                    "health check timed out after {}ms",
                    self.config.timeout_ms
                )),
            ),
        };

        debug!(
            service = %service.name,
            status = ?status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Health check completed"
        );

        ServiceHealth {
            status,
            last_check: Some(Utc::now()),
            response_time,
            error_message,
            metadata,
        }
    }

    /// Probe one service and store the result if it is still tracked
    pub async fn refresh_one(&self, service: &ServiceConfig) -> ServiceHealth {
        let health = self.probe_one(service).await;
        self.store(&service.name, health.clone());
        health
    }

    /// Probe every enabled service concurrently and replace their snapshots
    pub async fn refresh_all(&self, services: Vec<ServiceConfig>) {
        let checks = services
            .into_iter()
            .filter(|service| service.enabled)
            .map(|service| async move {
                let Ok(_permit) = self.check_semaphore.acquire().await else {
                    return;
                };
                let health = self.probe_one(&service).await;
                self.store(&service.name, health);
            });

        futures::future::join_all(checks).await;
    }

    pub(crate) fn store(&self, service_name: &str, health: ServiceHealth) {
        let mut entries = self.entries.write();
        // Services unregistered mid-probe stay gone and are not counted
        let Some(entry) = entries.get_mut(service_name) else {
            return;
        };

        {
            let mut counters = self.counters.lock();
            counters.total_checks += 1;
            if health.status == HealthStatus::Unhealthy {
                counters.failed_checks += 1;
            }
            if let Some(secs) = health.response_time {
                counters.total_response_time_ms += secs * 1000.0;
                counters.timed_checks += 1;
            }
        }

        if entry.status != health.status && entry.status != HealthStatus::Unknown {
            match health.status {
                HealthStatus::Unhealthy => warn!(
                    service = %service_name,
                    error = health.error_message.as_deref().unwrap_or(""),
                    "Service became unhealthy"
                ),
                status => info!(service = %service_name, status = ?status, "Service health changed"),
            }
        }

        *entry = health;
    }

    /// Get health check statistics
    pub fn stats(&self) -> HealthMonitoringStats {
        let entries = self.entries.read();
        let count = |status: HealthStatus| {
            entries.values().filter(|h| h.status == status).count() as u64
        };

        let counters = self.counters.lock();
        let avg_response_time_ms = if counters.timed_checks > 0 {
            counters.total_response_time_ms / counters.timed_checks as f64
        } else {
            0.0
        };
        let error_rate = if counters.total_checks > 0 {
            counters.failed_checks as f64 / counters.total_checks as f64
        } else {
            0.0
        };

        HealthMonitoringStats {
            total_services: entries.len() as u64,
            healthy_services: count(HealthStatus::Healthy),
            degraded_services: count(HealthStatus::Degraded),
            unhealthy_services: count(HealthStatus::Unhealthy),
            unknown_services: count(HealthStatus::Unknown),
            total_health_checks: counters.total_checks,
            avg_response_time_ms,
            error_rate,
            last_updated: Utc::now(),
        }
    }

    /// Spawn the periodic monitoring loop. The first refresh runs immediately.
    pub fn spawn_monitoring(
        self: &Arc<Self>,
        registry: Arc<ServiceRegistry>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                interval_secs = monitor.config.interval_secs,
                "Health monitoring loop started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let services = registry.list_all();
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = monitor.refresh_all(services) => {}
                        }
                    }
                }
            }

            info!("Health monitoring loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GuardServiceType;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn monitor(timeout_ms: u64, degraded_threshold_ms: u64) -> HealthMonitor {
        bounded_monitor(timeout_ms, degraded_threshold_ms, 4)
    }

    fn bounded_monitor(
        timeout_ms: u64,
        degraded_threshold_ms: u64,
        max_concurrent_probes: usize,
    ) -> HealthMonitor {
        HealthMonitor::new(
            HealthConfig {
                enabled: true,
                interval_secs: 30,
                timeout_ms,
                degraded_threshold_ms,
                max_concurrent_probes,
            },
            "guard-orchestrator-test",
        )
        .unwrap()
    }

    fn service_at(name: &str, base_url: &str) -> ServiceConfig {
        ServiceConfig::new(name, base_url, GuardServiceType::Token)
    }

    async fn mock_health(status: u16, delay: Duration) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(status).set_delay(delay))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_probe_healthy() {
        let server = mock_health(200, Duration::ZERO).await;
        let health = monitor(2_000, 1_000)
            .probe_one(&service_at("svc-a", &server.uri()))
            .await;

        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.last_check.is_some());
        assert!(health.response_time.is_some());
        assert_eq!(health.metadata.get("status_code").map(String::as_str), Some("200"));
    }

    #[tokio::test]
    async fn test_probe_non_success_is_degraded() {
        let server = mock_health(503, Duration::ZERO).await;
        let health = monitor(2_000, 1_000)
            .probe_one(&service_at("svc-a", &server.uri()))
            .await;

        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.error_message.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_probe_slow_success_is_degraded() {
        let server = mock_health(200, Duration::from_millis(200)).await;
        let health = monitor(2_000, 50)
            .probe_one(&service_at("svc-a", &server.uri()))
            .await;

        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.error_message.is_none());
    }

    #[tokio::test]
    async fn test_probe_timeout_is_unhealthy() {
        let server = mock_health(200, Duration::from_millis(1_000)).await;
        let health = monitor(100, 50)
            .probe_one(&service_at("svc-a", &server.uri()))
            .await;

        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_probe_connection_refused_is_unhealthy() {
        let health = monitor(500, 100)
            .probe_one(&service_at("svc-a", "http://127.0.0.1:1"))
            .await;

        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.error_message.is_some());
    }

    #[tokio::test]
    async fn test_refresh_all_skips_untracked_and_disabled() {
        let server = mock_health(200, Duration::ZERO).await;
        let monitor = monitor(2_000, 1_000);

        monitor.track("svc-a");
        monitor.track("svc-disabled");

        monitor
            .refresh_all(vec![
                service_at("svc-a", &server.uri()),
                service_at("svc-disabled", &server.uri()).disabled(),
                service_at("svc-gone", &server.uri()),
            ])
            .await;

        assert_eq!(monitor.status("svc-a"), HealthStatus::Healthy);
        assert_eq!(monitor.status("svc-disabled"), HealthStatus::Unknown);
        assert!(matches!(
            monitor.get("svc-gone"),
            Err(OrchestratorError::NotFound { .. })
        ));
        assert_eq!(monitor.get_all().len(), 2);

        let stats = monitor.stats();
        assert_eq!(stats.total_services, 2);
        assert_eq!(stats.healthy_services, 1);
        assert_eq!(stats.unknown_services, 1);
        // Only the tracked, enabled service counts as a check
        assert_eq!(stats.total_health_checks, 1);
    }

    #[tokio::test]
    async fn test_untracked_results_are_not_counted() {
        let monitor = monitor(500, 250);
        monitor.track("svc-a");

        monitor.store(
            "svc-gone",
            ServiceHealth {
                status: HealthStatus::Unhealthy,
                ..ServiceHealth::unknown()
            },
        );

        let stats = monitor.stats();
        assert_eq!(stats.total_health_checks, 0);
        assert_eq!(stats.error_rate, 0.0);
        assert_eq!(monitor.status("svc-a"), HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_refresh_all_bounds_concurrent_probes() {
        let delay = Duration::from_millis(250);
        let server = mock_health(200, delay).await;
        let monitor = bounded_monitor(5_000, 4_000, 2);

        let names = ["svc-a", "svc-b", "svc-c", "svc-d"];
        for name in names {
            monitor.track(name);
        }

        let started = Instant::now();
        monitor
            .refresh_all(names.iter().map(|name| service_at(name, &server.uri())).collect())
            .await;
        let elapsed = started.elapsed();

        // Four probes through two permits take at least two rounds
        assert!(
            elapsed >= delay * 2,
            "probes overlapped beyond the limit: {:?}",
            elapsed
        );
        for name in names {
            assert_eq!(monitor.status(name), HealthStatus::Healthy);
        }
        assert_eq!(monitor.stats().total_health_checks, 4);
    }

    #[tokio::test]
    async fn test_cached_snapshot_goes_stale_without_network() {
        let server = mock_health(200, Duration::ZERO).await;
        let monitor = monitor(500, 250);
        let service = service_at("svc-a", &server.uri());

        monitor.track("svc-a");
        let first = monitor.refresh_one(&service).await;
        drop(server);

        // Reads are served from cache even though the service is gone
        let cached = monitor.get("svc-a").unwrap();
        assert_eq!(cached.status, HealthStatus::Healthy);
        assert_eq!(cached.last_check, first.last_check);
    }

    #[tokio::test]
    async fn test_monitoring_loop_stops_on_cancel() {
        let server = mock_health(200, Duration::ZERO).await;
        let monitor = Arc::new(monitor(500, 250));
        let registry = Arc::new(ServiceRegistry::new(Default::default()));
        registry.register(service_at("svc-a", &server.uri())).unwrap();
        monitor.track("svc-a");

        let token = CancellationToken::new();
        let handle = monitor.spawn_monitoring(Arc::clone(&registry), token.clone());

        // First tick fires immediately
        for _ in 0..50 {
            if monitor.status("svc-a") == HealthStatus::Healthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(monitor.status("svc-a"), HealthStatus::Healthy);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();
    }
}
