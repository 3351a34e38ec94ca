//! Orchestrator
//!
//! Ties the registry, health monitor, circuit breakers and dispatcher
//! together. Selects candidates for a request, dispatches sequentially, and
//! falls back to the next candidate on failure.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::circuit_breaker::CircuitBreakerService;
use crate::config::OrchestratorConfig;
use crate::discovery::{HttpDiscovery, ManifestDiscovery, ServiceDiscovery};
use crate::dispatch::{DispatchCall, GuardDispatcher, HttpDispatcher};
use crate::error::{DispatchError, OrchestratorError, Result};
use crate::health::{HealthMonitor, HealthMonitoringStats};
use crate::models::{
    CircuitBreakerSnapshot, GuardServiceType, OrchestrationRequest, OrchestrationResponse,
    OrchestratorStats, ServiceConfig, ServiceHealth,
};
use crate::registry::ServiceRegistry;

#[derive(Debug, Default)]
struct RequestCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    fallback: AtomicU64,
    unavailable: AtomicU64,
}

/// Releases a half-open trial slot if the dispatch future is dropped
/// before it reports an outcome
struct TrialGuard<'a> {
    breakers: &'a CircuitBreakerService,
    service_name: &'a str,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    fn new(breakers: &'a CircuitBreakerService, service_name: &'a str) -> Self {
        Self {
            breakers,
            service_name,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breakers.abandon_trial(self.service_name);
        }
    }
}

/// Guard service orchestrator
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<ServiceRegistry>,
    health: Arc<HealthMonitor>,
    breakers: CircuitBreakerService,
    dispatcher: Arc<dyn GuardDispatcher>,
    discovery: Vec<Arc<dyn ServiceDiscovery>>,
    /// Last config each discovered name was supplied with
    discovered: Mutex<HashMap<String, ServiceConfig>>,
    /// Serializes changes spanning the registry, breaker and health maps
    admin_lock: Mutex<()>,
    counters: RequestCounters,
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl Orchestrator {
    /// Create an orchestrator with an explicit dispatcher.
    ///
    /// Discovery sources named in the configuration are attached here; more
    /// can be added with [`Orchestrator::with_discovery`].
    pub fn new(config: OrchestratorConfig, dispatcher: Arc<dyn GuardDispatcher>) -> Result<Self> {
        let registry = Arc::new(ServiceRegistry::new(config.registry.clone()));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            &config.dispatch.user_agent,
        )?);
        let breakers = CircuitBreakerService::new(config.circuit_breaker.clone());

        let mut discovery: Vec<Arc<dyn ServiceDiscovery>> = Vec::new();
        if let Some(ref path) = config.discovery.manifest_path {
            discovery.push(Arc::new(ManifestDiscovery::new(path.clone())));
        }
        if let Some(ref endpoint) = config.discovery.endpoint {
            let source = HttpDiscovery::new(endpoint.clone(), config.dispatch.default_timeout())
                .map_err(|e| OrchestratorError::configuration(e.to_string()))?;
            discovery.push(Arc::new(source));
        }

        Ok(Self {
            config,
            registry,
            health,
            breakers,
            dispatcher,
            discovery,
            discovered: Mutex::new(HashMap::new()),
            admin_lock: Mutex::new(()),
            counters: RequestCounters::default(),
            shutdown_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        })
    }

    /// Create an orchestrator that dispatches over HTTP
    pub fn with_http_dispatcher(config: OrchestratorConfig) -> Result<Self> {
        let dispatcher = HttpDispatcher::new(&config.dispatch)?;
        Self::new(config, Arc::new(dispatcher))
    }

    /// Attach an additional discovery source
    pub fn with_discovery(mut self, source: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery.push(source);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register static services, run discovery once, and start the
    /// background loops. Calling it again is a no-op.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Orchestrator already initialized");
            return Ok(());
        }

        for service in self.config.services.clone() {
            if let Err(e) = self.register_service(service) {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        if !self.discovery.is_empty() {
            self.discover().await;
        }

        let mut tasks = Vec::new();

        if self.config.health.enabled {
            tasks.push(
                self.health
                    .spawn_monitoring(Arc::clone(&self.registry), self.shutdown_token.child_token()),
            );
        }

        if let Some(interval) = self.config.discovery.interval() {
            if !self.discovery.is_empty() {
                tasks.push(self.spawn_discovery(interval));
            }
        }

        self.tasks.lock().extend(tasks);

        info!(
            services = self.registry.len(),
            discovery_sources = self.discovery.len(),
            health_monitoring = self.config.health.enabled,
            "Orchestrator initialized"
        );

        Ok(())
    }

    fn spawn_discovery(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let token = self.shutdown_token.child_token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // init already ran discovery once
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = orchestrator.discover() => {}
                        }
                    }
                }
            }

            info!("Discovery loop stopped");
        })
    }

    /// Cancel background loops and wait for them up to the grace period,
    /// aborting any that are still running
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let grace = self.config.server.shutdown_grace_period();

        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => info!("Orchestrator background tasks stopped"),
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Background tasks did not stop within grace period, aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }

    /// Route a request to the best available service of its type
    #[instrument(
        skip(self, request),
        fields(
            request_id = %request.request_id,
            service_type = %request.service_type,
            user_id = request.user_id.as_deref().unwrap_or(""),
            session_id = request.session_id.as_deref().unwrap_or(""),
            priority = request.priority
        )
    )]
    pub async fn orchestrate(&self, request: OrchestrationRequest) -> Result<OrchestrationResponse> {
        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let service_type: GuardServiceType = match request.service_type.parse() {
            Ok(service_type) => service_type,
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let candidates = self.select_candidates(service_type);
        if candidates.is_empty() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
            warn!("No eligible service available");
            return Err(OrchestratorError::service_unavailable(service_type.as_str()));
        }

        let preferred = self.preferred_service(service_type);

        let mut attempts = Vec::with_capacity(candidates.len());
        let mut last_error = None;

        for service in &candidates {
            attempts.push(service.name.clone());

            match self.attempt(service, &request).await {
                Ok(data) => {
                    let fallback_used = preferred.as_deref() != Some(service.name.as_str());
                    self.counters.successful.fetch_add(1, Ordering::Relaxed);
                    if fallback_used {
                        self.counters.fallback.fetch_add(1, Ordering::Relaxed);
                    }

                    info!(
                        service = %service.name,
                        attempts = attempts.len(),
                        fallback_used,
                        "Request served"
                    );

                    return Ok(OrchestrationResponse {
                        request_id: request.request_id.clone(),
                        success: true,
                        data: Some(data),
                        error: None,
                        error_kind: None,
                        processing_time: started.elapsed().as_secs_f64(),
                        service_used: Some(service.name.clone()),
                        fallback_used,
                        attempts,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(service = %service.name, error = %e, "Dispatch attempt failed");
                    last_error = Some(e);
                    if !request.fallback_enabled {
                        break;
                    }
                }
            }
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        let error = last_error.unwrap_or(DispatchError::CircuitOpen);
        warn!(attempts = attempts.len(), error = %error, "All dispatch attempts failed");

        Ok(OrchestrationResponse {
            request_id: request.request_id.clone(),
            success: false,
            data: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            processing_time: started.elapsed().as_secs_f64(),
            service_used: attempts.last().cloned(),
            fallback_used: attempts.len() > 1,
            attempts,
            timestamp: Utc::now(),
        })
    }

    /// Eligible services for a type, in attempt order: priority, then
    /// healthy/unknown before degraded, then registration order
    pub fn select_candidates(&self, service_type: GuardServiceType) -> Vec<ServiceConfig> {
        let mut candidates: Vec<(ServiceConfig, u8)> = self
            .registry
            .list(Some(service_type))
            .into_iter()
            .filter(|service| self.breakers.permits_selection(&service.name))
            .filter_map(|service| {
                let status = self.health.status(&service.name);
                status
                    .is_selectable()
                    .then(|| (service, status.selection_rank()))
            })
            .collect();

        // Stable sort keeps registration order within equal keys
        candidates.sort_by_key(|(service, rank)| (service.priority, *rank));
        candidates.into_iter().map(|(service, _)| service).collect()
    }

    /// The service a request of this type would go to with every breaker
    /// closed: first by priority, then health rank, then registration order
    fn preferred_service(&self, service_type: GuardServiceType) -> Option<String> {
        let mut services: Vec<(ServiceConfig, u8)> = self
            .registry
            .list(Some(service_type))
            .into_iter()
            .map(|service| {
                let rank = self.health.status(&service.name).selection_rank();
                (service, rank)
            })
            .collect();

        services.sort_by_key(|(service, rank)| (service.priority, *rank));
        services.into_iter().next().map(|(service, _)| service.name)
    }

    /// One dispatch attempt against one candidate. Updates exactly one breaker.
    async fn attempt(
        &self,
        service: &ServiceConfig,
        request: &OrchestrationRequest,
    ) -> std::result::Result<Value, DispatchError> {
        if self.breakers.try_acquire(&service.name).is_err() {
            self.breakers.record_rejection(&service.name);
            return Err(DispatchError::CircuitOpen);
        }

        let timeout = request
            .timeout_duration()
            .or_else(|| service.timeout())
            .unwrap_or_else(|| self.config.dispatch.default_timeout());

        let call = DispatchCall {
            request_id: &request.request_id,
            payload: &request.payload,
            auth_token: request
                .auth_token
                .as_deref()
                .or(service.auth_token.as_deref()),
            user_id: request.user_id.as_deref(),
            session_id: request.session_id.as_deref(),
            timeout,
        };

        let guard = TrialGuard::new(&self.breakers, &service.name);
        let result = match tokio::time::timeout(timeout, self.dispatcher.dispatch(service, call)).await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        };
        guard.disarm();

        match result {
            Ok(_) => self.breakers.record_success(&service.name),
            Err(_) => self.breakers.record_failure(&service.name),
        }

        result
    }

    /// Register or overwrite a service with a fresh breaker and health entry
    pub fn register_service(&self, config: ServiceConfig) -> Result<()> {
        let _admin = self.admin_lock.lock();
        self.register_locked(config)
    }

    /// Caller holds `admin_lock`
    fn register_locked(&self, config: ServiceConfig) -> Result<()> {
        let name = config.name.clone();
        self.registry.register(config)?;
        self.breakers.insert(&name);
        self.health.track(&name);
        Ok(())
    }

    /// Remove a service with its breaker and health entry
    pub fn unregister_service(&self, name: &str) -> bool {
        let _admin = self.admin_lock.lock();
        let removed = self.registry.unregister(name);
        self.breakers.remove(name);
        self.health.untrack(name);
        removed
    }

    pub fn list_services(&self, service_type: Option<GuardServiceType>) -> Vec<ServiceConfig> {
        self.registry.list(service_type)
    }

    pub fn list_all_services(&self) -> Vec<ServiceConfig> {
        self.registry.list_all()
    }

    pub fn get_service(&self, name: &str) -> Result<ServiceConfig> {
        self.registry
            .get(name)
            .ok_or_else(|| OrchestratorError::not_found(name))
    }

    pub fn set_service_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.registry.set_enabled(name, enabled)
    }

    pub fn set_service_priority(&self, name: &str, priority: i32) -> Result<()> {
        self.registry.set_priority(name, priority)
    }

    pub fn set_service_auth_token(&self, name: &str, token: Option<String>) -> Result<()> {
        self.registry.set_auth_token(name, token)
    }

    /// Cached health snapshot; never probes
    pub fn get_health(&self, name: &str) -> Result<ServiceHealth> {
        self.health.get(name)
    }

    pub fn get_all_health(&self) -> BTreeMap<String, ServiceHealth> {
        self.health.get_all()
    }

    pub fn health_stats(&self) -> HealthMonitoringStats {
        self.health.stats()
    }

    /// Probe every enabled service now
    pub async fn refresh_health(&self) {
        self.health.refresh_all(self.registry.list_all()).await;
    }

    /// Probe one service now
    pub async fn refresh_service_health(&self, name: &str) -> Result<ServiceHealth> {
        let service = self.get_service(name)?;
        Ok(self.health.refresh_one(&service).await)
    }

    pub fn get_circuit_breaker_states(&self) -> BTreeMap<String, CircuitBreakerSnapshot> {
        self.breakers.snapshot_all()
    }

    pub fn reset_circuit_breaker(&self, name: &str) -> Result<()> {
        self.breakers.reset(name)
    }

    /// Run every discovery source once and register what they return.
    ///
    /// An entry supplied unchanged since the last run is left alone, so
    /// breaker and health state survive periodic runs. Admin changes to
    /// `enabled`, `priority` and `auth_token` are kept unless the source
    /// itself changes that field. Returns the number of services added or
    /// changed.
    pub async fn discover(&self) -> usize {
        let mut applied = 0;

        for source in &self.discovery {
            let services = match source.discover().await {
                Ok(services) => services,
                Err(e) => {
                    warn!(source = source.name(), error = %e, "Service discovery failed");
                    continue;
                }
            };

            for service in services {
                let name = service.name.clone();
                match self.apply_discovered(service) {
                    Ok(true) => applied += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        source = source.name(),
                        service = %name,
                        error = %e,
                        "Skipping invalid discovered service"
                    ),
                }
            }
        }

        if applied > 0 {
            info!(services = applied, "Discovery registered services");
        }
        applied
    }

    /// Apply one discovered entry. Returns whether the registry changed.
    fn apply_discovered(&self, service: ServiceConfig) -> Result<bool> {
        let _admin = self.admin_lock.lock();
        let previous = self.discovered.lock().get(&service.name).cloned();

        let Some(current) = self.registry.get(&service.name) else {
            self.register_locked(service.clone())?;
            self.discovered.lock().insert(service.name.clone(), service);
            return Ok(true);
        };

        if previous.as_ref() == Some(&service) {
            return Ok(false);
        }

        let mut merged = service.clone();
        if let Some(ref previous) = previous {
            if previous.enabled == service.enabled {
                merged.enabled = current.enabled;
            }
            if previous.priority == service.priority {
                merged.priority = current.priority;
            }
            if previous.auth_token == service.auth_token {
                merged.auth_token = current.auth_token.clone();
            }
        }

        let changed = merged != current;
        if changed {
            let mut routing = merged.clone();
            routing.enabled = current.enabled;
            routing.priority = current.priority;
            routing.auth_token = current.auth_token.clone();

            if routing == current {
                // Admin-owned fields only; breaker and health stay as they are
                let name = merged.name.clone();
                self.registry.update(&name, move |config| *config = merged)?;
            } else {
                self.register_locked(merged)?;
            }
        }

        self.discovered.lock().insert(service.name.clone(), service);
        Ok(changed)
    }

    /// Request counters
    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            total_requests: self.counters.total.load(Ordering::Relaxed),
            successful_requests: self.counters.successful.load(Ordering::Relaxed),
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            fallback_responses: self.counters.fallback.load(Ordering::Relaxed),
            unavailable_responses: self.counters.unavailable.load(Ordering::Relaxed),
            registered_services: self.registry.len() as u64,
            last_updated: Utc::now(),
        }
    }
}
