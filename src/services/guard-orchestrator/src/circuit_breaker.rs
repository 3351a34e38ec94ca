//! Circuit breaker service for fault tolerance
//!
//! One breaker per registered service. A half-open breaker admits exactly one
//! trial call; every other caller is rejected until that trial reports back.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BreakerSettings, CircuitBreakerConfig};
use crate::error::{OrchestratorError, Result};
use crate::models::{CircuitBreakerSnapshot, CircuitState};

/// Circuit breaker for a single service
#[derive(Debug, Clone)]
struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    settings: BreakerSettings,
    /// Monotonic stamp driving the open cooldown
    opened_at: Option<Instant>,
    /// Wall-clock stamp reported in snapshots
    last_failure_time: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            settings,
            opened_at: None,
            last_failure_time: None,
            trial_in_flight: false,
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        self.opened_at
            .map_or(true, |at| at.elapsed() >= self.settings.open_duration)
    }

    fn stamp_failure(&mut self) {
        self.opened_at = Some(Instant::now());
        self.last_failure_time = Some(Utc::now());
    }

    fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            failure_threshold: self.settings.failure_threshold,
            open_duration_ms: self.settings.open_duration.as_millis() as u64,
            last_failure_time: self.last_failure_time,
        }
    }
}

/// Circuit breaker service managing multiple service breakers
#[derive(Debug)]
pub struct CircuitBreakerService {
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerService {
    /// Create new circuit breaker service
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Install a fresh closed breaker for a service, replacing any existing one
    pub fn insert(&self, service_name: &str) {
        let settings = self.config.settings_for(service_name);
        self.breakers
            .lock()
            .insert(service_name.to_string(), CircuitBreaker::new(settings));
    }

    /// Drop the breaker of an unregistered service
    pub fn remove(&self, service_name: &str) -> bool {
        self.breakers.lock().remove(service_name).is_some()
    }

    /// Whether the service may appear in a candidate list right now.
    ///
    /// Does not change state: an open breaker whose cooldown has elapsed is
    /// eligible, and the transition to half-open happens on acquire.
    pub fn permits_selection(&self, service_name: &str) -> bool {
        let breakers = self.breakers.lock();
        match breakers.get(service_name) {
            None => true,
            Some(breaker) => match breaker.state {
                CircuitState::Closed => true,
                CircuitState::Open => breaker.cooldown_elapsed(),
                CircuitState::HalfOpen => !breaker.trial_in_flight,
            },
        }
    }

    /// Acquire permission for one call.
    ///
    /// Returns `CircuitOpen` while the breaker rejects calls. An open breaker
    /// past its cooldown moves to half-open and this caller becomes the trial.
    pub fn try_acquire(&self, service_name: &str) -> Result<()> {
        let mut breakers = self.breakers.lock();
        let Some(breaker) = breakers.get_mut(service_name) else {
            return Ok(());
        };

        match breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if breaker.cooldown_elapsed() {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.trial_in_flight = true;
                    info!(service = %service_name, "Circuit breaker half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(OrchestratorError::circuit_open(service_name))
                }
            }
            CircuitState::HalfOpen => {
                if breaker.trial_in_flight {
                    Err(OrchestratorError::circuit_open(service_name))
                } else {
                    breaker.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, service_name: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get_mut(service_name) {
            if breaker.state != CircuitState::Closed {
                info!(service = %service_name, "Circuit breaker closed");
            }
            breaker.state = CircuitState::Closed;
            breaker.failure_count = 0;
            breaker.trial_in_flight = false;
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, service_name: &str) {
        let mut breakers = self.breakers.lock();
        let Some(breaker) = breakers.get_mut(service_name) else {
            return;
        };

        breaker.failure_count = breaker.failure_count.saturating_add(1);
        breaker.last_failure_time = Some(Utc::now());

        match breaker.state {
            CircuitState::Closed => {
                if breaker.failure_count >= breaker.settings.failure_threshold {
                    breaker.state = CircuitState::Open;
                    breaker.stamp_failure();
                    warn!(
                        service = %service_name,
                        failures = breaker.failure_count,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                breaker.trial_in_flight = false;
                breaker.stamp_failure();
                warn!(service = %service_name, "Trial call failed, circuit breaker re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Count a call rejected by an open breaker as a failure of that
    /// candidate, without touching the breaker's timing
    pub fn record_rejection(&self, service_name: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get_mut(service_name) {
            breaker.failure_count = breaker.failure_count.saturating_add(1);
            debug!(service = %service_name, "Call rejected by open circuit breaker");
        }
    }

    /// Release a half-open trial slot whose call never reported an outcome
    pub fn abandon_trial(&self, service_name: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get_mut(service_name) {
            if breaker.state == CircuitState::HalfOpen && breaker.trial_in_flight {
                breaker.trial_in_flight = false;
                debug!(service = %service_name, "Abandoned half-open trial call");
            }
        }
    }

    /// Get current state of circuit breaker for service
    pub fn state(&self, service_name: &str) -> Option<CircuitState> {
        self.breakers.lock().get(service_name).map(|b| b.state)
    }

    /// Get a snapshot of one breaker
    pub fn snapshot(&self, service_name: &str) -> Option<CircuitBreakerSnapshot> {
        self.breakers.lock().get(service_name).map(|b| b.snapshot())
    }

    /// Snapshot every breaker, ordered by service name
    pub fn snapshot_all(&self) -> BTreeMap<String, CircuitBreakerSnapshot> {
        self.breakers
            .lock()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }

    /// Reset circuit breaker for service (admin function)
    pub fn reset(&self, service_name: &str) -> Result<()> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .get_mut(service_name)
            .ok_or_else(|| OrchestratorError::not_found(service_name))?;
        *breaker = CircuitBreaker::new(breaker.settings);
        info!(service = %service_name, "Circuit breaker reset");
        Ok(())
    }
}
