//! Service Registry Module
//!
//! Authoritative set of known guard services. Handles registration with
//! validation, deregistration, in-place updates, and priority-ordered lookup.

use crate::config::RegistryConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::{GuardServiceType, ServiceConfig};
use crate::utils;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use url::{Host, Url};

/// A registered service and the order it was first registered in
#[derive(Debug, Clone)]
struct RegistryEntry {
    config: ServiceConfig,
    sequence: u64,
}

/// In-memory service registry
#[derive(Debug)]
pub struct ServiceRegistry {
    /// Validation settings
    settings: RegistryConfig,

    /// Services keyed by name
    services: RwLock<HashMap<String, RegistryEntry>>,

    /// Registration order counter, used to break priority ties
    next_sequence: AtomicU64,
}

impl ServiceRegistry {
    /// Create a new, empty registry
    pub fn new(settings: RegistryConfig) -> Self {
        Self {
            settings,
            services: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Validate a service configuration without registering it
    pub fn validate(&self, config: &ServiceConfig) -> Result<()> {
        utils::validate_service_name(&config.name)?;
        self.validate_url(&config.base_url)?;

        if !config.health_endpoint.starts_with('/') {
            return Err(OrchestratorError::invalid_config(
                "health_endpoint",
                format!(
                    "health endpoint '{}' must be a path starting with '/'",
                    config.health_endpoint
                ),
            ));
        }

        if !config.dispatch_path.is_empty() && !config.dispatch_path.starts_with('/') {
            return Err(OrchestratorError::invalid_config(
                "dispatch_path",
                format!(
                    "dispatch path '{}' must be empty or start with '/'",
                    config.dispatch_path
                ),
            ));
        }

        Ok(())
    }

    /// Validate a base URL: http(s), with a host, and no loopback host in
    /// production unless explicitly allowed
    fn validate_url(&self, raw: &str) -> Result<()> {
        let url = Url::parse(raw).map_err(|e| {
            OrchestratorError::invalid_config("base_url", format!("invalid URL '{}': {}", raw, e))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(OrchestratorError::invalid_config(
                "base_url",
                format!("unsupported URL scheme '{}'", url.scheme()),
            ));
        }

        let host = match url.host() {
            Some(Host::Domain(d)) if d.is_empty() => None,
            other => other,
        };

        let Some(host) = host else {
            return Err(OrchestratorError::invalid_config(
                "base_url",
                format!("URL '{}' has no hostname", raw),
            ));
        };

        if self.settings.production && !self.settings.allow_localhost && is_loopback(&host) {
            return Err(OrchestratorError::invalid_config(
                "base_url",
                format!("loopback host '{}' is not allowed in production", host),
            ));
        }

        Ok(())
    }

    /// Register or overwrite a service.
    ///
    /// Overwriting keeps the service's original registration slot so
    /// tie-breaking among equal priorities is stable.
    pub fn register(&self, config: ServiceConfig) -> Result<()> {
        self.validate(&config)?;

        let mut services = self.services.write();
        let name = config.name.clone();
        match services.get_mut(&name) {
            Some(entry) => {
                entry.config = config;
                debug!(service = %name, "Overwrote service registration");
            }
            None => {
                let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                info!(
                    service = %name,
                    service_type = %config.service_type,
                    priority = config.priority,
                    "Registered service"
                );
                services.insert(name, RegistryEntry { config, sequence });
            }
        }

        Ok(())
    }

    /// Remove a service. Returns false if it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.services.write().remove(name).is_some();
        if removed {
            info!(service = %name, "Unregistered service");
        }
        removed
    }

    /// Get a service by name
    pub fn get(&self, name: &str) -> Option<ServiceConfig> {
        self.services.read().get(name).map(|e| e.config.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enabled services, optionally of one type, ordered by ascending
    /// priority then registration order
    pub fn list(&self, service_type: Option<GuardServiceType>) -> Vec<ServiceConfig> {
        self.collect_sorted(|config| {
            config.enabled && service_type.map_or(true, |t| config.service_type == t)
        })
    }

    /// All services including disabled ones, in selection order
    pub fn list_all(&self) -> Vec<ServiceConfig> {
        self.collect_sorted(|_| true)
    }

    fn collect_sorted(&self, filter: impl Fn(&ServiceConfig) -> bool) -> Vec<ServiceConfig> {
        let services = self.services.read();
        let mut entries: Vec<&RegistryEntry> =
            services.values().filter(|e| filter(&e.config)).collect();
        entries.sort_by_key(|e| (e.config.priority, e.sequence));
        entries.into_iter().map(|e| e.config.clone()).collect()
    }

    /// Apply an in-place update to a registered service
    pub fn update<F>(&self, name: &str, apply: F) -> Result<ServiceConfig>
    where
        F: FnOnce(&mut ServiceConfig),
    {
        let mut services = self.services.write();
        let entry = services
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::not_found(name))?;
        apply(&mut entry.config);
        Ok(entry.config.clone())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.update(name, |config| config.enabled = enabled)?;
        info!(service = %name, enabled, "Updated service enabled flag");
        Ok(())
    }

    pub fn set_priority(&self, name: &str, priority: i32) -> Result<()> {
        self.update(name, |config| config.priority = priority)?;
        info!(service = %name, priority, "Updated service priority");
        Ok(())
    }

    pub fn set_auth_token(&self, name: &str, token: Option<String>) -> Result<()> {
        self.update(name, |config| config.auth_token = token)?;
        debug!(service = %name, "Updated service auth token");
        Ok(())
    }
}

fn is_loopback(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => domain.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => ip.is_loopback() || ip.is_unspecified(),
        Host::Ipv6(ip) => ip.is_loopback() || ip.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dev_registry() -> ServiceRegistry {
        ServiceRegistry::new(RegistryConfig::default())
    }

    fn production_registry(allow_localhost: bool) -> ServiceRegistry {
        ServiceRegistry::new(RegistryConfig {
            production: true,
            allow_localhost,
        })
    }

    fn token_service(name: &str, priority: i32) -> ServiceConfig {
        ServiceConfig::new(
            name,
            format!("http://{}.guards.internal:8000", name),
            GuardServiceType::Token,
        )
        .with_priority(priority)
    }

    #[test]
    fn test_register_rejects_bad_name() {
        let registry = dev_registry();
        let err = registry
            .register(ServiceConfig::new(
                "bad name!",
                "http://x",
                GuardServiceType::Token,
            ))
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::InvalidConfig { ref field, .. } if field == "name"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_rejects_bad_urls() {
        let registry = dev_registry();
        for url in ["ftp://files.internal", "not a url", "http://", "file:///etc/passwd"] {
            let result = registry.register(ServiceConfig::new(
                "svc-a",
                url,
                GuardServiceType::Trust,
            ));
            assert!(result.is_err(), "{} should be rejected", url);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_production_rejects_loopback() {
        let registry = production_registry(false);
        for url in [
            "http://localhost:9000",
            "http://127.0.0.1:9000",
            "http://0.0.0.0:9000",
            "http://[::1]:9000",
        ] {
            let result = registry.register(ServiceConfig::new(
                "svc-c",
                url,
                GuardServiceType::Context,
            ));
            assert!(result.is_err(), "{} should be rejected in production", url);
        }

        let registry = production_registry(true);
        assert!(registry
            .register(ServiceConfig::new(
                "svc-c",
                "http://localhost:9000",
                GuardServiceType::Context,
            ))
            .is_ok());

        // Development mode accepts loopback
        let registry = dev_registry();
        assert!(registry
            .register(ServiceConfig::new(
                "svc-c",
                "http://localhost:9000",
                GuardServiceType::Context,
            ))
            .is_ok());
    }

    #[test]
    fn test_register_overwrites_in_place() {
        let registry = dev_registry();
        let config = token_service("svc-a", 1);

        registry.register(config.clone()).unwrap();
        registry.register(config.clone()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("svc-a"), Some(config));
    }

    #[test]
    fn test_list_orders_by_priority_then_registration() {
        let registry = dev_registry();
        registry.register(token_service("late-high", 5)).unwrap();
        registry.register(token_service("first-tie", 1)).unwrap();
        registry.register(token_service("second-tie", 1)).unwrap();
        registry.register(token_service("best", 0)).unwrap();
        registry
            .register(
                ServiceConfig::new("trust-a", "http://trust-a:8000", GuardServiceType::Trust)
                    .with_priority(0),
            )
            .unwrap();

        let names: Vec<String> = registry
            .list(Some(GuardServiceType::Token))
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["best", "first-tie", "second-tie", "late-high"]);

        // Re-registering keeps the original slot
        registry.register(token_service("first-tie", 1)).unwrap();
        let names: Vec<String> = registry
            .list(Some(GuardServiceType::Token))
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["best", "first-tie", "second-tie", "late-high"]);

        assert_eq!(registry.list(None).len(), 5);
    }

    #[test]
    fn test_disabled_services_are_not_listed() {
        let registry = dev_registry();
        registry.register(token_service("svc-a", 1)).unwrap();
        registry.register(token_service("svc-b", 2).disabled()).unwrap();

        assert_eq!(registry.list(Some(GuardServiceType::Token)).len(), 1);
        assert_eq!(registry.list_all().len(), 2);

        registry.set_enabled("svc-b", true).unwrap();
        assert_eq!(registry.list(Some(GuardServiceType::Token)).len(), 2);
    }

    #[test]
    fn test_unregister_and_updates() {
        let registry = dev_registry();
        registry.register(token_service("svc-a", 1)).unwrap();

        registry.set_priority("svc-a", 7).unwrap();
        assert_eq!(registry.get("svc-a").unwrap().priority, 7);

        assert!(matches!(
            registry.set_priority("ghost", 1),
            Err(OrchestratorError::NotFound { .. })
        ));

        assert!(registry.unregister("svc-a"));
        assert!(!registry.unregister("svc-a"));
        assert!(registry.get("svc-a").is_none());
    }
}
