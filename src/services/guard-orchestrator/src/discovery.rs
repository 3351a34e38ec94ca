//! Service discovery sources
//!
//! A discovery source produces a list of service configurations. The
//! orchestrator registers each entry; invalid entries are skipped and a
//! failed run never removes services.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::ServiceConfig;

/// A source of service registrations
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Short label used in logs
    fn name(&self) -> &str;

    async fn discover(&self) -> Result<Vec<ServiceConfig>>;
}

/// Accepted manifest layouts: a bare list, or a `services:` key
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Manifest {
    List(Vec<ServiceConfig>),
    Document { services: Vec<ServiceConfig> },
}

impl Manifest {
    fn into_services(self) -> Vec<ServiceConfig> {
        match self {
            Manifest::List(services) => services,
            Manifest::Document { services } => services,
        }
    }
}

/// Parse a YAML or JSON manifest (JSON is valid YAML)
pub fn parse_manifest(content: &str) -> Result<Vec<ServiceConfig>> {
    let manifest: Manifest =
        serde_yaml::from_str(content).context("Failed to parse service manifest")?;
    Ok(manifest.into_services())
}

/// Reads services from a manifest file on every run
#[derive(Debug, Clone)]
pub struct ManifestDiscovery {
    path: PathBuf,
    label: String,
}

impl ManifestDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = format!("manifest:{}", path.display());
        Self { path, label }
    }
}

#[async_trait]
impl ServiceDiscovery for ManifestDiscovery {
    fn name(&self) -> &str {
        &self.label
    }

    async fn discover(&self) -> Result<Vec<ServiceConfig>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read manifest {}", self.path.display()))?;
        parse_manifest(&content)
    }
}

/// Fetches services from a discovery endpoint returning a JSON list
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    endpoint: String,
    client: Client,
}

impl HttpDiscovery {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build discovery client")?;

        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl ServiceDiscovery for HttpDiscovery {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn discover(&self) -> Result<Vec<ServiceConfig>> {
        let manifest: Manifest = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .with_context(|| format!("Discovery request to {} failed", self.endpoint))?
            .error_for_status()
            .context("Discovery endpoint returned an error status")?
            .json()
            .await
            .context("Discovery endpoint returned an invalid body")?;

        Ok(manifest.into_services())
    }
}
