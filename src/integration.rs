use crate::model::{ComponentResult, IntegrationConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

pub const MANIFEST_FILE: &str = "stratum.json";

/// Wires generated components together once they all exist.
#[async_trait]
pub trait Integrator: Send + Sync {
    async fn integrate(&self, components: &[ComponentResult], config: &IntegrationConfig) -> Result<()>;
}

/// Does nothing. Used when a caller only wants the components.
pub struct NoopIntegrator;

#[async_trait]
impl Integrator for NoopIntegrator {
    async fn integrate(&self, _components: &[ComponentResult], _config: &IntegrationConfig) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "type")]
    pub component_type: String,
    pub name: String,
    /// Relative to the project root when possible.
    pub path: PathBuf,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub project: String,
    pub generated_at: DateTime<Utc>,
    pub components: Vec<ManifestEntry>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// Writes a `stratum.json` manifest describing the project layout.
pub struct ManifestIntegrator;

impl ManifestIntegrator {
    pub fn manifest(components: &[ComponentResult], config: &IntegrationConfig) -> Manifest {
        Manifest {
            project: config.project_name.clone(),
            generated_at: Utc::now(),
            components: components
                .iter()
                .filter(|c| c.success)
                .map(|c| ManifestEntry {
                    component_type: c.component_type.clone(),
                    name: c.name.clone(),
                    path: c
                        .path
                        .strip_prefix(&config.output_dir)
                        .map(PathBuf::from)
                        .unwrap_or_else(|_| c.path.clone()),
                    used_fallback: c.used_fallback,
                })
                .collect(),
            settings: config.settings.clone(),
        }
    }
}

#[async_trait]
impl Integrator for ManifestIntegrator {
    async fn integrate(&self, components: &[ComponentResult], config: &IntegrationConfig) -> Result<()> {
        let manifest = Self::manifest(components, config);
        let path = config.output_dir.join(MANIFEST_FILE);
        let content = serde_json::to_string_pretty(&manifest)?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write manifest {path:?}"))?;
        info!("Wrote project manifest to {:?}", path);
        Ok(())
    }
}
