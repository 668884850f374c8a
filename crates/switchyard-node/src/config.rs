//! Configuration loading.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use switchyard_types::{NodeConfig, Settings, SwitchyardError, SwitchyardResult};
use tracing::info;

/// Load a node configuration from disk, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    NodeConfig::default()
}

/// Default config file location: `~/.switchyard/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".switchyard")
        .join("config.toml")
}

/// One service entry of a mesh file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(default)]
    pub settings: Settings,
}

/// Every service of a deployment, keyed by service name.
///
/// ```toml
/// [services.hub.settings]
/// hub = true
/// port = 7000
///
/// [services.adder.settings]
/// environment = { RUST_LOG = "debug" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceEntry>,
}

impl MeshConfig {
    /// Settings by service name.
    pub fn settings(&self) -> BTreeMap<String, Settings> {
        self.services
            .iter()
            .map(|(name, entry)| (name.clone(), entry.settings.clone()))
            .collect()
    }
}

/// Load a mesh file. Unlike [`load_config`] a missing or broken file is an
/// error: there is no sensible default deployment.
pub fn load_mesh(path: &Path) -> SwitchyardResult<MeshConfig> {
    let contents = std::fs::read_to_string(path)?;
    let mesh: MeshConfig = toml::from_str(&contents)
        .map_err(|e| SwitchyardError::Config(format!("{}: {e}", path.display())))?;
    info!(
        path = %path.display(),
        services = mesh.services.len(),
        "Loaded mesh file"
    );
    Ok(mesh)
}
