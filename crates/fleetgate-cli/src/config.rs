use anyhow::{Context, Result};
use fleetgate_access::Config;
use fleetgate_access::rbac::PermissionMatrix;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetgateConfig {
    #[serde(flatten)]
    pub access: Config,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Print decisions as JSON instead of text
    pub json: bool,
}

impl FleetgateConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn resolve_config(cli_config: Option<PathBuf>, cli_policy: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(config_path) = cli_config {
            Self::load_from_file(config_path)?
        } else if let Ok(env_config) = std::env::var("FLEETGATE_CONFIG") {
            Self::load_from_file(env_config)?
        } else {
            Self {
                access: Config::from_env()?,
                output: OutputConfig::default(),
            }
        };

        // CLI policy overrides whatever the config selected
        if let Some(policy) = cli_policy {
            config.access.policy_path = Some(policy);
        }

        Ok(config)
    }

    pub fn load_matrix(&self) -> Result<PermissionMatrix> {
        Ok(self.access.load_matrix()?)
    }
}
