pub mod guard;
pub mod modules;
pub mod policy;
pub mod simulate;

use crate::config::FleetgateConfig;
use anyhow::{Result, anyhow};
use fleetgate_access::rbac::{AppModule, PermissionMatrix, Role};
use serde::Serialize;
use std::sync::Arc;

pub struct CommandContext {
    pub config: FleetgateConfig,
    pub matrix: Arc<PermissionMatrix>,
}

impl CommandContext {
    pub fn new(config: FleetgateConfig) -> Result<Self> {
        let matrix = Arc::new(config.load_matrix()?);
        Ok(Self { config, matrix })
    }

    pub fn json(&self) -> bool {
        self.config.output.json
    }

    pub fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

/// `none` selects the unassigned state
pub fn parse_role(raw: &str) -> Result<Option<Role>> {
    if raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    raw.parse::<Role>().map(Some).map_err(|e| anyhow!("{}. Valid roles: {}", e, role_list()))
}

pub fn parse_module(raw: &str) -> Result<AppModule> {
    raw.parse::<AppModule>().map_err(|e| {
        let valid: Vec<&str> = AppModule::ALL.iter().map(|module| module.as_str()).collect();
        anyhow!("{}. Valid modules: {}", e, valid.join(", "))
    })
}

fn role_list() -> String {
    Role::ALL.iter().map(|role| role.as_str()).collect::<Vec<_>>().join(", ")
}
