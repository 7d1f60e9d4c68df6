// Fleetgate
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Configuration for the access and live-data core

use crate::error::{AccessError, AccessResult};
use crate::rbac::matrix::PermissionMatrix;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Routes the guards redirect to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouteConfig {
    /// Login screen, target of unauthenticated redirects
    pub login: String,

    /// Default fallback for unauthorized redirects
    pub unauthorized: String,

    /// Operational screen installers and admins land on
    pub operational: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            login: "/auth".to_string(),
            unauthorized: "/modules".to_string(),
            operational: "/kanban".to_string(),
        }
    }
}

/// Change-feed settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Schema channels subscribe to when none is given
    pub default_schema: String,

    /// Share one feed subscription per (resource, schema, filter)
    pub multiplex_channels: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            default_schema: "public".to_string(),
            multiplex_channels: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub routes: RouteConfig,

    pub realtime: RealtimeConfig,

    /// Optional TOML policy replacing the built-in permission matrix
    pub policy_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; a value that does not parse is
    /// an [`AccessError::InvalidConfig`].
    pub fn from_env() -> AccessResult<Self> {
        let defaults = Self::default();

        let multiplex_channels = match env::var("FLEETGATE_MULTIPLEX_CHANNELS") {
            Ok(raw) => parse_flag("FLEETGATE_MULTIPLEX_CHANNELS", &raw)?,
            Err(_) => defaults.realtime.multiplex_channels,
        };

        Ok(Self {
            routes: RouteConfig {
                login: env::var("FLEETGATE_LOGIN_ROUTE").unwrap_or(defaults.routes.login),
                unauthorized: env::var("FLEETGATE_UNAUTHORIZED_ROUTE").unwrap_or(defaults.routes.unauthorized),
                operational: env::var("FLEETGATE_OPERATIONAL_ROUTE").unwrap_or(defaults.routes.operational),
            },

            realtime: RealtimeConfig {
                default_schema: env::var("FLEETGATE_DEFAULT_SCHEMA").unwrap_or(defaults.realtime.default_schema),
                multiplex_channels,
            },

            policy_path: env::var("FLEETGATE_POLICY_PATH").ok().map(PathBuf::from),
        })
    }

    /// Parse a TOML configuration file body
    pub fn from_toml_str(content: &str) -> AccessResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Permission matrix selected by this configuration
    pub fn load_matrix(&self) -> AccessResult<PermissionMatrix> {
        match &self.policy_path {
            Some(path) => {
                let matrix = PermissionMatrix::load_from_file(path)?;
                info!(path = %path.display(), "Loaded permission policy");
                Ok(matrix)
            }
            None => Ok(PermissionMatrix::default_policy()),
        }
    }
}

/// Boolean environment value: `true`/`false`, `1`/`0`, `yes`/`no`, `on`/`off`
fn parse_flag(name: &str, raw: &str) -> AccessResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(AccessError::InvalidConfig {
            message: format!("{} must be a boolean, got '{}'", name, raw),
        }),
    }
}
