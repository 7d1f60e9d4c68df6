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

//! Role definitions
//!
//! The role set is closed. An authenticated identity without an assigned
//! role is represented as `Option<Role>::None` everywhere in the crate.

use crate::error::AccessError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Role assigned to an identity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Privileged role, sees every module
    Admin,
    /// Back-office manager
    Manager,
    /// Day-to-day operator
    Operator,
    /// Read-only user
    Viewer,
    /// Field installer
    Installer,
}

impl Role {
    /// Every role, in declaration order
    pub const ALL: [Role; 5] = [Role::Admin, Role::Manager, Role::Operator, Role::Viewer, Role::Installer];

    /// Wire token for this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
            Role::Installer => "installer",
        }
    }

    /// Whether this role bypasses every module and role-list check
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Decode a raw role value coming from the role store.
    ///
    /// Fails closed: a missing, empty or unrecognised value yields `None`.
    pub fn decode(raw: Option<&str>) -> Option<Role> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }

        match raw.parse::<Role>() {
            Ok(role) => Some(role),
            Err(e) => {
                warn!(value = %raw, error = %e, "Unrecognised role value, treating as unassigned");
                None
            }
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "operator" => Ok(Role::Operator),
            "viewer" => Ok(Role::Viewer),
            "installer" => Ok(Role::Installer),
            _ => Err(AccessError::UnknownRole { value: s.to_string() }),
        }
    }
}
