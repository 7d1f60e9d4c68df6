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

//! Application modules and access levels

use crate::error::AccessError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Functional area of the dashboard subject to view-access control.
///
/// Declaration order is the canonical navigation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum AppModule {
    Homologation,
    Scheduling,
    Kickoff,
    Tracking,
    Customers,
    Orders,
    Kits,
    Installers,
    Reports,
    UserManagement,
}

impl AppModule {
    /// Every module in canonical order
    pub const ALL: [AppModule; 10] = [
        AppModule::Homologation,
        AppModule::Scheduling,
        AppModule::Kickoff,
        AppModule::Tracking,
        AppModule::Customers,
        AppModule::Orders,
        AppModule::Kits,
        AppModule::Installers,
        AppModule::Reports,
        AppModule::UserManagement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AppModule::Homologation => "homologation",
            AppModule::Scheduling => "scheduling",
            AppModule::Kickoff => "kickoff",
            AppModule::Tracking => "tracking",
            AppModule::Customers => "customers",
            AppModule::Orders => "orders",
            AppModule::Kits => "kits",
            AppModule::Installers => "installers",
            AppModule::Reports => "reports",
            AppModule::UserManagement => "user-management",
        }
    }

    /// Route the module is mounted at
    pub fn route(&self) -> &'static str {
        match self {
            AppModule::Homologation => "/homologation",
            AppModule::Scheduling => "/scheduling",
            AppModule::Kickoff => "/kickoff",
            AppModule::Tracking => "/tracking",
            AppModule::Customers => "/customers",
            AppModule::Orders => "/orders",
            AppModule::Kits => "/kits",
            AppModule::Installers => "/installers",
            AppModule::Reports => "/reports",
            AppModule::UserManagement => "/users",
        }
    }

    /// Label shown in navigation
    pub fn label(&self) -> &'static str {
        match self {
            AppModule::Homologation => "Homologation",
            AppModule::Scheduling => "Scheduling",
            AppModule::Kickoff => "Kickoff",
            AppModule::Tracking => "Tracking",
            AppModule::Customers => "Customers",
            AppModule::Orders => "Orders",
            AppModule::Kits => "Kits",
            AppModule::Installers => "Installers",
            AppModule::Reports => "Reports",
            AppModule::UserManagement => "User Management",
        }
    }
}

impl fmt::Display for AppModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppModule {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppModule::ALL
            .into_iter()
            .find(|module| module.as_str() == s)
            .ok_or_else(|| AccessError::UnknownModule { value: s.to_string() })
    }
}

/// Access granted to a role on a module
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    None,
    View,
    /// Implies view
    Edit,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::View => "view",
            AccessLevel::Edit => "edit",
        }
    }

    pub fn allows_view(&self) -> bool {
        *self >= AccessLevel::View
    }

    pub fn allows_edit(&self) -> bool {
        *self == AccessLevel::Edit
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Navigation entry derived from the permission matrix
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NavigationItem {
    /// Module the entry leads to
    pub module: AppModule,

    /// Target route
    pub route: String,

    /// Display label
    pub label: String,
}

impl From<AppModule> for NavigationItem {
    fn from(module: AppModule) -> Self {
        Self {
            module,
            route: module.route().to_string(),
            label: module.label().to_string(),
        }
    }
}
