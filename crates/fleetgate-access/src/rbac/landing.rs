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

//! Landing route dispatch
//!
//! The landing route switches on the role value alone. It takes no module
//! or role-list parameters and is deliberately kept apart from
//! [`crate::rbac::guard::decide`].

use crate::config::RouteConfig;
use crate::rbac::guard::Navigator;
use crate::rbac::resolver::AccessSnapshot;
use crate::rbac::roles::Role;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of the landing route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum LandingDecision {
    Loading,
    /// Go to the operational screen
    Navigate { target: String },
    /// Authenticated without a role; render the terminal denied state
    AccessDenied,
    /// Fall through to the authentication screen
    RedirectToAuth { target: String },
}

/// Landing decision table
pub fn decide_landing(snapshot: &AccessSnapshot, routes: &RouteConfig) -> LandingDecision {
    if snapshot.loading {
        return LandingDecision::Loading;
    }

    match (snapshot.is_authenticated(), snapshot.role) {
        (true, Some(Role::Installer | Role::Admin)) => LandingDecision::Navigate {
            target: routes.operational.clone(),
        },
        (true, None) => LandingDecision::AccessDenied,
        _ => LandingDecision::RedirectToAuth { target: routes.login.clone() },
    }
}

/// Landing route mounted with a navigator
pub struct LandingGuard {
    routes: RouteConfig,
    navigator: Arc<dyn Navigator>,
    fired: Option<LandingDecision>,
}

impl LandingGuard {
    pub fn new(routes: RouteConfig, navigator: Arc<dyn Navigator>) -> Self {
        Self { routes, navigator, fired: None }
    }

    /// Evaluate for a render pass, navigating at most once per decision
    pub fn render(&mut self, snapshot: &AccessSnapshot) -> LandingDecision {
        let decision = decide_landing(snapshot, &self.routes);

        match &decision {
            LandingDecision::Navigate { target } | LandingDecision::RedirectToAuth { target } => {
                if self.fired.as_ref() != Some(&decision) {
                    debug!(route = %target, role = ?snapshot.role, "Landing redirect");
                    self.navigator.navigate(target);
                    self.fired = Some(decision.clone());
                }
            }
            LandingDecision::AccessDenied => {
                if self.fired.as_ref() != Some(&decision) {
                    info!(user_id = ?snapshot.identity.as_ref().map(|identity| identity.id.as_str()), "Signed-in user has no role assigned");
                    self.fired = Some(decision.clone());
                }
            }
            LandingDecision::Loading => {}
        }

        decision
    }
}
