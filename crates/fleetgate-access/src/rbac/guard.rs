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

//! Route guard for protected screens
//!
//! [`decide`] is the pure decision table. [`RouteGuard`] wraps it for one
//! mounted route and owns the navigation side effect, firing each redirect
//! at most once however many times the route re-renders.

use crate::config::RouteConfig;
use crate::rbac::matrix::PermissionMatrix;
use crate::rbac::modules::AppModule;
use crate::rbac::resolver::AccessSnapshot;
use crate::rbac::roles::Role;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Performs client-side navigation
pub trait Navigator: Send + Sync {
    /// Replace the current location with `target`
    fn navigate(&self, target: &str);
}

/// Navigator that records every navigation it is asked to perform
#[derive(Debug, Default)]
pub struct NavigationLog {
    entries: Mutex<Vec<String>>,
}

impl NavigationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Navigator for NavigationLog {
    fn navigate(&self, target: &str) {
        self.entries.lock().push(target.to_string());
    }
}

/// Restrictions declared by a protected route
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardConfig {
    /// Module the route belongs to
    pub required_module: Option<AppModule>,

    /// Legacy allow-list, consulted only when no module is required
    pub allowed_roles: Vec<Role>,

    /// Target for unauthorized redirects, defaults to the configured fallback
    pub redirect_to: Option<String>,
}

impl GuardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_module(mut self, module: AppModule) -> Self {
        self.required_module = Some(module);
        self
    }

    pub fn allow_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.allowed_roles = roles.into_iter().collect();
        self
    }

    pub fn redirect_to(mut self, target: impl Into<String>) -> Self {
        self.redirect_to = Some(target.into());
        self
    }

    /// Whether the route declares any module or role restriction
    pub fn is_restricted(&self) -> bool {
        self.required_module.is_some() || !self.allowed_roles.is_empty()
    }
}

/// Outcome of evaluating a guard for one render
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GuardDecision {
    /// Role still resolving, render a placeholder
    Loading,
    /// Render the protected content
    Admit,
    /// No identity, send to login
    RedirectUnauthenticated { target: String },
    /// Identity lacks access, send to fallback
    RedirectUnauthorized { target: String },
}

impl GuardDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, GuardDecision::Admit)
    }

    pub fn redirect_target(&self) -> Option<&str> {
        match self {
            GuardDecision::RedirectUnauthenticated { target } | GuardDecision::RedirectUnauthorized { target } => Some(target),
            GuardDecision::Loading | GuardDecision::Admit => None,
        }
    }
}

/// Evaluate a route guard.
///
/// Rules apply in order: loading holds, missing identity goes to login,
/// an unassigned role is refused on restricted routes, admin is admitted,
/// then the required module is checked, then the legacy role list.
pub fn decide(snapshot: &AccessSnapshot, config: &GuardConfig, matrix: &PermissionMatrix, routes: &RouteConfig) -> GuardDecision {
    if snapshot.loading {
        return GuardDecision::Loading;
    }

    if !snapshot.is_authenticated() {
        return GuardDecision::RedirectUnauthenticated { target: routes.login.clone() };
    }

    let unauthorized = || GuardDecision::RedirectUnauthorized {
        target: config.redirect_to.clone().unwrap_or_else(|| routes.unauthorized.clone()),
    };

    let Some(role) = snapshot.role else {
        return if config.is_restricted() { unauthorized() } else { GuardDecision::Admit };
    };

    if role.is_admin() {
        return GuardDecision::Admit;
    }

    if let Some(module) = config.required_module {
        return if matrix.can_view(Some(role), module) { GuardDecision::Admit } else { unauthorized() };
    }

    if !config.allowed_roles.is_empty() {
        return if config.allowed_roles.contains(&role) { GuardDecision::Admit } else { unauthorized() };
    }

    GuardDecision::Admit
}

/// Guard mounted on one protected route
pub struct RouteGuard {
    config: GuardConfig,
    matrix: Arc<PermissionMatrix>,
    routes: RouteConfig,
    navigator: Arc<dyn Navigator>,
    fired: Option<GuardDecision>,
}

impl RouteGuard {
    pub fn new(config: GuardConfig, matrix: Arc<PermissionMatrix>, routes: RouteConfig, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            config,
            matrix,
            routes,
            navigator,
            fired: None,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Decision for a snapshot, without side effects
    pub fn evaluate(&self, snapshot: &AccessSnapshot) -> GuardDecision {
        decide(snapshot, &self.config, &self.matrix, &self.routes)
    }

    /// Evaluate for a render pass and perform the redirect if one is due.
    ///
    /// A redirect fires once; re-rendering with the same decision does not
    /// navigate again. Admitting clears the memory so a later loss of
    /// access redirects again.
    pub fn render(&mut self, snapshot: &AccessSnapshot) -> GuardDecision {
        let decision = self.evaluate(snapshot);

        match &decision {
            GuardDecision::Loading => {}
            GuardDecision::Admit => {
                self.fired = None;
            }
            GuardDecision::RedirectUnauthenticated { target } | GuardDecision::RedirectUnauthorized { target } => {
                if self.fired.as_ref() == Some(&decision) {
                    debug!(route = %target, "Redirect already performed for this decision");
                } else {
                    if matches!(decision, GuardDecision::RedirectUnauthorized { .. }) {
                        warn!(
                            role = ?snapshot.role,
                            module = ?self.config.required_module,
                            route = %target,
                            "Route access denied"
                        );
                    }
                    counter!("fleetgate_guard_redirects_total", 1);
                    self.navigator.navigate(target);
                    self.fired = Some(decision.clone());
                }
            }
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::rbac::modules::AccessLevel;

    fn snapshot(loading: bool, identity: bool, role: Option<Role>) -> AccessSnapshot {
        let matrix = PermissionMatrix::default_policy();
        AccessSnapshot {
            identity: identity.then(|| Identity::new("u-1")),
            role,
            permissions: matrix.permissions_for(role),
            loading,
            generation: 1,
            identity_unavailable: false,
        }
    }

    fn mounted(config: GuardConfig) -> (RouteGuard, Arc<NavigationLog>) {
        let log = Arc::new(NavigationLog::new());
        let guard = RouteGuard::new(config, Arc::new(PermissionMatrix::default_policy()), RouteConfig::default(), log.clone());
        (guard, log)
    }

    #[test]
    fn test_loading_never_redirects() {
        let configs = [
            GuardConfig::new(),
            GuardConfig::new().require_module(AppModule::UserManagement),
            GuardConfig::new().allow_roles([Role::Manager]),
        ];

        for config in configs {
            for role in [None, Some(Role::Viewer), Some(Role::Admin)] {
                for identity in [true, false] {
                    let (mut guard, log) = mounted(config.clone());
                    assert_eq!(guard.render(&snapshot(true, identity, role)), GuardDecision::Loading);
                    assert!(log.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_missing_identity_always_goes_to_login() {
        let configs = [
            GuardConfig::new(),
            GuardConfig::new().require_module(AppModule::Scheduling),
            GuardConfig::new().allow_roles([Role::Operator]).redirect_to("/elsewhere"),
        ];

        for config in configs {
            let (guard, _) = mounted(config);
            assert_eq!(
                guard.evaluate(&snapshot(false, false, None)),
                GuardDecision::RedirectUnauthenticated { target: "/auth".to_string() }
            );
        }
    }

    #[test]
    fn test_operator_admitted_to_scheduling() {
        let (guard, _) = mounted(GuardConfig::new().require_module(AppModule::Scheduling));
        assert_eq!(guard.evaluate(&snapshot(false, true, Some(Role::Operator))), GuardDecision::Admit);
    }

    #[test]
    fn test_operator_refused_user_management() {
        let (guard, _) = mounted(GuardConfig::new().require_module(AppModule::UserManagement));
        assert_eq!(
            guard.evaluate(&snapshot(false, true, Some(Role::Operator))),
            GuardDecision::RedirectUnauthorized { target: "/modules".to_string() }
        );
    }

    #[test]
    fn test_admin_bypasses_module_denied_to_everyone() {
        let mut matrix = PermissionMatrix::empty();
        for role in Role::ALL {
            matrix.grant(role, AppModule::Reports, AccessLevel::None);
        }
        let config = GuardConfig::new().require_module(AppModule::Reports).allow_roles([Role::Viewer]);
        let decision = decide(&snapshot(false, true, Some(Role::Admin)), &config, &matrix, &RouteConfig::default());
        assert_eq!(decision, GuardDecision::Admit);
    }

    #[test]
    fn test_unassigned_role_on_restricted_route() {
        let (guard, _) = mounted(GuardConfig::new().allow_roles([Role::Viewer]).redirect_to("/denied"));
        assert_eq!(
            guard.evaluate(&snapshot(false, true, None)),
            GuardDecision::RedirectUnauthorized { target: "/denied".to_string() }
        );

        let (open, _) = mounted(GuardConfig::new());
        assert_eq!(open.evaluate(&snapshot(false, true, None)), GuardDecision::Admit);
    }

    #[test]
    fn test_module_takes_precedence_over_role_list() {
        let config = GuardConfig::new().require_module(AppModule::Scheduling).allow_roles([Role::Manager]);
        let (guard, _) = mounted(config);
        assert_eq!(guard.evaluate(&snapshot(false, true, Some(Role::Installer))), GuardDecision::Admit);
    }

    #[test]
    fn test_legacy_role_list() {
        let (guard, _) = mounted(GuardConfig::new().allow_roles([Role::Manager, Role::Operator]));
        assert_eq!(guard.evaluate(&snapshot(false, true, Some(Role::Operator))), GuardDecision::Admit);
        assert!(guard.evaluate(&snapshot(false, true, Some(Role::Viewer))).redirect_target().is_some());
    }

    #[test]
    fn test_redirect_fires_once_per_decision() {
        let (mut guard, log) = mounted(GuardConfig::new().require_module(AppModule::UserManagement));
        let denied = snapshot(false, true, Some(Role::Viewer));

        let first = guard.render(&denied);
        let second = guard.render(&denied);
        assert_eq!(first, second);
        assert_eq!(log.entries(), vec!["/modules".to_string()]);

        // A reload passes through loading; the same outcome still does not re-navigate
        guard.render(&snapshot(true, true, None));
        guard.render(&denied);
        assert_eq!(log.len(), 1);

        // Sign-out is a different decision
        guard.render(&snapshot(false, false, None));
        assert_eq!(log.entries(), vec!["/modules".to_string(), "/auth".to_string()]);
    }

    #[test]
    fn test_admit_rearms_redirect() {
        let (mut guard, log) = mounted(GuardConfig::new().require_module(AppModule::Reports));

        guard.render(&snapshot(false, true, Some(Role::Operator)));
        guard.render(&snapshot(false, true, Some(Role::Viewer)));
        guard.render(&snapshot(false, true, Some(Role::Operator)));
        assert_eq!(log.len(), 2);
    }
}
