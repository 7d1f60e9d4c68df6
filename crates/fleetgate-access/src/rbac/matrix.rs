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

//! Static role × module permission matrix
//!
//! The matrix is built once at startup (built-in policy or a TOML policy
//! document) and shared read-only behind an `Arc`. Admin sits above every
//! lookup: whatever a policy says, admin gets full access to every module.

use crate::error::{AccessError, AccessResult};
use crate::rbac::modules::{AccessLevel, AppModule, NavigationItem};
use crate::rbac::roles::Role;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// Role × module access table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionMatrix {
    grants: HashMap<Role, BTreeMap<AppModule, AccessLevel>>,
}

impl PermissionMatrix {
    /// Create an empty matrix. Only admin can see anything.
    pub fn empty() -> Self {
        Self { grants: HashMap::new() }
    }

    /// Built-in policy shipped with the dashboard
    pub fn default_policy() -> Self {
        use AccessLevel::{Edit, View};
        use AppModule::*;

        let mut matrix = Self::empty();

        matrix.grant_all(
            Role::Manager,
            &[
                (Homologation, Edit),
                (Scheduling, Edit),
                (Kickoff, Edit),
                (Tracking, View),
                (Customers, Edit),
                (Orders, Edit),
                (Kits, Edit),
                (Installers, Edit),
                (Reports, View),
            ],
        );
        matrix.grant_all(
            Role::Operator,
            &[(Homologation, Edit), (Scheduling, View), (Kickoff, View), (Tracking, View), (Orders, View), (Kits, View)],
        );
        matrix.grant_all(Role::Viewer, &[(Homologation, View), (Tracking, View), (Reports, View)]);
        matrix.grant_all(Role::Installer, &[(Scheduling, View), (Kits, View)]);

        matrix
    }

    fn grant_all(&mut self, role: Role, grants: &[(AppModule, AccessLevel)]) {
        for (module, level) in grants {
            self.grant(role, *module, *level);
        }
    }

    /// Set the access level of a role on a module.
    ///
    /// Grants recorded for admin are kept but never lower its effective access.
    pub fn grant(&mut self, role: Role, module: AppModule, level: AccessLevel) {
        self.grants.entry(role).or_default().insert(module, level);
    }

    /// Effective access level of a role on a module
    pub fn access_level(&self, role: Option<Role>, module: AppModule) -> AccessLevel {
        match role {
            None => AccessLevel::None,
            Some(Role::Admin) => AccessLevel::Edit,
            Some(role) => self.grants.get(&role).and_then(|modules| modules.get(&module)).copied().unwrap_or_default(),
        }
    }

    /// Whether a role may view a module
    pub fn can_view(&self, role: Option<Role>, module: AppModule) -> bool {
        self.access_level(role, module).allows_view()
    }

    /// Whether a role may edit inside a module
    pub fn can_edit(&self, role: Option<Role>, module: AppModule) -> bool {
        self.access_level(role, module).allows_edit()
    }

    /// Snapshot of every module's level for a role
    pub fn permissions_for(&self, role: Option<Role>) -> PermissionSet {
        let levels = AppModule::ALL
            .into_iter()
            .map(|module| (module, self.access_level(role, module)))
            .filter(|(_, level)| *level != AccessLevel::None)
            .collect();

        PermissionSet { role, levels }
    }

    /// Navigation entries visible to a role, in canonical module order
    pub fn navigation_items(&self, role: Option<Role>) -> Vec<NavigationItem> {
        self.permissions_for(role).navigation_items()
    }

    /// Build a matrix from a parsed policy document
    pub fn from_document(document: &PolicyDocument) -> AccessResult<Self> {
        let mut matrix = Self::empty();

        for (raw_role, modules) in &document.roles {
            let role: Role = raw_role.parse().map_err(|_| AccessError::InvalidPolicy {
                message: format!("unknown role '{}'", raw_role),
            })?;

            if role.is_admin() {
                warn!("Policy document lists grants for admin; admin always has full access");
            }

            for (raw_module, raw_level) in modules {
                let module: AppModule = raw_module.parse().map_err(|_| AccessError::InvalidPolicy {
                    message: format!("unknown module '{}' for role '{}'", raw_module, role),
                })?;
                let level = parse_level(raw_level).ok_or_else(|| AccessError::InvalidPolicy {
                    message: format!("unknown access level '{}' for {}/{}", raw_level, role, module),
                })?;

                matrix.grant(role, module, level);
            }
        }

        debug!(roles = document.roles.len(), "Permission matrix built from policy document");
        Ok(matrix)
    }

    /// Parse a TOML policy document
    pub fn from_toml_str(content: &str) -> AccessResult<Self> {
        let document: PolicyDocument = toml::from_str(content)?;
        Self::from_document(&document)
    }

    /// Load a TOML policy document from disk
    pub fn load_from_file(path: impl AsRef<Path>) -> AccessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Export the non-admin grants as a policy document
    pub fn to_document(&self) -> PolicyDocument {
        let mut roles = BTreeMap::new();

        for role in Role::ALL.into_iter().filter(|role| !role.is_admin()) {
            let modules: BTreeMap<String, String> = self
                .permissions_for(Some(role))
                .levels
                .iter()
                .map(|(module, level)| (module.as_str().to_string(), level.to_string()))
                .collect();

            if !modules.is_empty() {
                roles.insert(role.as_str().to_string(), modules);
            }
        }

        PolicyDocument { roles }
    }
}

impl Default for PermissionMatrix {
    fn default() -> Self {
        Self::default_policy()
    }
}

fn parse_level(raw: &str) -> Option<AccessLevel> {
    match raw.to_ascii_lowercase().as_str() {
        "none" => Some(AccessLevel::None),
        "view" => Some(AccessLevel::View),
        "edit" => Some(AccessLevel::Edit),
        _ => None,
    }
}

/// On-disk policy format.
///
/// ```toml
/// [roles.operator]
/// scheduling = "view"
/// homologation = "edit"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyDocument {
    #[serde(default)]
    pub roles: BTreeMap<String, BTreeMap<String, String>>,
}

/// Modules a resolved role can reach, handed out alongside the role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionSet {
    role: Option<Role>,
    levels: BTreeMap<AppModule, AccessLevel>,
}

impl PermissionSet {
    /// The set granted to the no-role state
    pub fn none() -> Self {
        Self::default()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn access_level(&self, module: AppModule) -> AccessLevel {
        self.levels.get(&module).copied().unwrap_or_default()
    }

    pub fn can_view(&self, module: AppModule) -> bool {
        self.role.is_some_and(|role| role.is_admin()) || self.access_level(module).allows_view()
    }

    pub fn can_edit(&self, module: AppModule) -> bool {
        self.role.is_some_and(|role| role.is_admin()) || self.access_level(module).allows_edit()
    }

    /// Viewable modules in canonical order
    pub fn modules(&self) -> impl Iterator<Item = AppModule> + '_ {
        AppModule::ALL.into_iter().filter(|module| self.can_view(*module))
    }

    pub fn navigation_items(&self) -> Vec<NavigationItem> {
        self.modules().map(NavigationItem::from).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.modules().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_module() -> impl Strategy<Value = AppModule> {
        prop::sample::select(AppModule::ALL.to_vec())
    }

    fn any_role() -> impl Strategy<Value = Role> {
        prop::sample::select(Role::ALL.to_vec())
    }

    fn any_level() -> impl Strategy<Value = AccessLevel> {
        prop::sample::select(vec![AccessLevel::None, AccessLevel::View, AccessLevel::Edit])
    }

    proptest! {
        #[test]
        fn admin_views_every_module_under_any_policy(
            grants in prop::collection::vec((any_role(), any_module(), any_level()), 0..40),
            module in any_module(),
        ) {
            let mut matrix = PermissionMatrix::empty();
            for (role, m, level) in grants {
                matrix.grant(role, m, level);
            }
            prop_assert!(matrix.can_view(Some(Role::Admin), module));
        }

        #[test]
        fn non_admin_view_matches_table(
            grants in prop::collection::vec((any_role(), any_module(), any_level()), 0..40),
            role in any_role(),
            module in any_module(),
        ) {
            prop_assume!(!role.is_admin());
            let mut table: HashMap<(Role, AppModule), AccessLevel> = HashMap::new();
            let mut matrix = PermissionMatrix::empty();
            for (r, m, level) in grants {
                matrix.grant(r, m, level);
                table.insert((r, m), level);
            }
            let expected = table.get(&(role, module)).is_some_and(|level| level.allows_view());
            prop_assert_eq!(matrix.can_view(Some(role), module), expected);
        }

        #[test]
        fn navigation_preserves_canonical_order(role in any_role()) {
            let matrix = PermissionMatrix::default_policy();
            let items = matrix.navigation_items(Some(role));
            let positions: Vec<usize> = items
                .iter()
                .map(|item| AppModule::ALL.iter().position(|m| *m == item.module).unwrap())
                .collect();
            let mut sorted = positions.clone();
            sorted.sort_unstable();
            prop_assert_eq!(positions, sorted);
        }
    }

    #[test]
    fn test_no_role_sees_nothing() {
        let matrix = PermissionMatrix::default_policy();
        for module in AppModule::ALL {
            assert!(!matrix.can_view(None, module));
        }
        assert!(matrix.navigation_items(None).is_empty());
        assert!(matrix.permissions_for(None).is_empty());
        assert_eq!(PermissionSet::none(), matrix.permissions_for(None));
    }

    #[test]
    fn test_default_policy_scenarios() {
        let matrix = PermissionMatrix::default_policy();
        assert!(matrix.can_view(Some(Role::Operator), AppModule::Scheduling));
        assert!(!matrix.can_view(Some(Role::Operator), AppModule::UserManagement));
        assert!(!matrix.can_edit(Some(Role::Operator), AppModule::Scheduling));
        assert!(matrix.can_edit(Some(Role::Operator), AppModule::Homologation));
    }

    #[test]
    fn test_admin_navigation_lists_every_module() {
        let matrix = PermissionMatrix::empty();
        let items = matrix.navigation_items(Some(Role::Admin));
        assert_eq!(items.len(), AppModule::ALL.len());
        assert_eq!(items[0].route, "/homologation");
        assert_eq!(items.last().unwrap().label, "User Management");
    }

    #[test]
    fn test_navigation_omits_none_entries() {
        let mut matrix = PermissionMatrix::empty();
        matrix.grant(Role::Viewer, AppModule::Reports, AccessLevel::View);
        matrix.grant(Role::Viewer, AppModule::Tracking, AccessLevel::None);
        matrix.grant(Role::Viewer, AppModule::Homologation, AccessLevel::View);

        let routes: Vec<String> = matrix.navigation_items(Some(Role::Viewer)).into_iter().map(|item| item.route).collect();
        assert_eq!(routes, vec!["/homologation".to_string(), "/reports".to_string()]);
    }

    #[test]
    fn test_admin_cannot_be_lowered_by_policy() {
        let matrix = PermissionMatrix::from_toml_str(
            r#"
            [roles.admin]
            user-management = "none"
            "#,
        )
        .unwrap();
        assert!(matrix.can_view(Some(Role::Admin), AppModule::UserManagement));
        assert!(matrix.can_edit(Some(Role::Admin), AppModule::UserManagement));
    }

    #[test]
    fn test_policy_document_parsing() {
        let matrix = PermissionMatrix::from_toml_str(
            r#"
            [roles.installer]
            scheduling = "view"
            kits = "edit"

            [roles.viewer]
            reports = "view"
            "#,
        )
        .unwrap();

        assert!(matrix.can_view(Some(Role::Installer), AppModule::Scheduling));
        assert!(matrix.can_edit(Some(Role::Installer), AppModule::Kits));
        assert!(!matrix.can_view(Some(Role::Installer), AppModule::Reports));
        assert!(matrix.can_view(Some(Role::Viewer), AppModule::Reports));
        assert!(!matrix.can_view(Some(Role::Manager), AppModule::Reports));
    }

    #[test]
    fn test_policy_rejects_unknown_tokens() {
        let err = PermissionMatrix::from_toml_str("[roles.superuser]\nreports = \"view\"\n").unwrap_err();
        assert!(matches!(err, AccessError::InvalidPolicy { .. }));

        let err = PermissionMatrix::from_toml_str("[roles.viewer]\nbilling = \"view\"\n").unwrap_err();
        assert!(matches!(err, AccessError::InvalidPolicy { .. }));

        let err = PermissionMatrix::from_toml_str("[roles.viewer]\nreports = \"write\"\n").unwrap_err();
        assert!(matches!(err, AccessError::InvalidPolicy { .. }));
    }

    #[test]
    fn test_document_round_trip_keeps_grants() {
        let matrix = PermissionMatrix::default_policy();
        let rebuilt = PermissionMatrix::from_document(&matrix.to_document()).unwrap();
        for role in Role::ALL {
            for module in AppModule::ALL {
                assert_eq!(matrix.access_level(Some(role), module), rebuilt.access_level(Some(role), module));
            }
        }
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[roles.operator]\norders = \"edit\"").unwrap();

        let matrix = PermissionMatrix::load_from_file(file.path()).unwrap();
        assert!(matrix.can_edit(Some(Role::Operator), AppModule::Orders));
        assert!(!matrix.can_view(Some(Role::Operator), AppModule::Scheduling));
    }
}
