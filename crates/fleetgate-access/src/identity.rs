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

//! Identity and role store collaborators

use crate::error::{AccessError, AccessResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Authenticated identity as reported by the session source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Stable identity ID
    pub id: String,

    /// Login e-mail, when the session source exposes it
    pub email: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), email: None }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Source of the current session's identity
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Fetch the current identity, `None` when signed out
    async fn current_identity(&self) -> AccessResult<Option<Identity>>;

    /// Receiver notified on sign-in and sign-out
    fn watch(&self) -> watch::Receiver<Option<Identity>>;
}

/// Store holding the role assigned to each identity
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Raw role value for an identity, `None` when unassigned.
    ///
    /// Values are decoded by the resolver; stores do not interpret them.
    async fn fetch_role(&self, identity_id: &str) -> AccessResult<Option<String>>;
}

/// Identity source backed by a watch channel
#[derive(Debug)]
pub struct StaticIdentitySource {
    sender: watch::Sender<Option<Identity>>,
}

impl StaticIdentitySource {
    pub fn new(initial: Option<Identity>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn sign_in(&self, identity: Identity) {
        self.sender.send_replace(Some(identity));
    }

    pub fn sign_out(&self) {
        self.sender.send_replace(None);
    }
}

impl Default for StaticIdentitySource {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl IdentitySource for StaticIdentitySource {
    async fn current_identity(&self) -> AccessResult<Option<Identity>> {
        Ok(self.sender.borrow().clone())
    }

    fn watch(&self) -> watch::Receiver<Option<Identity>> {
        self.sender.subscribe()
    }
}

/// Role store kept in memory
#[derive(Debug, Default)]
pub struct InMemoryRoleStore {
    roles: DashMap<String, String>,
    unavailable: DashMap<String, String>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, identity_id: impl Into<String>, role: impl Into<String>) {
        self.roles.insert(identity_id.into(), role.into());
    }

    pub fn revoke(&self, identity_id: &str) {
        self.roles.remove(identity_id);
    }

    /// Make lookups for an identity fail with the given message
    pub fn fail_lookups_for(&self, identity_id: impl Into<String>, message: impl Into<String>) {
        self.unavailable.insert(identity_id.into(), message.into());
    }
}

#[async_trait]
impl RoleStore for InMemoryRoleStore {
    async fn fetch_role(&self, identity_id: &str) -> AccessResult<Option<String>> {
        if let Some(message) = self.unavailable.get(identity_id) {
            return Err(AccessError::RoleLookup { message: message.clone() });
        }

        Ok(self.roles.get(identity_id).map(|role| role.clone()))
    }
}
