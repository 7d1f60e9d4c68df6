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

//! Session role resolution
//!
//! The [`RoleResolver`] is the only writer of the session's access state. It
//! publishes [`AccessSnapshot`]s on a watch channel; readers hold a
//! [`SessionAccess`] and never mutate anything.
//!
//! Every resolution is stamped with a generation. A result is published only
//! if its generation is still the latest and the resolver has not been shut
//! down, so a slow lookup for a previous identity can never overwrite the
//! state of the current one.

use crate::error::AccessError;
use crate::identity::{Identity, IdentitySource, RoleStore};
use crate::rbac::matrix::{PermissionMatrix, PermissionSet};
use crate::rbac::modules::{AppModule, NavigationItem};
use crate::rbac::roles::Role;
use metrics::counter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Access state of the session at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSnapshot {
    /// Signed-in identity, `None` when signed out
    pub identity: Option<Identity>,

    /// Resolved role, `None` when unassigned or when resolution failed
    pub role: Option<Role>,

    /// Matrix snapshot for `role`
    pub permissions: PermissionSet,

    /// True while the role lookup is in flight
    pub loading: bool,

    /// Resolution generation that produced this snapshot
    pub generation: u64,

    /// The identity source failed. The session counts as authenticated with
    /// no role, so guards deny instead of sending it to login.
    pub identity_unavailable: bool,
}

impl AccessSnapshot {
    /// State before the first resolution completes
    pub fn initial() -> Self {
        Self {
            identity: None,
            role: None,
            permissions: PermissionSet::none(),
            loading: true,
            generation: 0,
            identity_unavailable: false,
        }
    }

    fn pending(identity: Option<Identity>, generation: u64) -> Self {
        Self {
            identity,
            role: None,
            permissions: PermissionSet::none(),
            loading: true,
            generation,
            identity_unavailable: false,
        }
    }

    fn resolved(identity: Option<Identity>, role: Option<Role>, matrix: &PermissionMatrix, generation: u64) -> Self {
        Self {
            identity,
            role,
            permissions: matrix.permissions_for(role),
            loading: false,
            generation,
            identity_unavailable: false,
        }
    }

    fn unavailable(matrix: &PermissionMatrix, generation: u64) -> Self {
        Self {
            identity_unavailable: true,
            ..Self::resolved(None, None, matrix, generation)
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some() || self.identity_unavailable
    }

    pub fn can_view_module(&self, module: AppModule) -> bool {
        !self.loading && self.permissions.can_view(module)
    }

    pub fn navigation_items(&self) -> Vec<NavigationItem> {
        if self.loading {
            return Vec::new();
        }
        self.permissions.navigation_items()
    }
}

/// Resolves the session role and publishes access snapshots
pub struct RoleResolver {
    store: Arc<dyn RoleStore>,
    matrix: Arc<PermissionMatrix>,
    state: watch::Sender<AccessSnapshot>,
    generation: AtomicU64,
    alive: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl RoleResolver {
    pub fn new(store: Arc<dyn RoleStore>, matrix: Arc<PermissionMatrix>) -> Self {
        let (state, _) = watch::channel(AccessSnapshot::initial());

        Self {
            store,
            matrix,
            state,
            generation: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            watcher: Mutex::new(None),
        }
    }

    /// Read handle on the session access state
    pub fn session(&self) -> SessionAccess {
        SessionAccess {
            receiver: self.state.subscribe(),
            matrix: Arc::clone(&self.matrix),
        }
    }

    /// Latest published snapshot
    pub fn current(&self) -> AccessSnapshot {
        self.state.borrow().clone()
    }

    pub fn matrix(&self) -> &Arc<PermissionMatrix> {
        &self.matrix
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Resolve the role for an identity and publish the result.
    ///
    /// Failures degrade to the no-role state. If a newer resolution started
    /// meanwhile, the result is discarded and the latest snapshot is returned.
    pub async fn resolve(&self, identity: Option<Identity>) -> AccessSnapshot {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        counter!("fleetgate_role_resolutions_total", 1);

        let Some(identity) = identity else {
            let snapshot = AccessSnapshot::resolved(None, None, &self.matrix, generation);
            self.publish(snapshot);
            debug!(generation, "Session signed out");
            return self.current();
        };

        self.publish(AccessSnapshot::pending(Some(identity.clone()), generation));

        let role = match self.store.fetch_role(&identity.id).await {
            Ok(raw) => Role::decode(raw.as_deref()),
            Err(e) => {
                counter!("fleetgate_role_resolution_failures_total", 1);
                warn!(
                    user_id = %identity.id,
                    error = %e,
                    error_type = e.error_type(),
                    "Role resolution failed, treating session as unassigned"
                );
                None
            }
        };

        let user_id = identity.id.clone();
        let snapshot = AccessSnapshot::resolved(Some(identity), role, &self.matrix, generation);

        if self.publish(snapshot) {
            info!(user_id = %user_id, role = ?role, generation, "Session role resolved");
        } else {
            debug!(user_id = %user_id, generation, "Discarding superseded role resolution");
        }

        self.current()
    }

    /// Publish the degraded state for a failed identity fetch.
    ///
    /// The session ends up authenticated and unassigned, the same state a
    /// failed role lookup produces.
    pub fn resolve_unavailable(&self, error: &AccessError) -> AccessSnapshot {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        counter!("fleetgate_role_resolutions_total", 1);
        counter!("fleetgate_role_resolution_failures_total", 1);
        warn!(
            error = %error,
            error_type = error.error_type(),
            generation,
            "Identity source unavailable, treating session as unassigned"
        );

        self.publish(AccessSnapshot::unavailable(&self.matrix, generation));
        self.current()
    }

    /// Re-resolve the role of the current identity.
    ///
    /// A session whose identity could not be fetched has nothing to look up
    /// and keeps its degraded snapshot.
    pub async fn reload(&self) -> AccessSnapshot {
        let (identity, unavailable) = {
            let current = self.state.borrow();
            (current.identity.clone(), current.identity_unavailable)
        };
        if unavailable {
            return self.current();
        }
        self.resolve(identity).await
    }

    /// Follow an identity source, re-resolving on every sign-in and sign-out.
    ///
    /// Each change aborts the resolution still in flight for the previous
    /// identity. The task stops on [`RoleResolver::shutdown`] or when the
    /// source goes away.
    pub fn watch_identity(self: &Arc<Self>, source: Arc<dyn IdentitySource>) {
        let resolver = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut changes = source.watch();

            let mut inflight = match source.current_identity().await {
                Ok(identity) => Some(resolver.spawn_resolution(identity)),
                Err(e) => {
                    resolver.resolve_unavailable(&e);
                    None
                }
            };

            while changes.changed().await.is_ok() {
                if !resolver.is_alive() {
                    break;
                }

                let identity = changes.borrow_and_update().clone();
                if let Some(previous) = inflight.take() {
                    previous.abort();
                }
                inflight = Some(resolver.spawn_resolution(identity));
            }

            debug!("Identity watcher stopped");
        });

        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    fn spawn_resolution(self: &Arc<Self>, identity: Option<Identity>) -> JoinHandle<()> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            resolver.resolve(identity).await;
        })
    }

    /// Stop publishing. Resolutions still in flight are dropped on completion.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
        debug!("Role resolver shut down");
    }

    fn publish(&self, snapshot: AccessSnapshot) -> bool {
        if !self.is_alive() {
            return false;
        }

        // The check runs under the channel's write lock, after any newer
        // resolution has already bumped the generation counter.
        self.state.send_if_modified(|current| {
            if snapshot.generation != self.generation.load(Ordering::SeqCst) || snapshot.generation < current.generation {
                return false;
            }
            *current = snapshot;
            true
        })
    }
}

impl Drop for RoleResolver {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

/// Read-only view on the session's access state
#[derive(Debug, Clone)]
pub struct SessionAccess {
    receiver: watch::Receiver<AccessSnapshot>,
    matrix: Arc<PermissionMatrix>,
}

impl SessionAccess {
    pub fn snapshot(&self) -> AccessSnapshot {
        self.receiver.borrow().clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.receiver.borrow().role
    }

    pub fn is_loading(&self) -> bool {
        self.receiver.borrow().loading
    }

    /// Whether the session may view a module. False while loading.
    pub fn can_view_module(&self, module: AppModule) -> bool {
        self.receiver.borrow().can_view_module(module)
    }

    /// Navigation entries for the session, empty while loading
    pub fn navigation_items(&self) -> Vec<NavigationItem> {
        self.receiver.borrow().navigation_items()
    }

    pub fn matrix(&self) -> &Arc<PermissionMatrix> {
        &self.matrix
    }

    /// Wait for the next published snapshot. `None` once the resolver is gone.
    pub async fn changed(&mut self) -> Option<AccessSnapshot> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Wait until a snapshot with `loading == false` is published
    pub async fn settled(&mut self) -> Option<AccessSnapshot> {
        let snapshot = self.receiver.wait_for(|snapshot| !snapshot.loading).await.ok()?;
        Some(snapshot.clone())
    }
}
