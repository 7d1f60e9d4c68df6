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

//! Change-feed backend collaborator

use crate::error::{AccessError, AccessResult};
use crate::realtime::events::{ChangeEvent, ChannelSpec};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Identifier of one feed subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Acknowledged subscription and its ordered event stream
#[derive(Debug)]
pub struct FeedSubscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// Backend emitting row changes
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to a resource. Resolves once the backend acknowledged;
    /// nothing emitted before the acknowledgement is delivered.
    async fn subscribe(&self, spec: &ChannelSpec) -> AccessResult<FeedSubscription>;

    /// Release a subscription. Unknown IDs are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

struct Registration {
    spec: ChannelSpec,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

/// Change feed living in process memory
#[derive(Default)]
pub struct InMemoryChangeFeed {
    next_id: AtomicU64,
    registrations: DashMap<SubscriptionId, Registration>,
    refused: DashMap<String, String>,
    ack_delay: Option<Duration>,
    default_schema: Option<String>,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay acknowledgements, as a network round trip would
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = Some(delay);
        self
    }

    /// Schema assumed for raw payloads that carry none
    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }

    /// Refuse future subscriptions to `resource`
    pub fn refuse(&self, resource: impl Into<String>, reason: impl Into<String>) {
        self.refused.insert(resource.into(), reason.into());
    }

    /// Deliver an event to every matching subscription, returning how many received it
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();

        for registration in self.registrations.iter() {
            if !registration.spec.matches(&event) {
                continue;
            }
            if registration.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(*registration.key());
            }
        }

        for id in gone {
            self.registrations.remove(&id);
            debug!(subscription = %id, "Pruned subscription with no receiver");
        }

        trace!(resource = %event.resource, kind = %event.kind, delivered, "Change emitted");
        delivered
    }

    /// Decode a backend payload and emit it
    pub fn emit_raw(&self, raw: &serde_json::Value) -> AccessResult<usize> {
        let schema = self.default_schema.as_deref().unwrap_or(crate::realtime::DEFAULT_SCHEMA);
        let event = ChangeEvent::decode_with_default(raw, schema)?;
        Ok(self.emit(event))
    }

    /// Drop every subscription on a resource, as a backend disconnect would
    pub fn disconnect(&self, resource: &str) -> usize {
        let before = self.registrations.len();
        self.registrations.retain(|_, registration| registration.spec.resource != resource);
        let dropped = before - self.registrations.len();
        if dropped > 0 {
            warn!(resource = %resource, dropped, "Change feed disconnected subscriptions");
        }
        dropped
    }

    /// Live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.registrations.len()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn subscribe(&self, spec: &ChannelSpec) -> AccessResult<FeedSubscription> {
        if let Some(delay) = self.ack_delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = self.refused.get(&spec.resource) {
            return Err(AccessError::Subscription {
                resource: spec.resource.clone(),
                message: reason.clone(),
            });
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (sender, events) = mpsc::unbounded_channel();
        self.registrations.insert(id, Registration { spec: spec.clone(), sender });

        debug!(subscription = %id, channel = %spec, "Subscription acknowledged");
        Ok(FeedSubscription { id, events })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if self.registrations.remove(&id).is_some() {
            debug!(subscription = %id, "Subscription released");
        }
    }
}
