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

//! Maps delivered change events to cache invalidations

use crate::realtime::cache::{InvalidationOutcome, QueryCache, QueryKey};
use crate::realtime::events::ChangeEvent;
use metrics::counter;
use std::sync::Arc;
use tracing::debug;

/// Issues one invalidation per delivered event
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn QueryCache>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn QueryCache>) -> Self {
        Self { cache }
    }

    /// Invalidate `key` in response to `event`.
    ///
    /// A key with no cache entry is not an error.
    pub fn on_event(&self, key: &QueryKey, event: &ChangeEvent) -> InvalidationOutcome {
        let outcome = self.cache.invalidate(key);

        match outcome {
            InvalidationOutcome::Invalidated => {
                counter!("fleetgate_invalidations_total", 1);
                debug!(key = %key, resource = %event.resource, kind = %event.kind, "Invalidated query");
            }
            InvalidationOutcome::Missing => {
                counter!("fleetgate_invalidations_missing_total", 1);
                debug!(key = %key, resource = %event.resource, kind = %event.kind, "No cached query to invalidate");
            }
        }

        outcome
    }
}
