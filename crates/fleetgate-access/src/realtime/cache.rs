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

//! Query cache collaborator
//!
//! The core only ever calls [`QueryCache::invalidate`]. [`InMemoryQueryCache`]
//! is a reference cache: entries carry a staleness flag and a version, and
//! every invalidation is broadcast so refetch observers can react.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Composite cache key, invalidated as a unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn is_composite(&self) -> bool {
        self.0.len() > 1
    }
}

impl From<&str> for QueryKey {
    fn from(token: &str) -> Self {
        Self(vec![token.to_string()])
    }
}

impl From<String> for QueryKey {
    fn from(token: String) -> Self {
        Self(vec![token])
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(tokens: [&str; N]) -> Self {
        Self::new(tokens)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Result of an invalidation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOutcome {
    /// An entry existed and is now stale
    Invalidated,
    /// No entry under that key
    Missing,
}

/// Cache of query results owned outside this crate
pub trait QueryCache: Send + Sync {
    /// Mark the entry stale and trigger its refetch policy
    fn invalidate(&self, key: &QueryKey) -> InvalidationOutcome;
}

/// Cached query result
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub stale: bool,
    pub version: u64,
}

/// Cache statistics for monitoring
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub missed_invalidations: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.hits + self.misses == 0 { 0.0 } else { self.hits as f64 / (self.hits + self.misses) as f64 }
    }
}

/// In-memory query cache
#[derive(Debug)]
pub struct InMemoryQueryCache {
    entries: DashMap<QueryKey, CacheEntry>,
    stats: Arc<RwLock<CacheStats>>,
    invalidated: broadcast::Sender<QueryKey>,
}

impl InMemoryQueryCache {
    pub fn new() -> Self {
        let (invalidated, _) = broadcast::channel(256);
        Self {
            entries: DashMap::new(),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            invalidated,
        }
    }

    /// Read an entry, stale or not
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        let entry = self.entries.get(key).map(|entry| entry.clone());
        let mut stats = self.stats.write();
        if entry.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        entry
    }

    /// Store a fresh result, clearing staleness
    pub fn set(&self, key: QueryKey, value: serde_json::Value) -> u64 {
        let mut entry = self.entries.entry(key).or_insert_with(|| CacheEntry {
            value: serde_json::Value::Null,
            stale: false,
            version: 0,
        });
        entry.value = value;
        entry.stale = false;
        entry.version += 1;
        entry.version
    }

    pub fn is_stale(&self, key: &QueryKey) -> Option<bool> {
        self.entries.get(key).map(|entry| entry.stale)
    }

    pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Receiver of every key invalidated from now on
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<QueryKey> {
        self.invalidated.subscribe()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

impl Default for InMemoryQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache for InMemoryQueryCache {
    fn invalidate(&self, key: &QueryKey) -> InvalidationOutcome {
        let found = match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.stale = true;
                true
            }
            None => false,
        };

        if !found {
            self.stats.write().missed_invalidations += 1;
            return InvalidationOutcome::Missing;
        }

        self.stats.write().invalidations += 1;
        // No receivers simply means nobody is waiting to refetch
        let _ = self.invalidated.send(key.clone());
        debug!(key = %key, "Query cache entry invalidated");
        InvalidationOutcome::Invalidated
    }
}
