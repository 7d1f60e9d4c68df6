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

//! Change events and the channels that select them

use crate::error::{AccessError, AccessResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of row change emitted by the backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(EventKind::Insert),
            "UPDATE" => Some(EventKind::Update),
            "DELETE" => Some(EventKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event kinds a channel listens to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum EventFilter {
    #[default]
    #[serde(rename = "*")]
    Any,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl EventFilter {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Insert => kind == EventKind::Insert,
            EventFilter::Update => kind == EventKind::Update,
            EventFilter::Delete => kind == EventKind::Delete,
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Insert => EventFilter::Insert,
            EventKind::Update => EventFilter::Update,
            EventKind::Delete => EventFilter::Delete,
        }
    }
}

/// Row change delivered on a channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    /// Table or resource name
    pub resource: String,

    /// Schema the resource lives in
    pub schema: String,

    /// Change kind
    pub kind: EventKind,

    /// New row image, `Null` for deletes
    pub payload: serde_json::Value,

    /// Previous row image when the backend sends one
    pub old: Option<serde_json::Value>,

    /// Commit time reported by the backend
    pub commit_timestamp: Option<DateTime<Utc>>,
}

/// Raw change payload as sent by the change-feed backend
#[derive(Debug, Deserialize)]
struct RawChange {
    #[serde(rename = "eventType")]
    event_type: String,
    table: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    new: Option<serde_json::Value>,
    #[serde(default)]
    old: Option<serde_json::Value>,
    #[serde(default)]
    commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn new(resource: impl Into<String>, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            resource: resource.into(),
            schema: super::DEFAULT_SCHEMA.to_string(),
            kind,
            payload,
            old: None,
            commit_timestamp: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_old(mut self, old: serde_json::Value) -> Self {
        self.old = Some(old);
        self
    }

    /// Decode a backend payload, filling a missing schema with `public`.
    ///
    /// Rejects payloads with an unknown event type or an empty table name.
    pub fn decode(raw: &serde_json::Value) -> AccessResult<Self> {
        Self::decode_with_default(raw, super::DEFAULT_SCHEMA)
    }

    /// Decode a backend payload, filling a missing schema with `default_schema`
    pub fn decode_with_default(raw: &serde_json::Value, default_schema: &str) -> AccessResult<Self> {
        let change = RawChange::deserialize(raw).map_err(|e| AccessError::MalformedEvent { message: e.to_string() })?;

        let kind = EventKind::parse(&change.event_type).ok_or_else(|| AccessError::MalformedEvent {
            message: format!("unknown event type '{}'", change.event_type),
        })?;

        if change.table.is_empty() {
            return Err(AccessError::MalformedEvent {
                message: "empty table name".to_string(),
            });
        }

        Ok(Self {
            resource: change.table,
            schema: change.schema.unwrap_or_else(|| default_schema.to_string()),
            kind,
            payload: change.new.unwrap_or(serde_json::Value::Null),
            old: change.old,
            commit_timestamp: change.commit_timestamp,
        })
    }
}

/// What a feed subscription listens to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChannelSpec {
    pub resource: String,
    pub schema: String,
    pub filter: EventFilter,
}

impl ChannelSpec {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            schema: super::DEFAULT_SCHEMA.to_string(),
            filter: EventFilter::Any,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.resource == event.resource && self.schema == event.schema && self.filter.matches(event.kind)
    }
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let filter = match self.filter {
            EventFilter::Any => "*",
            EventFilter::Insert => "INSERT",
            EventFilter::Update => "UPDATE",
            EventFilter::Delete => "DELETE",
        };
        write!(f, "{}.{}:{}", self.schema, self.resource, filter)
    }
}
