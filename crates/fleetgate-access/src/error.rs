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

//! Error types for the access and live-data core
//!
//! Most failures never reach callers: resolution errors degrade to the
//! no-role state and a denied permission is a guard decision. The variants
//! below are what the collaborator traits and configuration loaders return.

use thiserror::Error;

/// Errors raised by collaborators and configuration loading
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("Identity unavailable: {message}")]
    IdentityUnavailable { message: String },

    #[error("Role lookup failed: {message}")]
    RoleLookup { message: String },

    #[error("Unknown role: {value}")]
    UnknownRole { value: String },

    #[error("Unknown module: {value}")]
    UnknownModule { value: String },

    #[error("Invalid policy: {message}")]
    InvalidPolicy { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Subscription failed for '{resource}': {message}")]
    Subscription { resource: String, message: String },

    #[error("Channel dropped for '{resource}'")]
    ChannelDropped { resource: String },

    #[error("Malformed change event: {message}")]
    MalformedEvent { message: String },

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AccessError {
    /// Short identifier used in log fields and metric labels
    pub fn error_type(&self) -> &'static str {
        match self {
            AccessError::IdentityUnavailable { .. } => "identity_unavailable",
            AccessError::RoleLookup { .. } => "role_lookup",
            AccessError::UnknownRole { .. } => "unknown_role",
            AccessError::UnknownModule { .. } => "unknown_module",
            AccessError::InvalidPolicy { .. } => "invalid_policy",
            AccessError::InvalidConfig { .. } => "invalid_config",
            AccessError::Subscription { .. } => "subscription",
            AccessError::ChannelDropped { .. } => "channel_dropped",
            AccessError::MalformedEvent { .. } => "malformed_event",
            AccessError::TomlError(_) => "toml_error",
            AccessError::IoError(_) => "io_error",
        }
    }

    /// Whether this error came from identity or role resolution
    pub fn is_resolution_error(&self) -> bool {
        matches!(self, AccessError::IdentityUnavailable { .. } | AccessError::RoleLookup { .. } | AccessError::UnknownRole { .. })
    }
}

/// Result type for access core operations
pub type AccessResult<T> = Result<T, AccessError>;
