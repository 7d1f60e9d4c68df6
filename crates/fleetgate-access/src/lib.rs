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

//! Fleetgate access core
//!
//! Role resolution, the role × module permission matrix, route guards for
//! the operations dashboard, and live-data channels that keep cached queries
//! fresh as the backend emits row changes.

pub mod config;
pub mod error;
pub mod identity;
pub mod rbac;
pub mod realtime;

pub use config::Config;
pub use error::{AccessError, AccessResult};
