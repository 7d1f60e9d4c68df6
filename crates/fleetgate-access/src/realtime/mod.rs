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

//! Live-data channels and cache invalidation
//!
//! Consumers open channels against a change feed; each delivered row change
//! invalidates the consumer's query key before its callback runs.

pub mod cache;
pub mod events;
pub mod feed;
pub mod invalidation;
pub mod manager;

pub use cache::*;
pub use events::*;
pub use feed::*;
pub use invalidation::*;
pub use manager::*;

/// Schema used when a channel names none
pub const DEFAULT_SCHEMA: &str = "public";
