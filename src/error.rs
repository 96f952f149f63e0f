// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexLock.
//
// PlexLock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexLock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexLock. If not, see <https://www.gnu.org/licenses/>.

//! Error types for quorum lock operations.

use thiserror::Error;

use crate::quorum::StatsHandle;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
///
/// Store faults are wrapped as strings so that per-attempt stats (which map
/// stores to the error behind their "against" vote) stay cloneable.
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// One or more of the requested keys were already held by another value.
    #[error("The operation was applied to: {applied} of the {requested} requested resources.")]
    ResourceLocked { applied: i64, requested: usize },

    /// A quorum of stores could not be convinced within the retry budget.
    /// Carries the stats handle of every attempt made.
    #[error("The operation was unable to achieve a quorum during its retry window.")]
    QuorumFailed { attempts: Vec<StatsHandle> },

    /// Lock durations must be a whole number of milliseconds.
    #[error("Duration must be an integer value in milliseconds.")]
    InvalidDuration,

    /// Extension was requested on a handle whose deadline has already passed.
    #[error("Cannot extend an already-expired lock.")]
    AlreadyExpired,

    /// A coordinator cannot be built over an empty store set.
    #[error("At least one store is required.")]
    EmptyMembership,

    /// `automatic_extension_threshold` leaves no room to extend before expiry.
    #[error("The automatic extension threshold must be at least 100ms below the lock duration.")]
    ExtensionThresholdTooLarge,

    /// The store does not have the script cached; retry with the full body.
    #[error("Script not cached: {0}")]
    ScriptNotCached(String),

    /// Backend error (connection closed, script failure, unexpected reply).
    #[error("Store error: {0}")]
    Store(String),
}
