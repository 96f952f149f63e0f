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

//! The lock handle.

use crate::error::LockResult;
use crate::manager::RedLock;
use crate::quorum::{ExecutionResult, StatsHandle};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Exclusive, time-bounded ownership of a set of resources.
///
/// A handle is *live* while its deadline lies in the future and *dead*
/// after release or timeout. The `value` is the 128-bit random token that
/// every participating store holds under the resource keys; it is unique
/// per acquire with overwhelming probability and reused on extend.
///
/// Ownership is only guaranteed until [`Lock::expiration`]; long-running
/// work should go through [`RedLock::using`], which keeps the lock
/// extended.
pub struct Lock {
    pub(crate) manager: RedLock,
    pub(crate) resources: Vec<String>,
    pub(crate) value: String,
    pub(crate) expiration: Option<Instant>,
    pub(crate) attempts: Vec<StatsHandle>,
}

impl Lock {
    pub(crate) fn new(
        manager: RedLock,
        resources: Vec<String>,
        value: String,
        expiration: Instant,
        attempts: Vec<StatsHandle>,
    ) -> Self {
        Self {
            manager,
            resources,
            value,
            expiration: Some(expiration),
            attempts,
        }
    }

    /// The ordered resource names this lock covers.
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// The opaque random value held under every resource key.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Monotonic deadline past which ownership is no longer guaranteed.
    /// `None` once the lock has been released or superseded.
    pub fn expiration(&self) -> Option<Instant> {
        self.expiration
    }

    /// Stats handles of the attempts made by the call that produced (or
    /// last extended) this handle.
    pub fn attempts(&self) -> &[StatsHandle] {
        &self.attempts
    }

    pub fn is_expired(&self) -> bool {
        self.expiration.map_or(true, |at| at <= Instant::now())
    }

    /// Extend ownership by `duration` from now, reusing the lock value.
    ///
    /// On success the handle's deadline and attempt stats are superseded in
    /// place. Fails with [`crate::LockError::AlreadyExpired`] when the
    /// deadline has already passed.
    pub async fn extend(&mut self, duration: Duration) -> LockResult<()> {
        let manager = self.manager.clone();
        manager.extend(self, duration, None).await
    }

    /// Release the lock on a quorum of stores, consuming the handle.
    ///
    /// A quorum failure may be ignored by the caller: the remaining keys
    /// expire on their own once the TTL lapses.
    pub async fn release(self) -> LockResult<ExecutionResult> {
        let manager = self.manager.clone();
        manager.release(self, None).await
    }

    /// Drop the deadline, marking the handle dead.
    pub(crate) fn invalidate(&mut self) {
        self.expiration = None;
    }

    /// Replace the deadline and attempt stats after a successful extend.
    pub(crate) fn supersede(&mut self, expiration: Instant, attempts: Vec<StatsHandle>) {
        self.expiration = Some(expiration);
        self.attempts = attempts;
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("resources", &self.resources)
            .field("value", &self.value)
            .field("expiration", &self.expiration)
            .field("attempts", &self.attempts.len())
            .finish()
    }
}
