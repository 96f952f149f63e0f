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

//! Coordinator settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for the quorum execution engine and the scoped-use
/// supervisor.
///
/// Settings are frozen at coordinator construction. Every lock operation
/// accepts an optional per-call override which is layered on top without
/// mutating the coordinator's copy:
///
/// ```rust,no_run
/// # use plexlock::Settings;
/// # let manager_settings = Settings::default();
/// let overrides = Settings {
///     retry_count: 0,
///     ..manager_settings.clone()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Fraction of the requested duration subtracted (plus 2ms) from the
    /// computed deadline to tolerate store clock skew and expiry
    /// granularity.
    pub drift_factor: f64,

    /// Maximum additional attempts after the first. `-1` means unlimited.
    pub retry_count: i32,

    /// Base delay between attempts.
    pub retry_delay: Duration,

    /// Symmetric uniform noise added to `retry_delay`, in the range
    /// `±retry_jitter`.
    pub retry_jitter: Duration,

    /// Remaining-time threshold at which a scoped-use lock is pre-emptively
    /// extended.
    pub automatic_extension_threshold: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            drift_factor: 0.01,
            retry_count: 10,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(100),
            automatic_extension_threshold: Duration::from_millis(500),
        }
    }
}

impl Settings {
    /// Total attempt budget, or `None` when retries are unlimited.
    pub(crate) fn max_attempts(&self) -> Option<usize> {
        if self.retry_count < 0 {
            None
        } else {
            Some(self.retry_count as usize + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.drift_factor, 0.01);
        assert_eq!(settings.retry_count, 10);
        assert_eq!(settings.retry_delay, Duration::from_millis(200));
        assert_eq!(settings.retry_jitter, Duration::from_millis(100));
        assert_eq!(
            settings.automatic_extension_threshold,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(Settings::default().max_attempts(), Some(11));

        let one_shot = Settings {
            retry_count: 0,
            ..Settings::default()
        };
        assert_eq!(one_shot.max_attempts(), Some(1));

        let unlimited = Settings {
            retry_count: -1,
            ..Settings::default()
        };
        assert_eq!(unlimited.max_attempts(), None);
    }
}
