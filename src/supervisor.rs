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

//! Scoped-use supervision: the abort signal and the auto-extension task.
//!
//! The extension task moves through a small state machine:
//! *Acquired* (sleep until the remaining window shrinks to the threshold)
//! → *Extending* (extend; success returns to *Acquired*; failure with the
//! handle still live retries immediately) → *Aborted* (the handle expired
//! mid-extension; trip the signal and stop). The routine is never cancelled
//! from outside; it observes the signal at its own suspension points.

use crate::error::LockError;
use crate::lock::Lock;
use crate::manager::RedLock;
use crate::settings::Settings;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cooperative abort signal handed to a scoped-use routine.
///
/// Trips when the supervising lock could not be extended past its expiry;
/// checking it is the routine's responsibility.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
    error: Arc<OnceLock<LockError>>,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            error: Arc::new(OnceLock::new()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The error that tripped the signal, once aborted.
    pub fn error(&self) -> Option<&LockError> {
        self.error.get()
    }

    /// Wait until the signal trips. Never resolves on a healthy lock.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn abort(&self, error: LockError) {
        // Publish the error before tripping the token so an observer woken
        // by `aborted()` always sees it.
        let _ = self.error.set(error);
        self.token.cancel();
    }
}

/// Keep the shared lock extended until the routine finishes or the lock is
/// lost.
pub(crate) async fn extension_loop(
    manager: RedLock,
    shared: Arc<Mutex<Option<Lock>>>,
    duration: Duration,
    settings: Settings,
    signal: AbortSignal,
    stop: CancellationToken,
) {
    loop {
        // Acquired: sleep until the remaining window shrinks to the
        // extension threshold.
        let delay = {
            let guard = shared.lock().await;
            let Some(lock) = guard.as_ref() else { return };
            let Some(expiration) = lock.expiration() else { return };
            expiration
                .saturating_duration_since(Instant::now())
                .saturating_sub(settings.automatic_extension_threshold)
        };

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = sleep(delay) => {}
        }

        // Extending: keep trying while the handle is still live.
        loop {
            if stop.is_cancelled() {
                return;
            }
            let mut guard = shared.lock().await;
            let Some(lock) = guard.as_mut() else { return };

            match manager.extend(lock, duration, Some(&settings)).await {
                Ok(()) => {
                    debug!(
                        resources = lock.resources().len(),
                        "lock extended, rescheduling"
                    );
                    break;
                }
                Err(error) => {
                    if lock.is_expired() {
                        warn!(error = %error, "lock expired during extension, aborting routine");
                        signal.abort(error);
                        return;
                    }
                    warn!(error = %error, "extension failed with lock still live, retrying");
                }
            }
        }
    }
}
