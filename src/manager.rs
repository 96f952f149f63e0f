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

//! The quorum lock coordinator.
//!
//! ## Purpose
//! Coordinates exclusive, time-bounded ownership of named resources across
//! an odd-numbered set of independent stores, following the Redlock
//! algorithm: an operation succeeds when a majority of stores grants it.
//!
//! ## Architecture Context
//! The coordinator owns the retry driver and the lock lifecycle. Each
//! operation fans out through the quorum engine ([`crate::quorum`]) to the
//! stores supplied at construction; results come back as a [`Lock`] handle
//! or a typed error carrying per-attempt stats.
//!
//! ## Design Decisions
//! - **Majority quorum**: correctness derives from `floor(N/2)+1` grants;
//!   the stores are never coordinated with each other.
//! - **Drift-corrected deadlines**: the deadline handed to callers is
//!   shortened by `drift_factor * duration + 2ms` so that store clock skew
//!   and expiry granularity cannot make the handle outlive the keys.
//! - **Defensive cleanup**: a failed acquire may still hold a minority of
//!   stores, so the value is best-effort released before the error
//!   surfaces.

use crate::error::{LockError, LockResult};
use crate::lock::Lock;
use crate::quorum::{self, ExecutionResult, Vote};
use crate::scripts::{Script, ScriptRewrites, ScriptSet};
use crate::settings::Settings;
use crate::store::ScriptStore;
use crate::supervisor::{extension_loop, AbortSignal};
use futures::FutureExt;
use rand::{Rng, RngCore};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the non-fatal error channel; slow subscribers lag rather
/// than block the quorum engine.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Distributed mutual-exclusion coordinator over a set of independent
/// stores.
///
/// Cheap to clone; clones share the store connections and the error
/// channel. Unrelated operations on one coordinator run concurrently.
///
/// ## Example
/// ```rust,no_run
/// use plexlock::{MemoryScriptStore, RedLock, ScriptStore};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> plexlock::LockResult<()> {
/// let stores: Vec<Arc<dyn ScriptStore>> = (0..3)
///     .map(|i| Arc::new(MemoryScriptStore::new(format!("store-{}", i))) as _)
///     .collect();
/// let manager = RedLock::new(stores)?;
///
/// let mut lock = manager
///     .acquire(&["orders:1".to_string()], Duration::from_secs(10), None)
///     .await?;
/// lock.extend(Duration::from_secs(30)).await?;
/// lock.release().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedLock {
    stores: Arc<Vec<Arc<dyn ScriptStore>>>,
    settings: Settings,
    scripts: Arc<ScriptSet>,
    errors: broadcast::Sender<LockError>,
    // Held so the channel always has a subscriber and publishing a
    // non-fatal error can never itself fail.
    _noop_subscriber: Arc<broadcast::Receiver<LockError>>,
}

impl RedLock {
    /// Build a coordinator with default settings and scripts.
    ///
    /// ## Errors
    /// - [`LockError::EmptyMembership`]: `stores` is empty
    pub fn new(stores: Vec<Arc<dyn ScriptStore>>) -> LockResult<Self> {
        Self::with_scripts(stores, Settings::default(), ScriptRewrites::default())
    }

    pub fn with_settings(stores: Vec<Arc<dyn ScriptStore>>, settings: Settings) -> LockResult<Self> {
        Self::with_scripts(stores, settings, ScriptRewrites::default())
    }

    /// Build a coordinator, rewriting the default scripts once.
    pub fn with_scripts(
        stores: Vec<Arc<dyn ScriptStore>>,
        settings: Settings,
        rewrites: ScriptRewrites,
    ) -> LockResult<Self> {
        if stores.is_empty() {
            return Err(LockError::EmptyMembership);
        }
        let (errors, noop_subscriber) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        Ok(Self {
            stores: Arc::new(stores),
            settings,
            scripts: Arc::new(ScriptSet::new(rewrites)),
            errors,
            _noop_subscriber: Arc::new(noop_subscriber),
        })
    }

    /// The coordinator's frozen settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to the non-fatal error channel.
    ///
    /// Every per-store "against" vote (contention or fault) is fanned out
    /// here; none of them terminates the call that produced it.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<LockError> {
        self.errors.subscribe()
    }

    /// Acquire an exclusive lock on `resources` for `duration`.
    ///
    /// ## Behavior
    /// - Generates a fresh 128-bit random value and asks every store to
    ///   bind each resource key to it.
    /// - Retries per the retry settings until a majority grants.
    /// - On failure, best-effort releases whatever minority of stores the
    ///   value may still hold before surfacing the error.
    ///
    /// ## Errors
    /// - [`LockError::InvalidDuration`]: `duration` is not a whole number
    ///   of milliseconds
    /// - [`LockError::QuorumFailed`]: the retry budget was exhausted
    pub async fn acquire(
        &self,
        resources: &[String],
        duration: Duration,
        settings: Option<&Settings>,
    ) -> LockResult<Lock> {
        let settings = settings.unwrap_or(&self.settings);
        let duration_ms = whole_milliseconds(duration)?;
        let value = random_value();
        let start = Instant::now();

        debug!(
            resources = resources.len(),
            duration_ms, "acquiring lock"
        );
        let outcome = self
            .execute(
                &self.scripts.acquire,
                resources,
                &[value.clone(), duration_ms.to_string()],
                settings,
            )
            .await;

        match outcome {
            Ok(execution) => {
                let expiration = start + duration - drift(settings, duration_ms);
                Ok(Lock::new(
                    self.clone(),
                    resources.to_vec(),
                    value,
                    expiration,
                    execution.attempts,
                ))
            }
            Err(error) => {
                // The value may still hold a minority of stores; release it
                // best-effort before surfacing the acquire failure.
                let cleanup = Settings {
                    retry_count: 0,
                    ..settings.clone()
                };
                if let Err(cleanup_error) = self.release_value(resources, &value, &cleanup).await {
                    debug!(
                        error = %cleanup_error,
                        "cleanup of partial acquisition failed; keys expire with their TTL"
                    );
                }
                Err(error)
            }
        }
    }

    /// Extend `lock` by `duration` from now, reusing its value.
    ///
    /// On success the handle's deadline and attempt stats are superseded
    /// in place, so a stale deadline can never be observed.
    pub async fn extend(
        &self,
        lock: &mut Lock,
        duration: Duration,
        settings: Option<&Settings>,
    ) -> LockResult<()> {
        let settings = settings.unwrap_or(&self.settings);
        let duration_ms = whole_milliseconds(duration)?;
        let start = Instant::now();

        if lock.is_expired() {
            return Err(LockError::AlreadyExpired);
        }

        debug!(
            resources = lock.resources.len(),
            duration_ms, "extending lock"
        );
        let execution = self
            .execute(
                &self.scripts.extend,
                &lock.resources,
                &[lock.value.clone(), duration_ms.to_string()],
                settings,
            )
            .await?;

        lock.supersede(start + duration - drift(settings, duration_ms), execution.attempts);
        Ok(())
    }

    /// Release `lock` on a quorum of stores, consuming the handle.
    ///
    /// The handle is invalidated up front, regardless of the quorum
    /// outcome. A [`LockError::QuorumFailed`] may be ignored by the
    /// caller: unreleased keys expire with their TTL.
    pub async fn release(
        &self,
        mut lock: Lock,
        settings: Option<&Settings>,
    ) -> LockResult<ExecutionResult> {
        let settings = settings.unwrap_or(&self.settings);
        lock.invalidate();

        debug!(resources = lock.resources.len(), "releasing lock");
        self.release_value(&lock.resources, &lock.value, settings).await
    }

    /// Run `routine` under an auto-extended lock on `resources`.
    ///
    /// ## Behavior
    /// The lock is acquired for `duration` and re-extended whenever its
    /// remaining time shrinks to `automatic_extension_threshold`, so a
    /// routine that outlives `duration` keeps ownership. If extension
    /// fails after the lock has expired, the abort signal trips with the
    /// underlying error; observing it is the routine's responsibility. The
    /// lock is released on every exit path, including a panicking routine.
    ///
    /// ## Errors
    /// - [`LockError::ExtensionThresholdTooLarge`]: the threshold leaves
    ///   less than 100ms of usable lock time
    /// - Acquire and release failures propagate; a release failure is
    ///   dropped when the routine itself panicked
    pub async fn using<T, F, Fut>(
        &self,
        resources: &[String],
        duration: Duration,
        settings: Option<&Settings>,
        routine: F,
    ) -> LockResult<T>
    where
        F: FnOnce(AbortSignal) -> Fut,
        Fut: Future<Output = T>,
    {
        let settings = settings.cloned().unwrap_or_else(|| self.settings.clone());
        whole_milliseconds(duration)?;
        if settings.automatic_extension_threshold + Duration::from_millis(100) > duration {
            return Err(LockError::ExtensionThresholdTooLarge);
        }

        let lock = self.acquire(resources, duration, Some(&settings)).await?;
        let signal = AbortSignal::new();
        let shared = Arc::new(Mutex::new(Some(lock)));
        let stop = CancellationToken::new();
        let extender = tokio::spawn(extension_loop(
            self.clone(),
            Arc::clone(&shared),
            duration,
            settings.clone(),
            signal.clone(),
            stop.clone(),
        ));

        let outcome = AssertUnwindSafe(routine(signal)).catch_unwind().await;

        // Finishing: cancel the pending timer and wait out any in-flight
        // extension; its error (if any) already reached the abort signal.
        stop.cancel();
        if let Err(join_error) = extender.await {
            if join_error.is_panic() {
                std::panic::resume_unwind(join_error.into_panic());
            }
        }

        let lock = shared.lock().await.take();
        let released = match lock {
            Some(lock) => self.release(lock, Some(&settings)).await.map(|_| ()),
            None => Ok(()),
        };

        match outcome {
            Ok(value) => {
                released?;
                Ok(value)
            }
            // The routine's own failure wins over any release failure.
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Close the connection to every store.
    pub async fn quit(&self) -> LockResult<()> {
        let mut first_error = None;
        for store in self.stores.iter() {
            if let Err(error) = store.quit().await {
                warn!(store = %store.name(), error = %error, "failed to close store connection");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Retry driver: loop single attempts until a "for" quorum or the
    /// budget is exhausted, accumulating every attempt's stats handle.
    async fn execute(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
        settings: &Settings,
    ) -> LockResult<ExecutionResult> {
        let mut attempts = Vec::new();

        loop {
            let attempt = quorum::run_attempt(&self.stores, script, keys, args, &self.errors).await;
            attempts.push(attempt.stats.clone());

            if attempt.vote == Vote::For {
                debug!(attempt = attempts.len(), "quorum reached");
                return Ok(ExecutionResult { attempts });
            }

            if let Some(max_attempts) = settings.max_attempts() {
                if attempts.len() >= max_attempts {
                    debug!(attempts = attempts.len(), "retry budget exhausted");
                    return Err(LockError::QuorumFailed { attempts });
                }
            }

            let delay = jittered_delay(settings);
            debug!(
                attempt = attempts.len(),
                delay_ms = delay.as_millis() as u64,
                "attempt failed, backing off"
            );
            sleep(delay).await;
        }
    }

    async fn release_value(
        &self,
        resources: &[String],
        value: &str,
        settings: &Settings,
    ) -> LockResult<ExecutionResult> {
        self.execute(
            &self.scripts.release,
            resources,
            &[value.to_string()],
            settings,
        )
        .await
    }
}

/// 128 bits of entropy, hex-encoded.
fn random_value() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Durations cross the wire as integer milliseconds; anything finer would
/// silently truncate, so reject it.
fn whole_milliseconds(duration: Duration) -> LockResult<u64> {
    if duration.subsec_nanos() % 1_000_000 != 0 {
        return Err(LockError::InvalidDuration);
    }
    u64::try_from(duration.as_millis()).map_err(|_| LockError::InvalidDuration)
}

/// Deadline adjustment for store clock skew plus expiry granularity.
fn drift(settings: &Settings, duration_ms: u64) -> Duration {
    Duration::from_millis((settings.drift_factor * duration_ms as f64).round() as u64 + 2)
}

/// `retry_delay` with uniform noise in `±retry_jitter`, clamped at zero.
fn jittered_delay(settings: &Settings) -> Duration {
    let base = settings.retry_delay.as_millis() as i64;
    let jitter = settings.retry_jitter.as_millis() as i64;
    let noise = if jitter == 0 {
        0
    } else {
        rand::thread_rng().gen_range(-jitter..=jitter)
    };
    Duration::from_millis((base + noise).max(0) as u64)
}
