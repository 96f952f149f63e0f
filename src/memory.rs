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

//! In-memory store implementation (for testing).
//!
//! Reproduces the behaviour of the three default scripts over a process-
//! local map, including the script cache handshake: a script must be sent
//! in full (`eval`) once before its digest is accepted (`eval_sha`).
//!
//! ## Limitations
//! - Only the default scripts are understood; rewritten scripts are
//!   rejected.
//! - No TTL cleanup task (expired entries are dropped on access).

use crate::error::{LockError, LockResult};
use crate::scripts::{ScriptSet, ACQUIRE_SOURCE, EXTEND_SOURCE, RELEASE_SOURCE};
use crate::store::ScriptStore;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
enum ScriptKind {
    Acquire,
    Extend,
    Release,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// `None` means no expiry (seeded foreign values).
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > Instant::now())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
    script_cache: HashSet<String>,
    fail_with: Option<String>,
}

/// In-memory [`ScriptStore`] (for testing).
#[derive(Clone)]
pub struct MemoryScriptStore {
    name: String,
    scripts: ScriptSet,
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryScriptStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: ScriptSet::default(),
            state: Arc::new(RwLock::new(MemoryState::default())),
        }
    }

    /// Make every subsequent operation fail with the given message,
    /// simulating an unreachable store. Pass `None` to heal.
    pub async fn set_failure(&self, error: Option<&str>) {
        self.state.write().await.fail_with = error.map(|e| e.to_string());
    }

    /// Current live value of a key, if any.
    pub async fn value_of(&self, key: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .entries
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone())
    }

    /// Remaining TTL of a live key. `Some(None)` means the key exists
    /// without an expiry.
    pub async fn ttl_of(&self, key: &str) -> Option<Option<Duration>> {
        let state = self.state.read().await;
        let entry = state.entries.get(key).filter(|entry| entry.is_live())?;
        Some(
            entry
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now())),
        )
    }

    /// Pre-populate a key, bypassing the scripts. `ttl = None` stores the
    /// value without an expiry.
    pub async fn seed(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut state = self.state.write().await;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn kind_for_hash(&self, hash: &str) -> LockResult<ScriptKind> {
        if hash == self.scripts.acquire.hash() {
            Ok(ScriptKind::Acquire)
        } else if hash == self.scripts.extend.hash() {
            Ok(ScriptKind::Extend)
        } else if hash == self.scripts.release.hash() {
            Ok(ScriptKind::Release)
        } else {
            Err(LockError::Store(format!("unknown script digest: {}", hash)))
        }
    }

    fn kind_for_text(text: &str) -> LockResult<ScriptKind> {
        if text == ACQUIRE_SOURCE {
            Ok(ScriptKind::Acquire)
        } else if text == EXTEND_SOURCE {
            Ok(ScriptKind::Extend)
        } else if text == RELEASE_SOURCE {
            Ok(ScriptKind::Release)
        } else {
            Err(LockError::Store("unknown script body".to_string()))
        }
    }

    fn run(
        state: &mut MemoryState,
        kind: ScriptKind,
        keys: &[String],
        args: &[String],
    ) -> LockResult<i64> {
        let value = args
            .first()
            .ok_or_else(|| LockError::Store("missing lock value argument".to_string()))?;

        match kind {
            ScriptKind::Acquire => {
                let expiry = Self::expiry_arg(args)?;
                if keys.iter().any(|key| {
                    state
                        .entries
                        .get(key)
                        .map_or(false, |entry| entry.is_live())
                }) {
                    return Ok(0);
                }
                for key in keys {
                    state.entries.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            expires_at: Some(expiry),
                        },
                    );
                }
                Ok(keys.len() as i64)
            }
            ScriptKind::Extend => {
                let expiry = Self::expiry_arg(args)?;
                let all_held = keys.iter().all(|key| {
                    state
                        .entries
                        .get(key)
                        .filter(|entry| entry.is_live())
                        .map_or(false, |entry| entry.value == *value)
                });
                if !all_held {
                    return Ok(0);
                }
                for key in keys {
                    state.entries.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            expires_at: Some(expiry),
                        },
                    );
                }
                Ok(keys.len() as i64)
            }
            ScriptKind::Release => {
                let mut count = 0;
                for key in keys {
                    let held = state
                        .entries
                        .get(key)
                        .filter(|entry| entry.is_live())
                        .map_or(false, |entry| entry.value == *value);
                    if held {
                        state.entries.remove(key);
                        count += 1;
                    }
                }
                Ok(count)
            }
        }
    }

    fn expiry_arg(args: &[String]) -> LockResult<Instant> {
        let ms = args
            .get(1)
            .and_then(|raw| raw.parse::<u64>().ok())
            .ok_or_else(|| LockError::Store("missing or invalid duration argument".to_string()))?;
        Ok(Instant::now() + Duration::from_millis(ms))
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn eval_sha(&self, hash: &str, keys: &[String], args: &[String]) -> LockResult<i64> {
        let mut state = self.state.write().await;
        if let Some(message) = &state.fail_with {
            return Err(LockError::Store(message.clone()));
        }
        if !state.script_cache.contains(hash) {
            return Err(LockError::ScriptNotCached(format!(
                "NOSCRIPT No matching script: {}",
                hash
            )));
        }
        let kind = self.kind_for_hash(hash)?;
        Self::run(&mut state, kind, keys, args)
    }

    async fn eval(&self, text: &str, keys: &[String], args: &[String]) -> LockResult<i64> {
        let mut state = self.state.write().await;
        if let Some(message) = &state.fail_with {
            return Err(LockError::Store(message.clone()));
        }
        let kind = Self::kind_for_text(text)?;
        state
            .script_cache
            .insert(crate::scripts::Script::new(text).hash().to_string());
        Self::run(&mut state, kind, keys, args)
    }

    async fn quit(&self) -> LockResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn args(value: &str, duration_ms: u64) -> Vec<String> {
        vec![value.to_string(), duration_ms.to_string()]
    }

    #[tokio::test]
    async fn test_script_cache_handshake() {
        let store = MemoryScriptStore::new("mem-1");
        let scripts = ScriptSet::default();

        let miss = store
            .eval_sha(scripts.acquire.hash(), &keys(&["a"]), &args("v1", 10_000))
            .await;
        assert!(matches!(miss, Err(LockError::ScriptNotCached(_))));

        let set = store
            .eval(scripts.acquire.text(), &keys(&["a"]), &args("v1", 10_000))
            .await
            .unwrap();
        assert_eq!(set, 1);

        // Each script digest is accepted only once its full body has been
        // seen.
        let release_args = vec!["v1".to_string()];
        let cached = store
            .eval_sha(scripts.release.hash(), &keys(&["a"]), &release_args)
            .await;
        assert!(matches!(cached, Err(LockError::ScriptNotCached(_))));
        let released = store
            .eval(scripts.release.text(), &keys(&["a"]), &release_args)
            .await
            .unwrap();
        assert_eq!(released, 1);
    }

    #[tokio::test]
    async fn test_acquire_refuses_held_key() {
        let store = MemoryScriptStore::new("mem-1");
        let scripts = ScriptSet::default();

        let first = store
            .eval(scripts.acquire.text(), &keys(&["a", "b"]), &args("v1", 10_000))
            .await
            .unwrap();
        assert_eq!(first, 2);

        // Any overlap refuses the whole request without mutating anything.
        let second = store
            .eval(scripts.acquire.text(), &keys(&["b", "c"]), &args("v2", 10_000))
            .await
            .unwrap();
        assert_eq!(second, 0);
        assert_eq!(store.value_of("b").await, Some("v1".to_string()));
        assert_eq!(store.value_of("c").await, None);
    }

    #[tokio::test]
    async fn test_extend_requires_matching_value() {
        let store = MemoryScriptStore::new("mem-1");
        let scripts = ScriptSet::default();

        store
            .eval(scripts.acquire.text(), &keys(&["a"]), &args("v1", 10_000))
            .await
            .unwrap();

        let wrong = store
            .eval(scripts.extend.text(), &keys(&["a"]), &args("v2", 30_000))
            .await
            .unwrap();
        assert_eq!(wrong, 0);
        assert_eq!(store.value_of("a").await, Some("v1".to_string()));

        let right = store
            .eval(scripts.extend.text(), &keys(&["a"]), &args("v1", 30_000))
            .await
            .unwrap();
        assert_eq!(right, 1);
        let ttl = store.ttl_of("a").await.unwrap().unwrap();
        assert!(ttl > Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn test_release_only_removes_own_value() {
        let store = MemoryScriptStore::new("mem-1");
        let scripts = ScriptSet::default();

        store.seed("a", "foreign", None).await;
        let release_args = vec!["v1".to_string()];
        let removed = store
            .eval(scripts.release.text(), &keys(&["a"]), &release_args)
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.value_of("a").await, Some("foreign".to_string()));
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped_on_access() {
        let store = MemoryScriptStore::new("mem-1");
        let scripts = ScriptSet::default();

        store
            .eval(scripts.acquire.text(), &keys(&["a"]), &args("v1", 30))
            .await
            .unwrap();
        sleep(Duration::from_millis(60)).await;

        assert_eq!(store.value_of("a").await, None);
        // The key is free again for a different holder.
        let reacquired = store
            .eval(scripts.acquire.text(), &keys(&["a"]), &args("v2", 10_000))
            .await
            .unwrap();
        assert_eq!(reacquired, 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryScriptStore::new("mem-1");
        let scripts = ScriptSet::default();

        store.set_failure(Some("connection closed")).await;
        let result = store
            .eval(scripts.acquire.text(), &keys(&["a"]), &args("v1", 10_000))
            .await;
        assert!(matches!(result, Err(LockError::Store(message)) if message == "connection closed"));

        store.set_failure(None).await;
        let healed = store
            .eval(scripts.acquire.text(), &keys(&["a"]), &args("v1", 10_000))
            .await
            .unwrap();
        assert_eq!(healed, 1);
    }
}
