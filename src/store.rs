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

//! Store abstraction and the Redis-backed implementation.
//!
//! ## Purpose
//! The coordinator only needs three things from a store: execute a cached
//! script by digest, execute a raw script body, and close the connection.
//! Everything else (membership, quorum, retries) lives above this seam.
//!
//! ## Design Decisions
//! - **Why a trait**: lets the quorum engine fan out over any mix of
//!   stores, and lets the test-suite substitute in-memory stores.
//! - **Why ConnectionManager**: automatic connection pooling and
//!   reconnection; cloned per operation.
//! - **Why a typed not-cached variant**: the invoker needs to distinguish
//!   "script not cached, retry with the full body" from a genuine fault.

use crate::error::{LockError, LockResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind};

/// One independently operable key-value endpoint participating in the
/// quorum.
///
/// Implementations must be total over their own faults: a connection or
/// script failure is returned as an error value, never a panic. The quorum
/// engine converts every error into an "against" vote.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Stable display name, used in attempt stats and log fields.
    fn name(&self) -> &str;

    /// Execute a cached script by its SHA-1 digest.
    ///
    /// Returns [`LockError::ScriptNotCached`] when the store signals that
    /// it does not have the script cached.
    async fn eval_sha(&self, hash: &str, keys: &[String], args: &[String]) -> LockResult<i64>;

    /// Execute a script from its full body, caching it on the store.
    async fn eval(&self, text: &str, keys: &[String], args: &[String]) -> LockResult<i64>;

    /// Close the connection to the store.
    async fn quit(&self) -> LockResult<()>;
}

/// Redis-backed [`ScriptStore`].
///
/// ## Invariants
/// - Resource names are used verbatim as keys.
/// - Key values are the hex lock value; TTLs are the requested duration.
#[derive(Clone)]
pub struct RedisScriptStore {
    manager: ConnectionManager,
    name: String,
}

impl RedisScriptStore {
    /// Connect to a Redis endpoint.
    ///
    /// ## Arguments
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379"),
    ///   also used as the store's display name
    ///
    /// ## Errors
    /// - [`LockError::Store`]: if the client cannot be created or the
    ///   connection fails
    pub async fn connect(url: &str) -> LockResult<Self> {
        let client = Client::open(url)
            .map_err(|e| LockError::Store(format!("failed to create redis client: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::Store(format!("failed to connect redis: {}", e)))?;

        Ok(Self {
            manager,
            name: url.to_string(),
        })
    }

    fn map_err(err: redis::RedisError) -> LockError {
        if err.kind() == ErrorKind::NoScriptError {
            LockError::ScriptNotCached(err.to_string())
        } else {
            LockError::Store(format!("Redis error: {}", err))
        }
    }

    async fn run(&self, command: &str, body: &str, keys: &[String], args: &[String]) -> LockResult<i64> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd(command);
        cmd.arg(body).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }

        cmd.query_async::<i64>(&mut conn).await.map_err(Self::map_err)
    }
}

#[async_trait]
impl ScriptStore for RedisScriptStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn eval_sha(&self, hash: &str, keys: &[String], args: &[String]) -> LockResult<i64> {
        self.run("EVALSHA", hash, keys, args).await
    }

    async fn eval(&self, text: &str, keys: &[String], args: &[String]) -> LockResult<i64> {
        self.run("EVAL", text, keys, args).await
    }

    async fn quit(&self) -> LockResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("QUIT")
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::map_err)
    }
}
