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

//! Server-side scripts and their digests.
//!
//! The three scripts are the only store-side behaviour the coordinator
//! relies on. Each runs atomically on a single store, receives the lock
//! keys as `KEYS`, the lock value as `ARGV[1]`, and (for acquire and
//! extend) the duration in milliseconds as `ARGV[2]`.

use sha1::{Digest, Sha1};
use std::fmt;

/// Sets every key to the lock value with a millisecond expiry, unless any
/// key already exists with any value. Returns the number of keys set, or 0
/// without mutating anything.
pub(crate) const ACQUIRE_SOURCE: &str = r#"
for _, key in ipairs(KEYS) do
  if redis.call("exists", key) == 1 then
    return 0
  end
end
for _, key in ipairs(KEYS) do
  redis.call("set", key, ARGV[1], "PX", ARGV[2])
end
return #KEYS
"#;

/// Resets every key's expiry, preserving the value, unless any key's
/// current value differs from the lock value. Returns the number of keys
/// updated, or 0 without mutating anything.
pub(crate) const EXTEND_SOURCE: &str = r#"
for _, key in ipairs(KEYS) do
  if redis.call("get", key) ~= ARGV[1] then
    return 0
  end
end
for _, key in ipairs(KEYS) do
  redis.call("set", key, ARGV[1], "PX", ARGV[2])
end
return #KEYS
"#;

/// Deletes every key whose value equals the lock value. Returns the number
/// of keys deleted.
pub(crate) const RELEASE_SOURCE: &str = r#"
local count = 0
for _, key in ipairs(KEYS) do
  if redis.call("get", key) == ARGV[1] then
    redis.call("del", key)
    count = count + 1
  end
end
return count
"#;

/// A server-side script paired with its SHA-1 digest.
///
/// The digest is what the hot path sends (`EVALSHA`); the full text is the
/// fallback when a store has not cached the script yet.
#[derive(Debug, Clone)]
pub struct Script {
    text: String,
    hash: String,
}

impl Script {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let hash = hex::encode(Sha1::digest(text.as_bytes()));
        Self { text, hash }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Lowercase hex SHA-1 digest of the script body.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Rewrite hook for one script, consumed once at coordinator construction.
type Rewrite = Box<dyn FnOnce(String) -> String + Send>;

/// Optional caller-supplied rewrites of the default scripts.
///
/// Each hook receives the default script body and returns the body to use;
/// digests are recomputed over the rewritten text. Hooks run exactly once,
/// when the coordinator is built.
#[derive(Default)]
pub struct ScriptRewrites {
    pub acquire: Option<Rewrite>,
    pub extend: Option<Rewrite>,
    pub release: Option<Rewrite>,
}

impl fmt::Debug for ScriptRewrites {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRewrites")
            .field("acquire", &self.acquire.is_some())
            .field("extend", &self.extend.is_some())
            .field("release", &self.release.is_some())
            .finish()
    }
}

/// The registry of the three scripts a coordinator executes.
#[derive(Debug, Clone)]
pub(crate) struct ScriptSet {
    pub acquire: Script,
    pub extend: Script,
    pub release: Script,
}

impl ScriptSet {
    pub fn new(rewrites: ScriptRewrites) -> Self {
        Self {
            acquire: Self::build(ACQUIRE_SOURCE, rewrites.acquire),
            extend: Self::build(EXTEND_SOURCE, rewrites.extend),
            release: Self::build(RELEASE_SOURCE, rewrites.release),
        }
    }

    fn build(source: &str, rewrite: Option<Rewrite>) -> Script {
        match rewrite {
            Some(rewrite) => Script::new(rewrite(source.to_string())),
            None => Script::new(source),
        }
    }
}

impl Default for ScriptSet {
    fn default() -> Self {
        Self::new(ScriptRewrites::default())
    }
}
