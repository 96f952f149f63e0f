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

//! # PlexLock Distributed Mutual Exclusion
//!
//! ## Purpose
//! Client-side distributed locking over an odd-numbered set of independent
//! Redis-compatible stores, following the Redlock algorithm. Callers
//! request exclusive, time-bounded ownership of one or more named
//! resources; the coordinator decides whether a quorum of stores granted
//! the lock and hands back a handle bearing a drift-corrected deadline.
//!
//! ## Architecture Context
//! - **Quorum engine**: each operation is a server-side script fanned out
//!   to every store in parallel; the first side (for/against) to reach
//!   `floor(N/2)+1` votes decides the attempt, and a retry loop with
//!   jittered backoff drives attempts until the budget runs out.
//! - **Lock lifecycle**: acquire / extend / release, with best-effort
//!   cleanup of partial acquisitions and in-place supersession of extended
//!   deadlines.
//! - **Scoped use**: [`RedLock::using`] runs a routine under a lock that
//!   is re-extended in the background, aborting the routine cooperatively
//!   if the lock is lost.
//!
//! ## Design Decisions
//! - **Stores are peers**: no coordination between stores; correctness
//!   derives from majority quorum and per-store script atomicity.
//! - **Non-fatal error channel**: per-store faults and contention become
//!   "against" votes and are observable via
//!   [`RedLock::subscribe_errors`]; they never terminate a call.
//! - **Backend-agnostic seam**: stores implement [`ScriptStore`];
//!   [`RedisScriptStore`] is the production backend and
//!   [`MemoryScriptStore`] serves the test-suite.
//!
//! ## Example
//! ```rust,no_run
//! use plexlock::{RedLock, RedisScriptStore, ScriptStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> plexlock::LockResult<()> {
//! let mut stores: Vec<Arc<dyn ScriptStore>> = Vec::new();
//! for url in ["redis://10.0.0.1/", "redis://10.0.0.2/", "redis://10.0.0.3/"] {
//!     stores.push(Arc::new(RedisScriptStore::connect(url).await?));
//! }
//! let manager = RedLock::new(stores)?;
//!
//! manager
//!     .using(
//!         &["jobs:refresh".to_string()],
//!         Duration::from_secs(5),
//!         None,
//!         |signal| async move {
//!             while !signal.is_aborted() {
//!                 // do one unit of exclusive work
//!                 # break;
//!             }
//!         },
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod lock;
pub mod manager;
pub mod memory;
pub mod quorum;
pub mod scripts;
pub mod settings;
pub mod store;
pub mod supervisor;

pub use error::{LockError, LockResult};
pub use lock::Lock;
pub use manager::RedLock;
pub use memory::MemoryScriptStore;
pub use quorum::{ExecutionResult, ExecutionStats, StatsHandle, Vote};
pub use scripts::{Script, ScriptRewrites};
pub use settings::Settings;
pub use store::{RedisScriptStore, ScriptStore};
pub use supervisor::AbortSignal;
