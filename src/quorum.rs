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

//! Quorum execution engine: per-store invocation, vote tallying, and
//! deferred attempt stats.
//!
//! One attempt fans a script out to every store concurrently and resolves
//! as soon as either side reaches `floor(N/2)+1` votes, in reply-arrival
//! order. Stragglers keep running: their votes are folded into the attempt
//! stats by a background task, and the stats handle resolves only once
//! every store has voted.

use crate::error::LockError;
use crate::scripts::Script;
use crate::store::ScriptStore;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// A single store's tagged response to one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// The script was applied to every requested key.
    For,
    /// Anything else, with the error attached in the stats.
    Against,
}

/// Per-attempt tally.
#[derive(Debug, Clone)]
pub struct ExecutionStats {
    /// Number of stores the attempt was fanned out to.
    pub membership_size: usize,
    /// `floor(membership_size / 2) + 1`.
    pub quorum_size: usize,
    /// Stores that granted the operation, in reply-arrival order.
    pub votes_for: Vec<String>,
    /// Stores that refused, with the error behind each refusal.
    pub votes_against: HashMap<String, LockError>,
}

impl ExecutionStats {
    fn new(membership_size: usize) -> Self {
        Self {
            membership_size,
            quorum_size: membership_size / 2 + 1,
            votes_for: Vec::new(),
            votes_against: HashMap::new(),
        }
    }

    fn tallied(&self) -> usize {
        self.votes_for.len() + self.votes_against.len()
    }

    fn decision(&self) -> Option<Vote> {
        if self.votes_for.len() >= self.quorum_size {
            Some(Vote::For)
        } else if self.votes_against.len() >= self.quorum_size {
            Some(Vote::Against)
        } else {
            None
        }
    }
}

/// Deferred handle onto one attempt's stats.
///
/// The attempt itself resolves as soon as a quorum is reached; the handle
/// resolves once the remaining stores have also voted.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    rx: watch::Receiver<Option<ExecutionStats>>,
}

impl StatsHandle {
    /// The stats as of now, or `None` while stragglers are still voting.
    pub fn current(&self) -> Option<ExecutionStats> {
        self.rx.borrow().clone()
    }

    /// Wait for every store's vote to be in.
    ///
    /// Panics if the stats publisher died before every store voted; the
    /// store invoker is total, so a lost vote is a programming error.
    pub async fn resolved(&self) -> ExecutionStats {
        let mut rx = self.rx.clone();
        let stats = rx
            .wait_for(Option::is_some)
            .await
            .expect("attempt stats publisher dropped before every store voted");
        (*stats).clone().expect("stats resolved without a value")
    }
}

/// Outcome of a completed retry loop: the stats handle of every attempt
/// made, in order.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub attempts: Vec<StatsHandle>,
}

/// Outcome of a single fan-out round.
pub(crate) struct Attempt {
    pub vote: Vote,
    pub stats: StatsHandle,
}

enum StoreVote {
    Granted { store: String },
    Refused { store: String, error: LockError },
}

/// Execute one script on one store, normalising the reply into a vote.
///
/// EVALSHA first to save bandwidth on the hot path; if the store has not
/// cached the script, retry once with the raw body so it caches it.
async fn invoke_store(
    store: Arc<dyn ScriptStore>,
    script: Script,
    keys: Arc<Vec<String>>,
    args: Arc<Vec<String>>,
) -> StoreVote {
    let reply = match store.eval_sha(script.hash(), &keys, &args).await {
        Err(LockError::ScriptNotCached(_)) => {
            debug!(store = %store.name(), "script not cached, retrying with full body");
            store.eval(script.text(), &keys, &args).await
        }
        other => other,
    };

    let requested = keys.len();
    match reply {
        Ok(applied) if applied == requested as i64 => StoreVote::Granted {
            store: store.name().to_string(),
        },
        Ok(applied) => StoreVote::Refused {
            store: store.name().to_string(),
            error: LockError::ResourceLocked { applied, requested },
        },
        Err(error) => StoreVote::Refused {
            store: store.name().to_string(),
            error,
        },
    }
}

fn record(stats: &mut ExecutionStats, vote: StoreVote, errors: &broadcast::Sender<LockError>) {
    match vote {
        StoreVote::Granted { store } => stats.votes_for.push(store),
        StoreVote::Refused { store, error } => {
            debug!(store = %store, error = %error, "store voted against");
            let _ = errors.send(error.clone());
            stats.votes_against.insert(store, error);
        }
    }
}

/// Fold the stragglers' votes in and publish the completed stats.
async fn drain_votes(
    mut pending: FuturesUnordered<BoxFuture<'static, StoreVote>>,
    mut stats: ExecutionStats,
    tx: watch::Sender<Option<ExecutionStats>>,
    errors: broadcast::Sender<LockError>,
) {
    while let Some(vote) = pending.next().await {
        record(&mut stats, vote, &errors);
    }
    assert_eq!(
        stats.tallied(),
        stats.membership_size,
        "a store task ended without voting"
    );
    tx.send_replace(Some(stats));
}

/// One fan-out round over every store.
pub(crate) async fn run_attempt(
    stores: &[Arc<dyn ScriptStore>],
    script: &Script,
    keys: &[String],
    args: &[String],
    errors: &broadcast::Sender<LockError>,
) -> Attempt {
    let keys = Arc::new(keys.to_vec());
    let args = Arc::new(args.to_vec());

    let mut pending: FuturesUnordered<BoxFuture<'static, StoreVote>> = stores
        .iter()
        .map(|store| {
            invoke_store(
                Arc::clone(store),
                script.clone(),
                Arc::clone(&keys),
                Arc::clone(&args),
            )
            .boxed()
        })
        .collect();

    let (tx, rx) = watch::channel(None);
    let mut stats = ExecutionStats::new(stores.len());

    while let Some(vote) = pending.next().await {
        record(&mut stats, vote, errors);
        if let Some(decided) = stats.decision() {
            debug!(
                vote = ?decided,
                votes_for = stats.votes_for.len(),
                votes_against = stats.votes_against.len(),
                "quorum decided"
            );
            tokio::spawn(drain_votes(pending, stats, tx, errors.clone()));
            return Attempt {
                vote: decided,
                stats: StatsHandle { rx },
            };
        }
    }

    // Every reply is in and neither side reached quorum; only possible with
    // even membership. No majority granted the lock.
    assert_eq!(
        stats.tallied(),
        stats.membership_size,
        "a store task ended without voting"
    );
    tx.send_replace(Some(stats));
    Attempt {
        vote: Vote::Against,
        stats: StatsHandle { rx },
    }
}
