/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The two append-only logs every replica keeps, and the entry types stored in them.
//!
//! The **prepare log** records the leader-assigned order for the current view: one
//! [`PrepareEntry`] per sequence number, holding the client request and the leader's
//! signed PREPARE. It is rewritten in exactly one place, by
//! [new-view reconstruction](PrepareLog::update).
//!
//! The **commit log** records how much of that order has been witnessed: one
//! [`CommitEntry`] per sequence number, accumulating the COMMIT messages of the
//! synchronous group. An entry whose map holds a message from every group member is
//! *committed* and survives every later view change. A committed entry is only ever
//! replaced by [merging](CommitLog::merge_entry) in a strictly-higher-view version of
//! the same index.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;

use crate::messages::{ClientRequest, OrderMessage};
use crate::types::{ReplicaId, SeqNum, Timestamp, View};

/// A sequence decision as assigned by the leader: the request plus the leader's
/// PREPARE message for it.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct PrepareEntry {
    pub request: ClientRequest,
    pub message: OrderMessage,
}

/// A sequence decision together with the evidence collected for it: the leader's
/// PREPARE and one COMMIT per synchronous group member that has echoed it.
///
/// `view` records the view the entry was created in, which is what the view-change
/// merge breaks ties on.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CommitEntry {
    pub request: ClientRequest,
    pub message: OrderMessage,
    pub commits: BTreeMap<ReplicaId, OrderMessage>,
    pub view: View,
}

/// Ordered sequence of [`PrepareEntry`], indexed by sequence number.
#[derive(Clone, PartialEq, Eq, Default, BorshDeserialize, BorshSerialize)]
pub struct PrepareLog(Vec<PrepareEntry>);

impl PrepareLog {
    pub fn new() -> PrepareLog {
        PrepareLog(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PrepareEntry> {
        self.0.get(index)
    }

    pub fn entries(&self) -> &[PrepareEntry] {
        &self.0
    }

    /// The client timestamp of the most recently appended entry. Requests stamped at
    /// or below it have already been ordered.
    pub fn last_client_timestamp(&self) -> Option<Timestamp> {
        self.0.last().map(|entry| entry.message.client_timestamp)
    }

    /// Append the entry for `message.prepare_seq_num`, which must be one past the
    /// current length. Re-appending an identical entry is a no-op.
    pub fn append(&mut self, request: ClientRequest, message: OrderMessage) -> PrepareEntry {
        let entry = PrepareEntry { request, message };
        if let Some(existing) = self.0.get(entry.message.prepare_seq_num.index()) {
            if *existing == entry {
                return entry;
            }
        }
        debug_assert_eq!(entry.message.prepare_seq_num.index(), self.0.len());
        self.0.push(entry.clone());
        entry
    }

    /// Overwrite the entry at `seq`. Used exclusively by new-view reconstruction.
    pub fn update(&mut self, seq: SeqNum, request: ClientRequest, message: OrderMessage) {
        self.0[seq.index()] = PrepareEntry { request, message };
    }

    /// Drop every entry past `len`. Used by new-view reconstruction to discard
    /// prepared-but-never-committed tails from earlier views.
    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }
}

/// Ordered sequence of [`CommitEntry`], indexed by sequence number.
#[derive(Clone, PartialEq, Eq, Default, BorshDeserialize, BorshSerialize)]
pub struct CommitLog(Vec<CommitEntry>);

impl CommitLog {
    pub fn new() -> CommitLog {
        CommitLog(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CommitEntry> {
        self.0.get(index)
    }

    pub fn entries(&self) -> &[CommitEntry] {
        &self.0
    }

    /// Append the commit entry for a newly prepared request. The entry's map is seeded
    /// with the leader's PREPARE and, on a follower, the follower's own COMMIT, so the
    /// map holds one message per group member once every other member's COMMIT has
    /// arrived.
    ///
    /// If the entry for this sequence number already exists (reconstructed by a view
    /// change merge), the seeds are recorded into it instead.
    pub fn append(
        &mut self,
        request: ClientRequest,
        message: OrderMessage,
        local_commit: Option<OrderMessage>,
        view: View,
    ) {
        let index = message.prepare_seq_num.index();
        if index == self.0.len() {
            let mut commits = BTreeMap::new();
            commits.insert(message.sender, message.clone());
            if let Some(commit) = local_commit {
                commits.insert(commit.sender, commit);
            }
            self.0.push(CommitEntry {
                request,
                message,
                commits,
                view,
            });
        } else if index < self.0.len() {
            self.record(index, message.sender, message.clone());
            if let Some(commit) = local_commit {
                self.record(index, commit.sender, commit);
            }
        }
    }

    /// Insert `message` into the entry's map under `sender`. A differing message
    /// already recorded for the same sender is never overwritten.
    pub fn record(&mut self, index: usize, sender: ReplicaId, message: OrderMessage) {
        if let Some(entry) = self.0.get_mut(index) {
            entry.commits.entry(sender).or_insert(message);
        }
    }

    /// Number of messages recorded for the entry at `index`.
    pub fn commits_at(&self, index: usize) -> usize {
        self.0.get(index).map(|entry| entry.commits.len()).unwrap_or(0)
    }

    /// Fold one entry of another replica's commit log into this one: append if the
    /// index is new, replace only if the incoming entry carries a strictly higher
    /// view. This is the sole place a previously committed entry can be rewritten.
    pub fn merge_entry(&mut self, index: usize, entry: &CommitEntry) {
        if index >= self.0.len() {
            debug_assert_eq!(index, self.0.len());
            self.0.push(entry.clone());
        } else if self.0[index].view < entry.view {
            self.0[index] = entry.clone();
        }
    }
}

/// Pointwise consistency check between a rebuilt prepare log and a commit log: every
/// position must agree on request digest, sequence number and client timestamp.
/// Logs of unequal length are never consistent.
pub(crate) fn logs_consistent(prepare_log: &PrepareLog, commit_log: &CommitLog) -> bool {
    if prepare_log.len() != commit_log.len() {
        return false;
    }
    prepare_log
        .entries()
        .iter()
        .zip(commit_log.entries())
        .all(|(prepare, commit)| {
            prepare.message.digest == commit.message.digest
                && prepare.message.prepare_seq_num == commit.message.prepare_seq_num
                && prepare.message.client_timestamp == commit.message.client_timestamp
        })
}
