/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The common-case ordering pipeline: Replicate → Prepare → Commit → Reply.
//!
//! The leader of the current view receives a [`Replicate`](Rpc::Replicate) call from
//! the client, assigns the request the next sequence number, and dispatches its signed
//! PREPARE to every other synchronous group member in parallel. Each follower that
//! accepts the PREPARE echoes a signed COMMIT to every other group member, and
//! executes once its commit map holds a message from the whole group. The leader
//! replies to the client only after every follower has acknowledged and its own commit
//! map is full, so one successful `Replicate` round means the whole group committed.
//!
//! Every failure along the pipeline is evidence against the current view: a transport
//! timeout or a bad signature makes the observer [suspect](super::view_change) the
//! view it was working in. A view mismatch is dropped silently instead, because the
//! sender will learn about the new view through the view change itself.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::crypto::digest_of;
use crate::messages::{Authenticated, ClientRequest, MessageKind, OrderMessage, Reply};
use crate::networking::{Rpc, Transport};
use crate::replica::ReplicaInner;
use crate::roles::view_leader;
use crate::state::PrepareEntry;
use crate::types::{ReplicaId, SeqNum, View};

/// How long a task waiting for a commit map to fill sleeps between looks.
pub(crate) const COMMIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl<T: Transport> ReplicaInner<T> {
    /// The Replicate RPC handler. Only the current leader orders the request; every
    /// other replica replies `is_leader: false` and leaves it at that.
    pub(crate) fn replicate(&self, request: ClientRequest) -> Reply {
        let mut state = self.state.lock().unwrap();
        let digest = digest_of(&request);
        let signature = self.keypair.sign(&digest);
        let mut reply = Reply::signed(digest, signature.clone());

        if self.id != view_leader(state.view, &self.peers) {
            return reply;
        }
        reply.is_leader = true;

        // A timestamp at or below the last ordered one was already ordered; the
        // earlier round's outcome stands.
        if let Some(last) = state.prepare_log.last_client_timestamp() {
            if request.timestamp <= last {
                reply.success = true;
                return reply;
            }
        }

        state.prepare_seq_num += 1;
        let seq = state.prepare_seq_num;
        let view = state.view;

        let message = OrderMessage {
            kind: MessageKind::Prepare,
            digest,
            signature,
            prepare_seq_num: seq,
            view,
            client_timestamp: request.timestamp,
            sender: self.id,
        };
        let entry = state.prepare_log.append(request.clone(), message.clone());
        state.commit_log.append(request, message, None, view);
        self.persist(&state);

        let followers: Vec<ReplicaId> = state
            .synchronous_group
            .iter()
            .copied()
            .filter(|peer| *peer != self.id)
            .collect();
        let group_size = state.synchronous_group.len();
        drop(state);

        let (ack_tx, ack_rx) = mpsc::channel();
        for peer in &followers {
            let me = self.arc();
            let entry = entry.clone();
            let acks = ack_tx.clone();
            let peer = *peer;
            thread::spawn(move || me.issue_prepare(peer, entry, acks, view));
        }

        let deadline = Instant::now() + self.config.phase_window();
        for _ in 0..followers.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if ack_rx.recv_timeout(remaining).is_err() {
                log::info!(
                    "timeout: replica {} waiting for prepare acks at seq {}",
                    self.id,
                    seq
                );
                return reply;
            }
        }

        if self.await_commit_quorum(seq, view, group_size) {
            reply.success = true;
        }
        reply
    }

    /// Dispatch a PREPARE to `peer` and interpret its reply. Runs without the state
    /// lock for its whole lifetime.
    fn issue_prepare(
        &self,
        peer: ReplicaId,
        entry: PrepareEntry,
        acks: Sender<()>,
        armed_view: View,
    ) {
        log::debug!("Prepare: from replica {} to replica {}", self.id, peer);
        match self.transport.call(peer, Rpc::Prepare(entry.clone())) {
            Some(reply) => {
                let authentic = self.keys.verify(peer, &reply.digest, &reply.signature);
                if reply.digest == entry.message.digest && authentic {
                    if reply.success {
                        let _ = acks.send(());
                    }
                    // A suspicious reply means the peer has rejected us and its own
                    // Suspect is already on the way; nothing more to do here.
                } else {
                    self.issue_suspect(armed_view);
                }
            }
            None => self.issue_suspect(armed_view),
        }
    }

    /// The Prepare RPC handler, run on followers.
    pub(crate) fn prepare(&self, entry: PrepareEntry) -> Reply {
        let mut state = self.state.lock().unwrap();
        let digest = digest_of(&entry.request);
        let signature = self.keypair.sign(&digest);
        let mut reply = Reply::signed(digest, signature.clone());

        if state.view != entry.message.view {
            return reply;
        }

        let acceptable = entry.message.prepare_seq_num == state.prepare_seq_num + 1
            && entry.message.digest == digest
            && entry.message.verify(&self.keys);
        if !acceptable {
            reply.suspicious = true;
            let view = state.view;
            drop(state);
            self.issue_suspect(view);
            return reply;
        }

        if let Some(last) = state.prepare_log.last_client_timestamp() {
            if entry.request.timestamp <= last {
                reply.success = true;
                return reply;
            }
        }

        state.prepare_seq_num += 1;
        let seq = state.prepare_seq_num;
        let view = state.view;
        state
            .prepare_log
            .append(entry.request.clone(), entry.message.clone());

        let commit = OrderMessage {
            kind: MessageKind::Commit,
            digest,
            signature,
            prepare_seq_num: seq,
            view,
            client_timestamp: entry.request.timestamp,
            sender: self.id,
        };
        state
            .commit_log
            .append(entry.request, entry.message, Some(commit.clone()), view);
        self.persist(&state);

        let others: Vec<ReplicaId> = state
            .synchronous_group
            .iter()
            .copied()
            .filter(|peer| *peer != self.id)
            .collect();
        let group_size = state.synchronous_group.len();
        drop(state);

        let (ack_tx, ack_rx) = mpsc::channel();
        for peer in &others {
            let me = self.arc();
            let commit = commit.clone();
            let acks = ack_tx.clone();
            let peer = *peer;
            thread::spawn(move || me.issue_commit(peer, commit, acks));
        }

        let deadline = Instant::now() + self.config.phase_window();
        for _ in 0..others.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if ack_rx.recv_timeout(remaining).is_err() {
                log::info!(
                    "timeout: replica {} waiting for commit acks at seq {}",
                    self.id,
                    seq
                );
                return reply;
            }
        }

        if self.await_commit_quorum(seq, view, group_size) {
            reply.success = true;
        }
        reply
    }

    /// Dispatch a COMMIT to `peer`, retransmitting until the peer has caught up to
    /// this sequence number. The retransmission loop is bounded by the view the
    /// message belongs to: it exits as soon as this replica has advanced past it.
    fn issue_commit(&self, peer: ReplicaId, message: OrderMessage, acks: Sender<()>) {
        let armed_view = self.state.lock().unwrap().view;
        loop {
            if self.is_dead() {
                return;
            }
            log::debug!("Commit: from replica {} to replica {}", self.id, peer);
            match self.transport.call(peer, Rpc::Commit(message.clone())) {
                Some(reply) => {
                    let authentic = self.keys.verify(peer, &reply.digest, &reply.signature);
                    if message.digest == reply.digest && authentic {
                        if reply.success {
                            let _ = acks.send(());
                            return;
                        }
                        if reply.suspicious {
                            return;
                        }
                        // The peer is behind: it has not appended a commit entry for
                        // this sequence number yet. Followers need the full set, so
                        // keep retransmitting within the view.
                        if self.state.lock().unwrap().view != message.view {
                            return;
                        }
                        thread::sleep(COMMIT_POLL_INTERVAL);
                    } else {
                        self.issue_suspect(armed_view);
                        return;
                    }
                }
                None => {
                    self.issue_suspect(armed_view);
                    return;
                }
            }
        }
    }

    /// The Commit RPC handler: record the sender's COMMIT into the slot currently
    /// being executed.
    pub(crate) fn commit(&self, message: OrderMessage) -> Reply {
        let mut state = self.state.lock().unwrap();
        let digest = message.digest;
        let signature = self.keypair.sign(&digest);
        let mut reply = Reply::signed(digest, signature);

        if state.view != message.view {
            reply.suspicious = true;
            return reply;
        }

        if message.verify(&self.keys) {
            let index = state.execute_seq_num.int() as usize;
            if index < state.commit_log.len() {
                state.commit_log.record(index, message.sender, message);
                self.persist(&state);
                reply.success = true;
            }
        } else {
            reply.suspicious = true;
            let view = state.view;
            drop(state);
            self.issue_suspect(view);
        }
        reply
    }

    /// Wait until the commit map for `seq` holds a message from every group member,
    /// then mark the sequence number executed. Gives up after the phase window, or
    /// immediately when the view has moved on.
    fn await_commit_quorum(&self, seq: SeqNum, armed_view: View, group_size: usize) -> bool {
        let deadline = Instant::now() + self.config.phase_window();
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.view != armed_view {
                    return false;
                }
                if state.commit_log.commits_at(seq.index()) >= group_size {
                    if state.execute_seq_num < seq {
                        state.execute_seq_num = seq;
                    }
                    self.persist(&state);
                    return true;
                }
            }
            if Instant::now() > deadline {
                log::info!(
                    "timeout: replica {} waiting for commit quorum at seq {}",
                    self.id,
                    seq
                );
                return false;
            }
            thread::sleep(COMMIT_POLL_INTERVAL);
        }
    }
}
