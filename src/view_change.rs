/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The view-change pipeline: Suspect → ViewChange → VCFinal → NewView.
//!
//! Any timeout or verification failure makes a replica broadcast a signed
//! [Suspect](Rpc::Suspect) of its current view. A replica receiving a fresh, valid
//! Suspect for a view at or above its own moves to the next view, forwards the
//! Suspect unmodified, and, if it belongs to the new view's synchronous group,
//! sends the group a [ViewChange](Rpc::ViewChange) carrying its whole commit log.
//!
//! Once a group member has collected enough ViewChange messages (everyone, or a
//! majority after the collection window expires), it transmits the collected set to
//! the whole group as a [VCFinal](Rpc::VcFinal). The mutual exchange means every
//! member decides on the union of what every other member saw, which an equivocating
//! sender cannot split. When VCFinal evidence from the full group is in, every member
//! merges the carried commit logs position by position, keeping the highest-view
//! entry at each index. That merge is the one place a committed entry can be
//! rewritten, and only by a strictly-higher-view version of itself.
//!
//! The new leader then rebuilds its prepare log from the merged commit log, signing
//! fresh PREPAREs under the new view, and broadcasts it as a
//! [NewView](Rpc::NewView). Followers adopt it after checking it against their own
//! merged commit log, and the leader unblocks the client with a ConfirmVc. If no
//! NewView lands within the watchdog window, the group suspects the view again and
//! drives another round.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::crypto::digest_of;
use crate::logging::short_digest;
use crate::messages::{
    Authenticated, MessageKind, NewViewMessage, OrderMessage, Reply, SuspectMessage,
    VcFinalMessage, ViewChangeMessage,
};
use crate::networking::{Rpc, Transport};
use crate::replica::{ReplicaInner, ReplicaState};
use crate::roles::{synchronous_group, view_leader};
use crate::state::logs_consistent;
use crate::types::{ReplicaId, SeqNum, View, CLIENT};

impl<T: Transport> ReplicaInner<T> {
    /// Broadcast a signed Suspect of `view` to every replica. A no-op if the view has
    /// already moved on, or if this replica has suspected `view` before.
    pub(crate) fn issue_suspect(&self, view: View) {
        let message = {
            let mut state = self.state.lock().unwrap();
            if state.view != view || state.last_suspect_view == Some(view) {
                return;
            }
            state.last_suspect_view = Some(view);
            let digest = digest_of(&view);
            SuspectMessage {
                kind: MessageKind::Suspect,
                digest,
                signature: self.keypair.sign(&digest),
                view,
                sender: self.id,
            }
        };
        log::info!("replica {} suspects view {}", self.id, view);
        self.broadcast_suspect(message);
    }

    /// Send `message` to every replica, each on its own task.
    fn broadcast_suspect(&self, message: SuspectMessage) {
        for peer in self.peers.iter().copied() {
            if peer.is_client() {
                continue;
            }
            let me = self.arc();
            let message = message.clone();
            thread::spawn(move || me.issue_suspect_to(peer, message));
        }
    }

    fn issue_suspect_to(&self, peer: ReplicaId, message: SuspectMessage) {
        log::debug!("Suspect: from replica {} to replica {}", self.id, peer);
        match self.transport.call(peer, Rpc::Suspect(message.clone())) {
            Some(reply) => {
                let current_view = {
                    let state = self.state.lock().unwrap();
                    if state.view != message.view {
                        return;
                    }
                    state.view
                };
                let authentic = self.keys.verify(peer, &reply.digest, &reply.signature);
                if message.digest != reply.digest || !authentic {
                    self.issue_suspect(current_view);
                }
            }
            None => self.issue_suspect(message.view),
        }
    }

    /// Re-broadcast another replica's Suspect after adopting it. Forwarding the
    /// original message, signature intact, lets peers that missed it verify the
    /// original issuer.
    fn forward_suspect(&self, message: SuspectMessage) {
        {
            let state = self.state.lock().unwrap();
            if state.view != message.view + 1 {
                return;
            }
        }
        self.broadcast_suspect(message);
    }

    /// The Suspect RPC handler.
    pub(crate) fn on_suspect(&self, message: SuspectMessage) -> Reply {
        let mut state = self.state.lock().unwrap();
        let digest = digest_of(&message.view);
        let signature = self.keypair.sign(&digest);
        let reply = Reply::signed(digest, signature);

        let key = digest_of(&message);
        if state.view > message.view || state.suspect_set.contains_key(&key) {
            return reply;
        }

        if message.digest == digest && message.verify(&self.keys) {
            state.suspect_set.insert(key, message.clone());

            let new_view = message.view + 1;
            state.view = new_view;
            state.synchronous_group = synchronous_group(new_view, &self.peers, self.id);
            state.vc_set.clear();
            state.received_vc_final.clear();
            state.vc_in_progress = true;

            if !state.synchronous_group.is_empty() {
                state.net_flag = false;
                state.net_deadline = Some(Instant::now() + self.config.phase_window());
            }
            log::info!(
                "replica {} enters view {} on suspicion of view {} (group size {})",
                self.id,
                new_view,
                message.view,
                state.synchronous_group.len()
            );
            drop(state);

            let me = self.arc();
            thread::spawn(move || me.forward_suspect(message));

            let me = self.arc();
            thread::spawn(move || me.issue_view_change(new_view));
        } else {
            let view = state.view;
            drop(state);
            self.issue_suspect(view);
        }
        reply
    }

    /// Send a signed ViewChange carrying this replica's commit log to every member of
    /// the new synchronous group, itself included.
    fn issue_view_change(&self, view: View) {
        let (message, group) = {
            let state = self.state.lock().unwrap();
            if state.view != view {
                return;
            }
            let digest = digest_of(&view);
            let message = ViewChangeMessage {
                kind: MessageKind::ViewChange,
                digest,
                signature: self.keypair.sign(&digest),
                view,
                sender: self.id,
                commit_log: state.commit_log.clone(),
            };
            let group: Vec<ReplicaId> = state.synchronous_group.iter().copied().collect();
            (message, group)
        };

        for peer in group {
            let me = self.arc();
            let message = message.clone();
            thread::spawn(move || {
                log::debug!("ViewChange: from replica {} to replica {}", me.id, peer);
                match me.transport.call(peer, Rpc::ViewChange(message.clone())) {
                    Some(reply) => {
                        {
                            let state = me.state.lock().unwrap();
                            if state.view != message.view {
                                return;
                            }
                        }
                        let authentic = me.keys.verify(peer, &reply.digest, &reply.signature);
                        if message.digest != reply.digest || !authentic {
                            me.issue_suspect(message.view);
                        }
                    }
                    None => me.issue_suspect(message.view),
                }
            });
        }
    }

    /// The ViewChange RPC handler. Collects the message; once every replica's
    /// ViewChange is in, or a majority is in when the collection window closes,
    /// proceeds to the VCFinal exchange. A window that closes without a majority
    /// re-suspects the view.
    pub(crate) fn on_view_change(&self, message: ViewChangeMessage) -> Reply {
        let mut state = self.state.lock().unwrap();
        let digest = digest_of(&message.view);
        let signature = self.keypair.sign(&digest);
        let reply = Reply::signed(digest, signature);

        if state.view != message.view {
            return reply;
        }

        if !(message.digest == digest && message.verify(&self.keys)) {
            let view = state.view;
            drop(state);
            self.issue_suspect(view);
            return reply;
        }

        let view = message.view;
        state.vc_set.insert(digest_of(&message), message);

        // Every replica answered: no need to wait out the window.
        if state.vc_set.len() == self.peers.len() - 1 {
            self.arm_vc_timer(&mut state);
            drop(state);
            let me = self.arc();
            thread::spawn(move || me.issue_vc_final(view));
            return reply;
        }

        let deadline = state.net_deadline.unwrap_or_else(Instant::now);
        drop(state);
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }

        let mut state = self.state.lock().unwrap();
        if state.view != view {
            return reply;
        }
        let majority = (self.peers.len() + 1) / 2;
        if !state.net_flag && state.vc_set.len() >= majority {
            self.arm_vc_timer(&mut state);
            drop(state);
            let me = self.arc();
            thread::spawn(move || me.issue_vc_final(view));
        } else if !state.net_flag {
            state.vc_flag = true;
            drop(state);
            log::info!(
                "timeout: replica {} collected too few view changes for view {}",
                self.id,
                view
            );
            self.issue_suspect(view);
        }
        reply
    }

    /// Close the collection phase and arm the watchdog that re-suspects the view if
    /// no NewView lands within the phase window. The watchdog only fires for the view
    /// it was armed in.
    fn arm_vc_timer(&self, state: &mut ReplicaState) {
        state.net_flag = true;
        state.vc_flag = false;
        let armed_view = state.view;
        let window = self.config.phase_window();

        let me = self.arc();
        thread::spawn(move || {
            thread::sleep(window);
            let expired = {
                let state = me.state.lock().unwrap();
                !state.vc_flag && state.view == armed_view
            };
            if expired {
                log::info!(
                    "timeout: replica {} saw no new view for view {}",
                    me.id,
                    armed_view
                );
                me.issue_suspect(armed_view);
            }
        });
    }

    /// Transmit this replica's collected ViewChange set to every group member, itself
    /// included.
    fn issue_vc_final(&self, view: View) {
        let (message, group) = {
            let state = self.state.lock().unwrap();
            if state.view != view {
                return;
            }
            let digest = digest_of(&view);
            let message = VcFinalMessage {
                kind: MessageKind::VcFinal,
                digest,
                signature: self.keypair.sign(&digest),
                view,
                sender: self.id,
                vc_set: state.vc_set.clone(),
            };
            let group: Vec<ReplicaId> = state.synchronous_group.iter().copied().collect();
            (message, group)
        };

        for peer in group {
            let me = self.arc();
            let message = message.clone();
            thread::spawn(move || {
                log::debug!("VcFinal: from replica {} to replica {}", me.id, peer);
                match me.transport.call(peer, Rpc::VcFinal(message.clone())) {
                    Some(reply) => {
                        {
                            let state = me.state.lock().unwrap();
                            if state.view != message.view {
                                return;
                            }
                        }
                        let authentic = me.keys.verify(peer, &reply.digest, &reply.signature);
                        if message.digest != reply.digest || !authentic {
                            me.issue_suspect(message.view);
                        }
                    }
                    None => me.issue_suspect(message.view),
                }
            });
        }
    }

    /// The VCFinal RPC handler. Unions the carried evidence; once VCFinal from every
    /// group member is in, performs the commit-log merge and, on the new leader,
    /// rebuilds the prepare log and drives the NewView round.
    pub(crate) fn on_vc_final(&self, message: VcFinalMessage) -> Reply {
        let mut state = self.state.lock().unwrap();
        if state.view != message.view {
            return Reply::empty();
        }

        let digest = digest_of(&message.view);
        let signature = self.keypair.sign(&digest);
        let reply = Reply::signed(digest, signature);

        if !(message.digest == digest && message.verify(&self.keys)) {
            let view = state.view;
            drop(state);
            self.issue_suspect(view);
            return reply;
        }

        if !state.synchronous_group.contains(&message.sender) {
            return reply;
        }

        for (key, vc) in &message.vc_set {
            state.vc_set.entry(*key).or_insert_with(|| vc.clone());
        }
        state.received_vc_final.insert(message.sender, message.vc_set);

        if state.received_vc_final.len() < state.synchronous_group.len() {
            return reply;
        }

        // Evidence from the whole group is in: merge every reported commit log,
        // highest view winning at each index.
        let reported: Vec<ViewChangeMessage> = state.vc_set.values().cloned().collect();
        for vc in &reported {
            for (index, entry) in vc.commit_log.entries().iter().enumerate() {
                state.commit_log.merge_entry(index, entry);
            }
        }
        self.persist(&state);
        log::info!(
            "replica {} merged commit logs for view {}: {} entries",
            self.id,
            message.view,
            state.commit_log.len()
        );

        if self.id != view_leader(state.view, &self.peers) {
            return reply;
        }

        // New leader: regenerate a PREPARE for every merged entry, signed fresh under
        // the new view, and replace any prepared-but-uncommitted tail.
        let merged_len = state.commit_log.len();
        for index in 0..merged_len {
            let commit_entry = state.commit_log.get(index).unwrap().clone();
            let seq = SeqNum::new(index as u64 + 1);
            let entry_digest = digest_of(&commit_entry.request);
            let new_message = OrderMessage {
                kind: MessageKind::Prepare,
                digest: entry_digest,
                signature: self.keypair.sign(&entry_digest),
                prepare_seq_num: seq,
                view: state.view,
                client_timestamp: commit_entry.message.client_timestamp,
                sender: self.id,
            };
            if index < state.prepare_log.len() {
                state
                    .prepare_log
                    .update(seq, commit_entry.request, new_message);
            } else {
                state.prepare_log.append(commit_entry.request, new_message);
            }
        }
        state.prepare_log.truncate(merged_len);
        self.persist(&state);

        let new_view_message = NewViewMessage {
            kind: MessageKind::NewView,
            digest,
            signature: self.keypair.sign(&digest),
            view: message.view,
            sender: self.id,
            prepare_log: state.prepare_log.clone(),
        };
        let followers: Vec<ReplicaId> = state
            .synchronous_group
            .iter()
            .copied()
            .filter(|peer| *peer != self.id)
            .collect();
        drop(state);

        let (ack_tx, ack_rx) = mpsc::channel();
        for peer in &followers {
            let me = self.arc();
            let new_view_message = new_view_message.clone();
            let acks = ack_tx.clone();
            let peer = *peer;
            thread::spawn(move || me.issue_new_view(peer, new_view_message, acks));
        }

        let deadline = Instant::now() + self.config.phase_window();
        for _ in 0..followers.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if ack_rx.recv_timeout(remaining).is_err() {
                log::info!(
                    "timeout: replica {} waiting for new view acks for view {}",
                    self.id,
                    message.view
                );
                return reply;
            }
        }

        {
            let state = self.state.lock().unwrap();
            if state.view != message.view {
                return reply;
            }
        }

        // Every follower adopted the new view; now install it locally through the
        // same handler, which also triggers the client notification.
        let me = self.arc();
        thread::spawn(move || me.issue_new_view(me.id, new_view_message, ack_tx));
        reply
    }

    fn issue_new_view(
        &self,
        peer: ReplicaId,
        message: NewViewMessage,
        acks: Sender<()>,
    ) {
        log::debug!("NewView: from replica {} to replica {}", self.id, peer);
        match self.transport.call(peer, Rpc::NewView(message.clone())) {
            Some(reply) => {
                let current_view = {
                    let state = self.state.lock().unwrap();
                    if state.view != message.view {
                        return;
                    }
                    state.view
                };
                let authentic = self.keys.verify(peer, &reply.digest, &reply.signature);
                if message.digest == reply.digest && authentic {
                    if reply.success {
                        let _ = acks.send(());
                    }
                } else {
                    self.issue_suspect(current_view);
                }
            }
            None => self.issue_suspect(message.view),
        }
    }

    /// The NewView RPC handler: verify the rebuilt prepare log against the merged
    /// commit log, then adopt it and leave the view change.
    pub(crate) fn on_new_view(&self, message: NewViewMessage) -> Reply {
        let mut state = self.state.lock().unwrap();
        if state.view != message.view {
            return Reply::empty();
        }

        let digest = digest_of(&message.view);
        let signature = self.keypair.sign(&digest);
        let mut reply = Reply::signed(digest, signature);

        state.vc_flag = true;

        if !(message.digest == digest && message.verify(&self.keys)) {
            let view = state.view;
            drop(state);
            self.issue_suspect(view);
            return reply;
        }

        if !logs_consistent(&message.prepare_log, &state.commit_log) {
            log::info!(
                "replica {} rejects new view {}: prepare log {} does not match commit log",
                self.id,
                message.view,
                short_digest(&digest_of(&message.prepare_log))
            );
            let view = state.view;
            drop(state);
            self.issue_suspect(view);
            return reply;
        }

        state.prepare_log = message.prepare_log;
        state.prepare_seq_num = SeqNum::new(state.prepare_log.len() as u64);
        state.execute_seq_num = SeqNum::new(state.commit_log.len() as u64);
        state.suspect_set.clear();
        state.vc_set.clear();
        state.received_vc_final.clear();
        state.vc_in_progress = false;
        self.persist(&state);
        log::info!(
            "replica {} installed view {} with {} log entries",
            self.id,
            message.view,
            state.prepare_log.len()
        );

        if self.id == view_leader(state.view, &self.peers) {
            let me = self.arc();
            thread::spawn(move || me.issue_confirm_vc());
        }

        reply.success = true;
        reply
    }

    /// Tell the client that the view change completed, unblocking any pending
    /// proposal.
    fn issue_confirm_vc(&self) {
        log::debug!("ConfirmVc: from replica {} to client", self.id);
        let _ = self.transport.call(CLIENT, Rpc::ConfirmVc);
    }
}
