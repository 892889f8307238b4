/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between the client and replicas.
//!
//! Every message a replica accepts carries a digest over the fields it covers, and an
//! RSA signature over that digest from its claimed sender. The shared
//! `{digest, signature, view, sender}` prefix lets verification be uniform: the
//! [`Authenticated`] trait captures it, and handlers combine
//! [`Authenticated::verify`] with a recomputation of the digest over the covered
//! fields.
//!
//! ## Message types
//!
//! The common case uses three shapes:
//! 1. [`ClientRequest`]: built by the client on propose; replicated verbatim.
//! 2. [`OrderMessage`]: the leader's PREPARE for a sequence number, and each group
//!    member's COMMIT echo of it. The two are distinguished by [`MessageKind`].
//! 3. [`Reply`]: the status record every RPC returns. Replies are signed too, so a
//!    caller can tell a genuine answer from a forged one.
//!
//! The view change uses four: [`SuspectMessage`], [`ViewChangeMessage`],
//! [`VcFinalMessage`] and [`NewViewMessage`].

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;

use crate::crypto::KeyTable;
use crate::state::{CommitLog, PrepareLog};
use crate::types::{Digest, ReplicaId, SeqNum, SignatureBytes, Timestamp, View};

/// Type tag carried by every protocol message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum MessageKind {
    Replicate,
    Prepare,
    Commit,
    Reply,
    Suspect,
    ViewChange,
    VcFinal,
    NewView,
}

/// An operation submitted by the client for replication. Immutable once built.
///
/// The operation itself is an opaque byte string; XPaxos orders it without looking
/// inside.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ClientRequest {
    pub kind: MessageKind,
    pub timestamp: Timestamp,
    pub operation: Vec<u8>,
    pub client_id: ReplicaId,
}

impl ClientRequest {
    pub fn new(timestamp: Timestamp, operation: Vec<u8>, client_id: ReplicaId) -> ClientRequest {
        ClientRequest {
            kind: MessageKind::Replicate,
            timestamp,
            operation,
            client_id,
        }
    }
}

/// A signed statement that its sender places a particular client request at a
/// particular position in a particular view: the leader's PREPARE, or a group
/// member's COMMIT echoing it.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct OrderMessage {
    pub kind: MessageKind,
    pub digest: Digest,
    pub signature: SignatureBytes,
    pub prepare_seq_num: SeqNum,
    pub view: View,
    pub client_timestamp: Timestamp,
    pub sender: ReplicaId,
}

/// The status record every RPC handler returns.
///
/// `digest` and `signature` authenticate the reply itself. `suspicious` tells the
/// caller that the replica treated the message as evidence of Byzantine behavior, so
/// retrying is pointless.
#[derive(Clone, BorshDeserialize, BorshSerialize)]
pub struct Reply {
    pub digest: Digest,
    pub signature: SignatureBytes,
    pub success: bool,
    pub is_leader: bool,
    pub suspicious: bool,
}

impl Reply {
    /// A reply authenticating `digest` with `signature`, with all flags down.
    pub fn signed(digest: Digest, signature: SignatureBytes) -> Reply {
        Reply {
            digest,
            signature,
            success: false,
            is_leader: false,
            suspicious: false,
        }
    }

    /// An unsigned, unsuccessful reply. Returned when the handler drops the request
    /// without processing it; verification of this reply always fails at the caller.
    pub fn empty() -> Reply {
        Reply {
            digest: Digest::zero(),
            signature: SignatureBytes::empty(),
            success: false,
            is_leader: false,
            suspicious: false,
        }
    }
}

/// A signed declaration that the sender no longer trusts view `view` to make
/// progress. The digest covers the view number.
#[derive(Clone, BorshDeserialize, BorshSerialize)]
pub struct SuspectMessage {
    pub kind: MessageKind,
    pub digest: Digest,
    pub signature: SignatureBytes,
    pub view: View,
    pub sender: ReplicaId,
}

/// Sent by each synchronous group member on entering a new view. Carries the sender's
/// whole commit log so the group can reconstruct every decision the previous views
/// committed.
#[derive(Clone, BorshDeserialize, BorshSerialize)]
pub struct ViewChangeMessage {
    pub kind: MessageKind,
    pub digest: Digest,
    pub signature: SignatureBytes,
    pub view: View,
    pub sender: ReplicaId,
    pub commit_log: CommitLog,
}

/// Mutual exchange of collected [`ViewChangeMessage`]s between group members. Sending
/// the full set defends against a sender equivocating towards different receivers.
#[derive(Clone, BorshDeserialize, BorshSerialize)]
pub struct VcFinalMessage {
    pub kind: MessageKind,
    pub digest: Digest,
    pub signature: SignatureBytes,
    pub view: View,
    pub sender: ReplicaId,
    pub vc_set: BTreeMap<Digest, ViewChangeMessage>,
}

/// Sent by the new leader to terminate a view change: the prepare log it rebuilt from
/// the merged commit logs, re-signed under the new view.
#[derive(Clone, BorshDeserialize, BorshSerialize)]
pub struct NewViewMessage {
    pub kind: MessageKind,
    pub digest: Digest,
    pub signature: SignatureBytes,
    pub view: View,
    pub sender: ReplicaId,
    pub prepare_log: PrepareLog,
}

/// Types that carry a digest and a signature over it from a claimed sender.
///
/// [`verify`](Self::verify) checks the signature against the sender's public key. It
/// deliberately does not check that the digest matches the covered fields; handlers
/// recompute the digest themselves, since which fields a digest covers differs per
/// message type.
pub(crate) trait Authenticated {
    /// The digest the sender claims to have signed.
    fn claimed_digest(&self) -> Digest;

    /// The signature over [`claimed_digest`](Self::claimed_digest).
    fn signature_bytes(&self) -> &SignatureBytes;

    /// The replica claiming to have produced the signature.
    fn sender_id(&self) -> ReplicaId;

    /// Check the signature against the claimed sender's public key.
    fn verify(&self, keys: &KeyTable) -> bool {
        keys.verify(
            self.sender_id(),
            &self.claimed_digest(),
            self.signature_bytes(),
        )
    }
}

macro_rules! impl_authenticated {
    ($($msg:ty),*) => {
        $(
            impl Authenticated for $msg {
                fn claimed_digest(&self) -> Digest {
                    self.digest
                }

                fn signature_bytes(&self) -> &SignatureBytes {
                    &self.signature
                }

                fn sender_id(&self) -> ReplicaId {
                    self.sender
                }
            }
        )*
    };
}

impl_authenticated!(
    OrderMessage,
    SuspectMessage,
    ViewChangeMessage,
    VcFinalMessage,
    NewViewMessage
);
