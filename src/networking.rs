/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable point-to-point networking.
//!
//! Main trait: [`Transport`].
//!
//! XPaxos assumes reliable bi-directional channels between all replicas, with an
//! eventually synchronous bound Δ on delivery within the synchronous group. The
//! library does not provide a production transport; it defines the contract and the
//! test suite provides a controllable in-memory implementation.
//!
//! The transport moves [`Rpc`] values by structured copy and must not corrupt them,
//! but it authenticates nothing: end-to-end digests and signatures are checked by the
//! protocol on both request and reply.

use crate::messages::{
    ClientRequest, NewViewMessage, OrderMessage, Reply, SuspectMessage, VcFinalMessage,
    ViewChangeMessage,
};
use crate::state::PrepareEntry;
use crate::types::ReplicaId;

/// A call to one of the RPC handlers a replica or client exposes.
#[derive(Clone)]
pub enum Rpc {
    Replicate(ClientRequest),
    Prepare(PrepareEntry),
    Commit(OrderMessage),
    Suspect(SuspectMessage),
    ViewChange(ViewChangeMessage),
    VcFinal(VcFinalMessage),
    NewView(NewViewMessage),
    ConfirmVc,
}

impl Rpc {
    /// Name of the handler the call is addressed to, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Rpc::Replicate(_) => "Replicate",
            Rpc::Prepare(_) => "Prepare",
            Rpc::Commit(_) => "Commit",
            Rpc::Suspect(_) => "Suspect",
            Rpc::ViewChange(_) => "ViewChange",
            Rpc::VcFinal(_) => "VcFinal",
            Rpc::NewView(_) => "NewView",
            Rpc::ConfirmVc => "ConfirmVc",
        }
    }
}

/// A caller's handle onto the network, bound to one sending endpoint.
///
/// `call` suspends the calling task until the peer's handler returns or the
/// transport gives up; `None` means the call did not reach the peer or no reply
/// arrived within the transport's own timeout, which must not exceed Δ. The handle
/// must be safe to use from any number of tasks concurrently.
pub trait Transport: Clone + Send + Sync + 'static {
    fn call(&self, target: ReplicaId, rpc: Rpc) -> Option<Reply>;
}

/// The receiving side: anything that can be registered on a network and handle calls
/// addressed to it. Implemented by [`Replica`](crate::replica::Replica) and
/// [`Client`](crate::client::Client).
pub trait Service: Send + Sync {
    fn handle(&self, rpc: Rpc) -> Reply;
}
