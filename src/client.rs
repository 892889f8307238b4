/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replicated service's client.
//!
//! XPaxos trusts its client: it is a single process, it stamps proposals with
//! monotonically increasing timestamps, and it keeps at most one proposal
//! outstanding. [`propose`](Client::propose) dispatches the request to every replica
//! in parallel and resolves on the first of three events: a success reply from the
//! current leader, a ConfirmVc from a newly installed leader after a view change, or
//! the local timeout.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::config::Config;
use crate::messages::{ClientRequest, Reply};
use crate::networking::{Rpc, Service, Transport};
use crate::types::{ReplicaId, Timestamp, CLIENT};

/// The client handle. Cloning is cheap; all clones share one timestamp sequence.
pub struct Client<T: Transport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Client {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner<T: Transport> {
    transport: T,
    peers: Vec<ReplicaId>,
    config: Config,

    /// The next proposal's timestamp. Holding this lock for the whole of `propose`
    /// is what serializes proposals.
    next_timestamp: Mutex<Timestamp>,

    /// Where a pending proposal listens for view-change confirmations. `None` when no
    /// proposal is outstanding.
    vc_notify: Mutex<Option<Sender<ProposeOutcome>>>,
}

enum ProposeOutcome {
    Committed,
    ViewChanged,
}

impl<T: Transport> Client<T> {
    pub fn make(transport: T, peers: Vec<ReplicaId>, config: Config) -> Client<T> {
        Client {
            inner: Arc::new(ClientInner {
                transport,
                peers,
                config,
                next_timestamp: Mutex::new(Timestamp::init()),
                vc_notify: Mutex::new(None),
            }),
        }
    }

    /// Propose `operation` for replication. Returns whether the proposal was
    /// confirmed before the client-side timeout; an unconfirmed proposal may still
    /// commit later.
    pub fn propose(&self, operation: &[u8]) -> bool {
        let inner = &self.inner;
        let mut timestamp = inner.next_timestamp.lock().unwrap();
        let request = ClientRequest::new(*timestamp, operation.to_vec(), CLIENT);

        let (outcome_tx, outcome_rx) = mpsc::channel();
        *inner.vc_notify.lock().unwrap() = Some(outcome_tx.clone());

        for peer in inner.peers.iter().copied() {
            if peer.is_client() {
                continue;
            }
            let inner = Arc::clone(inner);
            let request = request.clone();
            let outcome_tx = outcome_tx.clone();
            thread::spawn(move || {
                log::debug!("Replicate: from client to replica {}", peer);
                if let Some(reply) = inner.transport.call(peer, Rpc::Replicate(request)) {
                    // Only the leader answers with success.
                    if reply.success {
                        let _ = outcome_tx.send(ProposeOutcome::Committed);
                    }
                }
            });
        }
        drop(outcome_tx);

        let outcome = if inner.config.wait || inner.config.propose_timeout.is_zero() {
            outcome_rx.recv().ok()
        } else {
            outcome_rx.recv_timeout(inner.config.propose_timeout).ok()
        };
        *inner.vc_notify.lock().unwrap() = None;

        match &outcome {
            Some(ProposeOutcome::Committed) => {
                log::info!("client committed request {}", *timestamp)
            }
            Some(ProposeOutcome::ViewChanged) => {
                log::info!("client committed request {} after view change", *timestamp)
            }
            None => log::info!("timeout: client proposal {}", *timestamp),
        }

        *timestamp += 1;
        outcome.is_some()
    }
}

impl<T: Transport> Service for Client<T> {
    fn handle(&self, rpc: Rpc) -> Reply {
        if let Rpc::ConfirmVc = rpc {
            // Deliberately does not take `next_timestamp`: the proposing task holds
            // that lock while it waits for this very notification.
            if let Some(notify) = self.inner.vc_notify.lock().unwrap().as_ref() {
                let _ = notify.send(ProposeOutcome::ViewChanged);
            }
        }
        Reply::empty()
    }
}
