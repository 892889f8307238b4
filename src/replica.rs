/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that [create](Replica::make) a replica, as well as [the type](Replica)
//! that keeps it alive.
//!
//! A replica is a single logical actor: one mutex-guarded [state record](ReplicaState)
//! that every RPC handler and every internal task goes through. Handlers run on the
//! transport's threads; the short-lived tasks a handler spawns (dispatching PREPAREs,
//! retransmitting COMMITs, broadcasting suspicions) share the replica through an
//! [`Arc`]. No task holds the mutex across a transport call or a timed wait; after
//! every such suspension it re-acquires the mutex and checks that the view has not
//! moved on before touching anything.
//!
//! The protocol itself lives in two sibling modules:
//! [`ordering`](crate::ordering) for the common case and
//! [`view_change`](crate::view_change) for leader rotation.

use borsh::BorshSerialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::config::Config;
use crate::crypto::{KeyTable, Keypair};
use crate::messages::{Reply, SuspectMessage, ViewChangeMessage};
use crate::networking::{Rpc, Service, Transport};
use crate::persistence::Persister;
use crate::roles::synchronous_group;
use crate::state::{CommitLog, PrepareLog};
use crate::types::{Digest, ReplicaId, SeqNum, View};

/// An XPaxos replica. Cloning the handle is cheap; all clones refer to the same
/// replica.
pub struct Replica<T: Transport> {
    pub(crate) inner: Arc<ReplicaInner<T>>,
}

impl<T: Transport> Clone for Replica<T> {
    fn clone(&self) -> Self {
        Replica {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Everything a replica's tasks share: immutable identity and key material, the
/// transport, and the mutex-guarded protocol state.
pub(crate) struct ReplicaInner<T: Transport> {
    pub(crate) id: ReplicaId,
    pub(crate) peers: Vec<ReplicaId>,
    pub(crate) config: Config,
    pub(crate) keypair: Keypair,
    pub(crate) keys: KeyTable,
    pub(crate) transport: T,
    pub(crate) persister: Arc<Persister>,
    pub(crate) dead: AtomicBool,
    pub(crate) state: Mutex<ReplicaState>,

    /// Back-reference the replica's tasks use to hand a strong handle to the tasks
    /// they spawn.
    weak_self: Weak<ReplicaInner<T>>,
}

/// The mutable protocol state of one replica.
pub(crate) struct ReplicaState {
    pub(crate) view: View,
    pub(crate) prepare_seq_num: SeqNum,
    pub(crate) execute_seq_num: SeqNum,
    pub(crate) prepare_log: PrepareLog,
    pub(crate) commit_log: CommitLog,

    /// The members of the current view's synchronous group, or empty if this replica
    /// is not one of them.
    pub(crate) synchronous_group: BTreeSet<ReplicaId>,

    // Collection state for the view change in progress, if any.
    pub(crate) suspect_set: BTreeMap<Digest, SuspectMessage>,
    pub(crate) vc_set: BTreeMap<Digest, ViewChangeMessage>,
    pub(crate) received_vc_final: BTreeMap<ReplicaId, BTreeMap<Digest, ViewChangeMessage>>,
    pub(crate) vc_in_progress: bool,

    /// True once some task has taken responsibility for moving the view change past
    /// the collection phase; tasks still waiting on `net_deadline` then stand down.
    pub(crate) net_flag: bool,
    /// When the collection phase of the current view change expires. Armed on entering
    /// the view.
    pub(crate) net_deadline: Option<Instant>,
    /// True once a NewView for the current view has arrived, disarming the view-change
    /// watchdog.
    pub(crate) vc_flag: bool,

    /// The last view this replica issued its own Suspect for. A replica suspects each
    /// view at most once.
    pub(crate) last_suspect_view: Option<View>,
}

impl<T: Transport> Replica<T> {
    /// Create a replica with identity `id` on `transport`.
    ///
    /// `peers` is the full endpoint table, client at index 0. `keys` must hold a
    /// public key for every endpoint the replica will ever verify a message from.
    pub fn make(
        transport: T,
        peers: Vec<ReplicaId>,
        id: ReplicaId,
        persister: Arc<Persister>,
        keypair: Keypair,
        keys: KeyTable,
        config: Config,
    ) -> Replica<T> {
        let view = View::init();
        let state = ReplicaState {
            view,
            prepare_seq_num: SeqNum::init(),
            execute_seq_num: SeqNum::init(),
            prepare_log: PrepareLog::new(),
            commit_log: CommitLog::new(),
            synchronous_group: synchronous_group(view, &peers, id),
            suspect_set: BTreeMap::new(),
            vc_set: BTreeMap::new(),
            received_vc_final: BTreeMap::new(),
            vc_in_progress: false,
            net_flag: false,
            net_deadline: None,
            vc_flag: false,
            last_suspect_view: None,
        };

        let inner = Arc::new_cyclic(|weak_self| ReplicaInner {
            id,
            peers,
            config,
            keypair,
            keys,
            transport,
            persister,
            dead: AtomicBool::new(false),
            state: Mutex::new(state),
            weak_self: weak_self.clone(),
        });
        inner.read_persist(inner.persister.read());

        Replica { inner }
    }

    /// Tell the replica's tasks to stand down. Calls arriving afterwards get an
    /// unsigned, unsuccessful reply.
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::Relaxed);
    }

    // Read-only snapshots of the replica's state, for tests and tooling.

    pub fn view(&self) -> View {
        self.inner.state.lock().unwrap().view
    }

    pub fn prepare_seq_num(&self) -> SeqNum {
        self.inner.state.lock().unwrap().prepare_seq_num
    }

    pub fn execute_seq_num(&self) -> SeqNum {
        self.inner.state.lock().unwrap().execute_seq_num
    }

    pub fn prepare_log(&self) -> PrepareLog {
        self.inner.state.lock().unwrap().prepare_log.clone()
    }

    pub fn commit_log(&self) -> CommitLog {
        self.inner.state.lock().unwrap().commit_log.clone()
    }

    pub fn synchronous_group(&self) -> BTreeSet<ReplicaId> {
        self.inner.state.lock().unwrap().synchronous_group.clone()
    }

    pub fn vc_in_progress(&self) -> bool {
        self.inner.state.lock().unwrap().vc_in_progress
    }
}

impl<T: Transport> Service for Replica<T> {
    fn handle(&self, rpc: Rpc) -> Reply {
        if self.inner.is_dead() {
            return Reply::empty();
        }
        match rpc {
            Rpc::Replicate(request) => self.inner.replicate(request),
            Rpc::Prepare(entry) => self.inner.prepare(entry),
            Rpc::Commit(message) => self.inner.commit(message),
            Rpc::Suspect(message) => self.inner.on_suspect(message),
            Rpc::ViewChange(message) => self.inner.on_view_change(message),
            Rpc::VcFinal(message) => self.inner.on_vc_final(message),
            Rpc::NewView(message) => self.inner.on_new_view(message),
            // Replicas do not take part in client notification.
            Rpc::ConfirmVc => Reply::empty(),
        }
    }
}

impl<T: Transport> ReplicaInner<T> {
    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    /// A strong handle to this replica, for moving into a spawned task.
    pub(crate) fn arc(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("a running task keeps the replica alive")
    }

    /// Hand the persister a fresh state blob. Called on every sequence-number or log
    /// mutation, with the state lock held.
    pub(crate) fn persist(&self, state: &ReplicaState) {
        let blob = (state.view, state.prepare_seq_num, state.execute_seq_num)
            .try_to_vec()
            .expect("borsh encoding of replica counters cannot fail");
        self.persister.save(blob);
    }

    /// Restoration from a previously saved blob. The blob format only records the
    /// counters, not the logs, so there is nothing safe to restore yet; the saved
    /// state is accepted and set aside.
    fn read_persist(&self, _blob: Vec<u8>) {}
}
