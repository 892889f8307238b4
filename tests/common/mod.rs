//! The shared harness for the XPaxos test suite: builds a cluster of replicas plus
//! the client on a [controllable in-memory network](network::SimNetwork), and checks
//! the agreement invariants the protocol promises.

// Not every test binary exercises every knob of the harness.
#![allow(dead_code)]

pub mod logging;
pub mod network;

use log::LevelFilter;
use std::collections::BTreeMap;
use std::sync::Arc;

use xpaxos::crypto::{digest_of, KeyTable, Keypair};
use xpaxos::state::CommitLog;
use xpaxos::types::{Digest, ReplicaId, View, CLIENT};
use xpaxos::{Client, Config, Persister, Replica};

use self::network::{SimEndpoint, SimNetwork};

/// Key size for test clusters: small enough that debug builds generate keys quickly,
/// the minimum at which PKCS#1 v1.5 over SHA-256 still fits.
const TEST_KEY_BITS: usize = 512;

/// A client plus a full set of replicas on one simulated network. Endpoint ids follow
/// the protocol's convention: the client is 0, replicas are 1 onwards.
pub struct Cluster {
    pub net: SimNetwork,
    pub client: Client<SimEndpoint>,
    servers: Vec<Replica<SimEndpoint>>,
}

impl Cluster {
    /// Build and connect a cluster of `endpoints - 1` replicas and one client.
    pub fn new(endpoints: usize, unreliable: bool) -> Cluster {
        logging::setup_logger(LevelFilter::Info);

        let config = Config {
            key_bits: TEST_KEY_BITS,
            ..Config::default()
        };
        let net = SimNetwork::new(config.delta);
        net.reliable(!unreliable);

        let peers: Vec<ReplicaId> = (0..endpoints as u64).map(ReplicaId::new).collect();

        let keypairs: Vec<Keypair> = (1..endpoints)
            .map(|_| Keypair::generate(config.key_bits))
            .collect();
        let mut public_keys = BTreeMap::new();
        for (i, keypair) in keypairs.iter().enumerate() {
            public_keys.insert(ReplicaId::new(i as u64 + 1), keypair.public());
        }
        let keys = KeyTable::new(public_keys);

        let mut servers = Vec::new();
        for (i, keypair) in keypairs.into_iter().enumerate() {
            let id = ReplicaId::new(i as u64 + 1);
            let replica = Replica::make(
                net.endpoint(id),
                peers.clone(),
                id,
                Arc::new(Persister::new()),
                keypair,
                keys.clone(),
                config.clone(),
            );
            net.add_server(id, Arc::new(replica.clone()));
            servers.push(replica);
        }

        let client = Client::make(net.endpoint(CLIENT), peers, config);
        net.add_server(CLIENT, Arc::new(client.clone()));

        Cluster {
            net,
            client,
            servers,
        }
    }

    pub fn server(&self, id: u64) -> &Replica<SimEndpoint> {
        &self.servers[(id - 1) as usize]
    }

    pub fn server_ids(&self) -> std::ops::RangeInclusive<u64> {
        1..=self.servers.len() as u64
    }

    pub fn num_servers(&self) -> usize {
        self.servers.len()
    }

    /// The highest view any replica is in. Panics unless a majority of all endpoints
    /// agrees on it, which is the precondition for every other check.
    pub fn current_view(&self) -> View {
        let mut current = View::new(0);
        let mut num_current = 0;
        for id in self.server_ids() {
            let view = self.server(id).view();
            if view > current {
                current = view;
                num_current = 1;
            } else if view == current {
                num_current += 1;
            }
        }
        let majority = (self.num_servers() + 2) / 2;
        assert!(
            num_current >= majority,
            "no majority of replicas agrees on view {current}"
        );
        current
    }

    /// Drive no-op proposals until one commits, proving that some synchronous group
    /// is live and synchronized. Fault tests call this before comparing state.
    pub fn settle(&self) {
        for _ in 0..20 {
            if self.client.propose(&[]) {
                return;
            }
        }
        panic!("cluster failed to settle on a working view");
    }

    /// Run all of the agreement checks.
    pub fn check_invariants(&self) {
        self.compare_prepare_seq_nums();
        self.compare_execute_seq_nums();
        self.compare_prepare_logs();
        self.compare_commit_logs();
    }

    /// Replicas of the current view's synchronous group must agree on how far the
    /// order has been assigned.
    pub fn compare_prepare_seq_nums(&self) {
        let current = self.current_view();
        self.for_each_group_pair(current, |a, b| {
            assert_eq!(
                a.prepare_seq_num(),
                b.prepare_seq_num(),
                "prepare sequence numbers diverge in view {current}"
            );
        });
    }

    /// Replicas of the current view's synchronous group must agree on how far the
    /// order has been executed.
    pub fn compare_execute_seq_nums(&self) {
        let current = self.current_view();
        self.for_each_group_pair(current, |a, b| {
            assert_eq!(
                a.execute_seq_num(),
                b.execute_seq_num(),
                "execute sequence numbers diverge in view {current}"
            );
        });
    }

    /// Replicas of the current view's synchronous group must hold identical prepare
    /// logs.
    pub fn compare_prepare_logs(&self) {
        let current = self.current_view();
        self.for_each_group_pair(current, |a, b| {
            assert_eq!(
                digest_of(&a.prepare_log()),
                digest_of(&b.prepare_log()),
                "prepare logs diverge in view {current}"
            );
        });
    }

    /// Replicas of the current view's synchronous group must agree on every ordering
    /// decision in their commit logs: same request, same position, same view marker.
    /// (The per-entry signature evidence is each replica's own and is not compared.)
    pub fn compare_commit_logs(&self) {
        let current = self.current_view();
        self.for_each_group_pair(current, |a, b| {
            assert_eq!(
                commit_fingerprint(&a.commit_log()),
                commit_fingerprint(&b.commit_log()),
                "commit logs diverge in view {current}"
            );
        });
    }

    /// Visit every pair of replicas where both sit in `view` and the first considers
    /// the second a member of its synchronous group.
    fn for_each_group_pair(
        &self,
        view: View,
        check: impl Fn(&Replica<SimEndpoint>, &Replica<SimEndpoint>),
    ) {
        for i in self.server_ids() {
            let a = self.server(i);
            if a.view() != view {
                continue;
            }
            for peer in a.synchronous_group() {
                let b = self.server(peer.int());
                if peer.int() != i && b.view() == view {
                    check(a, b);
                }
            }
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for server in &self.servers {
            server.kill();
        }
    }
}

/// The ordering decisions a commit log has accepted, with the signature evidence
/// stripped: one `(request digest, sequence number, view)` triple per entry.
pub fn commit_fingerprint(log: &CommitLog) -> Digest {
    let decisions: Vec<_> = log
        .entries()
        .iter()
        .map(|entry| (entry.message.digest, entry.message.prepare_seq_num, entry.view))
        .collect();
    digest_of(&decisions)
}
