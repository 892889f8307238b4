/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that determine which roles a replica plays in a given view: whether it
//! leads, and whether it belongs to the view's synchronous group.
//!
//! Both are pure functions of the view number and the endpoint table, so every replica
//! that agrees on the view agrees on the roles without any communication.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;

use crate::types::{ReplicaId, View};

/// The leader of `view`: replicas take turns in round-robin order of their ids.
///
/// `peers` is the full endpoint table, client included.
pub fn view_leader(view: View, peers: &[ReplicaId]) -> ReplicaId {
    let num_replicas = (peers.len() - 1) as u64;
    ReplicaId::new((view.int() - 1) % num_replicas + 1)
}

/// The synchronous group of `view`: the leader plus `t` further replicas drawn from a
/// permutation seeded with the view number, `t + 1` members in total.
///
/// Returns the empty set if `me` is not a member, since a replica outside the group
/// takes no part in the view at all.
pub fn synchronous_group(view: View, peers: &[ReplicaId], me: ReplicaId) -> BTreeSet<ReplicaId> {
    let leader = view_leader(view, peers);
    let tolerated = (peers.len() - 1) / 2;

    let mut group = BTreeSet::new();
    group.insert(leader);

    let mut shuffled = peers.to_vec();
    shuffled.shuffle(&mut ChaCha8Rng::seed_from_u64(view.int()));

    for peer in shuffled {
        if group.len() > tolerated {
            break;
        }
        if !peer.is_client() && peer != leader {
            group.insert(peer);
        }
    }

    if group.contains(&me) {
        group
    } else {
        BTreeSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> Vec<ReplicaId> {
        (0..n as u64).map(ReplicaId::new).collect()
    }

    #[test]
    fn leader_rotates_over_every_replica() {
        let peers = peers(4);
        let leaders: Vec<ReplicaId> = (1..=6)
            .map(|v| view_leader(View::new(v), &peers))
            .collect();
        assert_eq!(
            leaders,
            [1u64, 2, 3, 1, 2, 3].map(ReplicaId::new).to_vec()
        );
    }

    #[test]
    fn group_has_majority_size_and_contains_leader() {
        for n in [4, 6, 10] {
            let peers = peers(n);
            for v in 1..=20 {
                let view = View::new(v);
                let leader = view_leader(view, &peers);
                let group = synchronous_group(view, &peers, leader);
                assert_eq!(group.len(), (n - 1) / 2 + 1);
                assert!(group.contains(&leader));
                assert!(!group.contains(&crate::types::CLIENT));
            }
        }
    }

    #[test]
    fn group_is_identical_on_every_member() {
        let peers = peers(10);
        for v in 1..=20 {
            let view = View::new(v);
            let leader = view_leader(view, &peers);
            let reference = synchronous_group(view, &peers, leader);
            for member in &reference {
                assert_eq!(synchronous_group(view, &peers, *member), reference);
            }
        }
    }

    #[test]
    fn non_members_see_an_empty_group() {
        let peers = peers(10);
        for v in 1..=20 {
            let view = View::new(v);
            let leader = view_leader(view, &peers);
            let group = synchronous_group(view, &peers, leader);
            for peer in &peers {
                if !peer.is_client() && !group.contains(peer) {
                    assert!(synchronous_group(view, &peers, *peer).is_empty());
                }
            }
        }
    }
}
