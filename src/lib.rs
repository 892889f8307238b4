/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of XPaxos, a state machine replication protocol for the
//! Cross Fault-Tolerance (XFT) model.
//!
//! XFT sits between crash fault-tolerance and Byzantine fault-tolerance: with `2t + 1`
//! replicas, the protocol stays safe and live as long as no more than `t` replicas are
//! faulty *or* partitioned from the synchronous majority at the same time. A machine
//! may be Byzantine, or cut off, but the adversary does not get both at once. Under
//! that assumption XPaxos orders requests with crash-fault-tolerant message counts
//! while keeping a full cryptographically signed message trail.
//!
//! Each view deterministically selects a synchronous group of `t + 1` replicas, leader
//! included; only they make progress in the common case. When anything casts doubt on
//! the current view (a timeout, a bad signature), the replicas rotate to the next one
//! and merge their committed histories.
//!
//! The crate is transport-agnostic: plug in anything that implements
//! [`Transport`](networking::Transport). The test suite drives whole replica sets over
//! a controllable in-memory network with fault injection.

pub mod client;

pub mod config;

pub mod crypto;

pub mod messages;

pub mod networking;

pub mod persistence;

pub mod replica;

pub mod roles;

pub mod state;

pub mod types;

pub(crate) mod logging;

pub(crate) mod ordering;

pub(crate) mod view_change;

// Re-exports
pub use client::Client;
pub use config::Config;
pub use persistence::Persister;
pub use replica::Replica;
