/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected, but have no active behavior.
//!
//! These follow the newtype pattern: each wraps a primitive that identifies or counts
//! something in the protocol, and the API for using the wrapped value is defined here.
//! All of them serialize with [borsh], which gives every value a single canonical
//! encoding, so the same value always produces the same [digest](crate::crypto::digest_of).

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::{Add, AddAssign};

/// Identifier of a process on the network: either the client (index 0) or one of the
/// XPaxos replicas (indices 1 onwards).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ReplicaId(u64);

/// The client always sits at index 0 of the endpoint table.
pub const CLIENT: ReplicaId = ReplicaId(0);

impl ReplicaId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub fn is_client(&self) -> bool {
        *self == CLIENT
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The current configuration epoch. Determines the leader and the synchronous group.
/// Starts at 1 and only ever grows.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct View(u64);

impl View {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The view every replica starts its life in.
    pub const fn init() -> Self {
        Self(1)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for View {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for View {
    type Output = View;

    fn add(self, rhs: u64) -> Self::Output {
        View(self.0.add(rhs))
    }
}

/// Position of a request in the leader-assigned order. The first request ordered in a
/// log has sequence number 1.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SeqNum(u64);

impl SeqNum {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Index of this sequence number's entry in a log. Must not be called on
    /// [`SeqNum::init`].
    pub const fn index(&self) -> usize {
        (self.0 - 1) as usize
    }
}

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: u64) -> Self::Output {
        SeqNum(self.0.add(rhs))
    }
}

impl AddAssign<u64> for SeqNum {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// A client-assigned logical timestamp. The client stamps each proposal with a strictly
/// larger timestamp than the previous one, which is what replicas deduplicate on.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AddAssign<u64> for Timestamp {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// A SHA-256 digest over the canonical (borsh) encoding of a value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zeroes digest, used in replies that carry no signed payload.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An RSA PKCS#1 v1.5 signature in bytes. The length depends on the key size the
/// replica set was configured with.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes(Vec<u8>);

impl SignatureBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// A signature-shaped value that no key has produced. Verification of it always fails.
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}
