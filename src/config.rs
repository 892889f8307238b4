/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Construction-time configuration for replicas and clients.

use std::time::Duration;

/// Parameters fixed when a replica or client is created. Immutable afterwards.
#[derive(Clone)]
pub struct Config {
    /// The network time bound Δ: the transport is expected to deliver a call and its
    /// reply within Δ under synchrony. Every protocol timeout is a multiple of this.
    pub delta: Duration,

    /// How long a client's `propose` waits before giving up. A zero duration means
    /// wait forever.
    pub propose_timeout: Duration,

    /// When set, the client never times out, regardless of `propose_timeout`.
    pub wait: bool,

    /// RSA modulus size for freshly generated keys.
    pub key_bits: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            delta: Duration::from_millis(100),
            propose_timeout: Duration::from_millis(5000),
            wait: false,
            key_bits: 1024,
        }
    }
}

impl Config {
    /// The wait window used by every protocol phase: three network round-trip bounds.
    pub(crate) fn phase_window(&self) -> Duration {
        self.delta * 3
    }
}
