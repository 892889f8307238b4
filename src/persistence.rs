/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The persistence collaborator: an object that holds a replica's state blob.
//!
//! The replica saves a fresh blob on every sequence-number or log mutation and treats
//! the contents as opaque. This in-memory implementation exists so a harness can
//! snapshot state across a simulated crash; nothing in the protocol's correctness
//! depends on what is stored.

use std::sync::Mutex;

pub struct Persister {
    state: Mutex<Vec<u8>>,
}

impl Persister {
    pub fn new() -> Persister {
        Persister {
            state: Mutex::new(Vec::new()),
        }
    }

    /// Replace the stored blob.
    pub fn save(&self, blob: Vec<u8>) {
        *self.state.lock().unwrap() = blob;
    }

    /// Read back the last saved blob.
    pub fn read(&self) -> Vec<u8> {
        self.state.lock().unwrap().clone()
    }

    /// An independent persister holding a copy of the current blob. Harnesses use this
    /// to isolate a restarted instance from its predecessor.
    pub fn copy(&self) -> Persister {
        Persister {
            state: Mutex::new(self.read()),
        }
    }
}

impl Default for Persister {
    fn default() -> Persister {
        Persister::new()
    }
}
