/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Helpers for rendering protocol values in log messages.
//!
//! XPaxos logs through the [log](https://docs.rs/log/latest/log/) crate. Protocol
//! occurrences that an operator would care about (timeouts, suspicions, view
//! installations) are logged at `info`; per-message traffic at `debug`. To see the
//! messages, set up a logging implementation and pick a level filter.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::types::Digest;

/// The first seven characters of the Base64 encoding of a digest: short enough to scan
/// in a log line, long enough to tell entries apart.
pub(crate) fn short_digest(digest: &Digest) -> String {
    let encoded = STANDARD_NO_PAD.encode(digest.bytes());
    encoded.chars().take(7).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_digest_is_seven_chars() {
        assert_eq!(short_digest(&Digest::zero()).len(), 7);
        assert_eq!(short_digest(&Digest::new([255; 32])).len(), 7);
    }
}
