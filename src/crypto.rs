/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives: message digests, signing keys, and the per-replica table
//! of public keys.
//!
//! Digests are SHA-256 over the borsh encoding of a value. Signatures are RSA
//! PKCS#1 v1.5 over a 32-byte digest, which is deterministic: signing the same digest
//! with the same key always yields the same bytes. Key material is fixed at
//! construction and read-only afterwards, so none of the types here need locking.

use borsh::BorshSerialize;
use rand::rngs::OsRng;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;

use crate::types::{Digest, ReplicaId, SignatureBytes};

/// Compute the SHA-256 digest of the canonical encoding of `value`.
pub fn digest_of<T: BorshSerialize>(value: &T) -> Digest {
    let bytes = value
        .try_to_vec()
        .expect("borsh encoding of an in-memory value cannot fail");
    Digest::new(Sha256::digest(&bytes).into())
}

/// A replica's RSA keypair, wrapped with a [convenience method](Self::sign) for signing
/// digests and a [getter](Self::public) for the public half.
#[derive(Clone)]
pub struct Keypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl Keypair {
    /// Generate a fresh keypair with a modulus of `bits` bits.
    ///
    /// # Panics
    ///
    /// Aborts if the operating system RNG fails or `bits` is not a usable RSA key size.
    /// A replica without a working key cannot participate at all, so there is nothing
    /// to recover to.
    pub fn generate(bits: usize) -> Keypair {
        let private =
            RsaPrivateKey::new(&mut OsRng, bits).expect("RSA key generation must succeed");
        let public = RsaPublicKey::from(&private);
        Keypair { private, public }
    }

    /// Sign a 32-byte digest. Signing never fails with a well-formed key.
    pub fn sign(&self, digest: &Digest) -> SignatureBytes {
        let signature = self
            .private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest.bytes())
            .expect("PKCS#1 v1.5 signing of a 32-byte digest cannot fail");
        SignatureBytes::new(signature)
    }

    pub fn public(&self) -> RsaPublicKey {
        self.public.clone()
    }
}

/// Table of every endpoint's public key, indexed by [`ReplicaId`]. Shared read-only by
/// all of a replica's tasks.
#[derive(Clone)]
pub struct KeyTable {
    keys: BTreeMap<ReplicaId, RsaPublicKey>,
}

impl KeyTable {
    pub fn new(keys: BTreeMap<ReplicaId, RsaPublicKey>) -> KeyTable {
        KeyTable { keys }
    }

    /// Check that `signature` is `sender`'s PKCS#1 v1.5 signature over `digest`.
    /// Returns `false` on any failure, including an unknown `sender`.
    pub fn verify(&self, sender: ReplicaId, digest: &Digest, signature: &SignatureBytes) -> bool {
        match self.keys.get(&sender) {
            Some(key) => key
                .verify(
                    Pkcs1v15Sign::new::<Sha256>(),
                    &digest.bytes(),
                    signature.bytes(),
                )
                .is_ok(),
            None => false,
        }
    }
}
