//! Signing and hashing for protocol messages.
//!
//! Agreement-phase messages travel under a shared-key HMAC authenticator,
//! client requests and view-change evidence under ECDSA signatures that any
//! future recipient can check. Hashing and signing both go through
//! [`DigestHash`], which traverses a message's fields in declaration order
//! with fixed-width big-endian integers, so a digest is computed over the
//! same canonical byte sequence on every replica.

use std::{collections::HashMap, hash::Hash, mem::take};

use hmac::{Hmac, Mac};
use k256::{
    ecdsa::signature::{DigestSigner, DigestVerifier},
    sha2::{Digest as _, Sha256},
};
use serde::{Deserialize, Serialize};

use super::{ClientIndex, ReplicaIndex};

pub type Digest = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signed<M> {
    pub inner: M,
    pub signature: Signature,
}

impl<M> std::ops::Deref for Signed<M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signature {
    SimulatedPrivate,
    SimulatedPublic,
    K256(k256::ecdsa::Signature),
    Hmac([u8; 32]),
}

impl<M: DigestHash> Hash for Signed<M> {
    fn hash<H>(&self, hasher: &mut H)
    where
        H: std::hash::Hasher,
    {
        self.inner.hash(hasher);
        match &self.signature {
            Signature::SimulatedPrivate | Signature::SimulatedPublic => {}
            Signature::K256(signature) => hasher.write(&signature.to_bytes()),
            Signature::Hmac(codes) => hasher.write(codes),
        }
    }
}

pub enum Hasher {
    Sha256(Sha256),
    Hmac(Hmac<Sha256>),
    Bytes(Vec<u8>),
}

impl Hasher {
    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        match self {
            Self::Sha256(hasher) => hasher.update(data),
            Self::Hmac(hasher) => hasher.update(data.as_ref()),
            Self::Bytes(hasher) => hasher.extend(data.as_ref()),
        }
    }

    pub fn chain_update(self, data: impl AsRef<[u8]>) -> Self {
        match self {
            Self::Sha256(hasher) => Self::Sha256(hasher.chain_update(data)),
            Self::Hmac(hasher) => Self::Hmac(hasher.chain_update(data)),
            Self::Bytes(hasher) => Self::Bytes([&hasher, data.as_ref()].concat()),
        }
    }
}

// fixed big-endian widths for every integer, `usize` pinned to eight bytes,
// so the traversal is identical across replicas and architectures
impl std::hash::Hasher for Hasher {
    fn write(&mut self, buf: &[u8]) {
        self.update(buf)
    }

    fn write_u8(&mut self, value: u8) {
        self.update([value])
    }

    fn write_u16(&mut self, value: u16) {
        self.update(value.to_be_bytes())
    }

    fn write_u32(&mut self, value: u32) {
        self.update(value.to_be_bytes())
    }

    fn write_u64(&mut self, value: u64) {
        self.update(value.to_be_bytes())
    }

    fn write_u128(&mut self, value: u128) {
        self.update(value.to_be_bytes())
    }

    fn write_usize(&mut self, value: usize) {
        self.update((value as u64).to_be_bytes())
    }

    fn write_i8(&mut self, value: i8) {
        self.write_u8(value as _)
    }

    fn write_i16(&mut self, value: i16) {
        self.write_u16(value as _)
    }

    fn write_i32(&mut self, value: i32) {
        self.write_u32(value as _)
    }

    fn write_i64(&mut self, value: i64) {
        self.write_u64(value as _)
    }

    fn write_i128(&mut self, value: i128) {
        self.write_u128(value as _)
    }

    fn write_isize(&mut self, value: isize) {
        self.write_usize(value as _)
    }

    fn finish(&self) -> u64 {
        unimplemented!()
    }
}

pub trait DigestHash {
    fn hash(&self, hasher: &mut impl std::hash::Hasher);
}

impl<T: Hash> DigestHash for T {
    fn hash(&self, hasher: &mut impl std::hash::Hasher) {
        Hash::hash(self, hasher)
    }
}

impl Hasher {
    pub fn sha256(message: &impl DigestHash) -> Sha256 {
        let mut digest = Sha256::new();
        Self::sha256_update(message, &mut digest);
        digest
    }

    pub fn sha256_update(message: &impl DigestHash, digest: &mut Sha256) {
        let mut hasher = Self::Sha256(digest.clone());
        message.hash(&mut hasher);
        if let Self::Sha256(new_digest) = hasher {
            *digest = new_digest
        } else {
            unreachable!()
        };
    }

    pub fn hmac_update(message: &impl DigestHash, hmac: &mut Hmac<Sha256>) {
        let mut hasher = Self::Hmac(hmac.clone());
        message.hash(&mut hasher);
        if let Self::Hmac(new_hmac) = hasher {
            *hmac = new_hmac
        } else {
            unreachable!()
        };
    }

    pub fn bytes(message: &impl DigestHash) -> Vec<u8> {
        let mut buf = Vec::new();
        Self::bytes_update(message, &mut buf);
        buf
    }

    pub fn bytes_update(message: &impl DigestHash, buf: &mut Vec<u8>) {
        let mut hasher = Self::Bytes(take(buf));
        message.hash(&mut hasher);
        if let Self::Bytes(new_buf) = hasher {
            *buf = new_buf
        } else {
            unreachable!()
        };
    }
}

/// Digest over the canonical encoding of a message.
pub fn digest(message: &impl DigestHash) -> Digest {
    Hasher::sha256(message).finalize().into()
}

#[derive(Debug, Clone)]
pub enum Signer {
    Simulated,
    Standard(Box<StandardSigner>),
}

#[derive(Debug, Clone)]
pub struct StandardSigner {
    signing_key: Option<k256::ecdsa::SigningKey>,
    hmac: Hmac<Sha256>,
}

pub fn replica_signing_key(index: ReplicaIndex) -> k256::ecdsa::SigningKey {
    hardcoded_k256(&format!("replica-{index}"))
}

pub fn client_signing_key(index: ClientIndex) -> k256::ecdsa::SigningKey {
    hardcoded_k256(&format!("client-{index}"))
}

fn hardcoded_k256(k: &str) -> k256::ecdsa::SigningKey {
    let mut buf = [0; 32];
    buf[..k.as_bytes().len()].copy_from_slice(k.as_bytes());
    k256::ecdsa::SigningKey::from_slice(&buf).unwrap()
}

// simplified symmetrical key setup, every host authenticates under one
// shared key and any host can check any authenticator
pub fn hardcoded_hmac() -> Hmac<Sha256> {
    Hmac::new_from_slice("shared".as_bytes()).unwrap()
}

impl Signer {
    pub fn new_standard(signing_key: impl Into<Option<k256::ecdsa::SigningKey>>) -> Self {
        Self::Standard(Box::new(StandardSigner {
            signing_key: signing_key.into(),
            hmac: hardcoded_hmac(),
        }))
    }

    pub fn sign_public<M>(&self, message: M) -> Signed<M>
    where
        M: DigestHash,
    {
        match self {
            Self::Simulated => Signed {
                inner: message,
                signature: Signature::SimulatedPublic,
            },
            Self::Standard(signer) => signer.sign_public(message),
        }
    }

    pub fn sign_private<M>(&self, message: M) -> Signed<M>
    where
        M: DigestHash,
    {
        match self {
            Self::Simulated => Signed {
                inner: message,
                signature: Signature::SimulatedPrivate,
            },
            Self::Standard(signer) => signer.sign_private(message),
        }
    }
}

impl StandardSigner {
    fn sign_public<M>(&self, message: M) -> Signed<M>
    where
        M: DigestHash,
    {
        let signing_key = self.signing_key.as_ref().unwrap();
        let digest = Hasher::sha256(&message);
        Signed {
            signature: Signature::K256(signing_key.sign_digest(digest)),
            inner: message,
        }
    }

    fn sign_private<M>(&self, message: M) -> Signed<M>
    where
        M: DigestHash,
    {
        let mut hmac = self.hmac.clone();
        Hasher::hmac_update(&message, &mut hmac);
        Signed {
            signature: Signature::Hmac(hmac.finalize().into_bytes().into()),
            inner: message,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Verifier {
    Nop,
    Simulated,
    Standard(Box<StandardVerifier>),
}

#[derive(Debug, Clone)]
pub struct StandardVerifier {
    replica_keys: HashMap<ReplicaIndex, k256::ecdsa::VerifyingKey>,
    client_keys: HashMap<ClientIndex, k256::ecdsa::VerifyingKey>,
    hmac: Hmac<Sha256>,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum Invalid {
    #[error("invalid signature")]
    Public,
    #[error("invalid authenticator")]
    Private,
    #[error("signature variant mismatch")]
    Variant,
    #[error("unknown signer")]
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOf {
    Replica(ReplicaIndex),
    Client(ClientIndex),
}

impl Verifier {
    pub fn new_standard(num_replica: usize, num_client: usize) -> Self {
        Self::Standard(Box::new(StandardVerifier {
            replica_keys: (0..num_replica as ReplicaIndex)
                .map(|index| (index, *replica_signing_key(index).verifying_key()))
                .collect(),
            client_keys: (0..num_client as ClientIndex)
                .map(|index| (index, *client_signing_key(index).verifying_key()))
                .collect(),
            hmac: hardcoded_hmac(),
        }))
    }

    pub fn verify_replica<M>(&self, message: &Signed<M>, index: ReplicaIndex) -> Result<(), Invalid>
    where
        M: DigestHash,
    {
        self.verify(message, KeyOf::Replica(index))
    }

    pub fn verify_client<M>(&self, message: &Signed<M>, index: ClientIndex) -> Result<(), Invalid>
    where
        M: DigestHash,
    {
        self.verify(message, KeyOf::Client(index))
    }

    /// Verify against the primary of the view, the sender a pre-prepare and
    /// a new-view leave implied.
    pub fn verify_primary<M>(&self, message: &Signed<M>, view: super::ViewNum) -> Result<(), Invalid>
    where
        M: DigestHash,
    {
        let index = match self {
            Self::Standard(verifier) => (view as usize % verifier.replica_keys.len()) as _,
            _ => 0,
        };
        self.verify(message, KeyOf::Replica(index))
    }

    fn verify<M>(&self, message: &Signed<M>, key_of: KeyOf) -> Result<(), Invalid>
    where
        M: DigestHash,
    {
        match (self, &message.signature) {
            (Self::Nop, _) => Ok(()),
            (Self::Simulated, Signature::SimulatedPrivate | Signature::SimulatedPublic) => Ok(()),
            (Self::Simulated, _) => Err(Invalid::Variant),
            (Self::Standard(verifier), Signature::Hmac(code)) => {
                let mut hmac = verifier.hmac.clone();
                Hasher::hmac_update(&message.inner, &mut hmac);
                hmac.verify(code.into()).map_err(|_| Invalid::Private)
            }
            (Self::Standard(verifier), Signature::K256(signature)) => {
                let verifying_key = match key_of {
                    KeyOf::Replica(index) => verifier.replica_keys.get(&index),
                    KeyOf::Client(index) => verifier.client_keys.get(&index),
                }
                .ok_or(Invalid::Identity)?;
                verifying_key
                    .verify_digest(Hasher::sha256(&message.inner), signature)
                    .map_err(|_| Invalid::Public)
            }
            (Self::Standard(_), _) => Err(Invalid::Variant),
        }
    }
}

/// Wrapping of an outgoing payload into the wire message type, signing it
/// along the way with the class of authenticator the variant calls for.
/// Anything already carrying a signature converts through `Into` untouched,
/// so resending a stored message or relaying someone else's keeps the
/// original authenticator.
pub trait Sign<N> {
    fn sign(message: N, signer: &Signer) -> Self;
}

impl<M, N: Into<M>> Sign<N> for M {
    fn sign(message: N, _: &Signer) -> Self {
        message.into()
    }
}

pub trait Verify {
    fn verify(&self, verifier: &Verifier) -> Result<(), Invalid>;
}
