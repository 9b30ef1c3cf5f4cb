//! Hash chain versions.
//!
//! An [`Hcv`] summarizes the whole executed prefix of one replica in a single
//! digest: executing sequence number `n` folds the request digest, `n` and
//! the view it committed in into the previous version. Two replicas that
//! executed the same prefix publish the same version, and a replica cannot
//! rewrite its history without every later version it publishes changing.
//! Peers never reject each other over a version mismatch, divergence is
//! evidence to be recorded, not an authentication failure.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::context::{ReplicaIndex, SeqNum, ViewNum};

pub use crate::context::crypto::Digest;

/// Digest standing in for the null operation a new primary fills unclaimed
/// sequence numbers with after a view change.
pub const NULL_DIGEST: Digest = [0; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hcv(pub [u8; 32]);

impl Hcv {
    pub const GENESIS: Self = Self([0; 32]);

    /// The chain step, applied exactly once per executed sequence number.
    pub fn extend(&self, digest: &Digest, seq: SeqNum, view: ViewNum) -> Self {
        Self(
            Sha256::new()
                .chain_update(self.0)
                .chain_update(digest)
                .chain_update(seq.to_be_bytes())
                .chain_update((view as u64).to_be_bytes())
                .finalize()
                .into(),
        )
    }
}

impl std::fmt::Display for Hcv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?
        }
        Ok(())
    }
}

/// What one replica last attested about its executed prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionEntry {
    pub view: ViewNum,
    pub seq: SeqNum,
    pub hcv: Hcv,
}

/// Client-side record of the latest version attested by each replica,
/// carried across requests so a fork that spans two operations still leaves
/// contradicting attestations behind.
#[derive(Debug, Clone, Default)]
pub struct VersionVector {
    entries: HashMap<ReplicaIndex, VersionEntry>,
}

impl VersionVector {
    /// Record an attestation. Returns the previously recorded entry when the
    /// replica contradicts itself about a sequence number it already
    /// attested, which is proof its history forked.
    pub fn observe(
        &mut self,
        replica: ReplicaIndex,
        entry: VersionEntry,
    ) -> Option<VersionEntry> {
        match self.entries.get(&replica) {
            Some(known) if known.seq == entry.seq && known.hcv != entry.hcv => {
                return Some(*known)
            }
            Some(known) if known.seq > entry.seq => return None,
            _ => {}
        }
        self.entries.insert(replica, entry);
        None
    }

    pub fn get(&self, replica: ReplicaIndex) -> Option<&VersionEntry> {
        self.entries.get(&replica)
    }

    /// The state attested identically by a `2f + 1` quorum, if any.
    pub fn stable(&self, num_faulty: usize) -> Option<(SeqNum, Hcv)> {
        let mut counts = HashMap::new();
        for entry in self.entries.values() {
            *counts.entry((entry.seq, entry.hcv)).or_insert(0usize) += 1;
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count >= 2 * num_faulty + 1)
            .map(|(state, _)| state)
            .max_by_key(|(seq, _)| *seq)
    }
}

/// Two authenticated messages from one sender that contradict each other for
/// the same slot. Retained as evidence of misbehavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equivocation<M> {
    pub sender: ReplicaIndex,
    pub view: ViewNum,
    pub seq: SeqNum,
    pub first: M,
    pub second: M,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(view: ViewNum, seq: SeqNum, hcv: Hcv) -> VersionEntry {
        VersionEntry { view, seq, hcv }
    }

    #[test]
    fn extend_is_deterministic() {
        let digest = [7; 32];
        let first = Hcv::GENESIS.extend(&digest, 1, 0);
        assert_eq!(first, Hcv::GENESIS.extend(&digest, 1, 0));
        assert_ne!(first, Hcv::GENESIS);
    }

    #[test]
    fn extend_binds_every_input() {
        let base = Hcv::GENESIS.extend(&[1; 32], 1, 0);
        assert_ne!(base, Hcv::GENESIS.extend(&[2; 32], 1, 0));
        assert_ne!(base, Hcv::GENESIS.extend(&[1; 32], 2, 0));
        assert_ne!(base, Hcv::GENESIS.extend(&[1; 32], 1, 1));
        assert_ne!(
            base.extend(&[1; 32], 2, 0),
            Hcv::GENESIS.extend(&[1; 32], 2, 0)
        );
    }

    #[test]
    fn identical_prefixes_identical_versions() {
        let ops = [[3; 32], [4; 32], [5; 32]];
        let mut left = Hcv::GENESIS;
        let mut right = Hcv::GENESIS;
        for (index, digest) in ops.iter().enumerate() {
            left = left.extend(digest, index as SeqNum + 1, 0);
            right = right.extend(digest, index as SeqNum + 1, 0);
        }
        assert_eq!(left, right);
    }

    #[test]
    fn version_vector_detects_contradiction() {
        let mut vector = VersionVector::default();
        let hcv = Hcv::GENESIS.extend(&[1; 32], 1, 0);
        assert!(vector.observe(0, entry(0, 1, hcv)).is_none());
        // same attestation again is not a contradiction
        assert!(vector.observe(0, entry(0, 1, hcv)).is_none());
        let forked = Hcv::GENESIS.extend(&[2; 32], 1, 0);
        let evidence = vector.observe(0, entry(0, 1, forked)).unwrap();
        assert_eq!(evidence.hcv, hcv);
    }

    #[test]
    fn version_vector_ignores_stale() {
        let mut vector = VersionVector::default();
        let newer = Hcv::GENESIS.extend(&[1; 32], 2, 0);
        assert!(vector.observe(0, entry(0, 2, newer)).is_none());
        let stale = Hcv::GENESIS.extend(&[9; 32], 1, 0);
        assert!(vector.observe(0, entry(0, 1, stale)).is_none());
        assert_eq!(vector.get(0).unwrap().seq, 2);
    }

    #[test]
    fn stable_needs_quorum() {
        let mut vector = VersionVector::default();
        let hcv = Hcv::GENESIS.extend(&[1; 32], 1, 0);
        vector.observe(0, entry(0, 1, hcv));
        vector.observe(1, entry(0, 1, hcv));
        assert_eq!(vector.stable(1), None);
        vector.observe(2, entry(0, 1, hcv));
        assert_eq!(vector.stable(1), Some((1, hcv)));
    }
}
