//! Checkpoint persistence contracts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    chain::{Digest, Hcv},
    context::{SeqNum, ViewNum},
    message::{CheckpointCert, CommittedEntry},
};

/// Durable per-replica state: enough to rejoin after a restart without
/// contradicting anything the replica attested before it went down. A
/// restarted replica re-enters in recovering status and catches up from its
/// last stable checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persistent {
    pub view: ViewNum,
    pub execute_num: SeqNum,
    pub hcv: Hcv,
    pub checkpoint: Option<CheckpointCert>,
    /// Committed log suffix above the checkpoint.
    pub entries: Vec<CommittedEntry>,
}

pub trait CheckpointStore {
    fn save(&mut self, seq: SeqNum, state_digest: Digest, hcv: Hcv);

    fn truncate_below(&mut self, seq: SeqNum);
}

/// In-memory store, for tests and for deployments that delegate durability
/// elsewhere.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    saved: BTreeMap<SeqNum, (Digest, Hcv)>,
}

impl MemoryStore {
    pub fn latest(&self) -> Option<(SeqNum, Digest, Hcv)> {
        self.saved
            .last_key_value()
            .map(|(&seq, &(digest, hcv))| (seq, digest, hcv))
    }
}

impl CheckpointStore for MemoryStore {
    fn save(&mut self, seq: SeqNum, state_digest: Digest, hcv: Hcv) {
        self.saved.insert(seq, (state_digest, hcv));
    }

    fn truncate_below(&mut self, seq: SeqNum) {
        self.saved.retain(|&saved, _| saved >= seq);
    }
}
