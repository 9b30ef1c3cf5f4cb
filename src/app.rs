use std::collections::BTreeMap;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::{
    chain::Digest,
    context::{crypto, SeqNum},
    message::wire_options,
};

/// Deterministic application state machine. The engine invokes `execute`
/// strictly in ascending sequence order and at most once per sequence
/// number; everything else exists so checkpoints can attest and transfer
/// the state.
pub trait App {
    fn execute(&mut self, seq: SeqNum, op: &[u8]) -> Vec<u8>;

    /// Digest over the current state, attested in checkpoint messages.
    fn digest(&self) -> Digest;

    fn snapshot(&self) -> Vec<u8>;

    fn install(&mut self, snapshot: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Null;

impl App for Null {
    fn execute(&mut self, _: SeqNum, _: &[u8]) -> Vec<u8> {
        Default::default()
    }

    fn digest(&self) -> Digest {
        Default::default()
    }

    fn snapshot(&self) -> Vec<u8> {
        Default::default()
    }

    fn install(&mut self, _: &[u8]) {}
}

/// Small key-value workload: `put <key> <value>` answers `ok`, `get <key>`
/// answers the stored value, anything unparseable answers `err`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStore(BTreeMap<String, String>);

impl App for KvStore {
    fn execute(&mut self, _: SeqNum, op: &[u8]) -> Vec<u8> {
        let Ok(op) = std::str::from_utf8(op) else {
            return b"err".to_vec();
        };
        let mut words = op.splitn(3, ' ');
        match (words.next(), words.next(), words.next()) {
            (Some("put"), Some(key), Some(value)) => {
                self.0.insert(key.into(), value.into());
                b"ok".to_vec()
            }
            (Some("get"), Some(key), None) => {
                self.0.get(key).cloned().unwrap_or_default().into_bytes()
            }
            _ => b"err".to_vec(),
        }
    }

    fn digest(&self) -> Digest {
        crypto::digest(&self.0)
    }

    fn snapshot(&self) -> Vec<u8> {
        wire_options().serialize(&self.0).unwrap()
    }

    fn install(&mut self, snapshot: &[u8]) {
        // a snapshot that fails its digest check afterwards is re-solicited,
        // so a garbled one must not take the replica down
        self.0 = wire_options().deserialize(snapshot).unwrap_or_default()
    }
}
