//! Protocol messages and their validation.
//!
//! Everything on the wire is one [`Message`] variant. Dispatch authenticates
//! the envelope before the protocol runs; the certificate-shaped payloads
//! (prepared sets, checkpoint proofs, commit certificates) carry their own
//! deep validation, called by whoever is about to rely on the evidence.

use std::collections::HashSet;

use bincode::Options;
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{
    chain::{Digest, Hcv, NULL_DIGEST},
    context::{
        crypto::{digest, Invalid, Sign, Signed, Signer, Verifier, Verify},
        ClientIndex, Config, ReplicaIndex, SeqNum, ViewNum,
    },
};

/// Canonical wire form, fixed-width big-endian integers and length-prefixed
/// variable fields.
pub fn wire_options() -> impl Options {
    bincode::options().with_big_endian().with_fixint_encoding()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub client_id: ClientIndex,
    pub request_num: u64,
    pub op: Vec<u8>,
}

impl Request {
    pub fn digest(&self) -> Digest {
        digest(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: ViewNum,
    pub seq: SeqNum,
    pub digest: Digest,
    /// The primary's version assuming this request executes next. Carried
    /// for discovery, never a reason to reject.
    pub hcv: Hcv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewNum,
    pub seq: SeqNum,
    pub digest: Digest,
    pub hcv: Hcv,
    pub replica_id: ReplicaIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commit {
    pub view: ViewNum,
    pub seq: SeqNum,
    pub digest: Digest,
    pub hcv: Hcv,
    pub replica_id: ReplicaIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reply {
    pub view: ViewNum,
    pub seq: SeqNum,
    pub request_num: u64,
    pub client_id: ClientIndex,
    pub replica_id: ReplicaIndex,
    pub result: Vec<u8>,
    pub hcv: Hcv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: SeqNum,
    pub state_digest: Digest,
    pub hcv: Hcv,
    pub replica_id: ReplicaIndex,
}

/// A prepared certificate: the pre-prepare plus `2f` matching prepares from
/// distinct replicas, with the request itself so a new primary can repropose
/// it. `request` is absent exactly for null operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreparedProof {
    pub pre_prepare: Signed<PrePrepare>,
    pub request: Option<Signed<Request>>,
    pub prepares: Vec<Signed<Prepare>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewChange {
    /// The view the sender wants to move into.
    pub view: ViewNum,
    pub last_stable: SeqNum,
    pub checkpoint_proof: Vec<Signed<Checkpoint>>,
    pub prepared: Vec<PreparedProof>,
    pub hcv: Hcv,
    pub replica_id: ReplicaIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewView {
    pub view: ViewNum,
    pub view_changes: Vec<Signed<ViewChange>>,
    /// One entry per sequence number in the reconstructed range, request
    /// absent for null operations.
    pub pre_prepares: Vec<(Signed<PrePrepare>, Option<Signed<Request>>)>,
}

/// Solicitation of everything committed above the sender's executed prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewStateRequest {
    pub seq: SeqNum,
    pub replica_id: ReplicaIndex,
}

/// A stable checkpoint with its proof and enough application state to
/// install it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointCert {
    pub seq: SeqNum,
    pub state_digest: Digest,
    pub hcv: Hcv,
    pub proof: Vec<Signed<Checkpoint>>,
    pub app_snapshot: Vec<u8>,
    pub reply_cache: Vec<(ClientIndex, Signed<Reply>)>,
}

/// One committed sequence number above a checkpoint, with its commit
/// certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommittedEntry {
    pub view: ViewNum,
    pub seq: SeqNum,
    pub digest: Digest,
    pub request: Option<Signed<Request>>,
    pub commits: Vec<Signed<Commit>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewState {
    /// The sender's current view, so a replica that slept through view
    /// changes rejoins in the right one.
    pub view: ViewNum,
    pub checkpoint: Option<CheckpointCert>,
    pub entries: Vec<CommittedEntry>,
    pub replica_id: ReplicaIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, From)]
pub enum Message {
    Request(Signed<Request>),
    PrePrepare(Signed<PrePrepare>, Signed<Request>),
    Prepare(Signed<Prepare>),
    Commit(Signed<Commit>),
    Reply(Signed<Reply>),
    Checkpoint(Signed<Checkpoint>),
    ViewChange(Signed<ViewChange>),
    NewView(Signed<NewView>),
    NewStateRequest(Signed<NewStateRequest>),
    NewState(Signed<NewState>),
}

// the one payload signed inside the context: clients hold no evidence, so
// their requests are signed on the way out
impl Sign<Request> for Message {
    fn sign(message: Request, signer: &Signer) -> Self {
        Self::Request(signer.sign_public(message))
    }
}

impl Verify for Message {
    fn verify(&self, verifier: &Verifier) -> Result<(), Invalid> {
        match self {
            Self::Request(request) => verifier.verify_client(request, request.client_id),
            Self::PrePrepare(pre_prepare, request) => {
                verifier.verify_primary(pre_prepare, pre_prepare.view)?;
                verifier.verify_client(request, request.client_id)
            }
            Self::Prepare(prepare) => verifier.verify_replica(prepare, prepare.replica_id),
            Self::Commit(commit) => verifier.verify_replica(commit, commit.replica_id),
            Self::Reply(reply) => verifier.verify_replica(reply, reply.replica_id),
            Self::Checkpoint(checkpoint) => {
                verifier.verify_replica(checkpoint, checkpoint.replica_id)
            }
            Self::ViewChange(view_change) => {
                verifier.verify_replica(view_change, view_change.replica_id)
            }
            Self::NewView(new_view) => verifier.verify_primary(new_view, new_view.view),
            Self::NewStateRequest(request) => verifier.verify_replica(request, request.replica_id),
            Self::NewState(new_state) => verifier.verify_replica(new_state, new_state.replica_id),
        }
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum InvalidProof {
    #[error(transparent)]
    Authenticator(#[from] Invalid),
    #[error("proof pieces contradict each other")]
    Malformed,
    #[error("not enough distinct attestations")]
    Quorum,
}

impl PreparedProof {
    pub fn validate(&self, verifier: &Verifier, config: &Config) -> Result<(), InvalidProof> {
        let pre_prepare = &self.pre_prepare;
        verifier.verify_primary(pre_prepare, pre_prepare.view)?;
        match &self.request {
            Some(request) => {
                verifier.verify_client(request, request.client_id)?;
                if request.digest() != pre_prepare.digest {
                    return Err(InvalidProof::Malformed);
                }
            }
            None => {
                if pre_prepare.digest != NULL_DIGEST {
                    return Err(InvalidProof::Malformed);
                }
            }
        }
        let mut senders = HashSet::new();
        for prepare in &self.prepares {
            verifier.verify_replica(prepare, prepare.replica_id)?;
            if (prepare.view, prepare.seq, prepare.digest)
                != (pre_prepare.view, pre_prepare.seq, pre_prepare.digest)
                || !senders.insert(prepare.replica_id)
            {
                return Err(InvalidProof::Malformed);
            }
        }
        if senders.len() < 2 * config.num_faulty {
            return Err(InvalidProof::Quorum);
        }
        Ok(())
    }
}

/// Check that `proof` is `2f + 1` distinct replicas attesting the same
/// checkpoint.
pub fn validate_checkpoint_proof(
    proof: &[Signed<Checkpoint>],
    seq: SeqNum,
    verifier: &Verifier,
    config: &Config,
) -> Result<(), InvalidProof> {
    let mut senders = HashSet::new();
    for checkpoint in proof {
        verifier.verify_replica(checkpoint, checkpoint.replica_id)?;
        let reference = &proof[0];
        if checkpoint.seq != seq
            || checkpoint.state_digest != reference.state_digest
            || checkpoint.hcv != reference.hcv
            || !senders.insert(checkpoint.replica_id)
        {
            return Err(InvalidProof::Malformed);
        }
    }
    if senders.len() < 2 * config.num_faulty + 1 {
        return Err(InvalidProof::Quorum);
    }
    Ok(())
}

impl ViewChange {
    pub fn validate(&self, verifier: &Verifier, config: &Config) -> Result<(), InvalidProof> {
        // the genesis state needs no proof
        if self.last_stable != 0 {
            validate_checkpoint_proof(&self.checkpoint_proof, self.last_stable, verifier, config)?;
        }
        for proof in &self.prepared {
            if proof.pre_prepare.seq <= self.last_stable || proof.pre_prepare.view >= self.view {
                return Err(InvalidProof::Malformed);
            }
            proof.validate(verifier, config)?;
        }
        Ok(())
    }
}

impl CommittedEntry {
    pub fn validate(&self, verifier: &Verifier, config: &Config) -> Result<(), InvalidProof> {
        match &self.request {
            Some(request) => {
                verifier.verify_client(request, request.client_id)?;
                if request.digest() != self.digest {
                    return Err(InvalidProof::Malformed);
                }
            }
            None => {
                if self.digest != NULL_DIGEST {
                    return Err(InvalidProof::Malformed);
                }
            }
        }
        let mut senders = HashSet::new();
        for commit in &self.commits {
            verifier.verify_replica(commit, commit.replica_id)?;
            if (commit.view, commit.seq, commit.digest) != (self.view, self.seq, self.digest)
                || !senders.insert(commit.replica_id)
            {
                return Err(InvalidProof::Malformed);
            }
        }
        if senders.len() < 2 * config.num_faulty + 1 {
            return Err(InvalidProof::Quorum);
        }
        Ok(())
    }
}

impl CheckpointCert {
    pub fn validate(&self, verifier: &Verifier, config: &Config) -> Result<(), InvalidProof> {
        validate_checkpoint_proof(&self.proof, self.seq, verifier, config)?;
        let reference = &self.proof[0];
        if reference.state_digest != self.state_digest || reference.hcv != self.hcv {
            return Err(InvalidProof::Malformed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::context::crypto::{replica_signing_key, Signer, Verifier};

    use super::*;

    fn config() -> Config {
        Config::new(4, 1)
    }

    fn signer(index: ReplicaIndex) -> Signer {
        Signer::new_standard(replica_signing_key(index))
    }

    fn verifier() -> Verifier {
        Verifier::new_standard(4, 1)
    }

    #[test]
    fn request_digest_is_stable() {
        let request = Request {
            client_id: 3,
            request_num: 7,
            op: b"login".to_vec(),
        };
        assert_eq!(request.digest(), request.clone().digest());
        let other = Request {
            request_num: 8,
            ..request.clone()
        };
        assert_ne!(request.digest(), other.digest());
    }

    #[test]
    fn envelope_verification_checks_sender() {
        let prepare = Prepare {
            view: 0,
            seq: 1,
            digest: [1; 32],
            hcv: Hcv::GENESIS,
            replica_id: 1,
        };
        let message = Message::Prepare(signer(1).sign_private(prepare));
        assert!(message.verify(&verifier()).is_ok());

        // a replica claiming someone else's prepare under a public signature
        // does not verify
        let forged = Message::Prepare(signer(2).sign_public(Prepare {
            replica_id: 1,
            ..prepare
        }));
        assert!(forged.verify(&verifier()).is_err());
    }

    #[test]
    fn prepared_proof_requires_two_f_distinct() {
        let request = Request {
            client_id: 0,
            request_num: 1,
            op: b"x".to_vec(),
        };
        let signed_request =
            Signer::new_standard(crate::context::crypto::client_signing_key(0)).sign_public(request.clone());
        let pre_prepare = PrePrepare {
            view: 0,
            seq: 1,
            digest: request.digest(),
            hcv: Hcv::GENESIS,
        };
        let prepare = |replica_id| {
            signer(replica_id).sign_private(Prepare {
                view: 0,
                seq: 1,
                digest: request.digest(),
                hcv: Hcv::GENESIS,
                replica_id,
            })
        };
        let mut proof = PreparedProof {
            pre_prepare: signer(0).sign_private(pre_prepare),
            request: Some(signed_request),
            prepares: vec![prepare(1)],
        };
        assert!(proof.validate(&verifier(), &config()).is_err());
        proof.prepares.push(prepare(2));
        assert!(proof.validate(&verifier(), &config()).is_ok());
        // duplicated sender does not help
        proof.prepares.pop();
        proof.prepares.push(prepare(1));
        assert!(proof.validate(&verifier(), &config()).is_err());
    }
}
