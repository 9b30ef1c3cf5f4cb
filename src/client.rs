//! The client-side request driver.
//!
//! One outstanding operation at a time. The request goes to the suspected
//! primary first and to everyone once the retry timer fires. A reply quorum
//! must agree on the hash chain version as well as the result; agreement on
//! the result alone with diverging versions means the histories forked, and
//! the operation surfaces as an alarm instead of a value.

use std::collections::HashMap;

use crate::{
    chain::{Hcv, VersionEntry, VersionVector},
    context::{
        crypto::Signed, ClientIndex, Config, Context, Host, Receivers, ReplicaIndex, TimerId, To,
    },
    message::{Message, Reply, Request},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Complete {
        result: Vec<u8>,
        hcv: Hcv,
    },
    /// Replicas agreed on the result but not on the history it extends, or
    /// one of them contradicted its own earlier attestation. The conflicting
    /// versions are the evidence; the operation must not be treated as
    /// linearizable.
    ForkAlarm {
        request_num: u64,
        hcvs: Vec<Hcv>,
    },
}

pub struct Client {
    context: Context<Message>,
    id: ClientIndex,
    config: Config,

    request_num: u64,
    op: Option<Vec<u8>>,
    primary: ReplicaIndex,
    replies: HashMap<ReplicaIndex, Signed<Reply>>,
    version_vector: VersionVector,
    resend_timer: Option<TimerId>,
    outcome: Option<Outcome>,
}

impl Client {
    pub fn new(context: Context<Message>, id: ClientIndex) -> Self {
        let config = context.config().clone();
        Self {
            context,
            id,
            config,
            request_num: 0,
            op: None,
            primary: 0,
            replies: Default::default(),
            version_vector: Default::default(),
            resend_timer: None,
            outcome: None,
        }
    }

    /// Submit the next operation. At most one may be outstanding.
    pub fn invoke(&mut self, op: Vec<u8>) {
        assert!(self.op.is_none());
        self.request_num += 1;
        self.op = Some(op);
        self.replies.clear();
        self.outcome = None;
        let to = To::replica(self.primary);
        self.send_request(to);
        let id = self.context.set(self.config.request_timeout);
        self.resend_timer = Some(id);
    }

    pub fn take_outcome(&mut self) -> Option<Outcome> {
        self.outcome.take()
    }

    fn send_request(&mut self, to: To) {
        let request = Request {
            client_id: self.id,
            request_num: self.request_num,
            op: self.op.clone().expect("an operation is outstanding"),
        };
        self.context.send(to, request);
    }

    fn handle_reply(&mut self, reply: Signed<Reply>) {
        if reply.client_id != self.id {
            return;
        }
        // attestations feed the version vector even when the operation they
        // answer is no longer outstanding
        let entry = VersionEntry {
            view: reply.view,
            seq: reply.seq,
            hcv: reply.hcv,
        };
        let contradiction = self.version_vector.observe(reply.replica_id, entry);
        if self.op.is_none() || reply.request_num != self.request_num {
            return;
        }
        if let Some(previous) = contradiction {
            // the replica disagreed with itself about the same sequence
            // number, unfixable by waiting for more replies
            tracing::warn!(
                client = self.id,
                replica = reply.replica_id,
                seq = reply.seq,
                "replica contradicted its own attestation"
            );
            self.finish(Outcome::ForkAlarm {
                request_num: self.request_num,
                hcvs: vec![previous.hcv, reply.hcv],
            });
            return;
        }
        self.replies.insert(reply.replica_id, reply);
        self.collate();
    }

    fn collate(&mut self) {
        let quorum = 2 * self.config.num_faulty + 1;
        let mut matched: HashMap<_, usize> = HashMap::new();
        for reply in self.replies.values() {
            *matched
                .entry((reply.view, reply.result.clone(), reply.hcv))
                .or_default() += 1;
        }
        if let Some(((view, result, hcv), _)) = matched
            .into_iter()
            .find(|(_, count)| *count >= quorum)
        {
            self.primary = self.config.primary(view);
            self.finish(Outcome::Complete { result, hcv });
            return;
        }
        if self.replies.len() < quorum {
            return;
        }
        // enough replies for a quorum arrived and none agrees in full; if
        // f + 1 of them already agree on the result under different
        // versions, the divergence is real
        let mut alarm = None;
        {
            let mut by_result: HashMap<&[u8], Vec<Hcv>> = HashMap::new();
            for reply in self.replies.values() {
                by_result
                    .entry(reply.result.as_slice())
                    .or_default()
                    .push(reply.hcv);
            }
            for (_, mut hcvs) in by_result {
                if hcvs.len() >= self.config.num_faulty + 1 {
                    hcvs.sort_unstable_by_key(|hcv| hcv.0);
                    hcvs.dedup();
                    if hcvs.len() > 1 {
                        alarm = Some(hcvs);
                        break;
                    }
                }
            }
        }
        if let Some(hcvs) = alarm {
            tracing::warn!(
                client = self.id,
                request_num = self.request_num,
                "reply quorum diverged, raising fork alarm"
            );
            self.finish(Outcome::ForkAlarm {
                request_num: self.request_num,
                hcvs,
            });
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        self.op = None;
        self.replies.clear();
        if let Some(id) = self.resend_timer.take() {
            self.context.unset(id);
        }
        self.outcome = Some(outcome);
    }
}

impl Receivers for Client {
    type Message = Message;

    fn handle(&mut self, receiver: Host, _remote: Host, message: Message) {
        assert_eq!(receiver, Host::Client(self.id));
        if let Message::Reply(reply) = message {
            self.handle_reply(reply)
        }
    }

    fn on_timer(&mut self, receiver: Host, id: TimerId) {
        assert_eq!(receiver, Host::Client(self.id));
        if self.resend_timer != Some(id) {
            return;
        }
        // no quorum inside the bound, fall back to asking everyone; the
        // timer keeps firing, so this repeats until the quorum arrives
        tracing::debug!(client = self.id, request_num = self.request_num, "resending");
        self.send_request(To::AllReplica)
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{crypto::Signer, simulated::Dispatch, Config};

    use super::*;

    fn reply(replica_id: ReplicaIndex, request_num: u64, result: &[u8], hcv: Hcv) -> Signed<Reply> {
        Signer::Simulated.sign_private(Reply {
            view: 0,
            seq: request_num,
            request_num,
            client_id: 0,
            replica_id,
            result: result.to_vec(),
            hcv,
        })
    }

    fn client() -> (Dispatch<Message>, Client) {
        let dispatch = Dispatch::new(Config::new(4, 1));
        let client = Client::new(dispatch.register(Host::Client(0)), 0);
        (dispatch, client)
    }

    #[test]
    fn quorum_of_matching_replies_completes() {
        let (_dispatch, mut client) = client();
        client.invoke(b"put user alice".to_vec());
        let hcv = Hcv::GENESIS.extend(&[1; 32], 1, 0);
        for replica_id in 0..2 {
            client.handle_reply(reply(replica_id, 1, b"ok", hcv));
            assert_eq!(client.take_outcome(), None);
        }
        client.handle_reply(reply(2, 1, b"ok", hcv));
        assert_eq!(
            client.take_outcome(),
            Some(Outcome::Complete {
                result: b"ok".to_vec(),
                hcv
            })
        );
    }

    #[test]
    fn duplicate_sender_does_not_count_twice() {
        let (_dispatch, mut client) = client();
        client.invoke(b"put user alice".to_vec());
        let hcv = Hcv::GENESIS.extend(&[1; 32], 1, 0);
        for _ in 0..3 {
            client.handle_reply(reply(1, 1, b"ok", hcv));
        }
        assert_eq!(client.take_outcome(), None);
    }

    #[test]
    fn diverging_versions_raise_fork_alarm() {
        let (_dispatch, mut client) = client();
        client.invoke(b"put user alice".to_vec());
        let left = Hcv::GENESIS.extend(&[1; 32], 1, 0);
        let right = Hcv::GENESIS.extend(&[2; 32], 1, 0);
        client.handle_reply(reply(0, 1, b"ok", left));
        client.handle_reply(reply(2, 1, b"ok", right));
        assert_eq!(client.take_outcome(), None);
        client.handle_reply(reply(3, 1, b"ok", right));
        match client.take_outcome() {
            Some(Outcome::ForkAlarm { request_num, hcvs }) => {
                assert_eq!(request_num, 1);
                assert!(hcvs.contains(&left) && hcvs.contains(&right));
            }
            outcome => panic!("unexpected {outcome:?}"),
        }
    }

    #[test]
    fn self_contradicting_replica_raises_fork_alarm() {
        let (_dispatch, mut client) = client();
        client.invoke(b"put user alice".to_vec());
        let left = Hcv::GENESIS.extend(&[1; 32], 1, 0);
        client.handle_reply(reply(1, 1, b"ok", left));
        let outcome = client.take_outcome();
        assert_eq!(outcome, None);
        // same replica, same sequence number, different version
        let right = Hcv::GENESIS.extend(&[2; 32], 1, 0);
        client.handle_reply(reply(1, 1, b"ok", right));
        match client.take_outcome() {
            Some(Outcome::ForkAlarm { hcvs, .. }) => {
                assert!(hcvs.contains(&left) && hcvs.contains(&right))
            }
            outcome => panic!("unexpected {outcome:?}"),
        }
    }

    #[test]
    fn stale_replies_are_ignored() {
        let (_dispatch, mut client) = client();
        client.invoke(b"put user alice".to_vec());
        let hcv = Hcv::GENESIS.extend(&[1; 32], 1, 0);
        client.handle_reply(reply(0, 1, b"ok", hcv));
        client.handle_reply(reply(1, 1, b"ok", hcv));
        client.handle_reply(reply(2, 1, b"ok", hcv));
        assert!(client.take_outcome().is_some());

        client.invoke(b"get user".to_vec());
        // replies for the finished request change nothing
        client.handle_reply(reply(0, 1, b"ok", hcv));
        client.handle_reply(reply(1, 1, b"ok", hcv));
        client.handle_reply(reply(2, 1, b"ok", hcv));
        assert_eq!(client.take_outcome(), None);
    }
}
