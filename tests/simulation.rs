//! End-to-end protocol runs on the deterministic simulated timeline,
//! `f = 1`, four replicas. Byzantine behavior is scripted by swapping a
//! replica for a node that speaks the wire format but not the protocol.

use std::collections::HashMap;

use bft2f::{
    app::KvStore,
    chain::Hcv,
    context::{
        crypto::{Signed, Signer, Verifier},
        simulated::Dispatch,
        ClientIndex, Config, Context, Host, Receivers, ReplicaIndex, TimerId, To,
    },
    message::{Commit, Message, PrePrepare, Prepare, Reply, Request},
    replica::Replica,
    storage::MemoryStore,
    Client, Outcome,
};

enum Node {
    Replica(Box<Replica<KvStore>>),
    Client(Client),
    Equivocator(Equivocator),
    SplitBrainPrimary(SplitBrainPrimary),
    Accomplice(Accomplice),
}

struct Group {
    nodes: HashMap<Host, Node>,
}

impl Receivers for Group {
    type Message = Message;

    fn handle(&mut self, receiver: Host, remote: Host, message: Message) {
        match self.nodes.get_mut(&receiver).expect("host registered") {
            Node::Replica(node) => node.handle(receiver, remote, message),
            Node::Client(node) => node.handle(receiver, remote, message),
            Node::Equivocator(node) => node.handle(receiver, remote, message),
            Node::SplitBrainPrimary(node) => node.handle(receiver, remote, message),
            Node::Accomplice(node) => node.handle(receiver, remote, message),
        }
    }

    fn on_timer(&mut self, receiver: Host, id: TimerId) {
        match self.nodes.get_mut(&receiver).expect("host registered") {
            Node::Replica(node) => node.on_timer(receiver, id),
            Node::Client(node) => node.on_timer(receiver, id),
            Node::Equivocator(node) => node.on_timer(receiver, id),
            Node::SplitBrainPrimary(node) => node.on_timer(receiver, id),
            Node::Accomplice(node) => node.on_timer(receiver, id),
        }
    }
}

impl Group {
    fn replica(&self, id: ReplicaIndex) -> &Replica<KvStore> {
        match &self.nodes[&Host::Replica(id)] {
            Node::Replica(node) => node,
            _ => panic!("replica {id} is not honest"),
        }
    }

    fn client_mut(&mut self, id: ClientIndex) -> &mut Client {
        match self.nodes.get_mut(&Host::Client(id)).unwrap() {
            Node::Client(node) => node,
            _ => panic!("host is not a client"),
        }
    }
}

fn honest_replica(dispatch: &Dispatch<Message>, id: ReplicaIndex) -> Node {
    Node::Replica(Box::new(Replica::new(
        dispatch.register(Host::Replica(id)),
        id,
        Signer::Simulated,
        Verifier::Simulated,
        KvStore::default(),
        MemoryStore::default(),
    )))
}

fn group(dispatch: &Dispatch<Message>, num_client: u16) -> Group {
    let mut nodes = HashMap::new();
    for id in 0..4 {
        nodes.insert(Host::Replica(id), honest_replica(dispatch, id));
    }
    for id in 0..num_client {
        nodes.insert(
            Host::Client(id),
            Node::Client(Client::new(dispatch.register(Host::Client(id)), id)),
        );
    }
    Group { nodes }
}

fn drain(dispatch: &Dispatch<Message>, group: &mut Group) {
    for _ in 0..200_000 {
        if !dispatch.deliver_event(group) {
            return;
        }
    }
    panic!("timeline did not quiesce")
}

fn complete(outcome: Option<Outcome>) -> (Vec<u8>, Hcv) {
    match outcome {
        Some(Outcome::Complete { result, hcv }) => (result, hcv),
        outcome => panic!("expected completion, got {outcome:?}"),
    }
}

#[test]
fn happy_path() {
    let dispatch = Dispatch::new(Config::new(4, 1));
    let mut group = group(&dispatch, 1);
    group.client_mut(0).invoke(b"put session login".to_vec());
    drain(&dispatch, &mut group);

    let (result, hcv) = complete(group.client_mut(0).take_outcome());
    assert_eq!(result, b"ok");
    for id in 0..4 {
        let replica = group.replica(id);
        assert_eq!(replica.view(), 0);
        assert_eq!(replica.execute_num(), 1);
        assert_eq!(replica.hcv(), hcv);
        assert_eq!(replica.metrics().executed, 1);
    }
}

#[test]
fn two_clients_interleave() {
    let dispatch = Dispatch::new(Config::new(4, 1));
    let mut group = group(&dispatch, 2);
    group.client_mut(0).invoke(b"put user alice".to_vec());
    group.client_mut(1).invoke(b"put color green".to_vec());
    drain(&dispatch, &mut group);

    let (first, _) = complete(group.client_mut(0).take_outcome());
    let (second, _) = complete(group.client_mut(1).take_outcome());
    assert_eq!(first, b"ok");
    assert_eq!(second, b"ok");
    let reference = group.replica(0).hcv();
    for id in 0..4 {
        assert_eq!(group.replica(id).execute_num(), 2);
        assert_eq!(group.replica(id).hcv(), reference);
    }
}

#[test]
fn silent_backup_still_completes() {
    let dispatch = Dispatch::new(Config::new(4, 1));
    let mut group = group(&dispatch, 1);
    // drops everything it sends, keeps listening
    dispatch.mute(Host::Replica(3));
    group.client_mut(0).invoke(b"put session login".to_vec());
    drain(&dispatch, &mut group);

    let (result, hcv) = complete(group.client_mut(0).take_outcome());
    assert_eq!(result, b"ok");
    // the three audible replicas are a 2f + 1 quorum by themselves
    for id in 0..3 {
        assert_eq!(group.replica(id).hcv(), hcv);
        assert_eq!(group.replica(id).execute_num(), 1);
    }
}

/// A primary that assigns the same sequence number to two different
/// requests, sending one version to two backups and another to the third,
/// then goes quiet.
struct Equivocator {
    context: Context<Message>,
}

impl Receivers for Equivocator {
    type Message = Message;

    fn handle(&mut self, _receiver: Host, _remote: Host, message: Message) {
        let Message::Request(request) = message else {
            return;
        };
        let forged = Signer::Simulated.sign_public(Request {
            client_id: request.client_id,
            request_num: request.request_num,
            op: b"put owner mallory".to_vec(),
        });
        let real_digest = request.digest();
        let forged_digest = forged.digest();
        let pre_prepare = |digest| {
            Signer::Simulated.sign_private(PrePrepare {
                view: 0,
                seq: 1,
                digest,
                hcv: Hcv::GENESIS.extend(&digest, 1, 0),
            })
        };
        self.context.send(
            To::Hosts(vec![Host::Replica(1), Host::Replica(2)]),
            (pre_prepare(real_digest), request),
        );
        self.context
            .send(To::replica(3), (pre_prepare(forged_digest), forged));
    }

    fn on_timer(&mut self, _receiver: Host, _id: TimerId) {}
}

#[test]
fn equivocating_primary_is_voted_out() {
    let dispatch = Dispatch::new(Config::new(4, 1));
    let mut group = group(&dispatch, 1);
    group.nodes.insert(
        Host::Replica(0),
        Node::Equivocator(Equivocator {
            context: dispatch.register(Host::Replica(0)),
        }),
    );
    group.client_mut(0).invoke(b"put session login".to_vec());
    drain(&dispatch, &mut group);

    // no digest reached a commit quorum in view 0; the backups timed out,
    // moved to view 1 and re-sequenced the real request there
    let (result, hcv) = complete(group.client_mut(0).take_outcome());
    assert_eq!(result, b"ok");
    for id in 1..4 {
        let replica = group.replica(id);
        assert_eq!(replica.view(), 1);
        assert_eq!(replica.hcv(), hcv);
        assert!(replica.metrics().view_changes >= 1);
    }
}

/// Byzantine primary for the fork scenario: sequences client 0's request
/// only at replica 1 and client 1's request only at replica 2, votes for
/// both, and always shows clients the first history.
struct SplitBrainPrimary {
    context: Context<Message>,
    story: Option<Hcv>,
}

impl SplitBrainPrimary {
    fn run(&mut self, request: Signed<Request>) {
        let digest = request.digest();
        let hcv = Hcv::GENESIS.extend(&digest, 1, 0);
        let victim = if request.client_id == 0 { 1 } else { 2 };
        let pre_prepare = Signer::Simulated.sign_private(PrePrepare {
            view: 0,
            seq: 1,
            digest,
            hcv,
        });
        let client = request.client_id;
        let request_num = request.request_num;
        self.context.send(
            To::Hosts(vec![Host::Replica(victim), Host::Replica(3)]),
            (pre_prepare, request),
        );
        self.context.send(
            To::replica(victim),
            Signer::Simulated.sign_private(Commit {
                view: 0,
                seq: 1,
                digest,
                hcv,
                replica_id: 0,
            }),
        );
        let story = *self.story.get_or_insert(hcv);
        self.context.send(
            To::client(client),
            Signer::Simulated.sign_private(Reply {
                view: 0,
                seq: 1,
                request_num,
                client_id: client,
                replica_id: 0,
                result: b"ok".to_vec(),
                hcv: story,
            }),
        );
    }
}

impl Receivers for SplitBrainPrimary {
    type Message = Message;

    fn handle(&mut self, _receiver: Host, _remote: Host, message: Message) {
        if let Message::Request(request) = message {
            self.run(request)
        }
    }

    fn on_timer(&mut self, _receiver: Host, _id: TimerId) {}
}

/// The second colluder: echoes whatever the split-brain primary proposed
/// with a matching prepare, commit and reply.
struct Accomplice {
    context: Context<Message>,
}

impl Receivers for Accomplice {
    type Message = Message;

    fn handle(&mut self, _receiver: Host, _remote: Host, message: Message) {
        let Message::PrePrepare(pre_prepare, request) = message else {
            return;
        };
        let hcv = Hcv::GENESIS.extend(&pre_prepare.digest, 1, 0);
        self.context.send(
            To::AllReplica,
            Signer::Simulated.sign_private(Prepare {
                view: 0,
                seq: 1,
                digest: pre_prepare.digest,
                hcv,
                replica_id: 3,
            }),
        );
        self.context.send(
            To::AllReplica,
            Signer::Simulated.sign_private(Commit {
                view: 0,
                seq: 1,
                digest: pre_prepare.digest,
                hcv,
                replica_id: 3,
            }),
        );
        self.context.send(
            To::client(request.client_id),
            Signer::Simulated.sign_private(Reply {
                view: 0,
                seq: 1,
                request_num: request.request_num,
                client_id: request.client_id,
                replica_id: 3,
                result: b"ok".to_vec(),
                hcv,
            }),
        );
    }

    fn on_timer(&mut self, _receiver: Host, _id: TimerId) {}
}

#[test]
fn fork_beyond_f_is_detected() {
    let dispatch = Dispatch::new(Config::new(4, 1));
    let mut group = group(&dispatch, 2);
    group.nodes.insert(
        Host::Replica(0),
        Node::SplitBrainPrimary(SplitBrainPrimary {
            context: dispatch.register(Host::Replica(0)),
            story: None,
        }),
    );
    group.nodes.insert(
        Host::Replica(3),
        Node::Accomplice(Accomplice {
            context: dispatch.register(Host::Replica(3)),
        }),
    );

    // both operations race; the colluders commit them as the same sequence
    // number of two different histories
    group.client_mut(0).invoke(b"put winner alice".to_vec());
    group.client_mut(1).invoke(b"put winner bob".to_vec());
    drain(&dispatch, &mut group);
    let (result, first_hcv) = complete(group.client_mut(0).take_outcome());
    assert_eq!(result, b"ok");

    // two faulty replicas exceed f; the histories at the two correct
    // replicas really did diverge...
    let second_hcv = group.replica(2).hcv();
    assert_ne!(group.replica(1).hcv(), second_hcv);
    assert_eq!(group.replica(1).hcv(), first_hcv);
    // the colluders' conflicting votes left proof behind
    assert!(group.replica(1).metrics().equivocations >= 1);
    assert!(group.replica(2).metrics().contradictions >= 1);
    // ...but not silently: client 1's reply set mixes both chains
    match group.client_mut(1).take_outcome() {
        Some(Outcome::ForkAlarm { hcvs, .. }) => {
            assert!(hcvs.contains(&first_hcv));
            assert!(hcvs.contains(&second_hcv));
        }
        outcome => panic!("expected a fork alarm, got {outcome:?}"),
    }
}

#[test]
fn primary_crash_recovers_in_next_view() {
    let dispatch = Dispatch::new(Config::new(4, 1));
    let mut group = group(&dispatch, 1);
    dispatch.crash(Host::Replica(0));
    group.client_mut(0).invoke(b"put session login".to_vec());
    drain(&dispatch, &mut group);

    let (result, hcv) = complete(group.client_mut(0).take_outcome());
    assert_eq!(result, b"ok");
    for id in 1..4 {
        let replica = group.replica(id);
        assert_eq!(replica.view(), 1);
        assert_eq!(replica.execute_num(), 1);
        assert_eq!(replica.hcv(), hcv);
    }
}

#[test]
fn duplicate_request_executes_once() {
    let dispatch = Dispatch::new(Config::new(4, 1));
    let mut group = group(&dispatch, 1);
    group.client_mut(0).invoke(b"put session login".to_vec());
    drain(&dispatch, &mut group);
    let (result, _) = complete(group.client_mut(0).take_outcome());
    assert_eq!(result, b"ok");

    // the client retransmits the same timestamp, straight to the primary
    // and to a backup
    let request = Signer::Simulated.sign_public(Request {
        client_id: 0,
        request_num: 1,
        op: b"put session login".to_vec(),
    });
    group.handle(
        Host::Replica(0),
        Host::Client(0),
        Message::Request(request.clone()),
    );
    group.handle(Host::Replica(1), Host::Client(0), Message::Request(request));
    drain(&dispatch, &mut group);

    for id in 0..4 {
        let replica = group.replica(id);
        assert_eq!(replica.metrics().executed, 1);
        assert_eq!(replica.execute_num(), 1);
    }
}

#[test]
fn checkpoint_becomes_stable() {
    let mut config = Config::new(4, 1);
    config.checkpoint_interval = 2;
    let dispatch = Dispatch::new(config);
    let mut group = group(&dispatch, 1);

    for op in [&b"put a 1"[..], b"put b 2"] {
        group.client_mut(0).invoke(op.to_vec());
        drain(&dispatch, &mut group);
        complete(group.client_mut(0).take_outcome());
    }
    for id in 0..4 {
        let replica = group.replica(id);
        assert_eq!(replica.execute_num(), 2);
        assert_eq!(replica.metrics().stable_checkpoints, 1);
    }
}

#[test]
fn lagging_replica_catches_up_by_state_transfer() {
    let mut config = Config::new(4, 1);
    config.checkpoint_interval = 2;
    let dispatch = Dispatch::new(config);
    let mut group = group(&dispatch, 1);

    // replica 3 misses two operations and the checkpoint built over them
    dispatch.crash(Host::Replica(3));
    for op in [&b"put a 1"[..], b"put b 2"] {
        group.client_mut(0).invoke(op.to_vec());
        drain(&dispatch, &mut group);
        complete(group.client_mut(0).take_outcome());
    }
    dispatch.revive(Host::Replica(3));

    group.client_mut(0).invoke(b"put c 3".to_vec());
    drain(&dispatch, &mut group);
    complete(group.client_mut(0).take_outcome());

    let reference = group.replica(0).hcv();
    let lagged = group.replica(3);
    assert_eq!(lagged.execute_num(), 3);
    assert_eq!(lagged.hcv(), reference);
}

#[test]
fn restart_from_persistent_state() {
    let mut config = Config::new(4, 1);
    config.checkpoint_interval = 2;
    let dispatch = Dispatch::new(config);
    let mut group = group(&dispatch, 1);

    for op in [&b"put a 1"[..], b"put b 2"] {
        group.client_mut(0).invoke(op.to_vec());
        drain(&dispatch, &mut group);
        complete(group.client_mut(0).take_outcome());
    }

    // replica 3 goes down and comes back from its durable image
    let persistent = group.replica(3).persistent();
    let restored = Replica::restore(
        dispatch.register(Host::Replica(3)),
        3,
        Signer::Simulated,
        Verifier::Simulated,
        KvStore::default(),
        MemoryStore::default(),
        persistent,
    );
    group
        .nodes
        .insert(Host::Replica(3), Node::Replica(Box::new(restored)));
    drain(&dispatch, &mut group);
    assert_eq!(group.replica(3).execute_num(), 2);

    group.client_mut(0).invoke(b"put c 3".to_vec());
    drain(&dispatch, &mut group);
    let (result, hcv) = complete(group.client_mut(0).take_outcome());
    assert_eq!(result, b"ok");
    assert_eq!(group.replica(3).execute_num(), 3);
    assert_eq!(group.replica(3).hcv(), hcv);
}
