//! The replica protocol engine.
//!
//! One `Replica` value owns everything a replica knows: the log, the view
//! state, the per-client table and the hash chain. It mutates only inside
//! [`Receivers`] callbacks, so a dispatch loop delivering one event at a
//! time is the only synchronization there is. Design choice carried over
//! from unreliable-network operation: resending `Prepare` and `Commit`
//! serves a dual purpose, a local certificate piece and a demand indicator,
//! so handlers answer late senders with their own vote for slots that
//! already progressed.
//!
//! Internal invariant violations abort the replica on the spot; a replica
//! that contradicted its own hash chain must stop rather than keep
//! attesting.

use std::collections::{BTreeMap, HashMap};
use std::mem::take;

use crate::{
    app::App,
    chain::{Digest, Equivocation, Hcv, NULL_DIGEST},
    context::{
        crypto::{Signed, Signer, Verifier},
        ClientIndex, Config, Context, Host, Receivers, ReplicaIndex, SeqNum, TimerId, To, ViewNum,
    },
    message::{
        Checkpoint, CheckpointCert, Commit, CommittedEntry, Message, NewState, NewStateRequest,
        NewView, PrePrepare, Prepare, PreparedProof, Reply, Request, ViewChange,
    },
    storage::{CheckpointStore, MemoryStore, Persistent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Active,
    ViewChanging,
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SlotStatus {
    Empty,
    PrePrepared,
    Prepared,
    Committed,
    Executed,
}

#[derive(Debug, Clone)]
enum ClientEntry {
    Executing(u64),
    Executed(Signed<Reply>),
}

#[derive(Debug)]
struct LogEntry {
    view: ViewNum,
    digest: Option<Digest>,
    request: Option<Signed<Request>>,
    pre_prepare: Option<Signed<PrePrepare>>,
    prepares: HashMap<ReplicaIndex, Signed<Prepare>>,
    commits: HashMap<ReplicaIndex, Signed<Commit>>,
    status: SlotStatus,
    hcv: Option<Hcv>,
}

impl LogEntry {
    fn new(view: ViewNum) -> Self {
        Self {
            view,
            digest: None,
            request: None,
            pre_prepare: None,
            prepares: Default::default(),
            commits: Default::default(),
            status: SlotStatus::Empty,
            hcv: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
    /// A relayed request the primary has not sequenced yet.
    Request(ClientIndex, u64),
    /// A slot that stopped making progress.
    Progress(SeqNum),
    /// A view change that did not complete.
    ViewChange,
}

/// Counters behind `Replica::metrics`. Dropped-before-dispatch messages are
/// counted by the dispatch loop, these cover the engine's own drops and
/// progress. `contradictions` counts votes dropped for contradicting an
/// accepted pre-prepare, misbehavior accounting rather than an ordinary
/// malformed-message drop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub invalid: u64,
    pub out_of_range: u64,
    pub equivocations: u64,
    pub contradictions: u64,
    pub view_changes: u64,
    pub executed: u64,
    pub stable_checkpoints: u64,
}

/// Retained proof that a sender contradicted itself: two authenticated
/// messages for the same slot that should have been identical. Any sender
/// can produce one, a diverging version attached to an otherwise matching
/// vote included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    PrePrepare(Equivocation<Signed<PrePrepare>>),
    Prepare(Equivocation<Signed<Prepare>>),
    Commit(Equivocation<Signed<Commit>>),
    Checkpoint(Equivocation<Signed<Checkpoint>>),
}

impl Evidence {
    pub fn sender(&self) -> ReplicaIndex {
        match self {
            Self::PrePrepare(evidence) => evidence.sender,
            Self::Prepare(evidence) => evidence.sender,
            Self::Commit(evidence) => evidence.sender,
            Self::Checkpoint(evidence) => evidence.sender,
        }
    }
}

pub struct Replica<A, S = MemoryStore> {
    context: Context<Message>,
    id: ReplicaIndex,
    config: Config,
    signer: Signer,
    verifier: Verifier,
    app: A,
    store: S,

    status: Status,
    view: ViewNum,
    /// Next sequence number this replica hands out while primary.
    propose_num: SeqNum,
    /// The primary's running chain prediction, rebased on the executed chain
    /// whenever a view is entered.
    propose_hcv: Hcv,
    execute_num: SeqNum,
    hcv: Hcv,
    log: BTreeMap<SeqNum, LogEntry>,

    last_stable: SeqNum,
    checkpoint_proof: Vec<Signed<Checkpoint>>,
    pending_checkpoints: BTreeMap<SeqNum, HashMap<ReplicaIndex, Signed<Checkpoint>>>,
    /// Snapshot taken at each own checkpoint, promoted to `stable_state`
    /// once the checkpoint proves stable.
    pending_snapshots: BTreeMap<SeqNum, (Vec<u8>, Vec<(ClientIndex, Signed<Reply>)>)>,
    stable_state: Option<(Vec<u8>, Vec<(ClientIndex, Signed<Reply>)>)>,

    client_table: HashMap<ClientIndex, ClientEntry>,

    timers: HashMap<TimerId, TimerEvent>,
    request_timers: HashMap<(ClientIndex, u64), TimerId>,
    progress_timers: HashMap<SeqNum, TimerId>,
    view_change_attempts: u32,
    view_changes: HashMap<ViewNum, BTreeMap<ReplicaIndex, Signed<ViewChange>>>,

    equivocations: Vec<Evidence>,
    metrics: Metrics,
}

impl<A, S> Replica<A, S> {
    pub fn new(
        context: Context<Message>,
        id: ReplicaIndex,
        signer: Signer,
        verifier: Verifier,
        app: A,
        store: S,
    ) -> Self {
        let config = context.config().clone();
        Self {
            context,
            id,
            config,
            signer,
            verifier,
            app,
            store,
            status: Status::Active,
            view: 0,
            propose_num: 0,
            propose_hcv: Hcv::GENESIS,
            execute_num: 0,
            hcv: Hcv::GENESIS,
            log: Default::default(),
            last_stable: 0,
            checkpoint_proof: Default::default(),
            pending_checkpoints: Default::default(),
            pending_snapshots: Default::default(),
            stable_state: None,
            client_table: Default::default(),
            timers: Default::default(),
            request_timers: Default::default(),
            progress_timers: Default::default(),
            view_change_attempts: 0,
            view_changes: Default::default(),
            equivocations: Default::default(),
            metrics: Metrics::default(),
        }
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn view(&self) -> ViewNum {
        self.view
    }

    pub fn execute_num(&self) -> SeqNum {
        self.execute_num
    }

    pub fn hcv(&self) -> Hcv {
        self.hcv
    }

    /// Evidence of observed equivocation, any message kind, kept local.
    pub fn equivocations(&self) -> &[Evidence] {
        &self.equivocations
    }

    fn is_primary(&self) -> bool {
        self.config.primary(self.view) == self.id
    }

    fn in_window(&self, seq: SeqNum) -> bool {
        seq > self.last_stable && seq <= self.last_stable + self.config.log_window()
    }
}

impl<A, S> Receivers for Replica<A, S>
where
    A: App,
    S: CheckpointStore,
{
    type Message = Message;

    fn handle(&mut self, receiver: Host, _remote: Host, message: Message) {
        assert_eq!(receiver, Host::Replica(self.id));
        match message {
            Message::Request(request) => self.handle_request(request),
            Message::PrePrepare(pre_prepare, request) => {
                self.handle_pre_prepare(pre_prepare, request)
            }
            Message::Prepare(prepare) => self.handle_prepare(prepare),
            Message::Commit(commit) => self.handle_commit(commit),
            Message::Checkpoint(checkpoint) => self.handle_checkpoint(checkpoint),
            Message::ViewChange(view_change) => self.handle_view_change(view_change),
            Message::NewView(new_view) => self.handle_new_view(new_view),
            Message::NewStateRequest(request) => self.handle_new_state_request(request),
            Message::NewState(new_state) => self.handle_new_state(new_state),
            Message::Reply(_) => self.metrics.invalid += 1,
        }
    }

    fn on_timer(&mut self, receiver: Host, id: TimerId) {
        assert_eq!(receiver, Host::Replica(self.id));
        // fires of timers unset in the meantime are stale, the token is gone
        let Some(&event) = self.timers.get(&id) else {
            return;
        };
        match event {
            TimerEvent::Request(client_id, request_num) => {
                tracing::debug!(
                    replica = self.id,
                    client_id,
                    request_num,
                    "request timed out"
                );
                self.start_view_change(self.view + 1)
            }
            TimerEvent::Progress(seq) => {
                tracing::debug!(replica = self.id, seq, "slot stalled");
                self.start_view_change(self.view + 1)
            }
            TimerEvent::ViewChange => {
                tracing::debug!(replica = self.id, view = self.view, "view change timed out");
                self.start_view_change(self.view + 1)
            }
        }
    }
}

impl<A, S> Replica<A, S>
where
    A: App,
    S: CheckpointStore,
{
    fn handle_request(&mut self, request: Signed<Request>) {
        if self.status != Status::Active {
            return;
        }
        match self.client_table.get(&request.client_id) {
            Some(ClientEntry::Executed(reply)) if reply.request_num >= request.request_num => {
                // at-most-once: old timestamps are answered by replaying the
                // last reply, never by a second execution
                let reply = reply.clone();
                self.context.send(To::client(request.client_id), reply);
                return;
            }
            Some(ClientEntry::Executing(request_num)) if *request_num >= request.request_num => {
                return
            }
            _ => {}
        }

        if !self.is_primary() {
            self.client_table.insert(
                request.client_id,
                ClientEntry::Executing(request.request_num),
            );
            let key = (request.client_id, request.request_num);
            let primary = self.config.primary(self.view);
            self.context.send(To::replica(primary), request);
            if !self.request_timers.contains_key(&key) {
                let id = self.set_timer(
                    self.config.request_timeout,
                    TimerEvent::Request(key.0, key.1),
                );
                self.request_timers.insert(key, id);
            }
            return;
        }

        if !self.in_window(self.propose_num + 1) {
            self.metrics.out_of_range += 1;
            return;
        }
        self.propose_num += 1;
        let seq = self.propose_num;
        let digest = request.digest();
        self.propose_hcv = self.propose_hcv.extend(&digest, seq, self.view);
        let pre_prepare = self.signer.sign_private(PrePrepare {
            view: self.view,
            seq,
            digest,
            hcv: self.propose_hcv,
        });
        self.client_table.insert(
            request.client_id,
            ClientEntry::Executing(request.request_num),
        );

        let view = self.view;
        let entry = self.log.entry(seq).or_insert_with(|| LogEntry::new(view));
        assert_eq!(entry.status, SlotStatus::Empty);
        entry.digest = Some(digest);
        entry.request = Some(request.clone());
        entry.pre_prepare = Some(pre_prepare.clone());
        entry.status = SlotStatus::PrePrepared;
        entry.prepares.retain(|_, prepare| prepare.digest == digest);
        entry.commits.retain(|_, commit| commit.digest == digest);

        self.context
            .send(To::AllReplica, (pre_prepare, request));
        self.ensure_progress_timer(seq);
        self.check_prepared(seq);
    }

    fn handle_pre_prepare(&mut self, pre_prepare: Signed<PrePrepare>, request: Signed<Request>) {
        if self.status != Status::Active || pre_prepare.view != self.view {
            if pre_prepare.view > self.view {
                self.metrics.out_of_range += 1;
            }
            return;
        }
        if self.is_primary() {
            // only the primary sequences; its own proposals never loop back
            self.metrics.invalid += 1;
            return;
        }
        let seq = pre_prepare.seq;
        if !self.in_window(seq) {
            self.metrics.out_of_range += 1;
            return;
        }
        if request.digest() != pre_prepare.digest {
            self.metrics.invalid += 1;
            return;
        }

        if let Some(entry) = self.log.get(&seq) {
            // an already certified slot is settled, a pre-prepare cannot
            // reopen it; answer the implied demand instead
            if entry.status >= SlotStatus::Committed {
                if let Some(commit) = entry.commits.get(&self.id).cloned() {
                    let primary = self.config.primary(self.view);
                    self.context.send(To::replica(primary), commit);
                }
                return;
            }
            if let Some(accepted) = &entry.pre_prepare {
                if entry.view == self.view {
                    if accepted.digest == pre_prepare.digest {
                        // idempotent; answer the (re)sender's implied demand
                        if let Some(prepare) = entry.prepares.get(&self.id).cloned() {
                            let primary = self.config.primary(self.view);
                            self.context.send(To::replica(primary), prepare);
                        }
                    } else {
                        // two digests for one slot signed by the primary
                        self.record_equivocation(accepted.clone(), pre_prepare);
                    }
                    return;
                }
            }
        }

        let view = self.view;
        let entry = self.log.entry(seq).or_insert_with(|| LogEntry::new(view));
        entry.view = view;
        entry.digest = Some(pre_prepare.digest);
        entry.request = Some(request.clone());
        entry.pre_prepare = Some(pre_prepare);
        entry.status = entry.status.max(SlotStatus::PrePrepared);
        // buffered votes that contradict the now known digest are shed
        let digest = pre_prepare_digest(entry);
        entry.prepares.retain(|_, prepare| prepare.digest == digest);
        entry.commits.retain(|_, commit| commit.digest == digest);

        self.client_table
            .entry(request.client_id)
            .or_insert(ClientEntry::Executing(request.request_num));
        self.cancel_request_timer(request.client_id, request.request_num);
        self.ensure_progress_timer(seq);

        let prepare = self.signer.sign_private(Prepare {
            view: self.view,
            seq,
            digest,
            hcv: self.hcv,
            replica_id: self.id,
        });
        self.log
            .get_mut(&seq)
            .unwrap()
            .prepares
            .insert(self.id, prepare.clone());
        self.context.send(To::AllReplica, prepare);
        self.check_prepared(seq);
    }

    fn handle_prepare(&mut self, prepare: Signed<Prepare>) {
        if self.status != Status::Active || prepare.view != self.view {
            if prepare.view > self.view {
                self.metrics.out_of_range += 1;
            }
            return;
        }
        if !self.in_window(prepare.seq) {
            self.metrics.out_of_range += 1;
            return;
        }
        if prepare.replica_id == self.id
            || prepare.replica_id == self.config.primary(self.view)
        {
            self.metrics.invalid += 1;
            return;
        }
        let seq = prepare.seq;
        let view = self.view;
        let entry = self.log.entry(seq).or_insert_with(|| LogEntry::new(view));
        // a second prepare from one sender must say the same thing, a
        // diverging version included; anything else is proof it forked
        let evidence = match entry.prepares.get(&prepare.replica_id) {
            Some(prior) if prior.inner != prepare.inner => Some(Equivocation {
                sender: prepare.replica_id,
                view: prepare.view,
                seq,
                first: prior.clone(),
                second: prepare.clone(),
            }),
            _ => None,
        };
        if let Some(evidence) = evidence {
            self.record_evidence(Evidence::Prepare(evidence));
            return;
        }
        if entry.status >= SlotStatus::Prepared {
            // late sender; our commit doubles as the answer
            if let Some(commit) = entry.commits.get(&self.id).cloned() {
                self.context
                    .send(To::replica(prepare.replica_id), commit);
            }
            return;
        }
        if let Some(digest) = entry.digest {
            if digest != prepare.digest {
                // contradicts the accepted pre-prepare: dropped, but counted
                // for misbehavior accounting
                self.metrics.contradictions += 1;
                return;
            }
        }
        entry.prepares.insert(prepare.replica_id, prepare);
        self.ensure_progress_timer(seq);
        self.check_prepared(seq);
    }

    fn handle_commit(&mut self, commit: Signed<Commit>) {
        if self.status != Status::Active || commit.view != self.view {
            if commit.view > self.view {
                self.metrics.out_of_range += 1;
            }
            return;
        }
        if !self.in_window(commit.seq) {
            self.metrics.out_of_range += 1;
            return;
        }
        if commit.replica_id == self.id {
            self.metrics.invalid += 1;
            return;
        }
        let seq = commit.seq;
        let view = self.view;
        let entry = self.log.entry(seq).or_insert_with(|| LogEntry::new(view));
        let evidence = match entry.commits.get(&commit.replica_id) {
            Some(prior) if prior.inner != commit.inner => Some(Equivocation {
                sender: commit.replica_id,
                view: commit.view,
                seq,
                first: prior.clone(),
                second: commit.clone(),
            }),
            _ => None,
        };
        if let Some(evidence) = evidence {
            let sender = evidence.sender;
            self.record_evidence(Evidence::Commit(evidence));
            if sender == self.config.primary(self.view) {
                self.start_view_change(self.view + 1);
            }
            return;
        }
        if entry.status >= SlotStatus::Committed {
            if let Some(own) = entry.commits.get(&self.id).cloned() {
                self.context.send(To::replica(commit.replica_id), own);
            }
            return;
        }
        if let Some(digest) = entry.digest {
            if digest != commit.digest {
                self.metrics.contradictions += 1;
                return;
            }
        }
        entry.commits.insert(commit.replica_id, commit);
        self.ensure_progress_timer(seq);
        self.check_committed(seq);
    }

    /// A prepared certificate is the pre-prepare plus `2f` matching prepares
    /// from distinct replicas; a backup's own prepare counts, the primary's
    /// pre-prepare stands in for its vote.
    fn check_prepared(&mut self, seq: SeqNum) {
        let Some(entry) = self.log.get(&seq) else {
            return;
        };
        if entry.status != SlotStatus::PrePrepared
            || entry.pre_prepare.is_none()
            || entry.prepares.len() < 2 * self.config.num_faulty
        {
            return;
        }
        let digest = pre_prepare_digest(entry);
        let commit = self.signer.sign_private(Commit {
            view: self.view,
            seq,
            digest,
            hcv: self.hcv,
            replica_id: self.id,
        });
        let entry = self.log.get_mut(&seq).unwrap();
        entry.status = SlotStatus::Prepared;
        entry.commits.insert(self.id, commit.clone());
        self.context.send(To::AllReplica, commit);
        self.check_committed(seq);
    }

    /// A committed certificate is `2f + 1` matching commits from distinct
    /// replicas. A slot may reach it straight from empty when the
    /// certificate arrives before the earlier phases.
    fn check_committed(&mut self, seq: SeqNum) {
        let Some(entry) = self.log.get_mut(&seq) else {
            return;
        };
        if entry.status >= SlotStatus::Committed {
            return;
        }
        let quorum = 2 * self.config.num_faulty + 1;
        let digest = match entry.digest {
            Some(digest) => {
                if entry.commits.len() < quorum {
                    return;
                }
                digest
            }
            None => {
                // catch-up: find a digest carried by a full certificate
                let mut counts = HashMap::new();
                for commit in entry.commits.values() {
                    *counts.entry(commit.digest).or_insert(0usize) += 1;
                }
                match counts.into_iter().find(|(_, count)| *count >= quorum) {
                    Some((digest, _)) => digest,
                    None => return,
                }
            }
        };
        entry.digest = Some(digest);
        entry.commits.retain(|_, commit| commit.digest == digest);
        entry.status = SlotStatus::Committed;
        self.cancel_progress_timer(seq);
        self.execute();
        if self.execute_num < seq {
            // committed above a gap, someone has what we miss
            self.solicit_state();
        }
    }

    /// Apply committed operations strictly in sequence order, extending the
    /// hash chain exactly here.
    fn execute(&mut self) {
        loop {
            let seq = self.execute_num + 1;
            let Some(entry) = self.log.get(&seq) else {
                break;
            };
            if entry.status != SlotStatus::Committed {
                break;
            }
            let digest = entry.digest.expect("committed entry carries a digest");
            let view = entry.view;
            let request = entry.request.clone();

            if digest == NULL_DIGEST {
                // a no-op slot from a view change extends the chain and
                // nothing else
                self.hcv = self.hcv.extend(&NULL_DIGEST, seq, view);
            } else {
                let Some(request) = request else {
                    // certificate without payload, wait for a state transfer
                    self.solicit_state();
                    break;
                };
                self.hcv = self.hcv.extend(&digest, seq, view);
                let replay = match self.client_table.get(&request.client_id) {
                    Some(ClientEntry::Executed(reply))
                        if reply.request_num >= request.request_num =>
                    {
                        Some(reply.clone())
                    }
                    _ => None,
                };
                match replay {
                    Some(reply) => {
                        // the operation was applied under an earlier sequence
                        // number, never apply it twice
                        if reply.request_num == request.request_num {
                            self.context.send(To::client(request.client_id), reply);
                        }
                    }
                    None => {
                        let result = self.app.execute(seq, &request.op);
                        let reply = self.signer.sign_private(Reply {
                            view: self.view,
                            seq,
                            request_num: request.request_num,
                            client_id: request.client_id,
                            replica_id: self.id,
                            result,
                            hcv: self.hcv,
                        });
                        self.client_table
                            .insert(request.client_id, ClientEntry::Executed(reply.clone()));
                        self.context.send(To::client(request.client_id), reply);
                    }
                }
                self.cancel_request_timer(request.client_id, request.request_num);
            }

            let entry = self.log.get_mut(&seq).unwrap();
            entry.status = SlotStatus::Executed;
            entry.hcv = Some(self.hcv);
            self.execute_num = seq;
            self.metrics.executed += 1;
            self.cancel_progress_timer(seq);

            if seq % self.config.checkpoint_interval == 0 {
                self.take_checkpoint(seq);
            }
        }
    }

    fn take_checkpoint(&mut self, seq: SeqNum) {
        let mut reply_cache = Vec::from_iter(self.client_table.iter().filter_map(
            |(&client_id, entry)| match entry {
                ClientEntry::Executed(reply) => Some((client_id, reply.clone())),
                ClientEntry::Executing(_) => None,
            },
        ));
        reply_cache.sort_by_key(|(client_id, _)| *client_id);
        self.pending_snapshots
            .insert(seq, (self.app.snapshot(), reply_cache));

        let checkpoint = self.signer.sign_public(Checkpoint {
            seq,
            state_digest: self.app.digest(),
            hcv: self.hcv,
            replica_id: self.id,
        });
        self.pending_checkpoints
            .entry(seq)
            .or_default()
            .insert(self.id, checkpoint.clone());
        self.context.send(To::AllReplica, checkpoint);
        self.check_stable(seq);
    }

    fn handle_checkpoint(&mut self, checkpoint: Signed<Checkpoint>) {
        if checkpoint.seq <= self.last_stable || checkpoint.replica_id == self.id {
            return;
        }
        if !self.in_window(checkpoint.seq) {
            // evidence of progress far beyond our window, ask for the state
            // instead of buffering unboundedly
            self.metrics.out_of_range += 1;
            self.solicit_state();
            return;
        }
        let seq = checkpoint.seq;
        let pending = self.pending_checkpoints.entry(seq).or_default();
        let evidence = match pending.get(&checkpoint.replica_id) {
            Some(prior) if prior.inner != checkpoint.inner => Some(Equivocation {
                sender: checkpoint.replica_id,
                view: self.view,
                seq,
                first: prior.clone(),
                second: checkpoint.clone(),
            }),
            _ => None,
        };
        if let Some(evidence) = evidence {
            self.record_evidence(Evidence::Checkpoint(evidence));
            return;
        }
        pending.insert(checkpoint.replica_id, checkpoint);
        self.check_stable(seq);
    }

    fn check_stable(&mut self, seq: SeqNum) {
        let Some(pending) = self.pending_checkpoints.get(&seq) else {
            return;
        };
        let quorum = 2 * self.config.num_faulty + 1;
        if pending.len() < quorum {
            return;
        }
        let mut counts = HashMap::new();
        for checkpoint in pending.values() {
            *counts
                .entry((checkpoint.state_digest, checkpoint.hcv))
                .or_insert(0usize) += 1;
        }
        let Some((reference, _)) = counts.into_iter().find(|(_, count)| *count >= quorum) else {
            return;
        };
        let proof = Vec::from_iter(
            pending
                .values()
                .filter(|checkpoint| (checkpoint.state_digest, checkpoint.hcv) == reference)
                .cloned(),
        );
        self.make_stable(seq, proof);
    }

    fn make_stable(&mut self, seq: SeqNum, proof: Vec<Signed<Checkpoint>>) {
        assert!(seq > self.last_stable);
        let reference = proof[0].inner;
        tracing::info!(replica = self.id, seq, hcv = %reference.hcv, "checkpoint stable");
        self.last_stable = seq;
        self.checkpoint_proof = proof;
        self.store.save(seq, reference.state_digest, reference.hcv);
        self.store.truncate_below(seq);
        self.log.retain(|&logged, _| logged > seq);
        self.pending_checkpoints.retain(|&pending, _| pending > seq);
        if let Some(state) = self.pending_snapshots.remove(&seq) {
            self.stable_state = Some(state);
        }
        self.pending_snapshots.retain(|&pending, _| pending > seq);
        self.metrics.stable_checkpoints += 1;

        if seq > self.execute_num {
            // the rest of the system certified state we never reached
            tracing::debug!(replica = self.id, seq, "behind a stable checkpoint, recovering");
            self.stable_state = None;
            self.status = Status::Recovering;
            self.solicit_state();
        }
    }

    fn solicit_state(&mut self) {
        let request = self.signer.sign_private(NewStateRequest {
            seq: self.execute_num,
            replica_id: self.id,
        });
        self.context.send(To::AllReplica, request);
    }

    fn handle_new_state_request(&mut self, request: Signed<NewStateRequest>) {
        if request.replica_id == self.id || request.seq >= self.execute_num {
            return;
        }
        let checkpoint = if request.seq < self.last_stable {
            let Some((app_snapshot, reply_cache)) = self.stable_state.clone() else {
                return;
            };
            let reference = self.checkpoint_proof[0].inner;
            Some(CheckpointCert {
                seq: self.last_stable,
                state_digest: reference.state_digest,
                hcv: reference.hcv,
                proof: self.checkpoint_proof.clone(),
                app_snapshot,
                reply_cache,
            })
        } else {
            None
        };
        let quorum = 2 * self.config.num_faulty + 1;
        let entries = Vec::from_iter(
            self.log
                .range(request.seq.max(self.last_stable) + 1..=self.execute_num)
                .filter(|(_, entry)| {
                    entry.status >= SlotStatus::Committed && entry.commits.len() >= quorum
                })
                .map(|(&seq, entry)| CommittedEntry {
                    view: entry.view,
                    seq,
                    digest: entry.digest.expect("committed entry carries a digest"),
                    request: entry.request.clone(),
                    commits: entry.commits.values().cloned().collect(),
                }),
        );
        if checkpoint.is_none() && entries.is_empty() {
            return;
        }
        let new_state = self.signer.sign_private(NewState {
            view: self.view,
            checkpoint,
            entries,
            replica_id: self.id,
        });
        self.context
            .send(To::replica(request.replica_id), new_state);
    }

    fn handle_new_state(&mut self, new_state: Signed<NewState>) {
        if new_state.replica_id == self.id {
            return;
        }
        self.apply_new_state(&new_state);
    }

    fn apply_new_state(&mut self, new_state: &NewState) {
        if let Some(cert) = &new_state.checkpoint {
            if cert.seq > self.execute_num {
                if cert.validate(&self.verifier, &self.config).is_err() {
                    self.metrics.invalid += 1;
                    return;
                }
                self.app.install(&cert.app_snapshot);
                if self.app.digest() != cert.state_digest {
                    // garbled snapshot despite a valid proof, try elsewhere
                    self.metrics.invalid += 1;
                    self.solicit_state();
                    return;
                }
                self.hcv = cert.hcv;
                self.execute_num = cert.seq;
                self.last_stable = cert.seq;
                self.checkpoint_proof = cert.proof.clone();
                self.stable_state = Some((cert.app_snapshot.clone(), cert.reply_cache.clone()));
                self.store.save(cert.seq, cert.state_digest, cert.hcv);
                self.store.truncate_below(cert.seq);
                self.log.retain(|&seq, _| seq > cert.seq);
                self.pending_checkpoints.retain(|&seq, _| seq > cert.seq);
                self.client_table = cert
                    .reply_cache
                    .iter()
                    .map(|(client_id, reply)| (*client_id, ClientEntry::Executed(reply.clone())))
                    .collect();
                self.metrics.stable_checkpoints += 1;
            }
        }
        let mut entries = Vec::from_iter(new_state.entries.iter());
        entries.sort_by_key(|entry| entry.seq);
        for entry in entries {
            if entry.seq <= self.execute_num || !self.in_window(entry.seq) {
                continue;
            }
            if entry.validate(&self.verifier, &self.config).is_err() {
                self.metrics.invalid += 1;
                continue;
            }
            let slot = self
                .log
                .entry(entry.seq)
                .or_insert_with(|| LogEntry::new(entry.view));
            if slot.status >= SlotStatus::Committed {
                continue;
            }
            slot.view = entry.view;
            slot.digest = Some(entry.digest);
            slot.request = entry.request.clone();
            slot.pre_prepare = None;
            slot.commits = entry
                .commits
                .iter()
                .map(|commit| (commit.replica_id, commit.clone()))
                .collect();
            slot.status = SlotStatus::Committed;
            self.cancel_progress_timer(entry.seq);
        }
        self.execute();
        if self.status == Status::Recovering {
            if new_state.view > self.view {
                self.view = new_state.view;
            }
            if self.execute_num >= self.last_stable {
                self.status = Status::Active;
            }
        }
    }

    fn record_evidence(&mut self, evidence: Evidence) {
        tracing::warn!(
            replica = self.id,
            sender = evidence.sender(),
            "conflicting attestations from one sender"
        );
        self.metrics.equivocations += 1;
        self.equivocations.push(evidence);
    }

    fn record_equivocation(&mut self, first: Signed<PrePrepare>, second: Signed<PrePrepare>) {
        assert_eq!(first.seq, second.seq);
        self.record_evidence(Evidence::PrePrepare(Equivocation {
            sender: self.config.primary(self.view),
            view: self.view,
            seq: first.seq,
            first,
            second,
        }));
        self.start_view_change(self.view + 1);
    }

    fn start_view_change(&mut self, new_view: ViewNum) {
        if new_view <= self.view {
            return;
        }
        tracing::debug!(replica = self.id, from = self.view, to = new_view, "view change");
        self.unset_all_timers();
        self.view = new_view;
        self.status = Status::ViewChanging;
        self.metrics.view_changes += 1;

        self.view_change_attempts += 1;
        let backoff = 1u32 << (self.view_change_attempts - 1).min(10);
        self.set_timer(
            self.config.view_change_timeout * backoff,
            TimerEvent::ViewChange,
        );

        let prepared = Vec::from_iter(
            self.log
                .range(self.last_stable + 1..)
                .filter(|(_, entry)| {
                    entry.status >= SlotStatus::Prepared
                        && entry.pre_prepare.is_some()
                        && entry.view < new_view
                })
                .map(|(_, entry)| PreparedProof {
                    pre_prepare: entry.pre_prepare.clone().unwrap(),
                    request: entry.request.clone(),
                    prepares: entry.prepares.values().cloned().collect(),
                }),
        );
        let view_change = self.signer.sign_public(ViewChange {
            view: new_view,
            last_stable: self.last_stable,
            checkpoint_proof: self.checkpoint_proof.clone(),
            prepared,
            hcv: self.hcv,
            replica_id: self.id,
        });
        self.view_changes
            .entry(new_view)
            .or_default()
            .insert(self.id, view_change.clone());
        self.context.send(To::AllReplica, view_change);
        self.check_new_view(new_view);
    }

    fn handle_view_change(&mut self, view_change: Signed<ViewChange>) {
        let joining = view_change.view > self.view;
        let gathering =
            view_change.view == self.view && self.status == Status::ViewChanging;
        if !joining && !gathering {
            return;
        }
        if view_change.replica_id == self.id {
            return;
        }
        if view_change.validate(&self.verifier, &self.config).is_err() {
            self.metrics.invalid += 1;
            return;
        }
        let view = view_change.view;
        self.view_changes
            .entry(view)
            .or_default()
            .insert(view_change.replica_id, view_change);

        // f + 1 replicas already moved on, no correct replica stays behind
        if view > self.view
            && self.view_changes[&view].len() > self.config.num_faulty
        {
            self.start_view_change(view);
            return;
        }
        self.check_new_view(view);
    }

    fn check_new_view(&mut self, view: ViewNum) {
        if self.view != view
            || self.status != Status::ViewChanging
            || self.config.primary(view) != self.id
        {
            return;
        }
        let Some(view_changes) = self.view_changes.get(&view) else {
            return;
        };
        if view_changes.len() < 2 * self.config.num_faulty + 1 {
            return;
        }
        let view_changes = Vec::from_iter(view_changes.values().cloned());
        let selection = select_new_view(&view_changes);
        let mut chain = self.hcv;
        let pre_prepares = Vec::from_iter(selection.into_iter().map(|(seq, digest, request)| {
            chain = chain.extend(&digest, seq, view);
            let pre_prepare = self.signer.sign_private(PrePrepare {
                view,
                seq,
                digest,
                hcv: chain,
            });
            (pre_prepare, request)
        }));
        let new_view = self.signer.sign_public(NewView {
            view,
            view_changes,
            pre_prepares,
        });
        tracing::info!(replica = self.id, view, "assembled new view");
        self.context.send(To::AllReplica, new_view.clone());
        self.install_new_view(&new_view);
    }

    fn handle_new_view(&mut self, new_view: Signed<NewView>) {
        if new_view.view < self.view
            || (new_view.view == self.view && self.status == Status::Active)
        {
            return;
        }
        if self.config.primary(new_view.view) == self.id {
            return;
        }
        if self.validate_new_view(&new_view).is_err() {
            self.metrics.invalid += 1;
            return;
        }
        self.install_new_view(&new_view);
    }

    fn validate_new_view(&self, new_view: &NewView) -> Result<(), ()> {
        let mut senders = std::collections::HashSet::new();
        for view_change in &new_view.view_changes {
            if view_change.view != new_view.view
                || self
                    .verifier
                    .verify_replica(view_change, view_change.replica_id)
                    .is_err()
                || view_change.validate(&self.verifier, &self.config).is_err()
                || !senders.insert(view_change.replica_id)
            {
                return Err(());
            }
        }
        if senders.len() < 2 * self.config.num_faulty + 1 {
            return Err(());
        }
        let selection = select_new_view(&new_view.view_changes);
        if selection.len() != new_view.pre_prepares.len() {
            return Err(());
        }
        for ((seq, digest, _), (pre_prepare, request)) in
            selection.iter().zip(&new_view.pre_prepares)
        {
            if pre_prepare.view != new_view.view
                || pre_prepare.seq != *seq
                || pre_prepare.digest != *digest
                || self
                    .verifier
                    .verify_primary(pre_prepare, new_view.view)
                    .is_err()
            {
                return Err(());
            }
            match request {
                Some(request) => {
                    if request.digest() != *digest {
                        return Err(());
                    }
                }
                None => {
                    if *digest != NULL_DIGEST {
                        return Err(());
                    }
                }
            }
        }
        Ok(())
    }

    fn install_new_view(&mut self, new_view: &NewView) {
        self.unset_all_timers();

        // adopt the highest stable checkpoint the quorum attested
        let best = new_view
            .view_changes
            .iter()
            .max_by_key(|view_change| view_change.last_stable)
            .expect("new view carries a quorum");
        if best.last_stable > self.last_stable {
            let seq = best.last_stable;
            self.last_stable = seq;
            self.checkpoint_proof = best.checkpoint_proof.clone();
            self.stable_state = None;
            self.log.retain(|&logged, _| logged > seq);
            self.pending_checkpoints.retain(|&pending, _| pending > seq);
            self.pending_snapshots.retain(|&pending, _| pending > seq);
        }

        self.view = new_view.view;
        self.status = if self.execute_num < self.last_stable {
            self.solicit_state();
            Status::Recovering
        } else {
            Status::Active
        };
        self.view_change_attempts = 0;
        self.view_changes.retain(|&view, _| view > new_view.view);

        // the protocol restarts for everything the new primary carried over
        self.log.retain(|_, entry| entry.status >= SlotStatus::Executed);

        let mut max_seq = self.last_stable;
        for (pre_prepare, request) in &new_view.pre_prepares {
            let seq = pre_prepare.seq;
            max_seq = max_seq.max(seq);
            if seq <= self.execute_num {
                continue;
            }
            let entry = self
                .log
                .entry(seq)
                .or_insert_with(|| LogEntry::new(new_view.view));
            entry.view = new_view.view;
            entry.digest = Some(pre_prepare.digest);
            entry.request = request.clone();
            entry.pre_prepare = Some(pre_prepare.clone());
            entry.prepares = Default::default();
            entry.commits = Default::default();
            entry.status = SlotStatus::PrePrepared;
        }
        self.propose_num = max_seq.max(self.execute_num);
        self.propose_hcv = self.hcv;

        if !self.is_primary() && self.status == Status::Active {
            let seqs = Vec::from_iter(
                new_view
                    .pre_prepares
                    .iter()
                    .map(|(pre_prepare, _)| pre_prepare.seq)
                    .filter(|&seq| seq > self.execute_num),
            );
            for seq in seqs {
                let digest = pre_prepare_digest(&self.log[&seq]);
                let prepare = self.signer.sign_private(Prepare {
                    view: self.view,
                    seq,
                    digest,
                    hcv: self.hcv,
                    replica_id: self.id,
                });
                self.log
                    .get_mut(&seq)
                    .unwrap()
                    .prepares
                    .insert(self.id, prepare.clone());
                self.context.send(To::AllReplica, prepare);
                self.ensure_progress_timer(seq);
                self.check_prepared(seq);
            }
        } else if self.is_primary() {
            let seqs = Vec::from_iter(
                new_view
                    .pre_prepares
                    .iter()
                    .map(|(pre_prepare, _)| pre_prepare.seq)
                    .filter(|&seq| seq > self.execute_num),
            );
            for seq in seqs {
                self.ensure_progress_timer(seq);
            }
        }
        tracing::debug!(replica = self.id, view = self.view, "entered view");
    }

    fn ensure_progress_timer(&mut self, seq: SeqNum) {
        if self.progress_timers.contains_key(&seq) {
            return;
        }
        let id = self.set_timer(self.config.request_timeout, TimerEvent::Progress(seq));
        self.progress_timers.insert(seq, id);
    }

    fn cancel_progress_timer(&mut self, seq: SeqNum) {
        if let Some(id) = self.progress_timers.remove(&seq) {
            self.unset_timer(id);
        }
    }

    fn cancel_request_timer(&mut self, client_id: ClientIndex, request_num: u64) {
        if let Some(id) = self.request_timers.remove(&(client_id, request_num)) {
            self.unset_timer(id);
        }
    }

    fn set_timer(&mut self, duration: std::time::Duration, event: TimerEvent) -> TimerId {
        let id = self.context.set(duration);
        self.timers.insert(id, event);
        id
    }

    fn unset_timer(&mut self, id: TimerId) {
        if self.timers.remove(&id).is_some() {
            self.context.unset(id);
        }
    }

    fn unset_all_timers(&mut self) {
        for (id, _) in take(&mut self.timers) {
            self.context.unset(id);
        }
        self.request_timers.clear();
        self.progress_timers.clear();
    }
}

fn pre_prepare_digest(entry: &LogEntry) -> Digest {
    entry
        .pre_prepare
        .as_ref()
        .expect("accepted slot carries a pre-prepare")
        .digest
}

/// The new-view selection rule: for every sequence number between the
/// highest stable checkpoint in the quorum and the highest prepared
/// sequence, take the request prepared in the highest view any member
/// reported, or a null operation where nobody prepared anything.
/// Deterministic, so backups recompute it to check the primary.
fn select_new_view(
    view_changes: &[Signed<ViewChange>],
) -> Vec<(SeqNum, Digest, Option<Signed<Request>>)> {
    let base = view_changes
        .iter()
        .map(|view_change| view_change.last_stable)
        .max()
        .unwrap_or(0);
    let mut best: BTreeMap<SeqNum, &PreparedProof> = BTreeMap::new();
    for view_change in view_changes {
        for proof in &view_change.prepared {
            let seq = proof.pre_prepare.seq;
            if seq <= base {
                continue;
            }
            let better = match best.get(&seq) {
                None => true,
                Some(known) => {
                    let key = |proof: &PreparedProof| {
                        (proof.pre_prepare.view, proof.pre_prepare.digest)
                    };
                    key(proof) > key(known)
                }
            };
            if better {
                best.insert(seq, proof);
            }
        }
    }
    let Some(&high) = best.keys().last() else {
        return Vec::new();
    };
    Vec::from_iter((base + 1..=high).map(|seq| match best.get(&seq) {
        Some(proof) => (
            seq,
            proof.pre_prepare.digest,
            proof.request.clone(),
        ),
        None => (seq, NULL_DIGEST, None),
    }))
}

impl<A, S> Replica<A, S>
where
    A: App,
    S: CheckpointStore,
{
    /// Durable image of this replica, what §restart needs to find on disk.
    pub fn persistent(&self) -> Persistent {
        let checkpoint = self.stable_state.as_ref().map(|(app_snapshot, reply_cache)| {
            let reference = self.checkpoint_proof[0].inner;
            CheckpointCert {
                seq: self.last_stable,
                state_digest: reference.state_digest,
                hcv: reference.hcv,
                proof: self.checkpoint_proof.clone(),
                app_snapshot: app_snapshot.clone(),
                reply_cache: reply_cache.clone(),
            }
        });
        let quorum = 2 * self.config.num_faulty + 1;
        let entries = Vec::from_iter(
            self.log
                .range(self.last_stable + 1..=self.execute_num)
                .filter(|(_, entry)| {
                    entry.status >= SlotStatus::Committed && entry.commits.len() >= quorum
                })
                .map(|(&seq, entry)| CommittedEntry {
                    view: entry.view,
                    seq,
                    digest: entry.digest.expect("committed entry carries a digest"),
                    request: entry.request.clone(),
                    commits: entry.commits.values().cloned().collect(),
                }),
        );
        Persistent {
            view: self.view,
            execute_num: self.execute_num,
            hcv: self.hcv,
            checkpoint,
            entries,
        }
    }

    /// Rebuild a replica from its durable image. It re-enters recovering and
    /// solicits whatever the group committed while it was down.
    pub fn restore(
        context: Context<Message>,
        id: ReplicaIndex,
        signer: Signer,
        verifier: Verifier,
        app: A,
        store: S,
        persistent: Persistent,
    ) -> Self {
        let mut replica = Self::new(context, id, signer, verifier, app, store);
        replica.status = Status::Recovering;
        replica.view = persistent.view;
        let new_state = NewState {
            view: persistent.view,
            checkpoint: persistent.checkpoint,
            entries: persistent.entries,
            replica_id: id,
        };
        replica.apply_new_state(&new_state);
        replica.status = Status::Recovering;
        replica.solicit_state();
        if replica.execute_num >= replica.last_stable {
            replica.status = Status::Active;
        }
        replica
    }
}
