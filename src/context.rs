use std::time::Duration;

use serde::Serialize;

use self::crypto::Sign;

pub mod crypto;
pub mod simulated;
pub mod tokio;

pub type ReplicaIndex = u8;
pub type ClientIndex = u16;
pub type ViewNum = u32;
pub type SeqNum = u64;

/// Protocol parameters shared by every replica and client of one deployment.
///
/// `num_replica` must be at least `3 * num_faulty + 1`. The sequence window a
/// replica is willing to buffer is derived from the checkpoint interval, so
/// the log cannot grow without a checkpoint becoming stable first.
#[derive(Debug, Clone)]
pub struct Config {
    pub num_replica: usize,
    pub num_faulty: usize,
    pub checkpoint_interval: SeqNum,
    pub request_timeout: Duration,
    pub view_change_timeout: Duration,
}

impl Config {
    pub fn new(num_replica: usize, num_faulty: usize) -> Self {
        assert!(num_replica >= 3 * num_faulty + 1);
        Self {
            num_replica,
            num_faulty,
            checkpoint_interval: 100,
            request_timeout: Duration::from_millis(400),
            view_change_timeout: Duration::from_secs(1),
        }
    }

    pub fn primary(&self, view: ViewNum) -> ReplicaIndex {
        (view as usize % self.num_replica) as _
    }

    /// Highest sequence number accepted above the last stable checkpoint.
    pub fn log_window(&self) -> SeqNum {
        2 * self.checkpoint_interval
    }
}

#[derive(Debug)]
pub enum Context<M> {
    Tokio(tokio::Context),
    Simulated(simulated::Context<M>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Host {
    Client(ClientIndex),
    Replica(ReplicaIndex),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum To {
    Host(Host),
    Hosts(Vec<Host>),
    AllReplica,
}

impl To {
    pub fn replica(index: ReplicaIndex) -> Self {
        Self::Host(Host::Replica(index))
    }

    pub fn client(index: ClientIndex) -> Self {
        Self::Host(Host::Client(index))
    }
}

impl<M> Context<M> {
    pub fn config(&self) -> &Config {
        match self {
            Self::Tokio(context) => &context.config.protocol,
            Self::Simulated(context) => context.config.as_ref(),
        }
    }

    pub fn num_faulty(&self) -> usize {
        self.config().num_faulty
    }

    pub fn num_replica(&self) -> usize {
        self.config().num_replica
    }

    pub fn send<N>(&mut self, to: To, message: N)
    where
        M: Sign<N> + Serialize + Clone,
    {
        match self {
            Self::Tokio(context) => context.send::<M, _>(to, message),
            Self::Simulated(context) => context.send(to, message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerId {
    Tokio(tokio::TimerId),
    Simulated(simulated::TimerId),
}

impl<M> Context<M> {
    pub fn set(&mut self, duration: Duration) -> TimerId {
        match self {
            Self::Tokio(context) => TimerId::Tokio(context.set(duration)),
            Self::Simulated(context) => TimerId::Simulated(context.set(duration)),
        }
    }

    pub fn unset(&mut self, id: TimerId) {
        match (self, id) {
            (Self::Tokio(context), TimerId::Tokio(id)) => context.unset(id),
            (Self::Simulated(context), TimerId::Simulated(id)) => context.unset(id),
            _ => unimplemented!(),
        }
    }
}

/// Protocol state machines. Handlers run one at a time on the dispatch loop,
/// so state transitions never race; timers that were unset before their fire
/// was delivered are never observed.
pub trait Receivers {
    type Message;

    fn handle(&mut self, receiver: Host, remote: Host, message: Self::Message);

    fn on_timer(&mut self, receiver: Host, id: TimerId);

    fn on_pace(&mut self) {}
}
