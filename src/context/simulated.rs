//! A deterministic single-process context for protocol tests.
//!
//! Sends and timer fires are totally ordered on one virtual timeline, so a
//! run over any number of replicas and clients is reproducible. Hosts can be
//! muted (outgoing messages dropped, models a silent sender) or crashed
//! (nothing delivered, timers stop firing) to script fault scenarios.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use super::{
    crypto::{Sign, Signer},
    Config, Host, Receivers, To,
};

#[derive(Debug, Clone)]
enum Event<M> {
    Message(Host, Host, M),
    Timer(Host, TimerId),
}

pub type TimerId = u32;

#[derive(Debug)]
pub struct Context<M> {
    pub config: Arc<Config>,
    source: Host,
    timeline: Arc<Mutex<Timeline<M>>>,
}

#[derive(Debug)]
struct Timeline<M> {
    now: Duration,
    event_id: u64,
    timer_id: TimerId,
    events: BTreeMap<(Duration, u64), Event<M>>,
    timers: HashMap<TimerId, Timer>,
    muted: HashSet<Host>,
    crashed: HashSet<Host>,
}

#[derive(Debug)]
struct Timer {
    duration: Duration,
    key: (Duration, u64),
}

impl<M> Default for Timeline<M> {
    fn default() -> Self {
        Self {
            now: Duration::ZERO,
            event_id: 0,
            timer_id: 0,
            events: Default::default(),
            timers: Default::default(),
            muted: Default::default(),
            crashed: Default::default(),
        }
    }
}

impl<M> Timeline<M> {
    fn add_event(&mut self, offset: Duration, event: Event<M>) -> (Duration, u64) {
        self.event_id += 1;
        let key = (self.now + offset, self.event_id);
        let evicted = self.events.insert(key, event);
        assert!(evicted.is_none());
        key
    }
}

impl<M> Context<M> {
    pub fn send<N>(&mut self, to: To, message: N)
    where
        M: Sign<N> + Clone,
    {
        let message = M::sign(message, &Signer::Simulated);
        let mut timeline = self.timeline.lock().unwrap();
        if timeline.muted.contains(&self.source) || timeline.crashed.contains(&self.source) {
            return;
        }
        match to {
            To::Host(host) => {
                timeline.add_event(Duration::ZERO, Event::Message(host, self.source, message));
            }
            To::Hosts(hosts) => {
                for host in hosts {
                    assert_ne!(host, self.source);
                    timeline.add_event(
                        Duration::ZERO,
                        Event::Message(host, self.source, message.clone()),
                    );
                }
            }
            To::AllReplica => {
                for index in 0..self.config.num_replica {
                    if Host::Replica(index as _) != self.source {
                        timeline.add_event(
                            Duration::ZERO,
                            Event::Message(Host::Replica(index as _), self.source, message.clone()),
                        );
                    }
                }
            }
        }
    }

    pub fn set(&self, duration: Duration) -> TimerId {
        let mut timeline = self.timeline.lock().unwrap();
        timeline.timer_id += 1;
        let id = timeline.timer_id;
        let key = timeline.add_event(duration, Event::Timer(self.source, id));
        timeline.timers.insert(id, Timer { duration, key });
        id
    }

    pub fn unset(&self, id: TimerId) {
        let mut timeline = self.timeline.lock().unwrap();
        let timer = timeline.timers.remove(&id).unwrap();
        timeline.events.remove(&timer.key).unwrap();
    }
}

#[derive(Debug)]
pub struct Dispatch<M> {
    config: Arc<Config>,
    timeline: Arc<Mutex<Timeline<M>>>,
}

impl<M> Dispatch<M> {
    pub fn new(config: impl Into<Arc<Config>>) -> Self {
        Self {
            config: config.into(),
            timeline: Default::default(),
        }
    }

    pub fn register(&self, receiver: Host) -> crate::context::Context<M> {
        crate::context::Context::Simulated(Context {
            config: self.config.clone(),
            source: receiver,
            timeline: self.timeline.clone(),
        })
    }

    /// Drop every message the host sends from now on. It still receives.
    pub fn mute(&self, host: Host) {
        self.timeline.lock().unwrap().muted.insert(host);
    }

    /// Stop delivering anything to the host, timer fires included.
    pub fn crash(&self, host: Host) {
        self.timeline.lock().unwrap().crashed.insert(host);
    }

    /// Undo `mute`/`crash`. Pending deliveries were already dropped.
    pub fn revive(&self, host: Host) {
        let mut timeline = self.timeline.lock().unwrap();
        timeline.muted.remove(&host);
        timeline.crashed.remove(&host);
    }

    pub fn now(&self) -> Duration {
        self.timeline.lock().unwrap().now
    }

    /// Deliver the next timeline event. Returns false when the timeline has
    /// run dry (which only happens once every timer is unset).
    ///
    /// The timeline lock is released before the receiver runs, handlers are
    /// free to send and to set or unset timers.
    pub fn deliver_event(&self, receivers: &mut impl Receivers<Message = M>) -> bool {
        let event = {
            let mut timeline = self.timeline.lock().unwrap();
            let Some(((now, _), event)) = timeline.events.pop_first() else {
                return false;
            };
            assert!(now >= timeline.now);
            timeline.now = now;
            if let Event::Timer(receiver, id) = event {
                // periodic: rearm under the same public id
                let duration = timeline.timers[&id].duration;
                let key = timeline.add_event(duration, Event::Timer(receiver, id));
                timeline.timers.get_mut(&id).unwrap().key = key;
            }
            event
        };
        let crashed = |host| self.timeline.lock().unwrap().crashed.contains(&host);
        match event {
            Event::Message(receiver, remote, message) => {
                if !crashed(receiver) {
                    receivers.handle(receiver, remote, message)
                }
            }
            Event::Timer(receiver, id) => {
                if !crashed(receiver) {
                    receivers.on_timer(receiver, crate::context::TimerId::Simulated(id))
                }
            }
        }
        true
    }
}
