//! A context based on tokio and asynchronous IO.
//!
//! Although supported by an asynchronous reactor, protocol code, i.e.
//! `impl Receivers` is still synchronous and runs on a dedicated thread. The
//! dispatch loop deserializes and authenticates every datagram before the
//! protocol sees it; messages that fail either check are dropped and counted.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bincode::Options;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{net::UdpSocket, runtime::Handle, task::JoinHandle};
use tokio_util::bytes::Bytes;

use crate::message::wire_options;

use super::{
    crypto::{Sign, Signer, Verifier, Verify},
    ClientIndex, Host, Receivers, ReplicaIndex, To,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub protocol: super::Config,
    pub client_addrs: Vec<SocketAddr>,
    pub replica_addrs: Vec<SocketAddr>,
}

impl Config {
    pub fn new(
        protocol: super::Config,
        client_addrs: impl Into<Vec<SocketAddr>>,
        replica_addrs: impl Into<Vec<SocketAddr>>,
    ) -> Self {
        let client_addrs = client_addrs.into();
        let replica_addrs = replica_addrs.into();
        assert_eq!(replica_addrs.len(), protocol.num_replica);
        Self {
            protocol,
            client_addrs,
            replica_addrs,
        }
    }

    fn addr(&self, host: Host) -> SocketAddr {
        match host {
            Host::Client(index) => self.client_addrs[index as usize],
            Host::Replica(index) => self.replica_addrs[index as usize],
        }
    }
}

#[derive(Debug, Clone)]
enum Event {
    Message(Host, SocketAddr, Vec<u8>),
    Timer(Host, TimerId),
    Stop,
}

#[derive(Debug)]
pub struct Context {
    pub config: Arc<Config>,
    socket: Arc<UdpSocket>,
    runtime: Handle,
    source: Host,
    signer: Signer,
    timer_id: TimerId,
    timer_tasks: HashMap<TimerId, JoinHandle<()>>,
    rdv_event: flume::Sender<Event>,
}

impl Context {
    pub fn send<M, N>(&self, to: To, message: N)
    where
        M: Sign<N> + Serialize,
    {
        let message = M::sign(message, &self.signer);
        let buf = Bytes::from(wire_options().serialize(&message).unwrap());
        match to {
            To::Host(host) => self.send_internal(self.config.addr(host), buf),
            To::Hosts(hosts) => {
                for host in hosts {
                    assert_ne!(host, self.source);
                    self.send_internal(self.config.addr(host), buf.clone())
                }
            }
            To::AllReplica => {
                for index in 0..self.config.protocol.num_replica {
                    let host = Host::Replica(index as ReplicaIndex);
                    if host != self.source {
                        self.send_internal(self.config.addr(host), buf.clone())
                    }
                }
            }
        }
    }

    fn send_internal(&self, addr: SocketAddr, buf: impl AsRef<[u8]> + Send + Sync + 'static) {
        let socket = self.socket.clone();
        self.runtime.spawn(async move {
            socket
                .send_to(buf.as_ref(), addr)
                .await
                .unwrap_or_else(|err| panic!("{err} target: {addr:?}"))
        });
    }
}

pub type TimerId = u32;

impl Context {
    pub fn set(&mut self, duration: Duration) -> TimerId {
        self.timer_id += 1;
        let id = self.timer_id;
        let event = self.rdv_event.clone();
        let source = self.source;
        let task = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(duration).await;
                event.send_async(Event::Timer(source, id)).await.unwrap()
            }
        });
        self.timer_tasks.insert(id, task);
        id
    }

    // only works in current thread runtime
    // in multi-thread runtime, there will always be a chance that the timer
    // task wakes concurrent to this `unset` call, then this call has no way
    // to prevent a false alarm
    pub fn unset(&mut self, id: TimerId) {
        let task = self.timer_tasks.remove(&id).unwrap();
        task.abort();
        let result = self.runtime.block_on(task);
        assert!(result.is_err())
    }
}

#[derive(Debug)]
pub struct Dispatch {
    runtime: Handle,
    verifier: Verifier,
    hosts: HashMap<SocketAddr, Host>,
    event: (flume::Sender<Event>, flume::Receiver<Event>),
    rdv_event: (flume::Sender<Event>, flume::Receiver<Event>),
    invalid_count: AtomicU64,
    pub drop_rate: f64,
}

impl Dispatch {
    pub fn new(runtime: Handle, verifier: Verifier, config: &Config) -> Self {
        let mut hosts = HashMap::new();
        for (index, &addr) in config.replica_addrs.iter().enumerate() {
            hosts.insert(addr, Host::Replica(index as ReplicaIndex));
        }
        for (index, &addr) in config.client_addrs.iter().enumerate() {
            hosts.insert(addr, Host::Client(index as ClientIndex));
        }
        Self {
            runtime,
            verifier,
            hosts,
            event: flume::unbounded(),
            rdv_event: flume::bounded(0),
            invalid_count: AtomicU64::new(0),
            drop_rate: 0.,
        }
    }

    /// Messages dropped by the loop before the protocol saw them, either
    /// undecodable or carrying a bad authenticator.
    pub fn invalid_count(&self) -> u64 {
        self.invalid_count.load(Ordering::Relaxed)
    }

    pub fn register<M>(
        &self,
        host: Host,
        config: impl Into<Arc<Config>>,
        signer: Signer,
    ) -> super::Context<M> {
        let config = config.into();
        let addr = config.addr(host);
        let socket = Arc::new(
            self.runtime
                .block_on(UdpSocket::bind(addr))
                .unwrap_or_else(|_| panic!("binding {addr:?}")),
        );
        let context = Context {
            config,
            socket: socket.clone(),
            runtime: self.runtime.clone(),
            source: host,
            signer,
            timer_id: Default::default(),
            timer_tasks: Default::default(),
            rdv_event: self.rdv_event.0.clone(),
        };
        let event = self.event.0.clone();
        self.runtime.spawn(async move {
            let mut buf = vec![0; 65536];
            loop {
                let (len, remote) = socket.recv_from(&mut buf).await.unwrap();
                // `try_send` here to minimize rx process latency, avoid
                // hardware packet dropping
                event
                    .try_send(Event::Message(host, remote, buf[..len].to_vec()))
                    .unwrap()
            }
        });
        super::Context::Tokio(context)
    }

    pub fn run<M>(&self, receivers: &mut impl Receivers<Message = M>)
    where
        M: DeserializeOwned + Verify,
    {
        let mut pace_count = 1usize;
        loop {
            if pace_count == 0 {
                receivers.on_pace();
                pace_count = self.event.0.len().max(1);
            }

            assert!(self.event.1.len() < 4096, "receivers overwhelmed");
            let event = flume::Selector::new()
                .recv(&self.event.1, Result::unwrap)
                .recv(&self.rdv_event.1, Result::unwrap)
                .wait();
            match event {
                Event::Stop => break,
                Event::Message(receiver, remote, buf) => {
                    pace_count -= 1;
                    if self.drop_rate != 0. && rand::thread_rng().gen_bool(self.drop_rate) {
                        continue;
                    }
                    let Some(&remote) = self.hosts.get(&remote) else {
                        self.invalid_count.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    let Ok(message) = wire_options().allow_trailing_bytes().deserialize::<M>(&buf)
                    else {
                        self.invalid_count.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    if let Err(err) = message.verify(&self.verifier) {
                        tracing::debug!("{receiver:?} <- {remote:?} dropped: {err}");
                        self.invalid_count.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    receivers.handle(receiver, remote, message)
                }
                Event::Timer(receiver, id) => {
                    receivers.on_timer(receiver, super::TimerId::Tokio(id))
                }
            }
        }
    }
}

pub struct DispatchHandle {
    stop: Box<dyn Fn() + Send + Sync>,
}

impl Dispatch {
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            stop: Box::new({
                let rdv_event = self.rdv_event.0.clone();
                move || rdv_event.send(Event::Stop).unwrap()
            }),
        }
    }
}

impl DispatchHandle {
    pub fn stop(&self) {
        (self.stop)()
    }
}
