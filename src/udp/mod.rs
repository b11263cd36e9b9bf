//! UDP Transport
//!
//! This module owns the sockets of a BACnet/IP node. A [`UdpDirector`] runs
//! one UDP socket with two long-lived tasks: a read loop that parses
//! datagrams into PDUs and hands them to per-peer [`UdpActor`]s, and a write
//! loop that drains a FIFO queue of outbound frames. Actors keep each peer's
//! inbound frames in order while letting different peers' traffic proceed
//! concurrently, and optionally evict themselves after a configurable idle
//! period.
//!
//! [`UdpMultiplexer`] sits above one or two directors and presents the
//! Annex H and Annex J link layers of a single local address.

mod multiplexer;

pub use multiplexer::{MuxLeg, UdpMultiplexer};

use std::collections::HashMap;
use std::future::pending;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::comm::{Binding, Client, CommError, Result, Server};
use crate::pdu::{Address, Pdu};

/// Default receive buffer size, one Ethernet MTU
pub const DEFAULT_BUFFER_SIZE: usize = 1500;

/// Socket and actor options for a [`UdpDirector`]
#[derive(Debug, Clone)]
pub struct DirectorConfig {
    /// Receive buffer size in octets
    pub buffer_size: usize,
    /// Idle period after which a peer's actor evicts itself, zero to disable
    pub idle_timeout: Duration,
    /// Enable `SO_BROADCAST` on the socket
    pub broadcast: bool,
    /// Enable `SO_REUSEADDR` before binding
    pub reuse_address: bool,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: Duration::ZERO,
            broadcast: false,
            reuse_address: false,
        }
    }
}

/// Connection-oriented observers of a director's peer set.
pub trait DirectorObserver: Send + Sync {
    /// A previously unseen peer got an actor.
    fn actor_added(&self, peer: SocketAddrV4);

    /// A peer's actor was removed.
    fn actor_removed(&self, peer: SocketAddrV4);
}

/// Owner of one UDP socket and its read/write loops.
///
/// Inbound datagrams become PDUs addressed from their sender and are
/// delivered upward through the actor of that peer; outbound PDUs are
/// queued FIFO and written by the write loop. [`close`](Self::close) stops
/// both loops and joins every actor before returning, so no task touches
/// the socket afterwards.
pub struct UdpDirector {
    socket: Arc<UdpSocket>,
    local: SocketAddrV4,
    config: DirectorConfig,
    upstream: Binding<dyn Client>,
    actors: Mutex<HashMap<SocketAddrV4, Arc<UdpActor>>>,
    observer: OnceLock<Arc<dyn DirectorObserver>>,
    write_tx: mpsc::UnboundedSender<(SocketAddrV4, Bytes)>,
    write_rx: Mutex<Option<mpsc::UnboundedReceiver<(SocketAddrV4, Bytes)>>>,
    shutdown: watch::Sender<bool>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
    me: Weak<UdpDirector>,
}

impl UdpDirector {
    /// Bind a socket to `address`. Must be called from within a tokio
    /// runtime; the loops do not run until [`start`](Self::start).
    pub fn bind(address: SocketAddrV4, config: DirectorConfig) -> Result<Arc<Self>> {
        let socket = build_socket(address, &config)?;
        let socket = UdpSocket::from_std(socket)?;
        let local = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(CommError::InvalidConfiguration(
                    "an IPv4 socket is required".into(),
                ))
            }
        };

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new_cyclic(|me| Self {
            socket: Arc::new(socket),
            local,
            config,
            upstream: Binding::new(),
            actors: Mutex::new(HashMap::new()),
            observer: OnceLock::new(),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            shutdown,
            read_task: Mutex::new(None),
            write_task: Mutex::new(None),
            me: me.clone(),
        }))
    }

    /// The bound local address.
    pub fn local_address(&self) -> SocketAddrV4 {
        self.local
    }

    /// The number of live peer actors.
    pub fn actor_count(&self) -> usize {
        self.actors.lock().unwrap().len()
    }

    /// Register the observer notified of actor add/remove events.
    pub fn set_observer(&self, observer: Arc<dyn DirectorObserver>) -> Result<()> {
        self.observer
            .set(observer)
            .map_err(|_| CommError::AlreadyBound)
    }

    /// Start the read and write loops.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let Some(write_rx) = self.write_rx.lock().unwrap().take() else {
            return Err(CommError::InvalidConfiguration(
                "director already started".into(),
            ));
        };

        let read = tokio::spawn(read_loop(
            self.socket.clone(),
            Arc::downgrade(self),
            self.shutdown.subscribe(),
            self.config.buffer_size,
        ));
        let write = tokio::spawn(write_loop(
            self.socket.clone(),
            write_rx,
            self.shutdown.subscribe(),
        ));
        *self.read_task.lock().unwrap() = Some(read);
        *self.write_task.lock().unwrap() = Some(write);
        Ok(())
    }

    /// Stop both loops and wait for them and every actor to finish.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);

        let read = self.read_task.lock().unwrap().take();
        if let Some(task) = read {
            let _ = task.await;
        }
        let write = self.write_task.lock().unwrap().take();
        if let Some(task) = write {
            let _ = task.await;
        }

        let actors: Vec<(SocketAddrV4, Arc<UdpActor>)> =
            self.actors.lock().unwrap().drain().collect();
        for (peer, actor) in actors {
            if let Some(observer) = self.observer.get() {
                observer.actor_removed(peer);
            }
            actor.join().await;
        }
    }

    fn actor_for(&self, peer: SocketAddrV4) -> Arc<UdpActor> {
        let mut actors = self.actors.lock().unwrap();
        if let Some(actor) = actors.get(&peer) {
            return actor.clone();
        }
        let actor = UdpActor::spawn(
            peer,
            self.me.clone(),
            self.config.idle_timeout,
            self.shutdown.subscribe(),
        );
        actors.insert(peer, actor.clone());
        if let Some(observer) = self.observer.get() {
            observer.actor_added(peer);
        }
        actor
    }

    fn dispatch(&self, peer: SocketAddrV4, frame: Bytes) {
        self.actor_for(peer).enqueue_received(frame);
    }

    pub(crate) fn del_actor(&self, peer: SocketAddrV4) {
        if self.actors.lock().unwrap().remove(&peer).is_some() {
            if let Some(observer) = self.observer.get() {
                observer.actor_removed(peer);
            }
        }
    }

    fn enqueue(&self, dest: SocketAddrV4, frame: Bytes) {
        if self.write_tx.send((dest, frame)).is_err() {
            warn!("write queue closed, dropping frame for {dest}");
        }
    }

    fn deliver(&self, pdu: Pdu) {
        match self.upstream.get() {
            Ok(upper) => {
                if let Err(e) = upper.confirmation(pdu) {
                    warn!("inbound delivery failed: {e}");
                }
            }
            Err(_) => debug!("no upper layer bound, dropping inbound frame"),
        }
    }
}

impl Server for UdpDirector {
    fn indication(&self, pdu: Pdu) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(CommError::InvalidConfiguration("director closed".into()));
        }
        let dest = match pdu.destination {
            Some(Address::LocalStation(addr)) => addr.socket_addr(),
            other => {
                return Err(CommError::InvalidAddress(format!(
                    "director needs a station destination, got {other:?}"
                )))
            }
        };
        self.actor_for(dest).handle_send(pdu.payload);
        Ok(())
    }

    fn upstream(&self) -> &Binding<dyn Client> {
        &self.upstream
    }
}

/// The send/receive proxy for one peer.
///
/// Inbound frames for the peer pass through the actor's own queue, which
/// keeps them in arrival order regardless of how other peers' deliveries
/// are scheduled. Every send or receive pushes the idle deadline out; when
/// it expires with no activity, the actor removes itself from its
/// director.
pub struct UdpActor {
    peer: SocketAddrV4,
    director: Weak<UdpDirector>,
    timeout: Duration,
    tx: mpsc::UnboundedSender<Bytes>,
    deadline: Mutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpActor {
    fn spawn(
        peer: SocketAddrV4,
        director: Weak<UdpDirector>,
        timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Arc::new(Self {
            peer,
            director,
            timeout,
            tx,
            deadline: Mutex::new(None),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(actor.clone().run(rx, shutdown));
        *actor.task.lock().unwrap() = Some(task);
        actor
    }

    /// The peer this actor stands for.
    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    fn touch(&self) {
        if !self.timeout.is_zero() {
            *self.deadline.lock().unwrap() = Some(Instant::now() + self.timeout);
        }
    }

    fn handle_send(&self, frame: Bytes) {
        self.touch();
        if let Some(director) = self.director.upgrade() {
            director.enqueue(self.peer, frame);
        }
    }

    fn enqueue_received(&self, frame: Bytes) {
        self.touch();
        let _ = self.tx.send(frame);
    }

    async fn join(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let armed = *self.deadline.lock().unwrap();
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => self.deliver(frame),
                    None => break,
                },
                _ = shutdown.changed() => break,
                _ = idle_sleep(armed) => {
                    // activity may have pushed the deadline out while sleeping
                    let expired = self
                        .deadline
                        .lock()
                        .unwrap()
                        .map(|deadline| Instant::now() >= deadline)
                        .unwrap_or(false);
                    if expired {
                        trace!("evicting idle peer {}", self.peer);
                        if let Some(director) = self.director.upgrade() {
                            director.del_actor(self.peer);
                        }
                        break;
                    }
                }
            }
        }
    }

    fn deliver(&self, frame: Bytes) {
        let Some(director) = self.director.upgrade() else {
            return;
        };
        let pdu = Pdu::new(frame).with_source(Address::LocalStation(self.peer.into()));
        director.deliver(pdu);
    }
}

async fn idle_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    director: Weak<UdpDirector>,
    mut shutdown: watch::Receiver<bool>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, SocketAddr::V4(peer))) => {
                    let Some(director) = director.upgrade() else { break };
                    trace!("{} octets from {}: {}", len, peer, hex::encode(&buf[..len.min(8)]));
                    director.dispatch(peer, Bytes::copy_from_slice(&buf[..len]));
                }
                Ok((_, peer)) => trace!("ignoring datagram from non-IPv4 source {peer}"),
                // receive errors never stop the loop, only a close does
                Err(e) => error!("socket receive error: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn write_loop(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<(SocketAddrV4, Bytes)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some((dest, frame)) => {
                    // a failed frame is reported and dropped, never retried
                    if let Err(e) = socket.send_to(&frame, SocketAddr::V4(dest)).await {
                        warn!("send to {dest} failed: {e}");
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

fn build_socket(address: SocketAddrV4, config: &DirectorConfig) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if config.reuse_address {
        socket.set_reuse_address(true)?;
    }
    if config.broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind(&SocketAddr::V4(address).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
