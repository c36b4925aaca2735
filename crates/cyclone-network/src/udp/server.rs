//! Reliable-UDP master/worker thread topology, grounded on spec.md
//! §4.8.1-§4.8.4. Structurally the mirror of `tcp::server`: a master thread
//! owns the bound sockets and never touches a `Connection`, workers own a
//! peer-keyed table and drive each session's ARQ engine. The dispatch key
//! is `hash(peerAddr) % workerCount` instead of round-robin, since all
//! traffic from one peer must land on the same worker for its ARQ state to
//! stay coherent.

use std::{
    cell::RefCell,
    collections::HashMap,
    hash::{Hash, Hasher},
    io,
    net::SocketAddr,
    os::fd::AsRawFd,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicI32, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use super::connection::{Outcome, UdpConnId, UdpConnState, UdpConnection};
use super::{UdpCallbacks, UdpConnHandle};
use crate::debug_interface::DebugInterface;
use crate::error::ServerStartError;
use crate::reactor::{Callback, EventId, Interest, Looper};
use crate::work_thread::{WorkThread, WorkThreadConfig, WorkThreadHandle};

/// Master's per-`recvfrom` scratch buffer (spec.md §4.8.1's 8 MiB ceiling).
const MASTER_SCRATCH_SIZE: usize = 8 * 1024 * 1024;
/// Per-connection recv scratch on its dedicated secondary socket; a
/// conforming peer never sends a datagram larger than this.
pub const MAX_UDP_READ_SIZE: usize = 64 * 1024;
/// How long a peer address stays locked out of reconnection after its
/// session tears down, so a burst of trailing datagrams from a peer that
/// just disconnected doesn't immediately spin a fresh Connection back up
/// (spec.md §4.8.1's "rate-limits handshake attempts from the same peer").
const ADDRESS_LOCK_DURATION: Duration = Duration::from_millis(500);
const UPDATE_TICK: Duration = Duration::from_millis(10);

pub(crate) enum WorkerMsg {
    Datagram { peer_addr: SocketAddr, local_addr: SocketAddr, bytes: Vec<u8> },
    ApplicationSend { id: UdpConnId, bytes: Vec<u8> },
    ApplicationShutdown { id: UdpConnId },
    /// Application-originated session: there's no inbound datagram to react
    /// to, so the caller supplies the first payload itself. Mirrors the
    /// unknown-peer branch of `on_datagram`, just triggered from our side
    /// instead of the peer's (spec.md §4.8.2 has no transport handshake;
    /// this is the hook an upper layer uses to originate one).
    Connect { peer_addr: SocketAddr, local_addr: SocketAddr, initial_payload: Vec<u8> },
    Shutdown,
}

pub(crate) enum MasterMsg {
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct UdpServerConfig {
    pub addrs: Vec<SocketAddr>,
    pub worker_count: usize,
    pub master: WorkThreadConfig,
    pub workers: WorkThreadConfig,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        UdpServerConfig { addrs: Vec::new(), worker_count: 1, master: WorkThreadConfig::default(), workers: WorkThreadConfig::default() }
    }
}

pub struct UdpServerHandle {
    master: WorkThreadHandle<MasterMsg>,
    master_join: Option<JoinHandle<()>>,
    workers: Vec<WorkThreadHandle<WorkerMsg>>,
    worker_joins: Vec<JoinHandle<()>>,
}

impl UdpServerHandle {
    pub fn shutdown(&self) {
        if self.master.send(MasterMsg::Shutdown).is_err() {
            warn!("udp server: master inbox full while requesting shutdown");
        }
    }

    /// Originate a session to `peer_addr` instead of waiting for it to send
    /// the first datagram. There's no transport handshake to wait for
    /// (spec.md §4.8.2), so this just creates the session's dual socket and
    /// sends `initial_payload` through it, exactly as if that peer had been
    /// the one to dial in. `local_addr` is recorded as which of this
    /// server's listening addresses the session is associated with; it
    /// doesn't have to be the literal address `initial_payload` goes out
    /// from, since every session gets its own ephemeral secondary socket.
    ///
    /// Hash-dispatches to the same worker `recv_and_dispatch` would pick for
    /// datagrams arriving from `peer_addr`, so a reply racing in on the
    /// master's socket lands on a worker that already knows this peer.
    pub fn connect(&self, peer_addr: SocketAddr, local_addr: SocketAddr, initial_payload: impl Into<Vec<u8>>) {
        if self.workers.is_empty() {
            warn!("udp server: connect requested with no worker threads");
            return;
        }
        let worker_idx = (hash_addr(peer_addr) % self.workers.len() as u64) as usize;
        let msg = WorkerMsg::Connect { peer_addr, local_addr, initial_payload: initial_payload.into() };
        if self.workers[worker_idx].send(msg).is_err() {
            warn!(%peer_addr, "udp server: worker inbox full, dropping connect request");
        }
    }

    pub fn join(mut self) {
        if let Some(join) = self.master_join.take() {
            let _ = join.join();
        }
        for join in self.worker_joins.drain(..) {
            let _ = join.join();
        }
    }
}

struct ListenerSlot {
    socket: mio::net::UdpSocket,
    event_id: EventId,
    local_addr: SocketAddr,
}

pub struct UdpServer;

impl UdpServer {
    pub fn start(
        config: UdpServerConfig,
        callbacks: UdpCallbacks,
        debug: Arc<dyn DebugInterface>,
    ) -> Result<UdpServerHandle, ServerStartError> {
        let callbacks = Arc::new(callbacks);
        let worker_count = config.worker_count.max(1);
        let next_conn_id = Arc::new(AtomicI32::new(1));

        let mut workers = Vec::with_capacity(worker_count);
        let mut worker_joins = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let worker_callbacks = Arc::clone(&callbacks);
            let worker_debug = Arc::clone(&debug);
            let worker_next_id = Arc::clone(&next_conn_id);
            let (join, handle) = WorkThread::start(
                format!("cyclone-udp-worker-{i}"),
                config.workers,
                move |_looper, worker_handle| {
                    build_worker_on_message(worker_handle.clone(), worker_callbacks, worker_debug, worker_next_id)
                },
            )
            .map_err(ServerStartError::ThreadSpawn)?;
            workers.push(handle);
            worker_joins.push(join);
        }

        let addrs = config.addrs.clone();
        let workers_for_master = workers.clone();
        let (master_join, master_handle) =
            WorkThread::start("cyclone-udp-master".to_string(), config.master, move |looper, _handle| {
                build_master(looper, addrs, workers_for_master)
            })
            .map_err(ServerStartError::ThreadSpawn)?;

        Ok(UdpServerHandle {
            master: master_handle,
            master_join: Some(master_join),
            workers,
            worker_joins,
        })
    }
}

fn bind_master_socket(addr: SocketAddr) -> io::Result<mio::net::UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(mio::net::UdpSocket::from_std(socket.into()))
}

fn hash_addr(addr: SocketAddr) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    addr.hash(&mut hasher);
    hasher.finish()
}

/// Build the master's bound sockets and the `MasterMsg` handler. Runs on
/// the master thread; it never looks at a `Connection`, only forwards raw
/// datagrams to the worker their peer address hashes to.
fn build_master(
    looper: &mut Looper,
    addrs: Vec<SocketAddr>,
    workers: Vec<WorkThreadHandle<WorkerMsg>>,
) -> impl FnMut(&mut Looper, MasterMsg) + 'static {
    let listeners: Rc<RefCell<Vec<Option<ListenerSlot>>>> = Rc::new(RefCell::new(Vec::new()));

    for addr in addrs {
        match bind_master_socket(addr) {
            Ok(socket) => {
                let local_addr = socket.local_addr().unwrap_or(addr);
                let fd = socket.as_raw_fd();
                let index = listeners.borrow().len();
                let listeners_for_cb = Rc::clone(&listeners);
                let workers_for_cb = workers.clone();
                let on_read: Callback = Box::new(move |_looper, _id| {
                    recv_and_dispatch(index, &listeners_for_cb, &workers_for_cb);
                });
                match looper.register_event(fd, Interest::READ, Some(on_read), None) {
                    Ok(event_id) => listeners.borrow_mut().push(Some(ListenerSlot { socket, event_id, local_addr })),
                    Err(err) => warn!(?err, %addr, "udp server: failed to register listener"),
                }
            }
            Err(err) => warn!(?err, %addr, "udp server: failed to bind listener"),
        }
    }

    move |looper, msg| match msg {
        MasterMsg::Shutdown => {
            for slot in listeners.borrow_mut().iter_mut() {
                if let Some(slot) = slot.take() {
                    if let Err(err) = looper.disable_all(slot.event_id) {
                        debug!(?err, "udp server: disable_all failed before delete_event");
                    }
                    looper.delete_event(slot.event_id);
                }
            }
            for worker in &workers {
                if worker.send(WorkerMsg::Shutdown).is_err() {
                    warn!("udp server: worker inbox full while forwarding shutdown");
                }
            }
            looper.request_stop();
        }
    }
}

/// `recvfrom` exactly once per readiness wake (spec.md §4.8.1), then hash-
/// dispatch the datagram to the worker owning that peer address.
fn recv_and_dispatch(index: usize, listeners: &Rc<RefCell<Vec<Option<ListenerSlot>>>>, workers: &[WorkThreadHandle<WorkerMsg>]) {
    if workers.is_empty() {
        return;
    }
    let mut scratch = vec![0u8; MASTER_SCRATCH_SIZE];
    let (n, peer_addr, local_addr) = {
        let listeners = listeners.borrow();
        let Some(slot) = listeners.get(index).and_then(Option::as_ref) else { return };
        match slot.socket.recv_from(&mut scratch) {
            Ok((n, peer_addr)) => (n, peer_addr, slot.local_addr),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                debug!(?err, "udp server: recvfrom failed");
                return;
            }
        }
    };
    let worker_idx = (hash_addr(peer_addr) % workers.len() as u64) as usize;
    let bytes = scratch[..n].to_vec();
    if workers[worker_idx].send(WorkerMsg::Datagram { peer_addr, local_addr, bytes }).is_err() {
        warn!(%peer_addr, "udp server: worker inbox full, dropping datagram");
    }
}

type ConnMap = Rc<RefCell<HashMap<UdpConnId, UdpConnection>>>;
type AddrIndex = Rc<RefCell<HashMap<SocketAddr, UdpConnId>>>;
type LockMap = Rc<RefCell<HashMap<SocketAddr, Instant>>>;

pub(crate) fn build_worker_on_message(
    self_handle: WorkThreadHandle<WorkerMsg>,
    callbacks: Arc<UdpCallbacks>,
    debug: Arc<dyn DebugInterface>,
    next_conn_id: Arc<AtomicI32>,
) -> impl FnMut(&mut Looper, WorkerMsg) + 'static {
    let connections: ConnMap = Rc::new(RefCell::new(HashMap::new()));
    let addr_index: AddrIndex = Rc::new(RefCell::new(HashMap::new()));
    let locked: LockMap = Rc::new(RefCell::new(HashMap::new()));
    let shutting_down = Rc::new(std::cell::Cell::new(false));

    move |looper, msg| match msg {
        WorkerMsg::Datagram { peer_addr, local_addr, bytes } => {
            on_datagram(
                looper,
                peer_addr,
                local_addr,
                &bytes,
                &connections,
                &addr_index,
                &locked,
                &callbacks,
                &debug,
                &self_handle,
                &next_conn_id,
            );
        }
        WorkerMsg::ApplicationSend { id, bytes } => {
            if let Some(conn) = connections.borrow_mut().get_mut(&id) {
                if conn.state() == UdpConnState::Connected {
                    conn.send(&bytes);
                }
            }
        }
        WorkerMsg::ApplicationShutdown { id } => {
            begin_shutdown(looper, id, &connections, &addr_index, &locked, &callbacks, &debug, &self_handle);
        }
        WorkerMsg::Connect { peer_addr, local_addr, initial_payload } => {
            if addr_index.borrow().contains_key(&peer_addr) {
                debug!(%peer_addr, "udp server: connect requested for a peer we already have a session with");
                return;
            }
            establish_connection(
                looper,
                peer_addr,
                local_addr,
                InitialPayload::Outbound(&initial_payload),
                &connections,
                &addr_index,
                &locked,
                &callbacks,
                &debug,
                &self_handle,
                &next_conn_id,
            );
        }
        WorkerMsg::Shutdown => {
            shutting_down.set(true);
            if connections.borrow().is_empty() {
                looper.request_stop();
                return;
            }
            let ids: Vec<UdpConnId> = connections.borrow().keys().copied().collect();
            for id in ids {
                begin_shutdown(looper, id, &connections, &addr_index, &locked, &callbacks, &debug, &self_handle);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn on_datagram(
    looper: &mut Looper,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    bytes: &[u8],
    connections: &ConnMap,
    addr_index: &AddrIndex,
    locked: &LockMap,
    callbacks: &Arc<UdpCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
    next_conn_id: &Arc<AtomicI32>,
) {
    if let Some(&id) = addr_index.borrow().get(&peer_addr) {
        let delivered = {
            let mut conns = connections.borrow_mut();
            let Some(conn) = conns.get_mut(&id) else { return };
            conn.feed_datagram(bytes)
        };
        if delivered > 0 {
            fire_on_message(id, connections, callbacks, self_handle);
        }
        return;
    }

    {
        let mut locked = locked.borrow_mut();
        if let Some(&until) = locked.get(&peer_addr) {
            if until > Instant::now() {
                debug!(%peer_addr, "udp server: dropping datagram from a rate-limited peer");
                return;
            }
            locked.remove(&peer_addr);
        }
    }

    // Unknown peer, not locked out: spec.md §4.8.2, this is an implicit
    // handshake.
    establish_connection(
        looper,
        peer_addr,
        local_addr,
        InitialPayload::Inbound(bytes),
        connections,
        addr_index,
        locked,
        callbacks,
        debug,
        self_handle,
        next_conn_id,
    );
}

/// The first thing a freshly created session does with its peer, depending
/// on which side originated it.
enum InitialPayload<'a> {
    /// A raw datagram that already arrived on the master's socket: feed it
    /// to the ARQ engine's input side, the same as any later read.
    Inbound(&'a [u8]),
    /// An application payload with nothing received yet: hand it to the ARQ
    /// engine's send side and flush, mirroring [`super::connection::UdpConnection::send`].
    Outbound(&'a [u8]),
}

/// Create a peer session's dedicated secondary socket, register its read
/// and update-tick channels, and apply `initial` (an inbound datagram for
/// the reactive path, or an application-supplied payload for the
/// originating path). `§4.8.2` requires the socket exist before the first
/// datagram is processed either way.
#[allow(clippy::too_many_arguments)]
fn establish_connection(
    looper: &mut Looper,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    initial: InitialPayload<'_>,
    connections: &ConnMap,
    addr_index: &AddrIndex,
    locked: &LockMap,
    callbacks: &Arc<UdpCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
    next_conn_id: &Arc<AtomicI32>,
) {
    let id = next_conn_id.fetch_add(1, Ordering::Relaxed);
    let mut conn = match UdpConnection::new(id, peer_addr, local_addr) {
        Ok(conn) => conn,
        Err(err) => {
            warn!(?err, %peer_addr, "udp server: failed to create peer session socket");
            return;
        }
    };
    let fd = conn.fd();

    let connections_for_read = Rc::clone(connections);
    let callbacks_for_read = Arc::clone(callbacks);
    let self_for_read = self_handle.clone();
    let on_read: Callback = Box::new(move |_looper, _event_id| {
        handle_readable(id, &connections_for_read, &callbacks_for_read, &self_for_read);
    });
    let event_id = match looper.register_event(fd, Interest::READ, Some(on_read), None) {
        Ok(event_id) => event_id,
        Err(err) => {
            warn!(?err, %peer_addr, "udp server: failed to register peer session socket");
            return;
        }
    };
    conn.set_event_id(event_id);

    let connections_for_timer = Rc::clone(connections);
    let addr_index_for_timer = Rc::clone(addr_index);
    let locked_for_timer = Rc::clone(locked);
    let callbacks_for_timer = Arc::clone(callbacks);
    let debug_for_timer = Arc::clone(debug);
    let self_for_timer = self_handle.clone();
    let on_timer: Callback = Box::new(move |looper, _event_id| {
        handle_tick(
            looper,
            id,
            &connections_for_timer,
            &addr_index_for_timer,
            &locked_for_timer,
            &callbacks_for_timer,
            &debug_for_timer,
            &self_for_timer,
        );
    });
    let timer_id = looper.register_timer(UPDATE_TICK, on_timer);
    conn.set_update_timer_id(timer_id);

    let delivered = match initial {
        InitialPayload::Inbound(bytes) => conn.feed_datagram(bytes),
        InitialPayload::Outbound(bytes) => {
            conn.send(bytes);
            0
        }
    };
    connections.borrow_mut().insert(id, conn);
    addr_index.borrow_mut().insert(peer_addr, id);
    debug.set_value_i32("udp.connections", connections.borrow().len() as i32);
    if delivered > 0 {
        fire_on_message(id, connections, callbacks, self_handle);
    }
}

fn fire_on_message(
    id: UdpConnId,
    connections: &ConnMap,
    callbacks: &Arc<UdpCallbacks>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
) {
    let Some(cb) = &callbacks.on_message else { return };
    let shared = {
        let conns = connections.borrow();
        match conns.get(&id) {
            Some(conn) => Arc::clone(&conn.shared),
            None => return,
        }
    };
    let handle = UdpConnHandle { shared, worker: self_handle.clone() };
    let mut conns = connections.borrow_mut();
    if let Some(conn) = conns.get_mut(&id) {
        cb(&handle, conn.read_buf());
    }
}

fn handle_readable(
    id: UdpConnId,
    connections: &ConnMap,
    callbacks: &Arc<UdpCallbacks>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
) {
    let delivered = {
        let mut conns = connections.borrow_mut();
        let Some(conn) = conns.get_mut(&id) else { return };
        conn.on_readable()
    };
    if delivered > 0 {
        fire_on_message(id, connections, callbacks, self_handle);
    }
    maybe_send_complete(id, connections, callbacks, self_handle);
}

fn maybe_send_complete(id: UdpConnId, connections: &ConnMap, callbacks: &Arc<UdpCallbacks>, self_handle: &WorkThreadHandle<WorkerMsg>) {
    let Some(cb) = &callbacks.on_send_complete else { return };
    let fire = {
        let conns = connections.borrow();
        conns.get(&id).is_some_and(super::connection::UdpConnection::send_complete_ready)
    };
    if fire {
        let shared = {
            let conns = connections.borrow();
            match conns.get(&id) {
                Some(conn) => Arc::clone(&conn.shared),
                None => return,
            }
        };
        cb(&UdpConnHandle { shared, worker: self_handle.clone() });
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_tick(
    looper: &mut Looper,
    id: UdpConnId,
    connections: &ConnMap,
    addr_index: &AddrIndex,
    locked: &LockMap,
    callbacks: &Arc<UdpCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
) {
    let (delivered, closed) = {
        let mut conns = connections.borrow_mut();
        let Some(conn) = conns.get_mut(&id) else { return };
        let (delivered, outcome) = conn.tick();
        (delivered, matches!(outcome, Outcome::Closed))
    };
    if delivered > 0 {
        fire_on_message(id, connections, callbacks, self_handle);
    }
    if closed {
        reap_connection(looper, id, connections, addr_index, locked, callbacks, debug, self_handle);
    } else {
        maybe_send_complete(id, connections, callbacks, self_handle);
    }
}

#[allow(clippy::too_many_arguments)]
fn begin_shutdown(
    looper: &mut Looper,
    id: UdpConnId,
    connections: &ConnMap,
    addr_index: &AddrIndex,
    locked: &LockMap,
    callbacks: &Arc<UdpCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
) {
    let (drained, shared) = {
        let mut conns = connections.borrow_mut();
        let Some(conn) = conns.get_mut(&id) else { return };
        (conn.begin_shutdown(), Arc::clone(&conn.shared))
    };
    if let Some(cb) = &callbacks.on_closing {
        cb(&UdpConnHandle { shared, worker: self_handle.clone() });
    }
    if drained {
        reap_connection(looper, id, connections, addr_index, locked, callbacks, debug, self_handle);
    }
}

#[allow(clippy::too_many_arguments)]
fn reap_connection(
    looper: &mut Looper,
    id: UdpConnId,
    connections: &ConnMap,
    addr_index: &AddrIndex,
    locked: &LockMap,
    callbacks: &Arc<UdpCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
) {
    let Some(mut conn) = connections.borrow_mut().remove(&id) else { return };
    conn.finish_disconnect();
    if let Some(event_id) = conn.event_id {
        if let Err(err) = looper.disable_all(event_id) {
            debug!(?err, "udp server: disable_all failed before delete_event");
        }
        looper.delete_event(event_id);
    }
    if let Some(timer_id) = conn.update_timer_id {
        if let Err(err) = looper.disable_all(timer_id) {
            debug!(?err, "udp server: disable_all failed on update timer before delete_event");
        }
        looper.delete_event(timer_id);
    }
    addr_index.borrow_mut().remove(&conn.shared.peer_addr);
    locked.borrow_mut().insert(conn.shared.peer_addr, Instant::now() + ADDRESS_LOCK_DURATION);
    let shared = Arc::clone(&conn.shared);
    debug.set_value_i32("udp.connections", connections.borrow().len() as i32);
    if let Some(cb) = &callbacks.on_close {
        cb(&UdpConnHandle { shared, worker: self_handle.clone() });
    }
}
