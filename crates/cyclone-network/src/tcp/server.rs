//! TCP master/worker thread topology, grounded on spec.md §4.7.1–§4.7.3.
//! The master owns listen sockets only and never touches a `Connection`; it
//! round-robins accepted fds to worker threads, each of which owns a private
//! `HashMap<ConnId, TcpConnection>` and drives the connection state machine.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    net::SocketAddr,
    os::fd::AsRawFd,
    rc::Rc,
    sync::Arc,
    thread::JoinHandle,
};

use cyclone_communication::RingBuffer;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use super::connection::{ConnId, ConnState, Outcome, TcpConnection, disable_all_and_delete, set_write_interest};
use super::{TcpCallbacks, TcpConnHandle};
use crate::debug_interface::DebugInterface;
use crate::error::ServerStartError;
use crate::reactor::{Callback, EventId, Interest, Looper};
use crate::work_thread::{WorkThread, WorkThreadConfig, WorkThreadHandle};

type ConnMap = Rc<RefCell<HashMap<ConnId, TcpConnection>>>;

/// Messages a worker thread's inbox accepts; shared between server workers
/// and the TCP client (which only ever sends the `ApplicationSend` /
/// `ApplicationShutdown` / `Shutdown` variants to itself).
pub(crate) enum WorkerMsg {
    NewConnection { id: ConnId, stream: mio::net::TcpStream, peer_addr: SocketAddr, local_addr: SocketAddr },
    ApplicationSend { id: ConnId, bytes: Vec<u8> },
    ApplicationShutdown { id: ConnId },
    CloseConnection { id: ConnId, shutdown_global: bool },
    Shutdown,
}

pub(crate) enum MasterMsg {
    Shutdown,
    StopListen { index: usize },
}

#[derive(Clone, Debug)]
pub struct TcpServerConfig {
    pub addrs: Vec<SocketAddr>,
    pub worker_count: usize,
    /// Opt-in per-connection writeBuf cap; `None` preserves the source's
    /// uncapped behavior (spec.md §9 writeBuf-cap Open Question).
    pub write_buf_cap: Option<usize>,
    pub reuse_port: bool,
    pub master: WorkThreadConfig,
    pub workers: WorkThreadConfig,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        TcpServerConfig {
            addrs: Vec::new(),
            worker_count: 1,
            write_buf_cap: None,
            reuse_port: false,
            master: WorkThreadConfig::default(),
            workers: WorkThreadConfig::default(),
        }
    }
}

/// A running server's handle: posts control messages and joins threads on
/// shutdown. Dropping this without calling [`TcpServerHandle::shutdown`]
/// leaves the threads running; they are daemon-like until explicitly
/// stopped.
pub struct TcpServerHandle {
    master: WorkThreadHandle<MasterMsg>,
    master_join: Option<JoinHandle<()>>,
    workers: Vec<WorkThreadHandle<WorkerMsg>>,
    worker_joins: Vec<JoinHandle<()>>,
}

impl TcpServerHandle {
    /// Post `Shutdown` to the master; it disables its listen sockets and
    /// forwards `Shutdown` to every worker. Call `join` afterward to wait
    /// for a clean exit.
    pub fn shutdown(&self) {
        if self.master.send(MasterMsg::Shutdown).is_err() {
            warn!("tcp server: master inbox full while requesting shutdown");
        }
    }

    pub fn stop_listen(&self, index: usize) {
        if self.master.send(MasterMsg::StopListen { index }).is_err() {
            warn!(index, "tcp server: master inbox full while requesting stop_listen");
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
    listener: mio::net::TcpListener,
    event_id: EventId,
}

pub struct TcpServer;

impl TcpServer {
    pub fn start(
        config: TcpServerConfig,
        callbacks: TcpCallbacks,
        debug: Arc<dyn DebugInterface>,
    ) -> Result<TcpServerHandle, ServerStartError> {
        let callbacks = Arc::new(callbacks);
        let worker_count = config.worker_count.max(1);

        let mut workers = Vec::with_capacity(worker_count);
        let mut worker_joins = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let worker_callbacks = Arc::clone(&callbacks);
            let worker_debug = Arc::clone(&debug);
            let write_buf_cap = config.write_buf_cap;
            let (join, handle) = WorkThread::start(
                format!("cyclone-tcp-worker-{i}"),
                config.workers,
                move |_looper, worker_handle| {
                    build_worker_on_message(worker_handle.clone(), worker_callbacks, worker_debug, write_buf_cap)
                },
            )
            .map_err(ServerStartError::ThreadSpawn)?;
            workers.push(handle);
            worker_joins.push(join);
        }

        let addrs = config.addrs.clone();
        let reuse_port = config.reuse_port;
        let workers_for_master = workers.clone();
        let (master_join, master_handle) =
            WorkThread::start("cyclone-tcp-master".to_string(), config.master, move |looper, _handle| {
                build_master(looper, addrs, reuse_port, workers_for_master)
            })
            .map_err(ServerStartError::ThreadSpawn)?;

        Ok(TcpServerHandle {
            master: master_handle,
            master_join: Some(master_join),
            workers,
            worker_joins,
        })
    }
}

fn bind_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<mio::net::TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

/// Build the master's listen sockets and return the `on_message` closure
/// handling `MasterMsg`. Runs entirely on the master thread; the `Rc<RefCell<_>>`
/// bookkeeping below never crosses a thread boundary.
fn build_master(
    looper: &mut Looper,
    addrs: Vec<SocketAddr>,
    reuse_port: bool,
    workers: Vec<WorkThreadHandle<WorkerMsg>>,
) -> impl FnMut(&mut Looper, MasterMsg) + 'static {
    let listeners: Rc<RefCell<Vec<Option<ListenerSlot>>>> = Rc::new(RefCell::new(Vec::new()));
    let next_worker = Rc::new(Cell::new(0usize));
    let next_conn_id = Rc::new(Cell::new(1 as ConnId));

    for addr in addrs {
        match bind_listener(addr, reuse_port) {
            Ok(listener) => {
                let fd = listener.as_raw_fd();
                let index = listeners.borrow().len();
                let listeners_for_cb = Rc::clone(&listeners);
                let workers_for_cb = workers.clone();
                let next_worker_for_cb = Rc::clone(&next_worker);
                let next_conn_id_for_cb = Rc::clone(&next_conn_id);
                let on_read: Callback = Box::new(move |_looper, _id| {
                    accept_loop(index, &listeners_for_cb, &workers_for_cb, &next_worker_for_cb, &next_conn_id_for_cb);
                });
                match looper.register_event(fd, Interest::READ, Some(on_read), None) {
                    Ok(event_id) => listeners.borrow_mut().push(Some(ListenerSlot { listener, event_id })),
                    Err(err) => warn!(?err, %addr, "tcp server: failed to register listener"),
                }
            }
            Err(err) => warn!(?err, %addr, "tcp server: failed to bind listener"),
        }
    }

    move |looper, msg| match msg {
        MasterMsg::Shutdown => {
            for slot in listeners.borrow_mut().iter_mut() {
                if let Some(slot) = slot.take() {
                    disable_all_and_delete(looper, slot.event_id);
                }
            }
            for worker in &workers {
                if worker.send(WorkerMsg::Shutdown).is_err() {
                    warn!("tcp server: worker inbox full while forwarding shutdown");
                }
            }
            looper.request_stop();
        }
        MasterMsg::StopListen { index } => {
            let mut listeners = listeners.borrow_mut();
            if let Some(slot) = listeners.get_mut(index).and_then(Option::take) {
                disable_all_and_delete(looper, slot.event_id);
            }
        }
    }
}

fn accept_loop(
    index: usize,
    listeners: &Rc<RefCell<Vec<Option<ListenerSlot>>>>,
    workers: &[WorkThreadHandle<WorkerMsg>],
    next_worker: &Cell<usize>,
    next_conn_id: &Cell<ConnId>,
) {
    if workers.is_empty() {
        return;
    }
    loop {
        let accept_result = {
            let listeners = listeners.borrow();
            match listeners.get(index).and_then(Option::as_ref) {
                Some(slot) => slot.listener.accept(),
                None => return,
            }
        };
        match accept_result {
            Ok((stream, peer_addr)) => {
                let local_addr = stream.local_addr().unwrap_or(peer_addr);
                let id = next_conn_id.get();
                next_conn_id.set(id + 1);
                let worker_idx = next_worker.get() % workers.len();
                next_worker.set(worker_idx + 1);
                if workers[worker_idx].send(WorkerMsg::NewConnection { id, stream, peer_addr, local_addr }).is_err() {
                    warn!(conn = id, "tcp server: worker inbox full, dropping accepted connection");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                debug!(?err, "tcp server: accept loop ended");
                break;
            }
        }
    }
}

/// Build a worker's `on_message` handler. Called once on the worker thread
/// before its loop starts; the returned closure closes over a thread-local
/// `Rc<RefCell<HashMap<...>>>` so it never needs to be `Send`.
pub(crate) fn build_worker_on_message(
    self_handle: WorkThreadHandle<WorkerMsg>,
    callbacks: Arc<TcpCallbacks>,
    debug: Arc<dyn DebugInterface>,
    write_buf_cap: Option<usize>,
) -> impl FnMut(&mut Looper, WorkerMsg) + 'static {
    let connections: ConnMap = Rc::new(RefCell::new(HashMap::new()));
    let shutting_down = Rc::new(Cell::new(false));

    move |looper, msg| match msg {
        WorkerMsg::NewConnection { id, stream, peer_addr, local_addr } => {
            TcpConnection::apply_socket_options(&stream);
            let fd = stream.as_raw_fd();
            let connections_for_read = Rc::clone(&connections);
            let connections_for_write = Rc::clone(&connections);
            let callbacks_for_read = Arc::clone(&callbacks);
            let callbacks_for_write = Arc::clone(&callbacks);
            let self_for_read = self_handle.clone();
            let self_for_write = self_handle.clone();
            let debug_for_read = Arc::clone(&debug);
            let debug_for_write = Arc::clone(&debug);
            let shutting_down_for_write = Rc::clone(&shutting_down);

            let shutting_down_for_read = Rc::clone(&shutting_down);
            let on_read: Callback = Box::new(move |looper, event_id| {
                handle_readable(
                    looper,
                    event_id,
                    id,
                    &connections_for_read,
                    &callbacks_for_read,
                    &self_for_read,
                    &debug_for_read,
                    &shutting_down_for_read,
                );
            });
            let on_write: Callback = Box::new(move |looper, event_id| {
                handle_writable(
                    looper,
                    event_id,
                    id,
                    &connections_for_write,
                    &callbacks_for_write,
                    &self_for_write,
                    &debug_for_write,
                    &shutting_down_for_write,
                );
            });

            match looper.register_event(fd, Interest::READ, Some(on_read), Some(on_write)) {
                Ok(event_id) => {
                    let conn = TcpConnection::new(id, stream, peer_addr, local_addr, event_id, write_buf_cap);
                    let shared = Arc::clone(&conn.shared);
                    connections.borrow_mut().insert(id, conn);
                    debug.set_value_i32("tcp.connections", connections.borrow().len() as i32);
                    if let Some(cb) = &callbacks.on_connected {
                        cb(&TcpConnHandle { shared, worker: self_handle.clone() });
                    }
                }
                Err(err) => warn!(?err, conn = id, "tcp server: failed to register new connection"),
            }
        }
        WorkerMsg::ApplicationSend { id, bytes } => {
            send_to_connection(looper, id, &bytes, &connections, &callbacks, &self_handle, &debug, &shutting_down);
        }
        WorkerMsg::ApplicationShutdown { id } => {
            begin_shutdown(looper, id, &connections, &callbacks, &debug, &shutting_down, &self_handle);
        }
        WorkerMsg::CloseConnection { id, shutdown_global } => {
            if shutdown_global {
                shutting_down.set(true);
            }
            begin_shutdown(looper, id, &connections, &callbacks, &debug, &shutting_down, &self_handle);
        }
        WorkerMsg::Shutdown => {
            shutting_down.set(true);
            if connections.borrow().is_empty() {
                looper.request_stop();
                return;
            }
            let ids: Vec<ConnId> = connections.borrow().keys().copied().collect();
            for id in ids {
                begin_shutdown(looper, id, &connections, &callbacks, &debug, &shutting_down, &self_handle);
            }
        }
    }
}

fn send_to_connection(
    looper: &mut Looper,
    id: ConnId,
    bytes: &[u8],
    connections: &ConnMap,
    callbacks: &Arc<TcpCallbacks>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
    debug: &Arc<dyn DebugInterface>,
    shutting_down: &Rc<Cell<bool>>,
) {
    let result = {
        let mut conns = connections.borrow_mut();
        let Some(conn) = conns.get_mut(&id) else { return };
        if conn.state() != ConnState::Connected {
            return;
        }
        conn.send_inline_or_queue(bytes).map(|armed| (armed, conn.event_id))
    };
    match result {
        Ok((armed, event_id)) => {
            let mut conns = connections.borrow_mut();
            if let Some(conn) = conns.get_mut(&id) {
                conn.mark_write_armed(armed);
            }
            drop(conns);
            set_write_interest(looper, event_id, armed);
        }
        Err(Outcome::FireClose) => {
            close_connection(looper, id, connections, callbacks, self_handle, debug, shutting_down);
        }
        Err(Outcome::Ok) => {}
    }
}

fn begin_shutdown(
    looper: &mut Looper,
    id: ConnId,
    connections: &ConnMap,
    callbacks: &Arc<TcpCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    shutting_down: &Rc<Cell<bool>>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
) {
    let disposition = {
        let mut conns = connections.borrow_mut();
        let Some(conn) = conns.get_mut(&id) else { return };
        match conn.state() {
            ConnState::Connected => {
                conn.set_state(ConnState::Disconnecting);
                if conn.write_buf_is_empty() && !conn.writable_armed() { 1 } else { 0 }
            }
            ConnState::Disconnecting => {
                if conn.write_buf_is_empty() && !conn.writable_armed() { 1 } else { 0 }
            }
            ConnState::Disconnected => 2,
            ConnState::Connecting => 0,
        }
    };
    match disposition {
        1 => close_connection(looper, id, connections, callbacks, self_handle, debug, shutting_down),
        2 => {
            connections.borrow_mut().remove(&id);
            debug.set_value_i32("tcp.connections", connections.borrow().len() as i32);
            maybe_stop_after_drain(looper, connections, shutting_down);
        }
        _ => {}
    }
}

fn maybe_stop_after_drain(looper: &mut Looper, connections: &ConnMap, shutting_down: &Rc<Cell<bool>>) {
    if shutting_down.get() && connections.borrow().is_empty() {
        looper.request_stop();
    }
}

fn close_connection(
    looper: &mut Looper,
    id: ConnId,
    connections: &ConnMap,
    callbacks: &Arc<TcpCallbacks>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
    debug: &Arc<dyn DebugInterface>,
    shutting_down: &Rc<Cell<bool>>,
) {
    let shared = {
        let mut conns = connections.borrow_mut();
        let Some(conn) = conns.get_mut(&id) else { return };
        conn.shutdown_socket();
        conn.set_state(ConnState::Disconnected);
        disable_all_and_delete(looper, conn.event_id);
        let shared = Arc::clone(&conn.shared);
        conns.remove(&id);
        shared
    };
    debug.set_value_i32("tcp.connections", connections.borrow().len() as i32);
    if let Some(cb) = &callbacks.on_close {
        cb(&TcpConnHandle { shared, worker: self_handle.clone() });
    }
    maybe_stop_after_drain(looper, connections, shutting_down);
}

#[allow(clippy::too_many_arguments)]
fn handle_readable(
    looper: &mut Looper,
    _event_id: EventId,
    id: ConnId,
    connections: &ConnMap,
    callbacks: &Arc<TcpCallbacks>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
    debug: &Arc<dyn DebugInterface>,
    shutting_down: &Rc<Cell<bool>>,
) {
    let outcome = {
        let mut conns = connections.borrow_mut();
        let Some(conn) = conns.get_mut(&id) else { return };
        conn.on_readable()
    };
    match outcome {
        Ok(n) if n > 0 => {
            if let Some(cb) = &callbacks.on_message {
                let shared = {
                    let conns = connections.borrow();
                    match conns.get(&id) {
                        Some(conn) => Arc::clone(&conn.shared),
                        None => return,
                    }
                };
                let handle = TcpConnHandle { shared, worker: self_handle.clone() };
                let mut conns = connections.borrow_mut();
                if let Some(conn) = conns.get_mut(&id) {
                    cb(&handle, &mut conn.read_buf);
                }
            }
        }
        Ok(_) => {}
        Err(Outcome::FireClose) => {
            close_connection(looper, id, connections, callbacks, self_handle, debug, shutting_down);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_writable(
    looper: &mut Looper,
    event_id: EventId,
    id: ConnId,
    connections: &ConnMap,
    callbacks: &Arc<TcpCallbacks>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
    debug: &Arc<dyn DebugInterface>,
    shutting_down: &Rc<Cell<bool>>,
) {
    let result = {
        let mut conns = connections.borrow_mut();
        let Some(conn) = conns.get_mut(&id) else { return };
        conn.drain_write_buf()
    };
    match result {
        Ok(true) => {
            let (disconnecting, shared) = {
                let mut conns = connections.borrow_mut();
                let Some(conn) = conns.get_mut(&id) else { return };
                conn.mark_write_armed(false);
                (conn.state() == ConnState::Disconnecting, Arc::clone(&conn.shared))
            };
            set_write_interest(looper, event_id, false);
            if disconnecting {
                close_connection(looper, id, connections, callbacks, self_handle, debug, shutting_down);
                return;
            }
            if let Some(cb) = &callbacks.on_send_complete {
                cb(&TcpConnHandle { shared, worker: self_handle.clone() });
            }
        }
        Ok(false) => {}
        Err(Outcome::FireClose) => {
            close_connection(looper, id, connections, callbacks, self_handle, debug, shutting_down);
        }
    }
}
