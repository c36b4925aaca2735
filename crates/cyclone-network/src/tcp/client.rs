//! TCP client: spec.md §4.7.4. Connects a single fd asynchronously on its
//! own worker thread, reusing the same `Connected`/`Disconnecting` state
//! machine the server's workers drive (`handle_readable`/`handle_writable`
//! in `server.rs`), generalized here to a single slot instead of a
//! `HashMap<ConnId, TcpConnection>`.

use std::{
    cell::RefCell,
    io,
    net::SocketAddr,
    os::fd::AsRawFd,
    rc::Rc,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use tracing::{debug, warn};

use super::connection::{ConnId, ConnState, Outcome, TcpConnection, disable_all_and_delete, set_write_interest};
use super::server::WorkerMsg;
use super::TcpConnHandle;
use crate::debug_interface::DebugInterface;
use crate::reactor::{Callback, Interest, Looper};
use crate::work_thread::{WorkThread, WorkThreadConfig, WorkThreadHandle};

/// The client only ever drives one logical connection; spec.md §3's
/// `nextConnectionId` counter collapses to this fixed value.
const CLIENT_CONN_ID: ConnId = 1;

#[derive(Clone, Debug)]
pub struct TcpClientConfig {
    pub addr: SocketAddr,
    /// Opt-in writeBuf cap; see spec.md §9's writeBuf-cap Open Question.
    pub write_buf_cap: Option<usize>,
    pub worker: WorkThreadConfig,
}

impl TcpClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        TcpClientConfig { addr, write_buf_cap: None, worker: WorkThreadConfig::default() }
    }
}

/// Outcome handed to `on_connected`: either a live handle to the newly
/// `Connected` connection, or `Failed` (mirrors the source's
/// `onConnected(bool)`, split into a proper enum instead of a boolean plus
/// a maybe-null pointer).
pub enum ConnectOutcome<'a> {
    Connected(&'a TcpConnHandle),
    Failed,
}

/// Optional callbacks a TCP client installs. `on_connected` is mandatory
/// (it decides the retry policy on failure, per spec.md §4.7.4) but
/// defaults to "give up after the first failure" when not overridden.
pub struct TcpClientCallbacks {
    /// Called once per connect attempt's outcome. Return value is the
    /// retry delay in milliseconds when the outcome was `Failed`: `0` gives
    /// up, `>0` arms a one-shot timer that retries after that delay. The
    /// return value is ignored on `Connected`.
    pub on_connected: Box<dyn Fn(ConnectOutcome) -> u64 + Send + Sync>,
    pub on_message: Option<Box<dyn Fn(&TcpConnHandle, &mut cyclone_communication::RingBuffer) + Send + Sync>>,
    pub on_send_complete: Option<Box<dyn Fn(&TcpConnHandle) + Send + Sync>>,
    pub on_close: Option<Box<dyn Fn(&TcpConnHandle) + Send + Sync>>,
}

impl Default for TcpClientCallbacks {
    fn default() -> Self {
        TcpClientCallbacks {
            on_connected: Box::new(|_| 0),
            on_message: None,
            on_send_complete: None,
            on_close: None,
        }
    }
}

pub struct TcpClientHandle {
    worker: WorkThreadHandle<WorkerMsg>,
    join: Option<JoinHandle<()>>,
}

impl TcpClientHandle {
    /// Ask the client to shut down: drains an in-flight `Connected`
    /// connection gracefully, or cancels a pending connect/retry
    /// immediately. `join()` afterward to wait for the thread to exit.
    pub fn shutdown(&self) {
        if self.worker.send(WorkerMsg::Shutdown).is_err() {
            warn!("tcp client: inbox full while requesting shutdown");
        }
    }

    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// What the client's single slot currently holds.
enum Slot {
    /// Waiting on `connect()`'s writability to resolve.
    Connecting { stream: mio::net::TcpStream },
    Connected(TcpConnection),
    /// Gave up (retry budget exhausted) or mid-shutdown with nothing left.
    Idle,
}

pub struct TcpClient;

impl TcpClient {
    pub fn connect(
        config: TcpClientConfig,
        callbacks: TcpClientCallbacks,
        debug: Arc<dyn DebugInterface>,
    ) -> io::Result<TcpClientHandle> {
        let callbacks = Arc::new(callbacks);
        let addr = config.addr;
        let write_buf_cap = config.write_buf_cap;

        let (join, worker) = WorkThread::start(
            "cyclone-tcp-client".to_string(),
            config.worker,
            move |looper, self_handle| {
                build_client(looper, addr, write_buf_cap, callbacks, debug, self_handle.clone())
            },
        )?;

        Ok(TcpClientHandle { worker, join: Some(join) })
    }
}

fn build_client(
    looper: &mut Looper,
    addr: SocketAddr,
    write_buf_cap: Option<usize>,
    callbacks: Arc<TcpClientCallbacks>,
    debug: Arc<dyn DebugInterface>,
    self_handle: WorkThreadHandle<WorkerMsg>,
) -> impl FnMut(&mut Looper, WorkerMsg) + 'static {
    let slot: Rc<RefCell<Slot>> = Rc::new(RefCell::new(Slot::Idle));
    let shutting_down = Rc::new(std::cell::Cell::new(false));

    begin_connect(looper, addr, write_buf_cap, &callbacks, &debug, &self_handle, &slot);

    move |looper, msg| match msg {
        WorkerMsg::NewConnection { .. } => {
            debug_assert!(false, "tcp client never receives NewConnection");
        }
        WorkerMsg::ApplicationSend { id, bytes } if id == CLIENT_CONN_ID => {
            client_send(looper, &bytes, &slot, &callbacks, &debug, &self_handle, &shutting_down);
        }
        WorkerMsg::ApplicationShutdown { id } if id == CLIENT_CONN_ID => {
            client_begin_shutdown(looper, &slot, &callbacks, &debug, &self_handle, &shutting_down);
        }
        WorkerMsg::CloseConnection { shutdown_global, .. } => {
            if shutdown_global {
                shutting_down.set(true);
            }
            client_begin_shutdown(looper, &slot, &callbacks, &debug, &self_handle, &shutting_down);
        }
        WorkerMsg::Shutdown => {
            shutting_down.set(true);
            client_begin_shutdown(looper, &slot, &callbacks, &debug, &self_handle, &shutting_down);
        }
        WorkerMsg::ApplicationSend { .. } | WorkerMsg::ApplicationShutdown { .. } => {}
    }
}

/// Kick off one connect attempt: a non-blocking connecting socket,
/// registered for combined `Read|Write` interest so writability tells us
/// when the kernel has resolved the connect.
fn begin_connect(
    looper: &mut Looper,
    addr: SocketAddr,
    write_buf_cap: Option<usize>,
    callbacks: &Arc<TcpClientCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
    slot: &Rc<RefCell<Slot>>,
) {
    let stream = match mio::net::TcpStream::connect(addr) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(?err, %addr, "tcp client: connect() failed to even start");
            fail_and_maybe_retry(looper, addr, write_buf_cap, callbacks, debug, self_handle, slot);
            return;
        }
    };
    let fd = stream.as_raw_fd();

    let slot_for_read = Rc::clone(slot);
    let slot_for_write = Rc::clone(slot);
    let callbacks_for_read = Arc::clone(callbacks);
    let callbacks_for_write = Arc::clone(callbacks);
    let debug_for_read = Arc::clone(debug);
    let debug_for_write = Arc::clone(debug);
    let self_for_read = self_handle.clone();
    let self_for_write = self_handle.clone();
    let addr_for_write = addr;
    let cap_for_write = write_buf_cap;

    let on_read: Callback = Box::new(move |looper, event_id| {
        on_client_readable(looper, event_id, &slot_for_read, &callbacks_for_read, &debug_for_read, &self_for_read);
    });
    let on_write: Callback = Box::new(move |looper, event_id| {
        on_client_writable(
            looper,
            event_id,
            addr_for_write,
            cap_for_write,
            &slot_for_write,
            &callbacks_for_write,
            &debug_for_write,
            &self_for_write,
        );
    });

    match looper.register_event(fd, Interest::READ | Interest::WRITE, Some(on_read), Some(on_write)) {
        Ok(_event_id) => {
            *slot.borrow_mut() = Slot::Connecting { stream };
        }
        Err(err) => {
            warn!(?err, %addr, "tcp client: failed to register connecting socket");
            fail_and_maybe_retry(looper, addr, write_buf_cap, callbacks, debug, self_handle, slot);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn on_client_writable(
    looper: &mut Looper,
    event_id: crate::reactor::EventId,
    addr: SocketAddr,
    write_buf_cap: Option<usize>,
    slot: &Rc<RefCell<Slot>>,
    callbacks: &Arc<TcpClientCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
) {
    let resolving = matches!(&*slot.borrow(), Slot::Connecting { .. });
    if resolving {
        let stream = match std::mem::replace(&mut *slot.borrow_mut(), Slot::Idle) {
            Slot::Connecting { stream } => stream,
            _ => unreachable!(),
        };
        let connect_err = stream.take_error().ok().flatten();
        match connect_err {
            None => {
                let peer_addr = stream.peer_addr().unwrap_or(addr);
                let local_addr = stream.local_addr().unwrap_or(peer_addr);
                TcpConnection::apply_socket_options(&stream);
                let mut conn =
                    TcpConnection::new(CLIENT_CONN_ID, stream, peer_addr, local_addr, event_id, write_buf_cap);
                if let Err(err) = looper.disable_write(event_id) {
                    debug!(?err, "tcp client: failed to disarm write after connect");
                }
                conn.set_state(ConnState::Connected);
                let shared = Arc::clone(&conn.shared);
                *slot.borrow_mut() = Slot::Connected(conn);
                debug.set_value_i32("tcp.client.connected", 1);
                let handle = TcpConnHandle { shared, worker: self_handle.clone() };
                (callbacks.on_connected)(ConnectOutcome::Connected(&handle));
            }
            Some(err) => {
                debug!(?err, %addr, "tcp client: connect failed");
                disable_all_and_delete(looper, event_id);
                fail_and_maybe_retry(looper, addr, write_buf_cap, callbacks, debug, self_handle, slot);
            }
        }
        return;
    }

    // Already connected: this is an ordinary write-drain wakeup.
    let result = match &mut *slot.borrow_mut() {
        Slot::Connected(conn) => conn.drain_write_buf(),
        _ => return,
    };
    match result {
        Ok(true) => {
            let (disconnecting, shared) = match &mut *slot.borrow_mut() {
                Slot::Connected(conn) => {
                    conn.mark_write_armed(false);
                    (conn.state() == ConnState::Disconnecting, Arc::clone(&conn.shared))
                }
                _ => return,
            };
            set_write_interest(looper, event_id, false);
            if disconnecting {
                finish_close(looper, slot, callbacks, debug, self_handle);
                return;
            }
            if let Some(cb) = &callbacks.on_send_complete {
                cb(&TcpConnHandle { shared, worker: self_handle.clone() });
            }
        }
        Ok(false) => {}
        Err(Outcome::FireClose) => {
            finish_close(looper, slot, callbacks, debug, self_handle);
        }
    }
}

fn on_client_readable(
    looper: &mut Looper,
    _event_id: crate::reactor::EventId,
    slot: &Rc<RefCell<Slot>>,
    callbacks: &Arc<TcpClientCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
) {
    let outcome = match &mut *slot.borrow_mut() {
        Slot::Connected(conn) => conn.on_readable(),
        _ => return, // readability before connect resolves is spurious; write side handles it
    };
    match outcome {
        Ok(n) if n > 0 => {
            if let Some(cb) = &callbacks.on_message {
                let shared = match &*slot.borrow() {
                    Slot::Connected(conn) => Arc::clone(&conn.shared),
                    _ => return,
                };
                let handle = TcpConnHandle { shared, worker: self_handle.clone() };
                if let Slot::Connected(conn) = &mut *slot.borrow_mut() {
                    cb(&handle, &mut conn.read_buf);
                }
            }
        }
        Ok(_) => {}
        Err(Outcome::FireClose) => {
            finish_close(looper, slot, callbacks, debug, self_handle);
        }
    }
}

fn client_send(
    looper: &mut Looper,
    bytes: &[u8],
    slot: &Rc<RefCell<Slot>>,
    callbacks: &Arc<TcpClientCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
    _shutting_down: &Rc<std::cell::Cell<bool>>,
) {
    let result = match &mut *slot.borrow_mut() {
        Slot::Connected(conn) if conn.state() == ConnState::Connected => {
            conn.send_inline_or_queue(bytes).map(|armed| (armed, conn.event_id))
        }
        _ => return,
    };
    match result {
        Ok((armed, event_id)) => {
            if let Slot::Connected(conn) = &mut *slot.borrow_mut() {
                conn.mark_write_armed(armed);
            }
            set_write_interest(looper, event_id, armed);
        }
        Err(Outcome::FireClose) => finish_close(looper, slot, callbacks, debug, self_handle),
    }
}

fn client_begin_shutdown(
    looper: &mut Looper,
    slot: &Rc<RefCell<Slot>>,
    callbacks: &Arc<TcpClientCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
    shutting_down: &Rc<std::cell::Cell<bool>>,
) {
    let disposition = match &mut *slot.borrow_mut() {
        Slot::Connected(conn) => {
            match conn.state() {
                ConnState::Connected => {
                    conn.set_state(ConnState::Disconnecting);
                    (conn.write_buf_is_empty() && !conn.writable_armed()) as u8
                }
                ConnState::Disconnecting => (conn.write_buf_is_empty() && !conn.writable_armed()) as u8,
                ConnState::Disconnected => 2,
                ConnState::Connecting => 0,
            }
        }
        Slot::Connecting { .. } | Slot::Idle => 3,
    };
    match disposition {
        1 => finish_close(looper, slot, callbacks, debug, self_handle),
        2 | 3 => {
            *slot.borrow_mut() = Slot::Idle;
            if shutting_down.get() {
                looper.request_stop();
            }
        }
        _ => {}
    }
}

fn finish_close(
    looper: &mut Looper,
    slot: &Rc<RefCell<Slot>>,
    callbacks: &Arc<TcpClientCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
) {
    let shared = match std::mem::replace(&mut *slot.borrow_mut(), Slot::Idle) {
        Slot::Connected(conn) => {
            conn.shutdown_socket();
            conn.set_state(ConnState::Disconnected);
            disable_all_and_delete(looper, conn.event_id);
            Some(conn.shared)
        }
        _ => None,
    };
    debug.set_value_i32("tcp.client.connected", 0);
    if let Some(shared) = shared {
        if let Some(cb) = &callbacks.on_close {
            cb(&TcpConnHandle { shared, worker: self_handle.clone() });
        }
    }
}

/// Call `on_connected(Failed)`; if it asks for a retry, arm a timer channel
/// that deletes itself (spec.md §4.5's self-deletion-from-callback
/// allowance) and re-attempts the connect once it fires.
fn fail_and_maybe_retry(
    looper: &mut Looper,
    addr: SocketAddr,
    write_buf_cap: Option<usize>,
    callbacks: &Arc<TcpClientCallbacks>,
    debug: &Arc<dyn DebugInterface>,
    self_handle: &WorkThreadHandle<WorkerMsg>,
    slot: &Rc<RefCell<Slot>>,
) {
    let retry_ms = (callbacks.on_connected)(ConnectOutcome::Failed);
    if retry_ms == 0 {
        *slot.borrow_mut() = Slot::Idle;
        return;
    }

    let callbacks = Arc::clone(callbacks);
    let debug = Arc::clone(debug);
    let self_handle = self_handle.clone();
    let slot = Rc::clone(slot);
    let timer_cb: Callback = Box::new(move |looper, id| {
        looper.disable_all(id).ok();
        looper.delete_event(id);
        begin_connect(looper, addr, write_buf_cap, &callbacks, &debug, &self_handle, &slot);
    });
    looper.register_timer(Duration::from_millis(retry_ms), timer_cb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;

    #[test]
    fn connects_and_round_trips_a_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = mpsc::channel();
        let callbacks = TcpClientCallbacks {
            on_connected: Box::new(move |outcome| {
                if let ConnectOutcome::Connected(handle) = outcome {
                    handle.send(b"ping".to_vec());
                }
                0
            }),
            on_message: Some(Box::new(move |_handle, buf| {
                let mut out = vec![0u8; buf.len()];
                buf.pop(&mut out);
                let _ = tx.send(out);
            })),
            ..Default::default()
        };

        let config = TcpClientConfig::new(addr);
        let client = TcpClient::connect(config, callbacks, Arc::new(crate::debug_interface::NullDebugInterface))
            .unwrap();

        let (mut sock, _) = listener.accept().unwrap();
        use std::io::{Read, Write};
        let mut buf = [0u8; 4];
        sock.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        sock.write_all(b"pong").unwrap();

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, b"pong");

        client.shutdown();
        client.join();
    }

    #[test]
    fn failed_connect_retries_then_gives_up() {
        // Port 1 is privileged/unused in test sandboxes; connect should fail fast.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_cb = Arc::clone(&attempts);
        let (done_tx, done_rx) = mpsc::channel();
        let callbacks = TcpClientCallbacks {
            on_connected: Box::new(move |outcome| {
                if matches!(outcome, ConnectOutcome::Failed) {
                    let n = attempts_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    if n >= 2 {
                        let _ = done_tx.send(());
                        return 0;
                    }
                    return 20;
                }
                0
            }),
            ..Default::default()
        };
        let client =
            TcpClient::connect(TcpClientConfig::new(addr), callbacks, Arc::new(crate::debug_interface::NullDebugInterface))
                .unwrap();
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(attempts.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        client.shutdown();
        client.join();
    }
}
