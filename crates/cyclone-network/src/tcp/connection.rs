use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicU8, Ordering},
    },
    time::Instant,
};

use cyclone_communication::RingBuffer;
use cyclone_utils::safe_panic;
use tracing::{debug, warn};

use crate::reactor::{EventId, Interest, Looper};

/// Monotonic connection id, assigned by the owning server/client starting
/// at 1 (spec.md §3 `nextConnectionId`).
pub type ConnId = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// Rolling byte-rate counter, refreshed lazily whenever sampled. Grounded on
/// the source's `cyu_statistics.h`, simplified to plain atomics since this
/// rendition has no shared-memory telemetry queue to feed.
#[derive(Default)]
pub struct Stats {
    bytes_total: AtomicU64,
    window_start: Mutex<Option<(Instant, u64)>>,
}

impl Stats {
    pub(crate) fn add(&self, n: usize) {
        self.bytes_total.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// `{bytes_total, bytes_per_sec}`, the latter computed over the time
    /// since the last call to this function (or since construction).
    pub fn sample(&self) -> (u64, f64) {
        let total = self.bytes_total.load(Ordering::Relaxed);
        let mut window = self.window_start.lock().unwrap();
        let now = Instant::now();
        let rate = match *window {
            Some((start, prev_total)) => {
                let elapsed = now.duration_since(start).as_secs_f64();
                if elapsed > 0.0 { (total - prev_total) as f64 / elapsed } else { 0.0 }
            }
            None => 0.0,
        };
        *window = Some((now, total));
        rate
    }
}

/// State shared between the owning worker thread's `Connection` and every
/// `TcpConnHandle` clone an application holds. The worker thread is the
/// only writer; other threads only read (`state`, address fields, stats) or
/// post messages through the owning `WorkThread`'s inbox.
pub struct ConnShared {
    pub id: ConnId,
    state: AtomicU8,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub read_stats: Stats,
    pub write_stats: Stats,
    /// Soft cap on `write_buf`'s size; `None` means unbounded, matching the
    /// source. A behavioral extension per spec.md §9's writeBuf-cap Open
    /// Question, opt-in and off by default.
    pub write_buf_cap: Option<usize>,
    write_buf_len: AtomicU64,
}

impl ConnShared {
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn write_buf_len(&self) -> usize {
        self.write_buf_len.load(Ordering::Relaxed) as usize
    }
}

/// A TCP connection, owned exclusively by the worker thread that accepted
/// or established it. Application code never touches this type directly;
/// it only ever sees a [`crate::tcp::TcpConnHandle`].
pub struct TcpConnection {
    pub shared: Arc<ConnShared>,
    stream: mio::net::TcpStream,
    pub event_id: EventId,
    pub read_buf: RingBuffer,
    write_buf: Arc<Mutex<RingBuffer>>,
    write_armed: bool,
}

/// Outcome of feeding a connection a readiness/application event, reported
/// back to the worker so it knows whether to fire `on_close` and reap the
/// connection from its map.
pub enum Outcome {
    Ok,
    FireClose,
}

impl TcpConnection {
    pub fn new(
        id: ConnId,
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        event_id: EventId,
        write_buf_cap: Option<usize>,
    ) -> Self {
        TcpConnection {
            shared: Arc::new(ConnShared {
                id,
                state: AtomicU8::new(ConnState::Connected as u8),
                peer_addr,
                local_addr,
                read_stats: Stats::default(),
                write_stats: Stats::default(),
                write_buf_cap,
                write_buf_len: AtomicU64::new(0),
            }),
            stream,
            event_id,
            read_buf: RingBuffer::new(),
            write_buf: Arc::new(Mutex::new(RingBuffer::new())),
            write_armed: false,
        }
    }

    /// Apply the socket option set spec.md §4.7.2 calls for right after
    /// `NewConnection`: keepalive on, linger off, Nagle off, non-blocking
    /// and close-on-exec (the latter two are already true of any
    /// `mio::net::TcpStream`).
    pub fn apply_socket_options(stream: &mio::net::TcpStream) {
        stream.set_nodelay(true).ok();
        let fd = stream.as_raw_fd();
        unsafe {
            let one: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                std::ptr::addr_of!(one).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            let linger = libc::linger { l_onoff: 0, l_linger: 0 };
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                std::ptr::addr_of!(linger).cast(),
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            );
        }
    }

    pub fn writable_armed(&self) -> bool {
        self.write_armed
    }

    /// `Connected` + `SocketReadable`: pull bytes off the wire into
    /// `read_buf`. Returns the number of bytes read (so the caller can
    /// decide whether to fire `on_message`) or signals the connection must
    /// close.
    pub fn on_readable(&mut self) -> Result<usize, Outcome> {
        match self.read_buf.read_from_socket(&mut SocketRead(&mut self.stream)) {
            Ok(0) => Err(Outcome::FireClose),
            Ok(n) => {
                self.shared.read_stats.add(n);
                Ok(n)
            }
            Err(ref e) if is_fatal(e) => Err(Outcome::FireClose),
            Err(_) => Ok(0),
        }
    }

    /// Drain the write buffer to the socket; called on `Write` readiness or
    /// immediately after an inline-path `send`. Returns `true` if the
    /// buffer fully drained (so the caller can disarm `Write` interest and
    /// fire `on_send_complete`).
    pub fn drain_write_buf(&mut self) -> Result<bool, Outcome> {
        let mut buf = self.write_buf.lock().unwrap();
        match buf.write_to_socket(&mut SocketWrite(&mut self.stream)) {
            Ok(n) => {
                self.shared.write_stats.add(n);
                self.shared.write_buf_len.store(buf.len() as u64, Ordering::Relaxed);
                Ok(buf.is_empty())
            }
            Err(ref e) if is_fatal(e) => Err(Outcome::FireClose),
            Err(_) => Ok(buf.is_empty()),
        }
    }

    /// Try an inline write first (the common case: an uncontended
    /// `writeBuf` with nothing already armed); whatever doesn't fit gets
    /// queued and `Write` interest is armed for the caller to request from
    /// the reactor.
    pub fn send_inline_or_queue(&mut self, bytes: &[u8]) -> Result<bool, Outcome> {
        if self.write_armed || !self.write_buf.lock().unwrap().is_empty() {
            self.queue_for_write(bytes);
            return Ok(true);
        }
        match self.stream.write(bytes) {
            Ok(n) if n == bytes.len() => {
                self.shared.write_stats.add(n);
                Ok(false)
            }
            Ok(n) => {
                self.queue_for_write(&bytes[n..]);
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.queue_for_write(bytes);
                Ok(true)
            }
            Err(ref e) if is_fatal(e) => Err(Outcome::FireClose),
            Err(_) => {
                self.queue_for_write(bytes);
                Ok(true)
            }
        }
    }

    /// Cross-thread write path: append under the writeBuf lock (the
    /// owning reactor thread may be mid-drain concurrently) and report
    /// whether `Write` interest needs arming.
    pub fn queue_for_write(&mut self, bytes: &[u8]) {
        let mut buf = self.write_buf.lock().unwrap();
        if let Some(cap) = self.shared.write_buf_cap {
            if buf.len() + bytes.len() > cap {
                warn!(
                    conn = self.shared.id,
                    cap, "tcp: writeBuf cap exceeded, dropping outbound bytes"
                );
                return;
            }
        }
        buf.push(bytes);
        self.shared.write_buf_len.store(buf.len() as u64, Ordering::Relaxed);
    }

    pub fn mark_write_armed(&mut self, armed: bool) {
        self.write_armed = armed;
    }

    pub fn write_buf_is_empty(&self) -> bool {
        self.write_buf.lock().unwrap().is_empty()
    }

    pub fn fd(&self) -> std::os::fd::RawFd {
        self.stream.as_raw_fd()
    }

    pub fn set_state(&self, s: ConnState) {
        self.shared.set_state(s);
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    /// `shutdown(fd, RDWR)` plus bookkeeping; the caller is responsible for
    /// deregistering/deleting the reactor channel and firing `on_close`.
    pub fn shutdown_socket(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

struct SocketRead<'a>(&'a mut mio::net::TcpStream);
impl Read for SocketRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}
struct SocketWrite<'a>(&'a mut mio::net::TcpStream);
impl Write for SocketWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn is_fatal(e: &io::Error) -> bool {
    !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Re-arm/disarm `Write` interest on the reactor channel backing `conn`,
/// logging (not panicking) on failure since a reactor registry error here
/// just means the connection is already on its way out.
pub fn set_write_interest(looper: &mut Looper, id: EventId, want: bool) {
    let res = if want { looper.enable_write(id) } else { looper.disable_write(id) };
    if let Err(err) = res {
        debug!(?err, "tcp: failed to toggle write interest");
    }
}

pub fn disable_all_and_delete(looper: &mut Looper, id: EventId) {
    if let Err(err) = looper.disable_all(id) {
        debug!(?err, "tcp: disable_all failed before delete_event");
    }
    looper.delete_event(id);
}
