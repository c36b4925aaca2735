//! One reliable-UDP peer session. Grounded on the source's dual-socket
//! design (`cyn_udp_connection.cpp`): the first datagram from a peer arrives
//! on a shared listening socket, but from then on this connection owns a
//! second, `connect()`-ed socket dedicated to that one peer, so the reactor
//! can demultiplex by fd instead of by address.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Instant,
};

use cyclone_communication::RingBuffer;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::kcp::{CONV, KcpEngine};
use crate::reactor::EventId;
use crate::tcp::Stats;

pub type UdpConnId = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UdpConnState {
    Connected = 0,
    Disconnecting = 1,
    Disconnected = 2,
}

impl UdpConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => UdpConnState::Connected,
            1 => UdpConnState::Disconnecting,
            _ => UdpConnState::Disconnected,
        }
    }
}

pub struct UdpConnShared {
    pub id: UdpConnId,
    state: AtomicU8,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub read_stats: Stats,
    pub write_stats: Stats,
}

impl UdpConnShared {
    pub fn state(&self) -> UdpConnState {
        UdpConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: UdpConnState) {
        self.state.store(s as u8, Ordering::Release);
    }
}

/// A reliable-UDP session, owned exclusively by the worker thread that hash-
/// dispatched its peer address. The engine's own ack/probe/resend segments
/// go straight to the wire from `tick`/`on_readable`; there's no separate
/// write-buffer layer the way TCP needs one, since `sendto` on a connected,
/// non-blocking UDP socket essentially never blocks the way a TCP write can.
pub struct UdpConnection {
    pub shared: Arc<UdpConnShared>,
    socket: mio::net::UdpSocket,
    pub event_id: Option<EventId>,
    pub update_timer_id: Option<EventId>,
    kcp: KcpEngine,
    read_buf: RingBuffer,
    recv_scratch: Vec<u8>,
    start: Instant,
}

/// Outcome of feeding the connection a readiness/timer/application event.
pub enum Outcome {
    Ok,
    /// The session finished draining after `shutdown()` and should be reaped
    /// (its teardown, including `on_close`, has already happened).
    Closed,
}

impl UdpConnection {
    /// Bind a socket to the master's own port (via `SO_REUSEADDR`, the way
    /// `bind_master_socket` binds the shared listener) and `connect()` it to
    /// `peer_addr`, dedicating it to this one session (spec.md §4.8's
    /// dual-socket design). Binding to the same port, not an ephemeral one,
    /// is load-bearing: the peer keeps sending to the master's port, so a
    /// secondary socket on any other port would never see its replies.
    pub fn new(id: UdpConnId, peer_addr: SocketAddr, local_addr: SocketAddr) -> std::io::Result<Self> {
        let domain = if local_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&local_addr.into())?;
        socket.connect(&peer_addr.into())?;
        let socket = mio::net::UdpSocket::from_std(socket.into());

        Ok(UdpConnection {
            shared: Arc::new(UdpConnShared {
                id,
                state: AtomicU8::new(UdpConnState::Connected as u8),
                peer_addr,
                local_addr,
                read_stats: Stats::default(),
                write_stats: Stats::default(),
            }),
            socket,
            event_id: None,
            update_timer_id: None,
            kcp: KcpEngine::new(CONV),
            read_buf: RingBuffer::new(),
            recv_scratch: vec![0u8; super::server::MAX_UDP_READ_SIZE],
            start: Instant::now(),
        })
    }

    pub fn fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.socket.as_raw_fd()
    }

    pub fn state(&self) -> UdpConnState {
        self.shared.state()
    }

    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    fn flush_output(&mut self) {
        let socket = &self.socket;
        let stats = &self.shared.write_stats;
        let now = self.now_ms();
        self.kcp.update(now, |pkt| {
            if let Ok(n) = socket.send(pkt) {
                stats.add(n);
            }
        });
    }

    /// `SocketReadable`: drain one datagram, feed it to the ARQ engine, and
    /// reassemble whatever complete application messages fall out. Returns
    /// the number of complete messages now sitting in `read_buf`.
    pub fn on_readable(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            match self.socket.recv(&mut self.recv_scratch) {
                Ok(n) => {
                    self.shared.read_stats.add(n);
                    self.kcp.input(&self.recv_scratch[..n]);
                    delivered += self.drain_ready_messages();
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        delivered
    }

    /// Feed a datagram that arrived on someone else's socket (the master's
    /// shared listening socket, before this session's dedicated secondary
    /// socket took over the 4-tuple). Same ARQ-input-then-reassemble path as
    /// [`Self::on_readable`], just sourced from an already-read buffer.
    pub fn feed_datagram(&mut self, bytes: &[u8]) -> usize {
        self.shared.read_stats.add(bytes.len());
        self.kcp.input(bytes);
        self.drain_ready_messages()
    }

    fn drain_ready_messages(&mut self) -> usize {
        let mut delivered = 0;
        let mut msg = Vec::new();
        while self.kcp.recv(&mut msg).is_some() {
            self.read_buf.push(&msg);
            delivered += 1;
        }
        delivered
    }

    pub fn read_buf(&mut self) -> &mut RingBuffer {
        &mut self.read_buf
    }

    /// Hand `bytes` to the ARQ engine and flush immediately; mirrors the
    /// source's on-thread send fast path (there's no cross-thread write-buf
    /// lock to take since this always runs on the owning worker).
    pub fn send(&mut self, bytes: &[u8]) {
        if self.kcp.send(bytes).is_err() {
            debug!(conn = self.shared.id, "udp: send queue cap exceeded, dropping message");
            return;
        }
        self.flush_output();
    }

    /// 10ms update tick: advance the ARQ clock, flush due segments, and
    /// force a recv-reassembly check even with no new input (mirrors
    /// `_on_udp_input(nullptr, 0)` in the source).
    pub fn tick(&mut self) -> (usize, Outcome) {
        self.flush_output();
        let delivered = self.drain_ready_messages();
        if self.state() == UdpConnState::Disconnecting && self.kcp.wait_snd() == 0 {
            self.shared.set_state(UdpConnState::Disconnected);
            return (delivered, Outcome::Closed);
        }
        (delivered, Outcome::Ok)
    }

    /// `wait_snd < 2 * send_window` threshold the source uses to fire
    /// `on_send_complete` (spec.md §4.8: "fires when waiting-to-send drops
    /// below twice the send window").
    pub fn send_complete_ready(&self) -> bool {
        self.kcp.wait_snd() < (self.kcp.snd_wnd() as usize) * 2
    }

    /// Begin shutdown: `Connected` -> `Disconnecting`. The transition to
    /// `Disconnected` completes on a later `tick` once the send queue
    /// drains; the caller should keep the connection alive until then.
    pub fn begin_shutdown(&mut self) -> bool {
        match self.state() {
            UdpConnState::Connected => {
                self.shared.set_state(UdpConnState::Disconnecting);
                self.kcp.wait_snd() == 0
            }
            UdpConnState::Disconnecting => self.kcp.wait_snd() == 0,
            UdpConnState::Disconnected => true,
        }
    }

    pub fn finish_disconnect(&mut self) {
        self.shared.set_state(UdpConnState::Disconnected);
    }

    pub fn set_event_id(&mut self, event_id: EventId) {
        self.event_id = Some(event_id);
    }

    pub fn set_update_timer_id(&mut self, timer_id: EventId) {
        self.update_timer_id = Some(timer_id);
    }
}
