//! Reliable-UDP runtime: spec.md §4.8. A master thread owns one non-
//! blocking UDP socket per bound address and hash-dispatches datagrams by
//! peer address to a pool of worker threads; each worker owns a
//! `peerAddr -> Connection` table and drives a KCP-like ARQ engine
//! ([`kcp`]) per peer instead of the plain byte-stream buffers TCP uses.
//!
//! Shares the TCP runtime's "thin handle, owner-exclusive state" shape
//! (spec.md §9): applications get a [`UdpConnHandle`] that posts `send`/
//! `shutdown` through the owning worker's inbox rather than touching a
//! [`connection::UdpConnection`] directly.
//!
//! [`UdpServerHandle::connect`] lets an application originate a session
//! toward a peer instead of only reacting to one dialing in, for the
//! symmetric case where both ends run the same `UdpServer` and one has to
//! go first.

mod connection;
mod kcp;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use cyclone_communication::RingBuffer;

pub use connection::{UdpConnId, UdpConnState};
pub use kcp::CONV as KCP_CONV;
pub use server::{UdpServer, UdpServerConfig, UdpServerHandle};

use connection::UdpConnShared;
use crate::work_thread::WorkThreadHandle;
use server::WorkerMsg;

/// Optional callbacks a UDP server installs, matching the `on_message` /
/// `on_send_complete` / `on_closing` / `on_close` fields spec.md §3 gives
/// the UDP Connection record (there is deliberately no `on_connected`: the
/// transport has no handshake of its own, per spec.md §4.8.2).
#[derive(Default)]
pub struct UdpCallbacks {
    pub on_message: Option<Box<dyn Fn(&UdpConnHandle, &mut RingBuffer) + Send + Sync>>,
    pub on_send_complete: Option<Box<dyn Fn(&UdpConnHandle) + Send + Sync>>,
    pub on_closing: Option<Box<dyn Fn(&UdpConnHandle) + Send + Sync>>,
    pub on_close: Option<Box<dyn Fn(&UdpConnHandle) + Send + Sync>>,
}

/// A thin, `Send + Clone` handle to one reliable-UDP peer session.
pub struct UdpConnHandle {
    pub(crate) shared: Arc<UdpConnShared>,
    pub(crate) worker: WorkThreadHandle<WorkerMsg>,
}

impl Clone for UdpConnHandle {
    fn clone(&self) -> Self {
        UdpConnHandle { shared: Arc::clone(&self.shared), worker: self.worker.clone() }
    }
}

impl UdpConnHandle {
    pub fn id(&self) -> UdpConnId {
        self.shared.id
    }

    pub fn state(&self) -> UdpConnState {
        self.shared.state()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn read_statistics(&self) -> (u64, f64) {
        self.shared.read_stats.sample()
    }

    pub fn write_statistics(&self) -> (u64, f64) {
        self.shared.write_stats.sample()
    }

    /// Buffer `bytes` into the ARQ send queue and flush opportunistically
    /// (spec.md §4.8.3). Always posted through the owning worker's inbox,
    /// even from that same worker thread, so the engine only ever mutates
    /// from one place.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) {
        if self.worker.send(WorkerMsg::ApplicationSend { id: self.id(), bytes: bytes.into() }).is_err() {
            tracing::warn!(conn = self.id(), "udp: worker inbox full, dropping send");
        }
    }

    /// Begin graceful shutdown: flush the ARQ send queue, fire `on_closing`,
    /// and keep ticking until every send is acknowledged before `on_close`
    /// fires and the session is reaped (spec.md §4.8.4).
    pub fn shutdown(&self) {
        if self.worker.send(WorkerMsg::ApplicationShutdown { id: self.id() }).is_err() {
            tracing::warn!(conn = self.id(), "udp: worker inbox full while requesting shutdown");
        }
    }
}
