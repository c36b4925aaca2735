//! TCP runtime: spec.md §4.7. A master/worker server (§4.7.1-§4.7.3) plus a
//! single-connection reconnecting client (§4.7.4), sharing the same
//! connection state machine and callback shape.
//!
//! Per spec.md §9's "Callback polymorphism" design note, a server/client
//! accepts a fixed struct of optional callbacks rather than the source's
//! variadic bind placeholders; application code receives a thin
//! [`TcpConnHandle`] (§9 "Shared ownership of Connection") instead of a
//! direct pointer, and every mutation not originating on the owning worker
//! thread is posted through that thread's inbox.

mod client;
mod connection;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use cyclone_communication::RingBuffer;

pub use client::{ConnectOutcome, TcpClient, TcpClientCallbacks, TcpClientConfig, TcpClientHandle};
pub use connection::{ConnId, ConnState, Stats};
pub use server::{TcpServer, TcpServerConfig, TcpServerHandle};

use connection::ConnShared;
use server::WorkerMsg;
use crate::work_thread::WorkThreadHandle;

/// Optional callbacks a TCP server installs. All fields default to `None`
/// (no-op) via `#[derive(Default)]`; set only the ones the application
/// cares about.
#[derive(Default)]
pub struct TcpCallbacks {
    pub on_connected: Option<Box<dyn Fn(&TcpConnHandle) + Send + Sync>>,
    pub on_message: Option<Box<dyn Fn(&TcpConnHandle, &mut RingBuffer) + Send + Sync>>,
    pub on_send_complete: Option<Box<dyn Fn(&TcpConnHandle) + Send + Sync>>,
    pub on_close: Option<Box<dyn Fn(&TcpConnHandle) + Send + Sync>>,
}

/// A thin, `Send + Clone` handle an application holds for one TCP
/// connection. It never touches connection state directly: `send`/
/// `shutdown` post a message to the owning worker thread's inbox, and the
/// read-only accessors read from the `Arc<ConnShared>` the worker publishes
/// (state is atomic; addresses and the write-buf length are snapshot reads).
pub struct TcpConnHandle {
    pub(crate) shared: Arc<ConnShared>,
    pub(crate) worker: WorkThreadHandle<WorkerMsg>,
}

impl Clone for TcpConnHandle {
    fn clone(&self) -> Self {
        TcpConnHandle { shared: Arc::clone(&self.shared), worker: self.worker.clone() }
    }
}

impl TcpConnHandle {
    pub fn id(&self) -> ConnId {
        self.shared.id
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Current size of the outbound write buffer; applications throttling
    /// above their own threshold (spec.md §4.7.3 back-pressure) poll this.
    pub fn write_buf_len(&self) -> usize {
        self.shared.write_buf_len()
    }

    /// `{bytes_total, bytes_per_sec}` since the last call, read side.
    pub fn read_statistics(&self) -> (u64, f64) {
        self.shared.read_stats.sample()
    }

    /// `{bytes_total, bytes_per_sec}` since the last call, write side.
    pub fn write_statistics(&self) -> (u64, f64) {
        self.shared.write_stats.sample()
    }

    /// Thread-safe send: always goes through the owning worker's inbox,
    /// even when called from that same worker thread, so the state
    /// machine only ever mutates `writeBuf` from one place.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) {
        if self.worker.send(WorkerMsg::ApplicationSend { id: self.id(), bytes: bytes.into() }).is_err() {
            tracing::warn!(conn = self.id(), "tcp: worker inbox full, dropping send");
        }
    }

    /// Begin a graceful shutdown: `Connected` -> `Disconnecting` until the
    /// write buffer drains, then the socket half-closes and `on_close`
    /// fires. Thread-safe for the same reason as `send`.
    pub fn shutdown(&self) {
        if self.worker.send(WorkerMsg::ApplicationShutdown { id: self.id() }).is_err() {
            tracing::warn!(conn = self.id(), "tcp: worker inbox full while requesting shutdown");
        }
    }
}
