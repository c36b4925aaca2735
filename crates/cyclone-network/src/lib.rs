//! Reactor, worker-thread pool, TCP and reliable-UDP (KCP) connection
//! runtimes. See spec.md §4.5-§4.8 for the component-level contracts this
//! crate implements.

pub mod debug_interface;
pub mod error;
pub mod reactor;
pub mod tcp;
pub mod udp;
pub mod work_thread;

pub use debug_interface::{DebugInterface, NullDebugInterface};
pub use error::{ConnectError, ReactorError, ServerStartError};
pub use reactor::{Callback, EventId, Interest, Looper, LooperHandle};
pub use udp::{UdpCallbacks, UdpConnHandle, UdpConnId, UdpConnState, UdpServer, UdpServerConfig, UdpServerHandle};
pub use work_thread::{WorkThread, WorkThreadConfig, WorkThreadHandle};
