use thiserror::Error;

/// Failures from standing up a `Looper` or registering a channel with it.
#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("reactor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures a TCP/UDP client's `connect` can report before `on_connected`
/// ever fires.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),
}

/// Failures a TCP/UDP server's `start` can report; per spec.md §7 these
/// never panic, the caller just gets `Err` back.
#[derive(Error, Debug)]
pub enum ServerStartError {
    #[error("bind failed for {addr}: {source}")]
    Bind { addr: std::net::SocketAddr, source: std::io::Error },
    #[error("listen failed for {addr}: {source}")]
    Listen { addr: std::net::SocketAddr, source: std::io::Error },
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),
    #[error("worker thread spawn failed: {0}")]
    ThreadSpawn(std::io::Error),
}
