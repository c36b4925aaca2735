//! Echo sample (spec.md §8 scenario 1): a server that upper-cases whatever
//! a client sends and closes the connection when it sees `"exit"`.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use cyclone_network::debug_interface::NullDebugInterface;
use cyclone_network::tcp::{
    ConnectOutcome, TcpCallbacks, TcpClient, TcpClientCallbacks, TcpClientConfig, TcpServer, TcpServerConfig,
};

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the echo server.
    Server {
        #[arg(long, default_value = "127.0.0.1:1978")]
        addr: SocketAddr,
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },
    /// Connect once, send `message`, print the reply, then disconnect.
    Client {
        #[arg(long, default_value = "127.0.0.1:1978")]
        addr: SocketAddr,
        #[arg(long, default_value = "hello")]
        message: String,
    },
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Server { addr, workers } => run_server(addr, workers),
        Command::Client { addr, message } => run_client(addr, message),
    }
}

fn run_server(addr: SocketAddr, workers: usize) {
    let config = TcpServerConfig { addrs: vec![addr], worker_count: workers, ..Default::default() };
    let callbacks = TcpCallbacks {
        on_message: Some(Box::new(|conn, buf| {
            let mut bytes = vec![0u8; buf.len()];
            buf.pop(&mut bytes);
            if bytes == b"exit" {
                tracing::info!(id = conn.id(), "echo server: client requested exit");
                conn.shutdown();
                return;
            }
            bytes.make_ascii_uppercase();
            conn.send(bytes);
        })),
        ..Default::default()
    };

    let server = TcpServer::start(config, callbacks, Arc::new(NullDebugInterface))
        .expect("echo server: failed to start");
    tracing::info!(%addr, workers, "echo server listening");
    wait_for_ctrl_c();
    server.shutdown();
    server.join();
}

fn run_client(addr: SocketAddr, message: String) {
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let message_bytes = message.into_bytes();
    let callbacks = TcpClientCallbacks {
        on_connected: Box::new(move |outcome| {
            if let ConnectOutcome::Connected(conn) = outcome {
                conn.send(message_bytes.clone());
            } else {
                tracing::error!("echo client: failed to connect");
            }
            0
        }),
        on_message: Some(Box::new(move |conn, buf| {
            let mut bytes = vec![0u8; buf.len()];
            buf.pop(&mut bytes);
            println!("{}", String::from_utf8_lossy(&bytes));
            conn.send(b"exit".to_vec());
        })),
        on_close: Some(Box::new({
            let done_tx = done_tx.clone();
            move |_conn| {
                let _ = done_tx.send(());
            }
        })),
        ..Default::default()
    };

    let client = TcpClient::connect(TcpClientConfig::new(addr), callbacks, Arc::new(NullDebugInterface))
        .expect("echo client: failed to spawn");
    let _ = done_rx.recv_timeout(std::time::Duration::from_secs(5));
    client.shutdown();
    client.join();
}

/// Block until Ctrl-C, so the server shuts down its threads cleanly
/// instead of the process just being killed out from under them.
fn wait_for_ctrl_c() {
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("failed to install Ctrl-C handler");
    let _ = rx.recv();
}
