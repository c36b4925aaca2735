//! Reliable-UDP ping-pong sample (spec.md §8 scenario 4): mode 1 sends a
//! fixed-size payload back and forth over the KCP-like ARQ transport and
//! checks every round trip arrives byte-identical.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use cyclone_network::debug_interface::NullDebugInterface;
use cyclone_network::udp::{UdpCallbacks, UdpServer, UdpServerConfig};

const PAYLOAD_SIZE: usize = 1400;
const ITERATIONS: usize = 500;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Server {
        #[arg(long, default_value = "127.0.0.1:1980")]
        addr: SocketAddr,
    },
    Client {
        #[arg(long, default_value = "127.0.0.1:1980")]
        addr: SocketAddr,
        #[arg(long, default_value_t = ITERATIONS)]
        iterations: usize,
    },
}

fn main() {
    tracing_subscriber::fmt::init();
    match Cli::parse().command {
        Command::Server { addr } => run_server(addr),
        Command::Client { addr, iterations } => run_client(addr, iterations),
    }
}

fn payload_for(iteration: usize) -> Vec<u8> {
    (0..PAYLOAD_SIZE).map(|i| (i.wrapping_add(iteration) % 256) as u8).collect()
}

fn run_server(addr: SocketAddr) {
    let callbacks = UdpCallbacks {
        on_message: Some(Box::new(|conn, buf| {
            let mut bytes = vec![0u8; buf.len()];
            buf.pop(&mut bytes);
            // Pong: echo the ping straight back.
            conn.send(bytes);
        })),
        ..Default::default()
    };
    let config = UdpServerConfig { addrs: vec![addr], worker_count: 1, ..Default::default() };
    let server =
        UdpServer::start(config, callbacks, Arc::new(NullDebugInterface)).expect("pingpong server: failed to start");
    tracing::info!(%addr, "pingpong server listening");
    wait_for_ctrl_c();
    server.shutdown();
    server.join();
}

fn run_client(addr: SocketAddr, iterations: usize) {
    let local_addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
    let (done_tx, done_rx) = std::sync::mpsc::channel::<bool>();
    let received = Arc::new(AtomicUsize::new(0));
    let bytes_transferred = Arc::new(AtomicUsize::new(0));

    let received_cb = Arc::clone(&received);
    let bytes_cb = Arc::clone(&bytes_transferred);
    let done_tx_cb = done_tx.clone();
    let callbacks = UdpCallbacks {
        on_message: Some(Box::new(move |conn, buf| {
            let mut got = vec![0u8; buf.len()];
            buf.pop(&mut got);
            let iteration = received_cb.fetch_add(1, Ordering::SeqCst);
            let expected = payload_for(iteration);
            if got != expected {
                tracing::error!(iteration, "pingpong client: payload mismatch on round trip");
                let _ = done_tx_cb.send(false);
                return;
            }
            bytes_cb.fetch_add(got.len() * 2, Ordering::SeqCst);
            let next = iteration + 1;
            if next >= iterations {
                let _ = done_tx_cb.send(true);
                return;
            }
            conn.send(payload_for(next));
        })),
        ..Default::default()
    };

    let config = UdpServerConfig { addrs: vec![local_addr], worker_count: 1, ..Default::default() };
    let client =
        UdpServer::start(config, callbacks, Arc::new(NullDebugInterface)).expect("pingpong client: failed to start");
    client.connect(addr, local_addr, payload_for(0));

    let ok = done_rx.recv_timeout(std::time::Duration::from_secs(60)).unwrap_or(false);
    let total = bytes_transferred.load(Ordering::SeqCst);
    if ok {
        tracing::info!(iterations, total_bytes = total, "pingpong client: all round trips verified");
    } else {
        tracing::error!("pingpong client: failed or timed out");
    }
    client.shutdown();
    client.join();
    std::process::exit(if ok { 0 } else { 1 });
}

fn wait_for_ctrl_c() {
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("failed to install Ctrl-C handler");
    let _ = rx.recv();
}
