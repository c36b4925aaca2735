//! Chat broadcast sample (spec.md §8 scenario 2): every framed packet a
//! client sends is fanned out, byte-for-byte, to every other connected
//! client.

use std::collections::HashMap;
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use cyclone_communication::Packet;
use cyclone_network::debug_interface::NullDebugInterface;
use cyclone_network::tcp::{
    ConnId, ConnectOutcome, TcpCallbacks, TcpClient, TcpClientCallbacks, TcpClientConfig, TcpConnHandle, TcpServer,
    TcpServerConfig,
};

/// Packet id for a chat message; the only message type this sample speaks.
const CHAT_MSG_ID: u16 = 1;
const HEAD_SIZE: usize = 4;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Server {
        #[arg(long, default_value = "127.0.0.1:1978")]
        addr: SocketAddr,
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },
    Client {
        #[arg(long, default_value = "127.0.0.1:1978")]
        addr: SocketAddr,
        #[arg(long)]
        name: String,
    },
}

fn main() {
    tracing_subscriber::fmt::init();
    match Cli::parse().command {
        Command::Server { addr, workers } => run_server(addr, workers),
        Command::Client { addr, name } => run_client(addr, name),
    }
}

type Registry = Arc<Mutex<HashMap<ConnId, TcpConnHandle>>>;

fn run_server(addr: SocketAddr, workers: usize) {
    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

    let registry_connected = Arc::clone(&registry);
    let registry_message = Arc::clone(&registry);
    let registry_close = Arc::clone(&registry);

    let callbacks = TcpCallbacks {
        on_connected: Some(Box::new(move |conn| {
            tracing::info!(id = conn.id(), "chat: client joined");
            registry_connected.lock().unwrap().insert(conn.id(), conn.clone());
        })),
        on_message: Some(Box::new(move |conn, buf| {
            while let Ok(Some(packet)) = Packet::build_from_ring_buffer(HEAD_SIZE, buf) {
                if packet.id() != CHAT_MSG_ID {
                    continue;
                }
                let frame = packet.raw_memory().to_vec();
                let registry = registry_message.lock().unwrap();
                for (id, peer) in registry.iter() {
                    if *id != conn.id() {
                        peer.send(frame.clone());
                    }
                }
            }
        })),
        on_close: Some(Box::new(move |conn| {
            tracing::info!(id = conn.id(), "chat: client left");
            registry_close.lock().unwrap().remove(&conn.id());
        })),
        ..Default::default()
    };

    let config = TcpServerConfig { addrs: vec![addr], worker_count: workers, ..Default::default() };
    let server = TcpServer::start(config, callbacks, Arc::new(NullDebugInterface))
        .expect("chat server: failed to start");
    tracing::info!(%addr, workers, "chat server listening");
    wait_for_ctrl_c();
    server.shutdown();
    server.join();
}

fn wait_for_ctrl_c() {
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("failed to install Ctrl-C handler");
    let _ = rx.recv();
}

fn run_client(addr: SocketAddr, name: String) {
    let handle_slot: Arc<Mutex<Option<TcpConnHandle>>> = Arc::new(Mutex::new(None));
    let handle_for_connect = Arc::clone(&handle_slot);

    let callbacks = TcpClientCallbacks {
        on_connected: Box::new(move |outcome| {
            match outcome {
                ConnectOutcome::Connected(conn) => {
                    *handle_for_connect.lock().unwrap() = Some(conn.clone());
                    println!("connected as {name}");
                }
                ConnectOutcome::Failed => eprintln!("chat client: failed to connect"),
            }
            0
        }),
        on_message: Some(Box::new(|_conn, buf| {
            if let Ok(Some(packet)) = Packet::build_from_ring_buffer(HEAD_SIZE, buf) {
                println!("{}", String::from_utf8_lossy(packet.payload()));
            }
        })),
        ..Default::default()
    };

    let client = TcpClient::connect(TcpClientConfig::new(addr), callbacks, Arc::new(NullDebugInterface))
        .expect("chat client: failed to spawn");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.is_empty() {
            continue;
        }
        if let Some(handle) = handle_slot.lock().unwrap().as_ref() {
            let packet = Packet::build(HEAD_SIZE, CHAT_MSG_ID, line.as_bytes());
            handle.send(packet.raw_memory().to_vec());
        }
    }

    client.shutdown();
    client.join();
}
