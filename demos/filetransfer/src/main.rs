//! File-transfer sample (spec.md §8 scenario 3): a server exposing one
//! file, a client that splits it into 16-byte-aligned fragments fetched by
//! several parallel connections and Adler-32 checked as they arrive.

mod wire;

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use cyclone_network::debug_interface::NullDebugInterface;
use cyclone_network::tcp::{
    ConnectOutcome, TcpCallbacks, TcpClient, TcpClientCallbacks, TcpClientConfig, TcpServer, TcpServerConfig,
};

/// Fragment size; a multiple of 16 so every fragment boundary is
/// 16-byte-aligned per spec.md §8 scenario 3.
const FRAGMENT_SIZE: u64 = 64 * 1024;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Server {
        #[arg(long, default_value = "127.0.0.1:1979")]
        addr: SocketAddr,
        #[arg(long)]
        file: PathBuf,
    },
    Client {
        #[arg(long, default_value = "127.0.0.1:1979")]
        addr: SocketAddr,
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long)]
        output: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt::init();
    match Cli::parse().command {
        Command::Server { addr, file } => run_server(addr, file),
        Command::Client { addr, threads, output } => run_client(addr, threads, output),
    }
}

fn run_server(addr: SocketAddr, file: PathBuf) {
    let data = Arc::new(fs::read(&file).unwrap_or_else(|e| panic!("failed to read {file:?}: {e}")));
    let name = file.file_name().unwrap_or_default().to_string_lossy().into_owned();

    let callbacks = TcpCallbacks {
        on_message: Some(Box::new(move |conn, buf| {
            while let Some((id, payload)) = wire::decode(buf) {
                match id {
                    wire::REQUIRE_FILE_INFO => {
                        let reply = wire::ReplyFileInfo {
                            file_size: data.len() as u64,
                            thread_counts: 4,
                            name: name.clone(),
                        };
                        conn.send(wire::encode(wire::REPLY_FILE_INFO, &reply.encode()));
                    }
                    wire::REQUIRE_FILE_FRAGMENT => {
                        let Some(req) = wire::RequireFileFragment::decode(&payload) else { continue };
                        let start = req.offset as usize;
                        let end = (start + req.size as usize).min(data.len());
                        let bytes = if start < data.len() { &data[start..end] } else { &[] };
                        conn.send(wire::encode(
                            wire::REPLY_FILE_FRAGMENT,
                            &wire::ReplyFileFragment::encode(req.offset, bytes),
                        ));
                    }
                    other => tracing::warn!(other, "filetransfer server: unknown message id"),
                }
            }
        })),
        ..Default::default()
    };

    let config = TcpServerConfig { addrs: vec![addr], worker_count: 2, ..Default::default() };
    let server = TcpServer::start(config, callbacks, Arc::new(NullDebugInterface))
        .expect("filetransfer server: failed to start");
    tracing::info!(%addr, ?file, "filetransfer server listening");
    wait_for_ctrl_c();
    server.shutdown();
    server.join();
}

fn run_client(addr: SocketAddr, threads: usize, output: PathBuf) {
    // First connection: fetch file info so we know the size to split across
    // `threads` parallel fragment-fetching connections.
    let (info_tx, info_rx) = std::sync::mpsc::channel();
    let callbacks = TcpClientCallbacks {
        on_connected: Box::new(move |outcome| {
            if let ConnectOutcome::Connected(conn) = outcome {
                conn.send(wire::encode(wire::REQUIRE_FILE_INFO, &[]));
            }
            0
        }),
        on_message: Some(Box::new(move |conn, buf| {
            if let Some((wire::REPLY_FILE_INFO, payload)) = wire::decode(buf) {
                if let Some(info) = wire::ReplyFileInfo::decode(&payload) {
                    let _ = info_tx.send(info.file_size);
                }
                conn.shutdown();
            }
        })),
        ..Default::default()
    };
    let info_client = TcpClient::connect(TcpClientConfig::new(addr), callbacks, Arc::new(NullDebugInterface))
        .expect("filetransfer client: failed to spawn info probe");
    let file_size = info_rx.recv_timeout(std::time::Duration::from_secs(5)).expect("no file-info reply");
    info_client.join();

    fs::File::create(&output).unwrap_or_else(|e| panic!("failed to create {output:?}: {e}")).set_len(file_size).ok();

    let next_offset = Arc::new(AtomicU64::new(0));
    let out_file = Arc::new(Mutex::new(fs::OpenOptions::new().write(true).open(&output).unwrap()));
    let mut handles = Vec::with_capacity(threads);

    for worker in 0..threads {
        let next_offset = Arc::clone(&next_offset);
        let out_file = Arc::clone(&out_file);
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let callbacks = build_fragment_fetcher(file_size, next_offset, out_file, done_tx);
        let client = TcpClient::connect(TcpClientConfig::new(addr), callbacks, Arc::new(NullDebugInterface))
            .unwrap_or_else(|e| panic!("worker {worker}: failed to spawn: {e}"));
        done_rx.recv_timeout(std::time::Duration::from_secs(30)).expect("worker timed out");
        handles.push(client);
    }
    for client in handles {
        client.shutdown();
        client.join();
    }
    tracing::info!(%file_size, threads, ?output, "filetransfer client: done");
}

/// Build the `on_connected`/`on_message` pair for one fragment-fetching
/// connection: claim the next unclaimed fragment offset, request it,
/// verify its checksum, write it in place, and repeat until the file is
/// exhausted.
fn build_fragment_fetcher(
    file_size: u64,
    next_offset: Arc<AtomicU64>,
    out_file: Arc<Mutex<fs::File>>,
    done: std::sync::mpsc::Sender<()>,
) -> TcpClientCallbacks {
    let next_offset_connected = Arc::clone(&next_offset);
    let done_connected = done.clone();
    TcpClientCallbacks {
        on_connected: Box::new(move |outcome| {
            match outcome {
                ConnectOutcome::Connected(conn) => request_next_fragment(conn, file_size, &next_offset_connected),
                ConnectOutcome::Failed => {
                    let _ = done_connected.send(());
                }
            }
            0
        }),
        on_message: Some(Box::new(move |conn, buf| {
            let Some((wire::REPLY_FILE_FRAGMENT, payload)) = wire::decode(buf) else { return };
            let Some(fragment) = wire::ReplyFileFragment::decode(&payload) else { return };
            let expected = cyclone_crypto::adler32(cyclone_crypto::INITIAL_ADLER, &fragment.bytes);
            if fragment.crc32 != expected {
                tracing::error!(offset = fragment.offset, "filetransfer client: fragment CRC mismatch");
                let _ = done.send(());
                conn.shutdown();
                return;
            }
            {
                let mut file = out_file.lock().unwrap();
                file.seek(SeekFrom::Start(fragment.offset)).unwrap();
                file.write_all(&fragment.bytes).unwrap();
            }
            if !request_next_fragment(conn, file_size, &next_offset) {
                let _ = done.send(());
                conn.shutdown();
            }
        })),
        ..Default::default()
    }
}

/// Atomically claim the next `FRAGMENT_SIZE` stripe and request it; returns
/// `false` once the file is fully claimed.
fn request_next_fragment(
    conn: &cyclone_network::tcp::TcpConnHandle,
    file_size: u64,
    next_offset: &Arc<AtomicU64>,
) -> bool {
    let offset = next_offset.fetch_add(FRAGMENT_SIZE, Ordering::SeqCst);
    if offset >= file_size {
        return false;
    }
    let size = FRAGMENT_SIZE.min(file_size - offset) as i32;
    let req = wire::RequireFileFragment { offset, size };
    conn.send(wire::encode(wire::REQUIRE_FILE_FRAGMENT, &req.encode()));
    true
}

fn wait_for_ctrl_c() {
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("failed to install Ctrl-C handler");
    let _ = rx.recv();
}
