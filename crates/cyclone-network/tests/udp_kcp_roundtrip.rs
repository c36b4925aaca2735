//! Two-thread loopback over the reliable-UDP (KCP-like) transport: one
//! `UdpServer` echoes a datagram back, another originates it and asserts
//! the payload survives the round trip byte-for-byte.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use cyclone_network::debug_interface::NullDebugInterface;
use cyclone_network::udp::{UdpCallbacks, UdpServer, UdpServerConfig};

#[test]
fn round_trips_a_payload_intact() {
    let server_addr: SocketAddr = "127.0.0.1:27911".parse().unwrap();
    let client_addr: SocketAddr = "127.0.0.1:27912".parse().unwrap();
    let payload = b"the quick brown fox jumps over the lazy dog".to_vec();

    let echo_callbacks = UdpCallbacks {
        on_message: Some(Box::new(|conn, buf| {
            let mut bytes = vec![0u8; buf.len()];
            buf.pop(&mut bytes);
            conn.send(bytes);
        })),
        ..Default::default()
    };
    let server_config = UdpServerConfig { addrs: vec![server_addr], worker_count: 1, ..Default::default() };
    let server =
        UdpServer::start(server_config, echo_callbacks, Arc::new(NullDebugInterface)).expect("server failed to start");

    let (reply_tx, reply_rx) = mpsc::channel::<Vec<u8>>();
    let client_callbacks = UdpCallbacks {
        on_message: Some(Box::new(move |_conn, buf| {
            let mut bytes = vec![0u8; buf.len()];
            buf.pop(&mut bytes);
            let _ = reply_tx.send(bytes);
        })),
        ..Default::default()
    };
    let client_config = UdpServerConfig { addrs: vec![client_addr], worker_count: 1, ..Default::default() };
    let client = UdpServer::start(client_config, client_callbacks, Arc::new(NullDebugInterface))
        .expect("client failed to start");

    client.connect(server_addr, client_addr, payload.clone());

    let reply = reply_rx.recv_timeout(Duration::from_secs(5)).expect("no reply within timeout");
    assert_eq!(reply, payload);

    client.shutdown();
    client.join();
    server.shutdown();
    server.join();
}
