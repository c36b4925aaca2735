//! Two-thread loopback: a `TcpServer` echoes bytes back with a twist, a
//! `TcpClient` sends once and asserts what comes back.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use cyclone_network::debug_interface::NullDebugInterface;
use cyclone_network::tcp::{ConnectOutcome, TcpCallbacks, TcpClient, TcpClientCallbacks, TcpClientConfig, TcpServer, TcpServerConfig};

#[test]
fn echoes_bytes_back_reversed() {
    let addr: SocketAddr = "127.0.0.1:27811".parse().unwrap();

    let callbacks = TcpCallbacks {
        on_message: Some(Box::new(|conn, buf| {
            let mut bytes = vec![0u8; buf.len()];
            buf.pop(&mut bytes);
            bytes.reverse();
            conn.send(bytes);
        })),
        ..Default::default()
    };
    let config = TcpServerConfig { addrs: vec![addr], worker_count: 1, ..Default::default() };
    let server = TcpServer::start(config, callbacks, Arc::new(NullDebugInterface)).unwrap();

    let (reply_tx, reply_rx) = mpsc::channel::<Vec<u8>>();
    let callbacks = TcpClientCallbacks {
        on_connected: Box::new(|outcome| {
            if let ConnectOutcome::Connected(conn) = outcome {
                conn.send(b"hello".to_vec());
            }
            0
        }),
        on_message: Some(Box::new(move |_conn, buf| {
            let mut bytes = vec![0u8; buf.len()];
            buf.pop(&mut bytes);
            let _ = reply_tx.send(bytes);
        })),
        ..Default::default()
    };
    let client = TcpClient::connect(TcpClientConfig::new(addr), callbacks, Arc::new(NullDebugInterface)).unwrap();

    let reply = reply_rx.recv_timeout(Duration::from_secs(5)).expect("no reply from server");
    assert_eq!(reply, b"olleh");

    client.shutdown();
    client.join();
    server.shutdown();
    server.join();
}

#[test]
fn shutdown_fires_on_close_exactly_once() {
    let addr: SocketAddr = "127.0.0.1:27812".parse().unwrap();

    let (close_tx, close_rx) = mpsc::channel::<()>();
    let callbacks = TcpCallbacks {
        on_close: Some(Box::new(move |_conn| {
            let _ = close_tx.send(());
        })),
        ..Default::default()
    };
    let config = TcpServerConfig { addrs: vec![addr], worker_count: 1, ..Default::default() };
    let server = TcpServer::start(config, callbacks, Arc::new(NullDebugInterface)).unwrap();

    let (connected_tx, connected_rx) = mpsc::channel::<()>();
    let callbacks = TcpClientCallbacks {
        on_connected: Box::new(move |outcome| {
            if matches!(outcome, ConnectOutcome::Connected(_)) {
                let _ = connected_tx.send(());
            }
            0
        }),
        ..Default::default()
    };
    let client = TcpClient::connect(TcpClientConfig::new(addr), callbacks, Arc::new(NullDebugInterface)).unwrap();
    connected_rx.recv_timeout(Duration::from_secs(5)).expect("client never connected");

    client.shutdown();
    client.join();

    close_rx.recv_timeout(Duration::from_secs(5)).expect("on_close never fired");
    assert_eq!(close_rx.try_recv().unwrap_err(), mpsc::TryRecvError::Empty, "on_close fired more than once");

    server.shutdown();
    server.join();
}
