//! SOCKS5 CONNECT proxy sample (spec.md §8 scenario 6): a subset of
//! RFC 1928 wide enough to tunnel a single CONNECT request per TCP
//! connection — no-auth greeting, IPv4/domain-name targets, IPv6 rejected,
//! replies always in the fixed 10-byte IPv4 form even for domain targets.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use clap::Parser;
use cyclone_communication::RingBuffer;
use cyclone_network::debug_interface::NullDebugInterface;
use cyclone_network::tcp::{
    ConnId, ConnectOutcome, TcpCallbacks, TcpClient, TcpClientCallbacks, TcpClientConfig, TcpConnHandle, TcpServer,
    TcpServerConfig, TcpClientHandle,
};

#[derive(Parser)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:1981")]
    addr: SocketAddr,
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

/// Per-connection negotiation state, keyed by the client-facing `ConnId`.
enum Session {
    AwaitingGreeting,
    AwaitingRequest,
    /// CONNECT accepted, upstream dial in flight; bytes arriving in this
    /// window are left unconsumed in the ring buffer and re-seen once
    /// `Established` lands.
    Connecting,
    Established { upstream_conn: TcpConnHandle, upstream_client: Arc<Mutex<Option<TcpClientHandle>>> },
}

enum SocksTarget {
    Addr(SocketAddr),
    Domain(String, u16),
}

type Sessions = Arc<Mutex<HashMap<ConnId, Session>>>;

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    run_server(cli.addr, cli.workers);
}

fn run_server(addr: SocketAddr, workers: usize) {
    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));

    let sessions_connected = Arc::clone(&sessions);
    let sessions_message = Arc::clone(&sessions);
    let sessions_close = Arc::clone(&sessions);
    let callbacks = TcpCallbacks {
        on_connected: Some(Box::new(move |conn| {
            sessions_connected.lock().unwrap().insert(conn.id(), Session::AwaitingGreeting);
        })),
        on_message: Some(Box::new(move |conn, buf| on_client_message(conn, buf, &sessions_message))),
        on_close: Some(Box::new(move |conn| teardown(conn.id(), &sessions_close))),
        ..Default::default()
    };

    let config = TcpServerConfig { addrs: vec![addr], worker_count: workers, ..Default::default() };
    let server =
        TcpServer::start(config, callbacks, Arc::new(NullDebugInterface)).expect("socks5 server: failed to start");
    tracing::info!(%addr, "socks5 proxy listening");
    wait_for_ctrl_c();
    server.shutdown();
    server.join();
}

fn on_client_message(conn: &TcpConnHandle, buf: &mut RingBuffer, sessions: &Sessions) {
    loop {
        let action = {
            let guard = sessions.lock().unwrap();
            match guard.get(&conn.id()) {
                Some(Session::AwaitingGreeting) => 0,
                Some(Session::AwaitingRequest) => 1,
                Some(Session::Connecting) => 2,
                Some(Session::Established { upstream_conn, .. }) => {
                    let upstream = upstream_conn.clone();
                    drop(guard);
                    if buf.is_empty() {
                        return;
                    }
                    let mut bytes = vec![0u8; buf.len()];
                    buf.pop(&mut bytes);
                    upstream.send(bytes);
                    return;
                }
                None => return,
            }
        };

        match action {
            0 => match try_parse_greeting(buf) {
                None => return,
                Some(()) => {
                    conn.send(vec![0x05, 0x00]);
                    sessions.lock().unwrap().insert(conn.id(), Session::AwaitingRequest);
                }
            },
            1 => match try_parse_request(buf) {
                None => return,
                Some(Err(rep)) => {
                    conn.send(failure_reply(rep));
                    conn.shutdown();
                    sessions.lock().unwrap().remove(&conn.id());
                    return;
                }
                Some(Ok(target)) => {
                    sessions.lock().unwrap().insert(conn.id(), Session::Connecting);
                    spawn_upstream_connect(conn.clone(), target, Arc::clone(sessions));
                    return;
                }
            },
            _ => return,
        }
    }
}

fn spawn_upstream_connect(client_conn: TcpConnHandle, target: SocksTarget, sessions: Sessions) {
    std::thread::spawn(move || {
        let addr = match resolve(&target) {
            Some(addr) => addr,
            None => {
                client_conn.send(failure_reply(0x04));
                client_conn.shutdown();
                sessions.lock().unwrap().remove(&client_conn.id());
                return;
            }
        };

        let holder: Arc<Mutex<Option<TcpClientHandle>>> = Arc::new(Mutex::new(None));
        let holder_cb = Arc::clone(&holder);
        let connected_conn = client_conn.clone();
        let message_conn = client_conn.clone();
        let close_conn = client_conn.clone();
        let sessions_connected = Arc::clone(&sessions);
        let sessions_close = Arc::clone(&sessions);

        let callbacks = TcpClientCallbacks {
            on_connected: Box::new(move |outcome| {
                match outcome {
                    ConnectOutcome::Connected(upstream) => {
                        connected_conn.send(success_reply(upstream.local_addr()));
                        sessions_connected.lock().unwrap().insert(
                            connected_conn.id(),
                            Session::Established {
                                upstream_conn: upstream.clone(),
                                upstream_client: Arc::clone(&holder_cb),
                            },
                        );
                    }
                    ConnectOutcome::Failed => {
                        connected_conn.send(failure_reply(0x05));
                        connected_conn.shutdown();
                        sessions_connected.lock().unwrap().remove(&connected_conn.id());
                    }
                }
                0
            }),
            on_message: Some(Box::new(move |_upstream, buf: &mut RingBuffer| {
                if buf.is_empty() {
                    return;
                }
                let mut bytes = vec![0u8; buf.len()];
                buf.pop(&mut bytes);
                message_conn.send(bytes);
            })),
            on_close: Some(Box::new(move |_upstream| {
                teardown(close_conn.id(), &sessions_close);
            })),
            ..Default::default()
        };

        match TcpClient::connect(TcpClientConfig::new(addr), callbacks, Arc::new(NullDebugInterface)) {
            Ok(handle) => *holder.lock().unwrap() = Some(handle),
            Err(err) => {
                tracing::warn!(%err, "socks5: failed to dial upstream");
                client_conn.send(failure_reply(0x01));
                client_conn.shutdown();
                sessions.lock().unwrap().remove(&client_conn.id());
            }
        }
    });
}

fn teardown(conn_id: ConnId, sessions: &Sessions) {
    if let Some(Session::Established { upstream_conn, upstream_client }) = sessions.lock().unwrap().remove(&conn_id) {
        upstream_conn.shutdown();
        if let Some(handle) = upstream_client.lock().unwrap().take() {
            std::thread::spawn(move || {
                handle.shutdown();
                handle.join();
            });
        }
    }
}

fn resolve(target: &SocksTarget) -> Option<SocketAddr> {
    match target {
        SocksTarget::Addr(addr) => Some(*addr),
        SocksTarget::Domain(host, port) => (host.as_str(), *port).to_socket_addrs().ok()?.next(),
    }
}

fn success_reply(bound: SocketAddr) -> Vec<u8> {
    let ip = match bound.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    let mut reply = vec![0x05, 0x00, 0x00, 0x01];
    reply.extend_from_slice(&ip.octets());
    reply.extend_from_slice(&bound.port().to_be_bytes());
    reply
}

fn failure_reply(rep_code: u8) -> Vec<u8> {
    vec![0x05, rep_code, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}

/// `VER(1) NMETHODS(1) METHODS(NMETHODS)`; only the no-auth method (`0x00`)
/// is ever accepted, so the methods list itself is discarded unread.
fn try_parse_greeting(ring: &mut RingBuffer) -> Option<()> {
    if ring.len() < 2 {
        return None;
    }
    let mut header = [0u8; 2];
    ring.peek(0, &mut header);
    let total = 2 + header[1] as usize;
    if ring.len() < total {
        return None;
    }
    ring.discard(total);
    Some(())
}

/// `VER(1) CMD(1) RSV(1) ATYP(1)` followed by an address that depends on
/// `ATYP`. Returns `Err(replyCode)` for anything this subset rejects: a
/// non-CONNECT command, or `ATYP == 0x04` (IPv6).
fn try_parse_request(ring: &mut RingBuffer) -> Option<Result<SocksTarget, u8>> {
    if ring.len() < 4 {
        return None;
    }
    let mut header = [0u8; 4];
    ring.peek(0, &mut header);
    let cmd = header[1];
    let atyp = header[3];

    if cmd != 0x01 {
        ring.discard(4);
        return Some(Err(0x07)); // command not supported
    }

    match atyp {
        0x01 => {
            let total = 4 + 4 + 2;
            if ring.len() < total {
                return None;
            }
            let mut body = vec![0u8; total];
            ring.peek(0, &mut body);
            ring.discard(total);
            let ip = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
            let port = u16::from_be_bytes([body[8], body[9]]);
            Some(Ok(SocksTarget::Addr(SocketAddr::new(ip.into(), port))))
        }
        0x03 => {
            if ring.len() < 5 {
                return None;
            }
            let mut len_byte = [0u8; 1];
            ring.peek(4, &mut len_byte);
            let domain_len = len_byte[0] as usize;
            let total = 4 + 1 + domain_len + 2;
            if ring.len() < total {
                return None;
            }
            let mut body = vec![0u8; total];
            ring.peek(0, &mut body);
            ring.discard(total);
            let domain = String::from_utf8_lossy(&body[5..5 + domain_len]).into_owned();
            let port = u16::from_be_bytes([body[5 + domain_len], body[6 + domain_len]]);
            Some(Ok(SocksTarget::Domain(domain, port)))
        }
        _ => {
            ring.discard(4);
            Some(Err(0x08)) // address type not supported (IPv6 and others)
        }
    }
}

fn wait_for_ctrl_c() {
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("failed to install Ctrl-C handler");
    let _ = rx.recv();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_waits_for_full_methods_list() {
        let mut ring = RingBuffer::new();
        ring.push(&[0x05, 0x02]);
        assert!(try_parse_greeting(&mut ring).is_none());
        ring.push(&[0x00, 0x01]);
        assert!(try_parse_greeting(&mut ring).is_some());
        assert!(ring.is_empty());
    }

    #[test]
    fn request_parses_ipv4_connect() {
        let mut ring = RingBuffer::new();
        ring.push(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90]);
        match try_parse_request(&mut ring).unwrap().unwrap() {
            SocksTarget::Addr(addr) => assert_eq!(addr, "127.0.0.1:8080".parse().unwrap()),
            SocksTarget::Domain(..) => panic!("expected Addr"),
        }
    }

    #[test]
    fn request_parses_domain_connect() {
        let mut ring = RingBuffer::new();
        let domain = b"example.com";
        ring.push(&[0x05, 0x01, 0x00, 0x03, domain.len() as u8]);
        ring.push(domain);
        ring.push(&0x0050u16.to_be_bytes());
        match try_parse_request(&mut ring).unwrap().unwrap() {
            SocksTarget::Domain(host, port) => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 80);
            }
            SocksTarget::Addr(_) => panic!("expected Domain"),
        }
    }

    #[test]
    fn request_rejects_ipv6() {
        let mut ring = RingBuffer::new();
        ring.push(&[0x05, 0x01, 0x00, 0x04]);
        ring.push(&[0u8; 18]);
        assert_eq!(try_parse_request(&mut ring).unwrap().unwrap_err(), 0x08);
    }

    #[test]
    fn request_rejects_non_connect_command() {
        let mut ring = RingBuffer::new();
        ring.push(&[0x05, 0x02, 0x00, 0x01]);
        ring.push(&[0u8; 6]);
        assert_eq!(try_parse_request(&mut ring).unwrap().unwrap_err(), 0x07);
    }
}
