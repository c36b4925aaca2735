//! Reliable-UDP ARQ engine: a from-scratch windowed send/resend/reassembly
//! state machine, tuned to the same "no-delay" parameters the source wires
//! into its KCP handle (`ikcp_nodelay(kcp, 1, 10, 2, 1)`). The actual segment
//! scheduler (`ikcp.c`) wasn't part of the retrieved source, so this is built
//! directly against the wire contract: a 24-byte header, 128-segment windows,
//! Jacobson RTO smoothing with no backoff past 2x, and fast retransmit after
//! two duplicate acks.
//!
//! This module is pure: no sockets, no reactor. [`UdpConnection`](super::connection::UdpConnection)
//! owns one [`KcpEngine`] per peer and is the only thing that touches I/O.

use std::collections::VecDeque;

pub const CONV: u32 = 0x1122_3344;
pub const HEADER_SIZE: usize = 24;
/// Max UDP payload a single segment occupies, matching the source's
/// `MAX_UDP_PACKET_SIZE` ceiling.
pub const MTU: usize = 1400;
const MSS: usize = MTU - HEADER_SIZE;

const CMD_PUSH: u8 = 81;
const CMD_ACK: u8 = 82;
const CMD_WASK: u8 = 83;
const CMD_WINS: u8 = 84;

const DEFAULT_WND: u32 = 128;
const RTO_INIT: u32 = 30;
const RTO_MIN: u32 = 10;
const RTO_MAX: u32 = 60_000;
const FAST_RESEND_DUP_ACKS: u32 = 2;
/// Upper bound on buffered-but-unsent application bytes (spec.md §4.8's
/// 2 MiB send-queue cap); `send` past this is rejected rather than silently
/// growing forever.
pub const SEND_QUEUE_BYTE_CAP: usize = 2 * 1024 * 1024;

#[derive(Debug)]
pub struct SendQueueFull;

#[derive(Clone)]
struct Segment {
    conv: u32,
    cmd: u8,
    frag: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    data: Vec<u8>,
    // bookkeeping for unacked segments sitting in `snd_buf`; unused on the wire.
    xmit: u32,
    resend_ts: u32,
    rto: u32,
    fast_ack: u32,
}

impl Segment {
    fn new(conv: u32, cmd: u8) -> Self {
        Segment { conv, cmd, frag: 0, wnd: 0, ts: 0, sn: 0, una: 0, data: Vec::new(), xmit: 0, resend_ts: 0, rto: 0, fast_ack: 0 }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.conv.to_le_bytes());
        out.push(self.cmd);
        out.push(self.frag);
        out.extend_from_slice(&self.wnd.to_le_bytes());
        out.extend_from_slice(&self.ts.to_le_bytes());
        out.extend_from_slice(&self.sn.to_le_bytes());
        out.extend_from_slice(&self.una.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let conv = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let cmd = buf[4];
        let frag = buf[5];
        let wnd = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let ts = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let sn = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let una = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let len = u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize;
        if buf.len() < HEADER_SIZE + len {
            return None;
        }
        let data = buf[HEADER_SIZE..HEADER_SIZE + len].to_vec();
        Some((Segment { conv, cmd, frag, wnd, ts, sn, una, data, xmit: 0, resend_ts: 0, rto: 0, fast_ack: 0 }, HEADER_SIZE + len))
    }
}

fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// One peer's reliable-UDP session state. `conv` must match on every inbound
/// segment; a mismatch is a protocol violation the caller should treat as a
/// dropped/foreign datagram rather than feeding to this engine.
pub struct KcpEngine {
    conv: u32,
    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    rx_rttval: i32,
    rx_srtt: i32,
    rx_rto: u32,
    current: u32,
    snd_queue: VecDeque<(Vec<u8>, u8)>,
    snd_queue_bytes: usize,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,
    ts_probe: u32,
    probe_wait: u32,
    probe_ask: bool,
    probe_tell: bool,
}

impl KcpEngine {
    pub fn new(conv: u32) -> Self {
        KcpEngine {
            conv,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            snd_wnd: DEFAULT_WND,
            rcv_wnd: DEFAULT_WND,
            rmt_wnd: DEFAULT_WND,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_INIT,
            current: 0,
            snd_queue: VecDeque::new(),
            snd_queue_bytes: 0,
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),
            ts_probe: 0,
            probe_wait: 0,
            probe_ask: false,
            probe_tell: false,
        }
    }

    /// Bytes of application data still waiting to be sent or acked.
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// Current send window, in segments; used by the connection layer to
    /// decide when `on_send_complete` should fire (spec.md §4.8: once
    /// `wait_snd` drops below twice this).
    pub fn snd_wnd(&self) -> u32 {
        self.snd_wnd
    }

    /// Fragment `buf` into `MSS`-sized segments and enqueue them, tagging
    /// each with a descending fragment index (`count-1-i`, `0` on the last
    /// segment of the message) so the receiver's `peek_size`/`recv` know
    /// how many segments to reassemble into one message. Rejects the call
    /// outright if the 2 MiB send-queue cap would be exceeded, rather than
    /// growing unbounded.
    pub fn send(&mut self, buf: &[u8]) -> Result<(), SendQueueFull> {
        if self.snd_queue_bytes + buf.len() > SEND_QUEUE_BYTE_CAP {
            return Err(SendQueueFull);
        }
        let count = buf.len().div_ceil(MSS).max(1);
        for i in 0..count {
            let start = i * MSS;
            let end = (start + MSS).min(buf.len());
            let frag = (count - 1 - i) as u8;
            self.snd_queue.push_back((buf[start..end].to_vec(), frag));
            self.snd_queue_bytes += end - start;
        }
        Ok(())
    }

    /// Feed one inbound UDP payload (already stripped of any framing below
    /// this layer) into the engine. Segments whose `conv` doesn't match are
    /// rejected; everything else updates acks, RTT, and `rcv_buf`/`rcv_queue`.
    pub fn input(&mut self, mut data: &[u8]) -> bool {
        let mut accepted = false;
        let mut max_ack = None;
        while let Some((seg, consumed)) = Segment::decode(data) {
            data = &data[consumed..];
            if seg.conv != self.conv {
                continue;
            }
            accepted = true;
            self.rmt_wnd = seg.wnd as u32;
            self.parse_una(seg.una);
            self.shrink_buf();

            match seg.cmd {
                CMD_ACK => {
                    self.update_ack(&seg);
                    max_ack = Some(max_ack.map_or(seg.sn, |m: u32| if time_diff(seg.sn, m) > 0 { seg.sn } else { m }));
                }
                CMD_PUSH => {
                    if time_diff(seg.sn, self.rcv_nxt + self.rcv_wnd) < 0 {
                        self.acklist.push((seg.sn, seg.ts));
                        if time_diff(seg.sn, self.rcv_nxt) >= 0 {
                            self.insert_rcv(seg);
                        }
                    }
                }
                CMD_WASK => self.probe_tell = true,
                CMD_WINS => {}
                _ => {}
            }
        }
        if let Some(sn) = max_ack {
            self.parse_fast_ack(sn);
        }
        self.move_rcv_to_queue();
        accepted
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(front) = self.snd_buf.front() {
            if time_diff(una, front.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn shrink_buf(&mut self) {
        self.snd_una = self.snd_buf.front().map_or(self.snd_nxt, |s| s.sn);
    }

    fn update_ack(&mut self, seg: &Segment) {
        if let Some(pos) = self.snd_buf.iter().position(|s| s.sn == seg.sn) {
            let acked = self.snd_buf.remove(pos).unwrap();
            if acked.xmit == 1 {
                self.update_rtt(time_diff(self.current, acked.ts));
            }
        }
        self.shrink_buf();
    }

    fn parse_fast_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if time_diff(sn, seg.sn) < 0 {
                break;
            }
            if sn != seg.sn {
                seg.fast_ack += 1;
            }
        }
    }

    fn update_rtt(&mut self, rtt: i32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = (rtt - self.rx_srtt).abs();
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = (7 * self.rx_srtt + rtt) / 8;
            if self.rx_srtt < 1 {
                self.rx_srtt = 1;
            }
        }
        let rto = self.rx_srtt + (4 * self.rx_rttval).max(1);
        self.rx_rto = (rto as u32).clamp(RTO_MIN, RTO_MAX);
    }

    fn insert_rcv(&mut self, seg: Segment) {
        if self.rcv_buf.iter().any(|s| s.sn == seg.sn) {
            return;
        }
        let pos = self.rcv_buf.iter().position(|s| time_diff(s.sn, seg.sn) > 0).unwrap_or(self.rcv_buf.len());
        self.rcv_buf.insert(pos, seg);
    }

    fn move_rcv_to_queue(&mut self) {
        while let Some(front) = self.rcv_buf.front() {
            if front.sn == self.rcv_nxt && (self.rcv_queue.len() as u32) < self.rcv_wnd {
                let seg = self.rcv_buf.pop_front().unwrap();
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.rcv_queue.push_back(seg);
            } else {
                break;
            }
        }
    }

    /// Size of the next fully-reassembled message, if one is ready.
    pub fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.frag == 0 {
            return Some(first.data.len());
        }
        if (self.rcv_queue.len() as u8) < first.frag + 1 {
            return None;
        }
        let mut total = 0;
        for seg in self.rcv_queue.iter().take(first.frag as usize + 1) {
            total += seg.data.len();
        }
        Some(total)
    }

    /// Pop the next fully-reassembled message into `buf`, returning its
    /// length. `None` if no complete message is ready yet.
    pub fn recv(&mut self, buf: &mut Vec<u8>) -> Option<usize> {
        let size = self.peek_size()?;
        buf.clear();
        let first_frag = self.rcv_queue.front()?.frag;
        for _ in 0..=first_frag {
            let seg = self.rcv_queue.pop_front()?;
            buf.extend_from_slice(&seg.data);
        }
        Some(size)
    }

    /// Advance the engine's internal clock, resend anything overdue, and
    /// emit every wire segment this tick produces via `output`. `now_ms` is
    /// caller-supplied (connection elapsed time since session start) so this
    /// module never touches the system clock.
    pub fn update(&mut self, now_ms: u32, mut output: impl FnMut(&[u8])) {
        self.current = now_ms;
        self.flush_acks(&mut output);
        self.probe_window(&mut output);
        self.flush_data(&mut output);
    }

    fn flush_acks(&mut self, output: &mut impl FnMut(&[u8])) {
        if self.acklist.is_empty() {
            return;
        }
        let wnd = self.rcv_wnd_avail();
        for (sn, ts) in std::mem::take(&mut self.acklist) {
            let mut seg = Segment::new(self.conv, CMD_ACK);
            seg.sn = sn;
            seg.ts = ts;
            seg.una = self.rcv_nxt;
            seg.wnd = wnd;
            let mut buf = Vec::with_capacity(HEADER_SIZE);
            seg.encode(&mut buf);
            output(&buf);
        }
    }

    fn rcv_wnd_avail(&self) -> u16 {
        if (self.rcv_queue.len() as u32) < self.rcv_wnd {
            (self.rcv_wnd - self.rcv_queue.len() as u32) as u16
        } else {
            0
        }
    }

    fn probe_window(&mut self, output: &mut impl FnMut(&[u8])) {
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = 7000;
                self.ts_probe = self.current + self.probe_wait;
            } else if time_diff(self.current, self.ts_probe) >= 0 {
                self.probe_wait = (self.probe_wait + self.probe_wait / 2).min(120_000);
                self.ts_probe = self.current + self.probe_wait;
                self.probe_ask = true;
            }
        } else {
            self.probe_wait = 0;
        }
        if self.probe_ask {
            self.probe_ask = false;
            let mut seg = Segment::new(self.conv, CMD_WASK);
            seg.wnd = self.rcv_wnd_avail();
            seg.una = self.rcv_nxt;
            let mut buf = Vec::new();
            seg.encode(&mut buf);
            output(&buf);
        }
        if self.probe_tell {
            self.probe_tell = false;
            let mut seg = Segment::new(self.conv, CMD_WINS);
            seg.wnd = self.rcv_wnd_avail();
            seg.una = self.rcv_nxt;
            let mut buf = Vec::new();
            seg.encode(&mut buf);
            output(&buf);
        }
    }

    fn flush_data(&mut self, output: &mut impl FnMut(&[u8])) {
        let cwnd = self.snd_wnd.min(self.rmt_wnd.max(1));
        while time_diff(self.snd_nxt, self.snd_una + cwnd) < 0 {
            let Some((data, frag)) = self.snd_queue.pop_front() else { break };
            self.snd_queue_bytes -= data.len();
            let sn = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            let mut seg = Segment::new(self.conv, CMD_PUSH);
            seg.sn = sn;
            seg.frag = frag;
            seg.data = data;
            seg.rto = self.rx_rto;
            seg.resend_ts = self.current;
            self.snd_buf.push_back(seg);
        }

        let rcv_wnd_avail = self.rcv_wnd_avail();
        let rcv_nxt = self.rcv_nxt;
        let mut to_send: Vec<Vec<u8>> = Vec::new();
        for seg in self.snd_buf.iter_mut() {
            let due = seg.xmit == 0 || time_diff(self.current, seg.resend_ts) >= 0 || seg.fast_ack >= FAST_RESEND_DUP_ACKS;
            if !due {
                continue;
            }
            if seg.xmit == 0 {
                seg.rto = self.rx_rto;
            } else if seg.fast_ack >= FAST_RESEND_DUP_ACKS {
                // fast retransmit: resend immediately, no RTO backoff.
                seg.fast_ack = 0;
            } else {
                // timeout retransmit, no-delay mode never backs off past 2x.
                seg.rto = (seg.rto * 2).min(seg.rto + seg.rto / 2).min(RTO_MAX);
            }
            seg.xmit += 1;
            seg.resend_ts = self.current + seg.rto;
            seg.ts = self.current;
            seg.una = rcv_nxt;
            seg.wnd = rcv_wnd_avail;
            let mut buf = Vec::with_capacity(HEADER_SIZE + seg.data.len());
            seg.encode(&mut buf);
            to_send.push(buf);
        }
        for buf in to_send {
            output(&buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(a: &mut KcpEngine, b: &mut KcpEngine, now: &mut u32, ticks: u32) {
        for _ in 0..ticks {
            *now += 10;
            let mut out_a = Vec::new();
            a.update(*now, |pkt| out_a.push(pkt.to_vec()));
            for pkt in out_a {
                b.input(&pkt);
            }
            let mut out_b = Vec::new();
            b.update(*now, |pkt| out_b.push(pkt.to_vec()));
            for pkt in out_b {
                a.input(&pkt);
            }
        }
    }

    #[test]
    fn reliable_delivery_round_trips_a_message() {
        let mut a = KcpEngine::new(CONV);
        let mut b = KcpEngine::new(CONV);
        a.send(b"hello reliable udp").unwrap();

        let mut now = 0u32;
        step(&mut a, &mut b, &mut now, 10);

        let mut buf = Vec::new();
        let n = b.recv(&mut buf).expect("message should have arrived");
        assert_eq!(&buf[..n], b"hello reliable udp");
    }

    #[test]
    fn large_message_is_fragmented_and_reassembled() {
        let mut a = KcpEngine::new(CONV);
        let mut b = KcpEngine::new(CONV);
        let payload = vec![0xABu8; MSS * 3 + 17];
        a.send(&payload).unwrap();

        let mut now = 0u32;
        step(&mut a, &mut b, &mut now, 30);

        let mut buf = Vec::new();
        let n = b.recv(&mut buf).expect("fragmented message should reassemble");
        assert_eq!(n, payload.len());
        assert_eq!(buf, payload);
    }

    #[test]
    fn send_beyond_cap_is_rejected() {
        let mut a = KcpEngine::new(CONV);
        assert!(a.send(&vec![0u8; SEND_QUEUE_BYTE_CAP]).is_ok());
        assert!(a.send(&vec![0u8; 1]).is_err());
    }

    #[test]
    fn mismatched_conv_is_ignored() {
        let mut a = KcpEngine::new(CONV);
        let mut foreign = KcpEngine::new(CONV.wrapping_add(1));
        foreign.send(b"not for you").unwrap();
        let mut now = 0u32;
        let mut out = Vec::new();
        foreign.update(10, |pkt| out.push(pkt.to_vec()));
        for pkt in &out {
            assert!(!a.input(pkt));
        }
        let _ = now;
        let mut buf = Vec::new();
        assert!(a.recv(&mut buf).is_none());
    }
}
