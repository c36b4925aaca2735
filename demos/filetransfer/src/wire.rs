//! File-transfer sample's own framing (spec.md §6: `headSize=0, manual
//! header in payload`). The generic `cyclone_communication::Packet` header
//! requires a 4-byte minimum (2-byte length + 2-byte id), so a protocol
//! that wants a bare length prefix with its own single-byte message tag
//! rolls its own tiny codec directly against `RingBuffer` instead.
//!
//! Wire layout: `BE32(id_and_payload_len) || u8(id) || payload`.

use cyclone_communication::RingBuffer;

pub const REQUIRE_FILE_INFO: u8 = 0;
pub const REPLY_FILE_INFO: u8 = 1;
pub const REQUIRE_FILE_FRAGMENT: u8 = 2;
pub const REPLY_FILE_FRAGMENT: u8 = 3;

pub fn encode(id: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u32;
    let mut frame = Vec::with_capacity(4 + payload.len() + 1);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(id);
    frame.extend_from_slice(payload);
    frame
}

/// Pull one frame off `ring`, atomically, mirroring
/// `Packet::build_from_ring_buffer`'s all-or-nothing contract.
pub fn decode(ring: &mut RingBuffer) -> Option<(u8, Vec<u8>)> {
    if ring.len() < 4 {
        return None;
    }
    let mut len_buf = [0u8; 4];
    ring.peek(0, &mut len_buf);
    let len = u32::from_be_bytes(len_buf) as usize;
    if ring.len() < 4 + len {
        return None;
    }
    let mut body = vec![0u8; len];
    ring.peek(4, &mut body);
    ring.discard(4 + len);
    let id = body[0];
    let payload = body[1..].to_vec();
    Some((id, payload))
}

pub struct ReplyFileInfo {
    pub file_size: u64,
    pub thread_counts: i32,
    pub name: String,
}

impl ReplyFileInfo {
    pub fn encode(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let mut payload = Vec::with_capacity(16 + name_bytes.len());
        payload.extend_from_slice(&self.file_size.to_be_bytes());
        payload.extend_from_slice(&self.thread_counts.to_be_bytes());
        payload.extend_from_slice(&(name_bytes.len() as i32).to_be_bytes());
        payload.extend_from_slice(name_bytes);
        payload
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 16 {
            return None;
        }
        let file_size = u64::from_be_bytes(payload[0..8].try_into().ok()?);
        let thread_counts = i32::from_be_bytes(payload[8..12].try_into().ok()?);
        let name_len = i32::from_be_bytes(payload[12..16].try_into().ok()?) as usize;
        let name = String::from_utf8_lossy(payload.get(16..16 + name_len)?).into_owned();
        Some(ReplyFileInfo { file_size, thread_counts, name })
    }
}

pub struct RequireFileFragment {
    pub offset: u64,
    pub size: i32,
}

impl RequireFileFragment {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&self.offset.to_be_bytes());
        payload.extend_from_slice(&self.size.to_be_bytes());
        payload
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() != 12 {
            return None;
        }
        let offset = u64::from_be_bytes(payload[0..8].try_into().ok()?);
        let size = i32::from_be_bytes(payload[8..12].try_into().ok()?);
        Some(RequireFileFragment { offset, size })
    }
}

pub struct ReplyFileFragment {
    pub offset: u64,
    pub bytes: Vec<u8>,
    pub crc32: u32,
}

impl ReplyFileFragment {
    pub fn encode(offset: u64, bytes: &[u8]) -> Vec<u8> {
        let crc = cyclone_crypto::adler32(cyclone_crypto::INITIAL_ADLER, bytes);
        let mut payload = Vec::with_capacity(16 + bytes.len());
        payload.extend_from_slice(&offset.to_be_bytes());
        payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
        payload.extend_from_slice(bytes);
        payload.extend_from_slice(&crc.to_be_bytes());
        payload
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 16 {
            return None;
        }
        let offset = u64::from_be_bytes(payload[0..8].try_into().ok()?);
        let size = i32::from_be_bytes(payload[8..12].try_into().ok()?) as usize;
        let bytes = payload.get(12..12 + size)?.to_vec();
        let crc32 = u32::from_be_bytes(payload.get(12 + size..16 + size)?.try_into().ok()?);
        Some(ReplyFileFragment { offset, bytes, crc32 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_ring_buffer() {
        let mut ring = RingBuffer::new();
        ring.push(&encode(REQUIRE_FILE_INFO, &[]));
        ring.push(&encode(REPLY_FILE_FRAGMENT, b"abc"));
        let (id1, p1) = decode(&mut ring).unwrap();
        assert_eq!(id1, REQUIRE_FILE_INFO);
        assert!(p1.is_empty());
        let (id2, p2) = decode(&mut ring).unwrap();
        assert_eq!(id2, REPLY_FILE_FRAGMENT);
        assert_eq!(p2, b"abc");
        assert!(ring.is_empty());
    }

    #[test]
    fn reply_file_fragment_crc_validates() {
        let bytes = b"the quick brown fox";
        let encoded = ReplyFileFragment::encode(0, bytes);
        let fragment = ReplyFileFragment::decode(&encoded).unwrap();
        assert_eq!(fragment.bytes, bytes);
        assert_eq!(fragment.crc32, cyclone_crypto::adler32(cyclone_crypto::INITIAL_ADLER, bytes));
    }
}
