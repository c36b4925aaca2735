use crate::{error::PacketError, pipe::Pipe, ring_buffer::RingBuffer};

/// Minimum head size: 2 bytes payload length + 2 bytes packet id.
pub const MIN_HEAD_SIZE: usize = 4;
/// Frames at or below this size are stored inline; larger ones spill to the
/// heap. Matches spec.md §4.4's 1024-byte inline/heap threshold.
const INLINE_CAP: usize = 1024;

enum Storage {
    Inline { buf: [u8; INLINE_CAP], len: usize },
    Heap(Vec<u8>),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Inline { buf, len } => &buf[..*len],
            Storage::Heap(v) => v,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Storage::Inline { buf, len } => &mut buf[..*len],
            Storage::Heap(v) => v,
        }
    }

    fn with_len(total: usize) -> Storage {
        if total <= INLINE_CAP {
            Storage::Inline { buf: [0u8; INLINE_CAP], len: total }
        } else {
            Storage::Heap(vec![0u8; total])
        }
    }
}

/// Length-prefixed application frame.
///
/// Wire layout: `BE16(payload_len) || BE16(id) || <head_size-4 opaque bytes>
/// || payload`. `head_size` is fixed per connection/protocol (≥4) and is not
/// itself stored on the wire; it's a parsing parameter both peers agree on
/// out of band.
pub struct Packet {
    storage: Storage,
    head_size: usize,
}

impl Packet {
    /// Build a frame from two payload slices concatenated in order (mirrors
    /// the source's `buildFromMemory(headSize, id, payload1, payload2)`,
    /// used so callers can prepend a small fixed struct without an extra
    /// copy into a combined buffer first).
    pub fn build_from_memory(head_size: usize, id: u16, payload1: &[u8], payload2: &[u8]) -> Self {
        assert!(head_size >= MIN_HEAD_SIZE, "head_size must be at least {MIN_HEAD_SIZE}");
        let payload_len = payload1.len() + payload2.len();
        let total = head_size + payload_len;
        let mut storage = Storage::with_len(total);
        {
            let buf = storage.bytes_mut();
            buf[0..2].copy_from_slice(&(payload_len as u16).to_be_bytes());
            buf[2..4].copy_from_slice(&id.to_be_bytes());
            for b in &mut buf[4..head_size] {
                *b = 0;
            }
            buf[head_size..head_size + payload1.len()].copy_from_slice(payload1);
            buf[head_size + payload1.len()..total].copy_from_slice(payload2);
        }
        Packet { storage, head_size }
    }

    pub fn build(head_size: usize, id: u16, payload: &[u8]) -> Self {
        Self::build_from_memory(head_size, id, payload, &[])
    }

    /// Decode one frame out of `ring`, atomically: either the full
    /// `head_size + payload_len` bytes are consumed and `Some(packet)` is
    /// returned, or nothing is consumed and `None` comes back because the
    /// frame isn't fully buffered yet.
    pub fn build_from_ring_buffer(head_size: usize, ring: &mut RingBuffer) -> Result<Option<Self>, PacketError> {
        assert!(head_size >= MIN_HEAD_SIZE, "head_size must be at least {MIN_HEAD_SIZE}");
        if ring.len() < 2 {
            return Ok(None);
        }
        let mut len_buf = [0u8; 2];
        ring.peek(0, &mut len_buf);
        let payload_len = u16::from_be_bytes(len_buf) as usize;
        let total = head_size + payload_len;
        if ring.len() < total {
            return Ok(None);
        }

        let mut storage = Storage::with_len(total);
        let n = ring.peek(0, storage.bytes_mut());
        debug_assert_eq!(n, total);
        ring.discard(total);
        Ok(Some(Packet { storage, head_size }))
    }

    /// Decode one frame directly from a `Pipe`'s byte stream. Pipes have no
    /// peek, so unlike `build_from_ring_buffer` a short read here cannot be
    /// un-consumed: per spec.md §4.4 a short read is connection-fatal and
    /// reported as `PacketError::Framing` rather than `Incomplete`.
    pub fn build_from_pipe(head_size: usize, pipe: &Pipe) -> Result<Option<Self>, PacketError> {
        assert!(head_size >= MIN_HEAD_SIZE, "head_size must be at least {MIN_HEAD_SIZE}");
        let mut len_buf = [0u8; 2];
        let n = pipe.read(&mut len_buf).map_err(|_| PacketError::Framing)?;
        if n == 0 {
            return Ok(None);
        }
        if n < 2 {
            return Err(PacketError::Framing);
        }
        let payload_len = u16::from_be_bytes(len_buf) as usize;
        let total = head_size + payload_len;

        let mut storage = Storage::with_len(total);
        {
            let buf = storage.bytes_mut();
            buf[0..2].copy_from_slice(&len_buf);
            let mut read_so_far = 2usize;
            while read_so_far < total {
                let n = pipe.read(&mut buf[read_so_far..total]).map_err(|_| PacketError::Framing)?;
                if n == 0 {
                    return Err(PacketError::Framing);
                }
                read_so_far += n;
            }
        }
        Ok(Some(Packet { storage, head_size }))
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes(self.storage.bytes()[2..4].try_into().unwrap())
    }

    pub fn payload_size(&self) -> usize {
        self.storage.bytes().len() - self.head_size
    }

    pub fn payload(&self) -> &[u8] {
        &self.storage.bytes()[self.head_size..]
    }

    /// User-defined head bytes beyond the fixed 4-byte length+id header.
    pub fn user_head(&self) -> &[u8] {
        &self.storage.bytes()[4..self.head_size]
    }

    /// The whole frame as it appears on the wire, head included.
    pub fn raw_memory(&self) -> &[u8] {
        self.storage.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_from_memory_lays_out_wire_header() {
        let pkt = Packet::build(4, 42, b"hello");
        assert_eq!(pkt.id(), 42);
        assert_eq!(pkt.payload_size(), 5);
        assert_eq!(pkt.payload(), b"hello");
        assert_eq!(&pkt.raw_memory()[0..2], &5u16.to_be_bytes());
        assert_eq!(&pkt.raw_memory()[2..4], &42u16.to_be_bytes());
    }

    #[test]
    fn build_from_memory_concatenates_two_payloads() {
        let pkt = Packet::build_from_memory(4, 1, b"foo", b"bar");
        assert_eq!(pkt.payload(), b"foobar");
    }

    #[test]
    fn user_head_bytes_are_zeroed_by_default() {
        let pkt = Packet::build(8, 1, b"x");
        assert_eq!(pkt.user_head(), &[0u8; 4]);
    }

    #[test]
    fn uses_heap_storage_above_threshold() {
        let big = vec![7u8; INLINE_CAP];
        let pkt = Packet::build(4, 1, &big);
        assert!(matches!(pkt.storage, Storage::Heap(_)));
        assert_eq!(pkt.payload(), big.as_slice());
    }

    #[test]
    fn uses_inline_storage_at_or_below_threshold() {
        let small = vec![7u8; INLINE_CAP - 4];
        let pkt = Packet::build(4, 1, &small);
        assert!(matches!(pkt.storage, Storage::Inline { .. }));
    }

    #[test]
    fn build_from_ring_buffer_returns_none_when_incomplete() {
        let mut ring = RingBuffer::new();
        let built = Packet::build(4, 1, b"hello world");
        // Push all but the last byte.
        ring.push(&built.raw_memory()[..built.raw_memory().len() - 1]);
        let before = ring.len();
        let result = Packet::build_from_ring_buffer(4, &mut ring).unwrap();
        assert!(result.is_none());
        assert_eq!(ring.len(), before, "a partial frame must not be consumed");
    }

    #[test]
    fn build_from_ring_buffer_consumes_atomically_once_complete() {
        let mut ring = RingBuffer::new();
        let built = Packet::build(4, 7, b"hello world");
        ring.push(built.raw_memory());
        ring.push(b"trailing-garbage-for-next-frame");
        let decoded = Packet::build_from_ring_buffer(4, &mut ring).unwrap().unwrap();
        assert_eq!(decoded.id(), 7);
        assert_eq!(decoded.payload(), b"hello world");
        assert_eq!(ring.len(), "trailing-garbage-for-next-frame".len());
    }

    #[test]
    fn build_from_ring_buffer_handles_multiple_frames_back_to_back() {
        let mut ring = RingBuffer::new();
        let a = Packet::build(4, 1, b"aaa");
        let b = Packet::build(4, 2, b"bb");
        ring.push(a.raw_memory());
        ring.push(b.raw_memory());
        let first = Packet::build_from_ring_buffer(4, &mut ring).unwrap().unwrap();
        let second = Packet::build_from_ring_buffer(4, &mut ring).unwrap().unwrap();
        assert_eq!(first.payload(), b"aaa");
        assert_eq!(second.payload(), b"bb");
        assert!(ring.is_empty());
    }

    #[test]
    fn build_from_pipe_round_trips() {
        let pipe = Pipe::new().unwrap();
        let pkt = Packet::build(4, 9, b"ping");
        pipe.write(pkt.raw_memory()).unwrap();
        let decoded = Packet::build_from_pipe(4, &pipe).unwrap().unwrap();
        assert_eq!(decoded.id(), 9);
        assert_eq!(decoded.payload(), b"ping");
    }

    #[test]
    fn build_from_pipe_returns_none_when_nothing_written() {
        let pipe = Pipe::new().unwrap();
        assert!(Packet::build_from_pipe(4, &pipe).unwrap().is_none());
    }
}
