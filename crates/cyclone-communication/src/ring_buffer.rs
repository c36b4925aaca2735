use std::io::{self, Read, Write};

const DEFAULT_CAPACITY: usize = 1023;
const SCRATCH_SIZE: usize = 64 * 1024;

/// A growable byte ring buffer backing each TCP connection's read and write
/// sides.
///
/// Capacity is always `2^n - 1`; `push` never fails, growing the backing
/// store (doubling) instead. Shrinking is not supported: a connection that
/// briefly needed a large buffer keeps it for its lifetime.
pub struct RingBuffer {
    data: Vec<u8>,
    start: usize,
    len: usize,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(min_capacity: usize) -> Self {
        let storage = (min_capacity + 1).next_power_of_two().max(2);
        RingBuffer { data: vec![0; storage], start: 0, len: 0 }
    }

    /// Usable capacity: always one less than the backing storage so full
    /// and empty states remain distinguishable without a separate flag.
    pub fn capacity(&self) -> usize {
        self.data.len() - 1
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn free_size(&self) -> usize {
        self.capacity() - self.len
    }

    fn index(&self, offset: usize) -> usize {
        (self.start + offset) % self.data.len()
    }

    /// Grow the backing store to hold at least `min_capacity` usable bytes,
    /// linearising existing content into the new buffer starting at index 0.
    pub fn resize(&mut self, min_capacity: usize) {
        if min_capacity <= self.capacity() {
            return;
        }
        let storage = (min_capacity + 1).next_power_of_two();
        let mut new_data = vec![0u8; storage];
        for i in 0..self.len {
            new_data[i] = self.data[self.index(i)];
        }
        self.data = new_data;
        self.start = 0;
    }

    /// Append `bytes`, growing the buffer first if there isn't enough free
    /// space. Never fails.
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.len() > self.free_size() {
            self.resize(self.len + bytes.len());
        }
        for &b in bytes {
            let idx = self.index(self.len);
            self.data[idx] = b;
            self.len += 1;
        }
    }

    /// Copy up to `dst.len()` bytes out of the buffer (consuming them) and
    /// return how many were copied.
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(0, dst);
        self.discard(n);
        n
    }

    /// Read-only lookahead starting `offset` bytes past the current front;
    /// does not advance cursors.
    pub fn peek(&self, offset: usize, dst: &mut [u8]) -> usize {
        let available = self.len.saturating_sub(offset);
        let n = dst.len().min(available);
        for i in 0..n {
            dst[i] = self.data[self.index(offset + i)];
        }
        n
    }

    /// Drop up to `n` bytes from the front without copying them anywhere.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.len);
        self.start = self.index(n);
        self.len -= n;
    }

    /// Move up to `n` bytes from `self` into `other`, consuming them from
    /// `self`. `other` grows as needed since its `push` never fails.
    pub fn move_to(&mut self, other: &mut RingBuffer, n: usize) -> usize {
        let n = n.min(self.len);
        let mut scratch = vec![0u8; n];
        let copied = self.peek(0, &mut scratch);
        other.push(&scratch[..copied]);
        self.discard(copied);
        copied
    }

    /// Scan forward from `offset` for the first occurrence of `byte`,
    /// returning its offset from the current front (not from `offset`).
    pub fn search(&self, offset: usize, byte: u8) -> Option<usize> {
        (offset..self.len).find(|&i| self.data[self.index(i)] == byte)
    }

    /// Adler-32 checksum of the `n` bytes starting `offset` bytes past the
    /// front, without consuming anything.
    pub fn checksum(&self, offset: usize, n: usize) -> u32 {
        let n = n.min(self.len.saturating_sub(offset));
        let mut adler = cyclone_crypto::INITIAL_ADLER;
        // Feed in at most two contiguous runs (the buffer wraps at most once).
        let first_len = (self.data.len() - self.index(offset)).min(n);
        let start_idx = self.index(offset);
        adler = cyclone_crypto::adler32(adler, &self.data[start_idx..start_idx + first_len]);
        if first_len < n {
            adler = cyclone_crypto::adler32(adler, &self.data[0..n - first_len]);
        }
        adler
    }

    /// Linearise the buffer in place (rotate so the front sits at index 0)
    /// and return a contiguous slice over all valid bytes.
    pub fn normalize(&mut self) -> &[u8] {
        if self.start != 0 {
            self.data.rotate_left(self.start);
            self.start = 0;
        }
        &self.data[..self.len]
    }

    /// Drop all buffered bytes without releasing the backing storage.
    pub fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// Read from `source` until it reports `WouldBlock` or EOF, appending
    /// everything read. Returns `Ok(0)` only when the peer has closed the
    /// connection (matching the `SocketReadReturnedZero` contract the TCP
    /// connection state machine dispatches on); a positive return means at
    /// least one byte arrived even if the peer later closes mid-drain.
    pub fn read_from_socket<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        let mut total = 0usize;
        let mut scratch = [0u8; SCRATCH_SIZE];
        loop {
            match source.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    self.push(&scratch[..n]);
                    total += n;
                    if n < scratch.len() {
                        return Ok(total);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Write buffered bytes to `sink` until the buffer empties or the
    /// kernel reports `WouldBlock`. Returns the number of bytes written.
    pub fn write_to_socket<W: Write>(&mut self, sink: &mut W) -> io::Result<usize> {
        let mut total = 0usize;
        while !self.is_empty() {
            let mut scratch = vec![0u8; self.len.min(SCRATCH_SIZE)];
            let n = self.peek(0, &mut scratch);
            match sink.write(&scratch[..n]) {
                Ok(0) => break,
                Ok(written) => {
                    self.discard(written);
                    total += written;
                    if written < n {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trips() {
        let mut rb = RingBuffer::new();
        rb.push(b"hello world");
        let mut out = [0u8; 11];
        assert_eq!(rb.pop(&mut out), 11);
        assert_eq!(&out, b"hello world");
        assert!(rb.is_empty());
    }

    #[test]
    fn push_grows_past_default_capacity() {
        let mut rb = RingBuffer::new();
        let big = vec![7u8; DEFAULT_CAPACITY * 3];
        rb.push(&big);
        assert_eq!(rb.len(), big.len());
        assert!(rb.capacity() >= big.len());
        let mut out = vec![0u8; big.len()];
        rb.pop(&mut out);
        assert_eq!(out, big);
    }

    #[test]
    fn wraps_around_correctly() {
        let mut rb = RingBuffer::with_capacity(15);
        rb.push(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let mut out = [0u8; 5];
        rb.pop(&mut out);
        assert_eq!(out, [1, 2, 3, 4, 5]);
        // front cursor has wrapped partway; pushing again crosses the seam
        rb.push(&[11, 12, 13, 14, 15]);
        let mut rest = vec![0u8; rb.len()];
        rb.pop(&mut rest);
        assert_eq!(rest, vec![6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut rb = RingBuffer::new();
        rb.push(b"abcdef");
        let mut out = [0u8; 3];
        assert_eq!(rb.peek(1, &mut out), 3);
        assert_eq!(&out, b"bcd");
        assert_eq!(rb.len(), 6);
    }

    #[test]
    fn search_finds_delimiter() {
        let mut rb = RingBuffer::new();
        rb.push(b"abc\nxyz");
        assert_eq!(rb.search(0, b'\n'), Some(3));
        assert_eq!(rb.search(4, b'\n'), None);
    }

    #[test]
    fn discard_drops_front_bytes() {
        let mut rb = RingBuffer::new();
        rb.push(b"abcdef");
        rb.discard(2);
        let mut out = [0u8; 4];
        rb.pop(&mut out);
        assert_eq!(&out, b"cdef");
    }

    #[test]
    fn move_to_transfers_bytes_between_buffers() {
        let mut src = RingBuffer::new();
        let mut dst = RingBuffer::new();
        src.push(b"abcdefgh");
        let moved = src.move_to(&mut dst, 4);
        assert_eq!(moved, 4);
        assert_eq!(src.len(), 4);
        assert_eq!(dst.len(), 4);
        let mut out = [0u8; 4];
        dst.pop(&mut out);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn checksum_matches_direct_adler32_over_wrap() {
        let mut rb = RingBuffer::with_capacity(15);
        rb.push(&[0u8; 12]);
        rb.discard(12);
        rb.push(b"wrap-around-data");
        let direct = cyclone_crypto::adler32(cyclone_crypto::INITIAL_ADLER, b"wrap-around-data");
        assert_eq!(rb.checksum(0, rb.len()), direct);
    }

    #[test]
    fn normalize_exposes_contiguous_slice() {
        let mut rb = RingBuffer::with_capacity(7);
        rb.push(&[1, 2, 3, 4]);
        rb.discard(2);
        rb.push(&[5, 6]);
        assert_eq!(rb.normalize(), &[3, 4, 5, 6]);
    }

    #[test]
    fn reset_clears_without_freeing_storage() {
        let mut rb = RingBuffer::new();
        rb.push(b"data");
        let cap_before = rb.capacity();
        rb.reset();
        assert!(rb.is_empty());
        assert_eq!(rb.capacity(), cap_before);
    }

    #[test]
    fn read_from_socket_drains_until_would_block() {
        struct Scripted {
            chunks: Vec<io::Result<Vec<u8>>>,
        }
        impl Read for Scripted {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.chunks.is_empty() {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                match self.chunks.remove(0) {
                    Ok(data) => {
                        buf[..data.len()].copy_from_slice(&data);
                        Ok(data.len())
                    }
                    Err(e) => Err(e),
                }
            }
        }

        let mut source = Scripted { chunks: vec![Ok(b"hello".to_vec()), Ok(b" world".to_vec())] };
        let mut rb = RingBuffer::new();
        let n = rb.read_from_socket(&mut source).unwrap();
        assert_eq!(n, 11);
        let mut out = vec![0u8; 11];
        rb.pop(&mut out);
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn read_from_socket_reports_eof_as_zero() {
        struct Closed;
        impl Read for Closed {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        let mut rb = RingBuffer::new();
        assert_eq!(rb.read_from_socket(&mut Closed).unwrap(), 0);
    }
}
