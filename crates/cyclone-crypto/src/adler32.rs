/// The Adler-32 checksum's initial value (RFC 1950).
pub const INITIAL_ADLER: u32 = 1;

const MOD_ADLER: u32 = 65521;

/// Update a running Adler-32 checksum with `buf` and return the updated
/// value. Call with `INITIAL_ADLER` to start a fresh checksum.
///
/// Used by `RingBuffer::checksum` and by the file-transfer sample to
/// validate each fragment it receives.
pub fn adler32(adler: u32, buf: &[u8]) -> u32 {
    let mut a = adler & 0xffff;
    let mut b = (adler >> 16) & 0xffff;

    // Classic Adler-32: accumulate in chunks small enough that `b` cannot
    // overflow u32 before the next reduction mod 65521.
    for chunk in buf.chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }

    (b << 16) | a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_is_identity() {
        assert_eq!(adler32(INITIAL_ADLER, &[]), INITIAL_ADLER);
    }

    #[test]
    fn known_vector() {
        // RFC 1950 worked example.
        assert_eq!(adler32(INITIAL_ADLER, b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn splitting_input_does_not_change_result() {
        let whole = adler32(INITIAL_ADLER, b"Wikipedia");
        let split = adler32(adler32(INITIAL_ADLER, b"Wiki"), b"pedia");
        assert_eq!(whole, split);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let whole = adler32(INITIAL_ADLER, data);
        let mut running = INITIAL_ADLER;
        for byte in data {
            running = adler32(running, std::slice::from_ref(byte));
        }
        assert_eq!(whole, running);
    }
}
