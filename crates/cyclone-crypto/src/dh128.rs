//! 128-bit Diffie-Hellman key exchange, used by the relay sample to agree
//! on an AES session key before any application data crosses the wire.
//!
//! The original implementation represents the modulus and intermediate
//! products with a hand-rolled `{low, high}` 128-bit struct because C++
//! has no native 128-bit integer type. Rust does (`u128`), so the exchange
//! is expressed directly in terms of it; the modular-exponentiation
//! algorithm (square-and-multiply, never materializing more than one
//! `u128` product at a time) is kept as-is.

use rand::RngCore;

/// P = 2^128 - 159, a prime chosen so P - 1 has a large prime factor.
pub const P: u128 = u128::MAX - 158;
/// Generator for the multiplicative group mod P.
pub const G: u128 = 5;

/// `(a * b) mod P` without overflowing: 128x128 multiplication would need
/// 256 bits, so this adds `a` to itself `b` times in a binary (double-and-
/// add) ladder instead, reducing mod P at every step.
fn mulmod_p(mut a: u128, mut b: u128) -> u128 {
    a %= P;
    let mut result: u128 = 0;
    while b > 0 {
        if b & 1 == 1 {
            result = add_mod_p(result, a);
        }
        a = add_mod_p(a, a);
        b >>= 1;
    }
    result
}

fn add_mod_p(a: u128, b: u128) -> u128 {
    // a, b < P, so a + b < 2P; a u128 add can overflow by at most P - 159.
    // 2^128 == 159 (mod P), so on overflow the true sum mod P is the
    // wrapped value plus 159, reduced once more if needed.
    let (sum, overflowed) = a.overflowing_add(b);
    let reduced = if overflowed { sum.wrapping_add(159) } else { sum };
    if reduced >= P { reduced - P } else { reduced }
}

/// `(base^exp) mod P` via recursive square-and-multiply, mirroring the
/// original's `_powmodp_r`.
fn powmod_p(base: u128, exp: u128) -> u128 {
    if exp == 0 {
        return 1;
    }
    let half = powmod_p(base, exp >> 1);
    let squared = mulmod_p(half, half);
    if exp & 1 == 1 {
        mulmod_p(squared, base)
    } else {
        squared
    }
}

/// One side's half of a Diffie-Hellman exchange: holds the private key
/// and exposes the public key to send to the peer.
pub struct DhKeyPair {
    private_key: u128,
    pub public_key: u128,
}

impl DhKeyPair {
    /// Generate a fresh keypair using the OS RNG for the private key.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        let private_key = u128::from_le_bytes(bytes) % (P - 2) + 1;
        DhKeyPair::from_private_key(private_key)
    }

    /// Build a keypair from an explicit private key; mainly useful for
    /// deterministic tests.
    pub fn from_private_key(private_key: u128) -> Self {
        let public_key = powmod_p(G, private_key);
        DhKeyPair { private_key, public_key }
    }

    /// Combine the peer's public key with our private key to produce the
    /// shared secret both sides converge on.
    pub fn shared_secret(&self, peer_public_key: u128) -> u128 {
        powmod_p(peer_public_key, self.private_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulmod_matches_naive_reduction_for_small_values() {
        assert_eq!(mulmod_p(3, 4), 12);
        assert_eq!(mulmod_p(0, 1234), 0);
    }

    #[test]
    fn powmod_identity() {
        assert_eq!(powmod_p(G, 0), 1);
        assert_eq!(powmod_p(G, 1), G);
    }

    #[test]
    fn both_sides_agree_on_shared_secret() {
        let alice = DhKeyPair::from_private_key(12345);
        let bob = DhKeyPair::from_private_key(67890);

        let alice_secret = alice.shared_secret(bob.public_key);
        let bob_secret = bob.shared_secret(alice.public_key);

        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn generated_keypairs_agree() {
        let alice = DhKeyPair::generate();
        let bob = DhKeyPair::generate();
        assert_eq!(alice.shared_secret(bob.public_key), bob.shared_secret(alice.public_key));
    }
}
