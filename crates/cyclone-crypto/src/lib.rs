mod adler32;
mod aes128cbc;
mod dh128;
mod xorshift128;

pub use adler32::{INITIAL_ADLER, adler32};
pub use aes128cbc::{Aes128Key, BLOCK_SIZE, decrypt, encrypt};
pub use dh128::{DhKeyPair, G, P};
pub use xorshift128::XorShift128;
