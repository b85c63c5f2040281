//! VAES counter-mode cipher.
//!
//! Keystream block `i` is `AES(key, VAES_PUBLIC_KEY ^ (rlc + i))`, the counter
//! serialized MSB first into the leading `rlc_size` bytes of the block. The
//! keystream is XORed onto the data, so the same call encrypts and decrypts.

use super::cmac::KeyMaterial;
use super::rlc::{encode_rlc, rlc_mask};
use crate::core::{AES_BLOCK_SIZE, VAES_PUBLIC_KEY};

/// Apply the VAES keystream to `data` in place.
pub fn vaes_apply(keys: &KeyMaterial, rlc: u32, rlc_size: usize, data: &mut [u8]) {
    let mask = rlc_mask(rlc_size);
    for (i, chunk) in data.chunks_mut(AES_BLOCK_SIZE).enumerate() {
        let counter = rlc.wrapping_add(i as u32) & mask;
        let mut block = VAES_PUBLIC_KEY;
        for (b, c) in block.iter_mut().zip(encode_rlc(counter, rlc_size)) {
            *b ^= c;
        }
        keys.encrypt_block(&mut block);
        for (d, k) in chunk.iter_mut().zip(block.iter()) {
            *d ^= k;
        }
    }
}
