//! AES-128 key material and CMAC (RFC 4493).

use std::fmt;

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::rlc::encode_rlc;
use crate::core::{AES_BLOCK_SIZE, PRIVATE_KEY_SIZE};

const RB: u8 = 0x87;

/// A 128-bit private key together with its CMAC sub-keys.
///
/// All three keys are zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    key: [u8; PRIVATE_KEY_SIZE],
    k1: [u8; AES_BLOCK_SIZE],
    k2: [u8; AES_BLOCK_SIZE],
}

impl KeyMaterial {
    /// Wrap a private key, deriving sub-keys once.
    pub fn new(key: [u8; PRIVATE_KEY_SIZE]) -> Self {
        let (k1, k2) = derive_subkeys(&key);
        Self { key, k1, k2 }
    }

    /// The private key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.key
    }

    /// Sub-key for complete final blocks.
    pub fn k1(&self) -> &[u8; AES_BLOCK_SIZE] {
        &self.k1
    }

    /// Sub-key for padded final blocks.
    pub fn k2(&self) -> &[u8; AES_BLOCK_SIZE] {
        &self.k2
    }

    /// Encrypt a single block in place.
    pub(crate) fn encrypt_block(&self, block: &mut [u8; AES_BLOCK_SIZE]) {
        encrypt_block(&self.key, block);
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        // No early exit on the first differing byte.
        self.key
            .iter()
            .zip(other.key.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for KeyMaterial {}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

fn encrypt_block(key: &[u8; PRIVATE_KEY_SIZE], block: &mut [u8; AES_BLOCK_SIZE]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut ga);
    block.copy_from_slice(&ga);
}

fn shift_left(block: &[u8; AES_BLOCK_SIZE]) -> [u8; AES_BLOCK_SIZE] {
    let mut out = [0u8; AES_BLOCK_SIZE];
    let mut carry = 0u8;
    for i in (0..AES_BLOCK_SIZE).rev() {
        out[i] = (block[i] << 1) | carry;
        carry = block[i] >> 7;
    }
    out
}

fn double(block: &[u8; AES_BLOCK_SIZE]) -> [u8; AES_BLOCK_SIZE] {
    let mut out = shift_left(block);
    if block[0] & 0x80 != 0 {
        out[AES_BLOCK_SIZE - 1] ^= RB;
    }
    out
}

/// Derive the CMAC sub-keys `(K1, K2)` from a private key.
///
/// `L = AES(key, 0^128)`, `K1 = L << 1` and `K2 = K1 << 1`, each XORed with
/// `0x87` in the last byte when the shifted-out bit was set.
pub fn derive_subkeys(
    key: &[u8; PRIVATE_KEY_SIZE],
) -> ([u8; AES_BLOCK_SIZE], [u8; AES_BLOCK_SIZE]) {
    let mut l = [0u8; AES_BLOCK_SIZE];
    encrypt_block(key, &mut l);
    let k1 = double(&l);
    let k2 = double(&k1);
    l.zeroize();
    (k1, k2)
}

/// CMAC over an arbitrary message.
pub fn cmac_message(keys: &KeyMaterial, message: &[u8]) -> [u8; AES_BLOCK_SIZE] {
    let blocks = message.len().div_ceil(AES_BLOCK_SIZE).max(1);
    let complete = !message.is_empty() && message.len() % AES_BLOCK_SIZE == 0;

    let mut x = [0u8; AES_BLOCK_SIZE];
    for chunk in message.chunks(AES_BLOCK_SIZE).take(blocks - 1) {
        for (xb, mb) in x.iter_mut().zip(chunk) {
            *xb ^= mb;
        }
        keys.encrypt_block(&mut x);
    }

    let tail = &message[(blocks - 1) * AES_BLOCK_SIZE..];
    let mut last = [0u8; AES_BLOCK_SIZE];
    last[..tail.len()].copy_from_slice(tail);
    let subkey = if complete {
        keys.k1()
    } else {
        last[tail.len()] = 0x80;
        keys.k2()
    };
    for i in 0..AES_BLOCK_SIZE {
        x[i] ^= last[i] ^ subkey[i];
    }
    keys.encrypt_block(&mut x);
    x
}

/// CMAC over `[first_byte] ++ data ++ rlc`, the rolling counter serialized
/// MSB first to `rlc_size` bytes.
pub fn cmac(
    keys: &KeyMaterial,
    first_byte: Option<u8>,
    data: &[u8],
    rlc: u32,
    rlc_size: usize,
) -> [u8; AES_BLOCK_SIZE] {
    let mut message = Vec::with_capacity(1 + data.len() + rlc_size);
    message.extend(first_byte);
    message.extend_from_slice(data);
    message.extend_from_slice(&encode_rlc(rlc, rlc_size));
    cmac_message(keys, &message)
}

/// Telegram authentication tag: [`cmac`] truncated to `mac_size` bytes.
pub fn telegram_mac(
    keys: &KeyMaterial,
    first_byte: Option<u8>,
    data: &[u8],
    rlc: u32,
    rlc_size: usize,
    mac_size: usize,
) -> Vec<u8> {
    let full = cmac(keys, first_byte, data, rlc, rlc_size);
    full[..mac_size.min(AES_BLOCK_SIZE)].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rfc_key() -> KeyMaterial {
        let key: [u8; 16] = hex::decode("2b7e151628aed2a6abf7158809cf4f3c")
            .unwrap()
            .try_into()
            .unwrap();
        KeyMaterial::new(key)
    }

    #[test]
    fn test_rfc4493_subkeys() {
        let keys = rfc_key();
        assert_eq!(hex::encode(keys.k1()), "fbeed618357133667c85e08f7236a8de");
        assert_eq!(hex::encode(keys.k2()), "f7ddac306ae266ccf90bc11ee46d513b");
    }

    #[test]
    fn test_rfc4493_empty_message() {
        let tag = cmac_message(&rfc_key(), &[]);
        assert_eq!(hex::encode(tag), "bb1d6929e95937287fa37d129b756746");
    }

    #[test]
    fn test_rfc4493_one_block() {
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let tag = cmac_message(&rfc_key(), &msg);
        assert_eq!(hex::encode(tag), "070a16b46b4d4144f79bdd9dd04a287c");
    }

    #[test]
    fn test_rfc4493_forty_bytes() {
        let msg = hex::decode(
            "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e5130c81c46a35ce411",
        )
        .unwrap();
        let tag = cmac_message(&rfc_key(), &msg);
        assert_eq!(hex::encode(tag), "dfa66747de9ae63030ca32611497c827");
    }

    #[test]
    fn test_subkeys_deterministic() {
        let key = [0x42u8; 16];
        assert_eq!(derive_subkeys(&key), derive_subkeys(&key));

        let mut flipped = key;
        flipped[7] ^= 0x01;
        let (a1, a2) = derive_subkeys(&key);
        let (b1, b2) = derive_subkeys(&flipped);
        assert_ne!(a1, b1);
        assert_ne!(a2, b2);
    }

    #[test]
    fn test_cmac_mixes_rlc_and_first_byte() {
        let keys = rfc_key();
        let data = [0x01, 0x02, 0x03];
        let base = cmac(&keys, Some(0x30), &data, 5, 3);
        assert_ne!(base, cmac(&keys, Some(0x30), &data, 6, 3));
        assert_ne!(base, cmac(&keys, Some(0x31), &data, 5, 3));
        assert_ne!(base, cmac(&keys, None, &data, 5, 3));
        // Placement: first byte, data, then RLC MSB first.
        let explicit = cmac_message(&keys, &[0x30, 0x01, 0x02, 0x03, 0x00, 0x00, 0x05]);
        assert_eq!(base, explicit);
    }

    #[test]
    fn test_telegram_mac_truncates() {
        let keys = rfc_key();
        let full = cmac(&keys, Some(0x31), &[0xAA], 1, 4);
        let mac = telegram_mac(&keys, Some(0x31), &[0xAA], 1, 4, 3);
        assert_eq!(mac, full[..3].to_vec());
    }

    #[test]
    fn test_key_material_redacted_debug() {
        assert_eq!(format!("{:?}", rfc_key()), "KeyMaterial(..)");
        assert_eq!(rfc_key(), rfc_key());
    }
}
