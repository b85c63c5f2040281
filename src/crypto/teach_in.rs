//! Secure teach-in segments.
//!
//! Each SEC_TI telegram carries `[TEACH_IN_INFO][body part]`. The body parts
//! of all segments concatenate to `[SLF][RLC (rlc_size)][KEY (16)]`.
//!
//! TEACH_IN_INFO:
//! ```text
//!  7   6   5   4   3   2   1   0
//! +-------+-------+---+---+-------+
//! |  IDX  |  CNT  |PSK|TYP| INFO  |
//! +-------+-------+---+---+-------+
//! ```

use rand::{RngCore, rngs::OsRng};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::rlc::{SecurityLevelFormat, decode_rlc, encode_rlc};
use crate::core::{
    Address, CryptoError, MAX_TEACH_IN_SEGMENTS, PRIVATE_KEY_SIZE, TEACH_IN_FIRST_SEGMENT_BODY,
};
use crate::radio::Rorg;
use crate::transport::Packet;

/// Decoded TEACH_IN_INFO byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureTeachInInfo(pub u8);

impl SecureTeachInInfo {
    /// Build an info byte.
    pub fn new(index: u8, count: u8, ptm: bool, info: u8) -> Self {
        Self(((index & 0x03) << 6) | ((count & 0x03) << 4) | ((ptm as u8) << 2) | (info & 0x03))
    }

    /// Segment index.
    pub fn index(self) -> u8 {
        self.0 >> 6
    }

    /// Total segment count (0 is read as 1).
    pub fn count(self) -> u8 {
        ((self.0 >> 4) & 0x03).max(1)
    }

    /// Protected by a pre-shared key.
    pub fn psk(self) -> bool {
        self.0 & 0x08 != 0
    }

    /// Sent by a push-button module.
    pub fn is_ptm(self) -> bool {
        self.0 & 0x04 != 0
    }

    /// Two INFO bits (button layout for PTM, flags otherwise).
    pub fn info(self) -> u8 {
        self.0 & 0x03
    }

    /// The device expects a teach-in response.
    pub fn is_bidirectional(self) -> bool {
        !self.is_ptm() && self.0 & 0x01 != 0
    }

    /// Copy with the segment fields cleared.
    pub fn without_segment(self) -> Self {
        Self(self.0 & 0x0F)
    }
}

/// One received teach-in segment.
#[derive(Debug, Clone, Copy)]
pub struct TeachInSegment<'a> {
    /// Info byte of this segment.
    pub info: SecureTeachInInfo,
    /// Body bytes after the info byte.
    pub body: &'a [u8],
}

impl<'a> TeachInSegment<'a> {
    /// Split a SEC_TI telegram into info byte and body part.
    pub fn parse(packet: &'a Packet) -> Result<Self, CryptoError> {
        if packet.rorg() != Rorg::SecTi {
            return Err(CryptoError::NotSecure(packet.rorg().as_byte()));
        }
        let user = packet.radio_user_data();
        let Some((&info, body)) = user.split_first() else {
            return Err(CryptoError::TeachInMalformed("empty segment"));
        };
        Ok(Self {
            info: SecureTeachInInfo(info),
            body,
        })
    }
}

/// A completely assembled teach-in.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TeachInBody {
    #[zeroize(skip)]
    info: SecureTeachInInfo,
    #[zeroize(skip)]
    slf: SecurityLevelFormat,
    rlc: u32,
    key: [u8; PRIVATE_KEY_SIZE],
}

impl TeachInBody {
    /// Parse `[SLF][RLC][KEY]`.
    pub fn parse(info: SecureTeachInInfo, body: &[u8]) -> Result<Self, CryptoError> {
        let Some((&slf, rest)) = body.split_first() else {
            return Err(CryptoError::TeachInMalformed("missing security level format"));
        };
        let slf = SecurityLevelFormat::parse(slf)?;
        let rlc_size = slf.rlc_size();
        if rest.len() < rlc_size + PRIVATE_KEY_SIZE {
            return Err(CryptoError::TooShort {
                expected: 1 + rlc_size + PRIVATE_KEY_SIZE,
                actual: body.len(),
            });
        }
        let rlc = decode_rlc(&rest[..rlc_size]);
        let mut key = [0u8; PRIVATE_KEY_SIZE];
        key.copy_from_slice(&rest[rlc_size..rlc_size + PRIVATE_KEY_SIZE]);
        Ok(Self {
            info: info.without_segment(),
            slf,
            rlc,
            key,
        })
    }

    /// Info byte (segment fields cleared).
    pub fn info(&self) -> SecureTeachInInfo {
        self.info
    }

    /// Security level format.
    pub fn slf(&self) -> SecurityLevelFormat {
        self.slf
    }

    /// Initial rolling counter.
    pub fn rlc(&self) -> u32 {
        self.rlc
    }

    /// Private key.
    pub fn key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.key
    }
}

/// Accumulates segments of one teach-in.
#[derive(Debug, Default)]
pub struct TeachInAssembly {
    expected: u8,
    count: u8,
    info: u8,
    body: Vec<u8>,
}

impl TeachInAssembly {
    /// Whether a teach-in is partially received.
    pub fn is_pending(&self) -> bool {
        !self.body.is_empty()
    }

    /// Drop partial state.
    pub fn reset(&mut self) {
        self.body.zeroize();
        self.body.clear();
        self.expected = 0;
        self.count = 0;
    }

    /// Add a segment. Returns the body once the last segment arrived.
    ///
    /// Segment 0 always restarts the assembly; any other out-of-order
    /// segment discards what was collected.
    pub fn push(
        &mut self,
        segment: TeachInSegment<'_>,
    ) -> Result<Option<TeachInBody>, CryptoError> {
        let info = segment.info;
        if info.psk() {
            self.reset();
            return Err(CryptoError::PskNotSupported);
        }
        if info.count() > MAX_TEACH_IN_SEGMENTS {
            self.reset();
            return Err(CryptoError::TeachInMalformed("too many segments"));
        }
        if info.index() == 0 {
            self.reset();
            self.count = info.count();
            self.info = info.0;
        } else if !self.is_pending() || info.index() != self.expected {
            let expected = self.expected;
            self.reset();
            return Err(CryptoError::TeachInOutOfOrder {
                expected,
                got: info.index(),
            });
        }
        self.body.extend_from_slice(segment.body);
        self.expected = info.index() + 1;
        if self.expected < self.count {
            return Ok(None);
        }
        let result = TeachInBody::parse(SecureTeachInInfo(self.info), &self.body);
        self.reset();
        result.map(Some)
    }
}

/// Build the SEC_TI telegrams announcing `slf`, `rlc` and `key`.
///
/// The body is split after [`TEACH_IN_FIRST_SEGMENT_BODY`] bytes when it
/// does not fit one segment.
pub fn build_teach_in(
    info: SecureTeachInInfo,
    slf: SecurityLevelFormat,
    rlc: u32,
    key: &[u8; PRIVATE_KEY_SIZE],
    sender: Address,
    destination: Address,
) -> Vec<Packet> {
    let mut body = Vec::with_capacity(1 + 4 + PRIVATE_KEY_SIZE);
    body.push(slf.as_byte());
    body.extend_from_slice(&encode_rlc(rlc, slf.rlc_size()));
    body.extend_from_slice(key);

    let parts: Vec<&[u8]> = if body.len() > TEACH_IN_FIRST_SEGMENT_BODY {
        let (first, second) = body.split_at(TEACH_IN_FIRST_SEGMENT_BODY);
        vec![first, second]
    } else {
        vec![&body[..]]
    };
    let count = parts.len() as u8;
    let packets = parts
        .iter()
        .enumerate()
        .map(|(index, part)| {
            let byte = SecureTeachInInfo::new(index as u8, count, info.is_ptm(), info.info());
            let mut packet = Packet::radio(Rorg::SecTi, 1 + part.len());
            let user = packet.radio_user_data_mut();
            user[0] = byte.0;
            user[1..].copy_from_slice(part);
            packet.set_sender(sender);
            packet.set_destination(destination);
            packet.finalize(false);
            packet
        })
        .collect();
    body.zeroize();
    packets
}

/// Fresh random outbound key and counter for a teach-in response.
pub(crate) fn random_key_and_rlc(slf: SecurityLevelFormat) -> ([u8; PRIVATE_KEY_SIZE], u32) {
    let mut key = [0u8; PRIVATE_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    let rlc = OsRng.next_u32() & slf.rlc_mask();
    (key, rlc)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
        0xFF,
    ];

    fn slf() -> SecurityLevelFormat {
        SecurityLevelFormat::parse(0xF3).unwrap()
    }

    #[test]
    fn test_info_byte_fields() {
        let info = SecureTeachInInfo(0b0110_0101);
        assert_eq!(info.index(), 1);
        assert_eq!(info.count(), 2);
        assert!(!info.psk());
        assert!(info.is_ptm());
        assert!(!info.is_bidirectional());
        assert_eq!(SecureTeachInInfo(0x01).count(), 1);
        assert!(SecureTeachInInfo(0x01).is_bidirectional());
    }

    #[test]
    fn test_build_and_assemble() {
        let info = SecureTeachInInfo::new(0, 0, false, 0x01);
        let packets = build_teach_in(info, slf(), 0x1234_5678, &KEY, Address(1), Address(2));
        assert_eq!(packets.len(), 2);
        // info + first ten body bytes
        assert_eq!(packets[0].radio_user_data().len(), 11);
        assert_eq!(packets[0].radio_user_data()[0], 0x21);
        assert_eq!(packets[1].radio_user_data()[0], 0x61);
        assert_eq!(packets[1].destination(), Address(2));

        let mut assembly = TeachInAssembly::default();
        let first = TeachInSegment::parse(&packets[0]).unwrap();
        assert!(assembly.push(first).unwrap().is_none());
        assert!(assembly.is_pending());
        let second = TeachInSegment::parse(&packets[1]).unwrap();
        let body = assembly.push(second).unwrap().unwrap();
        assert_eq!(body.slf(), slf());
        assert_eq!(body.rlc(), 0x1234_5678);
        assert_eq!(body.key(), &KEY);
        assert!(body.info().is_bidirectional());
        assert!(!assembly.is_pending());
    }

    #[test]
    fn test_out_of_order_restarts() {
        let info = SecureTeachInInfo::new(0, 0, false, 0);
        let packets = build_teach_in(info, slf(), 1, &KEY, Address(1), Address(2));
        let mut assembly = TeachInAssembly::default();

        let second = TeachInSegment::parse(&packets[1]).unwrap();
        assert_eq!(
            assembly.push(second).err(),
            Some(CryptoError::TeachInOutOfOrder {
                expected: 0,
                got: 1
            })
        );
        assert!(!assembly.is_pending());

        // A repeated first segment restarts cleanly.
        let first = TeachInSegment::parse(&packets[0]).unwrap();
        assert!(assembly.push(first).unwrap().is_none());
        assert!(assembly.push(first).unwrap().is_none());
        assert!(assembly.push(second).unwrap().is_some());
    }

    #[test]
    fn test_psk_rejected() {
        let mut packet = Packet::radio(Rorg::SecTi, 2);
        packet.set_radio_user_data(&[0x08, 0x00]);
        let segment = TeachInSegment::parse(&packet).unwrap();
        let mut assembly = TeachInAssembly::default();
        assert_eq!(assembly.push(segment).err(), Some(CryptoError::PskNotSupported));
    }

    #[test]
    fn test_short_body_rejected() {
        let mut packet = Packet::radio(Rorg::SecTi, 4);
        packet.set_radio_user_data(&[0x00, 0xF3, 0x00, 0x01]);
        let segment = TeachInSegment::parse(&packet).unwrap();
        let mut assembly = TeachInAssembly::default();
        assert!(matches!(
            assembly.push(segment),
            Err(CryptoError::TooShort { .. })
        ));
    }

    #[test]
    fn test_random_key_masked() {
        let slf = SecurityLevelFormat::parse(0x4B).unwrap();
        let (a, rlc) = random_key_and_rlc(slf);
        let (b, _) = random_key_and_rlc(slf);
        assert_ne!(a, b);
        assert!(rlc <= 0xFFFF);
    }
}
