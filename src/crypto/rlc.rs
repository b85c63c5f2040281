//! Security level format and rolling counter window.
//!
//! # Security Level Format byte
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! +-------+---+-------+-----------+
//! |  RLC  |TX |  MAC  |   DATA    |
//! +-------+---+-------+-----------+
//! ```
//!
//! - RLC: 0 none, 1 16-bit, 2 24-bit, 3 32-bit counter
//! - TX: counter transmitted in the telegram
//! - MAC: 0 none, 1 3-byte, 2 4-byte CMAC
//! - DATA: 0 plain, 3 VAES (4 AES-CBC is not supported)

use crate::core::CryptoError;

/// Payload encryption of a secure telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    /// Authenticated only.
    None,
    /// Counter-mode AES keyed with the rolling counter.
    Vaes,
}

/// Parsed security level format byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecurityLevelFormat(u8);

impl SecurityLevelFormat {
    /// Parse and validate a format byte.
    pub fn parse(byte: u8) -> Result<Self, CryptoError> {
        let slf = Self(byte);
        let mac_ok = matches!((byte >> 3) & 0x03, 1 | 2);
        let data_ok = matches!(byte & 0x07, 0 | 3);
        // A transmitted counter needs a counter width.
        let tx_ok = !slf.rlc_transmitted() || slf.rlc_size() > 0;
        if !(mac_ok && data_ok && tx_ok) {
            return Err(CryptoError::UnsupportedSecurityLevel(byte));
        }
        Ok(slf)
    }

    /// Raw byte.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Counter width in bytes (0, 2, 3 or 4).
    pub fn rlc_size(self) -> usize {
        match self.0 >> 6 {
            0 => 0,
            1 => 2,
            2 => 3,
            _ => 4,
        }
    }

    /// Whether the counter is carried in every telegram.
    pub fn rlc_transmitted(self) -> bool {
        self.0 & 0x20 != 0
    }

    /// Truncated MAC length in bytes.
    pub fn mac_size(self) -> usize {
        match (self.0 >> 3) & 0x03 {
            1 => 3,
            2 => 4,
            _ => 0,
        }
    }

    /// Payload encryption.
    pub fn encryption(self) -> Encryption {
        if self.0 & 0x07 == 3 {
            Encryption::Vaes
        } else {
            Encryption::None
        }
    }

    /// Mask reducing a counter to its configured width.
    pub fn rlc_mask(self) -> u32 {
        rlc_mask(self.rlc_size())
    }

    /// Bytes appended after the (encrypted) payload: counter if transmitted, then MAC.
    pub fn trailer_size(self) -> usize {
        let rlc = if self.rlc_transmitted() {
            self.rlc_size()
        } else {
            0
        };
        rlc + self.mac_size()
    }
}

/// Mask for a counter of `rlc_size` bytes.
pub fn rlc_mask(rlc_size: usize) -> u32 {
    match rlc_size {
        0 => 0,
        1..=3 => (1u32 << (8 * rlc_size)) - 1,
        _ => u32::MAX,
    }
}

/// Serialize the low `rlc_size` bytes of a counter, MSB first.
pub fn encode_rlc(rlc: u32, rlc_size: usize) -> Vec<u8> {
    let size = rlc_size.min(4);
    rlc.to_be_bytes()[4 - size..].to_vec()
}

/// Parse an MSB-first counter of up to four bytes.
pub fn decode_rlc(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

/// Forward-only acceptance window for rolling counters.
///
/// The stored counter is the value expected next. A candidate is accepted iff
/// its forward distance from the stored counter, taken modulo the counter
/// width, is below the window size. Unlike a datagram replay bitmap there is
/// no backward tolerance: a counter only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayWindow {
    size: u32,
    lookahead: u32,
}

impl ReplayWindow {
    /// Create a window. The look-ahead is clamped to the window size.
    pub fn new(size: u32, lookahead: u32) -> Self {
        let size = size.max(1);
        Self {
            size,
            lookahead: lookahead.clamp(1, size),
        }
    }

    /// Window size.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Counter values tried when the counter is not transmitted.
    pub fn lookahead(&self) -> u32 {
        self.lookahead
    }

    /// Forward distance from `stored` to `candidate` modulo the counter width.
    pub fn distance(stored: u32, candidate: u32, rlc_size: usize) -> u32 {
        candidate.wrapping_sub(stored) & rlc_mask(rlc_size)
    }

    /// Whether `candidate` may follow `stored`.
    pub fn accepts(&self, stored: u32, candidate: u32, rlc_size: usize) -> bool {
        Self::distance(stored, candidate, rlc_size) < self.size
    }

    /// Whether `candidate` lies in the forward half of the counter space
    /// seen from `stored`. Equal counters count as forward.
    pub fn is_forward(stored: u32, candidate: u32, rlc_size: usize) -> bool {
        Self::distance(stored, candidate, rlc_size) <= rlc_mask(rlc_size) / 2
    }

    /// Candidates for an implicit counter, nearest first.
    pub fn candidates(&self, stored: u32, rlc_size: usize) -> impl Iterator<Item = u32> {
        let mask = rlc_mask(rlc_size);
        let count = if rlc_size == 0 { 1 } else { self.lookahead };
        (0..count).map(move |d| stored.wrapping_add(d) & mask)
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(
            crate::core::DEFAULT_REPLAY_WINDOW,
            crate::core::DEFAULT_RLC_LOOKAHEAD,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slf_fields() {
        // 24-bit implicit counter, 3-byte MAC, VAES
        let slf = SecurityLevelFormat::parse(0x8B).unwrap();
        assert_eq!(slf.rlc_size(), 3);
        assert!(!slf.rlc_transmitted());
        assert_eq!(slf.mac_size(), 3);
        assert_eq!(slf.encryption(), Encryption::Vaes);
        assert_eq!(slf.trailer_size(), 3);

        // 32-bit transmitted counter, 4-byte MAC, VAES
        let slf = SecurityLevelFormat::parse(0xF3).unwrap();
        assert_eq!(slf.rlc_size(), 4);
        assert!(slf.rlc_transmitted());
        assert_eq!(slf.mac_size(), 4);
        assert_eq!(slf.trailer_size(), 8);
    }

    #[test]
    fn test_slf_rejects_unsupported() {
        // AES-CBC
        assert!(SecurityLevelFormat::parse(0x8C).is_err());
        // No MAC
        assert!(SecurityLevelFormat::parse(0x83).is_err());
        // Transmitted counter without width
        assert!(SecurityLevelFormat::parse(0x2B).is_err());
    }

    #[test]
    fn test_rlc_encoding() {
        assert_eq!(encode_rlc(0x0102_0304, 4), vec![1, 2, 3, 4]);
        assert_eq!(encode_rlc(0x0102_0304, 3), vec![2, 3, 4]);
        assert_eq!(encode_rlc(0x0102_0304, 2), vec![3, 4]);
        assert!(encode_rlc(0x0102_0304, 0).is_empty());
        assert_eq!(decode_rlc(&[2, 3, 4]), 0x0002_0304);
    }

    #[test]
    fn test_window_monotonicity() {
        let window = ReplayWindow::new(128, 32);
        let n = 1000u32;
        for d in 0..128 {
            assert!(window.accepts(n, n + d, 4), "d = {d}");
        }
        assert!(!window.accepts(n, n + 128, 4));
        assert!(!window.accepts(n, n - 1, 4));
        assert!(!window.accepts(n, n - 100, 4));
    }

    #[test]
    fn test_window_wraparound() {
        let window = ReplayWindow::new(128, 32);
        let n = u32::MAX - 10;
        assert!(window.accepts(n, 5, 4));
        assert!(window.accepts(n, n.wrapping_add(127), 4));
        assert!(!window.accepts(n, n.wrapping_add(128), 4));
        assert!(!window.accepts(5, n, 4));

        // 24-bit counters wrap at 2^24.
        let n = 0x00FF_FFF0;
        assert!(window.accepts(n, 0x0000_0010, 3));
        assert!(!window.accepts(0x0000_0010, n, 3));
    }

    #[test]
    fn test_is_forward() {
        assert!(ReplayWindow::is_forward(20, 20, 4));
        assert!(ReplayWindow::is_forward(20, 5000, 4));
        assert!(!ReplayWindow::is_forward(20, 0, 4));
        assert!(ReplayWindow::is_forward(0xFFF0, 0x0010, 2));
        assert!(!ReplayWindow::is_forward(0x0010, 0xFFF0, 2));
        assert!(ReplayWindow::is_forward(7, 3, 0));
    }

    #[test]
    fn test_candidates() {
        let window = ReplayWindow::new(128, 4);
        let c: Vec<u32> = window.candidates(0xFFFE, 2).collect();
        assert_eq!(c, vec![0xFFFE, 0xFFFF, 0x0000, 0x0001]);
        assert_eq!(window.candidates(7, 0).count(), 1);
        assert_eq!(ReplayWindow::new(16, 64).lookahead(), 16);
    }
}
