//! ESP3 packet framing and building.
//!
//! Wire format:
//! ```text
//! +------+--------+--------+--------+------+-------+------+---------+-------+
//! | Sync | Len Hi | Len Lo | OptLen | Type | CRC8H | Data | OptData | CRC8D |
//! | 0x55 | 1 byte | 1 byte | 1 byte | 1    | 1     | n    | m       | 1     |
//! +------+--------+--------+--------+------+-------+------+---------+-------+
//! ```
//!
//! A [`Packet`] is filled either byte-by-byte through [`Packet::accept`] or
//! field-by-field by a builder followed by [`Packet::finalize`].

use std::mem;

use tracing::{debug, trace};

use super::crc8::crc8;
use crate::core::{
    ESP3_HEADER_SIZE, ESP3_SYNC, FrameError, MAX_PAYLOAD_SIZE, PACKET_TYPE_COMMON_COMMAND,
    PACKET_TYPE_EVENT, PACKET_TYPE_RADIO_ERP1, PACKET_TYPE_RADIO_ERP2,
    PACKET_TYPE_RADIO_MESSAGE, PACKET_TYPE_RADIO_SUB_TEL, PACKET_TYPE_REMOTE_MAN_COMMAND,
    PACKET_TYPE_RESPONSE, PACKET_TYPE_SMART_ACK_COMMAND,
};

/// ESP3 packet type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// ERP1 radio telegram.
    RadioErp1 = PACKET_TYPE_RADIO_ERP1,
    /// Response to a sent packet.
    Response = PACKET_TYPE_RESPONSE,
    /// Radio subtelegram.
    RadioSubTel = PACKET_TYPE_RADIO_SUB_TEL,
    /// Module event.
    Event = PACKET_TYPE_EVENT,
    /// Common command.
    CommonCommand = PACKET_TYPE_COMMON_COMMAND,
    /// Smart-ack command.
    SmartAckCommand = PACKET_TYPE_SMART_ACK_COMMAND,
    /// Remote management command.
    RemoteManCommand = PACKET_TYPE_REMOTE_MAN_COMMAND,
    /// Chained radio message.
    RadioMessage = PACKET_TYPE_RADIO_MESSAGE,
    /// ERP2 radio telegram.
    RadioErp2 = PACKET_TYPE_RADIO_ERP2,
}

impl PacketType {
    /// Parse packet type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            PACKET_TYPE_RADIO_ERP1 => Some(Self::RadioErp1),
            PACKET_TYPE_RESPONSE => Some(Self::Response),
            PACKET_TYPE_RADIO_SUB_TEL => Some(Self::RadioSubTel),
            PACKET_TYPE_EVENT => Some(Self::Event),
            PACKET_TYPE_COMMON_COMMAND => Some(Self::CommonCommand),
            PACKET_TYPE_SMART_ACK_COMMAND => Some(Self::SmartAckCommand),
            PACKET_TYPE_REMOTE_MAN_COMMAND => Some(Self::RemoteManCommand),
            PACKET_TYPE_RADIO_MESSAGE => Some(Self::RadioMessage),
            PACKET_TYPE_RADIO_ERP2 => Some(Self::RadioErp2),
            _ => None,
        }
    }

    /// Convert packet type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Receive state of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    SeekingSync,
    ReadingHeader,
    ReadingPayload,
    Complete,
}

/// Diagnostic counters for dropped and recovered input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Packets completed with valid checksums.
    pub packets: u64,
    /// Header checksum failures (followed by a replay resync).
    pub header_resyncs: u64,
    /// Payload checksum failures (packet discarded).
    pub payload_discards: u64,
    /// Headers announcing a payload above the safety bound.
    pub oversized: u64,
}

/// A single ESP3 packet.
///
/// Invariant: `payload.len() == data_length + opt_data_length + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: [u8; ESP3_HEADER_SIZE],
    payload: Vec<u8>,
    state: FramerState,
    index: usize,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    /// Create an empty packet ready to receive bytes.
    pub fn new() -> Self {
        Self {
            header: [0; ESP3_HEADER_SIZE],
            payload: vec![0; 1],
            state: FramerState::SeekingSync,
            index: 0,
        }
    }

    /// Create an outgoing packet with buffers sized for the given lengths.
    pub fn with_type(packet_type: PacketType, data_length: usize, opt_data_length: usize) -> Self {
        let mut packet = Self::new();
        packet.set_packet_type(packet_type);
        packet.set_lengths(data_length, opt_data_length);
        packet
    }

    /// Reset to an empty packet.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Whether the packet is complete (received with valid checksums, or finalized).
    pub fn is_complete(&self) -> bool {
        self.state == FramerState::Complete
    }

    /// Length of the data section.
    pub fn data_length(&self) -> usize {
        u16::from_be_bytes([self.header[1], self.header[2]]) as usize
    }

    /// Length of the optional data section.
    pub fn opt_data_length(&self) -> usize {
        self.header[3] as usize
    }

    /// Raw packet type byte.
    pub fn packet_type_byte(&self) -> u8 {
        self.header[4]
    }

    /// Packet type, if known.
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_byte(self.header[4])
    }

    /// Set the packet type.
    pub fn set_packet_type(&mut self, packet_type: PacketType) {
        self.header[4] = packet_type.as_byte();
        self.state = FramerState::SeekingSync;
    }

    /// Set the data length, reallocating the payload buffer.
    pub fn set_data_length(&mut self, length: usize) {
        self.set_lengths(length, self.opt_data_length());
    }

    /// Set the optional data length, reallocating the payload buffer.
    pub fn set_opt_data_length(&mut self, length: usize) {
        self.set_lengths(self.data_length(), length);
    }

    fn set_lengths(&mut self, data_length: usize, opt_data_length: usize) {
        debug_assert!(data_length <= u16::MAX as usize);
        debug_assert!(opt_data_length <= u8::MAX as usize);
        self.header[1..3].copy_from_slice(&(data_length as u16).to_be_bytes());
        self.header[3] = opt_data_length as u8;
        self.payload = vec![0; data_length + opt_data_length + 1];
        self.state = FramerState::SeekingSync;
    }

    /// Data section.
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.data_length()]
    }

    /// Mutable data section. Reopens a complete packet for [`Packet::finalize`].
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.state = FramerState::SeekingSync;
        let n = self.data_length();
        &mut self.payload[..n]
    }

    /// Optional data section.
    pub fn opt_data(&self) -> &[u8] {
        let start = self.data_length();
        &self.payload[start..start + self.opt_data_length()]
    }

    /// Mutable optional data section. Reopens a complete packet.
    pub fn opt_data_mut(&mut self) -> &mut [u8] {
        self.state = FramerState::SeekingSync;
        let start = self.data_length();
        let end = start + self.opt_data_length();
        &mut self.payload[start..end]
    }

    /// Feed bytes into the packet.
    ///
    /// Returns the number of bytes consumed. Consumption stops as soon as the
    /// packet is complete, so remaining bytes belong to the next packet. A
    /// complete packet accepts nothing until cleared.
    pub fn accept(&mut self, bytes: &[u8], no_check: bool) -> usize {
        let mut stats = FramerStats::default();
        self.accept_with_stats(bytes, no_check, &mut stats)
    }

    /// Like [`Packet::accept`], recording dropped input in `stats`.
    pub fn accept_with_stats(
        &mut self,
        bytes: &[u8],
        no_check: bool,
        stats: &mut FramerStats,
    ) -> usize {
        let mut consumed = 0;
        for &byte in bytes {
            if self.is_complete() {
                break;
            }
            consumed += 1;
            self.accept_byte(byte, no_check, stats);
        }
        consumed
    }

    fn accept_byte(&mut self, byte: u8, no_check: bool, stats: &mut FramerStats) {
        match self.state {
            FramerState::SeekingSync => {
                if byte == ESP3_SYNC {
                    self.header = [0; ESP3_HEADER_SIZE];
                    self.header[0] = byte;
                    self.index = 1;
                    self.state = FramerState::ReadingHeader;
                }
            }
            FramerState::ReadingHeader => {
                self.header[self.index] = byte;
                self.index += 1;
                if self.index < ESP3_HEADER_SIZE {
                    return;
                }
                if !no_check && crc8(&self.header[1..5]) != self.header[5] {
                    stats.header_resyncs += 1;
                    trace!(header = ?self.header, "header checksum mismatch, resyncing");
                    // A sync byte may hide in what we just read.
                    let mut replay = [0u8; ESP3_HEADER_SIZE - 1];
                    replay.copy_from_slice(&self.header[1..]);
                    self.clear();
                    for b in replay {
                        self.accept_byte(b, no_check, stats);
                    }
                    return;
                }
                let payload_len = self.data_length() + self.opt_data_length();
                if payload_len > MAX_PAYLOAD_SIZE {
                    stats.oversized += 1;
                    debug!(payload_len, "announced payload exceeds bound, dropping");
                    self.clear();
                    return;
                }
                self.payload = vec![0; payload_len + 1];
                self.index = 0;
                self.state = FramerState::ReadingPayload;
            }
            FramerState::ReadingPayload => {
                self.payload[self.index] = byte;
                self.index += 1;
                if self.index < self.payload.len() {
                    return;
                }
                let crc_pos = self.payload.len() - 1;
                if !no_check && crc8(&self.payload[..crc_pos]) != self.payload[crc_pos] {
                    stats.payload_discards += 1;
                    debug!(
                        packet_type = self.packet_type_byte(),
                        "payload checksum mismatch, discarding"
                    );
                    self.clear();
                    return;
                }
                stats.packets += 1;
                self.state = FramerState::Complete;
            }
            FramerState::Complete => {}
        }
    }

    /// Seal an outgoing packet: write sync and both checksums and mark complete.
    ///
    /// No-op on a packet that is already complete. With `no_check` the
    /// checksum bytes are left untouched.
    pub fn finalize(&mut self, no_check: bool) {
        if self.is_complete() {
            return;
        }
        self.header[0] = ESP3_SYNC;
        if !no_check {
            self.header[5] = crc8(&self.header[1..5]);
            let crc_pos = self.payload.len() - 1;
            self.payload[crc_pos] = crc8(&self.payload[..crc_pos]);
        }
        self.state = FramerState::Complete;
    }

    /// Serialize a complete packet to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        if !self.is_complete() {
            return Err(FrameError::Incomplete);
        }
        let mut out = Vec::with_capacity(ESP3_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Strictly parse exactly one packet from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < ESP3_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: ESP3_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != ESP3_SYNC {
            return Err(FrameError::MissingSync(bytes[0]));
        }
        if crc8(&bytes[1..5]) != bytes[5] {
            return Err(FrameError::HeaderChecksum);
        }
        let data_length = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        let payload_len = data_length + bytes[3] as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        let total = ESP3_HEADER_SIZE + payload_len + 1;
        if bytes.len() < total {
            return Err(FrameError::TooShort {
                expected: total,
                actual: bytes.len(),
            });
        }
        let mut packet = Self::new();
        packet.accept(&bytes[..total], false);
        if !packet.is_complete() {
            return Err(FrameError::PayloadChecksum);
        }
        Ok(packet)
    }
}

/// Turns an arbitrary byte stream into complete packets.
#[derive(Debug, Default)]
pub struct Framer {
    current: Packet,
    stats: FramerStats,
    no_check: bool,
}

impl Framer {
    /// Create a framer that verifies checksums.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a framer that skips checksum verification (simulation only).
    pub fn without_checksums() -> Self {
        Self {
            no_check: true,
            ..Self::default()
        }
    }

    /// Feed a chunk of bytes, returning every packet completed by it.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Vec<Packet> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let n = self
                .current
                .accept_with_stats(bytes, self.no_check, &mut self.stats);
            bytes = &bytes[n..];
            if self.current.is_complete() {
                out.push(mem::take(&mut self.current));
            } else if n == 0 {
                break;
            }
        }
        out
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Drop any partially received packet.
    pub fn reset(&mut self) {
        self.current.clear();
    }
}
