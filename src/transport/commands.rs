//! Common and smart-ack command builders and response parsers.

use std::time::Duration;

#[cfg(not(feature = "transport"))]
pub use std::time::Instant;
#[cfg(feature = "transport")]
pub use tokio::time::Instant;

use super::packet::{Packet, PacketType};
use crate::core::{
    Address, CO_RD_IDBASE, CO_RD_VERSION, CO_WR_RESET, CommandError, ResponseCode,
    SA_WR_LEARNMODE,
};

/// A packet queued for transmission with an optional send deadline.
///
/// Packets whose deadline has passed when the link gets to them are dropped.
#[derive(Debug, Clone)]
pub struct Outgoing {
    /// Finalized packet.
    pub packet: Packet,
    /// Latest instant the packet is still useful.
    pub deadline: Option<Instant>,
}

impl Outgoing {
    /// Packet without a deadline.
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            deadline: None,
        }
    }

    /// Packet that must be sent before `deadline`.
    pub fn with_deadline(packet: Packet, deadline: Instant) -> Self {
        Self {
            packet,
            deadline: Some(deadline),
        }
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now > d)
    }

    /// Whether the packet may skip ahead of a command awaiting its response.
    ///
    /// Responses we send and packets with a deadline qualify.
    pub fn is_urgent(&self) -> bool {
        self.deadline.is_some() || self.packet.packet_type() == Some(PacketType::Response)
    }
}

fn common_command(code: u8) -> Packet {
    let mut packet = Packet::with_type(PacketType::CommonCommand, 1, 0);
    packet.data_mut()[0] = code;
    packet.finalize(false);
    packet
}

/// CO_WR_RESET: software reset of the module.
pub fn reset_command() -> Packet {
    common_command(CO_WR_RESET)
}

/// CO_RD_VERSION: read version information. Also the liveness probe.
pub fn version_command() -> Packet {
    common_command(CO_RD_VERSION)
}

/// CO_RD_IDBASE: read the first address of the gateway's own block.
pub fn id_base_command() -> Packet {
    common_command(CO_RD_IDBASE)
}

/// SA_WR_LEARNMODE: enable or disable smart-ack learn mode for `timeout`.
pub fn learn_mode_command(enable: bool, timeout: Duration) -> Packet {
    let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
    let mut packet = Packet::with_type(PacketType::SmartAckCommand, 7, 0);
    let data = packet.data_mut();
    data[0] = SA_WR_LEARNMODE;
    data[1] = enable as u8;
    data[2] = 0;
    data[3..7].copy_from_slice(&millis.to_be_bytes());
    packet.finalize(false);
    packet
}

/// Return code of a RESPONSE packet.
pub fn response_code(packet: &Packet) -> Result<ResponseCode, CommandError> {
    if packet.packet_type() != Some(PacketType::Response) {
        return Err(CommandError::MalformedResponse("not a response packet"));
    }
    packet
        .data()
        .first()
        .map(|&b| ResponseCode::from_byte(b))
        .ok_or(CommandError::MalformedResponse("empty response"))
}

/// Pass a RESPONSE through if its return code is RET_OK.
pub fn check_response(packet: Packet) -> Result<Packet, CommandError> {
    match response_code(&packet)? {
        ResponseCode::Ok => Ok(packet),
        code => Err(CommandError::Rejected(code)),
    }
}

/// Parsed CO_RD_VERSION response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Application version (main, beta, alpha, build).
    pub app_version: [u8; 4],
    /// API version.
    pub api_version: [u8; 4],
    /// Unique chip ID.
    pub chip_id: Address,
    /// Chip version.
    pub chip_version: u32,
    /// Application description, NUL padded on the wire.
    pub description: String,
}

impl VersionInfo {
    const LEN: usize = 1 + 4 + 4 + 4 + 4 + 16;

    /// Parse a CO_RD_VERSION response.
    pub fn parse(response: &Packet) -> Result<Self, CommandError> {
        let code = response_code(response)?;
        if !code.is_ok() {
            return Err(CommandError::Rejected(code));
        }
        let data = response.data();
        if data.len() < Self::LEN {
            return Err(CommandError::MalformedResponse("short version response"));
        }
        let word = |at: usize| [data[at], data[at + 1], data[at + 2], data[at + 3]];
        let description = data[17..33]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();
        Ok(Self {
            app_version: word(1),
            api_version: word(5),
            chip_id: Address::from_bytes(word(9)),
            chip_version: u32::from_be_bytes(word(13)),
            description,
        })
    }
}

/// Parsed CO_RD_IDBASE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdBase {
    /// First address of the gateway's block.
    pub base: Address,
    /// Remaining base ID write cycles, when reported.
    pub remaining_writes: Option<u8>,
}

impl IdBase {
    /// Parse a CO_RD_IDBASE response.
    pub fn parse(response: &Packet) -> Result<Self, CommandError> {
        let code = response_code(response)?;
        if !code.is_ok() {
            return Err(CommandError::Rejected(code));
        }
        let data = response.data();
        if data.len() < 5 {
            return Err(CommandError::MalformedResponse("short id base response"));
        }
        Ok(Self {
            base: Address::from_bytes([data[1], data[2], data[3], data[4]]),
            remaining_writes: response.opt_data().first().copied(),
        })
    }
}
