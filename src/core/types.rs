//! Small value types shared across layers.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::constants::{
    BROADCAST_ADDRESS, ID_BASE_BLOCK_SIZE, RET_ERROR, RET_NOT_SUPPORTED, RET_OK,
    RET_OPERATION_DENIED, RET_WRONG_PARAM,
};

/// 32-bit radio device address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u32);

impl Address {
    /// Broadcast destination.
    pub const BROADCAST: Self = Self(BROADCAST_ADDRESS);

    /// Create from the four big-endian wire bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }

    /// Big-endian wire bytes.
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Whether this address lies in the 128-address block starting at `id_base`.
    pub fn is_in_block(self, id_base: Address) -> bool {
        self.0.wrapping_sub(id_base.0) < ID_BASE_BLOCK_SIZE
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl From<u32> for Address {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Return code carried in the first data byte of a RESPONSE packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    /// RET_OK.
    Ok,
    /// RET_ERROR.
    Error,
    /// RET_NOT_SUPPORTED.
    NotSupported,
    /// RET_WRONG_PARAM.
    WrongParam,
    /// RET_OPERATION_DENIED.
    OperationDenied,
    /// Any other code, kept raw.
    Other(u8),
}

impl ResponseCode {
    /// Parse from a byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            RET_OK => Self::Ok,
            RET_ERROR => Self::Error,
            RET_NOT_SUPPORTED => Self::NotSupported,
            RET_WRONG_PARAM => Self::WrongParam,
            RET_OPERATION_DENIED => Self::OperationDenied,
            other => Self::Other(other),
        }
    }

    /// Byte representation.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Ok => RET_OK,
            Self::Error => RET_ERROR,
            Self::NotSupported => RET_NOT_SUPPORTED,
            Self::WrongParam => RET_WRONG_PARAM,
            Self::OperationDenied => RET_OPERATION_DENIED,
            Self::Other(b) => b,
        }
    }

    /// Check for RET_OK.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("RET_OK"),
            Self::Error => f.write_str("RET_ERROR"),
            Self::NotSupported => f.write_str("RET_NOT_SUPPORTED"),
            Self::WrongParam => f.write_str("RET_WRONG_PARAM"),
            Self::OperationDenied => f.write_str("RET_OPERATION_DENIED"),
            Self::Other(b) => write!(f, "0x{b:02x}"),
        }
    }
}
