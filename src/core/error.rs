//! Error types for the gateway core.

use thiserror::Error;

use super::types::ResponseCode;

/// Errors from strict packet parsing.
///
/// The streaming framer never surfaces these; it resynchronises instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes for a complete packet.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Buffer does not start with the sync byte.
    #[error("missing sync byte, found 0x{0:02x}")]
    MissingSync(u8),

    /// Header CRC mismatch.
    #[error("header checksum mismatch")]
    HeaderChecksum,

    /// Payload CRC mismatch.
    #[error("payload checksum mismatch")]
    PayloadChecksum,

    /// Announced payload exceeds the safety bound.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Packet has not been finalized or fully received.
    #[error("packet incomplete")]
    Incomplete,
}

/// Errors in the secure telegram layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Security level format not supported.
    #[error("unsupported security level format: 0x{0:02x}")]
    UnsupportedSecurityLevel(u8),

    /// Telegram is not a secure telegram.
    #[error("not a secure telegram (rorg 0x{0:02x})")]
    NotSecure(u8),

    /// Telegram too short for the configured RLC and MAC sizes.
    #[error("secure telegram too short: need {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// No counter value within the replay window produced a matching MAC.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Transmitted rolling counter lies outside the replay window.
    #[error("rolling counter rejected (distance {distance})")]
    ReplayRejected {
        /// Forward distance from the stored counter.
        distance: u32,
    },

    /// Context has no established key yet.
    #[error("secure context not established")]
    NotEstablished,

    /// No outbound key material for sending.
    #[error("no outbound key material")]
    NoOutboundKey,

    /// Teach-in segment arrived out of order.
    #[error("teach-in segment out of order: expected {expected}, got {got}")]
    TeachInOutOfOrder {
        /// Segment index expected next.
        expected: u8,
        /// Segment index received.
        got: u8,
    },

    /// Teach-in payload malformed.
    #[error("malformed teach-in: {0}")]
    TeachInMalformed(&'static str),

    /// Teach-in protected by a pre-shared key.
    #[error("pre-shared key teach-in not supported")]
    PskNotSupported,

    /// New key material offered for an established context outside learn mode.
    #[error("key change refused for established context")]
    KeyChangeRefused,

    /// Secure teach-in arrived while learn-in is not allowed.
    #[error("secure teach-in not allowed now")]
    LearnInNotAllowed,
}

/// Errors surfaced to callers of the command channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No response within the command timeout.
    #[error("command timed out")]
    Timeout,

    /// Module answered with a non-OK return code.
    #[error("command rejected: {0}")]
    Rejected(ResponseCode),

    /// Response did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),

    /// Deadline passed before the packet could be sent.
    #[error("send deadline expired")]
    Expired,

    /// Writing to the transport failed.
    #[error("transport write failed: {0}")]
    Io(String),

    /// The link task has shut down.
    #[error("command channel closed")]
    ChannelClosed,

    /// The link gave up after repeated hard resets.
    #[error("transport reset attempts exhausted")]
    ResetExhausted,
}

/// Errors from the secure context persistence boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record could not be encoded or decoded.
    #[error("record format error: {0}")]
    Format(String),

    /// Backing storage failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Framing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Command error.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Persistence error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),
}
