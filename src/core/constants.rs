//! Protocol constants for ESP3 framing, radio telegrams and secure telegrams.
//!
//! These values are fixed by the protocol and MUST NOT be changed. Deployment
//! tunables (replay window, minimum learn signal, timeouts) live in
//! [`crate::gateway::GatewayConfig`] instead.

use std::time::Duration;

// =============================================================================
// ESP3 FRAMING
// =============================================================================

/// Sync byte opening every ESP3 packet.
pub const ESP3_SYNC: u8 = 0x55;

/// Header size including the sync byte and header CRC.
pub const ESP3_HEADER_SIZE: usize = 6;

/// Upper bound for data + optional data. Radio telegrams are never this large.
pub const MAX_PAYLOAD_SIZE: usize = 512;

// =============================================================================
// ESP3 PACKET TYPES
// =============================================================================

/// ERP1 radio telegram.
pub const PACKET_TYPE_RADIO_ERP1: u8 = 0x01;

/// Response to a previously sent packet.
pub const PACKET_TYPE_RESPONSE: u8 = 0x02;

/// Radio subtelegram.
pub const PACKET_TYPE_RADIO_SUB_TEL: u8 = 0x03;

/// Event message from the module.
pub const PACKET_TYPE_EVENT: u8 = 0x04;

/// Common command.
pub const PACKET_TYPE_COMMON_COMMAND: u8 = 0x05;

/// Smart-ack command.
pub const PACKET_TYPE_SMART_ACK_COMMAND: u8 = 0x06;

/// Remote management command.
pub const PACKET_TYPE_REMOTE_MAN_COMMAND: u8 = 0x07;

/// Radio message (chained).
pub const PACKET_TYPE_RADIO_MESSAGE: u8 = 0x09;

/// ERP2 radio telegram.
pub const PACKET_TYPE_RADIO_ERP2: u8 = 0x0A;

// =============================================================================
// RESPONSE RETURN CODES
// =============================================================================

/// Command executed.
pub const RET_OK: u8 = 0x00;

/// Generic error.
pub const RET_ERROR: u8 = 0x01;

/// Command not supported by the module.
pub const RET_NOT_SUPPORTED: u8 = 0x02;

/// Wrong parameter.
pub const RET_WRONG_PARAM: u8 = 0x03;

/// Operation denied.
pub const RET_OPERATION_DENIED: u8 = 0x04;

// =============================================================================
// COMMANDS AND EVENTS
// =============================================================================

/// Common command: software reset of the module.
pub const CO_WR_RESET: u8 = 0x02;

/// Common command: read version information.
pub const CO_RD_VERSION: u8 = 0x03;

/// Common command: read the ID base.
pub const CO_RD_IDBASE: u8 = 0x08;

/// Smart-ack command: enable/disable learn mode.
pub const SA_WR_LEARNMODE: u8 = 0x01;

/// Event code: smart-ack learn confirmation request.
pub const SA_CONFIRM_LEARN: u8 = 0x02;

/// Size of the gateway's own address block starting at the ID base.
pub const ID_BASE_BLOCK_SIZE: u32 = 128;

// =============================================================================
// RADIO TELEGRAM LAYOUT
// =============================================================================

/// Data bytes that are not user data: RORG, sender (4), status.
pub const RADIO_FRAME_OVERHEAD: usize = 6;

/// Optional data length of an ERP1 telegram.
pub const RADIO_OPT_DATA_SIZE: usize = 7;

/// Subtelegram count used for outgoing telegrams.
pub const SEND_SUBTELEGRAMS: u8 = 3;

/// Broadcast destination address.
pub const BROADCAST_ADDRESS: u32 = 0xFFFF_FFFF;

/// Status bit T21 (PTM type 2).
pub const STATUS_T21: u8 = 0x20;

/// Status bit NU (N-message vs. U-message).
pub const STATUS_NU: u8 = 0x10;

/// Repeater count mask in the status byte.
pub const STATUS_REPEATER_MASK: u8 = 0x0F;

/// Learn bit in DB0 of 1BS and 4BS telegrams (0 = teach-in).
pub const LEARN_BIT: u8 = 0x08;

/// 4BS "teach-in with EEP" bit in DB0.
pub const LEARN_TYPE_BIT: u8 = 0x80;

/// RPS energy bow bit (button pressed).
pub const RPS_ENERGY_BOW: u8 = 0x10;

/// ESP3 security level byte: telegram decrypted.
pub const SECURITY_LEVEL_DECRYPTED: u8 = 0x02;

/// ESP3 security level byte: telegram authenticated.
pub const SECURITY_LEVEL_AUTHENTICATED: u8 = 0x03;

/// ESP3 security level byte: telegram decrypted and authenticated.
pub const SECURITY_LEVEL_DECRYPTED_AUTHENTICATED: u8 = 0x04;

// =============================================================================
// EQUIPMENT PROFILES
// =============================================================================

/// Func/type value meaning "not present in this telegram".
pub const EEP_UNKNOWN: u8 = 0xFF;

/// Manufacturer code meaning "not present in this telegram".
pub const MANUFACTURER_UNKNOWN: u16 = 0x07FF;

/// Profile assigned to secure push-button modules on implicit teach-in (F6-02-01).
pub const EEP_SECURE_PTM: u32 = 0x00F6_0201;

// =============================================================================
// SECURE TELEGRAMS
// =============================================================================

/// AES block size.
pub const AES_BLOCK_SIZE: usize = 16;

/// Private key size (AES-128).
pub const PRIVATE_KEY_SIZE: usize = 16;

/// Public constant mixed into the VAES initialisation vector.
pub const VAES_PUBLIC_KEY: [u8; AES_BLOCK_SIZE] = [
    0x34, 0x10, 0xDE, 0x8F, 0x1A, 0xBA, 0x3E, 0xFF, 0x9F, 0x5A, 0x11, 0x71, 0x72, 0xEA, 0xCA, 0xBD,
];

/// Maximum number of secure teach-in segments.
pub const MAX_TEACH_IN_SEGMENTS: u8 = 2;

/// Body bytes carried by the first segment of an outgoing two-segment teach-in.
pub const TEACH_IN_FIRST_SEGMENT_BODY: usize = 10;

// =============================================================================
// DEFAULTS (overridable through configuration)
// =============================================================================

/// Default replay window for rolling counters.
pub const DEFAULT_REPLAY_WINDOW: u32 = 128;

/// Default number of counter values tried after the expected one.
pub const DEFAULT_RLC_LOOKAHEAD: u32 = 128;

/// Default minimum RLC advance before a secure context is persisted again.
///
/// Must stay below the look-ahead, or a counter restored after a crash can
/// trail the device by more than an implicit counter search covers.
pub const DEFAULT_RLC_SAVE_DISTANCE: u32 = 32;

/// Default minimum signal strength for implicit teach-in (about one metre).
pub const DEFAULT_MIN_LEARN_DBM: i16 = -50;

/// Default deadline for answering a bidirectional secure teach-in.
pub const DEFAULT_TEACH_IN_RESPONSE_DEADLINE: Duration = Duration::from_millis(500);

/// Default command response timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default liveness probe interval.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

/// Default consecutive probe misses before a hard reset.
pub const DEFAULT_LIVENESS_RETRIES: u32 = 3;

/// Default consecutive hard resets before the link is declared dead.
pub const DEFAULT_MAX_RESETS: u32 = 5;

/// Default settle time after a hard reset before reopening.
pub const DEFAULT_RESET_SETTLE: Duration = Duration::from_secs(2);
