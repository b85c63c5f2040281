//! ESP3 transport layer.
//!
//! - **Framing**: [`Packet`], [`Framer`] and the ESP3 [`crc8`]
//! - **Commands**: builders and parsers for common and smart-ack commands
//! - **Channel**: single in-flight command slot and liveness bookkeeping
//! - **Link**: the supervising task that owns the byte stream
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Learn & dispatch                │
//! ├─────────────────────────────────────────┤
//! │   Command channel / link supervision    │  ← This module
//! │   Packet framing                        │
//! ├─────────────────────────────────────────┤
//! │     Serial line / TCP bridge            │
//! └─────────────────────────────────────────┘
//! ```

mod commands;
mod crc8;
mod packet;

#[cfg(feature = "transport")]
mod channel;
#[cfg(feature = "transport")]
mod link;

pub use commands::{
    IdBase, Instant, Outgoing, VersionInfo, check_response, id_base_command, learn_mode_command,
    reset_command, response_code, version_command,
};
pub use crc8::{crc8, crc8_update};
pub use packet::{Framer, FramerStats, Packet, PacketType};

#[cfg(feature = "transport")]
pub use channel::{CommandChannel, CommandSlot, Liveness, LivenessVerdict, SlotOutcome, Waiter};
#[cfg(feature = "transport")]
pub use link::{LinkEvent, Transport, spawn_link};

#[cfg(all(test, feature = "transport"))]
pub(crate) use link::tests as link_tests;
