//! # ESP3 Gateway
//!
//! Core of a gateway that talks to an ESP3 radio module over a serial line
//! or a TCP bridge:
//!
//! - **Framing**: ESP3 packets with CRC8 header and data checksums
//! - **Radio**: typed views over radio telegrams and their profiles
//! - **Security**: CMAC authentication, VAES encryption, rolling codes and
//!   secure teach-in
//! - **Learning**: pairing, unpairing and dispatch to registered devices
//!
//! ## Feature Flags
//!
//! - `transport` (default): command channel, link supervision and the
//!   tokio-based [`gateway::Gateway`] runtime
//!
//! ## Modules
//!
//! - [`core`]: shared types, constants, errors and host-facing traits
//! - [`transport`]: packet framing, commands and (with `transport`) the link
//! - [`radio`]: radio telegram views
//! - [`crypto`]: secure telegram contexts and their persistence
//! - [`learn`]: learn & dispatch controller
//! - [`gateway`]: configuration and runtime
//!
//! ## Example Usage
//!
//! ```rust
//! use esp3_gateway::prelude::*;
//!
//! let mut framer = Framer::new();
//! let packets = framer.feed(&[0x55, 0x00, 0x01, 0x00, 0x02, 0x65, 0x00, 0x00]);
//! assert_eq!(packets.len(), 1);
//! assert_eq!(packets[0].packet_type(), Some(PacketType::Response));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;
pub mod crypto;
pub mod gateway;
pub mod learn;
pub mod radio;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::crypto::{
        FileSecurityStore, MemorySecurityStore, ReplayWindow, SecureContext, SecurityRegistry,
    };
    pub use crate::gateway::{GatewayConfig, LearnConfig, LinkConfig, SecurityConfig};
    pub use crate::learn::{ControllerAction, LearnController, LearnEvent, LearnMode};
    pub use crate::radio::{Eep, Rorg, TeachInInfo};
    pub use crate::transport::{Framer, Outgoing, Packet, PacketType};

    #[cfg(feature = "transport")]
    pub use crate::gateway::{Gateway, GatewayEvent, GatewayHandle, open_store};
    #[cfg(feature = "transport")]
    pub use crate::transport::{CommandChannel, LinkEvent, Transport};
}

pub use core::{Address, GatewayError};
pub use transport::{Framer, Packet, PacketType};
