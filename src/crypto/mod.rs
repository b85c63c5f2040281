//! Secure telegram layer.
//!
//! - **Primitives**: [`KeyMaterial`] with CMAC sub-keys, [`cmac`], [`vaes_apply`]
//! - **Counters**: [`SecurityLevelFormat`] and the forward-only [`ReplayWindow`]
//! - **Per device**: [`SecureContext`] holding inbound/outbound [`RollingChannel`]s
//!   and the teach-in assembly
//! - **Process wide**: [`SecurityRegistry`] with throttled persistence through a
//!   [`SecurityStore`](crate::core::SecurityStore)

mod cmac;
mod context;
mod registry;
mod rlc;
mod teach_in;
mod vaes;

pub use cmac::{KeyMaterial, cmac, cmac_message, derive_subkeys, telegram_mac};
pub use context::{RollingChannel, SecureContext, TeachInOutcome, TeachInPolicy};
pub use registry::{
    ChannelRecord, FileSecurityStore, MemorySecurityStore, SecureRecord, SecurityRegistry,
};
pub use rlc::{Encryption, ReplayWindow, SecurityLevelFormat, decode_rlc, encode_rlc, rlc_mask};
pub use teach_in::{
    SecureTeachInInfo, TeachInAssembly, TeachInBody, TeachInSegment, build_teach_in,
};
pub use vaes::vaes_apply;
