//! Boundary traits towards the host application.
//!
//! The gateway core never models devices or storage itself. It calls out
//! through these traits, which the host implements (and tests replace with
//! in-memory doubles).

use std::sync::Arc;

use super::error::StoreError;
use super::types::Address;
use crate::crypto::{SecureContext, SecureRecord};
use crate::radio::{Eep, TeachInInfo};
use crate::transport::Packet;

/// Reason a device registry refused to create devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnRefusal {
    /// No device model exists for the announced profile.
    UnknownProfile,
    /// The registry has no room for more devices.
    CapacityExceeded,
}

/// A device announcing itself during learn mode.
#[derive(Debug, Clone, Copy)]
pub struct TeachIn<'a> {
    /// Sender address.
    pub address: Address,
    /// Announced (or implied) equipment profile.
    pub eep: Eep,
    /// Manufacturer code.
    pub manufacturer: u16,
    /// The teach-in telegram itself.
    pub telegram: &'a Packet,
    /// Secure context when the device talks securely.
    pub security: Option<&'a SecureContext>,
}

/// The host's registry of paired devices.
///
/// # Requirements
///
/// - `create_devices` MUST NOT be called for an address/profile pair that
///   `has_devices` already reports
/// - `dispatch` receives only authenticated, decrypted telegrams for
///   addresses with a secure context
pub trait DeviceRegistry: Send {
    /// Whether devices exist for this address and profile.
    fn has_devices(&self, address: Address, eep: Eep) -> bool;

    /// Whether any device exists for this address.
    fn has_any_devices(&self, address: Address) -> bool;

    /// Create the device(s) described by a teach-in. Returns how many.
    fn create_devices(&mut self, teach_in: &TeachIn<'_>) -> Result<usize, LearnRefusal>;

    /// Remove the device(s) for an address and profile. Returns how many.
    ///
    /// With `keep_settings` the host retains higher-level configuration.
    fn remove_devices(&mut self, address: Address, eep: Eep, keep_settings: bool) -> usize;

    /// Deliver a telegram to every device at `address`.
    fn dispatch(&mut self, address: Address, telegram: &Arc<Packet>);

    /// A paired device sent a teach-in outside learn mode (user pressed its
    /// learn button). Hosts typically flash or highlight the device.
    fn identify(&mut self, address: Address, info: &TeachInInfo) {
        let _ = (address, info);
    }
}

/// Persistence of secure contexts, keyed by address.
pub trait SecurityStore: Send {
    /// Insert or replace the record for `record.address`.
    fn save(&mut self, record: &SecureRecord) -> Result<(), StoreError>;

    /// Delete the record for an address. Missing records are not an error.
    fn remove(&mut self, address: Address) -> Result<(), StoreError>;

    /// All stored records.
    fn load_all(&self) -> Result<Vec<SecureRecord>, StoreError>;
}
