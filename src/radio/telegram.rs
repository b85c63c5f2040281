//! Radio telegram view over an ERP1 [`Packet`].
//!
//! ```text
//! data:     [rorg][user data ...][sender (4)][status]
//! opt data: [subtel count][destination (4)][dBm][security level]
//! ```
//!
//! Getters tolerate short or non-radio packets and return neutral values.
//! Setters assume the buffers were sized with [`Packet::init_for_rorg`];
//! writing into an unsized buffer is a programming error and panics.

use super::eep::{Eep, TeachInInfo};
use super::rorg::Rorg;
use crate::core::{
    Address, LEARN_BIT, LEARN_TYPE_BIT, RADIO_FRAME_OVERHEAD, RADIO_OPT_DATA_SIZE, RPS_ENERGY_BOW,
    SEND_SUBTELEGRAMS, STATUS_REPEATER_MASK, STATUS_T21,
};
use crate::transport::{Packet, PacketType};

const OPT_SUBTEL: usize = 0;
const OPT_DESTINATION: usize = 1;
const OPT_DBM: usize = 5;
const OPT_SECURITY: usize = 6;

impl Packet {
    /// Build an empty outgoing radio telegram with `user_data_len` user bytes.
    pub fn radio(rorg: Rorg, user_data_len: usize) -> Self {
        let mut packet = Self::new();
        packet.init_for_rorg(rorg, user_data_len);
        packet
    }

    /// Size buffers for a radio telegram and write the default optional data
    /// (send to broadcast, default subtelegram count).
    pub fn init_for_rorg(&mut self, rorg: Rorg, user_data_len: usize) {
        *self = Self::with_type(
            PacketType::RadioErp1,
            user_data_len + RADIO_FRAME_OVERHEAD,
            RADIO_OPT_DATA_SIZE,
        );
        self.data_mut()[0] = rorg.as_byte();
        let opt = self.opt_data_mut();
        opt[OPT_SUBTEL] = SEND_SUBTELEGRAMS;
        opt[OPT_DESTINATION..OPT_DESTINATION + 4].copy_from_slice(&Address::BROADCAST.to_bytes());
        opt[OPT_DBM] = 0xFF;
        opt[OPT_SECURITY] = 0;
    }

    /// Whether this is an ERP1 packet large enough to hold the radio frame.
    pub fn is_radio(&self) -> bool {
        self.packet_type() == Some(PacketType::RadioErp1)
            && self.data_length() >= RADIO_FRAME_OVERHEAD
    }

    fn has_radio_opt_data(&self) -> bool {
        self.is_radio() && self.opt_data_length() >= RADIO_OPT_DATA_SIZE
    }

    /// Radio organisation, or [`Rorg::Invalid`] for non-radio packets.
    pub fn rorg(&self) -> Rorg {
        if self.is_radio() {
            Rorg::from_byte(self.data()[0])
        } else {
            Rorg::Invalid
        }
    }

    /// Set the radio organisation byte.
    pub fn set_rorg(&mut self, rorg: Rorg) {
        self.data_mut()[0] = rorg.as_byte();
    }

    /// Number of user data bytes (`data_length - 6`, never negative).
    pub fn radio_user_data_len(&self) -> usize {
        self.data_length().saturating_sub(RADIO_FRAME_OVERHEAD)
    }

    /// User data between the RORG and the sender address.
    pub fn radio_user_data(&self) -> &[u8] {
        if !self.is_radio() {
            return &[];
        }
        &self.data()[1..1 + self.radio_user_data_len()]
    }

    /// Mutable user data.
    pub fn radio_user_data_mut(&mut self) -> &mut [u8] {
        let len = self.radio_user_data_len();
        &mut self.data_mut()[1..1 + len]
    }

    /// Overwrite the user data. `bytes` must match the sized length.
    pub fn set_radio_user_data(&mut self, bytes: &[u8]) {
        self.radio_user_data_mut().copy_from_slice(bytes);
    }

    fn sender_offset(&self) -> usize {
        self.data_length() - 5
    }

    /// Sender address.
    pub fn sender(&self) -> Address {
        if !self.is_radio() {
            return Address(0);
        }
        let at = self.sender_offset();
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data()[at..at + 4]);
        Address::from_bytes(bytes)
    }

    /// Set the sender address.
    pub fn set_sender(&mut self, address: Address) {
        let at = self.sender_offset();
        self.data_mut()[at..at + 4].copy_from_slice(&address.to_bytes());
    }

    /// Status byte.
    pub fn status(&self) -> u8 {
        if !self.is_radio() {
            return 0;
        }
        self.data()[self.data_length() - 1]
    }

    /// Set the status byte.
    pub fn set_status(&mut self, status: u8) {
        let at = self.data_length() - 1;
        self.data_mut()[at] = status;
    }

    /// Repeater hop count from the status byte.
    pub fn repeater_count(&self) -> u8 {
        self.status() & STATUS_REPEATER_MASK
    }

    /// Subtelegram count (0 when no optional data).
    pub fn subtelegram_count(&self) -> u8 {
        if !self.has_radio_opt_data() {
            return 0;
        }
        self.opt_data()[OPT_SUBTEL]
    }

    /// Destination address (broadcast when no optional data).
    pub fn destination(&self) -> Address {
        if !self.has_radio_opt_data() {
            return Address::BROADCAST;
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.opt_data()[OPT_DESTINATION..OPT_DESTINATION + 4]);
        Address::from_bytes(bytes)
    }

    /// Set the destination address.
    pub fn set_destination(&mut self, address: Address) {
        self.opt_data_mut()[OPT_DESTINATION..OPT_DESTINATION + 4]
            .copy_from_slice(&address.to_bytes());
    }

    /// Received signal strength in dBm, from the unsigned byte as `-byte`.
    pub fn dbm(&self) -> Option<i16> {
        if !self.has_radio_opt_data() {
            return None;
        }
        Some(-(self.opt_data()[OPT_DBM] as i16))
    }

    /// Security level reported by (or requested from) the module.
    pub fn security_level(&self) -> u8 {
        if !self.has_radio_opt_data() {
            return 0;
        }
        self.opt_data()[OPT_SECURITY]
    }

    /// Set the security level byte.
    pub fn set_security_level(&mut self, level: u8) {
        self.opt_data_mut()[OPT_SECURITY] = level;
    }

    /// Copy sender, status and optional data from a telegram of another shape.
    pub(crate) fn copy_radio_envelope(&mut self, from: &Packet) {
        self.set_sender(from.sender());
        self.set_status(from.status());
        if from.has_radio_opt_data() {
            self.opt_data_mut()
                .copy_from_slice(&from.opt_data()[..RADIO_OPT_DATA_SIZE]);
        }
    }

    /// Whether the telegram announces a teach-in.
    ///
    /// `min_dbm` gates implicit (RPS) teach-in on signal strength; explicit
    /// learn bits are never gated.
    pub fn has_teach_in_info(&self, min_dbm: Option<i16>) -> bool {
        let user = self.radio_user_data();
        match self.rorg() {
            Rorg::Rps => {
                let pressed = user.first().is_some_and(|b| b & RPS_ENERGY_BOW != 0);
                let close = match min_dbm {
                    Some(min) => self.dbm().is_some_and(|dbm| dbm >= min),
                    None => true,
                };
                self.status() & STATUS_T21 != 0 && pressed && close
            }
            Rorg::OneBs => user.first().is_some_and(|b| b & LEARN_BIT == 0),
            Rorg::FourBs => user.len() >= 4 && user[3] & LEARN_BIT == 0,
            Rorg::Ute => user.len() >= 7 && user[0] & 0x0F == 0,
            Rorg::SecTi => true,
            _ => false,
        }
    }

    /// Profile and manufacturer announced by a teach-in telegram.
    pub fn eep_info(&self) -> TeachInInfo {
        let user = self.radio_user_data();
        let rorg = self.rorg();
        match rorg {
            Rorg::FourBs if user.len() >= 4 && user[3] & LEARN_TYPE_BIT != 0 => TeachInInfo {
                eep: Eep::new(
                    rorg.as_byte(),
                    user[0] >> 2,
                    ((user[0] & 0x03) << 5) | (user[1] >> 3),
                ),
                manufacturer: (((user[1] & 0x07) as u16) << 8) | user[2] as u16,
            },
            Rorg::OneBs => TeachInInfo {
                eep: Eep::new(rorg.as_byte(), 0x00, 0x01),
                ..TeachInInfo::unknown(rorg.as_byte())
            },
            Rorg::Ute if user.len() >= 7 => TeachInInfo {
                eep: Eep::new(user[6], user[5], user[4]),
                manufacturer: (((user[3] & 0x07) as u16) << 8) | user[2] as u16,
            },
            _ => TeachInInfo::unknown(rorg.as_byte()),
        }
    }
}
