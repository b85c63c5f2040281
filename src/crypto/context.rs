//! Per-device secure telegram state.
//!
//! Secure data telegram layout (user data of a SEC / SEC_ENCAPS telegram):
//!
//! ```text
//! [encrypted payload][RLC (if transmitted)][MAC]
//! ```
//!
//! For SEC_ENCAPS the encrypted payload starts with the original RORG.
//! The MAC is computed over the secure RORG byte, the encrypted payload and
//! the rolling counter.

use std::time::Instant;

use constant_time_eq::constant_time_eq;
use tracing::{debug, trace};
use zeroize::Zeroize;

use super::cmac::{KeyMaterial, telegram_mac};
use super::rlc::{Encryption, ReplayWindow, SecurityLevelFormat, decode_rlc, encode_rlc};
use super::teach_in::{
    SecureTeachInInfo, TeachInAssembly, TeachInSegment, build_teach_in, random_key_and_rlc,
};
use super::vaes::vaes_apply;
use crate::core::{
    Address, CryptoError, PRIVATE_KEY_SIZE, SECURITY_LEVEL_AUTHENTICATED,
    SECURITY_LEVEL_DECRYPTED_AUTHENTICATED,
};
use crate::radio::Rorg;
use crate::transport::Packet;

/// One direction of a secure link: format, key and rolling counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingChannel {
    slf: SecurityLevelFormat,
    keys: KeyMaterial,
    rlc: u32,
}

impl RollingChannel {
    /// Create a channel. The counter is the value used (or expected) next.
    pub fn new(slf: SecurityLevelFormat, key: [u8; PRIVATE_KEY_SIZE], rlc: u32) -> Self {
        Self {
            slf,
            keys: KeyMaterial::new(key),
            rlc: rlc & slf.rlc_mask(),
        }
    }

    /// Security level format.
    pub fn slf(&self) -> SecurityLevelFormat {
        self.slf
    }

    /// Key material.
    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    /// Counter value used or expected next.
    pub fn rlc(&self) -> u32 {
        self.rlc
    }

    /// Overwrite the counter (teach-in refresh).
    pub fn set_rlc(&mut self, rlc: u32) {
        self.rlc = rlc & self.slf.rlc_mask();
    }

    fn advance_past(&mut self, rlc: u32) {
        self.rlc = rlc.wrapping_add(1) & self.slf.rlc_mask();
    }

    fn mac_matches(&self, rorg: u8, payload: &[u8], rlc: u32, mac: &[u8]) -> bool {
        constant_time_eq(&self.mac(rorg, payload, rlc), mac)
    }

    fn mac(&self, rorg: u8, payload: &[u8], rlc: u32) -> Vec<u8> {
        telegram_mac(
            &self.keys,
            Some(rorg),
            payload,
            rlc,
            self.slf.rlc_size(),
            self.slf.mac_size(),
        )
    }

    fn apply_cipher(&self, rlc: u32, data: &mut [u8]) {
        if self.slf.encryption() == Encryption::Vaes {
            vaes_apply(&self.keys, rlc, self.slf.rlc_size(), data);
        }
    }

    fn security_level(&self) -> u8 {
        match self.slf.encryption() {
            Encryption::Vaes => SECURITY_LEVEL_DECRYPTED_AUTHENTICATED,
            Encryption::None => SECURITY_LEVEL_AUTHENTICATED,
        }
    }

    /// Turn a plain radio telegram into a SEC_ENCAPS telegram and advance the counter.
    pub fn seal(&mut self, plain: &Packet) -> Result<Packet, CryptoError> {
        let rorg = plain.rorg();
        if matches!(rorg, Rorg::Invalid) {
            return Err(CryptoError::NotSecure(rorg.as_byte()));
        }
        let rlc = self.rlc;
        let mut payload = Vec::with_capacity(1 + plain.radio_user_data_len());
        payload.push(rorg.as_byte());
        payload.extend_from_slice(plain.radio_user_data());
        self.apply_cipher(rlc, &mut payload);

        let secure_rorg = Rorg::SecEncaps.as_byte();
        let mac = self.mac(secure_rorg, &payload, rlc);
        let rlc_bytes = if self.slf.rlc_transmitted() {
            encode_rlc(rlc, self.slf.rlc_size())
        } else {
            Vec::new()
        };

        let size = payload.len() + rlc_bytes.len() + mac.len();
        let mut secure = Packet::radio(Rorg::SecEncaps, size);
        secure.copy_radio_envelope(plain);
        let user = secure.radio_user_data_mut();
        let (head, tail) = user.split_at_mut(payload.len());
        head.copy_from_slice(&payload);
        let (rlc_out, mac_out) = tail.split_at_mut(rlc_bytes.len());
        rlc_out.copy_from_slice(&rlc_bytes);
        mac_out.copy_from_slice(&mac);
        secure.finalize(false);

        self.advance_past(rlc);
        Ok(secure)
    }

    /// Authenticate and decrypt a SEC / SEC_ENCAPS telegram.
    ///
    /// The stored counter is tried first, then the following values within
    /// the window. On success the counter moves past the verified value and
    /// a plain telegram is returned; on failure nothing changes.
    pub fn open(
        &mut self,
        secure: &Packet,
        window: &ReplayWindow,
        ptm: bool,
    ) -> Result<Packet, CryptoError> {
        let rorg = secure.rorg();
        if !rorg.is_secure() {
            return Err(CryptoError::NotSecure(rorg.as_byte()));
        }
        let encapsulated = rorg == Rorg::SecEncaps;
        let user = secure.radio_user_data();
        let trailer = self.slf.trailer_size();
        let minimum = trailer + usize::from(encapsulated);
        if user.len() < minimum {
            return Err(CryptoError::TooShort {
                expected: minimum,
                actual: user.len(),
            });
        }
        let (payload, rest) = user.split_at(user.len() - trailer);
        let (rlc_bytes, mac) = rest.split_at(rest.len() - self.slf.mac_size());
        let rlc_size = self.slf.rlc_size();

        let verified = if self.slf.rlc_transmitted() {
            let candidate = decode_rlc(rlc_bytes);
            if !window.accepts(self.rlc, candidate, rlc_size) {
                let distance = ReplayWindow::distance(self.rlc, candidate, rlc_size);
                debug!(
                    rlc = candidate,
                    stored = self.rlc,
                    distance,
                    "rolling counter outside window"
                );
                return Err(CryptoError::ReplayRejected { distance });
            }
            self.mac_matches(rorg.as_byte(), payload, candidate, mac)
                .then_some(candidate)
        } else {
            window
                .candidates(self.rlc, rlc_size)
                .find(|&candidate| self.mac_matches(rorg.as_byte(), payload, candidate, mac))
        };
        let Some(rlc) = verified else {
            return Err(CryptoError::AuthenticationFailed);
        };
        trace!(
            rlc,
            skipped = ReplayWindow::distance(self.rlc, rlc, rlc_size),
            "telegram authenticated"
        );

        let mut plain_bytes = payload.to_vec();
        self.apply_cipher(rlc, &mut plain_bytes);
        self.advance_past(rlc);

        let (plain_rorg, body) = if encapsulated {
            match plain_bytes.split_first() {
                Some((&first, body)) => (Rorg::from_byte(first), body),
                None => {
                    return Err(CryptoError::TooShort {
                        expected: 1,
                        actual: 0,
                    });
                }
            }
        } else if ptm {
            (Rorg::Rps, &plain_bytes[..])
        } else {
            (Rorg::Vld, &plain_bytes[..])
        };

        let mut plain = Packet::radio(plain_rorg, body.len());
        plain.copy_radio_envelope(secure);
        plain.set_radio_user_data(body);
        plain.set_security_level(self.security_level());
        plain.finalize(false);
        Ok(plain)
    }
}

/// Who may complete a teach-in right now.
#[derive(Debug, Clone, Copy)]
pub struct TeachInPolicy {
    /// Learn-in is currently allowed.
    pub learn_in_allowed: bool,
    /// Sender address for response telegrams.
    pub gateway: Address,
}

/// Result of feeding one teach-in segment.
#[derive(Debug)]
pub enum TeachInOutcome {
    /// More segments are expected.
    Incomplete,
    /// All segments arrived and the context is established.
    Complete {
        /// The context was not established before.
        newly_established: bool,
        /// Response teach-in for bidirectional devices.
        response: Option<Vec<Packet>>,
    },
}

/// Counters as of the last persisted save.
#[derive(Debug, Clone, Copy)]
struct SavePoint {
    inbound: u32,
    outbound: Option<u32>,
    at: Instant,
}

/// Secure state for one device address.
#[derive(Debug)]
pub struct SecureContext {
    address: Address,
    teach_in_info: SecureTeachInInfo,
    inbound: Option<RollingChannel>,
    outbound: Option<RollingChannel>,
    assembly: TeachInAssembly,
    saved: Option<SavePoint>,
}

impl SecureContext {
    /// Empty context awaiting teach-in.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            teach_in_info: SecureTeachInInfo(0),
            inbound: None,
            outbound: None,
            assembly: TeachInAssembly::default(),
            saved: None,
        }
    }

    /// Rebuild an established context from persisted parts.
    pub fn restore(
        address: Address,
        teach_in_info: u8,
        inbound: RollingChannel,
        outbound: Option<RollingChannel>,
    ) -> Self {
        Self {
            address,
            teach_in_info: SecureTeachInInfo(teach_in_info).without_segment(),
            inbound: Some(inbound),
            outbound,
            assembly: TeachInAssembly::default(),
            saved: None,
        }
    }

    /// Device address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether key material from a complete teach-in is present.
    pub fn is_established(&self) -> bool {
        self.inbound.is_some()
    }

    /// Whether a teach-in is partially received.
    pub fn is_pending(&self) -> bool {
        self.assembly.is_pending()
    }

    /// Device is a push-button module.
    pub fn is_ptm(&self) -> bool {
        self.teach_in_info.is_ptm()
    }

    /// Teach-in info byte captured at teach-in.
    pub fn teach_in_info(&self) -> SecureTeachInInfo {
        self.teach_in_info
    }

    /// Device to gateway channel.
    pub fn inbound(&self) -> Option<&RollingChannel> {
        self.inbound.as_ref()
    }

    /// Gateway to device channel.
    pub fn outbound(&self) -> Option<&RollingChannel> {
        self.outbound.as_ref()
    }

    /// When the context was last persisted.
    pub fn last_saved_at(&self) -> Option<Instant> {
        self.saved.map(|s| s.at)
    }

    /// Largest counter advance (either direction) since the last save.
    ///
    /// `None` when never saved since establishment.
    pub fn unsaved_advance(&self) -> Option<u32> {
        let saved = self.saved?;
        let inbound = self.inbound.as_ref().map_or(0, |c| {
            ReplayWindow::distance(saved.inbound, c.rlc(), c.slf().rlc_size())
        });
        let outbound = match (&self.outbound, saved.outbound) {
            (Some(c), Some(at)) => ReplayWindow::distance(at, c.rlc(), c.slf().rlc_size()),
            (Some(_), None) => return None,
            _ => 0,
        };
        Some(inbound.max(outbound))
    }

    pub(crate) fn mark_saved(&mut self, at: Instant) {
        self.saved = Some(SavePoint {
            inbound: self.inbound.as_ref().map_or(0, RollingChannel::rlc),
            outbound: self.outbound.as_ref().map(RollingChannel::rlc),
            at,
        });
    }

    /// Install an outbound channel for sending to this device.
    pub fn set_outbound(&mut self, channel: RollingChannel) {
        self.outbound = Some(channel);
    }

    /// Feed one SEC_TI telegram.
    ///
    /// A new key is only taken while learn-in is allowed. Outside learning an
    /// established context accepts a repeated teach-in with the same key as
    /// a counter refresh, as long as the counter does not move backwards, and
    /// refuses anything else.
    pub fn teach_in(
        &mut self,
        packet: &Packet,
        policy: TeachInPolicy,
    ) -> Result<TeachInOutcome, CryptoError> {
        if !self.is_established() && !policy.learn_in_allowed {
            self.assembly.reset();
            return Err(CryptoError::LearnInNotAllowed);
        }
        let segment = TeachInSegment::parse(packet)?;
        let Some(body) = self.assembly.push(segment)? else {
            return Ok(TeachInOutcome::Incomplete);
        };

        let newly_established = match &mut self.inbound {
            Some(channel) if channel.keys().key() == body.key() => {
                let rlc_size = channel.slf().rlc_size();
                if !policy.learn_in_allowed
                    && !ReplayWindow::is_forward(channel.rlc(), body.rlc(), rlc_size)
                {
                    let distance = ReplayWindow::distance(channel.rlc(), body.rlc(), rlc_size);
                    debug!(
                        address = %self.address,
                        rlc = body.rlc(),
                        stored = channel.rlc(),
                        "refusing counter rewind outside learn mode"
                    );
                    return Err(CryptoError::ReplayRejected { distance });
                }
                debug!(
                    address = %self.address,
                    rlc = body.rlc(),
                    "secure teach-in refreshed counter"
                );
                channel.set_rlc(body.rlc());
                false
            }
            Some(_) if !policy.learn_in_allowed => {
                debug!(address = %self.address, "refusing key change outside learn mode");
                return Err(CryptoError::KeyChangeRefused);
            }
            current => {
                let was_established = current.is_some();
                *current = Some(RollingChannel::new(body.slf(), *body.key(), body.rlc()));
                self.teach_in_info = body.info();
                debug!(
                    address = %self.address,
                    slf = body.slf().as_byte(),
                    ptm = body.info().is_ptm(),
                    "secure context established"
                );
                !was_established
            }
        };

        let response = if body.info().is_bidirectional() {
            Some(self.build_response(body.slf(), policy.gateway))
        } else {
            None
        };
        Ok(TeachInOutcome::Complete {
            newly_established,
            response,
        })
    }

    fn build_response(&mut self, slf: SecurityLevelFormat, gateway: Address) -> Vec<Packet> {
        let (mut key, rlc) = random_key_and_rlc(slf);
        let packets = build_teach_in(
            SecureTeachInInfo::new(0, 0, false, 0),
            slf,
            rlc,
            &key,
            gateway,
            self.address,
        );
        self.outbound = Some(RollingChannel::new(slf, key, rlc));
        key.zeroize();
        packets
    }

    /// Authenticate and decrypt an incoming secure telegram.
    pub fn unpack(
        &mut self,
        packet: &Packet,
        window: &ReplayWindow,
    ) -> Result<Packet, CryptoError> {
        let ptm = self.is_ptm();
        let channel = self.inbound.as_mut().ok_or(CryptoError::NotEstablished)?;
        channel.open(packet, window, ptm)
    }

    /// Secure an outgoing telegram for this device.
    pub fn pack(&mut self, plain: &Packet) -> Result<Packet, CryptoError> {
        let channel = self.outbound.as_mut().ok_or(CryptoError::NoOutboundKey)?;
        channel.seal(plain)
    }
}
