//! Protocol confirmations sent back to devices during teach-in.
//!
//! Devices give up on a teach-in handshake quickly, so these packets are
//! queued before the learn event is reported.

use crate::core::{Address, RET_OK, SA_CONFIRM_LEARN};
use crate::radio::{Eep, Rorg};
use crate::transport::{Packet, PacketType};

const UTE_USER_DATA_LEN: usize = 7;
const UTE_COMMAND_QUERY: u8 = 0x0;
const UTE_COMMAND_RESPONSE: u8 = 0x1;
const UTE_BIDIRECTIONAL: u8 = 0x80;
const UTE_NO_RESPONSE: u8 = 0x40;

/// What a UTE teach-in query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UteRequest {
    /// Pair.
    TeachIn,
    /// Unpair.
    Deletion,
    /// Pair if unknown, unpair if known.
    Either,
}

/// Header of a UTE teach-in query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UteQuery {
    /// Device wants bidirectional communication.
    pub bidirectional: bool,
    /// Device waits for a response.
    pub response_expected: bool,
    /// Requested action.
    pub request: UteRequest,
    /// Number of channels to teach in (0xFF = all).
    pub channels: u8,
}

impl UteQuery {
    /// Parse the query header of a UTE telegram.
    pub fn parse(packet: &Packet) -> Option<Self> {
        if packet.rorg() != Rorg::Ute {
            return None;
        }
        let user = packet.radio_user_data();
        if user.len() < UTE_USER_DATA_LEN || user[0] & 0x0F != UTE_COMMAND_QUERY {
            return None;
        }
        let request = match (user[0] >> 4) & 0x03 {
            0b00 => UteRequest::TeachIn,
            0b01 => UteRequest::Deletion,
            _ => UteRequest::Either,
        };
        Some(Self {
            bidirectional: user[0] & UTE_BIDIRECTIONAL != 0,
            response_expected: user[0] & UTE_NO_RESPONSE == 0,
            request,
            channels: user[1],
        })
    }

    /// Whether the query permits pairing.
    pub fn allows_learn_in(&self) -> bool {
        self.request != UteRequest::Deletion
    }

    /// Whether the query permits unpairing.
    pub fn allows_learn_out(&self) -> bool {
        self.request != UteRequest::TeachIn
    }
}

/// Result code of a UTE teach-in response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UteResult {
    /// Request not accepted.
    Refused = 0b00,
    /// Teach-in accepted.
    AcceptedIn = 0b01,
    /// Deletion accepted.
    AcceptedOut = 0b10,
    /// Profile not supported.
    EepNotSupported = 0b11,
}

/// Build the UTE response to `query`, addressed to its sender.
pub fn ute_response(query: &Packet, result: UteResult, gateway: Address) -> Packet {
    let mut response = Packet::radio(Rorg::Ute, UTE_USER_DATA_LEN);
    let user = query.radio_user_data();
    if user.len() >= UTE_USER_DATA_LEN {
        response.set_radio_user_data(&user[..UTE_USER_DATA_LEN]);
    }
    let bidirectional = user.first().map_or(0, |b| b & UTE_BIDIRECTIONAL);
    response.radio_user_data_mut()[0] =
        bidirectional | ((result as u8) << 4) | UTE_COMMAND_RESPONSE;
    response.set_sender(gateway);
    response.set_destination(query.sender());
    response.finalize(false);
    response
}

/// Confirm code answering a smart-ack learn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmartAckConfirm {
    /// Learned in.
    LearnIn = 0x00,
    /// Discarded: profile not accepted.
    EepNotAccepted = 0x11,
    /// Discarded: postmaster has no room.
    PostmasterFull = 0x12,
    /// Discarded: controller has no room.
    ControllerFull = 0x13,
    /// Discarded: signal too weak.
    RssiTooLow = 0x14,
    /// Learned out.
    LearnOut = 0x20,
}

/// SA_CONFIRM_LEARN event from the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmartAckLearnRequest {
    /// Postmaster priority flags.
    pub priority: u8,
    /// Manufacturer code.
    pub manufacturer: u16,
    /// Announced profile.
    pub eep: Eep,
    /// Signal strength of the request.
    pub dbm: i16,
    /// Candidate postmaster address.
    pub postmaster: Address,
    /// The sensor asking to be learned.
    pub client: Address,
    /// Repeater hops.
    pub hop_count: u8,
}

impl SmartAckLearnRequest {
    const LEN: usize = 17;

    /// Parse an EVENT packet carrying SA_CONFIRM_LEARN.
    pub fn parse(packet: &Packet) -> Option<Self> {
        if packet.packet_type() != Some(PacketType::Event) {
            return None;
        }
        let d = packet.data();
        if d.len() < Self::LEN || d[0] != SA_CONFIRM_LEARN {
            return None;
        }
        Some(Self {
            priority: d[1],
            manufacturer: (((d[2] & 0x07) as u16) << 8) | d[3] as u16,
            eep: Eep::new(d[4], d[5], d[6]),
            dbm: -(d[7] as i16),
            postmaster: Address::from_bytes([d[8], d[9], d[10], d[11]]),
            client: Address::from_bytes([d[12], d[13], d[14], d[15]]),
            hop_count: d[16],
        })
    }
}

/// RESPONSE to SA_CONFIRM_LEARN: `[RET_OK][response time ms (2)][confirm code]`.
pub fn smart_ack_confirm(code: SmartAckConfirm, response_time_ms: u16) -> Packet {
    let mut packet = Packet::with_type(PacketType::Response, 4, 0);
    let data = packet.data_mut();
    data[0] = RET_OK;
    data[1..3].copy_from_slice(&response_time_ms.to_be_bytes());
    data[3] = code as u8;
    packet.finalize(false);
    packet
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ute_query(db6: u8, eep: Eep, sender: Address) -> Packet {
        let mut p = Packet::radio(Rorg::Ute, UTE_USER_DATA_LEN);
        p.set_radio_user_data(&[db6, 0xFF, 0x0B, 0x00, eep.typ, eep.func, eep.rorg]);
        p.set_sender(sender);
        p.finalize(false);
        p
    }

    pub(crate) fn smart_ack_event(eep: Eep, rssi: u8, client: Address) -> Packet {
        let mut p = Packet::with_type(PacketType::Event, 17, 0);
        let d = p.data_mut();
        d[0] = SA_CONFIRM_LEARN;
        d[2] = 0x00;
        d[3] = 0x0B;
        d[4] = eep.rorg;
        d[5] = eep.func;
        d[6] = eep.typ;
        d[7] = rssi;
        d[12..16].copy_from_slice(&client.to_bytes());
        d[16] = 1;
        p.finalize(false);
        p
    }

    #[test]
    fn test_parse_ute_query() {
        let eep = Eep::new(0xD2, 0x01, 0x12);
        let q = UteQuery::parse(&ute_query(0x80, eep, Address(1))).unwrap();
        assert!(q.bidirectional);
        assert!(q.response_expected);
        assert_eq!(q.request, UteRequest::TeachIn);
        assert!(q.allows_learn_in() && !q.allows_learn_out());

        let q = UteQuery::parse(&ute_query(0x60, eep, Address(1))).unwrap();
        assert!(!q.response_expected);
        assert_eq!(q.request, UteRequest::Either);

        // Response command nibble is not a query.
        assert!(UteQuery::parse(&ute_query(0x91, eep, Address(1))).is_none());
    }

    #[test]
    fn test_ute_response() {
        let eep = Eep::new(0xD2, 0x01, 0x12);
        let query = ute_query(0x80, eep, Address(0x0102_0304));
        let resp = ute_response(&query, UteResult::AcceptedIn, Address(0xFF80_0000));
        assert_eq!(resp.rorg(), Rorg::Ute);
        assert_eq!(
            resp.radio_user_data(),
            &[0x91, 0xFF, 0x0B, 0x00, 0x12, 0x01, 0xD2]
        );
        assert_eq!(resp.sender(), Address(0xFF80_0000));
        assert_eq!(resp.destination(), Address(0x0102_0304));

        let resp = ute_response(&query, UteResult::EepNotSupported, Address(0));
        assert_eq!(resp.radio_user_data()[0], 0xB1);
    }

    #[test]
    fn test_smart_ack_roundtrip() {
        let eep = Eep::new(0xA5, 0x02, 0x05);
        let req = SmartAckLearnRequest::parse(&smart_ack_event(eep, 60, Address(0xAABB_CCDD)))
            .unwrap();
        assert_eq!(req.eep, eep);
        assert_eq!(req.manufacturer, 0x00B);
        assert_eq!(req.dbm, -60);
        assert_eq!(req.client, Address(0xAABB_CCDD));

        let resp = smart_ack_confirm(SmartAckConfirm::LearnOut, 150);
        assert_eq!(resp.packet_type(), Some(PacketType::Response));
        assert_eq!(resp.data(), &[0x00, 0x00, 0x96, 0x20]);
    }
}
