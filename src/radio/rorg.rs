//! Radio organisation (RORG) tags.

/// Radio organisation of a telegram.
///
/// The protocol defines a closed set; tags outside it on a radio packet map
/// to [`Rorg::Unsupported`], non-radio packets to [`Rorg::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rorg {
    /// Repeated switch communication (RPS), simple switch telegrams.
    Rps,
    /// One byte communication (1BS).
    OneBs,
    /// Four byte communication (4BS).
    FourBs,
    /// Variable length data (VLD).
    Vld,
    /// Manufacturer specific communication (MSC).
    Msc,
    /// Addressing destination telegram (ADT).
    Adt,
    /// Universal teach-in (UTE).
    Ute,
    /// Smart-ack learn request.
    SmLrnReq,
    /// Smart-ack learn answer.
    SmLrnAns,
    /// Smart-ack reclaim.
    SmRec,
    /// Remote management (SYS_EX).
    SysEx,
    /// Secure telegram without RORG encapsulation.
    Sec,
    /// Secure telegram with RORG encapsulation.
    SecEncaps,
    /// Secure teach-in.
    SecTi,
    /// Radio packet with a tag outside the known set.
    Unsupported(u8),
    /// Not a radio packet.
    Invalid,
}

impl Rorg {
    /// Classify a tag byte from a radio packet.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0xF6 => Self::Rps,
            0xD5 => Self::OneBs,
            0xA5 => Self::FourBs,
            0xD2 => Self::Vld,
            0xD1 => Self::Msc,
            0xA6 => Self::Adt,
            0xD4 => Self::Ute,
            0xC6 => Self::SmLrnReq,
            0xC7 => Self::SmLrnAns,
            0xA7 => Self::SmRec,
            0xC5 => Self::SysEx,
            0x30 => Self::Sec,
            0x31 => Self::SecEncaps,
            0x35 => Self::SecTi,
            other => Self::Unsupported(other),
        }
    }

    /// Wire byte. [`Rorg::Invalid`] maps to 0x00.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Rps => 0xF6,
            Self::OneBs => 0xD5,
            Self::FourBs => 0xA5,
            Self::Vld => 0xD2,
            Self::Msc => 0xD1,
            Self::Adt => 0xA6,
            Self::Ute => 0xD4,
            Self::SmLrnReq => 0xC6,
            Self::SmLrnAns => 0xC7,
            Self::SmRec => 0xA7,
            Self::SysEx => 0xC5,
            Self::Sec => 0x30,
            Self::SecEncaps => 0x31,
            Self::SecTi => 0x35,
            Self::Unsupported(b) => b,
            Self::Invalid => 0x00,
        }
    }

    /// Secure data telegram (plain or encapsulated).
    pub fn is_secure(self) -> bool {
        matches!(self, Self::Sec | Self::SecEncaps)
    }

    /// Teach-in is signalled implicitly rather than by an explicit learn bit.
    pub fn has_implicit_teach_in(self) -> bool {
        matches!(self, Self::Rps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rorg_roundtrip() {
        for b in 0u8..=255 {
            assert_eq!(Rorg::from_byte(b).as_byte(), b);
        }
    }

    #[test]
    fn test_rorg_classes() {
        assert!(Rorg::Sec.is_secure());
        assert!(Rorg::SecEncaps.is_secure());
        assert!(!Rorg::SecTi.is_secure());
        assert!(Rorg::Rps.has_implicit_teach_in());
        assert!(!Rorg::FourBs.has_implicit_teach_in());
        assert_eq!(Rorg::from_byte(0x42), Rorg::Unsupported(0x42));
    }
}
