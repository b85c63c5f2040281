//! ESP3 CRC8 (polynomial x^8 + x^2 + x + 1, initial value 0).

const POLYNOMIAL: u8 = 0x07;

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC8_TABLE: [u8; 256] = build_table();

/// Fold one byte into a running CRC.
#[inline]
pub fn crc8_update(crc: u8, byte: u8) -> u8 {
    CRC8_TABLE[(crc ^ byte) as usize]
}

/// CRC8 over a byte slice.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, &b| crc8_update(crc, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_head() {
        assert_eq!(&CRC8_TABLE[..4], &[0x00, 0x07, 0x0E, 0x09]);
    }

    #[test]
    fn test_known_vectors() {
        // CO_RD_VERSION: 55 00 01 00 05 70 03 09
        assert_eq!(crc8(&[0x00, 0x01, 0x00, 0x05]), 0x70);
        assert_eq!(crc8(&[0x03]), 0x09);
        assert_eq!(crc8(&[]), 0x00);
    }
}
