//! Sideband message integrity checks.
//!
//! Both checks are bit-serial CRCs fed MSB first, followed by a flush of zero bits the width of
//! the register, exactly as the DisplayPort 1.2 sideband message format specifies:
//! - header: CRC-4, polynomial `x^4 + x + 1` (0x13), over every header nibble but the last;
//! - body: CRC-8, polynomial `x^8 + x^7 + x^6 + x^4 + x^2 + 1` (0xD5), over the chunk body.

const HEADER_POLY: u16 = 0x13;
const BODY_POLY: u16 = 0x1D5;

fn bit_at(data: &[u8], bit: usize) -> u16 {
    ((data[bit / 8] >> (7 - (bit % 8))) & 1) as u16
}

/// CRC-4 over the first `num_nibbles` nibbles of `data`.
pub fn header_crc4(data: &[u8], num_nibbles: usize) -> u8 {
    let bits = (num_nibbles * 4).min(data.len() * 8);
    let mut rem: u16 = 0;
    for bit in 0..bits {
        rem = (rem << 1) | bit_at(data, bit);
        if rem & 0x10 != 0 {
            rem ^= HEADER_POLY;
        }
    }
    for _ in 0..4 {
        rem <<= 1;
        if rem & 0x10 != 0 {
            rem ^= HEADER_POLY;
        }
    }
    (rem & 0xF) as u8
}

/// CRC-8 over every byte of `data`.
pub fn body_crc8(data: &[u8]) -> u8 {
    let mut rem: u16 = 0;
    for bit in 0..data.len() * 8 {
        rem = (rem << 1) | bit_at(data, bit);
        if rem & 0x100 != 0 {
            rem ^= BODY_POLY;
        }
    }
    for _ in 0..8 {
        rem <<= 1;
        if rem & 0x100 != 0 {
            rem ^= BODY_POLY;
        }
    }
    (rem & 0xFF) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_input_has_zero_crc() {
        assert_eq!(header_crc4(&[0, 0, 0], 5), 0);
        assert_eq!(body_crc8(&[0; 8]), 0);
    }

    #[test]
    fn appending_crc8_yields_zero_remainder() {
        // Property of a CRC with a zero flush: the message followed by its CRC divides evenly.
        let body = [0x20u8, 0x10, 0x00, 0x00, 0x0F];
        let mut framed = body.to_vec();
        framed.push(body_crc8(&body));
        assert_eq!(body_crc8(&framed[..framed.len() - 1]), framed[framed.len() - 1]);

        let mut rem: u16 = 0;
        for bit in 0..framed.len() * 8 {
            rem = (rem << 1) | bit_at(&framed, bit);
            if rem & 0x100 != 0 {
                rem ^= BODY_POLY;
            }
        }
        assert_eq!(rem & 0xFF, 0);
    }

    #[test]
    fn single_bit_flips_are_detected() {
        let body = [0x01u8, 0x02, 0x03, 0x04];
        let crc = body_crc8(&body);
        for bit in 0..32 {
            let mut flipped = body;
            flipped[bit / 8] ^= 0x80 >> (bit % 8);
            assert_ne!(body_crc8(&flipped), crc, "bit {bit}");
        }

        let hdr = [0x10u8, 0x02, 0xC0];
        let crc4 = header_crc4(&hdr, 5);
        for bit in 0..20 {
            let mut flipped = hdr;
            flipped[bit / 8] ^= 0x80 >> (bit % 8);
            assert_ne!(header_crc4(&flipped, 5), crc4, "bit {bit}");
        }
    }

    #[test]
    fn header_crc_ignores_trailing_nibble() {
        assert_eq!(header_crc4(&[0x10, 0x02, 0xC0], 5), header_crc4(&[0x10, 0x02, 0xCF], 5));
    }
}
