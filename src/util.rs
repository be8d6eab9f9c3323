use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};

pub(crate) const PADDING_MULTIPLE: usize = 4;

pub(crate) fn get_padding_size(len: usize) -> usize {
    (PADDING_MULTIPLE - (len % PADDING_MULTIPLE)) % PADDING_MULTIPLE
}

pub(crate) const ISCSI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Zeroed checksum field, hashed in place of bytes 8..12 of the common header.
pub(crate) static FOUR_ZEROES: Bytes = Bytes::from_static(&[0, 0, 0, 0]);

/// Computes the packet checksum without copying the input.
pub(crate) fn generate_packet_checksum(raw: &Bytes) -> u32 {
    let mut digest = ISCSI_CRC.digest();
    digest.update(&raw[0..8]);
    digest.update(&FOUR_ZEROES[..]);
    digest.update(&raw[12..]);
    digest.finalize()
}

/// Serial Number Arithmetic (RFC 1982).
///
/// `a < b` iff `a != b` and `(b - a) mod 2^N < 2^(N-1)`.
#[inline]
pub(crate) fn sna32_lt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && i2 - i1 < 1 << 31) || (i1 > i2 && i1 - i2 > 1 << 31)
}

#[inline]
pub(crate) fn sna32_lte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32_lt(i1, i2)
}

#[inline]
pub(crate) fn sna32_gt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && (i2 - i1) >= 1 << 31) || (i1 > i2 && (i1 - i2) <= 1 << 31)
}

#[inline]
pub(crate) fn sna32_gte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32_gt(i1, i2)
}

#[inline]
pub(crate) fn sna16_lt(i1: u16, i2: u16) -> bool {
    (i1 < i2 && (i2 - i1) < 1 << 15) || (i1 > i2 && (i1 - i2) > 1 << 15)
}

#[inline]
pub(crate) fn sna16_lte(i1: u16, i2: u16) -> bool {
    i1 == i2 || sna16_lt(i1, i2)
}

#[inline]
pub(crate) fn sna16_gt(i1: u16, i2: u16) -> bool {
    (i1 < i2 && (i2 - i1) >= 1 << 15) || (i1 > i2 && (i1 - i2) <= 1 << 15)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_serial_number_arithmetic_32bit() {
        const INTERVAL: u32 = ((1u64 << 32) / 16) as u32;
        const MAX_FORWARD_DISTANCE: u32 = 1 << 30;
        const MAX_BACKWARD_DISTANCE: u32 = 1 << 31;

        for i in 0..16u32 {
            let s1 = i.wrapping_mul(INTERVAL);
            let s2f = s1.wrapping_add(MAX_FORWARD_DISTANCE);
            let s2b = s1.wrapping_add(MAX_BACKWARD_DISTANCE);

            assert!(sna32_lt(s1, s2f), "s1 < s2 should be true: s1={s1} s2={s2f}");
            assert!(
                !sna32_lt(s1, s2b),
                "s1 < s2 should be false: s1={s1} s2={s2b}"
            );
            assert!(
                !sna32_gt(s1, s2f),
                "s1 > s2 should be false: s1={s1} s2={s2f}"
            );
            assert!(sna32_gt(s1, s2b), "s1 > s2 should be true: s1={s1} s2={s2b}");

            assert!(sna32_lte(s1, s1), "s1 == s1 should be true: s1={s1}");
            assert!(sna32_gte(s1, s1), "s1 == s1 should be true: s1={s1}");
            assert!(
                sna32_lt(s1.wrapping_sub(1), s1),
                "s1-1 < s1 should be true: s1={s1}"
            );
            assert!(
                sna32_gt(s1.wrapping_add(1), s1),
                "s1+1 > s1 should be true: s1={s1}"
            );
        }
    }

    #[test]
    fn test_serial_number_arithmetic_16bit() {
        const INTERVAL: u16 = ((1u32 << 16) / 16) as u16;
        const MAX_FORWARD_DISTANCE: u16 = 1 << 14;
        const MAX_BACKWARD_DISTANCE: u16 = 1 << 15;

        for i in 0..16u16 {
            let s1 = i.wrapping_mul(INTERVAL);
            let s2f = s1.wrapping_add(MAX_FORWARD_DISTANCE);
            let s2b = s1.wrapping_add(MAX_BACKWARD_DISTANCE);

            assert!(sna16_lt(s1, s2f), "s1 < s2 should be true: s1={s1} s2={s2f}");
            assert!(
                !sna16_lt(s1, s2b),
                "s1 < s2 should be false: s1={s1} s2={s2b}"
            );
            assert!(
                !sna16_gt(s1, s2f),
                "s1 > s2 should be false: s1={s1} s2={s2f}"
            );
            assert!(sna16_gt(s1, s2b), "s1 > s2 should be true: s1={s1} s2={s2b}");

            assert!(sna16_lte(s1, s1), "s1 == s1 should be true: s1={s1}");
            assert!(
                sna16_lt(s1.wrapping_sub(1), s1),
                "s1-1 < s1 should be true: s1={s1}"
            );
        }
    }

    #[test]
    fn test_padding() {
        assert_eq!(get_padding_size(0), 0);
        assert_eq!(get_padding_size(1), 3);
        assert_eq!(get_padding_size(2), 2);
        assert_eq!(get_padding_size(3), 1);
        assert_eq!(get_padding_size(4), 0);
    }
}
