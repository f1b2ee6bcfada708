//! Kismet frame checksum
//!
//! Kismet protects v1 external frames with its own Adler-32 flavour. It is not
//! interchangeable with zlib's adler32: bytes are consumed in 4-byte strides
//! with weighted sums, and the remaining tail is folded in one byte at a time.

/// Per-byte offset in Kismet's algorithm. Zero for every frame on the wire.
const CHAR_OFFSET: u32 = 0;

/// Compute the Kismet checksum over `data`.
///
/// Inputs of four bytes or fewer produce 0.
pub fn kismet_adler32(data: &[u8]) -> u32 {
    let len = data.len();
    if len <= 4 {
        return 0;
    }

    let mut s1: u32 = 0;
    let mut s2: u32 = 0;

    let mut i = 0;
    while i < len - 4 {
        let (b0, b1, b2, b3) = (
            data[i] as u32,
            data[i + 1] as u32,
            data[i + 2] as u32,
            data[i + 3] as u32,
        );

        s2 = s2
            .wrapping_add(4u32.wrapping_mul(s1.wrapping_add(b0)))
            .wrapping_add(3 * b1)
            .wrapping_add(2 * b2)
            .wrapping_add(b3)
            .wrapping_add(10 * CHAR_OFFSET);
        s1 = s1
            .wrapping_add(b0 + b1 + b2 + b3)
            .wrapping_add(4 * CHAR_OFFSET);

        i += 4;
    }

    // Tail starts right after the last stride
    for &byte in &data[i..] {
        s1 = s1.wrapping_add(byte as u32 + CHAR_OFFSET);
        s2 = s2.wrapping_add(s1);
    }

    (s1 & 0xffff).wrapping_add(s2 << 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_input_is_zero() {
        assert_eq!(kismet_adler32(&[]), 0);
        assert_eq!(kismet_adler32(&[0x01]), 0);
        assert_eq!(kismet_adler32(&[0x01, 0x02, 0x03]), 0);
        // Exactly one stride is never summed
        assert_eq!(kismet_adler32(&[0x00, 0x01, 0x02, 0x03]), 0);
    }

    #[test]
    fn test_golden_vectors() {
        let one_to_nine: Vec<u8> = (1..=9).collect();
        assert_eq!(kismet_adler32(&one_to_nine), 0x00a5_002d);

        // Eight bytes: one stride, then a four-byte tail
        let one_to_eight: Vec<u8> = (1..=8).collect();
        assert_eq!(kismet_adler32(&one_to_eight), 0x0078_0024);

        assert_eq!(kismet_adler32(&[0xff; 64]), 0x17e0_3fc0);
    }

    #[test]
    fn test_sensitive_to_order() {
        let a = kismet_adler32(b"KDSDATAREPORT");
        let b = kismet_adler32(b"TROPERATADSDK");
        assert_ne!(a, b);
    }
}
