//! Dallas (now Maxim) iButton 8-bit CRC.
//!
//! Polynomial `x^8 + x^5 + x^4 + 1`, processed LSB first, hence the reflected
//! constant `0x8C`. Initial value is `0`, there is no final xor. This must
//! stay bit-exact with the microcontroller on the other end of the line.

/// Reflected CRC-8/MAXIM polynomial.
pub const POLYNOMIAL: u8 = 0x8C;

/// Fold one byte into the running `crc`, one bit at a time.
pub fn crc8_update(crc: u8, byte: u8) -> u8 {
    let mut tmp = crc ^ byte;
    for _ in 0..8 {
        if tmp & 0x01 == 1 {
            tmp = (tmp >> 1) ^ POLYNOMIAL;
        } else {
            tmp >>= 1;
        }
    }
    tmp
}

/// CRC of a whole buffer.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, b| crc8_update(crc, *b))
}

/// Incremental CRC accumulator.
///
/// The result does not depend on how the input is split across calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Crc8 {
    value: u8,
}

impl Crc8 {
    pub fn new() -> Self {
        Crc8::default()
    }

    pub fn update(&mut self, byte: u8) {
        self.value = crc8_update(self.value, byte);
    }

    pub fn update_all(&mut self, data: &[u8]) {
        for b in data {
            self.update(*b);
        }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Lookup table equivalent, built the usual way from the bit-serial step.
    fn table() -> [u8; 256] {
        let mut table = [0u8; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = i as u8;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ POLYNOMIAL
                } else {
                    crc >> 1
                };
            }
            *entry = crc;
        }
        table
    }

    fn crc8_table(data: &[u8]) -> u8 {
        let table = table();
        data.iter().fold(0u8, |crc, b| table[(crc ^ b) as usize])
    }

    #[test]
    fn reference_vectors() {
        // CRC-8/MAXIM check value.
        assert_eq!(crc8(b"123456789"), 0xA1);
        assert_eq!(crc8(&[]), 0x00);
        assert_eq!(crc8(&[0x00, 0x00, 0x00, 0x00]), 0x00);
        // Header + payload of channel 1, "hi!".
        assert_eq!(crc8(&[0x00, 0x01, 0x00, 0x03, b'h', b'i', b'!']), 0xAA);
        // Header + payload of channel 2, "ok".
        assert_eq!(crc8(&[0x00, 0x02, 0x00, 0x02, b'o', b'k']), 0xCB);
    }

    #[test]
    fn table_matches_reference_vectors() {
        assert_eq!(crc8_table(b"123456789"), 0xA1);
        assert_eq!(crc8_table(&[0x00, 0x02, 0x00, 0x02, b'o', b'k']), 0xCB);
    }

    #[test]
    fn accumulator_matches_one_shot() {
        let mut acc = Crc8::new();
        acc.update_all(b"1234");
        acc.update_all(b"56789");
        assert_eq!(acc.value(), 0xA1);
        acc.reset();
        assert_eq!(acc.value(), 0);
    }

    proptest! {
        #[test]
        fn bit_serial_equals_table_driven(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert_eq!(crc8(&data), crc8_table(&data));
        }

        #[test]
        fn independent_of_split_point(data in proptest::collection::vec(any::<u8>(), 0..256), split in 0usize..256) {
            let split = split.min(data.len());
            let mut acc = Crc8::new();
            acc.update_all(&data[..split]);
            acc.update_all(&data[split..]);
            prop_assert_eq!(acc.value(), crc8(&data));
        }
    }
}
