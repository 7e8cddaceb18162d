//! Variable-width bit fields packed MSB-first into byte buffers.
//!
//! Bit 0 of a record is the most significant bit of its first byte, so the
//! packed layout is identical on every host regardless of native byte order.
//! Floating point values are stored as scaled integers through
//! [`ScaledField`].

use crate::error::Result;
use crate::Error;

/// Largest value representable in `bits` bits.
pub fn max_value(bits: u8) -> u64 {
    match bits {
        0 => 0,
        64..=u8::MAX => u64::MAX,
        b => (1u64 << b) - 1,
    }
}

/// Number of bits needed to hold every value in `0..=max`.
pub fn bits_for(max: u64) -> u8 {
    (64 - max.leading_zeros()) as u8
}

/// Writes the low `bits` bits of `value` at bit offset `start`.
///
/// Width 0 stores nothing. Values wider than the field are rejected, never truncated.
pub fn pack(buf: &mut [u8], start: usize, bits: u8, value: u64) -> Result<()> {
    pack_field(buf, start, bits, value, "field")
}

fn pack_field(buf: &mut [u8], start: usize, bits: u8, value: u64, name: &'static str) -> Result<()> {
    if bits == 0 {
        return Ok(());
    }
    if bits > 64 || value > max_value(bits) {
        return Err(Error::Overflow {
            field: name,
            value: value as i128,
            bits,
        });
    }

    let mut remaining = bits as usize;
    let mut pos = start;
    while remaining > 0 {
        let byte = pos / 8;
        let bit = pos % 8;
        let take = (8 - bit).min(remaining);
        let shift = remaining - take;
        let chunk = ((value >> shift) & ((1u64 << take) - 1)) as u8;
        let lshift = 8 - bit - take;
        let mask = (((1u16 << take) - 1) as u8) << lshift;
        buf[byte] = (buf[byte] & !mask) | (chunk << lshift);
        pos += take;
        remaining -= take;
    }
    Ok(())
}

/// Reads `bits` bits at bit offset `start`. Width 0 reads as 0.
pub fn unpack(buf: &[u8], start: usize, bits: u8) -> u64 {
    let mut value = 0u64;
    let mut remaining = bits.min(64) as usize;
    let mut pos = start;
    while remaining > 0 {
        let byte = pos / 8;
        let bit = pos % 8;
        let take = (8 - bit).min(remaining);
        let lshift = 8 - bit - take;
        let chunk = (buf[byte] >> lshift) as u64 & ((1u64 << take) - 1);
        value = (value << take) | chunk;
        pos += take;
        remaining -= take;
    }
    value
}

/// Two's complement variant of [`pack`].
pub fn pack_signed(buf: &mut [u8], start: usize, bits: u8, value: i64) -> Result<()> {
    if bits == 0 {
        return Ok(());
    }
    let bits = bits.min(64);
    let min = if bits == 64 { i64::MIN } else { -(1i64 << (bits - 1)) };
    let max = if bits == 64 { i64::MAX } else { (1i64 << (bits - 1)) - 1 };
    if value < min || value > max {
        return Err(Error::Overflow {
            field: "field",
            value: value as i128,
            bits,
        });
    }
    pack(buf, start, bits, value as u64 & max_value(bits))
}

pub fn unpack_signed(buf: &[u8], start: usize, bits: u8) -> i64 {
    if bits == 0 {
        return 0;
    }
    let bits = bits.min(64);
    let raw = unpack(buf, start, bits);
    let shift = 64 - bits as u32;
    ((raw << shift) as i64) >> shift
}

/// A named unsigned field at a fixed bit position inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub start: usize,
    pub bits: u8,
}

impl Field {
    pub fn new(name: &'static str, start: usize, bits: u8) -> Self {
        Self { name, start, bits }
    }

    pub fn end(&self) -> usize {
        self.start + self.bits as usize
    }

    pub fn write(&self, buf: &mut [u8], value: u64) -> Result<()> {
        pack_field(buf, self.start, self.bits, value, self.name)
    }

    pub fn read(&self, buf: &[u8]) -> u64 {
        unpack(buf, self.start, self.bits)
    }
}

/// A floating point value stored as `round((value - offset) * scale)`.
///
/// Width-0 fields decode to `absent`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledField {
    pub field: Field,
    pub scale: f64,
    pub offset: f64,
    pub absent: f64,
}

impl ScaledField {
    pub fn new(field: Field, scale: f64, offset: f64, absent: f64) -> Self {
        Self {
            field,
            scale,
            offset,
            absent,
        }
    }

    pub fn encode(&self, value: f64) -> Result<u64> {
        let scaled = ((value - self.offset) * self.scale).round();
        if !scaled.is_finite() || scaled < 0.0 || scaled > max_value(self.field.bits) as f64 {
            return Err(Error::Overflow {
                field: self.field.name,
                value: if scaled.is_finite() { scaled as i128 } else { i128::MAX },
                bits: self.field.bits,
            });
        }
        Ok(scaled as u64)
    }

    pub fn decode(&self, raw: u64) -> f64 {
        raw as f64 / self.scale + self.offset
    }

    pub fn write(&self, buf: &mut [u8], value: f64) -> Result<()> {
        if self.field.bits == 0 {
            return Ok(());
        }
        let raw = self.encode(value)?;
        self.field.write(buf, raw)
    }

    pub fn read(&self, buf: &[u8]) -> f64 {
        if self.field.bits == 0 {
            return self.absent;
        }
        self.decode(self.field.read(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_values(bits: u8) -> Vec<u64> {
        let max = max_value(bits);
        let mut values = vec![0, max, max / 2, max / 3, 1.min(max)];
        let mut x = 0x9E37_79B9_7F4A_7C15u64;
        for _ in 0..16 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            values.push(x & max);
        }
        values
    }

    #[test]
    fn test_inverse_law_all_widths_and_offsets() {
        for bits in 1..=64u8 {
            for start in [0usize, 1, 7, 8, 13] {
                for value in sample_values(bits) {
                    let mut buf = vec![0u8; 16];
                    pack(&mut buf, start, bits, value).unwrap();
                    assert_eq!(
                        unpack(&buf, start, bits),
                        value,
                        "bits={} start={}",
                        bits,
                        start
                    );
                }
            }
        }
    }

    #[test]
    fn test_width_zero_is_free_and_reads_zero() {
        let mut buf = vec![0xAAu8; 4];
        pack(&mut buf, 5, 0, 12345).unwrap();
        assert_eq!(buf, vec![0xAA; 4]);
        assert_eq!(unpack(&buf, 5, 0), 0);

        let scaled = ScaledField::new(Field::new("herr", 3, 0), 100.0, 0.0, -1.0);
        scaled.write(&mut buf, 42.0).unwrap();
        assert_eq!(scaled.read(&buf), -1.0);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let mut buf = vec![0u8; 8];
        let field = Field::new("beam_number", 0, 9);
        assert!(field.write(&mut buf, 511).is_ok());
        match field.write(&mut buf, 512) {
            Err(Error::Overflow { field, value, bits }) => {
                assert_eq!(field, "beam_number");
                assert_eq!(value, 512);
                assert_eq!(bits, 9);
            }
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn test_neighbouring_bits_untouched() {
        let mut buf = vec![0xFFu8; 4];
        pack(&mut buf, 6, 11, 0).unwrap();
        assert_eq!(unpack(&buf, 0, 6), 0b111111);
        assert_eq!(unpack(&buf, 6, 11), 0);
        assert_eq!(unpack(&buf, 17, 15), 0x7FFF);
    }

    #[test]
    fn test_msb_first_layout() {
        let mut buf = vec![0u8; 2];
        pack(&mut buf, 0, 4, 0xA).unwrap();
        pack(&mut buf, 4, 8, 0xBC).unwrap();
        assert_eq!(buf, vec![0xAB, 0xC0]);
    }

    #[test]
    fn test_signed_roundtrip() {
        for bits in [1u8, 2, 9, 31, 63, 64] {
            let min = if bits == 64 { i64::MIN } else { -(1i64 << (bits - 1)) };
            let max = if bits == 64 { i64::MAX } else { (1i64 << (bits - 1)) - 1 };
            for value in [min, max, 0, -1] {
                let mut buf = vec![0u8; 10];
                pack_signed(&mut buf, 3, bits, value).unwrap();
                assert_eq!(unpack_signed(&buf, 3, bits), value, "bits={}", bits);
            }
        }
        let mut buf = vec![0u8; 2];
        assert!(pack_signed(&mut buf, 0, 4, 8).is_err());
        assert!(pack_signed(&mut buf, 0, 4, -9).is_err());
    }

    #[test]
    fn test_scaled_field() {
        let field = ScaledField::new(Field::new("depth", 0, 20), 100.0, -10.0, 0.0);
        let mut buf = vec![0u8; 4];

        field.write(&mut buf, 12.34).unwrap();
        assert!((field.read(&buf) - 12.34).abs() <= 0.005);

        field.write(&mut buf, -10.0).unwrap();
        assert_eq!(field.read(&buf), -10.0);

        assert!(field.write(&mut buf, -10.01).is_err());
        assert!(field.write(&mut buf, 1e9).is_err());
    }

    #[test]
    fn test_bits_for() {
        assert_eq!(bits_for(0), 0);
        assert_eq!(bits_for(1), 1);
        assert_eq!(bits_for(255), 8);
        assert_eq!(bits_for(256), 9);
        assert_eq!(bits_for(u64::MAX), 64);
    }
}
