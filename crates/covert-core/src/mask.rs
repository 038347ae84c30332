//! Bit-field codec — scatters message bits over the header bits a mask
//! marks as available, and gathers them back.
//!
//! A mask is a cycle of slot bytes, one slot per carrier packet. Every set
//! bit in a slot is a header bit that may carry covert data. Data bits are
//! consumed most-significant first and placed into available bits, also
//! most-significant first; unavailable bits are skipped, never zero-filled
//! as placeholders.
//!
//! The encode side is strict (whole cycles only, or an error) while the
//! decode side rounds down to whole cycles so a receive cut short still
//! yields its decodable prefix.

use std::fmt;

/// Errors produced by the codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MaskError {
    #[error("mask carries {bits} bits per cycle; need a positive multiple of 8")]
    Malformed { bits: u32 },

    #[error("{len} data bytes do not fill whole mask cycles of {unit} bytes")]
    Misaligned { len: usize, unit: usize },
}

/// Sizes derived from a count of packed bytes received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidSize {
    /// Packed bytes that form whole mask cycles.
    pub packed: usize,
    /// Message bytes those cycles decode to.
    pub decoded: usize,
    /// Trailing packed bytes of an incomplete cycle, ignored on decode.
    pub remainder: usize,
}

/// An ordered cycle of slot masks.
#[derive(Clone, PartialEq, Eq)]
pub struct Mask {
    slots: Vec<u8>,
    bits: u32,
}

impl Mask {
    /// Build a mask from per-packet slot groups, flattened in order.
    ///
    /// Construction never fails; a malformed mask is reported by every
    /// codec operation instead so callers see the error where data flows.
    pub fn new<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let slots: Vec<u8> = groups
            .into_iter()
            .flat_map(|g| g.as_ref().to_vec())
            .collect();
        let bits = slots.iter().map(|b| b.count_ones()).sum();
        Self { slots, bits }
    }

    /// One slot per packet; shorthand for single-byte groups.
    pub fn from_slots(slots: &[u8]) -> Self {
        Self::new(slots.iter().map(std::slice::from_ref))
    }

    pub fn slots(&self) -> &[u8] {
        &self.slots
    }

    /// Packed bytes in one cycle.
    pub fn cycle_len(&self) -> usize {
        self.slots.len()
    }

    /// Available bits in one cycle.
    pub fn bits_per_cycle(&self) -> u32 {
        self.bits
    }

    /// The slot byte for packet number `index`, wrapping over the cycle.
    pub fn slot(&self, index: usize) -> u8 {
        if self.slots.is_empty() {
            return 0;
        }
        self.slots[index % self.slots.len()]
    }

    /// Message bytes carried by one cycle, once the mask is known good.
    fn checked_unit(&self) -> Result<usize, MaskError> {
        if self.bits == 0 || self.bits % 8 != 0 {
            return Err(MaskError::Malformed { bits: self.bits });
        }
        Ok((self.bits / 8) as usize)
    }

    /// Packed size needed to carry `len` message bytes.
    pub fn encoded_size(&self, len: usize) -> Result<usize, MaskError> {
        let unit = self.checked_unit()?;
        if len % unit != 0 {
            return Err(MaskError::Misaligned { len, unit });
        }
        Ok(len / unit * self.cycle_len())
    }

    /// How much of `packed` bytes received so far is decodable.
    pub fn valid_size(&self, packed: usize) -> Result<ValidSize, MaskError> {
        let unit = self.checked_unit()?;
        let cycles = packed / self.cycle_len();
        Ok(ValidSize {
            packed: cycles * self.cycle_len(),
            decoded: cycles * unit,
            remainder: packed % self.cycle_len(),
        })
    }

    /// Message bytes accounted for by `packed` bytes actually sent.
    pub fn sent_size(&self, packed: usize) -> Result<usize, MaskError> {
        self.valid_size(packed).map(|v| v.decoded)
    }

    /// Scatter `data` over as many mask cycles as it takes.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, MaskError> {
        let mut out = vec![0u8; self.encoded_size(data.len())?];
        for (set, (index, bit)) in data_bits(data).zip(self.positions()) {
            if set {
                out[index] |= 0x80 >> bit;
            }
        }
        Ok(out)
    }

    /// Gather message bytes from every whole cycle in `packed`.
    pub fn decode(&self, packed: &[u8]) -> Result<Vec<u8>, MaskError> {
        let valid = self.valid_size(packed.len())?;
        let mut out = vec![0u8; valid.decoded];
        let total_bits = valid.decoded * 8;
        for (n, (index, bit)) in self.positions().take(total_bits).enumerate() {
            if packed[index] & (0x80 >> bit) != 0 {
                out[n / 8] |= 0x80 >> (n % 8);
            }
        }
        Ok(out)
    }

    /// Decode the valid prefix of `packed` into `out`, returning how many
    /// bytes were written. Never writes past `out`.
    pub fn decode_into(&self, packed: &[u8], out: &mut [u8]) -> Result<usize, MaskError> {
        let decoded = self.decode(packed)?;
        let n = decoded.len().min(out.len());
        out[..n].copy_from_slice(&decoded[..n]);
        Ok(n)
    }

    /// Every available (packed index, bit index) position, cycling forever.
    fn positions(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        let len = self.slots.len();
        (0..usize::MAX)
            .take_while(move |_| len > 0)
            .flat_map(move |index| {
                let slot = self.slots[index % len];
                (0..8u32)
                    .filter(move |bit| slot & (0x80 >> bit) != 0)
                    .map(move |bit| (index, bit))
            })
    }
}

fn data_bits(data: &[u8]) -> impl Iterator<Item = bool> + '_ {
    data.iter()
        .flat_map(|byte| (0..8u32).map(move |bit| byte & (0x80 >> bit) != 0))
}

impl fmt::Debug for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mask[")?;
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{slot:08b}")?;
        }
        write!(f, "; {} bits]", self.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_byte_mask_is_identity() {
        let mask = Mask::from_slots(&[0xFF]);
        let data = b"hello";
        assert_eq!(mask.encode(data).unwrap(), data.to_vec());
        assert_eq!(mask.decode(data).unwrap(), data.to_vec());
    }

    #[test]
    fn single_bit_slots_spread_one_byte_over_eight() {
        let mask = Mask::from_slots(&[0x01; 8]);
        let packed = mask.encode(&[0b1010_0011]).unwrap();
        assert_eq!(packed, vec![1, 0, 1, 0, 0, 0, 1, 1]);
        assert_eq!(mask.decode(&packed).unwrap(), vec![0b1010_0011]);
    }

    #[test]
    fn bits_land_msb_first_in_available_positions() {
        // Two bits per slot at positions 6 and 1.
        let mask = Mask::from_slots(&[0b0100_0010; 4]);
        let packed = mask.encode(&[0b1101_0010]).unwrap();
        assert_eq!(
            packed,
            vec![0b0100_0010, 0b0000_0010, 0b0000_0000, 0b0100_0000]
        );
        assert_eq!(mask.decode(&packed).unwrap(), vec![0b1101_0010]);
    }

    #[test]
    fn uneven_slots_round_trip() {
        let mask = Mask::new([vec![0xF0, 0x0F], vec![0x3C], vec![0xC3, 0xFF]]);
        assert_eq!(mask.bits_per_cycle(), 24);
        let data = b"covert";
        let packed = mask.encode(data).unwrap();
        assert_eq!(packed.len(), 10);
        assert_eq!(mask.decode(&packed).unwrap(), data.to_vec());
    }

    #[test]
    fn malformed_mask_fails_everywhere() {
        let mask = Mask::from_slots(&[0x07]);
        let err = MaskError::Malformed { bits: 3 };
        assert_eq!(mask.encode(b"a").unwrap_err(), err);
        assert_eq!(mask.decode(b"abc").unwrap_err(), err);
        assert_eq!(mask.valid_size(3).unwrap_err(), err);

        let empty = Mask::from_slots(&[0x00]);
        assert_eq!(
            empty.encode(b"a").unwrap_err(),
            MaskError::Malformed { bits: 0 }
        );
    }

    #[test]
    fn encode_rejects_partial_cycles() {
        // 16 bits per cycle, so an odd byte count cannot be placed.
        let mask = Mask::from_slots(&[0xFF, 0xFF]);
        assert_eq!(
            mask.encode(b"abc").unwrap_err(),
            MaskError::Misaligned { len: 3, unit: 2 }
        );
        assert_eq!(mask.encoded_size(4).unwrap(), 4);
    }

    #[test]
    fn valid_size_rounds_down_without_error() {
        let mask = Mask::from_slots(&[0xFF]);
        assert_eq!(
            mask.valid_size(5).unwrap(),
            ValidSize {
                packed: 5,
                decoded: 5,
                remainder: 0
            }
        );

        let bits = Mask::from_slots(&[0x01; 8]);
        assert_eq!(
            bits.valid_size(19).unwrap(),
            ValidSize {
                packed: 16,
                decoded: 2,
                remainder: 3
            }
        );
        assert_eq!(bits.sent_size(19).unwrap(), 2);
    }

    #[test]
    fn decode_ignores_trailing_partial_cycle() {
        let mask = Mask::from_slots(&[0x01; 8]);
        let mut packed = mask.encode(b"ok").unwrap();
        packed.extend_from_slice(&[1, 1, 1]);
        assert_eq!(mask.decode(&packed).unwrap(), b"ok".to_vec());
    }

    #[test]
    fn decode_into_stops_at_buffer_end() {
        let mask = Mask::from_slots(&[0xFF]);
        let mut out = [0u8; 3];
        assert_eq!(mask.decode_into(b"abcdef", &mut out).unwrap(), 3);
        assert_eq!(&out, b"abc");
    }

    #[test]
    fn slot_wraps_over_cycle() {
        let mask = Mask::from_slots(&[0x03; 4]);
        assert_eq!(mask.slot(5), 0x03);
        assert_eq!(mask.cycle_len(), 4);
    }
}
