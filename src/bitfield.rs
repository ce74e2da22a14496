//! Bit-indexed record of which pieces a peer holds.
//!
//! Bit order follows the wire format: piece 0 is the most significant bit of
//! byte 0. Spare bits in the last byte are always zero.

use crate::error::FormatError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Bitfield {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield with every piece set.
    #[cfg(test)]
    pub fn full(piece_count: usize) -> Self {
        let mut bitfield = Bitfield::new(piece_count);
        for index in 0..piece_count {
            bitfield.set(index);
        }
        bitfield
    }

    /// Parses a received BITFIELD payload.
    ///
    /// The payload must be exactly `ceil(piece_count / 8)` bytes. Spare bits
    /// set by a sloppy peer are cleared rather than rejected.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self, FormatError> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(FormatError::BitfieldLength {
                expected,
                actual: bytes.len(),
            });
        }

        let mut bitfield = Bitfield {
            bits: bytes.to_vec(),
            piece_count,
        };
        bitfield.clear_spare_bits();
        Ok(bitfield)
    }

    /// Returns true if the piece is set. Out-of-range indices are never set.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        self.bits[index / 8] >> (7 - index % 8) & 1 == 1
    }

    /// Sets a piece. Returns false if the index is out of range.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        true
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn len(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if let Some(last) = self.bits.last_mut() {
            *last &= 0xffu8 << spare;
        }
    }
}

impl FromIterator<bool> for Bitfield {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        let flags: Vec<bool> = iter.into_iter().collect();
        let mut bitfield = Bitfield::new(flags.len());
        for (index, _) in flags.iter().enumerate().filter(|(_, &has)| has) {
            bitfield.set(index);
        }
        bitfield
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msb_of_first_byte_is_piece_zero() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0);
        bitfield.set(9);
        assert_eq!(bitfield.as_bytes(), &[0b1000_0000, 0b0100_0000]);
        assert!(bitfield.has(0));
        assert!(!bitfield.has(1));
        assert!(bitfield.has(9));
    }

    #[test]
    fn out_of_range_is_ignored() {
        let mut bitfield = Bitfield::new(3);
        assert!(!bitfield.set(3));
        assert!(!bitfield.has(3));
        assert_eq!(bitfield.count(), 0);
    }

    #[test]
    fn from_bytes_checks_length_and_clears_spare_bits() {
        assert_eq!(
            Bitfield::from_bytes(&[0xff], 9),
            Err(FormatError::BitfieldLength {
                expected: 2,
                actual: 1
            })
        );

        let bitfield = Bitfield::from_bytes(&[0xff, 0xff], 9).unwrap();
        assert_eq!(bitfield.as_bytes(), &[0xff, 0x80]);
        assert!(bitfield.is_complete());
    }

    #[test]
    fn empty_bitfield() {
        let bitfield = Bitfield::from_bytes(&[], 0).unwrap();
        assert!(bitfield.is_complete());
        assert!(bitfield.as_bytes().is_empty());
    }

    #[test]
    fn full_and_from_iter() {
        assert_eq!(Bitfield::full(5).as_bytes(), &[0b1111_1000]);
        let bitfield: Bitfield = [true, false, true].into_iter().collect();
        assert_eq!(bitfield.as_bytes(), &[0b1010_0000]);
        assert_eq!(bitfield.len(), 3);
    }
}
