//! Wrapper types around Bitvec.
use std::ops::{BitAnd, BitOr, BitXor, Not};

use bitvec::prelude::*;

use crate::error::Error;

/// Fixed-length have-vector where index = piece.
///
/// Packing is big-endian: bit 0 is the high bit of byte 0, and the unused
/// tail of the last byte is always zero on the wire. The number of unset
/// bits is tracked on every write so `complete` is O(1).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
    num_false: usize,
}

impl Bitfield {
    /// A bitfield of `len` unset bits.
    pub fn new(len: usize) -> Self {
        Self { bits: bitvec![u8, Msb0; 0; len], num_false: len }
    }

    /// A bitfield of `len` set bits.
    pub fn full(len: usize) -> Self {
        Self { bits: bitvec![u8, Msb0; 1; len], num_false: 0 }
    }

    /// Decode the wire form of a bitfield with `len` bits.
    ///
    /// The byte length must be exactly `ceil(len / 8)` and the padding
    /// bits must be zero.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self, Error> {
        if bytes.len() != len.div_ceil(8) {
            return Err(Error::BitfieldInvalid);
        }
        if let Some(last) = bytes.last() {
            if last & !tail_mask(len) != 0 {
                return Err(Error::BitfieldInvalid);
            }
        }

        let mut bits = BitVec::<u8, Msb0>::from_slice(bytes);
        bits.truncate(len);
        let num_false = bits.count_zeros();

        Ok(Self { bits, num_false })
    }

    /// The wire form, `ceil(len / 8)` bytes with zero padding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.bits.as_raw_slice().to_vec();
        out.truncate(self.bits.len().div_ceil(8));
        if let Some(last) = out.last_mut() {
            *last &= tail_mask(self.bits.len());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Out of range indices read as unset.
    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Set a bit, returning the previous value. Out of range indices are
    /// ignored.
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        let Some(mut bit) = self.bits.get_mut(index) else {
            return false;
        };
        let old = *bit;
        if old != value {
            *bit = value;
            if value {
                self.num_false -= 1;
            } else {
                self.num_false += 1;
            }
        }
        old
    }

    pub fn num_false(&self) -> usize {
        self.num_false
    }

    pub fn num_true(&self) -> usize {
        self.bits.len() - self.num_false
    }

    /// Every bit is set.
    pub fn complete(&self) -> bool {
        self.num_false == 0
    }

    /// Indices of set bits, ascending.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Indices of unset bits, ascending.
    pub fn iter_zeros(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_zeros()
    }

    fn zip_with(&self, rhs: &Bitfield, f: impl Fn(u8, u8) -> u8) -> Bitfield {
        assert_eq!(self.len(), rhs.len(), "bitfield length mismatch");
        let bytes: Vec<u8> = self
            .to_bytes()
            .iter()
            .zip(rhs.to_bytes().iter())
            .map(|(a, b)| f(*a, *b))
            .collect();
        Self::from_masked(bytes, self.len())
    }

    fn from_masked(mut bytes: Vec<u8>, len: usize) -> Bitfield {
        if let Some(last) = bytes.last_mut() {
            *last &= tail_mask(len);
        }
        let mut bits = BitVec::<u8, Msb0>::from_vec(bytes);
        bits.truncate(len);
        let num_false = bits.count_zeros();
        Self { bits, num_false }
    }
}

/// Mask of the meaningful bits in the last byte of a `len`-bit field.
fn tail_mask(len: usize) -> u8 {
    match len % 8 {
        0 => 0xff,
        r => 0xffu8 << (8 - r),
    }
}

impl BitAnd for &Bitfield {
    type Output = Bitfield;

    fn bitand(self, rhs: Self) -> Bitfield {
        self.zip_with(rhs, |a, b| a & b)
    }
}

impl BitOr for &Bitfield {
    type Output = Bitfield;

    fn bitor(self, rhs: Self) -> Bitfield {
        self.zip_with(rhs, |a, b| a | b)
    }
}

impl BitXor for &Bitfield {
    type Output = Bitfield;

    fn bitxor(self, rhs: Self) -> Bitfield {
        self.zip_with(rhs, |a, b| a ^ b)
    }
}

impl Not for &Bitfield {
    type Output = Bitfield;

    fn not(self) -> Bitfield {
        let bytes = self.to_bytes().into_iter().map(|b| !b).collect();
        Bitfield::from_masked(bytes, self.len())
    }
}

/// Reserved bytes exchanged during handshake.
type ReservedAlias = BitArray<[u8; 8], Msb0>;

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub ReservedAlias);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(ReservedAlias::from(value))
    }
}

impl Reserved {
    /// Bit 43 is byte 5, mask 0x10: the extension protocol.
    const EXTENDED: usize = 43;

    /// Reserved bits we advertise. Only the extension protocol flag is
    /// set, no extension messages are ever exchanged.
    pub fn supported() -> Reserved {
        let mut r = Reserved::default();
        r.0.set(Self::EXTENDED, true);
        r
    }

    pub fn supports_extended(&self) -> bool {
        self.0[Self::EXTENDED]
    }

    pub fn into_bytes(self) -> [u8; 8] {
        self.0.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_empty() {
        let bitfield = Bitfield::new(1407);
        assert_eq!(bitfield.len(), 1407);
        assert_eq!(bitfield.num_false(), 1407);
        assert!(!bitfield.complete());
    }

    #[test]
    fn num_false_tracks_writes() {
        let mut bitfield = Bitfield::new(10);
        assert!(!bitfield.set(3, true));
        assert!(bitfield.set(3, true));
        assert_eq!(bitfield.num_false(), 9);

        bitfield.set(3, false);
        assert_eq!(bitfield.num_false(), 10);

        for i in 0..10 {
            bitfield.set(i, true);
        }
        assert!(bitfield.complete());

        // out of range is a no-op
        bitfield.set(10, false);
        assert!(bitfield.complete());
        assert!(!bitfield.get(99));
    }

    #[test]
    fn wire_packing_is_msb_first() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0, true);
        bitfield.set(9, true);
        assert_eq!(bitfield.to_bytes(), vec![0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn bytes_round_trip() {
        for len in [1, 7, 8, 9, 16, 33] {
            let mut bitfield = Bitfield::new(len);
            for i in (0..len).step_by(3) {
                bitfield.set(i, true);
            }
            let bytes = bitfield.to_bytes();
            assert_eq!(bytes.len(), len.div_ceil(8));
            assert_eq!(Bitfield::from_bytes(&bytes, len).unwrap(), bitfield);
        }
    }

    #[test]
    fn full_padding_is_zero() {
        let bitfield = Bitfield::full(12);
        assert_eq!(bitfield.to_bytes(), vec![0xff, 0xf0]);
    }

    #[test]
    fn reject_bad_padding_and_length() {
        assert!(Bitfield::from_bytes(&[0xff, 0xf8], 12).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xf0], 12).is_ok());
        assert!(Bitfield::from_bytes(&[0xff], 12).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0x00, 0x00], 12).is_err());
    }

    #[test]
    fn bit_ops() {
        let a = Bitfield::from_bytes(&[0b1100_0000], 4).unwrap();
        let b = Bitfield::from_bytes(&[0b1010_0000], 4).unwrap();

        assert_eq!((&a & &b).to_bytes(), vec![0b1000_0000]);
        assert_eq!((&a | &b).to_bytes(), vec![0b1110_0000]);
        assert_eq!((&a ^ &b).to_bytes(), vec![0b0110_0000]);

        let not = !&a;
        assert_eq!(not.to_bytes(), vec![0b0011_0000]);
        assert_eq!(not.num_false(), 2);
    }

    #[test]
    fn supports_ext() {
        let reserved = Reserved::supported();
        assert!(reserved.supports_extended());
        assert_eq!(reserved.into_bytes(), [0, 0, 0, 0, 0, 0x10, 0, 0]);
        assert!(!Reserved::default().supports_extended());
    }
}
