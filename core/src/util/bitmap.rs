use crate::os::Vec;

use bittle::{BigEndian, Bits, BitsMut};
use core::ops::Index;
use serde::{Deserialize, Serialize};

/// A compact array of bits.
///
/// The bitmap is backed by `Vec<u64>`, and its default endianness is _BigEndian_.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BitMap {
    bits: Vec<u64>,
    len: usize,
}

impl BitMap {
    /// The one bit represents `true`.
    const ONE: bool = true;

    /// The zero bit represents `false`.
    const ZERO: bool = false;

    /// Create a new `BitMap` by repeating a bit for the desired length.
    pub fn repeat(value: bool, len: usize) -> Self {
        let vec_len = (len + 64 - 1) / 64;
        let mut bits = Vec::with_capacity(vec_len);
        if value == Self::ONE {
            bits.resize(vec_len, !0u64);
        } else {
            bits.resize(vec_len, 0u64);
        }

        // Set the unused bits in the last u64 with zero.
        if len % 64 != 0 {
            let mask = (1u64 << (len % 64)) - 1;
            bits[vec_len - 1] &= mask;
        }
        Self { bits, len }
    }

    /// Return the total number of bits.
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn check_index(&self, index: usize) {
        if index >= self.len() {
            panic!(
                "bitmap index {} is out of range, total bits {}",
                index, self.len,
            );
        }
    }

    /// Test if the given bit is set using `BigEndian` indexing.
    pub fn test_bit(&self, index: usize) -> bool {
        self.check_index(index);
        self.bits.test_bit_in::<BigEndian>(index as _)
    }

    /// Set the given bit using `BigEndian` indexing.
    pub fn set_bit(&mut self, index: usize) {
        self.check_index(index);
        self.bits.set_bit_in::<BigEndian>(index as _);
    }

    /// Clear the given bit using `BigEndian` indexing.
    pub fn clear_bit(&mut self, index: usize) {
        self.check_index(index);
        self.bits.clear_bit_in::<BigEndian>(index as _)
    }

    /// Set the given bit with `value`, using `BigEndian` indexing.
    pub fn set(&mut self, index: usize, value: bool) {
        if value == Self::ONE {
            self.set_bit(index);
        } else {
            self.clear_bit(index);
        }
    }

    /// Get the number of ones in the bitmap.
    pub fn count_ones(&self) -> usize {
        self.bits.count_ones() as _
    }

    /// Get the number of zeros in the bitmap.
    pub fn count_zeros(&self) -> usize {
        self.len - self.count_ones()
    }

    /// Whether every bit of the bitmap is set.
    pub fn is_full(&self) -> bool {
        self.count_ones() == self.len
    }
}

impl Index<usize> for BitMap {
    type Output = bool;

    fn index(&self, index: usize) -> &Self::Output {
        if self.test_bit(index) {
            &BitMap::ONE
        } else {
            &BitMap::ZERO
        }
    }
}
