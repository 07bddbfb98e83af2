//! A fixed-size bitmap used to hand out filter slots.

use alloc::{collections::TryReserveError, vec::Vec};

const BITS: usize = u64::BITS as usize;

/// First-fit allocator over `len` slots.
#[derive(Debug)]
pub(crate) struct BitmapAllocator {
    words: Vec<u64>,
    len: usize,
    in_use: usize,
}

impl BitmapAllocator {
    /// Creates a bitmap with all `len` slots free.
    pub(crate) fn new(len: usize) -> Result<Self, TryReserveError> {
        let count = len.div_ceil(BITS);
        let mut words = Vec::new();
        words.try_reserve_exact(count)?;
        words.resize(count, 0);
        Ok(Self { words, len, in_use: 0 })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        index < self.len && self.words[index / BITS] & (1 << (index % BITS)) != 0
    }

    /// Takes the lowest free slot.
    pub(crate) fn allocate(&mut self) -> Option<usize> {
        for (word_index, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let index = word_index * BITS + bit;
            if index >= self.len {
                return None;
            }
            *word |= 1 << bit;
            self.in_use += 1;
            return Some(index);
        }
        None
    }

    /// Takes the lowest run of `count` free slots that starts on a multiple of `align`.
    pub(crate) fn allocate_aligned(&mut self, count: usize, align: usize) -> Option<usize> {
        if count == 0 || align == 0 {
            return None;
        }
        let mut start = 0;
        while start + count <= self.len {
            if (start..start + count).all(|i| !self.is_set(i)) {
                for i in start..start + count {
                    self.words[i / BITS] |= 1 << (i % BITS);
                }
                self.in_use += count;
                return Some(start);
            }
            start += align;
        }
        None
    }

    /// Frees `count` slots starting at `start`.
    ///
    /// Slots that were not taken are left alone.
    pub(crate) fn release(&mut self, start: usize, count: usize) {
        debug_assert!(start + count <= self.len, "bitmap release out of range");
        for i in start..(start + count).min(self.len) {
            let mask = 1 << (i % BITS);
            let word = &mut self.words[i / BITS];
            if *word & mask != 0 {
                *word &= !mask;
                self.in_use -= 1;
            }
        }
    }
}
