// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Page-granular dirty bitmaps exchanged with the host dirty logging interfaces.
//!
//! Host kernels report dirty pages as a little-endian array of 64-bit words with one bit per
//! page, so the backing storage of [`DirtyBitmap`] is always a whole number of `u64` words even
//! when the page count is not a multiple of 64.

use std::num::NonZeroU64;

/// `DirtyBitmap` implements a simple bit map on the page level with test and set operations.
/// It is page-size aware, so it converts byte offsets to page numbers before setting or
/// testing bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyBitmap {
    map: Vec<u64>,
    pages: u64,
    page_size: NonZeroU64,
}

#[allow(clippy::len_without_is_empty)]
impl DirtyBitmap {
    /// Create a new bitmap covering `byte_size` bytes, with one bit per page. The page count is
    /// rounded up, and the storage is rounded up to the next multiple of 64 bits.
    pub fn new(byte_size: u64, page_size: NonZeroU64) -> Self {
        let pages = byte_size.div_ceil(page_size.get());
        let words = pages.div_ceil(u64::from(u64::BITS));
        DirtyBitmap {
            map: vec![0; words as usize],
            pages,
            page_size,
        }
    }

    /// Number of bytes a bitmap for `byte_size` bytes occupies, as passed to host interfaces.
    pub fn bytes_for(byte_size: u64, page_size: NonZeroU64) -> u64 {
        byte_size
            .div_ceil(page_size.get())
            .div_ceil(u64::from(u64::BITS))
            * std::mem::size_of::<u64>() as u64
    }

    /// Get the length of the bitmap in bits (i.e. in how many pages it can represent).
    pub fn len(&self) -> u64 {
        self.pages
    }

    /// Size of the backing storage in bytes.
    pub fn byte_len(&self) -> u64 {
        self.map.len() as u64 * std::mem::size_of::<u64>() as u64
    }

    /// Page size represented by one bit.
    pub fn page_size(&self) -> u64 {
        self.page_size.get()
    }

    /// Raw words of the bitmap.
    pub fn as_words(&self) -> &[u64] {
        &self.map
    }

    /// Mutable raw words of the bitmap, for host interfaces to fill in.
    pub fn as_words_mut(&mut self) -> &mut [u64] {
        &mut self.map
    }

    /// Is bit `n` set? Bits outside the range of the bitmap are always unset.
    pub fn is_bit_set(&self, index: u64) -> bool {
        if index < self.pages {
            (self.map[(index >> 6) as usize] & (1 << (index & 63))) != 0
        } else {
            false
        }
    }

    /// Is the bit corresponding to byte offset `offset` set?
    pub fn is_offset_set(&self, offset: u64) -> bool {
        self.is_bit_set(offset / self.page_size)
    }

    /// Set a range of `len` bytes starting at `start`. Bits past the end of the bitmap are
    /// ignored.
    pub fn set_range(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }

        let first_bit = start / self.page_size;
        let last_bit = start.saturating_add(len - 1) / self.page_size;
        for n in first_bit..=last_bit.min(self.pages.saturating_sub(1)) {
            if n >= self.pages {
                break;
            }
            self.map[(n >> 6) as usize] |= 1 << (n & 63);
        }
    }

    /// OR the bits of `other` into `self`. Both bitmaps must share the same geometry.
    pub fn merge(&mut self, other: &DirtyBitmap) {
        debug_assert_eq!(self.page_size, other.page_size);
        for (dst, src) in self.map.iter_mut().zip(other.map.iter()) {
            *dst |= *src;
        }
    }

    /// Count the dirty pages.
    pub fn dirty_pages(&self) -> u64 {
        self.map.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Iterate over the indices of dirty pages in ascending order.
    pub fn iter_dirty(&self) -> impl Iterator<Item = u64> + '_ {
        self.map.iter().enumerate().flat_map(|(i, &word)| {
            let base = (i as u64) << 6;
            (0..64u64)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| base + bit)
        })
    }

    /// Reset all bitmap bits to 0.
    pub fn reset(&mut self) {
        self.map.iter_mut().for_each(|w| *w = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: NonZeroU64 = match NonZeroU64::new(0x1000) {
        Some(p) => p,
        None => panic!(),
    };

    #[test]
    fn test_bitmap_geometry() {
        // 65 pages need two words.
        let b = DirtyBitmap::new(65 * 0x1000, PAGE);
        assert_eq!(b.len(), 65);
        assert_eq!(b.byte_len(), 16);
        assert_eq!(DirtyBitmap::bytes_for(65 * 0x1000, PAGE), 16);

        // A partial page still gets a bit.
        let b = DirtyBitmap::new(0x1001, PAGE);
        assert_eq!(b.len(), 2);
        assert_eq!(b.byte_len(), 8);

        let b = DirtyBitmap::new(0, PAGE);
        assert_eq!(b.len(), 0);
        assert_eq!(b.byte_len(), 0);
    }

    #[test]
    fn test_bitmap_set_and_query() {
        let mut b = DirtyBitmap::new(128 * 0x1000, PAGE);
        b.set_range(0x1000, 0x1001);
        assert!(!b.is_offset_set(0));
        assert!(b.is_offset_set(0x1000));
        assert!(b.is_offset_set(0x2000));
        assert!(!b.is_offset_set(0x3000));
        assert_eq!(b.dirty_pages(), 2);

        b.set_range(127 * 0x1000, 0x10_000);
        assert!(b.is_bit_set(127));
        assert!(!b.is_bit_set(128));
        assert_eq!(b.iter_dirty().collect::<Vec<_>>(), vec![1, 2, 127]);

        b.reset();
        assert_eq!(b.dirty_pages(), 0);
    }

    #[test]
    fn test_bitmap_merge() {
        let mut a = DirtyBitmap::new(64 * 0x1000, PAGE);
        let mut b = a.clone();
        a.set_range(0, 1);
        b.as_words_mut()[0] = 0b110;
        a.merge(&b);
        assert_eq!(a.as_words(), &[0b111]);
    }
}
