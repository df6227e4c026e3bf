//! Reception bitmap: one bit per MTU-sized chunk of an inbound message.
//!
//! The number of chunks is learned from the first DATA packet (which carries
//!  the message's total length), so the bitmap is sized at runtime.

/// Word-backed bitmap with a fixed bit count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    num_bits: usize,
}

impl ChunkBitmap {
    pub fn new(num_bits: usize) -> ChunkBitmap {
        ChunkBitmap {
            words: vec![0; num_bits.div_ceil(64)],
            num_bits,
        }
    }

    pub fn len(&self) -> usize {
        self.num_bits
    }

    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// set the bit, returning true iff it was previously clear
    #[must_use]
    pub fn set(&mut self, idx: usize) -> bool {
        assert!(idx < self.num_bits, "chunk index {} out of range {}", idx, self.num_bits);
        let word = &mut self.words[idx / 64];
        let mask = 1u64 << (idx % 64);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.num_bits, "chunk index {} out of range {}", idx, self.num_bits);
        self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_set() == self.num_bits
    }

    /// index of the lowest clear bit, if any
    pub fn first_clear(&self) -> Option<usize> {
        for (word_idx, &word) in self.words.iter().enumerate() {
            if word != u64::MAX {
                let bit = word_idx * 64 + word.trailing_ones() as usize;
                if bit < self.num_bits {
                    return Some(bit);
                }
                return None;
            }
        }
        None
    }

    /// number of consecutive clear bits starting at `from`
    pub fn clear_run_len(&self, from: usize) -> usize {
        let mut idx = from;
        while idx < self.num_bits && !self.get(idx) {
            idx += 1;
        }
        idx - from
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::tiny(1)]
    #[case::one_word(64)]
    #[case::word_plus_one(65)]
    #[case::large(1000)]
    fn test_set_get_count(#[case] num_bits: usize) {
        let mut bitmap = ChunkBitmap::new(num_bits);
        assert_eq!(bitmap.len(), num_bits);
        assert_eq!(bitmap.count_set(), 0);
        assert!(!bitmap.is_full());

        for idx in (0..num_bits).step_by(3) {
            assert!(!bitmap.get(idx));
            assert!(bitmap.set(idx));
            assert!(bitmap.get(idx));
            assert!(!bitmap.set(idx), "second set of the same bit must report duplicate");
        }

        assert_eq!(bitmap.count_set(), num_bits.div_ceil(3));
    }

    #[test]
    fn test_is_full() {
        let mut bitmap = ChunkBitmap::new(65);
        for idx in 0..64 {
            assert!(bitmap.set(idx));
        }
        assert!(!bitmap.is_full());
        assert!(bitmap.set(64));
        assert!(bitmap.is_full());
    }

    #[rstest]
    #[case::all_clear(10, vec![], Some(0))]
    #[case::gap_in_front(10, vec![1, 2], Some(0))]
    #[case::gap_in_middle(10, vec![0, 1, 3], Some(2))]
    #[case::gap_at_end(3, vec![0, 1], Some(2))]
    #[case::full(3, vec![0, 1, 2], None)]
    #[case::full_word_boundary(64, (0..64).collect(), None)]
    #[case::clear_above_word_boundary(65, (0..64).collect(), Some(64))]
    fn test_first_clear(#[case] num_bits: usize, #[case] set: Vec<usize>, #[case] expected: Option<usize>) {
        let mut bitmap = ChunkBitmap::new(num_bits);
        for idx in set {
            assert!(bitmap.set(idx));
        }
        assert_eq!(bitmap.first_clear(), expected);
    }

    #[rstest]
    #[case::from_zero_all_clear(5, vec![], 0, 5)]
    #[case::from_zero_stops_at_set(5, vec![2], 0, 2)]
    #[case::from_set_bit(5, vec![2], 2, 0)]
    #[case::tail_run(5, vec![0, 1], 2, 3)]
    fn test_clear_run_len(#[case] num_bits: usize, #[case] set: Vec<usize>, #[case] from: usize, #[case] expected: usize) {
        let mut bitmap = ChunkBitmap::new(num_bits);
        for idx in set {
            assert!(bitmap.set(idx));
        }
        assert_eq!(bitmap.clear_run_len(from), expected);
    }
}
