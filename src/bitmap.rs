//! Simple maps of bits over 32-bit words.
//!
//! Used by the sparse controller for the children map and per-child block
//! maps, and by the allocator's self-repair path. The map always allocates on
//! a word boundary.

const INT_BITS: i32 = 32;
const LOG_INT_BITS: i32 = 5;

#[derive(Clone, Debug, Default)]
pub struct Bitmap {
    num_bits: i32,
    map: Vec<u32>,
}

impl Bitmap {
    /// Creates a bitmap of `num_bits` bits, all clear.
    pub fn new(num_bits: i32) -> Bitmap {
        Bitmap {
            num_bits,
            map: vec![0; Self::required_array_size(num_bits) as usize],
        }
    }

    /// Creates a bitmap from existing word storage. Trailing words beyond
    /// `num_bits` are kept as given.
    pub fn from_words(words: &[u32], num_bits: i32) -> Bitmap {
        let mut map = words.to_vec();
        map.resize(Self::required_array_size(num_bits) as usize, 0);
        Bitmap { num_bits, map }
    }

    /// Number of allocated words required for a bitmap of `num_bits` bits.
    pub fn required_array_size(num_bits: i32) -> i32 {
        if num_bits <= INT_BITS {
            return 1;
        }
        (num_bits + INT_BITS - 1) >> LOG_INT_BITS
    }

    /// Resizes the bitmap, preserving existing bits and clearing new ones.
    pub fn resize(&mut self, num_bits: i32) {
        let old_size = self.map.len();
        let new_size = Self::required_array_size(num_bits) as usize;
        self.map.resize(new_size, 0);
        if num_bits > self.num_bits && self.num_bits % INT_BITS != 0 && old_size <= new_size {
            // Clear the partial word tail left over from the previous size.
            let word = (self.num_bits >> LOG_INT_BITS) as usize;
            let bit = self.num_bits % INT_BITS;
            self.map[word] &= (1u32 << bit) - 1;
        }
        self.num_bits = num_bits;
    }

    pub fn size(&self) -> i32 {
        self.num_bits
    }

    pub fn words(&self) -> &[u32] {
        &self.map
    }

    pub fn set(&mut self, index: i32, value: bool) {
        debug_assert!((0..self.num_bits).contains(&index));
        let word = (index >> LOG_INT_BITS) as usize;
        let bit = 1u32 << (index % INT_BITS);
        if value {
            self.map[word] |= bit;
        } else {
            self.map[word] &= !bit;
        }
    }

    pub fn get(&self, index: i32) -> bool {
        debug_assert!((0..self.num_bits).contains(&index));
        let word = (index >> LOG_INT_BITS) as usize;
        self.map[word] & (1u32 << (index % INT_BITS)) != 0
    }

    /// Sets bits `[begin, end)` to `value`.
    pub fn set_range(&mut self, begin: i32, end: i32, value: bool) {
        debug_assert!(begin <= end);
        for index in begin..end {
            self.set(index, value);
        }
    }

    /// Returns true if any bit in `[begin, end)` equals `value`.
    pub fn test_range(&self, begin: i32, end: i32, value: bool) -> bool {
        (begin..end).any(|index| self.get(index) == value)
    }

    /// Scans for a bit equal to `value` starting at `*index`, stopping before
    /// `limit`. On success stores the found position in `*index`.
    ///
    /// To use this in a loop, increment the index after each hit:
    ///
    /// ```ignore
    /// let mut index = 0;
    /// while map.find_next_bit(&mut index, limit, true) {
    ///     do_something_with(index);
    ///     index += 1;
    /// }
    /// ```
    pub fn find_next_bit(&self, index: &mut i32, limit: i32, value: bool) -> bool {
        debug_assert!(limit <= self.num_bits);
        let mut current = *index;
        while current < limit {
            // Skip whole words with no interesting bit.
            if current % INT_BITS == 0 {
                let word = self.map[(current >> LOG_INT_BITS) as usize];
                let skip = if value { word == 0 } else { word == u32::MAX };
                if skip {
                    current += INT_BITS;
                    continue;
                }
            }
            if self.get(current) == value {
                *index = current;
                return true;
            }
            current += 1;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn set_get_toggle() {
        let mut map = Bitmap::new(100);
        assert!(!map.get(77));
        map.set(77, true);
        assert!(map.get(77));
        assert!(!map.get(76));
        assert!(!map.get(78));
        map.set(77, false);
        assert!(!map.get(77));
    }

    #[test]
    fn range_ops() {
        let mut map = Bitmap::new(256);
        map.set_range(30, 70, true);
        assert!(map.test_range(0, 256, true));
        assert!(!map.test_range(0, 30, true));
        assert!(!map.test_range(70, 256, true));
        assert!(!map.test_range(30, 70, false));
    }

    #[test]
    fn find_set_bits() {
        let mut map = Bitmap::new(128);
        map.set_range(40, 45, true);
        map.set(100, true);

        let mut found = Vec::new();
        let mut index = 0;
        while map.find_next_bit(&mut index, 128, true) {
            found.push(index);
            index += 1;
        }
        assert_eq!(found, [40, 41, 42, 43, 44, 100]);
    }

    #[test]
    fn resize_preserves() {
        let mut map = Bitmap::new(40);
        map.set(33, true);
        map.resize(512);
        assert_eq!(map.size(), 512);
        assert!(map.get(33));
        assert!(!map.test_range(34, 512, true));
    }

    proptest! {
        #[test]
        fn find_next_bit_agrees_with_scan(
            bits in proptest::collection::vec(proptest::bool::ANY, 1..200),
            start in 0usize..200,
        ) {
            let mut map = Bitmap::new(bits.len() as i32);
            for (i, bit) in bits.iter().enumerate() {
                map.set(i as i32, *bit);
            }
            let start = start.min(bits.len() - 1) as i32;
            let expected = bits
                .iter()
                .enumerate()
                .skip(start as usize)
                .find(|(_, bit)| **bit)
                .map(|(i, _)| i as i32);
            let mut index = start;
            let found = map.find_next_bit(&mut index, bits.len() as i32, true);
            match expected {
                Some(position) => {
                    prop_assert!(found);
                    prop_assert_eq!(index, position);
                }
                None => prop_assert!(!found),
            }
        }
    }
}
