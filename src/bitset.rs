//! Bit set used for marking live ARG nodes.
//!
//! Node identities are dense small integers handed out by the graph arena.

/// A simple bit set backed by a vector of u64 words.
///
/// The set grows automatically when inserting beyond its current capacity.
#[derive(Debug, Clone, Default)]
pub struct BitSet {
    words: Vec<u64>,
    count: usize,
}

impl BitSet {
    const BITS_PER_WORD: usize = 64;

    /// Creates a new empty bit set with room for `capacity` bits.
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(Self::BITS_PER_WORD)],
            count: 0,
        }
    }

    /// Returns the number of set bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    fn word_and_mask(index: usize) -> (usize, u64) {
        (index / Self::BITS_PER_WORD, 1u64 << (index % Self::BITS_PER_WORD))
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        let (word, mask) = Self::word_and_mask(index);
        self.words.get(word).is_some_and(|w| w & mask != 0)
    }

    /// Sets the bit. Returns true if it was not previously set.
    pub fn insert(&mut self, index: usize) -> bool {
        let (word, mask) = Self::word_and_mask(index);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let was_clear = self.words[word] & mask == 0;
        if was_clear {
            self.words[word] |= mask;
            self.count += 1;
        }
        was_clear
    }

    /// Clears the bit. Returns true if it was previously set.
    pub fn remove(&mut self, index: usize) -> bool {
        let (word, mask) = Self::word_and_mask(index);
        let was_set = self.contains(index);
        if was_set {
            self.words[word] &= !mask;
            self.count -= 1;
        }
        was_set
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
        self.count = 0;
    }

    /// Returns an iterator over all set bit indices, in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1; // Clear lowest set bit
                Some(i * Self::BITS_PER_WORD + bit)
            })
        })
    }
}

impl Extend<usize> for BitSet {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        for index in iter {
            self.insert(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains_remove() {
        let mut bs = BitSet::new(10);
        assert!(bs.is_empty());
        assert!(bs.insert(3));
        assert!(!bs.insert(3));
        assert!(bs.contains(3));
        assert!(!bs.contains(4));
        assert!(bs.remove(3));
        assert!(!bs.remove(3));
        assert!(bs.is_empty());
    }

    #[test]
    fn test_auto_grow() {
        let mut bs = BitSet::default();
        assert!(!bs.contains(1000));
        bs.insert(1000);
        assert!(bs.contains(1000));
        assert_eq!(bs.len(), 1);
    }

    #[test]
    fn test_iter_order() {
        let mut bs = BitSet::new(100);
        bs.extend([65, 3, 64, 10, 5]);
        assert_eq!(bs.iter().collect::<Vec<_>>(), vec![3, 5, 10, 64, 65]);
        bs.clear();
        assert_eq!(bs.iter().count(), 0);
    }
}
