//! Arrival bitmap indexed by packet number

/// Fixed-capacity bit set over packet indices `0..len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBitmap {
    words: Vec<u64>,
    len: usize,
    marked: usize,
}

impl PacketBitmap {
    pub fn new(len: usize) -> Self {
        Self { words: vec![0; len.div_ceil(64)], len, marked: 0 }
    }

    /// Number of addressable indices
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of marked indices
    pub fn count(&self) -> usize {
        self.marked
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Mark `index`. Returns false if it was already marked or out of range.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = &mut self.words[index / 64];
        let bit = 1u64 << (index % 64);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        self.marked += 1;
        true
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
        self.marked = 0;
    }

    /// First unmarked index in `from..to`, skipping whole marked words.
    pub fn next_unmarked(&self, from: usize, to: usize) -> Option<usize> {
        let to = to.min(self.len);
        let mut index = from;
        while index < to {
            let word = self.words[index / 64] | ((1u64 << (index % 64)) - 1);
            if word == u64::MAX {
                index = (index / 64 + 1) * 64;
                continue;
            }
            let candidate = (index / 64) * 64 + (!word).trailing_zeros() as usize;
            return (candidate < to).then_some(candidate);
        }
        None
    }

    /// First marked index in `from..to`.
    pub fn next_marked(&self, from: usize, to: usize) -> Option<usize> {
        let to = to.min(self.len);
        let mut index = from;
        while index < to {
            let word = self.words[index / 64] & !((1u64 << (index % 64)) - 1);
            if word == 0 {
                index = (index / 64 + 1) * 64;
                continue;
            }
            let candidate = (index / 64) * 64 + word.trailing_zeros() as usize;
            return (candidate < to).then_some(candidate);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent() {
        let mut bitmap = PacketBitmap::new(130);
        assert!(bitmap.set(129));
        assert!(!bitmap.set(129));
        assert!(!bitmap.set(130));
        assert_eq!(bitmap.count(), 1);
        assert!(bitmap.get(129));
        bitmap.clear();
        assert_eq!(bitmap.count(), 0);
        assert!(!bitmap.get(129));
    }

    #[test]
    fn scans_cross_word_boundaries() {
        let mut bitmap = PacketBitmap::new(200);
        for i in 0..150 {
            bitmap.set(i);
        }
        assert_eq!(bitmap.next_unmarked(0, 200), Some(150));
        assert_eq!(bitmap.next_unmarked(0, 150), None);
        assert_eq!(bitmap.next_marked(150, 200), None);
        bitmap.set(190);
        assert_eq!(bitmap.next_marked(150, 200), Some(190));
        assert_eq!(bitmap.next_unmarked(63, 64), None);
    }
}
