use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TurningPointError {
    #[error("turning point list is full")]
    Full,
    #[error("turning point {offset} does not follow {last}")]
    NotIncreasing { offset: u16, last: u16 },
}

/// Fixed-capacity, strictly increasing list of element offsets.
///
/// The number of entries at or below an offset gives the parity used to decode
/// that offset's polarity, so the list is a run-length encoding of an
/// alternating bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurningPoints {
    points: [u16; Self::CAPACITY],
    len: u8,
}

impl TurningPoints {
    pub const CAPACITY: usize = 8;

    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when `points` is too long or not strictly increasing.
    pub fn from_sorted(points: &[u16]) -> Option<Self> {
        let mut list = Self::new();
        for &p in points {
            list.push(p).ok()?;
        }
        Some(list)
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.points[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == Self::CAPACITY
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Entries `<= x`, by binary search.
    pub fn count_le(&self, x: u32) -> usize {
        self.as_slice().partition_point(|&p| p as u32 <= x)
    }

    /// Whether polarity at `x` is inverted relative to the base bit.
    pub fn flips_at(&self, x: u32) -> bool {
        self.count_le(x) % 2 == 1
    }

    pub fn push(&mut self, offset: u16) -> Result<(), TurningPointError> {
        if let Some(&last) = self.as_slice().last() {
            if offset <= last {
                return Err(TurningPointError::NotIncreasing { offset, last });
            }
        }
        if self.is_full() {
            return Err(TurningPointError::Full);
        }
        self.points[self.len as usize] = offset;
        self.len += 1;
        Ok(())
    }

    /// Insert `offset`, or remove it when already present.
    ///
    /// On [`TurningPointError::Full`] the list is left untouched.
    pub fn toggle(&mut self, offset: u16) -> Result<(), TurningPointError> {
        let len = self.len();
        match self.as_slice().binary_search(&offset) {
            Ok(pos) => {
                self.points.copy_within(pos + 1..len, pos);
                self.len -= 1;
                self.points[self.len as usize] = 0;
                Ok(())
            }
            Err(_) if self.is_full() => Err(TurningPointError::Full),
            Err(pos) => {
                self.points.copy_within(pos..len, pos + 1);
                self.points[pos] = offset;
                self.len += 1;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_requires_increasing() {
        let mut tps = TurningPoints::new();
        tps.push(3).unwrap();
        tps.push(9).unwrap();
        assert_eq!(
            tps.push(9),
            Err(TurningPointError::NotIncreasing { offset: 9, last: 9 })
        );
        assert_eq!(tps.as_slice(), &[3, 9]);
    }

    #[test]
    fn test_toggle_inserts_sorted_and_removes() {
        let mut tps = TurningPoints::from_sorted(&[4, 20]).unwrap();
        tps.toggle(10).unwrap();
        assert_eq!(tps.as_slice(), &[4, 10, 20]);
        tps.toggle(4).unwrap();
        assert_eq!(tps.as_slice(), &[10, 20]);
        tps.toggle(0).unwrap();
        assert_eq!(tps.as_slice(), &[0, 10, 20]);
    }

    #[test]
    fn test_count_and_parity() {
        let tps = TurningPoints::from_sorted(&[2, 5]).unwrap();
        assert_eq!(tps.count_le(1), 0);
        assert_eq!(tps.count_le(2), 1);
        assert!(tps.flips_at(4));
        assert!(!tps.flips_at(5));
        assert!(!tps.flips_at(100));
    }

    #[test]
    fn test_overflow_leaves_list_intact() {
        let points: Vec<u16> = (1..=8).map(|i| i * 10).collect();
        let mut tps = TurningPoints::from_sorted(&points).unwrap();
        assert!(tps.is_full());

        assert_eq!(tps.toggle(15), Err(TurningPointError::Full));
        assert_eq!(tps.push(100), Err(TurningPointError::Full));
        assert_eq!(tps.as_slice(), points.as_slice());

        // removal still works when full
        tps.toggle(30).unwrap();
        assert_eq!(tps.len(), 7);
    }

    #[test]
    fn test_from_sorted_rejects_bad_input() {
        assert!(TurningPoints::from_sorted(&[5, 5]).is_none());
        assert!(TurningPoints::from_sorted(&[0; 9]).is_none());
        assert!(TurningPoints::from_sorted(&(0..9).collect::<Vec<_>>()).is_none());
    }

    proptest! {
        #[test]
        fn test_decode_matches_run_length_walk(
            raw in proptest::collection::btree_set(0u16..200, 0..=TurningPoints::CAPACITY),
            base in any::<bool>(),
        ) {
            let points: Vec<u16> = raw.into_iter().collect();
            let tps = TurningPoints::from_sorted(&points).unwrap();

            // reference: walk offsets, flipping at every turning point
            let mut bit = base;
            let mut next = points.iter().peekable();
            for x in 0u32..220 {
                while next.peek().is_some_and(|&&p| p as u32 == x) {
                    bit = !bit;
                    next.next();
                }
                prop_assert_eq!(base ^ tps.flips_at(x), bit, "offset {}", x);
            }
        }

        #[test]
        fn test_toggle_is_symmetric_difference(
            a in proptest::collection::btree_set(0u16..64, 0..=4),
            b in proptest::collection::btree_set(0u16..64, 0..=4),
        ) {
            let mut tps = TurningPoints::from_sorted(&a.iter().copied().collect::<Vec<_>>()).unwrap();
            for &p in &b {
                tps.toggle(p).unwrap();
            }
            let expected: Vec<u16> = a.symmetric_difference(&b).copied().collect();
            prop_assert_eq!(tps.as_slice(), expected.as_slice());
        }
    }
}
