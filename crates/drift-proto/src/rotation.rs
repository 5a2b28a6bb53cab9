//! Shuffled rotation over a station list.
//!
//! `seed` draws one random permutation; `next` walks it cyclically, skipping
//! ineligible entries. The permutation only changes on re-seed.

use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct Rotation<T> {
    items: Vec<T>,
    order: Vec<usize>,
    cursor: usize,
}

impl<T> Default for Rotation<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            order: Vec::new(),
            cursor: 0,
        }
    }
}

impl<T> Rotation<T> {
    pub fn new(items: Vec<T>) -> Self {
        let mut rotation = Self::default();
        rotation.seed(items);
        rotation
    }

    pub fn seed(&mut self, items: Vec<T>) {
        self.seed_with(items, &mut rand::thread_rng());
    }

    /// Replace the items and draw a fresh permutation (Fisher–Yates, last
    /// index down to 1). The cursor restarts at 0.
    pub fn seed_with<R: Rng + ?Sized>(&mut self, items: Vec<T>, rng: &mut R) {
        self.order = (0..items.len()).collect();
        self.order.shuffle(rng);
        self.items = items;
        self.cursor = 0;
    }

    /// First eligible item at or after the cursor, probing at most `len`
    /// entries. The cursor moves past every probed entry, the returned one
    /// included.
    pub fn next<F>(&mut self, mut is_eligible: F) -> Option<&T>
    where
        F: FnMut(&T) -> bool,
    {
        let len = self.order.len();
        for _ in 0..len {
            let idx = self.order[self.cursor];
            self.cursor = (self.cursor + 1) % len;
            if is_eligible(&self.items[idx]) {
                return Some(&self.items[idx]);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in their original (unshuffled) order.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn find<P>(&self, predicate: P) -> Option<&T>
    where
        P: FnMut(&&T) -> bool,
    {
        self.items.iter().find(predicate)
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_full_cycle_is_a_permutation_then_wraps() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut rotation = Rotation::default();
        rotation.seed_with((0..8).collect::<Vec<u32>>(), &mut rng);

        let first_cycle: Vec<u32> = (0..8).map(|_| *rotation.next(|_| true).unwrap()).collect();
        let unique: HashSet<_> = first_cycle.iter().collect();
        assert_eq!(unique.len(), 8);

        let wrapped = *rotation.next(|_| true).unwrap();
        assert_eq!(wrapped, first_cycle[0]);
    }

    #[test]
    fn test_all_ineligible_returns_none() {
        let mut rotation = Rotation::new(vec!["a", "b", "c"]);
        assert!(rotation.next(|_| false).is_none());
        assert!(rotation.next(|_| false).is_none());
    }

    #[test]
    fn test_empty_rotation_returns_none() {
        let mut rotation: Rotation<u8> = Rotation::default();
        assert!(rotation.next(|_| true).is_none());
        assert!(rotation.is_empty());
    }

    #[test]
    fn test_skipped_items_are_not_retested_next_call() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut rotation = Rotation::default();
        rotation.seed_with(vec![1, 2, 3, 4], &mut rng);
        let order: Vec<i32> = rotation.order().iter().map(|&i| rotation.items()[i]).collect();

        // only the third entry of the permutation is eligible
        let target = order[2];
        let mut probed = Vec::new();
        let got = *rotation
            .next(|v| {
                probed.push(*v);
                *v == target
            })
            .unwrap();
        assert_eq!(got, target);
        assert_eq!(probed, order[..3].to_vec());

        // the next call starts at the fourth entry
        let next = *rotation.next(|_| true).unwrap();
        assert_eq!(next, order[3]);
    }

    #[test]
    fn test_reseed_resets_cursor() {
        let mut rotation = Rotation::new(vec![10, 20]);
        rotation.next(|_| true);
        rotation.seed(vec![30]);
        assert_eq!(rotation.next(|_| true), Some(&30));
        assert_eq!(rotation.len(), 1);
    }
}
