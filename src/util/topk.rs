//! Bounded best-k collection with deterministic tie-breaking.

use std::cmp::Ordering;

/// Item ranked by a score, with an insertion order for ties.
pub(crate) trait Ranked {
    /// Higher is better.
    fn score(&self) -> f64;
    /// Smaller wins ties.
    fn order(&self) -> usize;
}

fn rank_desc<T: Ranked>(a: &T, b: &T) -> Ordering {
    b.score()
        .total_cmp(&a.score())
        .then_with(|| a.order().cmp(&b.order()))
}

/// Top-K container with O(k) insertion cost.
pub(crate) struct TopK<T> {
    k: usize,
    items: Vec<T>,
}

impl<T: Ranked> TopK<T> {
    /// Creates a collector keeping at most `k` items.
    pub(crate) fn new(k: usize) -> Self {
        Self {
            k,
            items: Vec::with_capacity(k),
        }
    }

    /// Pushes an item, evicting the worst if at capacity.
    pub(crate) fn push(&mut self, item: T) {
        if self.k == 0 {
            return;
        }
        if self.items.len() < self.k {
            self.items.push(item);
            return;
        }

        let mut worst_idx = 0usize;
        for (idx, existing) in self.items.iter().enumerate().skip(1) {
            if rank_desc(existing, &self.items[worst_idx]) == Ordering::Greater {
                worst_idx = idx;
            }
        }

        if rank_desc(&item, &self.items[worst_idx]) == Ordering::Less {
            self.items[worst_idx] = item;
        }
    }

    /// Returns items best first.
    pub(crate) fn into_sorted_desc(mut self) -> Vec<T> {
        self.items.sort_by(rank_desc);
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::{Ranked, TopK};

    #[derive(Debug, PartialEq)]
    struct Item(f64, usize);

    impl Ranked for Item {
        fn score(&self) -> f64 {
            self.0
        }
        fn order(&self) -> usize {
            self.1
        }
    }

    #[test]
    fn keeps_best_and_prefers_earlier_ties() {
        let mut topk = TopK::new(2);
        topk.push(Item(0.5, 0));
        topk.push(Item(0.9, 1));
        topk.push(Item(0.5, 2));
        topk.push(Item(0.7, 3));
        assert_eq!(topk.into_sorted_desc(), vec![Item(0.9, 1), Item(0.7, 3)]);

        let mut ties = TopK::new(1);
        ties.push(Item(0.5, 4));
        ties.push(Item(0.5, 2));
        assert_eq!(ties.into_sorted_desc(), vec![Item(0.5, 2)]);
    }
}
