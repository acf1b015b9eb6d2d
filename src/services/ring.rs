//! Weighted recipient ring
//!
//! Each recipient occupies `max(1, weight)` consecutive slots, laid out in
//! recipient-id order. One cursor is shared by every placement in a run, so
//! fairness holds over the whole run rather than per item.

use crate::db::Recipient;

#[derive(Debug, Clone)]
pub struct WeightedRing {
    /// Indices into the recipient slice the ring was built from
    slots: Vec<usize>,
    cursor: usize,
}

impl WeightedRing {
    /// `recipients` must already be in id order
    pub fn build(recipients: &[Recipient]) -> Self {
        let slots = recipients
            .iter()
            .enumerate()
            .flat_map(|(idx, r)| std::iter::repeat(idx).take(r.weight.max(1) as usize))
            .collect();
        Self { slots, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Walk at most one revolution from the cursor and return the first slot
    /// `accept` takes. The cursor moves past every slot visited, accepted or not.
    pub fn next_accepted<F>(&mut self, mut accept: F) -> Option<usize>
    where
        F: FnMut(usize) -> bool,
    {
        for _ in 0..self.slots.len() {
            let candidate = self.slots[self.cursor];
            self.cursor = (self.cursor + 1) % self.slots.len();
            if accept(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn recipient(id: i64, weight: u32) -> Recipient {
        Recipient {
            id,
            name: format!("r{}", id),
            email: None,
            weight,
            weekly_quota: 10,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_layout_repeats_by_weight() {
        let ring = WeightedRing::build(&[recipient(1, 2), recipient(2, 0), recipient(3, 1)]);
        assert_eq!(ring.slots, vec![0, 0, 1, 2]);
    }

    #[test]
    fn test_cursor_persists_between_walks() {
        let mut ring = WeightedRing::build(&[recipient(1, 2), recipient(2, 1)]);
        let picks: Vec<_> = (0..6).map(|_| ring.next_accepted(|_| true).unwrap()).collect();
        assert_eq!(picks, vec![0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_rejected_steps_still_advance() {
        let mut ring = WeightedRing::build(&[recipient(1, 1), recipient(2, 1), recipient(3, 1)]);
        assert_eq!(ring.next_accepted(|idx| idx == 1), Some(1));
        assert_eq!(ring.cursor(), 2);
        assert_eq!(ring.next_accepted(|_| true), Some(2));
    }

    #[test]
    fn test_walk_is_bounded_to_one_revolution() {
        let mut ring = WeightedRing::build(&[recipient(1, 3), recipient(2, 2)]);
        let mut visited = 0;
        assert_eq!(ring.next_accepted(|_| { visited += 1; false }), None);
        assert_eq!(visited, ring.len());
        assert_eq!(ring.cursor(), 0);
    }

    #[test]
    fn test_empty_ring_accepts_nothing() {
        let mut ring = WeightedRing::build(&[]);
        assert!(ring.is_empty());
        assert_eq!(ring.next_accepted(|_| true), None);
    }
}
