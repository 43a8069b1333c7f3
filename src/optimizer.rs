//! Priority scoring and grouping of pending transfers.
//!
//! ```text
//! priority = amount_weight * min(1, amount / amount_scale)
//!          + age_weight    * min(1, age_scale_ms / (age_ms + 1))
//! ```
//!
//! With the defaults (0.7 / 0.3, 1_000_000, 10_000ms) larger and fresher transfers
//! score higher, amount dominating. The pending set is held in descending
//! priority order; a bundle takes a prefix of it. Ties keep admission order.

use rustc_hash::FxHashMap;
use std::time::Instant;

use crate::config::PriorityConfig;
use crate::core_types::{Identity, PendingTransfer, TransferId};

/// Score a transfer of `amount` that has waited `age_ms`.
pub fn score(weights: &PriorityConfig, amount: u64, age_ms: u64) -> f64 {
    let amount_part = if weights.amount_scale == 0 {
        1.0
    } else {
        (amount as f64 / weights.amount_scale as f64).min(1.0)
    };
    let age_part = (weights.age_scale_ms as f64 / (age_ms as f64 + 1.0)).min(1.0);
    weights.amount_weight * amount_part + weights.age_weight * age_part
}

#[derive(Debug, Default)]
pub struct TransactionOptimizer {
    weights: PriorityConfig,
    /// Descending priority.
    ordered: Vec<PendingTransfer>,
    by_source: FxHashMap<Identity, Vec<TransferId>>,
}

impl TransactionOptimizer {
    pub fn new(weights: PriorityConfig) -> Self {
        Self {
            weights,
            ordered: Vec::new(),
            by_source: FxHashMap::default(),
        }
    }

    /// Score and insert; returns the assigned priority.
    pub fn add_transaction(&mut self, mut transfer: PendingTransfer) -> f64 {
        let priority = score(
            &self.weights,
            transfer.amount,
            transfer.age_ms(transfer.admitted_at),
        );
        transfer.priority = priority;

        let pos = self.ordered.partition_point(|t| t.priority >= priority);
        self.by_source
            .entry(transfer.source)
            .or_default()
            .push(transfer.id);
        self.ordered.insert(pos, transfer);
        priority
    }

    /// Top `max_count` transfers by current priority, without removing them.
    pub fn get_optimized_transactions(&mut self, max_count: usize) -> Vec<PendingTransfer> {
        self.refresh(Instant::now());
        self.ordered.iter().take(max_count).cloned().collect()
    }

    /// Remove and return the top `max_count` transfers by current priority.
    pub fn take_top(&mut self, max_count: usize) -> Vec<PendingTransfer> {
        self.refresh(Instant::now());
        let n = max_count.min(self.ordered.len());
        let taken: Vec<PendingTransfer> = self.ordered.drain(..n).collect();
        for t in &taken {
            self.forget_source(&t.source, &t.id);
        }
        taken
    }

    pub fn get_groups_by_source(&self) -> &FxHashMap<Identity, Vec<TransferId>> {
        &self.by_source
    }

    /// Purge ids from both the ordering and the source groups.
    pub fn remove_transactions(&mut self, ids: &[TransferId]) -> usize {
        let before = self.ordered.len();
        let mut gone = Vec::new();
        self.ordered.retain(|t| {
            if ids.contains(&t.id) {
                gone.push((t.source, t.id));
                false
            } else {
                true
            }
        });
        for (source, id) in &gone {
            self.forget_source(source, id);
        }
        before - self.ordered.len()
    }

    /// Transfers whose stored priority is strictly above `threshold`.
    pub fn count_above(&self, threshold: f64) -> usize {
        // Ordered descending, so the matches form a prefix.
        self.ordered.partition_point(|t| t.priority > threshold)
    }

    pub fn contains(&self, id: &TransferId) -> bool {
        self.ordered.iter().any(|t| t.id == *id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Re-score against `now` and restore the ordering. Stable, so ties keep admission order.
    fn refresh(&mut self, now: Instant) {
        for t in &mut self.ordered {
            t.priority = score(&self.weights, t.amount, t.age_ms(now));
        }
        self.ordered
            .sort_by(|a, b| b.priority.total_cmp(&a.priority));
    }

    fn forget_source(&mut self, source: &Identity, id: &TransferId) {
        if let Some(ids) = self.by_source.get_mut(source) {
            ids.retain(|x| x != id);
            if ids.is_empty() {
                self.by_source.remove(source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::SourceRef;

    fn transfer(src: u8, amount: u64) -> PendingTransfer {
        PendingTransfer::new(
            SourceRef::Identity(Identity::from_bytes([src; 32])),
            Identity::from_bytes([0xEE; 32]),
            amount,
        )
    }

    #[test]
    fn test_score_formula() {
        let w = PriorityConfig::default();
        assert!((score(&w, 1_000_000, 0) - 1.0).abs() < 1e-9);
        assert!((score(&w, 500_000, 0) - 0.65).abs() < 1e-9);
        assert!((score(&w, 2_000_000, 0) - 1.0).abs() < 1e-9);
        // Old transfers lose the freshness component.
        assert!((score(&w, 0, 99_999) - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_larger_amount_first_at_same_timestamp() {
        let mut opt = TransactionOptimizer::new(PriorityConfig::default());
        let now = Instant::now();
        let mut small = transfer(1, 10);
        let mut large = transfer(2, 1_000_000);
        small.admitted_at = now;
        large.admitted_at = now;
        let large_id = large.id;

        opt.add_transaction(small);
        opt.add_transaction(large);

        let top = opt.get_optimized_transactions(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].id, large_id);
        assert!(top[0].priority > top[1].priority);
    }

    #[test]
    fn test_ties_keep_admission_order() {
        let mut opt = TransactionOptimizer::new(PriorityConfig::default());
        let ids: Vec<_> = (0..5)
            .map(|i| {
                let t = transfer(i, 1_000);
                let id = t.id;
                opt.add_transaction(t);
                id
            })
            .collect();
        let top: Vec<_> = opt.take_top(5).into_iter().map(|t| t.id).collect();
        assert_eq!(top, ids);
        assert!(opt.is_empty());
        assert!(opt.get_groups_by_source().is_empty());
    }

    #[test]
    fn test_take_top_removes_prefix_only() {
        let mut opt = TransactionOptimizer::new(PriorityConfig::default());
        for amount in [10, 900_000, 50, 700_000] {
            opt.add_transaction(transfer(1, amount));
        }
        let taken = opt.take_top(2);
        assert_eq!(
            taken.iter().map(|t| t.amount).collect::<Vec<_>>(),
            vec![900_000, 700_000]
        );
        assert_eq!(opt.len(), 2);
        assert_eq!(opt.get_groups_by_source()[&Identity::from_bytes([1; 32])].len(), 2);
    }

    #[test]
    fn test_groups_and_remove() {
        let mut opt = TransactionOptimizer::new(PriorityConfig::default());
        let a1 = transfer(1, 100);
        let a2 = transfer(1, 200);
        let b1 = transfer(2, 300);
        let (a1_id, b1_id) = (a1.id, b1.id);
        opt.add_transaction(a1);
        opt.add_transaction(a2);
        opt.add_transaction(b1);

        let groups = opt.get_groups_by_source();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&Identity::from_bytes([1; 32])].len(), 2);

        assert_eq!(opt.remove_transactions(&[a1_id, b1_id]), 2);
        assert_eq!(opt.len(), 1);
        assert!(!opt.contains(&a1_id));
        assert!(!opt.get_groups_by_source().contains_key(&Identity::from_bytes([2; 32])));
    }

    #[test]
    fn test_count_above_threshold() {
        let mut opt = TransactionOptimizer::new(PriorityConfig::default());
        opt.add_transaction(transfer(1, 1_000_000)); // 1.0
        opt.add_transaction(transfer(2, 800_000)); // 0.86
        opt.add_transaction(transfer(3, 100)); // ~0.3
        assert_eq!(opt.count_above(0.8), 2);
        assert_eq!(opt.count_above(0.95), 1);
    }
}
