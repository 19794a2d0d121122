//! Token-budgeted batches
//!
//! An `OpenBatch` grows while the assembler fills it; `seal()` turns it into a
//! `SealedBatch`, which has no mutating API. The same `BudgetGate` decides
//! admission into a batch both here and in the shard queue's drain.

use crate::request::RequestRecord;
use ringbatch_common::{BatchId, RequestId};
use std::time::Instant;

/// Greedy admission rule for one batch
///
/// A member is admitted while the count stays under `max_members` and the
/// cumulative cost stays within `budget`. The first member is always admitted,
/// so a request costing more than the whole budget still gets a batch of its
/// own instead of starving.
#[derive(Debug, Clone, Copy)]
pub struct BudgetGate {
    budget: usize,
    max_members: usize,
    used: usize,
    members: usize,
}

impl BudgetGate {
    pub fn new(budget: usize, max_members: usize) -> Self {
        Self {
            budget,
            max_members,
            used: 0,
            members: 0,
        }
    }

    pub fn admits(&self, cost: usize) -> bool {
        if self.members >= self.max_members {
            return false;
        }
        self.members == 0 || self.used + cost <= self.budget
    }

    pub fn take(&mut self, cost: usize) {
        self.used += cost;
        self.members += 1;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn budget(&self) -> usize {
        self.budget
    }
}

/// Batch under construction
#[derive(Debug)]
pub struct OpenBatch {
    batch_id: BatchId,
    shard: usize,
    gate: BudgetGate,
    members: Vec<RequestRecord>,
}

impl OpenBatch {
    pub fn new(batch_id: BatchId, shard: usize, budget: usize, max_members: usize) -> Self {
        Self {
            batch_id,
            shard,
            gate: BudgetGate::new(budget, max_members),
            members: Vec::new(),
        }
    }

    /// Add a member drained under the same budget rule
    pub fn push(&mut self, record: RequestRecord) {
        debug_assert!(
            self.gate.admits(record.cost()),
            "record {} overflows batch {}",
            record.id(),
            self.batch_id
        );
        self.gate.take(record.cost());
        self.members.push(record);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn seal(self) -> SealedBatch {
        let oversized = self.members.len() == 1 && self.gate.used() > self.gate.budget();
        SealedBatch {
            batch_id: self.batch_id,
            shard: self.shard,
            token_budget_used: self.gate.used(),
            oversized,
            members: self.members,
            sealed_at: Instant::now(),
        }
    }
}

/// Immutable batch handed from an assembler to the dispatch coordinator
#[derive(Debug)]
pub struct SealedBatch {
    batch_id: BatchId,
    shard: usize,
    token_budget_used: usize,
    oversized: bool,
    members: Vec<RequestRecord>,
    sealed_at: Instant,
}

impl SealedBatch {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Ring shard the members were drained from
    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn token_budget_used(&self) -> usize {
        self.token_budget_used
    }

    /// Single member whose cost alone exceeds the budget
    pub fn is_oversized(&self) -> bool {
        self.oversized
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn sealed_at(&self) -> Instant {
        self.sealed_at
    }

    pub fn members(&self) -> &[RequestRecord] {
        &self.members
    }

    pub fn member_ids(&self) -> Vec<RequestId> {
        self.members.iter().map(RequestRecord::id).collect()
    }

    pub(crate) fn into_members(self) -> Vec<RequestRecord> {
        self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestSpec;
    use ringbatch_common::config::CostModel;
    use tokio::sync::oneshot;

    fn record(id: RequestId, cost: usize) -> RequestRecord {
        let (tx, _rx) = oneshot::channel();
        RequestRecord::new(id, RequestSpec::new(vec![1; cost], 1), CostModel::PromptOnly, tx)
    }

    #[test]
    fn test_budget_gate() {
        let mut gate = BudgetGate::new(10, 3);
        assert!(gate.admits(15));

        gate.take(4);
        assert!(gate.admits(4));
        gate.take(4);
        assert!(!gate.admits(4));
        assert!(gate.admits(2));
        gate.take(2);

        // member cap reached even though budget is exhausted exactly
        assert!(!gate.admits(0));
        assert_eq!(gate.used(), 10);
    }

    #[test]
    fn test_seal_records_budget() {
        let mut batch = OpenBatch::new(1, 0, 10, 3);
        batch.push(record(1, 4));
        batch.push(record(2, 4));

        let sealed = batch.seal();
        assert_eq!(sealed.token_budget_used(), 8);
        assert_eq!(sealed.member_ids(), vec![1, 2]);
        assert!(!sealed.is_oversized());
    }

    #[test]
    fn test_seal_oversized() {
        let mut batch = OpenBatch::new(2, 0, 10, 3);
        batch.push(record(1, 15));

        let sealed = batch.seal();
        assert!(sealed.is_oversized());
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed.token_budget_used(), 15);
    }
}
