//! Concurrency budget for dispatched underlying calls.

/// Counter of currently-dispatched underlying calls, bounded by the
/// configured limit. Only ever touched under the engine lock, so plain
/// integers suffice.
#[derive(Debug)]
pub(crate) struct ConcurrencyBudget {
    limit: usize,
    dispatched: usize,
}

impl ConcurrencyBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, dispatched: 0 }
    }

    /// Reserve a dispatch slot. Returns false when the budget is exhausted.
    pub fn try_acquire(&mut self) -> bool {
        if self.dispatched < self.limit {
            self.dispatched += 1;
            true
        } else {
            false
        }
    }

    /// Release a slot after the underlying call finishes or is cancelled.
    pub fn release(&mut self) {
        debug_assert!(self.dispatched > 0, "budget released more than acquired");
        self.dispatched = self.dispatched.saturating_sub(1);
    }

    pub fn has_capacity(&self) -> bool {
        self.dispatched < self.limit
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_up_to_limit_then_reject() {
        let mut budget = ConcurrencyBudget::new(2);
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
        assert_eq!(budget.dispatched(), 2);
    }

    #[test]
    fn release_frees_a_slot() {
        let mut budget = ConcurrencyBudget::new(1);
        assert!(budget.try_acquire());
        assert!(!budget.has_capacity());
        budget.release();
        assert!(budget.has_capacity());
        assert!(budget.try_acquire());
    }

    #[test]
    fn never_goes_negative() {
        let mut budget = ConcurrencyBudget::new(1);
        assert!(budget.try_acquire());
        budget.release();
        assert_eq!(budget.dispatched(), 0);
        assert_eq!(budget.limit(), 1);
    }
}
