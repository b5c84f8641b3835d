//! Concurrency gate around a generation strategy.

use std::sync::Arc;
use tokio::sync::Notify;
use tr_types::{Observation, TrellisResult};

use crate::strategy::{GenerationOutcome, GenerationStrategy, LedgerSnapshot};

/// Bounds the number of RUNNING trials by refusing to ask the wrapped
/// strategy while every slot is taken.
///
/// With no bound the limiter is a pass-through: proposals are issued as fast
/// as they are requested, trading sample efficiency for throughput.
pub struct ConcurrencyLimiter<S> {
    inner: S,
    max_concurrent: Option<usize>,
    slot_freed: Arc<Notify>,
    releases: usize,
}

impl<S: GenerationStrategy> ConcurrencyLimiter<S> {
    pub fn new(inner: S, max_concurrent: Option<usize>) -> Self {
        Self {
            inner,
            max_concurrent,
            slot_freed: Arc::new(Notify::new()),
            releases: 0,
        }
    }

    pub fn unbounded(inner: S) -> Self {
        Self::new(inner, None)
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.max_concurrent
    }

    /// Free slots given `running` RUNNING trials; `None` means unlimited.
    pub fn available_slots(&self, running: usize) -> Option<usize> {
        self.max_concurrent.map(|max| max.saturating_sub(running))
    }

    pub fn has_capacity(&self, running: usize) -> bool {
        self.available_slots(running).map_or(true, |n| n > 0)
    }

    /// Ask the wrapped strategy for at most as many proposals as there are
    /// free slots. Returns `NoProposalYet` when none are free.
    pub fn ask(&mut self, snapshot: &LedgerSnapshot, count: usize) -> TrellisResult<GenerationOutcome> {
        let count = match self.available_slots(snapshot.running_count) {
            Some(0) => {
                return Ok(GenerationOutcome::NoProposalYet {
                    reason: format!(
                        "{} trials running, limit is {}",
                        snapshot.running_count,
                        self.max_concurrent.unwrap_or_default()
                    ),
                })
            }
            Some(free) => count.min(free),
            None => count,
        };
        self.inner.ask(snapshot, count)
    }

    pub fn tell(&mut self, trial_index: usize, result: &Observation) {
        self.inner.tell(trial_index, result);
    }

    /// Record that a trial left RUNNING and wake anyone waiting for a slot.
    pub fn release(&mut self) {
        self.releases += 1;
        self.slot_freed.notify_waiters();
    }

    /// Total slots released so far.
    pub fn releases(&self) -> usize {
        self.releases
    }

    /// Signal fired on every [`release`](Self::release).
    pub fn slot_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.slot_freed)
    }

    pub fn strategy(&self) -> &S {
        &self.inner
    }

    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RandomSearch;
    use tr_types::{Objective, SearchSpace};

    fn strategy() -> RandomSearch {
        let space = SearchSpace::builder(Objective::maximize("accuracy"))
            .add_float("momentum", 0.0, 1.0)
            .build()
            .unwrap();
        RandomSearch::with_seed(space, 1)
    }

    fn snapshot(running: usize) -> LedgerSnapshot {
        LedgerSnapshot {
            running_count: running,
            num_trials: running,
            ..Default::default()
        }
    }

    #[test]
    fn refuses_when_full() {
        let mut limiter = ConcurrencyLimiter::new(strategy(), Some(2));
        assert!(limiter.has_capacity(1));
        assert!(!limiter.has_capacity(2));
        assert!(matches!(
            limiter.ask(&snapshot(2), 1).unwrap(),
            GenerationOutcome::NoProposalYet { .. }
        ));
    }

    #[test]
    fn caps_batch_to_free_slots() {
        let mut limiter = ConcurrencyLimiter::new(strategy(), Some(3));
        match limiter.ask(&snapshot(1), 10).unwrap() {
            GenerationOutcome::Proposed(p) => assert_eq!(p.len(), 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unbounded_is_pass_through() {
        let mut limiter = ConcurrencyLimiter::unbounded(strategy());
        assert_eq!(limiter.available_slots(1_000), None);
        match limiter.ask(&snapshot(1_000), 4).unwrap() {
            GenerationOutcome::Proposed(p) => assert_eq!(p.len(), 4),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_wakes_waiters() {
        let mut limiter = ConcurrencyLimiter::new(strategy(), Some(1));
        let signal = limiter.slot_signal();
        let notified = signal.notified();
        limiter.release();
        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .expect("waiter should be woken by release");
        assert_eq!(limiter.releases(), 1);
    }
}
