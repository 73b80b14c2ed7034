//! In-memory repository of open batch runs.

use crate::clock::EpochClock;
use crate::error::{LastPriceError, Result};
use crate::types::{BatchRunId, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::run::BatchRun;

#[derive(Default)]
struct Inner {
    runs: HashMap<BatchRunId, BatchRun>,
    /// Runs ordered by last update, oldest first.
    by_age: BTreeSet<(Timestamp, BatchRunId)>,
}

impl Inner {
    fn remove(&mut self, id: BatchRunId) -> Option<BatchRun> {
        let run = self.runs.remove(&id)?;
        self.by_age.remove(&(run.updated_at(), id));
        Some(run)
    }
}

/// Open batch runs keyed by id.
///
/// A single read/write lock guards all runs. Uploads are chunked and
/// infrequent compared to publishes, so contention here does not touch the
/// publish path.
pub struct BatchRunRepository {
    inner: RwLock<Inner>,
    clock: Arc<dyn EpochClock>,
    next_id: AtomicU64,
}

impl BatchRunRepository {
    pub fn new(clock: Arc<dyn EpochClock>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a new, empty run.
    pub fn create(&self) -> BatchRunId {
        let id = BatchRunId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let now = self.clock.now();
        let mut inner = self.inner.write();
        inner.runs.insert(id, BatchRun::new(id, now));
        inner.by_age.insert((now, id));
        id
    }

    /// Copy of a run.
    pub fn get(&self, id: BatchRunId) -> Option<BatchRun> {
        self.inner.read().runs.get(&id).cloned()
    }

    /// Apply `update` to a run and mark it as recently updated.
    pub fn update<F>(&self, id: BatchRunId, update: F) -> Result<()>
    where
        F: FnOnce(&mut BatchRun),
    {
        let now = self.clock.now();
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or(LastPriceError::BatchNotFound(id))?;

        inner.by_age.remove(&(run.updated_at(), id));
        update(run);
        run.touch(now);
        inner.by_age.insert((now, id));
        Ok(())
    }

    pub fn remove(&self, id: BatchRunId) -> Option<BatchRun> {
        self.inner.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove runs idle for `timeout` or longer, oldest first, at most
    /// `limit` of them. Returns the ids removed.
    pub fn remove_outdated(&self, timeout: Duration, limit: Option<usize>) -> Vec<BatchRunId> {
        let timeout_ns = timeout.as_nanos().min(i64::MAX as u128) as i64;
        let cutoff = Timestamp(self.clock.now().0.saturating_sub(timeout_ns));
        let limit = limit.unwrap_or(usize::MAX);

        let mut inner = self.inner.write();
        let expired: Vec<BatchRunId> = inner
            .by_age
            .iter()
            .take_while(|(updated_at, _)| *updated_at <= cutoff)
            .take(limit)
            .map(|(_, id)| *id)
            .collect();
        for id in &expired {
            inner.remove(*id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::PriceInput;

    fn repository() -> (BatchRunRepository, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        (BatchRunRepository::new(clock.clone()), clock)
    }

    #[test]
    fn test_create_get_remove() {
        let (repo, _) = repository();
        let id = repo.create();
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.get(id).unwrap().id(), id);

        assert!(repo.remove(id).is_some());
        assert!(repo.remove(id).is_none());
        assert!(repo.is_empty());
    }

    #[test]
    fn test_update_unknown_run() {
        let (repo, _) = repository();
        let result = repo.update(BatchRunId(99), |_| {});
        assert!(matches!(result, Err(LastPriceError::BatchNotFound(BatchRunId(99)))));
    }

    #[test]
    fn test_remove_outdated_respects_updates_and_limit() {
        let (repo, clock) = repository();
        let a = repo.create();
        let b = repo.create();
        let c = repo.create();

        clock.advance_millis(4_000);
        repo.update(b, |run| {
            run.update_records(vec![PriceInput::new("AIR", vec![1], Timestamp(0))])
        })
        .unwrap();

        clock.advance_millis(2_000);
        // a and c are 6s idle, b is 2s idle.
        let removed = repo.remove_outdated(Duration::from_secs(5), Some(1));
        assert_eq!(removed, vec![a]);

        let removed = repo.remove_outdated(Duration::from_secs(5), None);
        assert_eq!(removed, vec![c]);

        assert_eq!(repo.len(), 1);
        assert_eq!(repo.get(b).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_outdated_at_exact_timeout() {
        let (repo, clock) = repository();
        let id = repo.create();

        clock.advance_millis(4_999);
        assert!(repo.remove_outdated(Duration::from_secs(5), None).is_empty());

        clock.advance_millis(1);
        assert_eq!(repo.remove_outdated(Duration::from_secs(5), None), vec![id]);
        assert!(repo.is_empty());
    }
}
