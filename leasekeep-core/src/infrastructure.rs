use crate::error::StoreError;
use crate::types::{Acquisition, ReclaimJob, Resource};

/// Condition the current row must satisfy for a mutation to be applied.
///
/// Stores evaluate it with [`crate::state::LeaseKernel::check`] inside the
/// same exclusive scope that performs the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition<'a> {
    /// The row is free. With `unique_key`, no other held row may carry that key.
    Free { unique_key: Option<&'a str> },
    /// The row is held under exactly this key.
    HeldWith { key: &'a str },
    /// The row is still held by this exact acquisition. The period is part
    /// of its identity: the same key may re-acquire within one millisecond.
    HeldBy {
        acquired_at: u64,
        period_ms: Option<u64>,
        key: &'a str,
    },
}

impl<'a> Precondition<'a> {
    pub fn held_by(acquisition: &'a Acquisition) -> Self {
        Precondition::HeldBy {
            acquired_at: acquisition.acquired_at,
            period_ms: acquisition.period_ms,
            key: &acquisition.key,
        }
    }
}

/// New lease fields to write when the precondition holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<'a> {
    Acquire {
        acquired_at: u64,
        period_ms: Option<u64>,
        key: &'a str,
    },
    /// Back to free: clears `acquired_at`, `period_ms` and `key`
    Clear,
}

/// Why a transactional update was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotFound,
    /// Expected free, found held
    Held,
    /// Expected held, found free
    Free,
    /// Held, but under a different key or by a different acquisition
    KeyMismatch,
    /// The requested key guards another held resource
    KeyInUse { holder: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied(Resource),
    Rejected {
        reason: Rejection,
        current: Option<Resource>,
    },
}

/// Durable table of named resources and their lease state.
///
/// Every state transition goes through [`ResourceStore::transactional_update`];
/// there is no separate write path.
pub trait ResourceStore: Send + Sync {
    fn find_by_name(&self, name: &str) -> Result<Option<Resource>, StoreError>;

    /// The held resource guarded by `key`, if any
    fn find_by_key(&self, key: &str) -> Result<Option<Resource>, StoreError>;

    fn list(&self) -> Result<Vec<Resource>, StoreError>;

    /// Insert a free resource. Returns false if it already existed.
    fn provision(&self, name: &str) -> Result<bool, StoreError>;

    /// Atomically read the row, check `precondition`, and write `mutation`.
    /// Concurrent updates of the same row are strictly serialized.
    fn transactional_update(
        &self,
        name: &str,
        precondition: &Precondition<'_>,
        mutation: &Mutation<'_>,
    ) -> Result<UpdateOutcome, StoreError>;
}

/// Durable queue of pending reclaim jobs.
pub trait ReclaimQueue: Send + Sync {
    /// Add a job for `acquisition`. Enqueueing the same acquisition twice is
    /// a no-op that returns false.
    fn enqueue(&self, acquisition: &Acquisition, due_at: u64) -> Result<bool, StoreError>;

    /// Pending jobs with `due_at <= now`, oldest first
    fn due(&self, now: u64, limit: usize) -> Result<Vec<ReclaimJob>, StoreError>;

    fn complete(&self, id: u64) -> Result<(), StoreError>;

    /// Record a failed attempt and push the job back to `next_due`
    fn retry(&self, id: u64, next_due: u64, error: &str) -> Result<(), StoreError>;

    /// Record a final failed attempt and park the job as dead
    fn bury(&self, id: u64, error: &str) -> Result<(), StoreError>;

    fn dead(&self) -> Result<Vec<ReclaimJob>, StoreError>;

    fn pending_count(&self) -> Result<usize, StoreError>;
}
