use serde::{Deserialize, Serialize};

/// One specific grant of a resource.
///
/// Reclaims are bound to an acquisition rather than to the resource name, so
/// a timer left over from an earlier lease can never clear a newer holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acquisition {
    pub resource: String,
    pub key: String,
    /// Unix millis at which the lease was granted
    pub acquired_at: u64,
    pub period_ms: Option<u64>,
}

impl Acquisition {
    pub fn expires_at(&self) -> Option<u64> {
        self.period_ms.map(|p| self.acquired_at.saturating_add(p))
    }
}

/// Returned to the caller after a successful acquire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub resource: String,
    pub key: String,
    pub acquired_at: u64,
    /// `None` for leases held until explicit release
    pub expires_at: Option<u64>,
}

impl From<Acquisition> for LeaseGrant {
    fn from(acquisition: Acquisition) -> Self {
        let expires_at = acquisition.expires_at();
        Self {
            resource: acquisition.resource,
            key: acquisition.key,
            acquired_at: acquisition.acquired_at,
            expires_at,
        }
    }
}

/// Reclaim job states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReclaimJobState {
    /// Waiting for its due time (or for the next retry)
    Pending,
    /// Retries exhausted; kept for operator inspection
    Dead,
}

/// A durable, deferred reclaim of one acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimJob {
    pub id: u64,
    pub acquisition: Acquisition,
    /// Earliest time (Unix millis) the job may run
    pub due_at: u64,
    /// Failed attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    pub state: ReclaimJobState,
}

/// Result of running a reclaim against the current resource row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// The acquisition still held the resource and it is now free
    Reclaimed,
    /// The resource was already free or belongs to a newer acquisition
    Stale,
}
