//! High-level lease manager that wraps the transition rules, a pluggable
//! resource store and the expiry scheduler. The HTTP gateway delegates to it.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{KeySource, LeaseConfig};
use crate::error::{LeaseError, StoreError};
use crate::infrastructure::{
    Mutation, Precondition, ReclaimQueue, Rejection, ResourceStore, UpdateOutcome,
};
use crate::infrastructure_in_memory::InMemoryStore;
use crate::scheduler::{ExpiryScheduler, ReclaimReport};
use crate::types::*;

/// Alphabet for server-generated keys
const KEY_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
    'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
    'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

/// Decides acquire/release outcomes for named resources.
///
/// Safe to share between threads. `acquire` may block for the configured
/// contention wait, so async callers should run it on a blocking thread.
pub struct LeaseManager {
    store: Arc<dyn ResourceStore>,
    scheduler: ExpiryScheduler,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        queue: Arc<dyn ReclaimQueue>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
    ) -> Self {
        let scheduler =
            ExpiryScheduler::new(queue, config.reclaim_backoff, config.reclaim_batch);
        Self {
            store,
            scheduler,
            clock,
            config,
        }
    }

    /// A manager over an empty in-memory store using the wall clock.
    pub fn in_memory(config: LeaseConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::new(store.clone(), store, Arc::new(SystemClock), config)
    }

    /// A manager backed by SQLite at the given path.
    /// Leases and pending reclaims persist across restarts.
    #[cfg(feature = "sqlite")]
    pub fn with_sqlite(path: &str, config: LeaseConfig) -> Result<Self, StoreError> {
        let store = Arc::new(crate::infrastructure_sqlite::SqliteStore::open(path)?);
        Ok(Self::new(store.clone(), store, Arc::new(SystemClock), config))
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Seed a free resource. Returns false if it already existed.
    pub fn provision(&self, name: &str) -> Result<bool, LeaseError> {
        let created = self.store.provision(name).map_err(LeaseError::Internal)?;
        if created {
            tracing::info!(resource = %name, "Resource provisioned");
        }
        Ok(created)
    }

    /// All resources with their current lease fields.
    pub fn resources(&self) -> Result<Vec<Resource>, LeaseError> {
        self.store.list().map_err(LeaseError::Internal)
    }

    pub fn resource(&self, name: &str) -> Result<Resource, LeaseError> {
        self.store
            .find_by_name(name)
            .map_err(LeaseError::Internal)?
            .ok_or_else(|| LeaseError::NotFound(name.to_string()))
    }

    /// The held resource guarded by `key`, if any.
    pub fn holder_of(&self, key: &str) -> Result<Option<Resource>, LeaseError> {
        self.store.find_by_key(key).map_err(LeaseError::Internal)
    }

    /// Acquire `name` for `period_ms` (or indefinitely).
    ///
    /// If the resource is held, waits once for `contention_wait` and checks
    /// again; still held means [`LeaseError::Contended`].
    pub fn acquire(
        &self,
        name: &str,
        period_ms: Option<u64>,
        supplied_key: Option<&str>,
    ) -> Result<LeaseGrant, LeaseError> {
        log_internal(self.try_acquire(name, period_ms, supplied_key), "acquire", name)
    }

    /// Release `name`, proving ownership with `key`.
    pub fn release(&self, name: &str, key: &str) -> Result<(), LeaseError> {
        log_internal(self.try_release(name, key), "release", name)
    }

    /// Clear `acquisition` if it still holds its resource.
    ///
    /// This is the expiry callback; clients never call it. A resource that is
    /// free or re-acquired since is left untouched.
    pub fn reclaim(&self, acquisition: &Acquisition) -> Result<ReclaimOutcome, StoreError> {
        let outcome = self.store.transactional_update(
            &acquisition.resource,
            &Precondition::held_by(acquisition),
            &Mutation::Clear,
        )?;

        match outcome {
            UpdateOutcome::Applied(_) => {
                tracing::info!(
                    resource = %acquisition.resource,
                    acquired_at = acquisition.acquired_at,
                    "Lease expired, resource reclaimed"
                );
                Ok(ReclaimOutcome::Reclaimed)
            }
            UpdateOutcome::Rejected { reason, .. } => {
                tracing::debug!(
                    resource = %acquisition.resource,
                    acquired_at = acquisition.acquired_at,
                    ?reason,
                    "Stale reclaim ignored"
                );
                Ok(ReclaimOutcome::Stale)
            }
        }
    }

    /// Run every reclaim that is due now.
    pub fn reclaim_due(&self) -> Result<ReclaimReport, StoreError> {
        self.scheduler
            .run_due(self.clock.now_ms(), |acquisition| self.reclaim(acquisition))
    }

    /// Make sure every held resource with a period has a pending reclaim.
    ///
    /// Covers leases granted by a process that died before its reclaim was
    /// stored. Returns the number of resources checked.
    pub fn recover_schedules(&self) -> Result<usize, LeaseError> {
        let mut checked = 0;
        for resource in self.store.list().map_err(LeaseError::Internal)? {
            let Some(acquisition) = resource.acquisition() else {
                continue;
            };
            let Some(period_ms) = acquisition.period_ms else {
                continue;
            };
            self.scheduler
                .schedule(&acquisition, period_ms)
                .map_err(LeaseError::Internal)?;
            checked += 1;
        }
        Ok(checked)
    }

    /// Reclaims that exhausted their retries.
    pub fn dead_reclaims(&self) -> Result<Vec<ReclaimJob>, LeaseError> {
        self.scheduler.dead().map_err(LeaseError::Internal)
    }

    pub fn pending_reclaims(&self) -> Result<usize, LeaseError> {
        self.scheduler.pending_count().map_err(LeaseError::Internal)
    }

    fn try_acquire(
        &self,
        name: &str,
        period_ms: Option<u64>,
        supplied_key: Option<&str>,
    ) -> Result<LeaseGrant, LeaseError> {
        if period_ms == Some(0) {
            return Err(LeaseError::InvalidRequest(
                "period must be greater than 0".to_string(),
            ));
        }
        let key = self.resolve_key(supplied_key)?;
        let unique_key = match self.config.key_source {
            KeySource::ClientSupplied => Some(key.as_str()),
            KeySource::ServerGenerated => None,
        };

        // Reject a colliding key before spending the contention wait on it.
        if let Some(candidate) = unique_key {
            if let Some(holder) = self.store.find_by_key(candidate)? {
                if holder.name != name {
                    return Err(LeaseError::DuplicateKey {
                        holder: holder.name,
                    });
                }
            }
        }

        if self.resource(name)?.is_held() {
            tracing::debug!(
                resource = %name,
                wait_ms = self.config.contention_wait.as_millis() as u64,
                "Resource held, waiting once before re-check"
            );
            self.clock.sleep(self.config.contention_wait);
            if self.resource(name)?.is_held() {
                tracing::info!(resource = %name, "Acquire contended");
                return Err(LeaseError::Contended(name.to_string()));
            }
        }

        let now = self.clock.now_ms();
        let outcome = self.store.transactional_update(
            name,
            &Precondition::Free { unique_key },
            &Mutation::Acquire {
                acquired_at: now,
                period_ms,
                key: &key,
            },
        )?;

        let acquisition = match outcome {
            UpdateOutcome::Applied(resource) => {
                resource.acquisition().ok_or_else(|| StoreError::Corrupt {
                    name: name.to_string(),
                    reason: "acquire applied without lease fields".to_string(),
                })?
            }
            UpdateOutcome::Rejected { reason, .. } => {
                return Err(match reason {
                    Rejection::NotFound => LeaseError::NotFound(name.to_string()),
                    Rejection::KeyInUse { holder } => LeaseError::DuplicateKey { holder },
                    // Lost the compare-and-set to a concurrent acquire.
                    _ => LeaseError::Contended(name.to_string()),
                });
            }
        };

        if let Some(period_ms) = period_ms {
            if let Err(err) = self.scheduler.schedule(&acquisition, period_ms) {
                self.revert(&acquisition);
                return Err(err.into());
            }
        }

        tracing::info!(
            resource = %name,
            acquired_at = acquisition.acquired_at,
            period_ms = ?period_ms,
            "Resource acquired"
        );
        Ok(acquisition.into())
    }

    fn try_release(&self, name: &str, key: &str) -> Result<(), LeaseError> {
        let outcome = self.store.transactional_update(
            name,
            &Precondition::HeldWith { key },
            &Mutation::Clear,
        )?;

        match outcome {
            UpdateOutcome::Applied(_) => {
                tracing::info!(resource = %name, "Resource released");
                Ok(())
            }
            UpdateOutcome::Rejected { reason, .. } => Err(match reason {
                Rejection::NotFound => LeaseError::NotFound(name.to_string()),
                Rejection::Free => LeaseError::AlreadyFree(name.to_string()),
                _ => {
                    tracing::warn!(resource = %name, "Release with wrong key");
                    LeaseError::Unauthorized(name.to_string())
                }
            }),
        }
    }

    fn resolve_key(&self, supplied_key: Option<&str>) -> Result<String, LeaseError> {
        match (self.config.key_source, supplied_key) {
            (KeySource::ClientSupplied, Some(key)) => {
                if key.chars().count() != self.config.key_length {
                    return Err(LeaseError::InvalidRequest(format!(
                        "key must be {} characters",
                        self.config.key_length
                    )));
                }
                Ok(key.to_string())
            }
            (KeySource::ClientSupplied, None) => {
                Err(LeaseError::InvalidRequest("key is required".to_string()))
            }
            (KeySource::ServerGenerated, None) => {
                let len = self.config.key_length;
                Ok(nanoid::nanoid!(len, &KEY_ALPHABET))
            }
            (KeySource::ServerGenerated, Some(_)) => Err(LeaseError::InvalidRequest(
                "key is generated by the server and must not be supplied".to_string(),
            )),
        }
    }

    /// Undo a grant whose reclaim could not be stored.
    fn revert(&self, acquisition: &Acquisition) {
        let result = self.store.transactional_update(
            &acquisition.resource,
            &Precondition::held_by(acquisition),
            &Mutation::Clear,
        );
        if let Err(err) = result {
            tracing::error!(
                resource = %acquisition.resource,
                error = %err,
                "Failed to revert acquisition without a scheduled reclaim"
            );
        }
    }
}

fn log_internal<T>(result: Result<T, LeaseError>, op: &str, name: &str) -> Result<T, LeaseError> {
    if let Err(LeaseError::Internal(err)) = &result {
        tracing::error!(resource = %name, op, error = %err, "Store failure");
    }
    result
}
