use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::StoreError;
use crate::infrastructure::{
    Mutation, Precondition, ReclaimQueue, Rejection, ResourceStore, UpdateOutcome,
};
use crate::state::LeaseKernel;
use crate::types::{Acquisition, ReclaimJob, ReclaimJobState, Resource};

/// Process-local store for development and tests. Nothing survives a restart.
///
/// Each resource row has its own lock. The held-key index is only ever locked
/// after a row lock, never before.
#[derive(Default)]
pub struct InMemoryStore {
    rows: RwLock<HashMap<String, Arc<Mutex<Resource>>>>,
    // key -> name of the resource it currently guards
    held_keys: Mutex<HashMap<String, String>>,
    jobs: Mutex<JobTable>,
}

#[derive(Default)]
struct JobTable {
    next_id: u64,
    jobs: BTreeMap<u64, ReclaimJob>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with free resources.
    pub fn with_resources<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let mut rows = store.rows.write();
            for name in names {
                let name = name.into();
                rows.insert(name.clone(), Arc::new(Mutex::new(Resource::free(name))));
            }
        }
        store
    }

    fn row(&self, name: &str) -> Option<Arc<Mutex<Resource>>> {
        self.rows.read().get(name).cloned()
    }
}

impl ResourceStore for InMemoryStore {
    fn find_by_name(&self, name: &str) -> Result<Option<Resource>, StoreError> {
        Ok(self.row(name).map(|row| row.lock().clone()))
    }

    fn find_by_key(&self, key: &str) -> Result<Option<Resource>, StoreError> {
        // Drop the index lock before touching a row to keep the lock order.
        let name = match self.held_keys.lock().get(key) {
            Some(name) => name.clone(),
            None => return Ok(None),
        };
        let Some(row) = self.row(&name) else {
            return Ok(None);
        };
        let resource = row.lock().clone();
        Ok((resource.key.as_deref() == Some(key)).then_some(resource))
    }

    fn list(&self) -> Result<Vec<Resource>, StoreError> {
        let rows: Vec<_> = self.rows.read().values().cloned().collect();
        let mut resources: Vec<Resource> = rows.iter().map(|row| row.lock().clone()).collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(resources)
    }

    fn provision(&self, name: &str) -> Result<bool, StoreError> {
        let mut rows = self.rows.write();
        if rows.contains_key(name) {
            return Ok(false);
        }
        rows.insert(name.to_string(), Arc::new(Mutex::new(Resource::free(name))));
        Ok(true)
    }

    fn transactional_update(
        &self,
        name: &str,
        precondition: &Precondition<'_>,
        mutation: &Mutation<'_>,
    ) -> Result<UpdateOutcome, StoreError> {
        let Some(row) = self.row(name) else {
            return Ok(UpdateOutcome::Rejected {
                reason: Rejection::NotFound,
                current: None,
            });
        };

        let mut current = row.lock();
        let mut keys = self.held_keys.lock();

        let key_holder = match precondition {
            Precondition::Free {
                unique_key: Some(key),
            } => keys.get(*key).cloned(),
            _ => None,
        };

        if let Err(reason) = LeaseKernel::check(precondition, &current, key_holder.as_deref()) {
            return Ok(UpdateOutcome::Rejected {
                reason,
                current: Some(current.clone()),
            });
        }

        let next = LeaseKernel::apply(mutation, &current);

        if let Some(old) = &current.key {
            if keys.get(old).map(String::as_str) == Some(name) {
                keys.remove(old);
            }
        }
        if let Some(new) = &next.key {
            keys.insert(new.clone(), name.to_string());
        }
        *current = next.clone();

        Ok(UpdateOutcome::Applied(next))
    }
}

impl ReclaimQueue for InMemoryStore {
    fn enqueue(&self, acquisition: &Acquisition, due_at: u64) -> Result<bool, StoreError> {
        let mut table = self.jobs.lock();
        if table.jobs.values().any(|job| {
            job.acquisition.resource == acquisition.resource
                && job.acquisition.acquired_at == acquisition.acquired_at
                && job.acquisition.key == acquisition.key
                && job.acquisition.period_ms == acquisition.period_ms
        }) {
            return Ok(false);
        }

        table.next_id += 1;
        let id = table.next_id;
        table.jobs.insert(
            id,
            ReclaimJob {
                id,
                acquisition: acquisition.clone(),
                due_at,
                attempts: 0,
                last_error: None,
                state: ReclaimJobState::Pending,
            },
        );
        Ok(true)
    }

    fn due(&self, now: u64, limit: usize) -> Result<Vec<ReclaimJob>, StoreError> {
        let table = self.jobs.lock();
        let mut due: Vec<ReclaimJob> = table
            .jobs
            .values()
            .filter(|job| job.state == ReclaimJobState::Pending && job.due_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|job| (job.due_at, job.id));
        due.truncate(limit);
        Ok(due)
    }

    fn complete(&self, id: u64) -> Result<(), StoreError> {
        self.jobs.lock().jobs.remove(&id);
        Ok(())
    }

    fn retry(&self, id: u64, next_due: u64, error: &str) -> Result<(), StoreError> {
        if let Some(job) = self.jobs.lock().jobs.get_mut(&id) {
            job.attempts += 1;
            job.due_at = next_due;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    fn bury(&self, id: u64, error: &str) -> Result<(), StoreError> {
        if let Some(job) = self.jobs.lock().jobs.get_mut(&id) {
            job.attempts += 1;
            job.state = ReclaimJobState::Dead;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    fn dead(&self) -> Result<Vec<ReclaimJob>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .jobs
            .values()
            .filter(|job| job.state == ReclaimJobState::Dead)
            .cloned()
            .collect())
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .jobs
            .lock()
            .jobs
            .values()
            .filter(|job| job.state == ReclaimJobState::Pending)
            .count())
    }
}
