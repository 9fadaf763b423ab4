use crate::infrastructure::{Mutation, Precondition, Rejection};
use crate::types::Resource;

/// Pure transition rules of the per-resource lease state machine.
///
/// Stores call these inside their exclusive scope, so the decision and the
/// write can never interleave with another transition on the same row.
pub struct LeaseKernel;

impl LeaseKernel {
    /// Decide whether `precondition` holds for `current`.
    ///
    /// `key_holder` is the name of another held resource carrying the key
    /// named by `Precondition::Free { unique_key }`, if the store found one.
    pub fn check(
        precondition: &Precondition<'_>,
        current: &Resource,
        key_holder: Option<&str>,
    ) -> Result<(), Rejection> {
        match precondition {
            Precondition::Free { unique_key } => {
                // Key collisions win over contention: retrying cannot fix them.
                if unique_key.is_some() {
                    if let Some(holder) = key_holder.filter(|h| *h != current.name) {
                        return Err(Rejection::KeyInUse {
                            holder: holder.to_string(),
                        });
                    }
                }
                if current.is_held() {
                    return Err(Rejection::Held);
                }
                Ok(())
            }
            Precondition::HeldWith { key } => {
                if !current.is_held() {
                    return Err(Rejection::Free);
                }
                if current.key.as_deref() != Some(*key) {
                    return Err(Rejection::KeyMismatch);
                }
                Ok(())
            }
            Precondition::HeldBy {
                acquired_at,
                period_ms,
                key,
            } => {
                if !current.is_held() {
                    return Err(Rejection::Free);
                }
                if current.acquired_at != Some(*acquired_at)
                    || current.period_ms != *period_ms
                    || current.key.as_deref() != Some(*key)
                {
                    return Err(Rejection::KeyMismatch);
                }
                Ok(())
            }
        }
    }

    /// The row as it looks after `mutation`.
    pub fn apply(mutation: &Mutation<'_>, current: &Resource) -> Resource {
        match mutation {
            Mutation::Acquire {
                acquired_at,
                period_ms,
                key,
            } => Resource {
                name: current.name.clone(),
                acquired_at: Some(*acquired_at),
                period_ms: *period_ms,
                key: Some(key.to_string()),
            },
            Mutation::Clear => Resource::free(current.name.clone()),
        }
    }
}
