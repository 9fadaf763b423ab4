use serde::{Deserialize, Serialize};

use super::Acquisition;

/// Lease state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Nobody holds the resource
    Free,
    /// A holder owns the resource until release or expiry
    Held,
}

/// A named, lockable resource and its current lease fields.
///
/// Resources are provisioned free and move between free and held for their
/// whole lifetime. `key` is present exactly when `acquired_at` is, and
/// `period_ms` only ever accompanies a held resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique, immutable name
    pub name: String,
    /// When the current holder acquired the resource (Unix millis)
    pub acquired_at: Option<u64>,
    /// Bounded lease length in milliseconds; `None` means held until released
    pub period_ms: Option<u64>,
    /// Credential proving ownership of the current lease
    pub key: Option<String>,
}

impl Resource {
    pub fn free(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            acquired_at: None,
            period_ms: None,
            key: None,
        }
    }

    pub fn state(&self) -> ResourceState {
        if self.acquired_at.is_some() {
            ResourceState::Held
        } else {
            ResourceState::Free
        }
    }

    pub fn is_held(&self) -> bool {
        self.state() == ResourceState::Held
    }

    /// True when the lease fields agree with each other:
    /// held ⇔ key present ⇔ acquired_at present, period only while held.
    pub fn is_consistent(&self) -> bool {
        self.acquired_at.is_some() == self.key.is_some()
            && (self.period_ms.is_none() || self.acquired_at.is_some())
    }

    /// When a bounded lease runs out, if the resource is held with a period.
    pub fn expires_at(&self) -> Option<u64> {
        Some(self.acquired_at?.saturating_add(self.period_ms?))
    }

    /// The acquisition currently holding this resource.
    pub fn acquisition(&self) -> Option<Acquisition> {
        Some(Acquisition {
            resource: self.name.clone(),
            key: self.key.clone()?,
            acquired_at: self.acquired_at?,
            period_ms: self.period_ms,
        })
    }
}
