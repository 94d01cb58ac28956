//! Replica counts seen right before a scale-down
//!
//! Owned by the controller rather than a prober, so a count captured before
//! a credential rotation or a leadership change is still there to restore
//! from afterwards. Entries live until the process exits.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::ResourceRef;

#[derive(Default)]
pub struct ReplicaCaptures {
    counts: Mutex<HashMap<ResourceRef, i32>>,
}

impl ReplicaCaptures {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceRef, i32>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember a running count. Zero never replaces an earlier capture.
    pub fn record(&self, resource: &ResourceRef, replicas: i32) {
        if replicas > 0 {
            self.lock().insert(resource.clone(), replicas);
        }
    }

    pub fn get(&self, resource: &ResourceRef) -> Option<i32> {
        self.lock().get(resource).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
