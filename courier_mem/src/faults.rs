use courier_core::prelude::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Errors queued up for a fake collaborator to return.
///
/// Every call on the owning fake pops one queued error, if any, and fails with it.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    queued: Arc<Mutex<VecDeque<CollaboratorError>>>,
}

impl Faults {
    /// Queues `error` for the next call.
    pub fn push(&self, error: CollaboratorError) {
        self.lock().push_back(error);
    }

    /// Queues `error` for the next `times` calls.
    pub fn push_times(&self, error: CollaboratorError, times: usize) {
        let mut queued = self.lock();
        for _ in 0..times {
            queued.push_back(error.clone());
        }
    }

    /// Drops every queued error.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Fails with the next queued error, if any.
    pub fn check(&self) -> CollaboratorResult<()> {
        match self.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<CollaboratorError>> {
        self.queued.lock().unwrap_or_else(|e| e.into_inner())
    }
}
