use crate::errors::EngineError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

type Slot = (String, &'static str);

/// At most one outstanding call per `(key, action)`. The slot is held by the
/// returned [`InFlightPermit`] and released when it drops, whether the call
/// succeeded, failed or the future was abandoned.
#[derive(Clone, Default)]
pub struct InFlightGuard {
    active: Arc<Mutex<HashSet<Slot>>>,
}

pub struct InFlightPermit {
    active: Arc<Mutex<HashSet<Slot>>>,
    slot: Slot,
}

fn lock(set: &Mutex<HashSet<Slot>>) -> MutexGuard<'_, HashSet<Slot>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(
        &self,
        key: impl Into<String>,
        action: &'static str,
    ) -> Result<InFlightPermit, EngineError> {
        let slot = (key.into(), action);
        if !lock(&self.active).insert(slot.clone()) {
            return Err(EngineError::InFlight(action));
        }
        Ok(InFlightPermit {
            active: self.active.clone(),
            slot,
        })
    }

    pub fn is_active(&self, key: &str, action: &'static str) -> bool {
        lock(&self.active).contains(&(key.to_string(), action))
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.slot);
    }
}
