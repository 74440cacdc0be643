// locks.rs - Components locked by in-flight background builds
//
// Locking is advisory: every mutating call site checks the set before
// touching a component. Only a handful of entries are live at once, so
// a linear scan under a mutex is enough. Scene and runtime share entity
// ids, so entries carry the viewport they lock.

use crate::sandbox::Viewport;
use ember_core::ecs::{ComponentId, Entity};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LockedEntry {
    Component {
        viewport: Viewport,
        entity: Entity,
        component: ComponentId,
        is_shared: bool,
    },
    Global {
        viewport: Viewport,
        component: ComponentId,
    },
}

/// Why `try_reserve` locked nothing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum ReserveError {
    #[error("a background build already holds it")]
    Conflict,
    #[error("{capacity} components are already locked")]
    Full { capacity: usize },
}

#[derive(Debug)]
pub struct LockedComponents {
    entries: Mutex<Vec<LockedEntry>>,
    capacity: usize,
}

impl LockedComponents {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn contains(&self, entry: &LockedEntry) -> bool {
        self.entries.lock().contains(entry)
    }

    pub fn is_component_locked(&self, viewport: Viewport, entity: Entity, component: ComponentId, is_shared: bool) -> bool {
        self.contains(&LockedEntry::Component {
            viewport,
            entity,
            component,
            is_shared,
        })
    }

    pub fn is_global_locked(&self, viewport: Viewport, component: ComponentId) -> bool {
        self.contains(&LockedEntry::Global { viewport, component })
    }

    /// Lock all of `entries`, or none of them if any is already locked or
    /// the set is full.
    pub fn try_reserve(&self, entries: &[LockedEntry]) -> Result<(), ReserveError> {
        let mut locked = self.entries.lock();
        if entries.iter().any(|e| locked.contains(e)) {
            return Err(ReserveError::Conflict);
        }
        if locked.len() + entries.len() > self.capacity {
            return Err(ReserveError::Full {
                capacity: self.capacity,
            });
        }
        locked.extend_from_slice(entries);
        Ok(())
    }

    pub fn release(&self, entries: &[LockedEntry]) {
        let mut locked = self.entries.lock();
        for entry in entries {
            if let Some(index) = locked.iter().position(|e| e == entry) {
                locked.swap_remove(index);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
