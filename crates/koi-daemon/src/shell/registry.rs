use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::DaemonError;

/// Number of helper processes that may be in flight at once.
pub const HELPER_SLOT_CAPACITY: usize = 256;

struct Slots<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
    closed: bool,
}

/// Fixed-capacity arena of in-flight entries with free-list allocation.
///
/// A claim occupies one slot until its [`SlotGuard`] drops. When every slot
/// is taken, further claims fail immediately with `HelperCapacity`; an
/// occupied slot is never overwritten. After [`close`](Self::close) every
/// claim fails with `ShuttingDown`.
pub struct SlotRegistry<T> {
    slots: Arc<Mutex<Slots<T>>>,
    capacity: usize,
}

impl<T: Clone> SlotRegistry<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                entries: (0..capacity).map(|_| None).collect(),
                // Reversed so the lowest index is handed out first.
                free: (0..capacity).rev().collect(),
                closed: false,
            })),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn claim(&self, value: T) -> Result<SlotGuard<T>, DaemonError> {
        let mut slots = lock(&self.slots);
        if slots.closed {
            return Err(DaemonError::ShuttingDown);
        }
        let index = slots.free.pop().ok_or(DaemonError::HelperCapacity {
            capacity: self.capacity,
        })?;
        slots.entries[index] = Some(value);
        Ok(SlotGuard {
            slots: Arc::clone(&self.slots),
            index,
        })
    }

    /// Number of occupied slots.
    pub fn in_use(&self) -> usize {
        let slots = lock(&self.slots);
        self.capacity - slots.free.len()
    }

    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.slots).entries.iter().flatten().cloned().collect()
    }

    /// Refuse further claims and return what is currently in flight.
    pub fn close(&self) -> Vec<T> {
        let mut slots = lock(&self.slots);
        slots.closed = true;
        slots.entries.iter().flatten().cloned().collect()
    }
}

/// Releases its slot on drop.
pub struct SlotGuard<T> {
    slots: Arc<Mutex<Slots<T>>>,
    index: usize,
}

impl<T> SlotGuard<T> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        slots.entries[self.index] = None;
        slots.free.push(self.index);
    }
}

fn lock<T>(slots: &Mutex<Slots<T>>) -> MutexGuard<'_, Slots<T>> {
    match slots.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
