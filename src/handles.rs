//! Process-wide table mapping opaque `u64` handles to live clients.
//!
//! A handle packs a slot index (plus one, so zero is never issued) in the
//! low 32 bits and the slot's generation in the high 32 bits. Retiring a
//! slot bumps its generation and returns it to the free list, so stale
//! handles are rejected instead of aliasing a newer session.
//!
//! Each slot also remembers the generation it last retired. That handle
//! reports [`SpiceError::NotConnected`] rather than `BadHandle` until the
//! slot is retired again or the tombstone is cleared.

use spice_client::SpiceError;
use std::sync::{Mutex, MutexGuard};

pub type Handle = u64;

struct Slot<T> {
    generation: u32,
    entry: Option<T>,
    retired: Option<u32>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

pub struct HandleTable<T> {
    inner: Mutex<Slots<T>>,
}

/// Outcome of retiring a handle.
#[derive(Debug)]
pub enum Retired<T> {
    /// The handle was live; its entry is handed back.
    Live(T),
    /// The handle had already been retired.
    Already,
}

fn encode(index: usize, generation: u32) -> Handle {
    ((generation as u64) << 32) | (index as u64 + 1)
}

fn decode(handle: Handle) -> Option<(usize, u32)> {
    let low = (handle & 0xffff_ffff) as usize;
    if low == 0 {
        return None;
    }
    Some((low - 1, (handle >> 32) as u32))
}

fn retire_in<T>(inner: &mut Slots<T>, handle: Handle) -> Result<Retired<T>, SpiceError> {
    let (index, generation) = decode(handle).ok_or(SpiceError::BadHandle(handle))?;
    let slot = inner.slots.get_mut(index).ok_or(SpiceError::BadHandle(handle))?;
    if slot.generation != generation || slot.entry.is_none() {
        if slot.retired == Some(generation) {
            return Ok(Retired::Already);
        }
        return Err(SpiceError::BadHandle(handle));
    }
    let entry = slot.entry.take().ok_or(SpiceError::BadHandle(handle))?;
    slot.retired = Some(generation);
    slot.generation = slot.generation.wrapping_add(1);
    inner.free.push(index);
    Ok(Retired::Live(entry))
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }
}

impl<T: Clone> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        // A panic while holding the lock cannot leave the table half-updated
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, entry: T) -> Handle {
        let mut inner = self.lock();
        match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index];
                slot.entry = Some(entry);
                encode(index, slot.generation)
            }
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                    retired: None,
                });
                encode(inner.slots.len() - 1, 0)
            }
        }
    }

    pub fn get(&self, handle: Handle) -> Result<T, SpiceError> {
        let (index, generation) = decode(handle).ok_or(SpiceError::BadHandle(handle))?;
        let inner = self.lock();
        let slot = inner.slots.get(index).ok_or(SpiceError::BadHandle(handle))?;
        match &slot.entry {
            Some(entry) if slot.generation == generation => Ok(entry.clone()),
            _ if slot.retired == Some(generation) => Err(SpiceError::NotConnected),
            _ => Err(SpiceError::BadHandle(handle)),
        }
    }

    /// Free the slot for reuse and leave a tombstone for `handle`.
    pub fn retire(&self, handle: Handle) -> Result<Retired<T>, SpiceError> {
        retire_in(&mut self.lock(), handle)
    }

    /// Retire `handle` if live and drop its tombstone. Later lookups fail
    /// with `BadHandle`.
    pub fn remove(&self, handle: Handle) -> Result<Option<T>, SpiceError> {
        let mut inner = self.lock();
        let entry = match retire_in(&mut inner, handle)? {
            Retired::Live(entry) => Some(entry),
            Retired::Already => None,
        };
        if let Some((index, generation)) = decode(handle) {
            if let Some(slot) = inner.slots.get_mut(index).filter(|s| s.retired == Some(generation)) {
                slot.retired = None;
            }
        }
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.entry.is_some()).count()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots ever allocated, live or free.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }
}
