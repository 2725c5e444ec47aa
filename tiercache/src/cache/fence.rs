//! Ordering between disk-read promotion and memory writes.
//!
//! A disk read is queued behind earlier disk work and decoded later, so a
//! put or remove issued in the meantime has already changed the memory
//! tier. Readers register a ticket before they look at memory; writers
//! bump the generation of every key with a registered reader. A ticket
//! whose generation moved must not promote its value.

use parking_lot::Mutex;
use std::collections::HashMap;

struct PendingRead {
    readers: usize,
    generation: u64,
}

#[derive(Default)]
pub(crate) struct ReadFence {
    pending: Mutex<HashMap<String, PendingRead>>,
}

impl ReadFence {
    /// Register a disk read of `key`
    pub(crate) fn enter(&self, key: &str) -> FenceTicket<'_> {
        let mut pending = self.pending.lock();
        let entry = pending.entry(key.to_string()).or_insert(PendingRead {
            readers: 0,
            generation: 0,
        });
        entry.readers += 1;
        FenceTicket {
            fence: self,
            key: key.to_string(),
            generation: entry.generation,
            released: false,
        }
    }

    /// Run a memory mutation of `key`, invalidating in-flight reads of it
    pub(crate) fn write<R>(&self, key: &str, mutate: impl FnOnce() -> R) -> R {
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(key) {
            entry.generation += 1;
        }
        mutate()
    }

    pub(crate) fn write_many<R>(&self, keys: &[String], mutate: impl FnOnce() -> R) -> R {
        let mut pending = self.pending.lock();
        for key in keys {
            if let Some(entry) = pending.get_mut(key.as_str()) {
                entry.generation += 1;
            }
        }
        mutate()
    }

    pub(crate) fn write_all<R>(&self, mutate: impl FnOnce() -> R) -> R {
        let mut pending = self.pending.lock();
        for entry in pending.values_mut() {
            entry.generation += 1;
        }
        mutate()
    }

    fn release(pending: &mut HashMap<String, PendingRead>, key: &str) {
        if let Some(entry) = pending.get_mut(key) {
            entry.readers -= 1;
            if entry.readers == 0 {
                pending.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.pending.lock().len()
    }
}

/// One registered disk read; released when settled or dropped
pub(crate) struct FenceTicket<'a> {
    fence: &'a ReadFence,
    key: String,
    generation: u64,
    released: bool,
}

impl FenceTicket<'_> {
    /// Finish the read. `finish` receives whether no write touched the key
    /// since [`ReadFence::enter`] and runs before any later write can.
    pub(crate) fn settle<R>(mut self, finish: impl FnOnce(bool) -> R) -> R {
        let mut pending = self.fence.pending.lock();
        let current = pending
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation);
        let result = finish(current);
        ReadFence::release(&mut pending, &self.key);
        self.released = true;
        result
    }
}

impl Drop for FenceTicket<'_> {
    fn drop(&mut self) {
        if !self.released {
            let mut pending = self.fence.pending.lock();
            ReadFence::release(&mut pending, &self.key);
        }
    }
}
