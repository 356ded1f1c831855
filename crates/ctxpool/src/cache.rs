use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::types::SlotId;

/// Derived resources cached against one slot's context (masks, derived
/// geometry, per-effect scratch buffers).
///
/// Entries are keyed by name; a lookup with a different type replaces the
/// stale entry.
#[derive(Default)]
pub struct SlotCache {
    entries: HashMap<&'static str, Box<dyn Any>>,
}

impl SlotCache {
    pub fn get<T: 'static>(&self, key: &'static str) -> Option<&T> {
        self.entries.get(key).and_then(|entry| entry.downcast_ref())
    }

    pub fn get_or_insert_with<T: 'static>(
        &mut self,
        key: &'static str,
        init: impl FnOnce() -> T,
    ) -> &mut T {
        let entry = self.entries.entry(key).or_insert_with(|| Box::new(()));
        if !entry.is::<T>() {
            *entry = Box::new(init());
        }
        match entry.downcast_mut::<T>() {
            Some(value) => value,
            None => unreachable!("entry was just replaced with the requested type"),
        }
    }

    pub fn remove(&mut self, key: &'static str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for SlotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotCache")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub(crate) type SharedSlotCache = Rc<RefCell<SlotCache>>;

/// Arena of per-slot caches keyed by the slot's stable id.
///
/// A slot's cache is dropped explicitly when the slot is destroyed or its
/// context is rebuilt.
#[derive(Debug, Default)]
pub(crate) struct SlotCacheArena {
    caches: HashMap<SlotId, SharedSlotCache>,
}

impl SlotCacheArena {
    pub fn cache_for(&mut self, slot: SlotId) -> SharedSlotCache {
        Rc::clone(self.caches.entry(slot).or_default())
    }

    pub fn destroy(&mut self, slot: SlotId) {
        if let Some(cache) = self.caches.remove(&slot) {
            if let Ok(mut cache) = cache.try_borrow_mut() {
                cache.clear();
            }
        }
    }

    pub fn destroy_all(&mut self) {
        let slots: Vec<SlotId> = self.caches.keys().copied().collect();
        for slot in slots {
            self.destroy(slot);
        }
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }
}
