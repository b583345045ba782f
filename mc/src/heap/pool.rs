//! The object pool: stable ids to shared object storage.

use std::sync::Arc;

use hashbrown::HashMap;
use nohash_hasher::BuildNoHashHasher;

use crate::heap::{
    object::HeapObject,
    pointer::{ObjId, INVALID_OBJ, OBJID_MASK},
};

#[derive(Debug, Clone)]
enum Slot {
    Live(Arc<HeapObject>),
    /// Tombstone left behind by `free`; access through it faults, and the
    /// id is never handed out again within this pool.
    Freed,
}

/// Variable-size object store. Ids are stable for the lifetime of the pool;
/// the same id may be shared between snapshots (objects are `Arc`ed and
/// forked on write by the owning heap).
///
/// Fresh ids are drawn from a counter run through a seedable bijective
/// scramble, so the allocation order is not directly observable as an id
/// ordering. Canonicalisation erases the scramble again by renumbering.
#[derive(Debug, Clone, Default)]
pub struct Pool {
    slots: HashMap<ObjId, Slot, BuildNoHashHasher<ObjId>>,
    next: u32,
    shuffle: u32,
}

fn scramble(n: u32, seed: u32) -> ObjId {
    // odd multiplier, so this is a bijection of the 28-bit id space
    ((n.wrapping_mul(0x9E37_79B1) ^ seed) as u64 & OBJID_MASK) as ObjId
}

impl Pool {
    #[must_use]
    pub fn new() -> Self {
        Pool::default()
    }

    /// Seed for the id scramble, driven by the `ObjIdShuffle` control
    /// register.
    pub fn set_shuffle(&mut self, seed: u32) {
        self.shuffle = seed;
    }

    /// Allocate a zero-filled object of `size` bytes and return its id.
    pub fn alloc(&mut self, size: u32) -> ObjId {
        loop {
            let id = scramble(self.next, self.shuffle);
            self.next = self.next.wrapping_add(1);
            if id != INVALID_OBJ && !self.slots.contains_key(&id) {
                self.slots.insert(id, Slot::Live(Arc::new(HeapObject::new(size))));
                return id;
            }
        }
    }

    /// Tombstone an object. Returns false when the id is not live.
    pub fn free(&mut self, id: ObjId) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot @ Slot::Live(_)) => {
                *slot = Slot::Freed;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn get(&self, id: ObjId) -> Option<&Arc<HeapObject>> {
        match self.slots.get(&id) {
            Some(Slot::Live(obj)) => Some(obj),
            _ => None,
        }
    }

    /// Mutable access with copy-on-write: a shared object is forked (bytes
    /// and overlay copied) before the caller sees it.
    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut HeapObject> {
        match self.slots.get_mut(&id) {
            Some(Slot::Live(obj)) => Some(Arc::make_mut(obj)),
            _ => None,
        }
    }

    /// Swap the whole object under `id` for an already-forked replacement.
    pub(crate) fn replace(&mut self, id: ObjId, obj: Arc<HeapObject>) {
        self.slots.insert(id, Slot::Live(obj));
    }

    #[must_use]
    pub fn is_live(&self, id: ObjId) -> bool {
        matches!(self.slots.get(&id), Some(Slot::Live(_)))
    }

    /// Number of live objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.values().filter(|s| matches!(s, Slot::Live(_))).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live `(id, object)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjId, &Arc<HeapObject>)> {
        self.slots.iter().filter_map(|(id, slot)| match slot {
            Slot::Live(obj) => Some((*id, obj)),
            Slot::Freed => None,
        })
    }

    /// Replace the pool contents with a canonical object list: object `i`
    /// of the slice becomes id `i`. Shared ownership is retained, making
    /// restore zero-copy.
    pub fn adopt(&mut self, objects: &[Arc<HeapObject>]) {
        self.slots.clear();
        self.slots.reserve(objects.len());
        for (id, obj) in objects.iter().enumerate() {
            self.slots.insert(id as ObjId, Slot::Live(obj.clone()));
        }
        self.next = objects.len() as u32;
        self.shuffle = 0;
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.next = 0;
        self.shuffle = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_access() {
        let mut pool = Pool::new();
        let id = pool.alloc(16);
        assert!(pool.is_live(id));
        assert_eq!(pool.get(id).unwrap().size(), 16);
        assert!(pool.free(id));
        assert!(!pool.is_live(id));
        assert!(pool.get(id).is_none());
        // double free is rejected, id is not recycled
        assert!(!pool.free(id));
        let other = pool.alloc(8);
        assert_ne!(other, id);
    }

    #[test]
    fn shuffle_changes_ids_but_not_contents() {
        let mut a = Pool::new();
        let mut b = Pool::new();
        b.set_shuffle(0xBEEF);
        let ia = a.alloc(4);
        let ib = b.alloc(4);
        assert_ne!(ia, ib);
        assert_eq!(a.get(ia).unwrap().bytes(), b.get(ib).unwrap().bytes());
    }

    #[test]
    fn cow_forks_shared_objects() {
        let mut pool = Pool::new();
        let id = pool.alloc(8);
        let shared = pool.get(id).unwrap().clone();
        pool.get_mut(id).unwrap().write(0, 8, 42);
        assert_eq!(pool.get(id).unwrap().read(0, 8), 42);
        // the older holder still sees the pristine bytes
        assert_eq!(shared.read(0, 8), 0);
    }

    #[test]
    fn adopt_renumbers_from_zero() {
        let mut pool = Pool::new();
        pool.set_shuffle(0x1234_5678);
        pool.alloc(4);
        pool.alloc(4);
        let objects: Vec<_> = pool.iter().map(|(_, o)| o.clone()).collect();
        pool.adopt(&objects);
        assert!(pool.is_live(0));
        assert!(pool.is_live(1));
        assert_eq!(pool.len(), 2);
    }
}
