//! Canonicalisation: renumber the reachable heap into BFS order, digest it,
//! and commit the result to the shared store.

use std::collections::VecDeque;
use std::sync::Arc;

use arrayref::array_ref;
use hashbrown::HashMap;
use nohash_hasher::BuildNoHashHasher;
use tiny_keccak::{Hasher, Keccak};

use crate::heap::{
    cow::CowHeap,
    object::HeapObject,
    pointer::{ObjId, Pointer, PointerTag, INVALID_OBJ},
    snapshot::{RootImage, SnapId, Snapshot, SnapshotStore},
};

/// The root set of a commit: pointer-valued registers (rewritten in place
/// to canonical ids) and the scalar registers that are part of state
/// identity (hashed verbatim).
pub struct RootSet<'a> {
    pub pointers: &'a mut [Pointer],
    pub scalars: &'a [u64],
}

type RankMap = HashMap<ObjId, u32, BuildNoHashHasher<ObjId>>;

/// Canonicalise the heap reachable from `roots` and commit it.
///
/// The traversal is a BFS from the root pointers in slot order; within an
/// object, outgoing pointers are followed in ascending byte-offset order.
/// Objects are renumbered to their BFS rank and every stored pointer is
/// rewritten to the canonical numbering, so two heaps with the same
/// reachable structure produce byte-identical snapshots and equal digests.
/// `Weak` pointers are not traced; when their target is unreachable they
/// are rewritten to the reserved invalid id and dangle. Unreachable
/// objects are dropped.
///
/// On return the live heap has adopted the canonical snapshot, which makes
/// the operation idempotent: committing again yields the same id. The
/// boolean reports whether the snapshot was new to the store.
pub fn commit(heap: &mut CowHeap, roots: RootSet<'_>, store: &SnapshotStore) -> (SnapId, bool) {
    let mut rank = RankMap::default();
    let mut order = Vec::new();
    let mut queue = VecDeque::new();

    for ptr in roots.pointers.iter() {
        enqueue(heap, *ptr, &mut rank, &mut order, &mut queue);
    }
    while let Some(id) = queue.pop_front() {
        let obj = heap.pool().get(id).expect("queued objects are live").clone();
        for (_, ptr) in obj.pointers() {
            enqueue(heap, ptr, &mut rank, &mut order, &mut queue);
        }
    }

    let mut objects: Vec<Arc<HeapObject>> = Vec::with_capacity(order.len());
    for &old_id in &order {
        let arc = heap.pool().get(old_id).expect("ranked objects are live").clone();
        let rewrites: Vec<(u32, Pointer)> = arc
            .pointers()
            .filter_map(|(offset, ptr)| {
                let canonical = renumber(heap, ptr, &rank);
                (canonical != ptr).then_some((offset, canonical))
            })
            .collect();
        if rewrites.is_empty() {
            objects.push(arc);
        } else {
            let mut forked = (*arc).clone();
            for (offset, ptr) in rewrites {
                forked.rewrite_pointer(offset, ptr);
            }
            objects.push(Arc::new(forked));
        }
    }

    for ptr in roots.pointers.iter_mut() {
        *ptr = renumber(heap, *ptr, &rank);
    }

    let image = RootImage {
        pointers: roots.pointers.to_vec().into_boxed_slice(),
        scalars: roots.scalars.to_vec().into_boxed_slice(),
    };
    let digest = digest(&objects, &image);

    heap.pool_mut().adopt(&objects);
    store.insert(Snapshot::new(objects, image, digest))
}

fn enqueue(
    heap: &CowHeap,
    ptr: Pointer,
    rank: &mut RankMap,
    order: &mut Vec<ObjId>,
    queue: &mut VecDeque<ObjId>,
) {
    if ptr.is_null() {
        return;
    }
    let Some(tag) = ptr.tag() else { return };
    if !tag.traced() || !heap.pool().is_live(ptr.obj()) || rank.contains_key(&ptr.obj()) {
        return;
    }
    rank.insert(ptr.obj(), order.len() as u32);
    order.push(ptr.obj());
    queue.push_back(ptr.obj());
}

/// Map a stored pointer onto the canonical numbering. Code pointers are
/// stable already; anything whose target did not make it into the rank map
/// (freed, or weakly referenced and otherwise unreachable) dangles.
fn renumber(heap: &CowHeap, ptr: Pointer, rank: &RankMap) -> Pointer {
    if ptr.is_null() {
        return ptr;
    }
    match ptr.tag() {
        None | Some(PointerTag::Code) => ptr,
        Some(_) => match rank.get(&ptr.obj()) {
            Some(&new_id) => ptr.with_obj(new_id),
            None => {
                debug_assert!(
                    !ptr.tag().unwrap().traced() || !heap.pool().is_live(ptr.obj()),
                    "strong pointer to live object escaped the BFS"
                );
                ptr.with_obj(INVALID_OBJ)
            }
        },
    }
}

fn digest(objects: &[Arc<HeapObject>], roots: &RootImage) -> [u8; 32] {
    let mut keccak = Keccak::v256();
    for obj in objects {
        keccak.update(&obj.size().to_le_bytes());
        keccak.update(obj.bytes());
        let (pointer_words, taint_words) = obj.overlay().words();
        for word in pointer_words.iter().chain(taint_words) {
            keccak.update(&word.to_le_bytes());
        }
    }
    for ptr in roots.pointers.iter() {
        keccak.update(&ptr.raw().to_le_bytes());
    }
    for scalar in roots.scalars.iter() {
        keccak.update(&scalar.to_le_bytes());
    }
    let mut out = [0u8; 32];
    keccak.finalize(&mut out);
    out
}

/// A cheap, non-canonical fingerprint of the current heap and roots, used
/// by the in-step loop guard. Stable within one step (ids do not move
/// between commits) but not across workers or commits.
#[must_use]
pub fn fingerprint(heap: &CowHeap, roots: &RootSet<'_>, class: u64) -> u64 {
    let mut keccak = Keccak::v256();
    keccak.update(&class.to_le_bytes());
    let mut ids: Vec<ObjId> = heap.pool().iter().map(|(id, _)| id).collect();
    ids.sort_unstable();
    for id in ids {
        let obj = heap.pool().get(id).expect("iterated ids are live");
        keccak.update(&id.to_le_bytes());
        keccak.update(&obj.size().to_le_bytes());
        keccak.update(obj.bytes());
    }
    for ptr in roots.pointers.iter() {
        keccak.update(&ptr.raw().to_le_bytes());
    }
    for scalar in roots.scalars.iter() {
        keccak.update(&scalar.to_le_bytes());
    }
    let mut out = [0u8; 32];
    keccak.finalize(&mut out);
    u64::from_le_bytes(*array_ref![out, 0, 8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_with(heap: &mut CowHeap, root: &mut Pointer, store: &SnapshotStore) -> SnapId {
        let mut pointers = [*root];
        let (id, _) = commit(
            heap,
            RootSet {
                pointers: &mut pointers,
                scalars: &[],
            },
            store,
        );
        *root = pointers[0];
        id
    }

    /// A small diamond: root -> {left, right}, both -> tail.
    fn diamond(heap: &mut CowHeap, payload: u64) -> Pointer {
        let root = heap.make(24);
        let left = heap.make(16);
        let right = heap.make(16);
        let tail = heap.make(8);
        heap.write(tail, 8, payload).unwrap();
        heap.write_pointer(left, tail).unwrap();
        heap.write_pointer(right, tail).unwrap();
        heap.write_pointer(root, left).unwrap();
        heap.write_pointer(root.add_offset(8), right).unwrap();
        root
    }

    #[test]
    fn commit_is_idempotent() {
        let store = SnapshotStore::new();
        let mut heap = CowHeap::new();
        let mut root = diamond(&mut heap, 7);
        let first = commit_with(&mut heap, &mut root, &store);
        let second = commit_with(&mut heap, &mut root, &store);
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn allocation_order_does_not_matter() {
        let store = SnapshotStore::new();

        let mut heap_a = CowHeap::new();
        let mut root_a = diamond(&mut heap_a, 99);

        // same structure, different id assignment
        let mut heap_b = CowHeap::new();
        heap_b.set_shuffle(0xF00D);
        heap_b.make(4); // burn an id, then drop it on the floor
        let mut root_b = diamond(&mut heap_b, 99);

        let a = commit_with(&mut heap_a, &mut root_a, &store);
        let b = commit_with(&mut heap_b, &mut root_b, &store);
        assert_eq!(a, b);
    }

    #[test]
    fn payload_differences_are_distinguished() {
        let store = SnapshotStore::new();
        let mut heap_a = CowHeap::new();
        let mut heap_b = CowHeap::new();
        let mut root_a = diamond(&mut heap_a, 1);
        let mut root_b = diamond(&mut heap_b, 2);
        let a = commit_with(&mut heap_a, &mut root_a, &store);
        let b = commit_with(&mut heap_b, &mut root_b, &store);
        assert_ne!(a, b);
    }

    #[test]
    fn unreachable_objects_are_dropped() {
        let store = SnapshotStore::new();
        let mut heap = CowHeap::new();
        let mut root = diamond(&mut heap, 3);
        heap.make(128); // unreachable
        commit_with(&mut heap, &mut root, &store);
        assert_eq!(heap.pool().len(), 4);
    }

    #[test]
    fn weak_references_dangle_after_commit() {
        let store = SnapshotStore::new();
        let mut heap = CowHeap::new();
        let holder = heap.make(8);
        let target = heap.make(8);
        heap.write_pointer(holder, target.with_tag(PointerTag::Weak)).unwrap();

        let mut root = holder;
        commit_with(&mut heap, &mut root, &store);

        // the weak target was not traced, so the reference now dangles
        assert_eq!(heap.pool().len(), 1);
        let dangling = heap.read_pointer(root).unwrap();
        assert_eq!(dangling.obj(), INVALID_OBJ);
        assert!(heap.read(dangling, 8).is_err());
    }

    #[test]
    fn weak_reference_to_strongly_reachable_target_survives() {
        let store = SnapshotStore::new();
        let mut heap = CowHeap::new();
        let holder = heap.make(16);
        let target = heap.make(8);
        heap.write(target, 8, 21).unwrap();
        heap.write_pointer(holder, target).unwrap();
        heap.write_pointer(holder.add_offset(8), target.with_tag(PointerTag::Weak))
            .unwrap();

        let mut root = holder;
        commit_with(&mut heap, &mut root, &store);

        let weak = heap.read_pointer(root.add_offset(8)).unwrap();
        assert_eq!(weak.tag(), Some(PointerTag::Weak));
        assert_eq!(heap.read(weak.with_tag(PointerTag::Heap), 8).unwrap(), 21);
    }

    #[test]
    fn cycles_terminate_and_roundtrip() {
        let store = SnapshotStore::new();
        let mut heap = CowHeap::new();
        let a = heap.make(8);
        let b = heap.make(8);
        heap.write_pointer(a, b).unwrap();
        heap.write_pointer(b, a).unwrap();

        let mut root = a;
        let first = commit_with(&mut heap, &mut root, &store);
        let second = commit_with(&mut heap, &mut root, &store);
        assert_eq!(first, second);
    }

    #[test]
    fn scalar_roots_are_part_of_identity() {
        let store = SnapshotStore::new();
        let mut heap = CowHeap::new();
        let mut pointers = [Pointer::NULL];
        let (a, _) = commit(
            &mut heap,
            RootSet { pointers: &mut pointers, scalars: &[1] },
            &store,
        );
        let (b, _) = commit(
            &mut heap,
            RootSet { pointers: &mut pointers, scalars: &[2] },
            &store,
        );
        assert_ne!(a, b);
    }
}
