//! Committed snapshots and the shared content-addressed store.

use std::sync::{Arc, Mutex, RwLock};

use hashbrown::HashMap;

use crate::heap::{object::HeapObject, pointer::Pointer};

/// Identity of a committed snapshot within a [`SnapshotStore`]. The id is
/// dense (0, 1, 2, …) in insertion order and identical on every worker for
/// the same canonical content.
pub type SnapId = u32;

/// Keccak-256 digest of the canonical heap-and-register structure.
pub type Digest = [u8; 32];

/// The canonical image of the VM roots committed alongside the heap:
/// pointer-valued control registers (rewritten to canonical object ids) and
/// the scalar registers that are part of state identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootImage {
    pub pointers: Box<[Pointer]>,
    pub scalars: Box<[u64]>,
}

/// A committed, canonical, hashable heap state. Object `i` of the table has
/// canonical id `i`; restoring is adopting the table. Snapshots are
/// immutable and shared by reference count between the store, the search
/// front and counterexample traces.
#[derive(Clone)]
pub struct Snapshot {
    objects: Arc<[Arc<HeapObject>]>,
    roots: RootImage,
    digest: Digest,
}

impl Snapshot {
    pub(crate) fn new(objects: Vec<Arc<HeapObject>>, roots: RootImage, digest: Digest) -> Self {
        Snapshot {
            objects: objects.into(),
            roots,
            digest,
        }
    }

    #[must_use]
    pub fn objects(&self) -> &[Arc<HeapObject>] {
        &self.objects
    }

    #[must_use]
    pub fn roots(&self) -> &RootImage {
        &self.roots
    }

    #[must_use]
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("objects", &self.objects.len())
            .field("digest", &hex::encode(&self.digest[..8]))
            .finish()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}
impl Eq for Snapshot {}

const SHARDS: usize = 64;

/// The deduplicating store of committed snapshots, shared by all search
/// workers. Insertion is an atomic get-or-create keyed by digest; the
/// boolean result tells the inserting worker whether it discovered a new
/// state. Lookup by digest uses one lock per shard; the snapshot table
/// itself only ever grows.
pub struct SnapshotStore {
    shards: Box<[Mutex<HashMap<Digest, SnapId>>]>,
    snaps: RwLock<Vec<Arc<Snapshot>>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        SnapshotStore {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            snaps: RwLock::new(Vec::new()),
        }
    }

    /// Get-or-create. Returns the snapshot id and whether it was newly
    /// inserted.
    pub fn insert(&self, snapshot: Snapshot) -> (SnapId, bool) {
        let digest = *snapshot.digest();
        let mut shard = self.shards[digest[0] as usize % SHARDS].lock().unwrap();
        if let Some(&id) = shard.get(&digest) {
            return (id, false);
        }
        let mut snaps = self.snaps.write().unwrap();
        let id = snaps.len() as SnapId;
        snaps.push(Arc::new(snapshot));
        drop(snaps);
        shard.insert(digest, id);
        (id, true)
    }

    /// Fetch a committed snapshot. Panics on an id that was never handed
    /// out by this store; ids are not forgeable through the public API.
    #[must_use]
    pub fn get(&self, id: SnapId) -> Arc<Snapshot> {
        self.snaps.read().unwrap()[id as usize].clone()
    }

    /// Number of committed snapshots (states discovered so far).
    #[must_use]
    pub fn len(&self) -> usize {
        self.snaps.read().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").field("len", &self.len()).finish()
    }
}
