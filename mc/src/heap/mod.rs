//! The object heap: tagged pointers, copy-on-write object storage, and
//! canonical, content-addressed snapshots.
//!
//! A live [`CowHeap`] is exclusively owned by one execution context;
//! committed [`Snapshot`]s are shared by snapshot id through the
//! [`SnapshotStore`]. Canonicalisation (see [`canon`]) is what makes two
//! heaps with the same reachable structure compare equal, which in turn is
//! what makes state-space deduplication possible.

pub mod canon;
pub mod cow;
pub mod object;
pub mod pointer;
pub mod pool;
pub mod snapshot;

pub use canon::{commit, fingerprint, RootSet};
pub use cow::{CowHeap, HeapError, OverlayLayer};
pub use object::{HeapObject, SlotOverlay, PTR_BYTES, SLOT_BYTES};
pub use pointer::{ObjId, Pointer, PointerTag, INVALID_OBJ, OBJID_BITS, OFFSET_BITS, OFFSET_MASK};
pub use pool::Pool;
pub use snapshot::{Digest, RootImage, SnapId, Snapshot, SnapshotStore};
