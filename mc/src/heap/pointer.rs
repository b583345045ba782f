//! Tagged 64-bit pointers into a [`Pool`](super::pool::Pool).

use serde::{Deserialize, Serialize};

/// Stable identity of an object within a pool.
pub type ObjId = u32;

/// Number of bits in the byte-offset field.
pub const OFFSET_BITS: u32 = 20;
/// Number of bits in the object-id field.
pub const OBJID_BITS: u32 = 28;

pub const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
pub const OBJID_MASK: u64 = (1 << OBJID_BITS) - 1;
const TAG_SHIFT: u32 = OFFSET_BITS + OBJID_BITS;
const TAG_MASK: u64 = 0xF;

/// An object id that no live object ever carries. Dangling references are
/// rewritten to this id during canonicalisation, so that a restored heap
/// faults deterministically when they are dereferenced.
pub const INVALID_OBJ: ObjId = OBJID_MASK as ObjId;

/// The type tag carried in bits 48..=51 of a pointer word.
///
/// `Marked` behaves like `Heap` for reachability but is distinguishable by
/// instrumentation; `Weak` references are not traced during canonicalisation
/// and may dangle after a commit. `Code` pointers address instructions, not
/// objects: the id field holds a function id and the offset field an
/// instruction index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PointerTag {
    Heap = 1,
    Global = 2,
    Constant = 3,
    Code = 4,
    Marked = 5,
    Weak = 6,
}

impl PointerTag {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Heap),
            2 => Some(Self::Global),
            3 => Some(Self::Constant),
            4 => Some(Self::Code),
            5 => Some(Self::Marked),
            6 => Some(Self::Weak),
            _ => None,
        }
    }

    /// Whether values with this tag are followed when computing
    /// reachability. `Code` has no storage behind it and `Weak` is
    /// deliberately invisible to the tracer.
    pub fn traced(self) -> bool {
        !matches!(self, Self::Code | Self::Weak)
    }
}

/// A 64-bit tagged pointer: offset in bits 0..=19, object id in bits
/// 20..=47, type tag in bits 48..=51. The all-zero word is the null
/// pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pointer(u64);

impl Pointer {
    pub const NULL: Pointer = Pointer(0);

    #[must_use]
    pub fn new(tag: PointerTag, obj: ObjId, offset: u32) -> Self {
        debug_assert!(u64::from(obj) <= OBJID_MASK);
        Pointer(
            (u64::from(offset) & OFFSET_MASK)
                | ((u64::from(obj) & OBJID_MASK) << OFFSET_BITS)
                | ((tag as u64) << TAG_SHIFT),
        )
    }

    /// A code pointer addressing `index` within `function`.
    #[must_use]
    pub fn code(function: u32, index: u32) -> Self {
        Self::new(PointerTag::Code, function, index)
    }

    /// Reinterpret a raw word as a pointer. No validation happens here;
    /// the heap accessors fault on malformed words.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Pointer(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn obj(self) -> ObjId {
        ((self.0 >> OFFSET_BITS) & OBJID_MASK) as ObjId
    }

    #[must_use]
    pub fn offset(self) -> u32 {
        (self.0 & OFFSET_MASK) as u32
    }

    #[must_use]
    pub fn tag(self) -> Option<PointerTag> {
        PointerTag::from_bits(((self.0 >> TAG_SHIFT) & TAG_MASK) as u8)
    }

    /// Replace the offset field.
    #[must_use]
    pub fn with_offset(self, offset: u32) -> Self {
        Pointer((self.0 & !OFFSET_MASK) | (u64::from(offset) & OFFSET_MASK))
    }

    /// Displace the offset field, wrapping within its width. Out-of-bounds
    /// results are caught at dereference time, not here.
    #[must_use]
    pub fn add_offset(self, delta: i64) -> Self {
        let offset = (i64::from(self.offset()) + delta) as u64 & OFFSET_MASK;
        Pointer((self.0 & !OFFSET_MASK) | offset)
    }

    /// Replace the object-id field.
    #[must_use]
    pub fn with_obj(self, obj: ObjId) -> Self {
        Pointer((self.0 & !(OBJID_MASK << OFFSET_BITS)) | ((u64::from(obj) & OBJID_MASK) << OFFSET_BITS))
    }

    /// Replace the tag field.
    #[must_use]
    pub fn with_tag(self, tag: PointerTag) -> Self {
        Pointer((self.0 & !(TAG_MASK << TAG_SHIFT)) | ((tag as u64) << TAG_SHIFT))
    }
}

impl std::fmt::Debug for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "Pointer(null)");
        }
        match self.tag() {
            Some(tag) => write!(f, "Pointer({:?} {}+{})", tag, self.obj(), self.offset()),
            None => write!(f, "Pointer(raw {:#x})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_fields() {
        let p = Pointer::new(PointerTag::Heap, 0x0AB_CDEF, 0x12345);
        assert_eq!(p.obj(), 0x0AB_CDEF);
        assert_eq!(p.offset(), 0x12345);
        assert_eq!(p.tag(), Some(PointerTag::Heap));
        assert!(!p.is_null());
    }

    #[test]
    fn null_is_all_zero() {
        assert_eq!(Pointer::NULL.raw(), 0);
        assert!(Pointer::from_raw(0).is_null());
        assert!(Pointer::default().is_null());
    }

    #[test]
    fn offset_arithmetic_wraps_in_field() {
        let p = Pointer::new(PointerTag::Heap, 7, 8);
        assert_eq!(p.add_offset(8).offset(), 16);
        assert_eq!(p.add_offset(8).obj(), 7);
        assert_eq!(p.add_offset(-8).offset(), 0);
        // wrap stays inside the offset field and never corrupts the id
        assert_eq!(p.add_offset(-16).obj(), 7);
    }

    #[test]
    fn weak_and_code_are_not_traced() {
        assert!(PointerTag::Heap.traced());
        assert!(PointerTag::Marked.traced());
        assert!(!PointerTag::Weak.traced());
        assert!(!PointerTag::Code.traced());
    }
}
