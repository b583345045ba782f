//! The copy-on-write heap: bounds- and alignment-checked access on top of
//! [`Pool`], plus snapshot restore.

use std::sync::Arc;

use thiserror::Error;

use crate::heap::{
    object::{HeapObject, PTR_BYTES},
    pointer::{Pointer, PointerTag},
    pool::Pool,
    snapshot::Snapshot,
};

/// Access violations detected by the heap. The interpreter converts these
/// into `Memory` faults at the current program counter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("null pointer dereference")]
    Null,
    #[error("invalid pointer {0:#x}")]
    Invalid(u64),
    #[error("{width}-byte access at offset {offset} beyond object of {size} bytes")]
    Bounds { offset: u32, width: u32, size: u32 },
    #[error("misaligned {width}-byte access at offset {offset}")]
    Misaligned { offset: u32, width: u32 },
    #[error("free of an interior or non-heap pointer {0:#x}")]
    BadFree(u64),
}

/// The auxiliary per-slot layers exposed to the guest through `peek`/`poke`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayLayer {
    PointerTag,
    Taint,
}

impl OverlayLayer {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::PointerTag),
            1 => Some(Self::Taint),
            _ => None,
        }
    }
}

/// A mutable heap exclusively owned by one execution context. Objects are
/// shared with committed snapshots and forked on first write.
#[derive(Debug, Clone, Default)]
pub struct CowHeap {
    pool: Pool,
}

impl CowHeap {
    #[must_use]
    pub fn new() -> Self {
        CowHeap { pool: Pool::new() }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn set_shuffle(&mut self, seed: u32) {
        self.pool.set_shuffle(seed);
    }

    /// Allocate a fresh zero-filled object. A zero-sized object yields a
    /// valid pointer whose every dereference faults.
    pub fn make(&mut self, size: u32) -> Pointer {
        self.make_tagged(size, PointerTag::Heap)
    }

    pub fn make_tagged(&mut self, size: u32, tag: PointerTag) -> Pointer {
        Pointer::new(tag, self.pool.alloc(size), 0)
    }

    /// Invalidate an object; all later access through any pointer to it
    /// faults. Only base pointers (offset 0) may be freed.
    pub fn free(&mut self, ptr: Pointer) -> Result<(), HeapError> {
        self.check_data_pointer(ptr)?;
        if ptr.offset() != 0 {
            return Err(HeapError::BadFree(ptr.raw()));
        }
        if self.pool.free(ptr.obj()) {
            Ok(())
        } else {
            Err(HeapError::Invalid(ptr.raw()))
        }
    }

    #[must_use]
    pub fn valid(&self, ptr: Pointer) -> bool {
        !ptr.is_null()
            && ptr.tag().is_some_and(|t| t != PointerTag::Code)
            && self.pool.is_live(ptr.obj())
            && ptr.offset() <= self.size_of(ptr.obj()).unwrap_or(0)
    }

    pub fn size(&self, ptr: Pointer) -> Result<u32, HeapError> {
        Ok(self.object(ptr)?.size())
    }

    pub fn read(&self, ptr: Pointer, width: u32) -> Result<u64, HeapError> {
        let obj = self.object(ptr)?;
        check_access(ptr.offset(), width, obj.size())?;
        Ok(obj.read(ptr.offset(), width))
    }

    pub fn write(&mut self, ptr: Pointer, width: u32, value: u64) -> Result<(), HeapError> {
        let obj = self.object_mut(ptr)?;
        check_access(ptr.offset(), width, obj.size())?;
        obj.write(ptr.offset(), width, value);
        Ok(())
    }

    pub fn read_pointer(&self, ptr: Pointer) -> Result<Pointer, HeapError> {
        let obj = self.object(ptr)?;
        check_access(ptr.offset(), PTR_BYTES, obj.size())?;
        Ok(obj.read_pointer(ptr.offset()))
    }

    pub fn write_pointer(&mut self, ptr: Pointer, value: Pointer) -> Result<(), HeapError> {
        let obj = self.object_mut(ptr)?;
        check_access(ptr.offset(), PTR_BYTES, obj.size())?;
        obj.write_pointer(ptr.offset(), value);
        Ok(())
    }

    /// Read the type tag of the pointer stored at `ptr` (null when the slot
    /// holds plain data).
    pub fn peek_tag(&self, ptr: Pointer) -> Result<u8, HeapError> {
        let stored = self.read_pointer(ptr)?;
        Ok(stored.tag().map_or(0, |t| t as u8))
    }

    /// Rewrite the type tag of the pointer stored at `ptr`.
    pub fn poke_tag(&mut self, ptr: Pointer, tag: PointerTag) -> Result<(), HeapError> {
        let stored = self.read_pointer(ptr)?;
        if stored.is_null() {
            return Err(HeapError::Invalid(stored.raw()));
        }
        self.write_pointer(ptr, stored.with_tag(tag))
    }

    pub fn tainted(&self, ptr: Pointer, len: u32) -> Result<bool, HeapError> {
        let obj = self.object(ptr)?;
        check_range(ptr.offset(), len.max(1), obj.size())?;
        Ok(obj.tainted(ptr.offset(), len))
    }

    pub fn set_taint(&mut self, ptr: Pointer, len: u32, value: bool) -> Result<(), HeapError> {
        let obj = self.object_mut(ptr)?;
        check_range(ptr.offset(), len.max(1), obj.size())?;
        obj.set_taint(ptr.offset(), len, value);
        Ok(())
    }

    /// Grow or shrink an object in place, preserving the common prefix.
    pub fn resize(&mut self, ptr: Pointer, size: u32) -> Result<(), HeapError> {
        self.check_data_pointer(ptr)?;
        if ptr.offset() != 0 {
            return Err(HeapError::BadFree(ptr.raw()));
        }
        match self.pool.get_mut(ptr.obj()) {
            Some(obj) => {
                obj.resize(size);
                Ok(())
            }
            None => Err(HeapError::Invalid(ptr.raw())),
        }
    }

    /// Byte copy between two objects (or within one), moving taint with the
    /// bytes. Pointer bits transfer only for slot-aligned copies.
    pub fn copy(&mut self, src: Pointer, dst: Pointer, len: u32) -> Result<(), HeapError> {
        let src_obj = self.object(src)?.clone();
        check_range(src.offset(), len.max(1), src_obj.size())?;
        let dst_obj = self.object_mut(dst)?;
        check_range(dst.offset(), len.max(1), dst_obj.size())?;
        dst_obj.copy_from(&src_obj, src.offset(), dst.offset(), len);
        Ok(())
    }

    /// Blob write used when exporting globals and constants into a heap.
    pub fn write_bytes(&mut self, ptr: Pointer, bytes: &[u8]) -> Result<(), HeapError> {
        let obj = self.object_mut(ptr)?;
        check_range(ptr.offset(), bytes.len().max(1) as u32, obj.size())?;
        obj.write_bytes(ptr.offset(), bytes);
        Ok(())
    }

    /// Read a guest string of `len` bytes at `ptr` (lossy on non-UTF8).
    pub fn read_string(&self, ptr: Pointer, len: u32) -> Result<String, HeapError> {
        let obj = self.object(ptr)?;
        check_range(ptr.offset(), len.max(1), obj.size())?;
        let bytes = &obj.bytes()[ptr.offset() as usize..(ptr.offset() + len) as usize];
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Adopt a committed snapshot as the current heap contents. Zero-copy:
    /// objects stay shared until written.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.pool.adopt(snapshot.objects());
    }

    pub fn clear(&mut self) {
        self.pool.clear();
    }

    pub(crate) fn pool_mut(&mut self) -> &mut Pool {
        &mut self.pool
    }

    fn size_of(&self, id: u32) -> Option<u32> {
        self.pool.get(id).map(|o| o.size())
    }

    fn check_data_pointer(&self, ptr: Pointer) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Err(HeapError::Null);
        }
        match ptr.tag() {
            Some(PointerTag::Code) | None => Err(HeapError::Invalid(ptr.raw())),
            Some(_) => Ok(()),
        }
    }

    fn object(&self, ptr: Pointer) -> Result<&Arc<HeapObject>, HeapError> {
        self.check_data_pointer(ptr)?;
        self.pool.get(ptr.obj()).ok_or(HeapError::Invalid(ptr.raw()))
    }

    fn object_mut(&mut self, ptr: Pointer) -> Result<&mut HeapObject, HeapError> {
        self.check_data_pointer(ptr)?;
        self.pool.get_mut(ptr.obj()).ok_or(HeapError::Invalid(ptr.raw()))
    }
}

fn check_access(offset: u32, width: u32, size: u32) -> Result<(), HeapError> {
    if offset % width != 0 {
        return Err(HeapError::Misaligned { offset, width });
    }
    check_range(offset, width, size)
}

fn check_range(offset: u32, len: u32, size: u32) -> Result<(), HeapError> {
    if u64::from(offset) + u64::from(len) > u64::from(size) {
        return Err(HeapError::Bounds { offset, width: len, size });
    }
    Ok(())
}
