//! Frame layout: where SSA values live inside a call frame.

use serde::{Deserialize, Serialize};

/// Byte offset of the saved program counter in a frame.
pub const FRAME_PC: u32 = 0;
/// Byte offset of the parent-frame pointer in a frame.
pub const FRAME_PARENT: u32 = 8;
/// Size of the frame header preceding register storage.
pub const FRAME_HEADER: u32 = 16;

/// Statically assigned storage of one SSA value within its call frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    /// Byte offset from the start of the frame object.
    pub offset: u32,
    /// Value width in bytes (1, 2, 4 or 8; pointers are always 8).
    pub width: u8,
    /// Whether the slot holds a pointer; pointer slots are 8-aligned and
    /// read/written through the heap's pointer accessors so the pointer
    /// bitmap stays coherent.
    pub is_pointer: bool,
}

/// Assign frame offsets to a list of `(width, is_pointer)` slot requests.
/// Returns the layout and the total frame size (8-aligned).
#[must_use]
pub fn assign_slots(requests: &[(u8, bool)]) -> (Vec<SlotInfo>, u32) {
    let mut cursor = FRAME_HEADER;
    let mut slots = Vec::with_capacity(requests.len());
    for &(width, is_pointer) in requests {
        let align = if is_pointer { 8 } else { u32::from(width) };
        cursor = cursor.next_multiple_of(align);
        slots.push(SlotInfo {
            offset: cursor,
            width: if is_pointer { 8 } else { width },
            is_pointer,
        });
        cursor += if is_pointer { 8 } else { u32::from(width) };
    }
    (slots, cursor.next_multiple_of(8))
}
