//! Loaded IR modules.

use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{
    compiler::ir::{
        instruction::{BlockId, FunctionId, Instruction},
        layout::SlotInfo,
    },
    heap::{CowHeap, Pointer, PointerTag},
};

/// One function of a loaded module: instructions (blocks concatenated),
/// block start indices, and the frame layout of its SSA values. The first
/// `param_count` slots receive the call arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: Arc<str>,
    pub slots: Arc<[SlotInfo]>,
    pub param_count: u16,
    pub frame_size: u32,
    pub instructions: Arc<[Instruction]>,
    /// Instruction index at which each basic block starts.
    pub blocks: Arc<[u32]>,
}

impl Function {
    #[must_use]
    pub fn block_start(&self, block: BlockId) -> u32 {
        self.blocks[block as usize]
    }
}

/// A named blob in the global or constant table, placed at a fixed offset
/// within the exported pool object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataItem {
    pub name: Arc<str>,
    pub offset: u32,
    pub bytes: Arc<[u8]>,
}

/// A program the VM can execute. Immutable after load and shared read-only
/// by every execution context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub functions: Arc<[Function]>,
    pub globals: Arc<[DataItem]>,
    pub constants: Arc<[DataItem]>,
    fn_by_name: HashMap<Arc<str>, FunctionId>,
    globals_size: u32,
    constants_size: u32,
}

impl Program {
    pub(crate) fn new(
        functions: Vec<Function>,
        globals: Vec<DataItem>,
        constants: Vec<DataItem>,
    ) -> Self {
        let fn_by_name = functions
            .iter()
            .enumerate()
            .map(|(id, f)| (f.name.clone(), id as FunctionId))
            .collect();
        let pool_size =
            |items: &[DataItem]| items.iter().map(|i| i.offset + i.bytes.len() as u32).max().unwrap_or(0);
        Program {
            globals_size: pool_size(&globals),
            constants_size: pool_size(&constants),
            functions: functions.into(),
            globals: globals.into(),
            constants: constants.into(),
            fn_by_name,
        }
    }

    #[must_use]
    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id as usize)
    }

    #[must_use]
    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.fn_by_name.get(name).copied()
    }

    /// The instruction a code pointer addresses, if it is in range.
    #[must_use]
    pub fn instruction(&self, pc: Pointer) -> Option<&Instruction> {
        self.function(pc.obj())?.instructions.get(pc.offset() as usize)
    }

    /// The code pointer of the next instruction within the same function.
    #[must_use]
    pub fn advance(&self, pc: Pointer) -> Pointer {
        pc.add_offset(1)
    }

    #[must_use]
    pub fn global_index(&self, name: &str) -> Option<u32> {
        self.globals.iter().position(|g| &*g.name == name).map(|i| i as u32)
    }

    /// Materialise the constant and global pools as two objects in the
    /// target heap, returning `(constants, globals)` base pointers. Runs
    /// once per boot.
    pub fn export_heap(&self, heap: &mut CowHeap) -> (Pointer, Pointer) {
        let export = |heap: &mut CowHeap, items: &[DataItem], size: u32, tag: PointerTag| {
            let base = heap.make_tagged(size, tag);
            for item in items {
                heap.write_bytes(base.add_offset(i64::from(item.offset)), &item.bytes)
                    .expect("exported pools are sized to fit their items");
            }
            base
        };
        let constants = export(heap, &self.constants, self.constants_size, PointerTag::Constant);
        let globals = export(heap, &self.globals, self.globals_size, PointerTag::Global);
        (constants, globals)
    }
}
