//! Programmatic construction of [`Program`]s.
//!
//! This is how the bundled kernels and the test suite produce modules; a
//! front-end producing descriptor tables goes through
//! [`loader`](crate::compiler::loader) instead. Misuse (dangling slot ids,
//! blocks without terminators) is a programming error and panics.

use hashbrown::HashMap;

use crate::compiler::ir::{
    instruction::{BlockId, FunctionId, Instruction, Operand, SlotId},
    layout::assign_slots,
    opcode::Opcode,
    program::{DataItem, Function, Program},
};

#[derive(Default)]
pub struct ProgramBuilder {
    functions: Vec<Function>,
    by_name: HashMap<String, FunctionId>,
    globals: Vec<DataItem>,
    globals_cursor: u32,
    constants: Vec<DataItem>,
    constants_cursor: u32,
}

impl ProgramBuilder {
    #[must_use]
    pub fn new() -> Self {
        ProgramBuilder::default()
    }

    /// Reserve a function id before its body exists, so mutually recursive
    /// functions can reference each other.
    pub fn declare(&mut self, name: &str) -> FunctionId {
        assert!(!self.by_name.contains_key(name), "duplicate function {name}");
        let id = self.functions.len() as FunctionId;
        self.functions.push(Function {
            name: name.into(),
            slots: Vec::new().into(),
            param_count: 0,
            frame_size: 0,
            instructions: Vec::new().into(),
            blocks: Vec::new().into(),
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Build the body of a declared function.
    pub fn define(&mut self, id: FunctionId, build: impl FnOnce(&mut FunctionBuilder)) {
        let mut fb = FunctionBuilder::new();
        build(&mut fb);
        let name = self.functions[id as usize].name.clone();
        self.functions[id as usize] = fb.finish(&name);
    }

    /// Declare and define in one go.
    pub fn function(&mut self, name: &str, build: impl FnOnce(&mut FunctionBuilder)) -> FunctionId {
        let id = self.declare(name);
        self.define(id, build);
        id
    }

    pub fn global(&mut self, name: &str, bytes: &[u8]) -> u32 {
        push_item(&mut self.globals, &mut self.globals_cursor, name, bytes)
    }

    pub fn constant(&mut self, name: &str, bytes: &[u8]) -> u32 {
        push_item(&mut self.constants, &mut self.constants_cursor, name, bytes)
    }

    #[must_use]
    pub fn finish(self) -> Program {
        Program::new(self.functions, self.globals, self.constants)
    }
}

fn push_item(items: &mut Vec<DataItem>, cursor: &mut u32, name: &str, bytes: &[u8]) -> u32 {
    let offset = cursor.next_multiple_of(8);
    *cursor = offset + bytes.len() as u32;
    items.push(DataItem {
        name: name.into(),
        offset,
        bytes: bytes.to_vec().into(),
    });
    items.len() as u32 - 1
}

pub struct FunctionBuilder {
    slot_requests: Vec<(u8, bool)>,
    param_count: u16,
    blocks: Vec<Vec<Instruction>>,
    current: usize,
}

impl FunctionBuilder {
    fn new() -> Self {
        FunctionBuilder {
            slot_requests: Vec::new(),
            param_count: 0,
            blocks: vec![Vec::new()],
            current: 0,
        }
    }

    /// Declare a parameter slot. Parameters must be declared before any
    /// other slot; they receive the call arguments in order.
    pub fn param(&mut self, width: u8, is_pointer: bool) -> SlotId {
        assert_eq!(
            self.param_count as usize,
            self.slot_requests.len(),
            "parameters must be declared first"
        );
        self.param_count += 1;
        self.slot(width, is_pointer)
    }

    pub fn slot(&mut self, width: u8, is_pointer: bool) -> SlotId {
        assert!(matches!(width, 1 | 2 | 4 | 8), "unsupported width {width}");
        self.slot_requests.push((width, is_pointer));
        self.slot_requests.len() as SlotId - 1
    }

    /// An 8-byte pointer slot.
    pub fn ptr_slot(&mut self) -> SlotId {
        self.slot(8, true)
    }

    /// Create a new basic block (block 0 exists from the start and is the
    /// entry).
    pub fn block(&mut self) -> BlockId {
        self.blocks.push(Vec::new());
        self.blocks.len() as BlockId - 1
    }

    /// Switch the insertion point.
    pub fn select(&mut self, block: BlockId) {
        assert!((block as usize) < self.blocks.len(), "no such block {block}");
        self.current = block as usize;
    }

    pub fn push(&mut self, opcode: Opcode, result: Option<SlotId>, operands: Vec<Operand>) {
        self.push_instruction(Instruction::new(opcode, result, operands));
    }

    pub fn push_instruction(&mut self, instruction: Instruction) {
        if let Some(slot) = instruction.result {
            assert!((slot as usize) < self.slot_requests.len(), "dangling result slot");
        }
        self.blocks[self.current].push(instruction);
    }

    fn finish(self, name: &str) -> Function {
        let (slots, frame_size) = assign_slots(&self.slot_requests);
        let mut instructions = Vec::new();
        let mut starts = Vec::with_capacity(self.blocks.len());
        for (index, block) in self.blocks.iter().enumerate() {
            assert!(
                block.last().is_some_and(|i| i.opcode.is_terminator()),
                "block {index} of {name} does not end in a terminator"
            );
            starts.push(instructions.len() as u32);
            instructions.extend(block.iter().cloned());
        }
        for instruction in &instructions {
            for operand in instruction.operands.iter() {
                match *operand {
                    Operand::Reg(slot) => {
                        assert!((slot as usize) < slots.len(), "dangling operand slot in {name}")
                    }
                    Operand::Block(block) => {
                        assert!((block as usize) < starts.len(), "dangling block target in {name}")
                    }
                    _ => {}
                }
            }
        }
        Function {
            name: name.into(),
            slots: slots.into(),
            param_count: self.param_count,
            frame_size,
            instructions: instructions.into(),
            blocks: starts.into(),
        }
    }
}
