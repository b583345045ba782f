//! The loader boundary: a front-end hands over descriptor tables, we
//! validate them and produce an immutable [`Program`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compiler::ir::{
    instruction::{Instruction, Operand},
    layout::assign_slots,
    opcode::Opcode,
    program::{DataItem, Function, Program},
};

/// Errors detected while loading a module. These are host errors: the run
/// aborts, nothing is explored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("module has no functions")]
    Empty,
    #[error("duplicate function name {0:?}")]
    DuplicateFunction(String),
    #[error("function {function:?}: unsupported slot width {width}")]
    BadSlotWidth { function: String, width: u8 },
    #[error("function {function:?}: more parameters than slots")]
    BadParamCount { function: String },
    #[error("function {function:?}, block {block}: empty or unterminated block")]
    Unterminated { function: String, block: usize },
    #[error("function {function:?}, instruction {index}: terminator in block interior")]
    StrayTerminator { function: String, index: usize },
    #[error("function {function:?}, instruction {index}: reference out of range")]
    DanglingReference { function: String, index: usize },
    #[error("duplicate data item {0:?}")]
    DuplicateData(String),
}

/// Descriptor of one SSA value slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlotDesc {
    pub width: u8,
    pub is_pointer: bool,
}

/// Descriptor of one function: slots, then instructions grouped into basic
/// blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDesc {
    pub name: String,
    pub slots: Vec<SlotDesc>,
    pub param_count: u16,
    pub blocks: Vec<Vec<Instruction>>,
}

/// A named initial byte blob (global or constant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDesc {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// The opaque module handle the core consumes: everything a front-end must
/// provide, already lowered to descriptor tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleDesc {
    pub functions: Vec<FunctionDesc>,
    pub globals: Vec<DataDesc>,
    pub constants: Vec<DataDesc>,
}

/// Validate a module and lower it into a [`Program`].
pub fn load(module: ModuleDesc) -> Result<Program, LoadError> {
    if module.functions.is_empty() {
        return Err(LoadError::Empty);
    }

    let function_count = module.functions.len();
    let mut names = hashbrown::HashSet::new();
    for f in &module.functions {
        if !names.insert(f.name.clone()) {
            return Err(LoadError::DuplicateFunction(f.name.clone()));
        }
    }

    let mut functions = Vec::with_capacity(function_count);
    for desc in module.functions {
        functions.push(load_function(desc, function_count, &module.globals, &module.constants)?);
    }

    let globals = pack_data(module.globals)?;
    let constants = pack_data(module.constants)?;
    Ok(Program::new(functions, globals, constants))
}

fn load_function(
    desc: FunctionDesc,
    function_count: usize,
    globals: &[DataDesc],
    constants: &[DataDesc],
) -> Result<Function, LoadError> {
    let name = desc.name;
    for slot in &desc.slots {
        if !matches!(slot.width, 1 | 2 | 4 | 8) {
            return Err(LoadError::BadSlotWidth { function: name.clone(), width: slot.width });
        }
    }
    if usize::from(desc.param_count) > desc.slots.len() {
        return Err(LoadError::BadParamCount { function: name.clone() });
    }

    let requests: Vec<(u8, bool)> = desc.slots.iter().map(|s| (s.width, s.is_pointer)).collect();
    let (slots, frame_size) = assign_slots(&requests);

    let block_count = desc.blocks.len();
    let mut instructions: Vec<Instruction> = Vec::new();
    let mut starts = Vec::with_capacity(block_count);
    for (block, body) in desc.blocks.into_iter().enumerate() {
        if !body.last().is_some_and(|i| i.opcode.is_terminator()) {
            return Err(LoadError::Unterminated { function: name.clone(), block });
        }
        if body.iter().rev().skip(1).any(|i| i.opcode.is_terminator()) {
            let index = instructions.len();
            return Err(LoadError::StrayTerminator { function: name.clone(), index });
        }
        starts.push(instructions.len() as u32);
        instructions.extend(body);
    }

    for (index, instruction) in instructions.iter().enumerate() {
        let dangling = || LoadError::DanglingReference { function: name.clone(), index };
        if let Some(slot) = instruction.result {
            if usize::from(slot) >= slots.len() {
                return Err(dangling());
            }
        }
        for operand in instruction.operands.iter() {
            let in_range = match *operand {
                Operand::Reg(slot) => usize::from(slot) < slots.len(),
                Operand::Block(block) => (block as usize) < block_count,
                Operand::Func(f) => (f as usize) < function_count,
                Operand::Global(g) => (g as usize) < globals.len(),
                Operand::Const(c) => (c as usize) < constants.len(),
                Operand::Imm(_) => true,
            };
            if !in_range {
                return Err(dangling());
            }
        }
        // a hypercall's code operand must be immediate
        if instruction.opcode == Opcode::Hypercall
            && !matches!(instruction.operands.first(), Some(Operand::Imm(_)))
        {
            return Err(dangling());
        }
    }

    Ok(Function {
        name: name.into(),
        slots: slots.into(),
        param_count: desc.param_count,
        frame_size,
        instructions: instructions.into(),
        blocks: starts.into(),
    })
}

fn pack_data(items: Vec<DataDesc>) -> Result<Vec<DataItem>, LoadError> {
    let mut names = hashbrown::HashSet::new();
    let mut cursor = 0u32;
    let mut packed = Vec::with_capacity(items.len());
    for item in items {
        if !names.insert(item.name.clone()) {
            return Err(LoadError::DuplicateData(item.name));
        }
        let offset = cursor.next_multiple_of(8);
        cursor = offset + item.bytes.len() as u32;
        packed.push(DataItem {
            name: item.name.into(),
            offset,
            bytes: item.bytes.into(),
        });
    }
    Ok(packed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ret() -> Instruction {
        Instruction::new(Opcode::Ret, None, vec![])
    }

    fn minimal() -> ModuleDesc {
        ModuleDesc {
            functions: vec![FunctionDesc {
                name: "__boot".into(),
                slots: vec![],
                param_count: 0,
                blocks: vec![vec![ret()]],
            }],
            globals: vec![],
            constants: vec![],
        }
    }

    #[test]
    fn loads_a_minimal_module() {
        let program = load(minimal()).unwrap();
        assert!(program.function_by_name("__boot").is_some());
    }

    #[test]
    fn rejects_dangling_block_targets() {
        let mut module = minimal();
        module.functions[0].blocks[0] =
            vec![Instruction::new(Opcode::Br, None, vec![Operand::Block(3)])];
        assert!(matches!(load(module), Err(LoadError::DanglingReference { .. })));
    }

    #[test]
    fn rejects_unterminated_blocks() {
        let mut module = minimal();
        module.functions[0].blocks[0] = vec![Instruction::new(Opcode::Mov, None, vec![Operand::Imm(0)])];
        assert!(matches!(load(module), Err(LoadError::Unterminated { .. })));
    }

    #[test]
    fn rejects_duplicate_functions() {
        let mut module = minimal();
        module.functions.push(module.functions[0].clone());
        assert!(matches!(load(module), Err(LoadError::DuplicateFunction(_))));
    }

    #[test]
    fn rejects_bad_widths() {
        let mut module = minimal();
        module.functions[0].slots.push(SlotDesc { width: 3, is_pointer: false });
        assert!(matches!(load(module), Err(LoadError::BadSlotWidth { .. })));
    }
}
