//! IR module, function and basic block definitions

use super::instruction::{BlockId, FuncId, GlobalId, IrInstruction, IrOp, IrReg};
use std::collections::HashMap;

/// Basic block in the control flow graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Position of this block in its function
    pub id: BlockId,
    /// Human readable label
    pub label: String,
    /// Instructions; the last one is the terminator
    pub instructions: Vec<IrInstruction>,
}

impl BasicBlock {
    /// Create an empty block
    pub fn new(id: BlockId, label: &str) -> Self {
        Self {
            id,
            label: label.to_string(),
            instructions: Vec::new(),
        }
    }

    /// Terminating operation, if the block is complete
    pub fn terminator(&self) -> Option<&IrOp> {
        self.instructions
            .last()
            .map(|inst| &inst.op)
            .filter(|op| op.is_terminator())
    }

    /// Successor blocks
    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator().map(IrOp::successors).unwrap_or_default()
    }

    /// Index of the first instruction that is not a phi
    pub fn first_non_phi(&self) -> usize {
        self.instructions
            .iter()
            .position(|inst| !matches!(inst.op, IrOp::Phi { .. }))
            .unwrap_or(self.instructions.len())
    }

    /// Index at which code can be appended before the terminator
    pub fn insertion_point(&self) -> usize {
        if self.terminator().is_some() {
            self.instructions.len() - 1
        } else {
            self.instructions.len()
        }
    }
}

/// Function parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    /// Register holding the incoming value
    pub reg: IrReg,
    /// Whether the parameter carries an address
    pub is_pointer: bool,
}

/// IR function; a function without blocks is an external declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Linkage name
    pub name: String,
    /// Parameters in call order
    pub params: Vec<Param>,
    /// Blocks; block 0 is the entry
    pub blocks: Vec<BasicBlock>,
    /// Whether the function is a device entry point
    pub is_kernel: bool,
    /// Whether the function should be instrumented
    pub sanitize: bool,
    next_reg: u32,
}

impl Function {
    /// Create an empty function definition
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            blocks: Vec::new(),
            is_kernel: false,
            sanitize: true,
            next_reg: 0,
        }
    }

    /// Create an external declaration with the given parameter shape
    pub fn declaration(name: &str, pointer_params: &[bool]) -> Self {
        let mut func = Self::new(name);
        func.sanitize = false;
        for &is_pointer in pointer_params {
            func.add_param(is_pointer);
        }
        func
    }

    /// Whether the function has no body
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Append a parameter
    pub fn add_param(&mut self, is_pointer: bool) -> IrReg {
        let reg = self.new_reg();
        self.params.push(Param { reg, is_pointer });
        reg
    }

    /// Allocate a fresh register
    pub fn new_reg(&mut self) -> IrReg {
        let reg = IrReg(self.next_reg);
        self.next_reg += 1;
        reg
    }

    /// Make sure fresh registers do not collide with any existing one
    pub fn sync_registers(&mut self) {
        let mut max = self.params.iter().map(|p| p.reg.0 + 1).max().unwrap_or(0);
        for block in &self.blocks {
            for inst in &block.instructions {
                for reg in inst.op.defs() {
                    max = max.max(reg.0 + 1);
                }
            }
        }
        self.next_reg = self.next_reg.max(max);
    }

    /// Append an empty block
    pub fn add_block(&mut self, label: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id, label));
        id
    }

    /// Entry block id
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    /// Block by id
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index())
    }

    /// Mutable block by id
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(id.index())
    }

    /// Predecessor lists indexed by block
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for block in &self.blocks {
            for succ in block.successors() {
                if let Some(list) = preds.get_mut(succ.index()) {
                    list.push(block.id);
                }
            }
        }
        preds
    }

    /// Where every register is defined: `(block, index)`; parameters are absent
    pub fn definitions(&self) -> HashMap<IrReg, (BlockId, usize)> {
        let mut defs = HashMap::new();
        for block in &self.blocks {
            for (idx, inst) in block.instructions.iter().enumerate() {
                for reg in inst.op.defs() {
                    defs.insert(reg, (block.id, idx));
                }
            }
        }
        defs
    }

    /// Position of a register in the parameter list
    pub fn param_index(&self, reg: IrReg) -> Option<usize> {
        self.params.iter().position(|p| p.reg == reg)
    }

    /// Number of stack allocations
    pub fn alloca_count(&self) -> usize {
        self.instructions()
            .filter(|inst| matches!(inst.op, IrOp::Alloca { .. }))
            .count()
    }

    /// All instructions in block order
    pub fn instructions(&self) -> impl Iterator<Item = &IrInstruction> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }
}

/// Module-level variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalVar {
    /// Linkage name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Initial contents (zero-padded to `size`)
    pub init: Vec<u8>,
    /// Whether the variable is read-only
    pub constant: bool,
}

impl GlobalVar {
    /// Zero-initialized variable
    pub fn zeroed(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
            init: Vec::new(),
            constant: false,
        }
    }
}

/// Complete IR module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    /// Module name
    pub name: String,
    /// Functions, declarations included
    pub functions: Vec<Function>,
    /// Module globals
    pub globals: Vec<GlobalVar>,
    /// Functions run before any kernel
    pub ctors: Vec<FuncId>,
    /// Functions run after the last kernel
    pub dtors: Vec<FuncId>,
}

impl Module {
    /// Create an empty module
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Append a function
    pub fn add_function(&mut self, function: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(function);
        id
    }

    /// Append a global
    pub fn add_global(&mut self, global: GlobalVar) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    /// Function by id
    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.index())
    }

    /// Mutable function by id
    pub fn function_mut(&mut self, id: FuncId) -> Option<&mut Function> {
        self.functions.get_mut(id.index())
    }

    /// Look a function up by name
    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|idx| FuncId(idx as u32))
    }

    /// Global by id
    pub fn global(&self, id: GlobalId) -> Option<&GlobalVar> {
        self.globals.get(id.index())
    }

    /// Look a global up by name
    pub fn find_global(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.name == name)
            .map(|idx| GlobalId(idx as u32))
    }

    /// Whether any function definition contains a stack allocation
    pub fn has_allocas(&self) -> bool {
        self.functions.iter().any(|f| f.alloca_count() > 0)
    }

    /// Ids of all functions
    pub fn function_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len() as u32).map(FuncId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::Operand;

    #[test]
    fn test_predecessors_and_definitions() {
        let mut func = Function::new("f");
        let entry = func.add_block("entry");
        let exit = func.add_block("exit");
        let x = func.new_reg();
        func.blocks[0].instructions.push(IrInstruction::new(IrOp::Copy {
            dst: x,
            src: Operand::Const(1),
        }));
        func.blocks[0].instructions.push(IrInstruction::new(IrOp::Jump(exit)));
        func.blocks[1]
            .instructions
            .push(IrInstruction::new(IrOp::Return(Some(Operand::Reg(x)))));

        assert_eq!(func.predecessors()[exit.index()], vec![entry]);
        assert_eq!(func.definitions()[&x], (entry, 0));
        assert_eq!(func.blocks[0].insertion_point(), 1);
    }

    #[test]
    fn test_sync_registers_skips_existing() {
        let mut func = Function::new("f");
        func.add_block("entry");
        func.blocks[0].instructions.push(IrInstruction::new(IrOp::Alloca {
            dst: IrReg(41),
            size: 8,
        }));
        func.sync_registers();
        assert_eq!(func.new_reg(), IrReg(42));
    }

    #[test]
    fn test_module_lookup() {
        let mut module = Module::new("m");
        let id = module.add_function(Function::declaration("puts", &[true]));
        assert_eq!(module.find_function("puts"), Some(id));
        assert!(module.function(id).unwrap().is_declaration());
        assert!(!module.has_allocas());
    }
}
