//! # Device Intermediate Representation
//!
//! A small SSA IR for device code: functions made of basic blocks, explicit
//! loads and stores with byte widths, address arithmetic through `Gep`, and
//! calls into the sanitizer runtime as first-class [`IrOp::Runtime`]
//! operations so that the instrumentation pass never has to go through
//! symbol lookups to recognize its own code.
//!
//! ## Module Structure
//!
//! ```text
//! ir/
//! ├── mod.rs          # This file - module definition and re-exports
//! ├── instruction.rs  # IrReg, Operand, IrOp, RuntimeEntry, DebugLoc
//! ├── program.rs      # BasicBlock, Function, GlobalVar, Module
//! └── builder.rs      # FunctionBuilder for hand-written IR
//! ```
//!
//! ## Key Types
//!
//! - [`IrReg`] - Virtual register (defined exactly once)
//! - [`IrOp`] - Operation (memory, arithmetic, calls, control flow)
//! - [`Module`] - Functions, globals and constructor/destructor lists
//! - [`FunctionBuilder`] - Appends instructions with source positions

mod builder;
mod instruction;
mod program;

pub use builder::FunctionBuilder;
pub use instruction::{
    BinOp, BlockId, Callee, CmpPred, DebugLoc, FuncId, GlobalId, Intrinsic, IrInstruction, IrOp,
    IrReg, MemoryAccess, Operand, RuntimeEntry,
};
pub use program::{BasicBlock, Function, GlobalVar, Module, Param};
