//! IR instruction definitions

use crate::runtime::AllocationKind;
use std::fmt;

/// Virtual register (SSA value, defined exactly once)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrReg(pub u32);

impl IrReg {
    /// Creates a new virtual register with the given ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for IrReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Index of a basic block inside its function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Position in `Function::blocks`
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Index of a function inside its module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl FuncId {
    /// Position in `Module::functions`
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a global variable inside its module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub u32);

impl GlobalId {
    /// Position in `Module::globals`
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Instruction operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    /// Value of a register
    Reg(IrReg),
    /// 64-bit integer constant (also used for null and raw addresses)
    Const(i64),
    /// Address of a module global
    Global(GlobalId),
    /// Address of a function (for indirect calls)
    Func(FuncId),
}

impl Operand {
    /// Register, if this operand is one
    pub fn reg(&self) -> Option<IrReg> {
        match self {
            Operand::Reg(reg) => Some(*reg),
            _ => None,
        }
    }

    /// Constant value, if this operand is one
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Operand::Const(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<IrReg> for Operand {
    fn from(reg: IrReg) -> Self {
        Operand::Reg(reg)
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Const(value)
    }
}

impl From<GlobalId> for Operand {
    fn from(global: GlobalId) -> Self {
        Operand::Global(global)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{}", reg),
            Operand::Const(value) => write!(f, "{}", value),
            Operand::Global(g) => write!(f, "@g{}", g.0),
            Operand::Func(func) => write!(f, "@f{}", func.0),
        }
    }
}

/// Two-operand integer arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// Wrapping addition
    Add,
    /// Wrapping subtraction
    Sub,
    /// Wrapping multiplication
    Mul,
    /// Signed division (truncating)
    SDiv,
    /// Unsigned division
    UDiv,
    /// Signed remainder
    SRem,
    /// Bitwise and
    And,
    /// Bitwise or
    Or,
    /// Bitwise xor
    Xor,
    /// Shift left
    Shl,
    /// Logical shift right
    LShr,
    /// Arithmetic shift right
    AShr,
    /// Signed minimum
    SMin,
    /// Signed maximum
    SMax,
    /// Unsigned minimum
    UMin,
    /// Unsigned maximum
    UMax,
}

impl BinOp {
    /// Evaluate on 64-bit values; `None` on division by zero
    pub fn eval(self, lhs: i64, rhs: i64) -> Option<i64> {
        let (ul, ur) = (lhs as u64, rhs as u64);
        Some(match self {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::Mul => lhs.wrapping_mul(rhs),
            BinOp::SDiv => lhs.checked_div(rhs)?,
            BinOp::UDiv => ul.checked_div(ur)? as i64,
            BinOp::SRem => lhs.checked_rem(rhs)?,
            BinOp::And => lhs & rhs,
            BinOp::Or => lhs | rhs,
            BinOp::Xor => lhs ^ rhs,
            BinOp::Shl => ul.wrapping_shl(ur as u32) as i64,
            BinOp::LShr => ul.wrapping_shr(ur as u32) as i64,
            BinOp::AShr => lhs.wrapping_shr(ur as u32),
            BinOp::SMin => lhs.min(rhs),
            BinOp::SMax => lhs.max(rhs),
            BinOp::UMin => ul.min(ur) as i64,
            BinOp::UMax => ul.max(ur) as i64,
        })
    }
}

/// Integer comparison predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpPred {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Signed less than
    Slt,
    /// Signed less or equal
    Sle,
    /// Signed greater than
    Sgt,
    /// Signed greater or equal
    Sge,
    /// Unsigned less than
    Ult,
    /// Unsigned less or equal
    Ule,
    /// Unsigned greater than
    Ugt,
    /// Unsigned greater or equal
    Uge,
}

impl CmpPred {
    /// Evaluate the predicate
    pub fn eval(self, lhs: i64, rhs: i64) -> bool {
        let (ul, ur) = (lhs as u64, rhs as u64);
        match self {
            CmpPred::Eq => lhs == rhs,
            CmpPred::Ne => lhs != rhs,
            CmpPred::Slt => lhs < rhs,
            CmpPred::Sle => lhs <= rhs,
            CmpPred::Sgt => lhs > rhs,
            CmpPred::Sge => lhs >= rhs,
            CmpPred::Ult => ul < ur,
            CmpPred::Ule => ul <= ur,
            CmpPred::Ugt => ul > ur,
            CmpPred::Uge => ul >= ur,
        }
    }

    /// Predicate that holds exactly when `self` does not
    pub fn inverse(self) -> Self {
        match self {
            CmpPred::Eq => CmpPred::Ne,
            CmpPred::Ne => CmpPred::Eq,
            CmpPred::Slt => CmpPred::Sge,
            CmpPred::Sle => CmpPred::Sgt,
            CmpPred::Sgt => CmpPred::Sle,
            CmpPred::Sge => CmpPred::Slt,
            CmpPred::Ult => CmpPred::Uge,
            CmpPred::Ule => CmpPred::Ugt,
            CmpPred::Ugt => CmpPred::Ule,
            CmpPred::Uge => CmpPred::Ult,
        }
    }

    /// Predicate with the operands exchanged
    pub fn swapped(self) -> Self {
        match self {
            CmpPred::Slt => CmpPred::Sgt,
            CmpPred::Sle => CmpPred::Sge,
            CmpPred::Sgt => CmpPred::Slt,
            CmpPred::Sge => CmpPred::Sle,
            CmpPred::Ult => CmpPred::Ugt,
            CmpPred::Ule => CmpPred::Uge,
            CmpPred::Ugt => CmpPred::Ult,
            CmpPred::Uge => CmpPred::Ule,
            pred => pred,
        }
    }
}

/// Target intrinsics understood by the pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Intrinsic {
    /// Thread index within the grid
    ThreadId,
    /// Pointer to the implicit kernel arguments (runtime-owned)
    ImplicitArgPtr,
    /// Pointer to the dispatch packet (runtime-owned)
    DispatchPtr,
    /// `(size, ptr)`: the stack object becomes accessible
    LifetimeStart,
    /// `(size, ptr)`: the stack object becomes inaccessible
    LifetimeEnd,
}

impl Intrinsic {
    /// Whether the result points into runtime-owned memory
    pub fn yields_system_pointer(self) -> bool {
        matches!(self, Intrinsic::ImplicitArgPtr | Intrinsic::DispatchPtr)
    }
}

/// Call target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// Known function
    Direct(FuncId),
    /// Function pointer
    Indirect(Operand),
}

/// Runtime entry point inserted by the instrumentation pass
///
/// Argument layouts are fixed per entry; `site` below stands for
/// `access_id, source_id, pc` and `info` for `start, length, tag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeEntry {
    /// `(start, length, alloc_id, source_id, pc) -> ptr`
    New(AllocationKind),
    /// `(ptr, source_id, pc)`
    Free(AllocationKind),
    /// `(count)`
    FreeN,
    /// `(ptr, size, site) -> real` (no result when `void`)
    Check {
        /// Table kind
        kind: AllocationKind,
        /// Whether the real address is discarded
        void: bool,
    },
    /// `(ptr, info, size, site) -> real` (no result when `void`)
    CheckWithBase {
        /// Table kind
        kind: AllocationKind,
        /// Whether the real address is discarded
        void: bool,
    },
    /// `(max, min, size, site)`
    CheckRange(AllocationKind),
    /// `(max, min, info, size, site)`
    CheckRangeWithBase(AllocationKind),
    /// `(pc, [ptr, size, access_id, source_id] * count) -> real * count`
    CheckVec {
        /// Table kind
        kind: AllocationKind,
        /// Number of lanes
        count: u32,
    },
    /// `(pc, [ptr, info, size, access_id, source_id] * count) -> real * count`
    CheckWithBaseVec {
        /// Table kind
        kind: AllocationKind,
        /// Number of lanes
        count: u32,
    },
    /// `(ptr, delta, source_id) -> ptr`
    Gep(AllocationKind),
    /// `(ptr, source_id) -> real`
    Unpack(AllocationKind),
    /// `(ptr, length, source_id, pc)`
    LifetimeStart,
    /// `(ptr, length, source_id, pc)`
    LifetimeEnd,
    /// `(ptr) -> start, length, tag`
    AllocationInfo(AllocationKind),
    /// `()`
    LeakCheck,
    /// `() -> previous call-site word`
    PushCallSite {
        /// Ambiguous call index
        index: u32,
        /// Bits per call-site entry
        bits: u32,
    },
    /// `(previous call-site word)`
    RestoreCallSite,
    /// `()`
    ResetCallSite,
}

impl RuntimeEntry {
    fn parts(&self) -> (&'static str, Option<AllocationKind>) {
        match *self {
            RuntimeEntry::New(kind) => ("new", Some(kind)),
            RuntimeEntry::Free(kind) => ("free", Some(kind)),
            RuntimeEntry::FreeN => ("free_n", Some(AllocationKind::Local)),
            RuntimeEntry::Check { kind, void: false } => ("check", Some(kind)),
            RuntimeEntry::Check { kind, void: true } => ("check_void", Some(kind)),
            RuntimeEntry::CheckWithBase { kind, void: false } => ("check_with_base", Some(kind)),
            RuntimeEntry::CheckWithBase { kind, void: true } => {
                ("check_with_base_void", Some(kind))
            }
            RuntimeEntry::CheckRange(kind) => ("check_range", Some(kind)),
            RuntimeEntry::CheckRangeWithBase(kind) => ("check_range_with_base", Some(kind)),
            RuntimeEntry::CheckVec { kind, .. } => ("check_vec", Some(kind)),
            RuntimeEntry::CheckWithBaseVec { kind, .. } => ("check_with_base_vec", Some(kind)),
            RuntimeEntry::Gep(kind) => ("gep", Some(kind)),
            RuntimeEntry::Unpack(kind) => ("unpack", Some(kind)),
            RuntimeEntry::LifetimeStart => ("lifetime_start", Some(AllocationKind::Local)),
            RuntimeEntry::LifetimeEnd => ("lifetime_end", Some(AllocationKind::Local)),
            RuntimeEntry::AllocationInfo(kind) => ("get_allocation_info", Some(kind)),
            RuntimeEntry::LeakCheck => ("leak_check", None),
            RuntimeEntry::PushCallSite { .. } => ("push_call_site", None),
            RuntimeEntry::RestoreCallSite => ("restore_call_site", None),
            RuntimeEntry::ResetCallSite => ("reset_call_site", None),
        }
    }

    /// Linkage name of the entry point
    pub fn symbol(&self) -> String {
        let (base, kind) = self.parts();
        let suffix = kind.map(AllocationKind::suffix).unwrap_or("");
        format!("__gpusan_{}{}", base, suffix)
    }

    /// Table kind the entry point operates on, if any
    pub fn kind(&self) -> Option<AllocationKind> {
        self.parts().1
    }

    /// Number of registers the entry point defines
    pub fn result_count(&self) -> usize {
        match *self {
            RuntimeEntry::New(_)
            | RuntimeEntry::Gep(_)
            | RuntimeEntry::Unpack(_)
            | RuntimeEntry::PushCallSite { .. } => 1,
            RuntimeEntry::Check { void, .. } | RuntimeEntry::CheckWithBase { void, .. } => {
                usize::from(!void)
            }
            RuntimeEntry::CheckVec { count, .. } | RuntimeEntry::CheckWithBaseVec { count, .. } => {
                count as usize
            }
            RuntimeEntry::AllocationInfo(_) => 3,
            _ => 0,
        }
    }

    /// Number of arguments the entry point takes
    pub fn arg_count(&self) -> usize {
        match *self {
            RuntimeEntry::New(_) => 5,
            RuntimeEntry::Free(_) => 3,
            RuntimeEntry::FreeN => 1,
            RuntimeEntry::Check { .. } => 5,
            RuntimeEntry::CheckWithBase { .. } => 8,
            RuntimeEntry::CheckRange(_) => 6,
            RuntimeEntry::CheckRangeWithBase(_) => 9,
            RuntimeEntry::CheckVec { count, .. } => 1 + 4 * count as usize,
            RuntimeEntry::CheckWithBaseVec { count, .. } => 1 + 7 * count as usize,
            RuntimeEntry::Gep(_) => 3,
            RuntimeEntry::Unpack(_) => 2,
            RuntimeEntry::LifetimeStart | RuntimeEntry::LifetimeEnd => 4,
            RuntimeEntry::AllocationInfo(_) => 1,
            RuntimeEntry::LeakCheck => 0,
            RuntimeEntry::PushCallSite { .. } => 0,
            RuntimeEntry::RestoreCallSite => 1,
            RuntimeEntry::ResetCallSite => 0,
        }
    }

    /// Whether the entry point validates memory
    pub fn is_check(&self) -> bool {
        matches!(
            self,
            RuntimeEntry::Check { .. }
                | RuntimeEntry::CheckWithBase { .. }
                | RuntimeEntry::CheckRange(_)
                | RuntimeEntry::CheckRangeWithBase(_)
                | RuntimeEntry::CheckVec { .. }
                | RuntimeEntry::CheckWithBaseVec { .. }
        )
    }
}

/// Source position attached to an instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebugLoc {
    /// Source file
    pub file: String,
    /// Function the code was written in (before inlining)
    pub function: String,
    /// Line number
    pub line: u32,
    /// Column number
    pub column: u32,
    /// Call site this location was inlined into
    pub inlined_at: Option<Box<DebugLoc>>,
}

impl DebugLoc {
    /// Location outside of any inlined scope
    pub fn new(file: impl Into<String>, function: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            function: function.into(),
            line,
            column,
            inlined_at: None,
        }
    }

    /// Same location, inlined at `call_site`
    pub fn inlined_into(mut self, call_site: DebugLoc) -> Self {
        self.inlined_at = Some(Box::new(call_site));
        self
    }
}

/// Memory access performed by a load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    /// Address operand
    pub ptr: Operand,
    /// Access width in bytes
    pub size: u32,
    /// Whether the access writes memory
    pub is_write: bool,
}

/// IR operation (SSA form)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrOp {
    // Memory
    /// Stack allocation: dst = address of `size` fresh bytes
    Alloca { dst: IrReg, size: u64 },
    /// Load `size` bytes (little endian, zero extended)
    Load { dst: IrReg, ptr: Operand, size: u32 },
    /// Store the low `size` bytes of `value`
    Store { ptr: Operand, value: Operand, size: u32 },
    /// Address computation: dst = base + offset bytes
    Gep { dst: IrReg, base: Operand, offset: Operand },

    // Arithmetic
    /// dst = lhs op rhs
    Bin { dst: IrReg, op: BinOp, lhs: Operand, rhs: Operand },
    /// dst = (lhs pred rhs) as 0/1
    Cmp { dst: IrReg, pred: CmpPred, lhs: Operand, rhs: Operand },
    /// dst = cond != 0 ? if_true : if_false
    Select { dst: IrReg, cond: Operand, if_true: Operand, if_false: Operand },
    /// dst = src
    Copy { dst: IrReg, src: Operand },
    /// SSA join; must precede every non-phi instruction of its block
    Phi { dst: IrReg, incoming: Vec<(BlockId, Operand)> },

    // Calls
    /// Call a function
    Call { dst: Option<IrReg>, callee: Callee, args: Vec<Operand> },
    /// Target intrinsic
    Intrinsic { dst: Option<IrReg>, intrinsic: Intrinsic, args: Vec<Operand> },
    /// Sanitizer runtime entry point
    Runtime { dsts: Vec<IrReg>, entry: RuntimeEntry, args: Vec<Operand> },

    // Control flow
    /// Unconditional branch
    Jump(BlockId),
    /// Conditional branch on `cond != 0`
    Branch { cond: Operand, then_block: BlockId, else_block: BlockId },
    /// Return from the function
    Return(Option<Operand>),
}

impl IrOp {
    /// Registers defined by this operation
    pub fn defs(&self) -> Vec<IrReg> {
        match self {
            IrOp::Alloca { dst, .. }
            | IrOp::Load { dst, .. }
            | IrOp::Gep { dst, .. }
            | IrOp::Bin { dst, .. }
            | IrOp::Cmp { dst, .. }
            | IrOp::Select { dst, .. }
            | IrOp::Copy { dst, .. }
            | IrOp::Phi { dst, .. } => vec![*dst],
            IrOp::Call { dst, .. } | IrOp::Intrinsic { dst, .. } => dst.iter().copied().collect(),
            IrOp::Runtime { dsts, .. } => dsts.clone(),
            IrOp::Store { .. } | IrOp::Jump(_) | IrOp::Branch { .. } | IrOp::Return(_) => {
                Vec::new()
            }
        }
    }

    /// Operands read by this operation (phi incoming values included)
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            IrOp::Alloca { .. } | IrOp::Jump(_) => Vec::new(),
            IrOp::Load { ptr, .. } => vec![*ptr],
            IrOp::Store { ptr, value, .. } => vec![*ptr, *value],
            IrOp::Gep { base, offset, .. } => vec![*base, *offset],
            IrOp::Bin { lhs, rhs, .. } | IrOp::Cmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            IrOp::Select {
                cond,
                if_true,
                if_false,
                ..
            } => vec![*cond, *if_true, *if_false],
            IrOp::Copy { src, .. } => vec![*src],
            IrOp::Phi { incoming, .. } => incoming.iter().map(|(_, v)| *v).collect(),
            IrOp::Call { callee, args, .. } => {
                let mut ops = Vec::with_capacity(args.len() + 1);
                if let Callee::Indirect(target) = callee {
                    ops.push(*target);
                }
                ops.extend(args.iter().copied());
                ops
            }
            IrOp::Intrinsic { args, .. } | IrOp::Runtime { args, .. } => args.clone(),
            IrOp::Branch { cond, .. } => vec![*cond],
            IrOp::Return(value) => value.iter().copied().collect(),
        }
    }

    /// Mutable references to every operand read by this operation
    pub fn operands_mut(&mut self) -> Vec<&mut Operand> {
        match self {
            IrOp::Alloca { .. } | IrOp::Jump(_) => Vec::new(),
            IrOp::Load { ptr, .. } => vec![ptr],
            IrOp::Store { ptr, value, .. } => vec![ptr, value],
            IrOp::Gep { base, offset, .. } => vec![base, offset],
            IrOp::Bin { lhs, rhs, .. } | IrOp::Cmp { lhs, rhs, .. } => vec![lhs, rhs],
            IrOp::Select {
                cond,
                if_true,
                if_false,
                ..
            } => vec![cond, if_true, if_false],
            IrOp::Copy { src, .. } => vec![src],
            IrOp::Phi { incoming, .. } => incoming.iter_mut().map(|(_, v)| v).collect(),
            IrOp::Call { callee, args, .. } => {
                let mut ops: Vec<&mut Operand> = Vec::with_capacity(args.len() + 1);
                if let Callee::Indirect(target) = callee {
                    ops.push(target);
                }
                ops.extend(args.iter_mut());
                ops
            }
            IrOp::Intrinsic { args, .. } | IrOp::Runtime { args, .. } => args.iter_mut().collect(),
            IrOp::Branch { cond, .. } => vec![cond],
            IrOp::Return(value) => value.iter_mut().collect(),
        }
    }

    /// Whether this operation ends a block
    pub fn is_terminator(&self) -> bool {
        matches!(self, IrOp::Jump(_) | IrOp::Branch { .. } | IrOp::Return(_))
    }

    /// Branch targets of a terminator
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            IrOp::Jump(target) => vec![*target],
            IrOp::Branch {
                then_block,
                else_block,
                ..
            } if then_block == else_block => vec![*then_block],
            IrOp::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            _ => Vec::new(),
        }
    }

    /// Memory access performed by a load or store
    pub fn memory_access(&self) -> Option<MemoryAccess> {
        match self {
            IrOp::Load { ptr, size, .. } => Some(MemoryAccess {
                ptr: *ptr,
                size: *size,
                is_write: false,
            }),
            IrOp::Store { ptr, size, .. } => Some(MemoryAccess {
                ptr: *ptr,
                size: *size,
                is_write: true,
            }),
            _ => None,
        }
    }

    /// Replace the address operand of a load or store
    pub fn set_access_ptr(&mut self, new_ptr: Operand) {
        if let IrOp::Load { ptr, .. } | IrOp::Store { ptr, .. } = self {
            *ptr = new_ptr;
        }
    }
}

/// Instruction: an operation plus its source position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrInstruction {
    /// What the instruction does
    pub op: IrOp,
    /// Where it came from
    pub loc: Option<DebugLoc>,
}

impl IrInstruction {
    /// Instruction without debug information
    pub fn new(op: IrOp) -> Self {
        Self { op, loc: None }
    }

    /// Instruction with an optional location
    pub fn with_loc(op: IrOp, loc: Option<DebugLoc>) -> Self {
        Self { op, loc }
    }
}
