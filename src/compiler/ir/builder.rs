//! Convenience builder for hand-written IR

use super::instruction::*;
use super::program::Function;

/// Appends instructions to a [`Function`] one block at a time
///
/// Every instruction gets the current source position (see [`at`](Self::at)),
/// attributed to the function being built unless [`as_inlined`](Self::as_inlined)
/// says otherwise.
#[derive(Debug)]
pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
    file: String,
    position: Option<(u32, u32)>,
    inlined: Option<(String, DebugLoc)>,
}

impl FunctionBuilder {
    /// Start a device function with an entry block
    pub fn new(name: &str, file: &str) -> Self {
        let mut func = Function::new(name);
        let current = func.add_block("entry");
        Self {
            func,
            current,
            file: file.to_string(),
            position: None,
            inlined: None,
        }
    }

    /// Start a kernel
    pub fn kernel(name: &str, file: &str) -> Self {
        let mut builder = Self::new(name, file);
        builder.func.is_kernel = true;
        builder
    }

    /// Append a parameter
    pub fn param(&mut self, is_pointer: bool) -> IrReg {
        self.func.add_param(is_pointer)
    }

    /// Create a block without switching to it
    pub fn block(&mut self, label: &str) -> BlockId {
        self.func.add_block(label)
    }

    /// Continue emitting into `block`
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Block currently receiving instructions
    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Source position for the following instructions
    pub fn at(&mut self, line: u32, column: u32) -> &mut Self {
        self.position = Some((line, column));
        self
    }

    /// Drop source positions for the following instructions
    pub fn no_loc(&mut self) -> &mut Self {
        self.position = None;
        self
    }

    /// Attribute following instructions to `function`, inlined at `call_site`
    pub fn as_inlined(&mut self, function: &str, call_site: DebugLoc) -> &mut Self {
        self.inlined = Some((function.to_string(), call_site));
        self
    }

    /// Stop attributing instructions to an inlined function
    pub fn not_inlined(&mut self) -> &mut Self {
        self.inlined = None;
        self
    }

    /// Location the next instruction will carry
    pub fn current_loc(&self) -> Option<DebugLoc> {
        let (line, column) = self.position?;
        Some(match &self.inlined {
            Some((function, call_site)) => DebugLoc::new(&self.file, function, line, column)
                .inlined_into(call_site.clone()),
            None => DebugLoc::new(&self.file, &self.func.name, line, column),
        })
    }

    /// Append a raw operation
    pub fn push(&mut self, op: IrOp) {
        let loc = self.current_loc();
        if let Some(block) = self.func.block_mut(self.current) {
            block.instructions.push(IrInstruction::with_loc(op, loc));
        }
    }

    fn fresh(&mut self) -> IrReg {
        self.func.new_reg()
    }

    /// Stack allocation of `size` bytes
    pub fn alloca(&mut self, size: u64) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Alloca { dst, size });
        dst
    }

    /// Load `size` bytes
    pub fn load(&mut self, ptr: impl Into<Operand>, size: u32) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Load {
            dst,
            ptr: ptr.into(),
            size,
        });
        dst
    }

    /// Store `size` bytes
    pub fn store(&mut self, ptr: impl Into<Operand>, value: impl Into<Operand>, size: u32) {
        self.push(IrOp::Store {
            ptr: ptr.into(),
            value: value.into(),
            size,
        });
    }

    /// `base + offset` bytes
    pub fn gep(&mut self, base: impl Into<Operand>, offset: impl Into<Operand>) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Gep {
            dst,
            base: base.into(),
            offset: offset.into(),
        });
        dst
    }

    /// Integer arithmetic
    pub fn bin(&mut self, op: BinOp, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Bin {
            dst,
            op,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
        dst
    }

    /// `lhs + rhs`
    pub fn add(&mut self, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> IrReg {
        self.bin(BinOp::Add, lhs, rhs)
    }

    /// `lhs * rhs`
    pub fn mul(&mut self, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> IrReg {
        self.bin(BinOp::Mul, lhs, rhs)
    }

    /// Integer comparison
    pub fn cmp(&mut self, pred: CmpPred, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Cmp {
            dst,
            pred,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
        dst
    }

    /// `cond ? if_true : if_false`
    pub fn select(
        &mut self,
        cond: impl Into<Operand>,
        if_true: impl Into<Operand>,
        if_false: impl Into<Operand>,
    ) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Select {
            dst,
            cond: cond.into(),
            if_true: if_true.into(),
            if_false: if_false.into(),
        });
        dst
    }

    /// Copy a value
    pub fn copy(&mut self, src: impl Into<Operand>) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Copy {
            dst,
            src: src.into(),
        });
        dst
    }

    /// Empty phi; fill it with [`add_incoming`](Self::add_incoming)
    pub fn phi(&mut self) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Phi {
            dst,
            incoming: Vec::new(),
        });
        dst
    }

    /// Add an incoming edge to the phi defining `phi`
    pub fn add_incoming(&mut self, phi: IrReg, from: BlockId, value: impl Into<Operand>) {
        let value = value.into();
        for block in &mut self.func.blocks {
            for inst in &mut block.instructions {
                if let IrOp::Phi { dst, incoming } = &mut inst.op {
                    if *dst == phi {
                        incoming.push((from, value));
                        return;
                    }
                }
            }
        }
    }

    /// Direct call with a result
    pub fn call(&mut self, callee: FuncId, args: Vec<Operand>) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Call {
            dst: Some(dst),
            callee: Callee::Direct(callee),
            args,
        });
        dst
    }

    /// Direct call without a result
    pub fn call_void(&mut self, callee: FuncId, args: Vec<Operand>) {
        self.push(IrOp::Call {
            dst: None,
            callee: Callee::Direct(callee),
            args,
        });
    }

    /// Call through a function pointer
    pub fn call_indirect(&mut self, target: impl Into<Operand>, args: Vec<Operand>) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Call {
            dst: Some(dst),
            callee: Callee::Indirect(target.into()),
            args,
        });
        dst
    }

    /// Intrinsic returning a value
    pub fn intrinsic(&mut self, intrinsic: Intrinsic) -> IrReg {
        let dst = self.fresh();
        self.push(IrOp::Intrinsic {
            dst: Some(dst),
            intrinsic,
            args: Vec::new(),
        });
        dst
    }

    /// Index of the executing thread
    pub fn thread_id(&mut self) -> IrReg {
        self.intrinsic(Intrinsic::ThreadId)
    }

    /// Mark a stack object live
    pub fn lifetime_start(&mut self, size: u64, ptr: IrReg) {
        self.push(IrOp::Intrinsic {
            dst: None,
            intrinsic: Intrinsic::LifetimeStart,
            args: vec![Operand::Const(size as i64), Operand::Reg(ptr)],
        });
    }

    /// Mark a stack object dead
    pub fn lifetime_end(&mut self, size: u64, ptr: IrReg) {
        self.push(IrOp::Intrinsic {
            dst: None,
            intrinsic: Intrinsic::LifetimeEnd,
            args: vec![Operand::Const(size as i64), Operand::Reg(ptr)],
        });
    }

    /// Call a sanitizer runtime entry point; returns its results
    pub fn runtime(&mut self, entry: RuntimeEntry, args: Vec<Operand>) -> Vec<IrReg> {
        let dsts: Vec<IrReg> = (0..entry.result_count()).map(|_| self.fresh()).collect();
        self.push(IrOp::Runtime {
            dsts: dsts.clone(),
            entry,
            args,
        });
        dsts
    }

    /// Unconditional branch
    pub fn jump(&mut self, target: BlockId) {
        self.push(IrOp::Jump(target));
    }

    /// Conditional branch
    pub fn branch(&mut self, cond: impl Into<Operand>, then_block: BlockId, else_block: BlockId) {
        self.push(IrOp::Branch {
            cond: cond.into(),
            then_block,
            else_block,
        });
    }

    /// Return
    pub fn ret(&mut self, value: Option<Operand>) {
        self.push(IrOp::Return(value));
    }

    /// Function under construction
    pub fn function(&self) -> &Function {
        &self.func
    }

    /// Finish building
    pub fn finish(self) -> Function {
        self.func
    }
}
