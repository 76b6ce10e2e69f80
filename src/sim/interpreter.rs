//! IR interpreter
//!
//! Executes one device thread at a time. Runtime calls go straight to the
//! thread's [`ThreadContext`]; a violation unwinds the whole thread as
//! [`Error::Trap`].

use super::memory::DeviceMemory;
use super::ExternFn;
use crate::compiler::ir::{
    BlockId, Callee, FuncId, Function, Intrinsic, IrOp, IrReg, Module, Operand, RuntimeEntry,
};
use crate::error::{Error, Result};
use crate::runtime::{AccessSite, AllocationInfo, CheckBatch, ThreadContext};
use std::collections::HashMap;

/// Address given to `Operand::Func(f)`: `FUNCTION_BASE + 16 * f`
pub const FUNCTION_BASE: u64 = 0x0000_0f00_0000_0000;
/// Nested calls allowed before the thread is aborted
pub const MAX_CALL_DEPTH: u32 = 256;

/// Read-only state shared by every thread of a launch
pub(crate) struct Program<'a> {
    pub module: &'a Module,
    pub globals: &'a [u64],
    pub externs: &'a HashMap<String, ExternFn>,
    pub system_args: u64,
    pub step_limit: u64,
}

/// Execution of one thread
pub(crate) struct Interpreter<'a, 'm> {
    program: &'a Program<'a>,
    memory: &'m mut DeviceMemory,
    steps: u64,
    depth: u32,
}

struct Frame {
    regs: HashMap<IrReg, u64>,
}

impl Frame {
    fn get(&self, reg: IrReg, func: &Function) -> Result<u64> {
        self.regs.get(&reg).copied().ok_or_else(|| {
            Error::simulation(format!("{}: read of undefined register {}", func.name, reg))
        })
    }
}

impl<'a, 'm> Interpreter<'a, 'm> {
    pub fn new(program: &'a Program<'a>, memory: &'m mut DeviceMemory) -> Self {
        Self {
            program,
            memory,
            steps: 0,
            depth: 0,
        }
    }

    /// Instructions executed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Run `id` to completion on `ctx`'s thread
    pub fn call(
        &mut self,
        ctx: &mut ThreadContext<'_>,
        id: FuncId,
        args: &[u64],
    ) -> Result<Option<u64>> {
        let module = self.program.module;
        let func = module.function(id).ok_or_else(|| Error::UnknownFunction {
            name: format!("#{}", id.0),
        })?;
        if func.is_declaration() {
            return self.call_extern(func, args);
        }
        if func.params.len() != args.len() {
            return Err(Error::simulation(format!(
                "{} takes {} arguments, {} given",
                func.name,
                func.params.len(),
                args.len()
            )));
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Error::simulation(format!(
                "call depth limit of {} reached in {}",
                MAX_CALL_DEPTH, func.name
            )));
        }

        self.depth += 1;
        let thread = ctx.thread_id();
        let stack_top = self.memory.stack_top(thread);
        let result = self.execute(ctx, func, args);
        self.memory.stack_release(thread, stack_top);
        self.depth -= 1;
        result
    }

    fn call_extern(&mut self, func: &Function, args: &[u64]) -> Result<Option<u64>> {
        let handler = self
            .program
            .externs
            .get(&func.name)
            .ok_or_else(|| Error::UnknownFunction {
                name: func.name.clone(),
            })?;
        handler(&mut *self.memory, args)
    }

    fn execute(
        &mut self,
        ctx: &mut ThreadContext<'_>,
        func: &Function,
        args: &[u64],
    ) -> Result<Option<u64>> {
        let mut frame = Frame {
            regs: func
                .params
                .iter()
                .zip(args)
                .map(|(param, value)| (param.reg, *value))
                .collect(),
        };
        let mut block_id = func.entry();
        let mut previous: Option<BlockId> = None;

        loop {
            let block = func.block(block_id).ok_or_else(|| Error::UnknownBlock {
                function: func.name.clone(),
                block: block_id.0,
            })?;

            // Phis read their inputs before any of them is written.
            let mut phis = Vec::new();
            for inst in &block.instructions {
                let IrOp::Phi { dst, incoming } = &inst.op else {
                    break;
                };
                let from = previous.ok_or_else(|| {
                    Error::simulation(format!("{}: phi in entry block", func.name))
                })?;
                let value = incoming
                    .iter()
                    .find(|(pred, _)| *pred == from)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| {
                        Error::simulation(format!(
                            "{}: phi in {} has no edge from {}",
                            func.name, block_id, from
                        ))
                    })?;
                phis.push((*dst, self.value(&frame, func, value)?));
            }
            let first = phis.len();
            frame.regs.extend(phis);

            let mut next = None;
            for inst in &block.instructions[first..] {
                self.steps += 1;
                if self.steps > self.program.step_limit {
                    return Err(Error::simulation(format!(
                        "step limit of {} exceeded in {}",
                        self.program.step_limit, func.name
                    )));
                }
                match &inst.op {
                    IrOp::Jump(target) => {
                        next = Some(*target);
                        break;
                    }
                    IrOp::Branch {
                        cond,
                        then_block,
                        else_block,
                    } => {
                        let taken = self.value(&frame, func, *cond)? != 0;
                        next = Some(if taken { *then_block } else { *else_block });
                        break;
                    }
                    IrOp::Return(value) => {
                        return match value {
                            Some(v) => Ok(Some(self.value(&frame, func, *v)?)),
                            None => Ok(None),
                        };
                    }
                    op => self.step(ctx, &mut frame, func, op)?,
                }
            }
            match next {
                Some(target) => {
                    previous = Some(block_id);
                    block_id = target;
                }
                None => {
                    return Err(Error::malformed(
                        func.name.clone(),
                        format!("{} falls off its end", block_id),
                    ))
                }
            }
        }
    }

    fn value(&self, frame: &Frame, func: &Function, op: Operand) -> Result<u64> {
        match op {
            Operand::Reg(reg) => frame.get(reg, func),
            Operand::Const(value) => Ok(value as u64),
            Operand::Global(g) => self.program.globals.get(g.index()).copied().ok_or_else(|| {
                Error::simulation(format!("{}: unknown global #{}", func.name, g.0))
            }),
            Operand::Func(f) => Ok(FUNCTION_BASE + 16 * u64::from(f.0)),
        }
    }

    fn values(&self, frame: &Frame, func: &Function, ops: &[Operand]) -> Result<Vec<u64>> {
        ops.iter().map(|op| self.value(frame, func, *op)).collect()
    }

    fn step(
        &mut self,
        ctx: &mut ThreadContext<'_>,
        frame: &mut Frame,
        func: &Function,
        op: &IrOp,
    ) -> Result<()> {
        match op {
            IrOp::Alloca { dst, size } => {
                let address = self.memory.stack_alloc(ctx.thread_id(), *size)?;
                frame.regs.insert(*dst, address);
            }
            IrOp::Load { dst, ptr, size } => {
                let address = self.value(frame, func, *ptr)?;
                let value = self.memory.read(address, *size)?;
                frame.regs.insert(*dst, value);
            }
            IrOp::Store { ptr, value, size } => {
                let address = self.value(frame, func, *ptr)?;
                let value = self.value(frame, func, *value)?;
                self.memory.write(address, *size, value)?;
            }
            IrOp::Gep { dst, base, offset } => {
                let base = self.value(frame, func, *base)?;
                let offset = self.value(frame, func, *offset)?;
                frame.regs.insert(*dst, base.wrapping_add(offset));
            }
            IrOp::Bin { dst, op, lhs, rhs } => {
                let lhs = self.value(frame, func, *lhs)? as i64;
                let rhs = self.value(frame, func, *rhs)? as i64;
                let result = op.eval(lhs, rhs).ok_or_else(|| {
                    Error::simulation(format!("{}: {:?} by zero", func.name, op))
                })?;
                frame.regs.insert(*dst, result as u64);
            }
            IrOp::Cmp {
                dst,
                pred,
                lhs,
                rhs,
            } => {
                let lhs = self.value(frame, func, *lhs)? as i64;
                let rhs = self.value(frame, func, *rhs)? as i64;
                frame.regs.insert(*dst, u64::from(pred.eval(lhs, rhs)));
            }
            IrOp::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => {
                let pick = if self.value(frame, func, *cond)? != 0 {
                    if_true
                } else {
                    if_false
                };
                let value = self.value(frame, func, *pick)?;
                frame.regs.insert(*dst, value);
            }
            IrOp::Copy { dst, src } => {
                let value = self.value(frame, func, *src)?;
                frame.regs.insert(*dst, value);
            }
            IrOp::Call { dst, callee, args } => {
                let target = match callee {
                    Callee::Direct(id) => *id,
                    Callee::Indirect(op) => {
                        let address = self.value(frame, func, *op)?;
                        let offset = address.wrapping_sub(FUNCTION_BASE);
                        if offset % 16 != 0 || offset / 16 >= u64::from(u32::MAX) {
                            return Err(Error::Fault { address, size: 0 });
                        }
                        FuncId((offset / 16) as u32)
                    }
                };
                let args = self.values(frame, func, args)?;
                let result = self.call(ctx, target, &args)?;
                if let Some(dst) = dst {
                    frame.regs.insert(*dst, result.unwrap_or(0));
                }
            }
            IrOp::Intrinsic { dst, intrinsic, .. } => {
                let value = match intrinsic {
                    Intrinsic::ThreadId => u64::from(ctx.thread_id()),
                    Intrinsic::ImplicitArgPtr | Intrinsic::DispatchPtr => self.program.system_args,
                    Intrinsic::LifetimeStart | Intrinsic::LifetimeEnd => 0,
                };
                if let Some(dst) = dst {
                    frame.regs.insert(*dst, value);
                }
            }
            IrOp::Runtime { dsts, entry, args } => {
                let args = self.values(frame, func, args)?;
                let results = runtime_call(ctx, *entry, &args)?;
                for (dst, value) in dsts.iter().zip(results) {
                    frame.regs.insert(*dst, value);
                }
            }
            IrOp::Phi { .. } => {
                return Err(Error::malformed(
                    func.name.clone(),
                    "phi after a non-phi instruction",
                ))
            }
            IrOp::Jump(_) | IrOp::Branch { .. } | IrOp::Return(_) => {}
        }
        Ok(())
    }
}

/// Execute one runtime entry point with already evaluated arguments
pub fn runtime_call(
    ctx: &mut ThreadContext<'_>,
    entry: RuntimeEntry,
    args: &[u64],
) -> Result<Vec<u64>> {
    if args.len() != entry.arg_count() {
        return Err(Error::simulation(format!(
            "{} takes {} arguments, {} given",
            entry.symbol(),
            entry.arg_count(),
            args.len()
        )));
    }
    let signed = |i: usize| args[i] as i64;
    let access = |i: usize| AccessSite::access(signed(i), signed(i + 1), args[i + 2]);
    let info = |i: usize| AllocationInfo {
        start: args[i],
        length: args[i + 1],
        tag: args[i + 2] as u32,
    };

    let results = match entry {
        RuntimeEntry::New(kind) => vec![ctx.allocate(
            kind,
            args[0],
            args[1],
            args[2] as u32,
            AccessSite::at(signed(3), args[4]),
        )?],
        RuntimeEntry::Free(kind) => {
            ctx.free(kind, args[0], AccessSite::at(signed(1), args[2]))?;
            vec![]
        }
        RuntimeEntry::FreeN => {
            ctx.free_n(args[0] as u32)?;
            vec![]
        }
        RuntimeEntry::Check { kind, void: false } => {
            vec![ctx.check(kind, args[0], args[1], access(2))?]
        }
        RuntimeEntry::Check { kind, void: true } => {
            ctx.check_void(kind, args[0], args[1], access(2))?;
            vec![]
        }
        RuntimeEntry::CheckWithBase { kind, void: false } => {
            vec![ctx.check_with_base(kind, args[0], info(1), args[4], access(5))?]
        }
        RuntimeEntry::CheckWithBase { kind, void: true } => {
            ctx.check_with_base_void(kind, args[0], info(1), args[4], access(5))?;
            vec![]
        }
        RuntimeEntry::CheckRange(kind) => {
            ctx.check_range(kind, args[0], args[1], args[2], access(3))?;
            vec![]
        }
        RuntimeEntry::CheckRangeWithBase(kind) => {
            ctx.check_range_with_base(kind, args[0], args[1], info(2), args[5], access(6))?;
            vec![]
        }
        RuntimeEntry::CheckVec { kind, count } => {
            let lanes: Vec<&[u64]> = args[1..].chunks(4).take(count as usize).collect();
            let ptrs: Vec<u64> = lanes.iter().map(|l| l[0]).collect();
            let sizes: Vec<u64> = lanes.iter().map(|l| l[1]).collect();
            let access_ids: Vec<i64> = lanes.iter().map(|l| l[2] as i64).collect();
            let source_ids: Vec<i64> = lanes.iter().map(|l| l[3] as i64).collect();
            let batch = CheckBatch {
                ptrs: &ptrs,
                sizes: &sizes,
                access_ids: &access_ids,
                source_ids: &source_ids,
                pc: args[0],
            };
            ctx.check_vec(kind, &batch)?
        }
        RuntimeEntry::CheckWithBaseVec { kind, count } => {
            let lanes: Vec<&[u64]> = args[1..].chunks(7).take(count as usize).collect();
            let ptrs: Vec<u64> = lanes.iter().map(|l| l[0]).collect();
            let bases: Vec<AllocationInfo> = lanes
                .iter()
                .map(|l| AllocationInfo {
                    start: l[1],
                    length: l[2],
                    tag: l[3] as u32,
                })
                .collect();
            let sizes: Vec<u64> = lanes.iter().map(|l| l[4]).collect();
            let access_ids: Vec<i64> = lanes.iter().map(|l| l[5] as i64).collect();
            let source_ids: Vec<i64> = lanes.iter().map(|l| l[6] as i64).collect();
            let batch = CheckBatch {
                ptrs: &ptrs,
                sizes: &sizes,
                access_ids: &access_ids,
                source_ids: &source_ids,
                pc: args[0],
            };
            ctx.check_with_base_vec(kind, &batch, &bases)?
        }
        RuntimeEntry::Gep(_) => vec![ctx.gep(args[0], signed(1), signed(2))?],
        RuntimeEntry::Unpack(kind) => vec![ctx.unpack(kind, args[0], signed(1))?],
        RuntimeEntry::LifetimeStart => {
            ctx.lifetime_start(args[0], args[1], AccessSite::at(signed(2), args[3]))?;
            vec![]
        }
        RuntimeEntry::LifetimeEnd => {
            ctx.lifetime_end(args[0], args[1], AccessSite::at(signed(2), args[3]))?;
            vec![]
        }
        RuntimeEntry::AllocationInfo(kind) => {
            let info = ctx.allocation_info(kind, args[0])?;
            vec![info.start, info.length, u64::from(info.tag)]
        }
        RuntimeEntry::LeakCheck => {
            ctx.leak_check()?;
            vec![]
        }
        RuntimeEntry::PushCallSite { index, bits } => vec![ctx.push_call_site(index, bits)?],
        RuntimeEntry::RestoreCallSite => {
            ctx.restore_call_site(args[0])?;
            vec![]
        }
        RuntimeEntry::ResetCallSite => {
            ctx.reset_call_site()?;
            vec![]
        }
    };
    Ok(results)
}
