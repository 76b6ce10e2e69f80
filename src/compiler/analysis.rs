//! Host-compiler services consumed by the instrumentation pass
//!
//! The pass never inspects control flow or data flow itself; it asks a
//! [`HostAnalysis`] for underlying objects, dominance, loops and affine
//! address recurrences. [`IrAnalysis`] answers those questions for the crate's
//! own IR:
//!
//! - dominators by the Cooper-Harvey-Kennedy iterative algorithm over
//!   reverse postorder
//! - natural loops from back edges, with preheader and exiting blocks
//! - a small scalar-evolution: integer induction phis with an invariant step
//!   and add/sub/mul/shl on top of them, pointer induction phis, `Gep` chains,
//!   and backedge-taken counts of bottom-tested counted loops

use super::affine::{AddRec, SymExpr};
use super::ir::{
    BinOp, BlockId, Callee, CmpPred, FuncId, Function, GlobalId, Intrinsic, IrOp, IrReg, Operand,
    RuntimeEntry,
};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Recursion limit of the expression walks
const MAX_DEPTH: u32 = 32;

/// Object a pointer may have been derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnderlyingObject {
    /// Stack allocation defining the register
    Alloca(IrReg),
    /// Module global
    Global(GlobalId),
    /// Function parameter, by position
    Argument(usize),
    /// Result of an intrinsic
    Intrinsic(Intrinsic),
    /// Result of a call (callee known for direct calls)
    CallResult {
        /// Register holding the result
        reg: IrReg,
        /// Direct callee
        callee: Option<FuncId>,
    },
    /// Result of a sanitizer runtime entry point
    Runtime {
        /// Register holding the result
        reg: IrReg,
        /// Entry point that produced it
        entry: RuntimeEntry,
    },
    /// Pointer loaded from memory
    Loaded(IrReg),
    /// Integer constant used as an address
    Constant(i64),
    /// Function address
    Function(FuncId),
    /// Value the walk cannot see through
    Opaque(IrReg),
}

/// Natural loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopInfo {
    /// Single entry block
    pub header: BlockId,
    /// Blocks with a back edge to the header
    pub latches: Vec<BlockId>,
    /// Every block of the loop, nested loops included
    pub blocks: BTreeSet<BlockId>,
    /// Unique outside predecessor of the header that only branches to it
    pub preheader: Option<BlockId>,
    /// Blocks with a successor outside the loop
    pub exiting: Vec<BlockId>,
    /// Nesting depth, 1 for outermost loops
    pub depth: u32,
}

impl LoopInfo {
    /// Whether `block` belongs to the loop
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }

    /// The latch, if there is exactly one
    pub fn latch(&self) -> Option<BlockId> {
        match self.latches.as_slice() {
            [latch] => Some(*latch),
            _ => None,
        }
    }

    /// Whether the loop only exits from its single latch
    pub fn is_bottom_tested(&self) -> bool {
        match self.latch() {
            Some(latch) => self.exiting == [latch],
            None => false,
        }
    }
}

/// Address `base + offset(k)` of an access in iteration `k`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffineAccess {
    /// Loop-invariant pointer
    pub base: Operand,
    /// Byte offset recurrence
    pub offset: AddRec,
}

/// Analyses the instrumentation pass needs from its host compiler
pub trait HostAnalysis {
    /// Objects `ptr` may point into
    fn underlying_objects(&self, ptr: Operand) -> Vec<UnderlyingObject>;

    /// Whether every path from the entry to `b` goes through `a`
    fn dominates(&self, a: BlockId, b: BlockId) -> bool;

    /// Whether `op` holds its value before instruction `index` of `block`
    fn is_available(&self, op: Operand, block: BlockId, index: usize) -> bool;

    /// Innermost loop containing `block`
    fn loop_for(&self, block: BlockId) -> Option<&LoopInfo>;

    /// Number of times the back edge of `lp` is taken per entry into the loop
    fn backedge_taken_count(&self, lp: &LoopInfo) -> Option<SymExpr>;

    /// Affine description of `ptr` over the iterations of `lp`
    fn affine_access(&self, lp: &LoopInfo, ptr: Operand) -> Option<AffineAccess>;
}

/// Reference [`HostAnalysis`] over one IR function
#[derive(Debug)]
pub struct IrAnalysis<'a> {
    func: &'a Function,
    defs: HashMap<IrReg, (BlockId, usize)>,
    preds: Vec<Vec<BlockId>>,
    idom: Vec<Option<BlockId>>,
    loops: Vec<LoopInfo>,
    innermost: HashMap<BlockId, usize>,
}

impl<'a> IrAnalysis<'a> {
    /// Analyse a function definition
    pub fn new(func: &'a Function) -> Self {
        let preds = func.predecessors();
        let rpo = reverse_postorder(func);
        let idom = dominator_tree(func.blocks.len(), &rpo, &preds);
        let mut analysis = Self {
            func,
            defs: func.definitions(),
            preds,
            idom,
            loops: Vec::new(),
            innermost: HashMap::new(),
        };
        analysis.find_loops(&rpo);
        analysis
    }

    /// Function being analysed
    pub fn function(&self) -> &Function {
        self.func
    }

    /// Immediate dominator; the entry is its own
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(block.index()).copied().flatten()
    }

    /// Whether the block can be reached from the entry
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.idom(block).is_some()
    }

    /// Predecessors of a block
    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        self.preds.get(block.index()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All natural loops, outermost first
    pub fn loops(&self) -> &[LoopInfo] {
        &self.loops
    }

    /// Where a register is defined
    pub fn definition(&self, reg: IrReg) -> Option<(BlockId, usize)> {
        self.defs.get(&reg).copied()
    }

    fn defining_op(&self, reg: IrReg) -> Option<(BlockId, &'a IrOp)> {
        let (block, index) = self.definition(reg)?;
        let func: &'a Function = self.func;
        let inst = func.blocks.get(block.index())?.instructions.get(index)?;
        Some((block, &inst.op))
    }

    /// Whether `op` has the same value in every iteration of `lp`
    pub fn is_invariant(&self, lp: &LoopInfo, op: Operand) -> bool {
        match op {
            Operand::Reg(reg) => match self.definition(reg) {
                Some((block, _)) => !lp.contains(block),
                None => true,
            },
            _ => true,
        }
    }

    fn find_loops(&mut self, rpo: &[BlockId]) {
        let mut latches: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        let mut headers = Vec::new();
        for &block in rpo {
            for succ in self.func.blocks[block.index()].successors() {
                if self.dominates(succ, block) {
                    let entry = latches.entry(succ).or_default();
                    if entry.is_empty() {
                        headers.push(succ);
                    }
                    entry.push(block);
                }
            }
        }

        for header in headers {
            let latch_list = latches.remove(&header).unwrap_or_default();
            let mut blocks = BTreeSet::from([header]);
            let mut work = latch_list.clone();
            while let Some(block) = work.pop() {
                if blocks.insert(block) {
                    work.extend(
                        self.predecessors(block)
                            .iter()
                            .copied()
                            .filter(|p| self.is_reachable(*p)),
                    );
                }
            }

            let outside: Vec<BlockId> = self
                .predecessors(header)
                .iter()
                .copied()
                .filter(|p| !blocks.contains(p))
                .collect();
            let preheader = match outside.as_slice() {
                [single] if self.func.blocks[single.index()].successors() == [header] => {
                    Some(*single)
                }
                _ => None,
            };
            let exiting = blocks
                .iter()
                .copied()
                .filter(|b| {
                    self.func.blocks[b.index()]
                        .successors()
                        .iter()
                        .any(|s| !blocks.contains(s))
                })
                .collect();

            self.loops.push(LoopInfo {
                header,
                latches: latch_list,
                blocks,
                preheader,
                exiting,
                depth: 1,
            });
        }

        let headers: Vec<BlockId> = self.loops.iter().map(|l| l.header).collect();
        for (idx, header) in headers.iter().enumerate() {
            let depth = self.loops.iter().filter(|l| l.contains(*header)).count() as u32;
            self.loops[idx].depth = depth;
        }
        self.loops.sort_by_key(|l| l.depth);

        for block in &self.func.blocks {
            let best = self
                .loops
                .iter()
                .enumerate()
                .filter(|(_, l)| l.contains(block.id))
                .min_by_key(|(_, l)| l.blocks.len())
                .map(|(idx, _)| idx);
            if let Some(idx) = best {
                self.innermost.insert(block.id, idx);
            }
        }
    }

    /// Integer recurrence of `op` over the iterations of `lp`
    pub fn scev(&self, lp: &LoopInfo, op: Operand) -> Option<AddRec> {
        self.scev_at(lp, op, 0)
    }

    fn scev_at(&self, lp: &LoopInfo, op: Operand, depth: u32) -> Option<AddRec> {
        if depth > MAX_DEPTH {
            return None;
        }
        if self.is_invariant(lp, op) {
            return Some(AddRec::invariant(SymExpr::value(op)));
        }
        let reg = op.reg()?;
        let (block, def) = self.defining_op(reg)?;
        match def {
            IrOp::Copy { src, .. } => self.scev_at(lp, *src, depth + 1),
            IrOp::Bin { op, lhs, rhs, .. } => {
                let l = self.scev_at(lp, *lhs, depth + 1)?;
                let r = self.scev_at(lp, *rhs, depth + 1)?;
                match op {
                    BinOp::Add => Some(l.add(&r)),
                    BinOp::Sub => Some(l.add(&r.scale(SymExpr::Const(-1)))),
                    BinOp::Mul if r.is_invariant() => Some(l.scale(r.start)),
                    BinOp::Mul if l.is_invariant() => Some(r.scale(l.start)),
                    BinOp::Shl => match r.start.as_const() {
                        Some(shift) if r.is_invariant() && (0..63).contains(&shift) => {
                            Some(l.scale(SymExpr::Const(1i64 << shift)))
                        }
                        _ => None,
                    },
                    _ => None,
                }
            }
            IrOp::Phi { incoming, .. } if block == lp.header => {
                let (init, next) = self.split_header_phi(lp, incoming)?;
                let step = self.induction_step(lp, reg, next, depth)?;
                Some(AddRec {
                    start: SymExpr::value(init),
                    step,
                })
            }
            _ => None,
        }
    }

    fn split_header_phi(
        &self,
        lp: &LoopInfo,
        incoming: &[(BlockId, Operand)],
    ) -> Option<(Operand, Operand)> {
        let latch = lp.latch()?;
        let preheader = lp.preheader?;
        match incoming {
            [(a, x), (b, y)] if *a == preheader && *b == latch => Some((*x, *y)),
            [(a, x), (b, y)] if *a == latch && *b == preheader => Some((*y, *x)),
            _ => None,
        }
    }

    /// Invariant step of `phi` if `next` is `phi + step`, `phi - step` or `gep phi, step`
    fn induction_step(
        &self,
        lp: &LoopInfo,
        phi: IrReg,
        next: Operand,
        depth: u32,
    ) -> Option<SymExpr> {
        let (_, def) = self.defining_op(next.reg()?)?;
        let this = Operand::Reg(phi);
        let invariant_step = |op: Operand| -> Option<SymExpr> {
            let rec = self.scev_at(lp, op, depth + 1)?;
            rec.is_invariant().then_some(rec.start)
        };
        match def {
            IrOp::Bin {
                op: BinOp::Add,
                lhs,
                rhs,
                ..
            } if *lhs == this => invariant_step(*rhs),
            IrOp::Bin {
                op: BinOp::Add,
                lhs,
                rhs,
                ..
            } if *rhs == this => invariant_step(*lhs),
            IrOp::Bin {
                op: BinOp::Sub,
                lhs,
                rhs,
                ..
            } if *lhs == this => invariant_step(*rhs).map(SymExpr::neg),
            IrOp::Gep { base, offset, .. } if *base == this => invariant_step(*offset),
            _ => None,
        }
    }

    fn pointer_scev(&self, lp: &LoopInfo, op: Operand, depth: u32) -> Option<AffineAccess> {
        if depth > MAX_DEPTH {
            return None;
        }
        if self.is_invariant(lp, op) {
            return Some(AffineAccess {
                base: op,
                offset: AddRec::invariant(SymExpr::Const(0)),
            });
        }
        let reg = op.reg()?;
        let (block, def) = self.defining_op(reg)?;
        match def {
            IrOp::Gep { base, offset, .. } => {
                let inner = self.pointer_scev(lp, *base, depth + 1)?;
                let delta = self.scev_at(lp, *offset, depth + 1)?;
                Some(AffineAccess {
                    base: inner.base,
                    offset: inner.offset.add(&delta),
                })
            }
            IrOp::Copy { src, .. } => self.pointer_scev(lp, *src, depth + 1),
            IrOp::Phi { incoming, .. } if block == lp.header => {
                let (init, next) = self.split_header_phi(lp, incoming)?;
                let step = self.induction_step(lp, reg, next, depth)?;
                Some(AffineAccess {
                    base: init,
                    offset: AddRec {
                        start: SymExpr::Const(0),
                        step,
                    },
                })
            }
            _ => None,
        }
    }
}

impl HostAnalysis for IrAnalysis<'_> {
    fn underlying_objects(&self, ptr: Operand) -> Vec<UnderlyingObject> {
        let mut objects = Vec::new();
        let mut seen = HashSet::new();
        let mut work = vec![ptr];
        while let Some(op) = work.pop() {
            let object = match op {
                Operand::Const(c) => UnderlyingObject::Constant(c),
                Operand::Global(g) => UnderlyingObject::Global(g),
                Operand::Func(f) => UnderlyingObject::Function(f),
                Operand::Reg(reg) => {
                    if !seen.insert(reg) {
                        continue;
                    }
                    if let Some(idx) = self.func.param_index(reg) {
                        UnderlyingObject::Argument(idx)
                    } else {
                        match self.defining_op(reg).map(|(_, op)| op) {
                            Some(IrOp::Alloca { .. }) => UnderlyingObject::Alloca(reg),
                            Some(IrOp::Gep { base, .. }) => {
                                work.push(*base);
                                continue;
                            }
                            Some(IrOp::Copy { src, .. }) => {
                                work.push(*src);
                                continue;
                            }
                            Some(IrOp::Select {
                                if_true, if_false, ..
                            }) => {
                                work.push(*if_false);
                                work.push(*if_true);
                                continue;
                            }
                            Some(IrOp::Phi { incoming, .. }) => {
                                work.extend(incoming.iter().rev().map(|(_, v)| *v));
                                continue;
                            }
                            Some(IrOp::Load { .. }) => UnderlyingObject::Loaded(reg),
                            Some(IrOp::Call { callee, .. }) => UnderlyingObject::CallResult {
                                reg,
                                callee: match callee {
                                    Callee::Direct(f) => Some(*f),
                                    Callee::Indirect(_) => None,
                                },
                            },
                            Some(IrOp::Intrinsic { intrinsic, .. }) => {
                                UnderlyingObject::Intrinsic(*intrinsic)
                            }
                            Some(IrOp::Runtime {
                                entry: RuntimeEntry::Gep(_),
                                args,
                                ..
                            }) if !args.is_empty() => {
                                work.push(args[0]);
                                continue;
                            }
                            Some(IrOp::Runtime { entry, .. }) => {
                                UnderlyingObject::Runtime { reg, entry: *entry }
                            }
                            _ => UnderlyingObject::Opaque(reg),
                        }
                    }
                }
            };
            if !objects.contains(&object) {
                objects.push(object);
            }
        }
        objects
    }

    fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut current = b;
        while let Some(parent) = self.idom(current) {
            if parent == a {
                return true;
            }
            if parent == current {
                return false;
            }
            current = parent;
        }
        false
    }

    fn is_available(&self, op: Operand, block: BlockId, index: usize) -> bool {
        let reg = match op {
            Operand::Reg(reg) => reg,
            _ => return true,
        };
        if self.func.param_index(reg).is_some() {
            return true;
        }
        match self.definition(reg) {
            Some((def_block, def_index)) if def_block == block => def_index < index,
            Some((def_block, _)) => self.dominates(def_block, block),
            None => false,
        }
    }

    fn loop_for(&self, block: BlockId) -> Option<&LoopInfo> {
        self.innermost.get(&block).and_then(|idx| self.loops.get(*idx))
    }

    fn backedge_taken_count(&self, lp: &LoopInfo) -> Option<SymExpr> {
        if !lp.is_bottom_tested() {
            return None;
        }
        let latch = lp.latch()?;
        let (cond, then_block, else_block) = match self.func.block(latch)?.terminator()? {
            IrOp::Branch {
                cond,
                then_block,
                else_block,
            } => (*cond, *then_block, *else_block),
            _ => return None,
        };
        let stays_on_true = if then_block == lp.header && !lp.contains(else_block) {
            true
        } else if else_block == lp.header && !lp.contains(then_block) {
            false
        } else {
            return None;
        };

        let (pred, lhs, rhs) = match self.defining_op(cond.reg()?)? {
            (_, IrOp::Cmp { pred, lhs, rhs, .. }) => (*pred, *lhs, *rhs),
            _ => return None,
        };
        let pred = if stays_on_true { pred } else { pred.inverse() };
        let l = self.scev(lp, lhs)?;
        let r = self.scev(lp, rhs)?;
        let (iv, bound, pred) = match (l.is_invariant(), r.is_invariant()) {
            (false, true) => (l, r.start, pred),
            (true, false) => (r, l.start, pred.swapped()),
            _ => return None,
        };

        let step = iv.step.as_const()?;
        let first = iv.start;
        let one = || SymExpr::Const(1);
        let count = match pred {
            CmpPred::Slt if step > 0 => ceil_div(SymExpr::sub(bound, first), step),
            CmpPred::Sle if step > 0 => {
                ceil_div(SymExpr::sub(SymExpr::add(bound, one()), first), step)
            }
            CmpPred::Sgt if step < 0 => ceil_div(SymExpr::sub(first, bound), -step),
            CmpPred::Sge if step < 0 => {
                ceil_div(SymExpr::sub(SymExpr::add(first, one()), bound), -step)
            }
            // A `!=` exit that starts past its bound only stops after wrapping
            // around, so only constant, already ordered bounds get a count.
            CmpPred::Ne if step == 1 => {
                let (first, bound) = (first.as_const()?, bound.as_const()?);
                if first > bound {
                    return None;
                }
                SymExpr::Const(bound.checked_sub(first)?)
            }
            CmpPred::Ne if step == -1 => {
                let (first, bound) = (first.as_const()?, bound.as_const()?);
                if first < bound {
                    return None;
                }
                SymExpr::Const(first.checked_sub(bound)?)
            }
            _ => return None,
        };
        Some(count)
    }

    fn affine_access(&self, lp: &LoopInfo, ptr: Operand) -> Option<AffineAccess> {
        self.pointer_scev(lp, ptr, 0)
    }
}

/// `max(0, ceil(num / d))` for positive `d`
fn ceil_div(num: SymExpr, d: i64) -> SymExpr {
    SymExpr::smax(
        SymExpr::Const(0),
        SymExpr::sdiv(SymExpr::add(num, SymExpr::Const(d - 1)), d),
    )
}

fn reverse_postorder(func: &Function) -> Vec<BlockId> {
    let n = func.blocks.len();
    let mut post = Vec::with_capacity(n);
    if n == 0 {
        return post;
    }
    let mut visited = vec![false; n];
    let mut stack: Vec<(BlockId, usize)> = vec![(BlockId(0), 0)];
    visited[0] = true;
    while let Some(top) = stack.last_mut() {
        let (block, next) = *top;
        let succs = func.blocks[block.index()].successors();
        if let Some(&succ) = succs.get(next) {
            top.1 += 1;
            if succ.index() < n && !visited[succ.index()] {
                visited[succ.index()] = true;
                stack.push((succ, 0));
            }
        } else {
            post.push(block);
            stack.pop();
        }
    }
    post.reverse();
    post
}

fn dominator_tree(n: usize, rpo: &[BlockId], preds: &[Vec<BlockId>]) -> Vec<Option<BlockId>> {
    let mut order = vec![usize::MAX; n];
    for (idx, block) in rpo.iter().enumerate() {
        order[block.index()] = idx;
    }
    let mut idom: Vec<Option<BlockId>> = vec![None; n];
    if let Some(entry) = rpo.first() {
        idom[entry.index()] = Some(*entry);
    }

    let intersect = |idom: &[Option<BlockId>], mut a: BlockId, mut b: BlockId| -> BlockId {
        while a != b {
            while order[a.index()] > order[b.index()] {
                a = idom[a.index()].unwrap_or(b);
            }
            while order[b.index()] > order[a.index()] {
                b = idom[b.index()].unwrap_or(a);
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &block in rpo.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for &pred in &preds[block.index()] {
                if idom[pred.index()].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, pred, current),
                });
            }
            if new_idom.is_some() && idom[block.index()] != new_idom {
                idom[block.index()] = new_idom;
                changed = true;
            }
        }
    }
    idom
}
