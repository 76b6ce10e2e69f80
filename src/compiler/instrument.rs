//! The instrumentation pass
//!
//! Rewrites every sanitizable function of a module so that all memory it
//! touches goes through the runtime:
//!
//! - stack allocations are registered with `new_local` and retired with one
//!   `free_local_n` before each return
//! - address computations on tracked pointers become runtime `gep`s
//! - loads and stores are checked: hoisted out of loops as range checks,
//!   merged into vector checks, or checked one by one
//! - pointers handed to external declarations are unpacked
//! - ambiguous calls save and restore the thread's call-site word
//! - user globals are registered by a module constructor and reached through
//!   shadow globals holding their tracked pointers
//!
//! Analyses run on a snapshot of each function taken before any rewriting;
//! new code is collected as insertions keyed by snapshot positions and
//! spliced in at the end.

use super::analysis::{HostAnalysis, IrAnalysis, UnderlyingObject};
use super::ir::{
    BlockId, Callee, CmpPred, FuncId, Function, FunctionBuilder, GlobalId, GlobalVar, Intrinsic,
    IrInstruction, IrOp, IrReg, Module, Operand, RuntimeEntry,
};
use super::locations::{CallGraph, CallSite, SourceMap};
use super::placement::{plan_block, AccessCandidate, CheckPlan};
use super::provenance::{Provenance, ProvenanceClassifier};
use super::{InstrumentOptions, InstrumentReport, InstrumentStats, UnknownPolicy};
use crate::error::{Error, Result};
use crate::location::UNKNOWN_SOURCE;
use crate::runtime::AllocationKind;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Prefix of every symbol owned by the sanitizer
pub const SANITIZER_PREFIX: &str = "__gpusan";
/// Prefix of the shadow global holding a user global's tracked pointer
pub const SHADOW_PREFIX: &str = "__gpusan.shadow.";
/// Module constructor registering user globals
pub const REGISTER_GLOBALS: &str = "__gpusan.register_globals";
/// Module destructor retiring user globals and reporting leaks
pub const UNREGISTER_GLOBALS: &str = "__gpusan.unregister_globals";

/// Program counter reported for instruction `index` of `block` in `func`
pub fn program_counter(func: FuncId, block: BlockId, index: usize) -> u64 {
    (u64::from(func.0) << 40) | (u64::from(block.0) << 20) | index as u64
}

/// Whether the pass rewrites `func`
pub fn is_instrumentable(func: &Function) -> bool {
    !func.is_declaration()
        && func.sanitize
        && !func.name.starts_with(SANITIZER_PREFIX)
        && !func
            .instructions()
            .any(|inst| matches!(inst.op, IrOp::Runtime { .. }))
}

/// Move each address computation up to just after its latest in-block dependency
///
/// Returns the number of moved instructions.
pub fn hoist_address_computations(func: &mut Function) -> usize {
    let mut moved = 0;
    for block in &mut func.blocks {
        let floor = block.first_non_phi();
        for i in floor..block.instructions.len() {
            if !matches!(block.instructions[i].op, IrOp::Gep { .. }) {
                continue;
            }
            let deps = block.instructions[i].op.operands();
            let target = block.instructions[..i]
                .iter()
                .enumerate()
                .filter(|(_, inst)| {
                    inst.op
                        .defs()
                        .iter()
                        .any(|d| deps.contains(&Operand::Reg(*d)))
                })
                .map(|(idx, _)| idx + 1)
                .max()
                .unwrap_or(floor)
                .max(floor);
            if target < i {
                let inst = block.instructions.remove(i);
                block.instructions.insert(target, inst);
                moved += 1;
            }
        }
    }
    moved
}

/// Insertions into one function, keyed by snapshot positions
#[derive(Debug, Default)]
struct Edits {
    entry: Vec<IrInstruction>,
    before: BTreeMap<(BlockId, usize), Vec<IrInstruction>>,
    after: BTreeMap<(BlockId, usize), Vec<IrInstruction>>,
}

impl Edits {
    fn before(&mut self, block: BlockId, index: usize, inst: IrInstruction) {
        self.before.entry((block, index)).or_default().push(inst);
    }

    fn after(&mut self, block: BlockId, index: usize, inst: IrInstruction) {
        self.after.entry((block, index)).or_default().push(inst);
    }

    fn apply(mut self, func: &mut Function) {
        let entry = func.entry();
        for block in &mut func.blocks {
            let old = std::mem::take(&mut block.instructions);
            let mut new = Vec::with_capacity(old.len() * 2);
            if block.id == entry {
                new.append(&mut self.entry);
            }
            for (idx, inst) in old.into_iter().enumerate() {
                if let Some(list) = self.before.remove(&(block.id, idx)) {
                    new.extend(list);
                }
                new.push(inst);
                if let Some(list) = self.after.remove(&(block.id, idx)) {
                    new.extend(list);
                }
            }
            block.instructions = new;
        }
    }
}

/// Cached `allocation_info` results of one object
#[derive(Debug, Clone, Copy)]
struct CachedInfo {
    regs: [IrReg; 3],
    /// Definition the info follows; `None` for the entry block
    site: Option<(BlockId, usize)>,
}

impl CachedInfo {
    fn operands(&self) -> [Operand; 3] {
        self.regs.map(Operand::Reg)
    }
}

/// One load or store of the snapshot
#[derive(Debug, Clone, Copy)]
struct Access {
    block: BlockId,
    index: usize,
    ptr: Operand,
    size: u32,
    provenance: Provenance,
    access_id: i64,
    source_id: i64,
    pc: u64,
}

/// Module-wide state of one instrumentation run
#[derive(Debug)]
pub struct Instrumenter<'o> {
    options: &'o InstrumentOptions,
    stats: InstrumentStats,
    reads: i64,
    writes: i64,
    allocations: u32,
}

impl<'o> Instrumenter<'o> {
    /// Fresh run with the given options
    pub fn new(options: &'o InstrumentOptions) -> Self {
        Self {
            options,
            stats: InstrumentStats::default(),
            reads: 0,
            writes: 0,
            allocations: 0,
        }
    }

    /// Instrument `module` in place
    pub fn run(mut self, module: &mut Module) -> Result<InstrumentReport> {
        let targets: Vec<FuncId> = module
            .function_ids()
            .filter(|id| module.function(*id).map(is_instrumentable).unwrap_or(false))
            .collect();

        for id in &targets {
            if let Some(func) = module.function_mut(*id) {
                self.stats.moved_address_computations += hoist_address_computations(func);
            }
        }

        let graph = CallGraph::build(module);
        let mut sources = SourceMap::build(module, &graph, &targets);
        let mut classifier = ProvenanceClassifier::new(module, self.options.instrument_globals);
        let shadows = if self.options.instrument_globals {
            self.create_shadows(module)
        } else {
            BTreeMap::new()
        };

        for &id in &targets {
            let func = self.instrument_function(module, id, &mut classifier, &mut sources, &shadows)?;
            if let Some(slot) = module.function_mut(id) {
                *slot = func;
            }
        }

        if !shadows.is_empty() {
            self.emit_global_registration(module, &shadows);
        }

        self.stats.functions = targets.len();
        self.stats.ambiguous_calls = sources.ambiguous_count();
        let locations = sources.finish();
        tracing::info!(
            module = %module.name,
            functions = self.stats.functions,
            accesses = self.stats.accesses,
            hoisted = self.stats.hoisted_checks,
            merged = self.stats.merged_lanes,
            locations = locations.len(),
            "instrumented module"
        );
        Ok(InstrumentReport {
            locations,
            stats: self.stats,
        })
    }

    fn next_access_id(&mut self, is_write: bool) -> i64 {
        if is_write {
            self.writes += 1;
            self.writes
        } else {
            self.reads += 1;
            -self.reads
        }
    }

    fn next_allocation_id(&mut self) -> u32 {
        self.allocations += 1;
        self.allocations
    }

    fn create_shadows(&mut self, module: &mut Module) -> BTreeMap<GlobalId, GlobalId> {
        let users: Vec<(GlobalId, String)> = module
            .globals
            .iter()
            .enumerate()
            .filter(|(_, g)| !g.name.starts_with(SANITIZER_PREFIX) && g.size > 0)
            .map(|(idx, g)| (GlobalId(idx as u32), g.name.clone()))
            .collect();
        let mut shadows = BTreeMap::new();
        for (global, name) in users {
            let shadow = module.add_global(GlobalVar::zeroed(&format!("{}{}", SHADOW_PREFIX, name), 8));
            shadows.insert(global, shadow);
        }
        self.stats.tracked_globals = shadows.len();
        shadows
    }

    fn validate_allocas(&self, func: &Function, analysis: &IrAnalysis<'_>) -> Result<()> {
        let returns: Vec<BlockId> = func
            .blocks
            .iter()
            .filter(|b| analysis.is_reachable(b.id))
            .filter(|b| matches!(b.terminator(), Some(IrOp::Return(_))))
            .map(|b| b.id)
            .collect();
        for block in &func.blocks {
            if !analysis.is_reachable(block.id) {
                continue;
            }
            for inst in &block.instructions {
                if !matches!(inst.op, IrOp::Alloca { .. }) {
                    continue;
                }
                let reason = if analysis.loop_for(block.id).is_some() {
                    "allocation inside a loop"
                } else if !returns.iter().all(|r| analysis.dominates(block.id, *r)) {
                    "allocation does not dominate every return"
                } else {
                    continue;
                };
                return Err(Error::UnsupportedAlloca {
                    function: func.name.clone(),
                    block: block.id.0,
                    reason: reason.to_string(),
                });
            }
        }
        Ok(())
    }

    fn instrument_function(
        &mut self,
        module: &Module,
        id: FuncId,
        classifier: &mut ProvenanceClassifier,
        sources: &mut SourceMap,
        shadows: &BTreeMap<GlobalId, GlobalId>,
    ) -> Result<Function> {
        let orig = module.function(id).ok_or_else(|| Error::UnknownFunction {
            name: format!("#{}", id.0),
        })?;
        let analysis = IrAnalysis::new(orig);
        self.validate_allocas(orig, &analysis)?;

        let mut func = orig.clone();
        func.sync_registers();
        let mut edits = Edits::default();

        // Call-site word and shadow globals come first in the entry block.
        if orig.is_kernel && sources.ambiguous_count() > 0 {
            edits.entry.push(runtime(RuntimeEntry::ResetCallSite, vec![], vec![]));
        }
        let shadow_regs = self.load_shadows(orig, &mut func, &mut edits, shadows);

        let lifetime_tracked: HashSet<IrReg> = orig
            .instructions()
            .filter_map(|inst| match &inst.op {
                IrOp::Intrinsic {
                    intrinsic: Intrinsic::LifetimeStart | Intrinsic::LifetimeEnd,
                    args,
                    ..
                } => args.get(1).and_then(Operand::reg),
                _ => None,
            })
            .filter(|reg| {
                matches!(
                    analysis.definition(*reg).map(|(b, i)| &orig.blocks[b.index()].instructions[i].op),
                    Some(IrOp::Alloca { .. })
                )
            })
            .collect();
        let alloca_count = orig.alloca_count();
        let bits = sources.call_site_bits();

        let mut accesses = Vec::new();
        for block in &orig.blocks {
            for (index, inst) in block.instructions.iter().enumerate() {
                let source_id = sources.source_id(id, inst.loc.as_ref());
                let pc = program_counter(id, block.id, index);
                let loc = inst.loc.clone();
                match &inst.op {
                    IrOp::Alloca { dst, size } => {
                        let raw = func.new_reg();
                        func.blocks[block.id.index()].instructions[index].op = IrOp::Alloca {
                            dst: raw,
                            size: *size,
                        };
                        let length = if lifetime_tracked.contains(dst) { 0 } else { *size };
                        let allocation_id = self.next_allocation_id();
                        edits.after(
                            block.id,
                            index,
                            IrInstruction::with_loc(
                                IrOp::Runtime {
                                    dsts: vec![*dst],
                                    entry: RuntimeEntry::New(AllocationKind::Local),
                                    args: vec![
                                        Operand::Reg(raw),
                                        Operand::Const(length as i64),
                                        Operand::Const(i64::from(allocation_id)),
                                        Operand::Const(source_id),
                                        Operand::Const(pc as i64),
                                    ],
                                },
                                loc,
                            ),
                        );
                        self.stats.allocas += 1;
                    }
                    IrOp::Gep { dst, base, offset } => {
                        let kind = classifier.classify(id, &analysis, *base).kind;
                        if kind != AllocationKind::System {
                            func.blocks[block.id.index()].instructions[index].op = IrOp::Runtime {
                                dsts: vec![*dst],
                                entry: RuntimeEntry::Gep(kind),
                                args: vec![*base, *offset, Operand::Const(source_id)],
                            };
                            self.stats.geps += 1;
                        }
                    }
                    IrOp::Intrinsic {
                        intrinsic: intrinsic @ (Intrinsic::LifetimeStart | Intrinsic::LifetimeEnd),
                        args,
                        ..
                    } => {
                        if let (Some(size), Some(Operand::Reg(ptr))) = (args.first(), args.get(1)) {
                            if lifetime_tracked.contains(ptr) {
                                let entry = if *intrinsic == Intrinsic::LifetimeStart {
                                    RuntimeEntry::LifetimeStart
                                } else {
                                    RuntimeEntry::LifetimeEnd
                                };
                                func.blocks[block.id.index()].instructions[index].op =
                                    IrOp::Runtime {
                                        dsts: vec![],
                                        entry,
                                        args: vec![
                                            Operand::Reg(*ptr),
                                            *size,
                                            Operand::Const(source_id),
                                            Operand::Const(pc as i64),
                                        ],
                                    };
                            }
                        }
                    }
                    IrOp::Call { callee, args, .. } => {
                        self.instrument_call(
                            module, id, &analysis, classifier, &mut func, &mut edits, block.id,
                            index, callee, args, source_id,
                        );
                        let site = CallSite {
                            caller: id,
                            block: block.id,
                            index,
                        };
                        if let Some(call) = sources.ambiguous_call(site) {
                            let old = func.new_reg();
                            edits.before(
                                block.id,
                                index,
                                runtime(
                                    RuntimeEntry::PushCallSite { index: call, bits },
                                    vec![old],
                                    vec![],
                                ),
                            );
                            edits.after(
                                block.id,
                                index,
                                runtime(RuntimeEntry::RestoreCallSite, vec![], vec![Operand::Reg(old)]),
                            );
                        }
                    }
                    IrOp::Return(_) if alloca_count > 0 => {
                        edits.before(
                            block.id,
                            index,
                            IrInstruction::with_loc(
                                IrOp::Runtime {
                                    dsts: vec![],
                                    entry: RuntimeEntry::FreeN,
                                    args: vec![Operand::Const(alloca_count as i64)],
                                },
                                loc,
                            ),
                        );
                    }
                    _ => {}
                }

                if let Some(access) = inst.op.memory_access() {
                    let provenance = classifier.classify(id, &analysis, access.ptr);
                    let access_id = if provenance.kind == AllocationKind::System {
                        0
                    } else {
                        self.next_access_id(access.is_write)
                    };
                    accesses.push(Access {
                        block: block.id,
                        index,
                        ptr: access.ptr,
                        size: access.size,
                        provenance,
                        access_id,
                        source_id,
                        pc,
                    });
                }
            }
        }
        self.stats.accesses += accesses.len();

        let infos = self.cache_allocation_info(&analysis, &mut func, &mut edits, &accesses);

        let mut in_block: BTreeMap<BlockId, Vec<(Access, AccessCandidate)>> = BTreeMap::new();
        for access in &accesses {
            let kind = access.provenance.kind;
            if kind == AllocationKind::System {
                self.stats.unchecked_accesses += 1;
                continue;
            }
            if kind == AllocationKind::Unknown && self.options.unknown_policy == UnknownPolicy::Skip {
                let real = func.new_reg();
                edits.before(
                    access.block,
                    access.index,
                    runtime(
                        RuntimeEntry::Unpack(kind),
                        vec![real],
                        vec![access.ptr, Operand::Const(access.source_id)],
                    ),
                );
                set_access_ptr(&mut func, access, Operand::Reg(real));
                self.stats.skipped_unknown += 1;
                continue;
            }
            let info = access
                .provenance
                .object
                .and_then(|o| infos.get(&o))
                .copied();
            if self.options.hoist_checks
                && self.try_hoist(orig, &analysis, &mut func, &mut edits, access, info)
            {
                self.stats.hoisted_checks += 1;
                continue;
            }
            let with_base = info
                .map(|info| info_available(&analysis, &info, access.block, access.index))
                .unwrap_or(false);
            in_block.entry(access.block).or_default().push((
                *access,
                AccessCandidate {
                    index: access.index,
                    ptr: access.ptr,
                    kind,
                    with_base,
                },
            ));
        }

        for (block_id, entries) in in_block {
            let candidates: Vec<AccessCandidate> = entries.iter().map(|(_, c)| *c).collect();
            let plan = match (self.options.merge_checks, orig.block(block_id)) {
                (true, Some(block)) => plan_block(block, &candidates, |op, idx| {
                    analysis.is_available(op, block_id, idx)
                }),
                _ => CheckPlan::Scalar,
            };
            if let CheckPlan::Merged { at, groups } = &plan {
                for group in groups {
                    let dsts: Vec<IrReg> = group.lanes.iter().map(|_| func.new_reg()).collect();
                    let first = entries[group.lanes[0]].0;
                    let mut args = vec![Operand::Const(program_counter(id, block_id, *at) as i64)];
                    for &lane in &group.lanes {
                        let access = &entries[lane].0;
                        args.push(access.ptr);
                        if group.with_base {
                            let cached = access
                                .provenance
                                .object
                                .and_then(|o| infos.get(&o))
                                .map(CachedInfo::operands)
                                .unwrap_or([Operand::Const(0); 3]);
                            args.extend(cached);
                        }
                        args.push(Operand::Const(i64::from(access.size)));
                        args.push(Operand::Const(access.access_id));
                        args.push(Operand::Const(access.source_id));
                    }
                    let count = group.lanes.len() as u32;
                    let entry = if group.with_base {
                        RuntimeEntry::CheckWithBaseVec {
                            kind: group.kind,
                            count,
                        }
                    } else {
                        RuntimeEntry::CheckVec {
                            kind: group.kind,
                            count,
                        }
                    };
                    let loc = orig
                        .block(block_id)
                        .and_then(|b| b.instructions.get(first.index))
                        .and_then(|inst| inst.loc.clone());
                    edits.before(
                        block_id,
                        *at,
                        IrInstruction::with_loc(
                            IrOp::Runtime {
                                dsts: dsts.clone(),
                                entry,
                                args,
                            },
                            loc,
                        ),
                    );
                    for (&lane, dst) in group.lanes.iter().zip(&dsts) {
                        set_access_ptr(&mut func, &entries[lane].0, Operand::Reg(*dst));
                    }
                    self.stats.merged_checks += 1;
                    self.stats.merged_lanes += group.lanes.len();
                }
            }
            for (pos, (access, candidate)) in entries.iter().enumerate() {
                if plan.lane_of(pos).is_some() {
                    continue;
                }
                let info = if candidate.with_base {
                    access.provenance.object.and_then(|o| infos.get(&o)).copied()
                } else {
                    None
                };
                self.emit_scalar_check(orig, &mut func, &mut edits, access, info);
            }
        }

        edits.apply(&mut func);
        substitute_globals(&mut func, &shadow_regs);
        tracing::debug!(
            function = %func.name,
            accesses = accesses.len(),
            allocas = alloca_count,
            "instrumented function"
        );
        Ok(func)
    }

    fn load_shadows(
        &mut self,
        orig: &Function,
        func: &mut Function,
        edits: &mut Edits,
        shadows: &BTreeMap<GlobalId, GlobalId>,
    ) -> HashMap<GlobalId, IrReg> {
        let used: BTreeSet<GlobalId> = orig
            .instructions()
            .flat_map(|inst| inst.op.operands())
            .filter_map(|op| match op {
                Operand::Global(g) => Some(g),
                _ => None,
            })
            .filter(|g| shadows.contains_key(g))
            .collect();
        let mut regs = HashMap::new();
        for global in used {
            if let Some(shadow) = shadows.get(&global) {
                let dst = func.new_reg();
                edits.entry.push(IrInstruction::new(IrOp::Load {
                    dst,
                    ptr: Operand::Global(*shadow),
                    size: 8,
                }));
                regs.insert(global, dst);
            }
        }
        regs
    }

    #[allow(clippy::too_many_arguments)]
    fn instrument_call(
        &mut self,
        module: &Module,
        id: FuncId,
        analysis: &IrAnalysis<'_>,
        classifier: &mut ProvenanceClassifier,
        func: &mut Function,
        edits: &mut Edits,
        block: BlockId,
        index: usize,
        callee: &Callee,
        args: &[Operand],
        source_id: i64,
    ) {
        let target = match callee {
            Callee::Direct(f) => match module.function(*f) {
                Some(target)
                    if target.is_declaration() && !target.name.starts_with(SANITIZER_PREFIX) =>
                {
                    target
                }
                _ => return,
            },
            Callee::Indirect(_) => return,
        };
        let mut replacements = Vec::new();
        for (pos, arg) in args.iter().enumerate() {
            let is_pointer = target.params.get(pos).map(|p| p.is_pointer).unwrap_or(false);
            if !is_pointer || matches!(arg, Operand::Const(_)) {
                continue;
            }
            let kind = classifier.classify(id, analysis, *arg).kind;
            if kind == AllocationKind::System {
                continue;
            }
            let real = func.new_reg();
            edits.before(
                block,
                index,
                runtime(
                    RuntimeEntry::Unpack(kind),
                    vec![real],
                    vec![*arg, Operand::Const(source_id)],
                ),
            );
            replacements.push((pos, real));
        }
        if let IrOp::Call { args, .. } = &mut func.blocks[block.index()].instructions[index].op {
            for (pos, real) in replacements {
                if let Some(arg) = args.get_mut(pos) {
                    *arg = Operand::Reg(real);
                    self.stats.unpacked_arguments += 1;
                }
            }
        }
    }

    /// Emit `allocation_info` for objects accessed at least twice
    fn cache_allocation_info(
        &mut self,
        analysis: &IrAnalysis<'_>,
        func: &mut Function,
        edits: &mut Edits,
        accesses: &[Access],
    ) -> HashMap<UnderlyingObject, CachedInfo> {
        let mut infos = HashMap::new();
        if !self.options.cache_allocation_info {
            return infos;
        }
        let mut order: Vec<(UnderlyingObject, AllocationKind)> = Vec::new();
        let mut counts: HashMap<UnderlyingObject, usize> = HashMap::new();
        for access in accesses {
            let skipped = access.provenance.kind == AllocationKind::Unknown
                && self.options.unknown_policy == UnknownPolicy::Skip;
            if let (Some(object), false) = (access.provenance.object, skipped) {
                let count = counts.entry(object).or_insert(0);
                if *count == 0 {
                    order.push((object, access.provenance.kind));
                }
                *count += 1;
            }
        }

        for (object, kind) in order {
            if counts.get(&object).copied().unwrap_or(0) < 2 || !kind.is_tracked() {
                continue;
            }
            let (ptr, site) = match object {
                UnderlyingObject::Alloca(reg)
                | UnderlyingObject::CallResult { reg, .. }
                | UnderlyingObject::Runtime { reg, .. }
                | UnderlyingObject::Loaded(reg) => match analysis.definition(reg) {
                    Some(site) => (Operand::Reg(reg), Some(site)),
                    None => continue,
                },
                UnderlyingObject::Global(g) => (Operand::Global(g), None),
                UnderlyingObject::Argument(idx) => match func.params.get(idx) {
                    Some(param) => (Operand::Reg(param.reg), None),
                    None => continue,
                },
                _ => continue,
            };
            let regs = [func.new_reg(), func.new_reg(), func.new_reg()];
            let inst = runtime(RuntimeEntry::AllocationInfo(kind), regs.to_vec(), vec![ptr]);
            match site {
                Some((block, index)) => edits.after(block, index, inst),
                None => edits.entry.push(inst),
            }
            infos.insert(object, CachedInfo { regs, site });
            self.stats.cached_objects += 1;
        }
        infos
    }

    /// Replace the per-iteration check of a loop access by one check in the preheader
    fn try_hoist(
        &mut self,
        orig: &Function,
        analysis: &IrAnalysis<'_>,
        func: &mut Function,
        edits: &mut Edits,
        access: &Access,
        info: Option<CachedInfo>,
    ) -> bool {
        let Some(lp) = analysis.loop_for(access.block) else {
            return false;
        };
        let (Some(preheader), Some(latch)) = (lp.preheader, lp.latch()) else {
            return false;
        };
        if !lp.is_bottom_tested() || !analysis.dominates(access.block, latch) {
            return false;
        }
        let Some(count) = analysis.backedge_taken_count(lp) else {
            return false;
        };
        let Some(affine) = analysis.affine_access(lp, access.ptr) else {
            return false;
        };
        let Some(at) = orig.block(preheader).map(|b| b.insertion_point()) else {
            return false;
        };
        let mut needed = affine.offset.start.values();
        needed.extend(affine.offset.step.values());
        needed.extend(count.values());
        needed.insert(affine.base);
        if !needed.iter().all(|op| analysis.is_available(*op, preheader, at)) {
            tracing::debug!(block = access.block.0, "loop bound not available in preheader");
            return false;
        }

        let Some((min, max)) = affine.offset.range(&count) else {
            tracing::debug!(block = access.block.0, "loop range overflows");
            return false;
        };

        let kind = access.provenance.kind;
        let info = info.filter(|info| info_available(analysis, info, preheader, at));
        let site = [
            Operand::Const(i64::from(access.size)),
            Operand::Const(access.access_id),
            Operand::Const(access.source_id),
            Operand::Const(access.pc as i64),
        ];
        let loc = orig
            .block(access.block)
            .and_then(|b| b.instructions.get(access.index))
            .and_then(|inst| inst.loc.clone());
        let mut code = Vec::new();

        let gep = |func: &mut Function, code: &mut Vec<IrInstruction>, offset: &super::affine::SymExpr| {
            let delta = offset.expand(func, code);
            if delta == Operand::Const(0) {
                return affine.base;
            }
            let dst = func.new_reg();
            code.push(runtime(
                RuntimeEntry::Gep(kind),
                vec![dst],
                vec![affine.base, delta, Operand::Const(access.source_id)],
            ));
            Operand::Reg(dst)
        };

        if affine.offset.is_invariant() {
            let ptr = gep(func, &mut code, &affine.offset.start);
            let (entry, mut args) = match info {
                Some(info) => (
                    RuntimeEntry::CheckWithBase { kind, void: true },
                    [vec![ptr], info.operands().to_vec()].concat(),
                ),
                None => (RuntimeEntry::Check { kind, void: true }, vec![ptr]),
            };
            args.extend(site);
            code.push(runtime(entry, vec![], args));
        } else {
            let min_ptr = gep(func, &mut code, &min);
            let max_ptr = gep(func, &mut code, &max);
            let (entry, mut args) = match info {
                Some(info) => (
                    RuntimeEntry::CheckRangeWithBase(kind),
                    [vec![max_ptr, min_ptr], info.operands().to_vec()].concat(),
                ),
                None => (RuntimeEntry::CheckRange(kind), vec![max_ptr, min_ptr]),
            };
            args.extend(site);
            code.push(runtime(entry, vec![], args));
        }
        for mut inst in code {
            inst.loc = loc.clone();
            edits.before(preheader, at, inst);
        }

        let real = func.new_reg();
        edits.before(
            access.block,
            access.index,
            runtime(
                RuntimeEntry::Unpack(kind),
                vec![real],
                vec![access.ptr, Operand::Const(access.source_id)],
            ),
        );
        set_access_ptr(func, access, Operand::Reg(real));
        tracing::debug!(
            function = %orig.name,
            header = lp.header.0,
            preheader = preheader.0,
            "hoisted check out of loop"
        );
        true
    }

    fn emit_scalar_check(
        &mut self,
        orig: &Function,
        func: &mut Function,
        edits: &mut Edits,
        access: &Access,
        info: Option<CachedInfo>,
    ) {
        let kind = access.provenance.kind;
        let real = func.new_reg();
        let (entry, mut args) = match info {
            Some(info) => (
                RuntimeEntry::CheckWithBase { kind, void: false },
                [vec![access.ptr], info.operands().to_vec()].concat(),
            ),
            None => (RuntimeEntry::Check { kind, void: false }, vec![access.ptr]),
        };
        args.extend([
            Operand::Const(i64::from(access.size)),
            Operand::Const(access.access_id),
            Operand::Const(access.source_id),
            Operand::Const(access.pc as i64),
        ]);
        let loc = orig
            .block(access.block)
            .and_then(|b| b.instructions.get(access.index))
            .and_then(|inst| inst.loc.clone());
        edits.before(
            access.block,
            access.index,
            IrInstruction::with_loc(
                IrOp::Runtime {
                    dsts: vec![real],
                    entry,
                    args,
                },
                loc,
            ),
        );
        set_access_ptr(func, access, Operand::Reg(real));
        self.stats.scalar_checks += 1;
    }

    fn emit_global_registration(&mut self, module: &mut Module, shadows: &BTreeMap<GlobalId, GlobalId>) {
        let mut ctor = FunctionBuilder::new(REGISTER_GLOBALS, "");
        for (&global, &shadow) in shadows {
            let size = module.global(global).map(|g| g.size).unwrap_or(0);
            let current = ctor.load(Operand::Global(shadow), 8);
            let unset = ctor.cmp(CmpPred::Eq, current, 0i64);
            let register = ctor.block("register");
            let next = ctor.block("next");
            ctor.branch(unset, register, next);
            ctor.switch_to(register);
            let allocation_id = self.next_allocation_id();
            let tracked = ctor.runtime(
                RuntimeEntry::New(AllocationKind::Global),
                vec![
                    Operand::Global(global),
                    Operand::Const(size as i64),
                    Operand::Const(i64::from(allocation_id)),
                    Operand::Const(UNKNOWN_SOURCE),
                    Operand::Const(0),
                ],
            );
            for reg in tracked {
                ctor.store(Operand::Global(shadow), reg, 8);
            }
            ctor.jump(next);
            ctor.switch_to(next);
        }
        ctor.ret(None);
        let mut ctor = ctor.finish();
        ctor.sanitize = false;

        let mut dtor = FunctionBuilder::new(UNREGISTER_GLOBALS, "");
        for &shadow in shadows.values() {
            let current = dtor.load(Operand::Global(shadow), 8);
            let set = dtor.cmp(CmpPred::Ne, current, 0i64);
            let release = dtor.block("release");
            let next = dtor.block("next");
            dtor.branch(set, release, next);
            dtor.switch_to(release);
            dtor.runtime(
                RuntimeEntry::Free(AllocationKind::Global),
                vec![
                    Operand::Reg(current),
                    Operand::Const(UNKNOWN_SOURCE),
                    Operand::Const(0),
                ],
            );
            dtor.store(Operand::Global(shadow), 0i64, 8);
            dtor.jump(next);
            dtor.switch_to(next);
        }
        dtor.runtime(RuntimeEntry::LeakCheck, vec![]);
        dtor.ret(None);
        let mut dtor = dtor.finish();
        dtor.sanitize = false;

        let ctor_id = module.add_function(ctor);
        let dtor_id = module.add_function(dtor);
        module.ctors.insert(0, ctor_id);
        module.dtors.push(dtor_id);
    }
}

fn runtime(entry: RuntimeEntry, dsts: Vec<IrReg>, args: Vec<Operand>) -> IrInstruction {
    IrInstruction::new(IrOp::Runtime { dsts, entry, args })
}

fn set_access_ptr(func: &mut Function, access: &Access, ptr: Operand) {
    if let Some(inst) = func
        .blocks
        .get_mut(access.block.index())
        .and_then(|b| b.instructions.get_mut(access.index))
    {
        inst.op.set_access_ptr(ptr);
    }
}

fn info_available(analysis: &IrAnalysis<'_>, info: &CachedInfo, block: BlockId, index: usize) -> bool {
    match info.site {
        None => true,
        Some((def_block, def_index)) if def_block == block => def_index < index,
        Some((def_block, _)) => analysis.dominates(def_block, block),
    }
}

fn substitute_globals(func: &mut Function, regs: &HashMap<GlobalId, IrReg>) {
    if regs.is_empty() {
        return;
    }
    for block in &mut func.blocks {
        for inst in &mut block.instructions {
            for op in inst.op.operands_mut() {
                if let Operand::Global(g) = op {
                    if let Some(reg) = regs.get(g) {
                        *op = Operand::Reg(*reg);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{BinOp, FunctionBuilder};

    fn runtime_entries(func: &Function) -> Vec<RuntimeEntry> {
        func.instructions()
            .filter_map(|inst| match &inst.op {
                IrOp::Runtime { entry, .. } => Some(*entry),
                _ => None,
            })
            .collect()
    }

    fn run(module: &mut Module, options: &InstrumentOptions) -> InstrumentReport {
        Instrumenter::new(options).run(module).unwrap()
    }

    #[test]
    fn test_hoist_address_computations() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let p = b.param(true);
        let x = b.load(p, 4);
        let q = b.gep(p, 8i64);
        b.store(q, x, 4);
        b.ret(None);
        let mut func = b.finish();
        assert_eq!(hoist_address_computations(&mut func), 1);
        assert!(matches!(func.blocks[0].instructions[0].op, IrOp::Gep { .. }));
    }

    #[test]
    fn test_program_counter_layout() {
        assert_eq!(program_counter(FuncId(1), BlockId(2), 3), (1 << 40) | (2 << 20) | 3);
    }

    #[test]
    fn test_stack_allocation_lifecycle() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::kernel("k", "k.c");
        b.at(1, 1);
        let slot = b.alloca(16);
        b.store(slot, 7i64, 4);
        b.ret(None);
        module.add_function(b.finish());

        let report = run(&mut module, &InstrumentOptions::default());
        let entries = runtime_entries(&module.functions[0]);
        assert_eq!(entries[0], RuntimeEntry::New(AllocationKind::Local));
        assert!(entries.contains(&RuntimeEntry::Check {
            kind: AllocationKind::Local,
            void: false
        }));
        assert_eq!(*entries.last().unwrap(), RuntimeEntry::FreeN);
        assert_eq!(report.stats.allocas, 1);
        assert_eq!(report.stats.scalar_checks, 1);
    }

    #[test]
    fn test_alloca_in_loop_is_rejected() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let body = b.block("body");
        let exit = b.block("exit");
        b.jump(body);
        b.switch_to(body);
        b.alloca(4);
        b.branch(1i64, body, exit);
        b.switch_to(exit);
        b.ret(None);
        module.add_function(b.finish());

        let err = Instrumenter::new(&InstrumentOptions::default())
            .run(&mut module)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlloca { .. }));
    }

    #[test]
    fn test_system_pointers_are_not_checked() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let args = b.intrinsic(Intrinsic::ImplicitArgPtr);
        let field = b.gep(args, 8i64);
        b.load(field, 4);
        b.ret(None);
        module.add_function(b.finish());

        let report = run(&mut module, &InstrumentOptions::default());
        assert!(runtime_entries(&module.functions[0]).is_empty());
        assert_eq!(report.stats.unchecked_accesses, 1);
    }

    #[test]
    fn test_straight_line_accesses_merge() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let p = b.param(true);
        let q = b.gep(p, 4i64);
        let x = b.load(p, 4);
        b.store(q, x, 4);
        b.ret(None);
        module.add_function(b.finish());

        let options = InstrumentOptions {
            cache_allocation_info: false,
            ..InstrumentOptions::default()
        };
        let report = run(&mut module, &options);
        let entries = runtime_entries(&module.functions[0]);
        assert!(entries.contains(&RuntimeEntry::CheckVec {
            kind: AllocationKind::Global,
            count: 2
        }));
        assert_eq!(report.stats.merged_lanes, 2);
        assert_eq!(report.stats.scalar_checks, 0);
    }

    #[test]
    fn test_cached_info_feeds_with_base_checks() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let p = b.param(true);
        let x = b.load(p, 4);
        b.call_void(FuncId(1), vec![]);
        b.store(p, x, 4);
        b.ret(None);
        module.add_function(b.finish());
        module.add_function(Function::declaration("barrier", &[]));

        let report = run(&mut module, &InstrumentOptions::default());
        let entries = runtime_entries(&module.functions[0]);
        assert_eq!(entries[0], RuntimeEntry::AllocationInfo(AllocationKind::Global));
        assert_eq!(
            entries
                .iter()
                .filter(|e| matches!(e, RuntimeEntry::CheckWithBase { .. }))
                .count(),
            2
        );
        assert_eq!(report.stats.cached_objects, 1);
    }

    #[test]
    fn test_counted_loop_is_hoisted() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::kernel("fill", "fill.c");
        let p = b.param(true);
        let n = b.param(false);
        let body = b.block("body");
        let exit = b.block("exit");
        b.jump(body);
        b.switch_to(body);
        let i = b.phi();
        let off = b.bin(BinOp::Shl, i, 2i64);
        let addr = b.gep(p, off);
        b.store(addr, i, 4);
        let next = b.add(i, 1i64);
        let more = b.cmp(CmpPred::Slt, next, n);
        b.branch(more, body, exit);
        b.add_incoming(i, BlockId(0), 0i64);
        b.add_incoming(i, body, next);
        b.switch_to(exit);
        b.ret(None);
        module.add_function(b.finish());

        let report = run(&mut module, &InstrumentOptions::default());
        assert_eq!(report.stats.hoisted_checks, 1);
        let func = &module.functions[0];
        let entry_entries: Vec<RuntimeEntry> = func.blocks[0]
            .instructions
            .iter()
            .filter_map(|inst| match &inst.op {
                IrOp::Runtime { entry, .. } => Some(*entry),
                _ => None,
            })
            .collect();
        assert!(entry_entries.contains(&RuntimeEntry::CheckRange(AllocationKind::Global)));
        let body_entries: Vec<RuntimeEntry> = func.blocks[1]
            .instructions
            .iter()
            .filter_map(|inst| match &inst.op {
                IrOp::Runtime { entry, .. } => Some(*entry),
                _ => None,
            })
            .collect();
        assert!(body_entries.contains(&RuntimeEntry::Unpack(AllocationKind::Global)));
        assert!(!body_entries.iter().any(|e| e.is_check()));
    }

    #[test]
    fn test_declaration_arguments_are_unpacked() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let p = b.param(true);
        b.call_void(FuncId(1), vec![Operand::Reg(p), Operand::Const(4)]);
        b.ret(None);
        module.add_function(b.finish());
        module.add_function(Function::declaration("memset_ext", &[true, false]));

        let report = run(&mut module, &InstrumentOptions::default());
        assert_eq!(report.stats.unpacked_arguments, 1);
        let func = &module.functions[0];
        let call_args = func
            .instructions()
            .find_map(|inst| match &inst.op {
                IrOp::Call { args, .. } => Some(args.clone()),
                _ => None,
            })
            .unwrap();
        assert_ne!(call_args[0], Operand::Reg(p));
        assert_eq!(call_args[1], Operand::Const(4));
    }

    #[test]
    fn test_globals_get_shadow_and_registration() {
        let mut module = Module::new("m");
        let g = module.add_global(GlobalVar::zeroed("counter", 4));
        let mut b = FunctionBuilder::kernel("k", "k.c");
        b.store(Operand::Global(g), 1i64, 4);
        b.ret(None);
        module.add_function(b.finish());

        let report = run(&mut module, &InstrumentOptions::default());
        assert_eq!(report.stats.tracked_globals, 1);
        let shadow = module.find_global("__gpusan.shadow.counter").unwrap();
        let kernel = &module.functions[0];
        assert!(matches!(
            &kernel.blocks[0].instructions[0].op,
            IrOp::Load { ptr: Operand::Global(s), .. } if *s == shadow
        ));
        assert!(!kernel
            .instructions()
            .skip(1)
            .any(|inst| inst.op.operands().contains(&Operand::Global(g))));

        let ctor = module.find_function(REGISTER_GLOBALS).unwrap();
        let dtor = module.find_function(UNREGISTER_GLOBALS).unwrap();
        assert_eq!(module.ctors, vec![ctor]);
        assert_eq!(module.dtors, vec![dtor]);
        assert!(runtime_entries(module.function(dtor).unwrap()).contains(&RuntimeEntry::LeakCheck));
    }

    #[test]
    fn test_access_ids_are_module_wide() {
        let mut module = Module::new("m");
        for name in ["a", "b"] {
            let mut b = FunctionBuilder::kernel(name, "k.c");
            let p = b.param(true);
            let x = b.load(p, 4);
            b.call_void(FuncId(2), vec![]);
            b.store(p, x, 4);
            b.ret(None);
            module.add_function(b.finish());
        }
        module.add_function(Function::declaration("sync", &[]));
        let options = InstrumentOptions {
            cache_allocation_info: false,
            ..InstrumentOptions::default()
        };
        run(&mut module, &options);

        let ids: Vec<i64> = module.functions[..2]
            .iter()
            .flat_map(|f| f.instructions())
            .filter_map(|inst| match &inst.op {
                IrOp::Runtime {
                    entry: RuntimeEntry::Check { .. },
                    args,
                    ..
                } => args[2].as_const(),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![-1, 1, -2, 2]);
    }
}
