//! Per-block check placement
//!
//! Accesses that are neither skipped nor hoisted out of a loop are checked
//! inside their block. The planner decides whether the block gets one scalar
//! check per access or a merged vector check at the first access.
//!
//! Merging is only attempted when every address computation of the block
//! precedes its first access. The merge window then runs from the first
//! access up to the first call or lifetime marker (either may retire an
//! allocation); accesses in the window whose pointer is already available at
//! the first access are grouped by `(kind, with_base)`. Groups of one stay
//! scalar.

use super::ir::{BasicBlock, Intrinsic, IrOp, Operand};
use crate::runtime::AllocationKind;

/// Access that needs a check inside its block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCandidate {
    /// Index of the load or store in the block
    pub index: usize,
    /// Address operand
    pub ptr: Operand,
    /// Provenance kind of the address
    pub kind: AllocationKind,
    /// Whether a cached allocation record is available
    pub with_base: bool,
}

/// Accesses checked by one vector call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeGroup {
    /// Provenance kind shared by all lanes
    pub kind: AllocationKind,
    /// Whether the lanes use cached allocation records
    pub with_base: bool,
    /// Positions into the candidate slice, in program order
    pub lanes: Vec<usize>,
}

/// Check placement chosen for one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckPlan {
    /// One check right before each access
    Scalar,
    /// Vector checks before instruction `at`; candidates not in a group stay scalar
    Merged {
        /// Insertion point (the first access)
        at: usize,
        /// Groups of at least two lanes
        groups: Vec<MergeGroup>,
    },
}

impl CheckPlan {
    /// Group and lane of a candidate, if it was merged
    pub fn lane_of(&self, candidate: usize) -> Option<(usize, usize)> {
        match self {
            CheckPlan::Scalar => None,
            CheckPlan::Merged { groups, .. } => {
                groups.iter().enumerate().find_map(|(g, group)| {
                    group
                        .lanes
                        .iter()
                        .position(|&lane| lane == candidate)
                        .map(|lane| (g, lane))
                })
            }
        }
    }

    /// Number of accesses covered by vector checks
    pub fn merged_lanes(&self) -> usize {
        match self {
            CheckPlan::Scalar => 0,
            CheckPlan::Merged { groups, .. } => groups.iter().map(|g| g.lanes.len()).sum(),
        }
    }
}

/// Choose the placement for `block`
///
/// `available(op, index)` tells whether `op` holds its value before
/// instruction `index` of the block.
pub fn plan_block(
    block: &BasicBlock,
    candidates: &[AccessCandidate],
    available: impl Fn(Operand, usize) -> bool,
) -> CheckPlan {
    if candidates.len() < 2 {
        return CheckPlan::Scalar;
    }
    let first = candidates
        .iter()
        .map(|c| c.index)
        .min()
        .unwrap_or_default();

    let late_address = block
        .instructions
        .iter()
        .enumerate()
        .skip(first)
        .any(|(_, inst)| matches!(inst.op, IrOp::Gep { .. }));
    if late_address {
        return CheckPlan::Scalar;
    }

    let window_end = block
        .instructions
        .iter()
        .enumerate()
        .skip(first)
        .find(|(_, inst)| {
            matches!(
                inst.op,
                IrOp::Call { .. }
                    | IrOp::Runtime { .. }
                    | IrOp::Intrinsic {
                        intrinsic: Intrinsic::LifetimeStart | Intrinsic::LifetimeEnd,
                        ..
                    }
            )
        })
        .map(|(idx, _)| idx)
        .unwrap_or(block.instructions.len());

    let mut groups: Vec<MergeGroup> = Vec::new();
    for (pos, candidate) in candidates.iter().enumerate() {
        if candidate.index >= window_end || !available(candidate.ptr, first) {
            continue;
        }
        match groups
            .iter_mut()
            .find(|g| g.kind == candidate.kind && g.with_base == candidate.with_base)
        {
            Some(group) => group.lanes.push(pos),
            None => groups.push(MergeGroup {
                kind: candidate.kind,
                with_base: candidate.with_base,
                lanes: vec![pos],
            }),
        }
    }
    groups.retain(|g| g.lanes.len() >= 2);

    if groups.is_empty() {
        CheckPlan::Scalar
    } else {
        CheckPlan::Merged { at: first, groups }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{FuncId, FunctionBuilder, IrReg};

    fn candidates_of(block: &BasicBlock, kind: AllocationKind) -> Vec<AccessCandidate> {
        block
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(index, inst)| {
                inst.op.memory_access().map(|access| AccessCandidate {
                    index,
                    ptr: access.ptr,
                    kind,
                    with_base: false,
                })
            })
            .collect()
    }

    fn available_before(block: &BasicBlock) -> impl Fn(Operand, usize) -> bool + '_ {
        move |op, index| match op {
            Operand::Reg(reg) => block.instructions[..index]
                .iter()
                .any(|inst| inst.op.defs().contains(&reg)) || reg == IrReg(0),
            _ => true,
        }
    }

    #[test]
    fn test_merges_straight_line_accesses() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let p = b.param(true);
        let a = b.gep(p, 4i64);
        let c = b.gep(p, 8i64);
        let x = b.load(a, 4);
        b.store(c, x, 4);
        b.store(p, x, 4);
        b.ret(None);
        let func = b.finish();
        let block = &func.blocks[0];
        let candidates = candidates_of(block, AllocationKind::Global);

        let plan = plan_block(block, &candidates, available_before(block));
        match &plan {
            CheckPlan::Merged { at, groups } => {
                assert_eq!(*at, 2);
                assert_eq!(groups.len(), 1);
                assert_eq!(groups[0].lanes, vec![0, 1, 2]);
            }
            other => panic!("expected merge, got {:?}", other),
        }
        assert_eq!(plan.lane_of(1), Some((0, 1)));
        assert_eq!(plan.merged_lanes(), 3);
    }

    #[test]
    fn test_late_address_forces_scalar() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let p = b.param(true);
        let x = b.load(p, 4);
        let q = b.gep(p, 4i64);
        b.store(q, x, 4);
        b.ret(None);
        let func = b.finish();
        let block = &func.blocks[0];
        let candidates = candidates_of(block, AllocationKind::Global);
        assert_eq!(
            plan_block(block, &candidates, available_before(block)),
            CheckPlan::Scalar
        );
    }

    #[test]
    fn test_call_ends_window() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let p = b.param(true);
        let x = b.load(p, 4);
        b.call_void(FuncId(1), vec![]);
        b.store(p, x, 4);
        b.ret(None);
        let func = b.finish();
        let block = &func.blocks[0];
        let candidates = candidates_of(block, AllocationKind::Global);
        assert_eq!(
            plan_block(block, &candidates, available_before(block)),
            CheckPlan::Scalar
        );
    }

    #[test]
    fn test_groups_by_kind() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let p = b.param(true);
        let x = b.load(p, 4);
        b.store(p, x, 4);
        b.load(p, 8);
        b.ret(None);
        let func = b.finish();
        let block = &func.blocks[0];
        let mut candidates = candidates_of(block, AllocationKind::Global);
        candidates[2].kind = AllocationKind::Unknown;
        let plan = plan_block(block, &candidates, available_before(block));
        assert_eq!(plan.lane_of(2), None);
        assert_eq!(plan.merged_lanes(), 2);
    }
}
