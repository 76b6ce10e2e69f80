//! Symbolic integer expressions for loop range analysis
//!
//! A [`SymExpr`] is built from constants and loop-invariant IR values. The
//! constructors fold constants eagerly, so ranges over constant trip counts
//! collapse to plain numbers and cost nothing to expand. [`AddRec`] is an
//! affine recurrence `start + k * step` over the iterations of one loop.

use super::ir::{BinOp, Function, IrInstruction, IrOp, Operand};
use std::collections::BTreeSet;

/// Symbolic 64-bit integer expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymExpr {
    /// Constant
    Const(i64),
    /// Value of a loop-invariant operand
    Value(Operand),
    /// Wrapping sum
    Add(Box<SymExpr>, Box<SymExpr>),
    /// Wrapping product
    Mul(Box<SymExpr>, Box<SymExpr>),
    /// Signed division by a positive constant
    SDiv(Box<SymExpr>, i64),
    /// Signed maximum
    SMax(Box<SymExpr>, Box<SymExpr>),
    /// Signed minimum
    SMin(Box<SymExpr>, Box<SymExpr>),
}

impl SymExpr {
    /// Constant expression
    pub fn constant(value: i64) -> Self {
        SymExpr::Const(value)
    }

    /// Expression for an operand; constants fold
    pub fn value(op: Operand) -> Self {
        match op {
            Operand::Const(c) => SymExpr::Const(c),
            op => SymExpr::Value(op),
        }
    }

    /// Constant value, if the expression folded to one
    pub fn as_const(&self) -> Option<i64> {
        match self {
            SymExpr::Const(c) => Some(*c),
            _ => None,
        }
    }

    /// `a + b`
    pub fn add(a: SymExpr, b: SymExpr) -> Self {
        match (a, b) {
            (SymExpr::Const(x), SymExpr::Const(y)) => SymExpr::Const(x.wrapping_add(y)),
            (SymExpr::Const(0), e) | (e, SymExpr::Const(0)) => e,
            (a, b) => SymExpr::Add(Box::new(a), Box::new(b)),
        }
    }

    /// `a - b`
    pub fn sub(a: SymExpr, b: SymExpr) -> Self {
        Self::add(a, Self::neg(b))
    }

    /// `-a`
    pub fn neg(a: SymExpr) -> Self {
        Self::mul(a, SymExpr::Const(-1))
    }

    /// `a * b`
    pub fn mul(a: SymExpr, b: SymExpr) -> Self {
        match (a, b) {
            (SymExpr::Const(x), SymExpr::Const(y)) => SymExpr::Const(x.wrapping_mul(y)),
            (SymExpr::Const(0), _) | (_, SymExpr::Const(0)) => SymExpr::Const(0),
            (SymExpr::Const(1), e) | (e, SymExpr::Const(1)) => e,
            (a, b) => SymExpr::Mul(Box::new(a), Box::new(b)),
        }
    }

    /// `a / d` (truncating); `d` must be positive
    pub fn sdiv(a: SymExpr, d: i64) -> Self {
        match a {
            _ if d == 1 => a,
            SymExpr::Const(x) if d > 0 => SymExpr::Const(x / d),
            a => SymExpr::SDiv(Box::new(a), d),
        }
    }

    /// `smax(a, b)`
    pub fn smax(a: SymExpr, b: SymExpr) -> Self {
        match (a, b) {
            (SymExpr::Const(x), SymExpr::Const(y)) => SymExpr::Const(x.max(y)),
            (a, b) if a == b => a,
            (a, b) => SymExpr::SMax(Box::new(a), Box::new(b)),
        }
    }

    /// `smin(a, b)`
    pub fn smin(a: SymExpr, b: SymExpr) -> Self {
        match (a, b) {
            (SymExpr::Const(x), SymExpr::Const(y)) => SymExpr::Const(x.min(y)),
            (a, b) if a == b => a,
            (a, b) => SymExpr::SMin(Box::new(a), Box::new(b)),
        }
    }

    /// Evaluate with `lookup` providing operand values
    pub fn eval(&self, lookup: &dyn Fn(Operand) -> Option<i64>) -> Option<i64> {
        Some(match self {
            SymExpr::Const(c) => *c,
            SymExpr::Value(op) => lookup(*op)?,
            SymExpr::Add(a, b) => a.eval(lookup)?.wrapping_add(b.eval(lookup)?),
            SymExpr::Mul(a, b) => a.eval(lookup)?.wrapping_mul(b.eval(lookup)?),
            SymExpr::SDiv(a, d) => a.eval(lookup)?.checked_div(*d)?,
            SymExpr::SMax(a, b) => a.eval(lookup)?.max(b.eval(lookup)?),
            SymExpr::SMin(a, b) => a.eval(lookup)?.min(b.eval(lookup)?),
        })
    }

    /// Operands the expression reads
    pub fn values(&self) -> BTreeSet<Operand> {
        let mut out = BTreeSet::new();
        self.collect_values(&mut out);
        out
    }

    fn collect_values(&self, out: &mut BTreeSet<Operand>) {
        match self {
            SymExpr::Const(_) => {}
            SymExpr::Value(op) => {
                out.insert(*op);
            }
            SymExpr::SDiv(a, _) => a.collect_values(out),
            SymExpr::Add(a, b)
            | SymExpr::Mul(a, b)
            | SymExpr::SMax(a, b)
            | SymExpr::SMin(a, b) => {
                a.collect_values(out);
                b.collect_values(out);
            }
        }
    }

    /// Emit instructions computing the expression; returns the result operand
    pub fn expand(&self, func: &mut Function, out: &mut Vec<IrInstruction>) -> Operand {
        let (op, lhs, rhs) = match self {
            SymExpr::Const(c) => return Operand::Const(*c),
            SymExpr::Value(op) => return *op,
            SymExpr::Add(a, b) => (BinOp::Add, a.expand(func, out), b.expand(func, out)),
            SymExpr::Mul(a, b) => (BinOp::Mul, a.expand(func, out), b.expand(func, out)),
            SymExpr::SDiv(a, d) => (BinOp::SDiv, a.expand(func, out), Operand::Const(*d)),
            SymExpr::SMax(a, b) => (BinOp::SMax, a.expand(func, out), b.expand(func, out)),
            SymExpr::SMin(a, b) => (BinOp::SMin, a.expand(func, out), b.expand(func, out)),
        };
        let dst = func.new_reg();
        out.push(IrInstruction::new(IrOp::Bin { dst, op, lhs, rhs }));
        Operand::Reg(dst)
    }
}

/// Affine recurrence `start + k * step` for iteration `k` of a loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRec {
    /// Value in the first iteration
    pub start: SymExpr,
    /// Increment per iteration
    pub step: SymExpr,
}

impl AddRec {
    /// Loop-invariant value
    pub fn invariant(value: SymExpr) -> Self {
        Self {
            start: value,
            step: SymExpr::Const(0),
        }
    }

    /// Whether the value does not change across iterations
    pub fn is_invariant(&self) -> bool {
        self.step.as_const() == Some(0)
    }

    /// Value in iteration `k`
    pub fn at(&self, k: SymExpr) -> SymExpr {
        SymExpr::add(self.start.clone(), SymExpr::mul(self.step.clone(), k))
    }

    /// `self + other`
    pub fn add(&self, other: &AddRec) -> AddRec {
        AddRec {
            start: SymExpr::add(self.start.clone(), other.start.clone()),
            step: SymExpr::add(self.step.clone(), other.step.clone()),
        }
    }

    /// `self * factor` for a loop-invariant factor
    pub fn scale(&self, factor: SymExpr) -> AddRec {
        AddRec {
            start: SymExpr::mul(self.start.clone(), factor.clone()),
            step: SymExpr::mul(self.step.clone(), factor),
        }
    }

    /// `(min, max)` over iterations `0..=backedge_count`
    ///
    /// A constant step orders the endpoints statically; a symbolic step
    /// takes the signed minimum and maximum of both. Returns `None` when the
    /// last endpoint folds to a constant that overflows `i64`.
    pub fn range(&self, backedge_count: &SymExpr) -> Option<(SymExpr, SymExpr)> {
        let first = self.start.clone();
        let span = match (self.step.as_const(), backedge_count.as_const()) {
            (Some(step), Some(count)) => SymExpr::Const(step.checked_mul(count)?),
            _ => SymExpr::mul(self.step.clone(), backedge_count.clone()),
        };
        let last = match (first.as_const(), span.as_const()) {
            (Some(start), Some(span)) => SymExpr::Const(start.checked_add(span)?),
            _ => SymExpr::add(first.clone(), span),
        };
        Some(match self.step.as_const() {
            Some(step) if step >= 0 => (first, last),
            Some(_) => (last, first),
            None => (
                SymExpr::smin(first.clone(), last.clone()),
                SymExpr::smax(first, last),
            ),
        })
    }
}
