//! Debug utilities for instrumented modules
//!
//! Text dumps of the IR before and after instrumentation.

use super::ir::{BinOp, Callee, CmpPred, Function, IrOp, Module, Operand};
use std::fmt::Write;

/// Print a module in human-readable format
pub fn dump_module(module: &Module) {
    println!("═══════════════════════════════════════════════════════════");
    println!("                    IR DUMP: {}", module.name);
    println!("═══════════════════════════════════════════════════════════");
    print!("{}", format_module(module));
    println!("═══════════════════════════════════════════════════════════\n");
}

/// Render a module as text
pub fn format_module(module: &Module) -> String {
    let mut out = String::new();
    for (idx, global) in module.globals.iter().enumerate() {
        let _ = writeln!(
            out,
            "@g{} = {}global {} [{} bytes]",
            idx,
            if global.constant { "constant " } else { "" },
            global.name,
            global.size
        );
    }
    let names = |ids: &[super::ir::FuncId]| -> Vec<String> {
        ids.iter()
            .map(|id| {
                module
                    .function(*id)
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| format!("#{}", id.0))
            })
            .collect()
    };
    if !module.ctors.is_empty() {
        let _ = writeln!(out, "ctors: {}", names(&module.ctors).join(", "));
    }
    if !module.dtors.is_empty() {
        let _ = writeln!(out, "dtors: {}", names(&module.dtors).join(", "));
    }
    for (idx, func) in module.functions.iter().enumerate() {
        let _ = writeln!(out);
        let _ = write!(out, "@f{} = ", idx);
        out.push_str(&format_function(module, func));
    }
    out
}

/// Render one function
pub fn format_function(module: &Module, func: &Function) -> String {
    let mut out = String::new();
    let params: Vec<String> = func
        .params
        .iter()
        .map(|p| format!("{}{}", if p.is_pointer { "ptr " } else { "" }, p.reg))
        .collect();
    let keyword = if func.is_declaration() {
        "declare"
    } else if func.is_kernel {
        "kernel"
    } else {
        "define"
    };
    let _ = writeln!(out, "{} {}({})", keyword, func.name, params.join(", "));
    for block in &func.blocks {
        let _ = writeln!(out, "{} ({}):", block.id, block.label);
        for (idx, inst) in block.instructions.iter().enumerate() {
            let line = format_op(module, &inst.op);
            match &inst.loc {
                Some(loc) => {
                    let _ = writeln!(out, "  {:04}: {:<60} ; {}:{}:{}", idx, line, loc.file, loc.line, loc.column);
                }
                None => {
                    let _ = writeln!(out, "  {:04}: {}", idx, line);
                }
            }
        }
    }
    out
}

fn join(ops: &[Operand]) -> String {
    ops.iter().map(|op| op.to_string()).collect::<Vec<_>>().join(", ")
}

fn bin_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::SDiv => "sdiv",
        BinOp::UDiv => "udiv",
        BinOp::SRem => "srem",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Xor => "xor",
        BinOp::Shl => "shl",
        BinOp::LShr => "lshr",
        BinOp::AShr => "ashr",
        BinOp::SMin => "smin",
        BinOp::SMax => "smax",
        BinOp::UMin => "umin",
        BinOp::UMax => "umax",
    }
}

fn cmp_name(pred: CmpPred) -> &'static str {
    match pred {
        CmpPred::Eq => "eq",
        CmpPred::Ne => "ne",
        CmpPred::Slt => "slt",
        CmpPred::Sle => "sle",
        CmpPred::Sgt => "sgt",
        CmpPred::Sge => "sge",
        CmpPred::Ult => "ult",
        CmpPred::Ule => "ule",
        CmpPred::Ugt => "ugt",
        CmpPred::Uge => "uge",
    }
}

/// Format a single operation
pub fn format_op(module: &Module, op: &IrOp) -> String {
    match op {
        IrOp::Alloca { dst, size } => format!("{} = alloca {}", dst, size),
        IrOp::Load { dst, ptr, size } => format!("{} = load.{} [{}]", dst, size, ptr),
        IrOp::Store { ptr, value, size } => format!("store.{} [{}], {}", size, ptr, value),
        IrOp::Gep { dst, base, offset } => format!("{} = gep {}, {}", dst, base, offset),
        IrOp::Bin { dst, op, lhs, rhs } => format!("{} = {} {}, {}", dst, bin_name(*op), lhs, rhs),
        IrOp::Cmp {
            dst,
            pred,
            lhs,
            rhs,
        } => format!("{} = cmp {} {}, {}", dst, cmp_name(*pred), lhs, rhs),
        IrOp::Select {
            dst,
            cond,
            if_true,
            if_false,
        } => format!("{} = select {}, {}, {}", dst, cond, if_true, if_false),
        IrOp::Copy { dst, src } => format!("{} = {}", dst, src),
        IrOp::Phi { dst, incoming } => {
            let edges: Vec<String> = incoming
                .iter()
                .map(|(block, value)| format!("[{}, {}]", block, value))
                .collect();
            format!("{} = phi {}", dst, edges.join(", "))
        }
        IrOp::Call { dst, callee, args } => {
            let target = match callee {
                Callee::Direct(id) => module
                    .function(*id)
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| format!("@f{}", id.0)),
                Callee::Indirect(op) => format!("*{}", op),
            };
            match dst {
                Some(d) => format!("{} = call {}({})", d, target, join(args)),
                None => format!("call {}({})", target, join(args)),
            }
        }
        IrOp::Intrinsic {
            dst,
            intrinsic,
            args,
        } => match dst {
            Some(d) => format!("{} = {:?}({})", d, intrinsic, join(args)),
            None => format!("{:?}({})", intrinsic, join(args)),
        },
        IrOp::Runtime { dsts, entry, args } => {
            let results: Vec<String> = dsts.iter().map(|d| d.to_string()).collect();
            if results.is_empty() {
                format!("{}({})", entry.symbol(), join(args))
            } else {
                format!("{} = {}({})", results.join(", "), entry.symbol(), join(args))
            }
        }
        IrOp::Jump(target) => format!("br {}", target),
        IrOp::Branch {
            cond,
            then_block,
            else_block,
        } => format!("br {}, {}, {}", cond, then_block, else_block),
        IrOp::Return(value) => match value {
            Some(v) => format!("ret {}", v),
            None => "ret".to_string(),
        },
    }
}
