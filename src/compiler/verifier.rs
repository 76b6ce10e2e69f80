//! # IR Module Verifier
//!
//! Structural checks run on modules before and after instrumentation.
//! A module that fails here would make the analyses draw wrong conclusions,
//! so the pass refuses to touch it.

use super::analysis::{HostAnalysis, IrAnalysis};
use super::ir::{BlockId, Callee, Function, IrOp, IrReg, Module, Operand};
use std::collections::HashSet;

/// Verification result with warnings
#[derive(Debug)]
pub struct VerifyResult {
    /// Module is well formed
    pub valid: bool,
    /// Errors that make the module unusable
    pub errors: Vec<VerifyError>,
    /// Warnings (non-fatal)
    pub warnings: Vec<String>,
    /// Statistics
    pub stats: ModuleStats,
}

/// Module statistics
#[derive(Debug, Default)]
pub struct ModuleStats {
    /// Function definitions
    pub functions: usize,
    /// Basic blocks over all definitions
    pub blocks: usize,
    /// Instructions over all definitions
    pub instructions: usize,
    /// Loads and stores
    pub memory_accesses: usize,
    /// Calls into the sanitizer runtime
    pub runtime_calls: usize,
}

/// Verification error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Block does not end in a terminator
    MissingTerminator {
        /// Function name
        function: String,
        /// Offending block
        block: u32,
    },

    /// Terminator before the end of a block
    TerminatorNotLast {
        /// Function name
        function: String,
        /// Offending block
        block: u32,
        /// Index of the early terminator
        index: usize,
    },

    /// Branch to a block that does not exist
    UnknownBlock {
        /// Function name
        function: String,
        /// Missing target
        target: u32,
    },

    /// Register defined more than once
    DuplicateDefinition {
        /// Function name
        function: String,
        /// Register
        reg: IrReg,
    },

    /// Register used but never defined
    UndefinedRegister {
        /// Function name
        function: String,
        /// Register
        reg: IrReg,
    },

    /// Use not dominated by its definition
    UseNotDominated {
        /// Function name
        function: String,
        /// Block of the use
        block: u32,
        /// Index of the use
        index: usize,
        /// Register
        reg: IrReg,
    },

    /// Phi after a non-phi instruction
    MisplacedPhi {
        /// Function name
        function: String,
        /// Block
        block: u32,
    },

    /// Phi edges do not match the block's predecessors
    PhiPredecessorMismatch {
        /// Function name
        function: String,
        /// Block
        block: u32,
    },

    /// Call to a function id outside the module
    UnknownCallee {
        /// Calling function
        function: String,
        /// Missing callee id
        callee: u32,
    },

    /// Reference to a global id outside the module
    UnknownGlobal {
        /// Function name
        function: String,
        /// Missing global id
        global: u32,
    },

    /// Wrong number of arguments
    ArityMismatch {
        /// Calling function
        function: String,
        /// Callee or runtime symbol
        callee: String,
        /// Parameters the callee takes
        expected: usize,
        /// Arguments passed
        found: usize,
    },

    /// Constructor or destructor id outside the module
    UnknownInitializer {
        /// Missing id
        id: u32,
    },
}

impl VerifyError {
    /// Function the error was found in, if any
    pub fn function(&self) -> Option<&str> {
        match self {
            VerifyError::MissingTerminator { function, .. }
            | VerifyError::TerminatorNotLast { function, .. }
            | VerifyError::UnknownBlock { function, .. }
            | VerifyError::DuplicateDefinition { function, .. }
            | VerifyError::UndefinedRegister { function, .. }
            | VerifyError::UseNotDominated { function, .. }
            | VerifyError::MisplacedPhi { function, .. }
            | VerifyError::PhiPredecessorMismatch { function, .. }
            | VerifyError::UnknownCallee { function, .. }
            | VerifyError::UnknownGlobal { function, .. }
            | VerifyError::ArityMismatch { function, .. } => Some(function),
            VerifyError::UnknownInitializer { .. } => None,
        }
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::MissingTerminator { function, block } => {
                write!(f, "{}: block {} has no terminator", function, block)
            }
            VerifyError::TerminatorNotLast {
                function,
                block,
                index,
            } => write!(
                f,
                "{}: terminator at {} is not the last instruction of block {}",
                function, index, block
            ),
            VerifyError::UnknownBlock { function, target } => {
                write!(f, "{}: branch to unknown block {}", function, target)
            }
            VerifyError::DuplicateDefinition { function, reg } => {
                write!(f, "{}: {} defined more than once", function, reg)
            }
            VerifyError::UndefinedRegister { function, reg } => {
                write!(f, "{}: {} used but never defined", function, reg)
            }
            VerifyError::UseNotDominated {
                function,
                block,
                index,
                reg,
            } => write!(
                f,
                "{}: use of {} at {}:{} is not dominated by its definition",
                function, reg, block, index
            ),
            VerifyError::MisplacedPhi { function, block } => {
                write!(f, "{}: phi after non-phi in block {}", function, block)
            }
            VerifyError::PhiPredecessorMismatch { function, block } => write!(
                f,
                "{}: phi edges in block {} do not match its predecessors",
                function, block
            ),
            VerifyError::UnknownCallee { function, callee } => {
                write!(f, "{}: call to unknown function #{}", function, callee)
            }
            VerifyError::UnknownGlobal { function, global } => {
                write!(f, "{}: reference to unknown global #{}", function, global)
            }
            VerifyError::ArityMismatch {
                function,
                callee,
                expected,
                found,
            } => write!(
                f,
                "{}: {} takes {} arguments, {} given",
                function, callee, expected, found
            ),
            VerifyError::UnknownInitializer { id } => {
                write!(f, "initializer #{} is not a function of the module", id)
            }
        }
    }
}

/// IR module verifier
pub struct Verifier {
    /// Treat warnings as errors
    strict: bool,
}

impl Verifier {
    /// Verifier reporting unreachable code as a warning
    pub fn new() -> Self {
        Self { strict: false }
    }

    /// Enable strict mode
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Verify a whole module
    pub fn verify(&self, module: &Module) -> VerifyResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut stats = ModuleStats::default();

        for id in module.ctors.iter().chain(&module.dtors) {
            if module.function(*id).is_none() {
                errors.push(VerifyError::UnknownInitializer { id: id.0 });
            }
        }

        for func in &module.functions {
            if func.is_declaration() {
                continue;
            }
            stats.functions += 1;
            stats.blocks += func.blocks.len();
            for inst in func.instructions() {
                stats.instructions += 1;
                if inst.op.memory_access().is_some() {
                    stats.memory_accesses += 1;
                }
                if matches!(inst.op, IrOp::Runtime { .. }) {
                    stats.runtime_calls += 1;
                }
            }
            self.verify_function(module, func, &mut errors, &mut warnings);
        }

        let valid = errors.is_empty() && (!self.strict || warnings.is_empty());
        VerifyResult {
            valid,
            errors,
            warnings,
            stats,
        }
    }

    fn verify_function(
        &self,
        module: &Module,
        func: &Function,
        errors: &mut Vec<VerifyError>,
        warnings: &mut Vec<String>,
    ) {
        let name = || func.name.clone();
        let block_count = func.blocks.len() as u32;
        let before = errors.len();

        // Shape first: the dominance checks below assume a sound CFG.
        for block in &func.blocks {
            match block.instructions.last() {
                Some(inst) if inst.op.is_terminator() => {}
                _ => errors.push(VerifyError::MissingTerminator {
                    function: name(),
                    block: block.id.0,
                }),
            }
            let mut seen_non_phi = false;
            for (index, inst) in block.instructions.iter().enumerate() {
                if inst.op.is_terminator() && index + 1 != block.instructions.len() {
                    errors.push(VerifyError::TerminatorNotLast {
                        function: name(),
                        block: block.id.0,
                        index,
                    });
                }
                match &inst.op {
                    IrOp::Phi { .. } if seen_non_phi => errors.push(VerifyError::MisplacedPhi {
                        function: name(),
                        block: block.id.0,
                    }),
                    IrOp::Phi { .. } => {}
                    _ => seen_non_phi = true,
                }
                for target in inst.op.successors() {
                    if target.0 >= block_count {
                        errors.push(VerifyError::UnknownBlock {
                            function: name(),
                            target: target.0,
                        });
                    }
                }
                self.verify_references(module, func, &inst.op, errors);
            }
        }

        let mut defined: HashSet<IrReg> = func.params.iter().map(|p| p.reg).collect();
        for inst in func.instructions() {
            for reg in inst.op.defs() {
                if !defined.insert(reg) {
                    errors.push(VerifyError::DuplicateDefinition {
                        function: name(),
                        reg,
                    });
                }
            }
        }
        if errors.len() > before {
            return;
        }

        let analysis = IrAnalysis::new(func);
        for block in &func.blocks {
            if !analysis.is_reachable(block.id) {
                if block.id != func.entry() {
                    warnings.push(format!(
                        "{}: block {} ({}) is unreachable",
                        func.name, block.id.0, block.label
                    ));
                }
                continue;
            }
            for (index, inst) in block.instructions.iter().enumerate() {
                if let IrOp::Phi { incoming, .. } = &inst.op {
                    let mut edges: Vec<BlockId> = incoming.iter().map(|(b, _)| *b).collect();
                    let mut preds: Vec<BlockId> = analysis
                        .predecessors(block.id)
                        .iter()
                        .copied()
                        .filter(|p| analysis.is_reachable(*p))
                        .collect();
                    edges.retain(|b| analysis.is_reachable(*b));
                    edges.sort();
                    edges.dedup();
                    preds.sort();
                    preds.dedup();
                    if edges != preds {
                        errors.push(VerifyError::PhiPredecessorMismatch {
                            function: name(),
                            block: block.id.0,
                        });
                    }
                    for (pred, value) in incoming {
                        if !analysis.is_reachable(*pred) {
                            continue;
                        }
                        let end = func.block(*pred).map(|b| b.instructions.len()).unwrap_or(0);
                        self.verify_use(func, &analysis, &defined, *value, *pred, end, errors);
                    }
                    continue;
                }
                for op in inst.op.operands() {
                    self.verify_use(func, &analysis, &defined, op, block.id, index, errors);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_use(
        &self,
        func: &Function,
        analysis: &IrAnalysis<'_>,
        defined: &HashSet<IrReg>,
        op: Operand,
        block: BlockId,
        index: usize,
        errors: &mut Vec<VerifyError>,
    ) {
        let Operand::Reg(reg) = op else {
            return;
        };
        if !defined.contains(&reg) {
            errors.push(VerifyError::UndefinedRegister {
                function: func.name.clone(),
                reg,
            });
        } else if !analysis.is_available(op, block, index) {
            errors.push(VerifyError::UseNotDominated {
                function: func.name.clone(),
                block: block.0,
                index,
                reg,
            });
        }
    }

    fn verify_references(
        &self,
        module: &Module,
        func: &Function,
        op: &IrOp,
        errors: &mut Vec<VerifyError>,
    ) {
        for operand in op.operands() {
            match operand {
                Operand::Global(g) if module.global(g).is_none() => {
                    errors.push(VerifyError::UnknownGlobal {
                        function: func.name.clone(),
                        global: g.0,
                    })
                }
                Operand::Func(f) if module.function(f).is_none() => {
                    errors.push(VerifyError::UnknownCallee {
                        function: func.name.clone(),
                        callee: f.0,
                    })
                }
                _ => {}
            }
        }
        match op {
            IrOp::Call {
                callee: Callee::Direct(id),
                args,
                ..
            } => match module.function(*id) {
                Some(callee) if callee.params.len() != args.len() => {
                    errors.push(VerifyError::ArityMismatch {
                        function: func.name.clone(),
                        callee: callee.name.clone(),
                        expected: callee.params.len(),
                        found: args.len(),
                    })
                }
                Some(_) => {}
                None => errors.push(VerifyError::UnknownCallee {
                    function: func.name.clone(),
                    callee: id.0,
                }),
            },
            IrOp::Runtime { dsts, entry, args } => {
                if args.len() != entry.arg_count() {
                    errors.push(VerifyError::ArityMismatch {
                        function: func.name.clone(),
                        callee: entry.symbol(),
                        expected: entry.arg_count(),
                        found: args.len(),
                    });
                }
                if dsts.len() != entry.result_count() {
                    errors.push(VerifyError::ArityMismatch {
                        function: func.name.clone(),
                        callee: format!("{} results", entry.symbol()),
                        expected: entry.result_count(),
                        found: dsts.len(),
                    });
                }
            }
            _ => {}
        }
    }
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{FuncId, FunctionBuilder, IrInstruction};

    fn single(func: Function) -> Module {
        let mut module = Module::new("m");
        module.add_function(func);
        module
    }

    #[test]
    fn test_empty_module() {
        let result = Verifier::new().verify(&Module::new("m"));
        assert!(result.valid);
        assert_eq!(result.stats.functions, 0);
    }

    #[test]
    fn test_simple_valid_function() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let p = b.param(true);
        let x = b.load(p, 4);
        b.store(p, x, 4);
        b.ret(None);
        let result = Verifier::new().verify(&single(b.finish()));
        assert!(result.valid, "Errors: {:?}", result.errors);
        assert_eq!(result.stats.memory_accesses, 2);
    }

    #[test]
    fn test_missing_terminator() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        b.alloca(4);
        let result = Verifier::new().verify(&single(b.finish()));
        assert!(!result.valid);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::MissingTerminator { .. })));
    }

    #[test]
    fn test_use_before_definition() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        b.ret(None);
        let mut func = b.finish();
        let ghost = func.new_reg();
        let dst = func.new_reg();
        func.blocks[0].instructions.insert(
            0,
            IrInstruction::new(IrOp::Copy {
                dst,
                src: Operand::Reg(ghost),
            }),
        );
        let result = Verifier::new().verify(&single(func));
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::UndefinedRegister { .. })));
    }

    #[test]
    fn test_use_not_dominated() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let c = b.param(false);
        let left = b.block("left");
        let right = b.block("right");
        b.branch(c, left, right);
        b.switch_to(left);
        let x = b.add(c, 1i64);
        b.ret(None);
        b.switch_to(right);
        b.copy(x);
        b.ret(None);
        let result = Verifier::new().verify(&single(b.finish()));
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::UseNotDominated { .. })));
    }

    #[test]
    fn test_call_arity() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        b.call_void(FuncId(1), vec![Operand::Const(1)]);
        b.ret(None);
        let mut module = single(b.finish());
        module.add_function(Function::declaration("ext", &[true, false]));
        let result = Verifier::new().verify(&module);
        let err = result
            .errors
            .iter()
            .find(|e| matches!(e, VerifyError::ArityMismatch { .. }))
            .unwrap();
        assert_eq!(err.function(), Some("k"));
        assert!(err.to_string().contains("takes 2 arguments"));
    }

    #[test]
    fn test_unreachable_block_warns() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        b.ret(None);
        let dead = b.block("dead");
        b.switch_to(dead);
        b.ret(None);
        let module = single(b.finish());
        let result = Verifier::new().verify(&module);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert!(!Verifier::new().strict().verify(&module).valid);
    }
}
