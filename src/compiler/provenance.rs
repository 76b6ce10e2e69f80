//! Pointer provenance classification
//!
//! Every pointer operand the pass instruments is mapped to the
//! [`AllocationKind`] of the memory it may point into. The answer decides
//! which runtime entry point checks the access: kind-specific ones for
//! `Local` and `Global`, the dispatching ones for `Unknown`, none at all for
//! `System`.

use super::analysis::{HostAnalysis, UnderlyingObject};
use super::ir::{FuncId, Module, Operand};
use crate::runtime::AllocationKind;
use std::collections::HashMap;

/// Classification of one pointer operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    /// Storage class of the pointee
    pub kind: AllocationKind,
    /// The single underlying object, when there is exactly one
    pub object: Option<UnderlyingObject>,
}

/// Memoising classifier for one module
#[derive(Debug)]
pub struct ProvenanceClassifier {
    module_has_allocas: bool,
    track_globals: bool,
    kernels: Vec<bool>,
    callee_names: Vec<String>,
    cache: HashMap<(FuncId, UnderlyingObject), AllocationKind>,
}

impl ProvenanceClassifier {
    /// Classifier for `module`; untracked globals are treated as runtime memory
    pub fn new(module: &Module, track_globals: bool) -> Self {
        Self {
            module_has_allocas: module.has_allocas(),
            track_globals,
            kernels: module.functions.iter().map(|f| f.is_kernel).collect(),
            callee_names: module.functions.iter().map(|f| f.name.clone()).collect(),
            cache: HashMap::new(),
        }
    }

    /// Kind assumed for objects the classifier cannot see through
    pub fn fallback(&self) -> AllocationKind {
        if self.module_has_allocas {
            AllocationKind::Unknown
        } else {
            AllocationKind::Global
        }
    }

    /// Classify the pointer `ptr` used in function `func`
    pub fn classify(
        &mut self,
        func: FuncId,
        analysis: &dyn HostAnalysis,
        ptr: Operand,
    ) -> Provenance {
        let objects = analysis.underlying_objects(ptr);
        let mut kind: Option<AllocationKind> = None;
        for object in &objects {
            let object_kind = self.classify_object(func, *object);
            if object_kind == AllocationKind::System {
                return Provenance {
                    kind: AllocationKind::System,
                    object: None,
                };
            }
            kind = match kind {
                None => Some(object_kind),
                Some(k) if k == object_kind => Some(k),
                Some(_) => Some(AllocationKind::Unknown),
            };
        }
        let kind = kind.unwrap_or(AllocationKind::Unknown);
        let object = match objects.as_slice() {
            [single] if kind.is_tracked() => Some(*single),
            _ => None,
        };
        tracing::trace!(func = func.0, ?ptr, %kind, objects = objects.len(), "classified pointer");
        Provenance { kind, object }
    }

    /// Classify one underlying object
    pub fn classify_object(&mut self, func: FuncId, object: UnderlyingObject) -> AllocationKind {
        if let Some(kind) = self.cache.get(&(func, object)) {
            return *kind;
        }
        let kind = match object {
            UnderlyingObject::Alloca(_) => AllocationKind::Local,
            UnderlyingObject::Global(_) if self.track_globals => AllocationKind::Global,
            UnderlyingObject::Global(_) => AllocationKind::System,
            UnderlyingObject::Intrinsic(intrinsic) if intrinsic.yields_system_pointer() => {
                AllocationKind::System
            }
            UnderlyingObject::Argument(_) if self.is_kernel(func) => AllocationKind::Global,
            UnderlyingObject::Runtime { entry, .. } => {
                entry.kind().unwrap_or_else(|| self.fallback())
            }
            UnderlyingObject::CallResult {
                callee: Some(callee),
                ..
            } => self
                .callee_names
                .get(callee.index())
                .and_then(|name| runtime_call_kind(name))
                .unwrap_or_else(|| self.fallback()),
            _ => self.fallback(),
        };
        self.cache.insert((func, object), kind);
        kind
    }

    fn is_kernel(&self, func: FuncId) -> bool {
        self.kernels.get(func.index()).copied().unwrap_or(false)
    }
}

/// Kind of the pointer returned by a runtime-provided allocation function
fn runtime_call_kind(name: &str) -> Option<AllocationKind> {
    if name.starts_with("__gpusan_") || name.starts_with("ompx_") {
        AllocationKind::from_symbol(name)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::analysis::IrAnalysis;
    use crate::compiler::ir::{Function, FunctionBuilder, GlobalVar, Intrinsic};

    fn module_with(func: Function, extra: Vec<Function>) -> Module {
        let mut module = Module::new("m");
        module.add_global(GlobalVar::zeroed("table", 64));
        module.add_function(func);
        for f in extra {
            module.add_function(f);
        }
        module
    }

    #[test]
    fn test_basic_kinds() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let arg = b.param(true);
        let stack = b.alloca(8);
        let sys = b.intrinsic(Intrinsic::ImplicitArgPtr);
        b.ret(None);
        let module = module_with(b.finish(), vec![]);
        let func = &module.functions[0];
        let analysis = IrAnalysis::new(func);
        let mut classifier = ProvenanceClassifier::new(&module, true);
        let id = FuncId(0);

        let p = classifier.classify(id, &analysis, Operand::Reg(stack));
        assert_eq!(p.kind, AllocationKind::Local);
        assert_eq!(p.object, Some(UnderlyingObject::Alloca(stack)));
        assert_eq!(
            classifier.classify(id, &analysis, Operand::Reg(arg)).kind,
            AllocationKind::Global
        );
        assert_eq!(
            classifier
                .classify(id, &analysis, Operand::Global(crate::compiler::ir::GlobalId(0)))
                .kind,
            AllocationKind::Global
        );
        assert_eq!(
            classifier.classify(id, &analysis, Operand::Reg(sys)).kind,
            AllocationKind::System
        );
    }

    #[test]
    fn test_mixed_objects_are_unknown() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let c = b.param(false);
        let arg = b.param(true);
        let stack = b.alloca(8);
        let either = b.select(c, stack, arg);
        b.ret(None);
        let module = module_with(b.finish(), vec![]);
        let analysis = IrAnalysis::new(&module.functions[0]);
        let mut classifier = ProvenanceClassifier::new(&module, true);

        let p = classifier.classify(FuncId(0), &analysis, Operand::Reg(either));
        assert_eq!(p.kind, AllocationKind::Unknown);
        assert_eq!(p.object, None);
    }

    #[test]
    fn test_device_function_argument_falls_back() {
        let mut b = FunctionBuilder::new("helper", "h.c");
        let arg = b.param(true);
        b.ret(None);
        let module = module_with(b.finish(), vec![]);
        let analysis = IrAnalysis::new(&module.functions[0]);
        let mut classifier = ProvenanceClassifier::new(&module, true);
        assert_eq!(classifier.fallback(), AllocationKind::Global);
        assert_eq!(
            classifier.classify(FuncId(0), &analysis, Operand::Reg(arg)).kind,
            AllocationKind::Global
        );

        let mut with_stack = FunctionBuilder::new("other", "h.c");
        with_stack.alloca(4);
        with_stack.ret(None);
        let module = module_with(module.functions[0].clone(), vec![with_stack.finish()]);
        let mut classifier = ProvenanceClassifier::new(&module, true);
        let analysis = IrAnalysis::new(&module.functions[0]);
        assert_eq!(
            classifier.classify(FuncId(0), &analysis, Operand::Reg(arg)).kind,
            AllocationKind::Unknown
        );
    }

    #[test]
    fn test_runtime_allocator_result() {
        let alloc = Function::declaration("__gpusan_malloc_global", &[false]);
        let mut b = FunctionBuilder::new("user", "u.c");
        b.alloca(4);
        let ptr = b.call(FuncId(1), vec![Operand::Const(32)]);
        b.ret(None);
        let module = module_with(b.finish(), vec![alloc]);
        let analysis = IrAnalysis::new(&module.functions[0]);
        let mut classifier = ProvenanceClassifier::new(&module, true);
        assert_eq!(
            classifier.classify(FuncId(0), &analysis, Operand::Reg(ptr)).kind,
            AllocationKind::Global
        );
    }

    #[test]
    fn test_untracked_globals_are_system() {
        let mut b = FunctionBuilder::kernel("k", "k.c");
        b.ret(None);
        let module = module_with(b.finish(), vec![]);
        let analysis = IrAnalysis::new(&module.functions[0]);
        let mut classifier = ProvenanceClassifier::new(&module, false);
        let g = Operand::Global(crate::compiler::ir::GlobalId(0));
        assert_eq!(
            classifier.classify(FuncId(0), &analysis, g).kind,
            AllocationKind::System
        );
    }
}
