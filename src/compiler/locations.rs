//! Source-location encoding for the instrumentation pass
//!
//! Each instrumented instruction gets a source id: the index of its location
//! record. Records chain through `inlined_at` scopes and, at the outermost
//! scope of a device function, to the location of the function's unique call
//! site. Functions with zero or several call sites, or whose address escapes,
//! get the ambiguous parent instead, and every call that may reach them is
//! registered as an ambiguous call so the runtime can track it in the
//! thread's call-site word.

use super::ir::{BlockId, Callee, DebugLoc, FuncId, IrOp, Module, Operand};
use crate::location::{
    call_site_bits, LocationRecord, LocationTable, AMBIGUOUS_PARENT, ROOT_PARENT, UNKNOWN_SOURCE,
};
use regex::Regex;
use std::collections::{HashMap, HashSet};

lazy_static::lazy_static! {
    static ref OFFLOAD_KERNEL: Regex = Regex::new(
        r"^__omp_offloading_[0-9a-fA-F]+_[0-9a-fA-F]+_(.+?)_l([0-9]+)(?:_debug__|_debug___omp_outlined_debug__)?$"
    )
    .expect("offload kernel pattern is valid");
}

/// Render compiler-generated function names the way users wrote them
///
/// `foo.internalized` becomes `foo (internalized)` and offloaded target
/// regions `__omp_offloading_<dev>_<file>_<fn>_l<line>` become
/// `omp target (<fn>:<line>)`.
pub fn prettify_function_name(name: &str) -> String {
    if let Some(base) = name.strip_suffix(".internalized") {
        return format!("{} (internalized)", base);
    }
    match OFFLOAD_KERNEL.captures(name) {
        Some(caps) => match caps[2].parse::<u64>() {
            Ok(line) if line > 0 => format!("omp target ({}:{})", &caps[1], line),
            _ => caps[1].to_string(),
        },
        None => name.to_string(),
    }
}

/// Position of a call instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    /// Calling function
    pub caller: FuncId,
    /// Block of the call
    pub block: BlockId,
    /// Index of the call in its block
    pub index: usize,
}

/// Direct callers and escaping addresses of every function
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    callers: Vec<Vec<CallSite>>,
    address_taken: Vec<bool>,
    indirect_calls: Vec<CallSite>,
}

impl CallGraph {
    /// Scan every function body of `module`
    pub fn build(module: &Module) -> Self {
        let n = module.functions.len();
        let mut graph = Self {
            callers: vec![Vec::new(); n],
            address_taken: vec![false; n],
            indirect_calls: Vec::new(),
        };
        for caller in module.function_ids() {
            let Some(func) = module.function(caller) else {
                continue;
            };
            for block in &func.blocks {
                for (index, inst) in block.instructions.iter().enumerate() {
                    let site = CallSite {
                        caller,
                        block: block.id,
                        index,
                    };
                    if let IrOp::Call { callee, .. } = &inst.op {
                        match callee {
                            Callee::Direct(f) => {
                                if let Some(list) = graph.callers.get_mut(f.index()) {
                                    list.push(site);
                                }
                            }
                            Callee::Indirect(_) => graph.indirect_calls.push(site),
                        }
                    }
                    for op in inst.op.operands() {
                        if let Operand::Func(f) = op {
                            if let Some(flag) = graph.address_taken.get_mut(f.index()) {
                                *flag = true;
                            }
                        }
                    }
                }
            }
        }
        graph
    }

    /// Direct call sites of `func`
    pub fn callers(&self, func: FuncId) -> &[CallSite] {
        self.callers.get(func.index()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the address of `func` is used as a value
    pub fn is_address_taken(&self, func: FuncId) -> bool {
        self.address_taken.get(func.index()).copied().unwrap_or(false)
    }

    /// Calls through function pointers
    pub fn indirect_calls(&self) -> &[CallSite] {
        &self.indirect_calls
    }
}

/// Deduplicating location table writer
#[derive(Debug, Default)]
pub struct LocationEncoder {
    records: Vec<LocationRecord>,
    strings: Vec<u8>,
    interned: HashMap<String, u64>,
    dedup: HashMap<LocationRecord, i64>,
    ambiguous_calls: Vec<i64>,
}

impl LocationEncoder {
    /// Empty encoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of `s` in the string pool, adding it on first use
    pub fn intern(&mut self, s: &str) -> u64 {
        if let Some(offset) = self.interned.get(s) {
            return *offset;
        }
        let offset = self.strings.len() as u64;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        self.interned.insert(s.to_string(), offset);
        offset
    }

    /// Index of `loc`; the outermost scope chains to `function_parent`
    pub fn encode(&mut self, loc: &DebugLoc, function_parent: i64) -> i64 {
        let parent = match &loc.inlined_at {
            Some(call_site) => self.encode(call_site, function_parent),
            None => function_parent,
        };
        let record = LocationRecord {
            function: self.intern(&prettify_function_name(&loc.function)),
            file: self.intern(&loc.file),
            line: u64::from(loc.line),
            column: u64::from(loc.column),
            parent,
        };
        if let Some(index) = self.dedup.get(&record) {
            return *index;
        }
        let index = self.records.len() as i64;
        self.records.push(record);
        self.dedup.insert(record, index);
        index
    }

    /// Register an ambiguous call located at `location`; returns its call index
    pub fn add_ambiguous_call(&mut self, location: i64) -> u32 {
        self.ambiguous_calls.push(location);
        (self.ambiguous_calls.len() - 1) as u32
    }

    /// Number of records so far
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was encoded yet
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bits per call-site entry for the calls registered so far
    pub fn call_site_bits(&self) -> u32 {
        call_site_bits(self.ambiguous_calls.len())
    }

    /// Finished table
    pub fn finish(self) -> LocationTable {
        LocationTable::new(self.records, self.strings, self.ambiguous_calls)
    }
}

/// Source ids and ambiguous call indices for one module
#[derive(Debug)]
pub struct SourceMap {
    encoder: LocationEncoder,
    parents: HashMap<FuncId, i64>,
    ambiguous: HashMap<CallSite, u32>,
    bits: u32,
}

impl SourceMap {
    /// Resolve function parents and ambiguous calls of the functions in `instrumented`
    pub fn build(module: &Module, graph: &CallGraph, instrumented: &[FuncId]) -> Self {
        let mut map = Self {
            encoder: LocationEncoder::new(),
            parents: HashMap::new(),
            ambiguous: HashMap::new(),
            bits: 0,
        };
        let mut visiting = HashSet::new();
        for &func in instrumented {
            map.parent_of(module, graph, func, &mut visiting);
        }

        let targets: HashSet<FuncId> = instrumented.iter().copied().collect();
        for &caller in instrumented {
            let Some(func) = module.function(caller) else {
                continue;
            };
            for block in &func.blocks {
                for (index, inst) in block.instructions.iter().enumerate() {
                    let ambiguous = match &inst.op {
                        IrOp::Call {
                            callee: Callee::Direct(f),
                            ..
                        } => targets.contains(f) && map.parents.get(f) == Some(&AMBIGUOUS_PARENT),
                        IrOp::Call {
                            callee: Callee::Indirect(_),
                            ..
                        } => true,
                        _ => false,
                    };
                    if ambiguous {
                        let parent = map.function_parent(caller);
                        let location = match &inst.loc {
                            Some(loc) => map.encoder.encode(loc, parent),
                            None => UNKNOWN_SOURCE,
                        };
                        let call = map.encoder.add_ambiguous_call(location);
                        let site = CallSite {
                            caller,
                            block: block.id,
                            index,
                        };
                        map.ambiguous.insert(site, call);
                    }
                }
            }
        }
        map.bits = map.encoder.call_site_bits();
        tracing::debug!(
            functions = instrumented.len(),
            ambiguous_calls = map.ambiguous.len(),
            bits = map.bits,
            "resolved call-site parents"
        );
        map
    }

    fn parent_of(
        &mut self,
        module: &Module,
        graph: &CallGraph,
        func: FuncId,
        visiting: &mut HashSet<FuncId>,
    ) -> i64 {
        if let Some(parent) = self.parents.get(&func) {
            return *parent;
        }
        let is_kernel = module.function(func).map(|f| f.is_kernel).unwrap_or(false);
        let parent = if is_kernel {
            ROOT_PARENT
        } else if graph.is_address_taken(func) {
            AMBIGUOUS_PARENT
        } else {
            match graph.callers(func) {
                [] => ROOT_PARENT,
                [site] => {
                    if !visiting.insert(func) {
                        return AMBIGUOUS_PARENT;
                    }
                    let caller_parent = self.parent_of(module, graph, site.caller, visiting);
                    visiting.remove(&func);
                    let call_loc = module
                        .function(site.caller)
                        .and_then(|f| f.block(site.block))
                        .and_then(|b| b.instructions.get(site.index))
                        .and_then(|inst| inst.loc.as_ref());
                    match call_loc {
                        Some(loc) => self.encoder.encode(loc, caller_parent),
                        None => caller_parent,
                    }
                }
                _ => AMBIGUOUS_PARENT,
            }
        };
        self.parents.insert(func, parent);
        parent
    }

    /// Parent of the outermost scope of `func`
    pub fn function_parent(&self, func: FuncId) -> i64 {
        self.parents.get(&func).copied().unwrap_or(ROOT_PARENT)
    }

    /// Source id of an instruction of `func`
    pub fn source_id(&mut self, func: FuncId, loc: Option<&DebugLoc>) -> i64 {
        match loc {
            Some(loc) => {
                let parent = self.function_parent(func);
                self.encoder.encode(loc, parent)
            }
            None => UNKNOWN_SOURCE,
        }
    }

    /// Call index of an ambiguous call
    pub fn ambiguous_call(&self, site: CallSite) -> Option<u32> {
        self.ambiguous.get(&site).copied()
    }

    /// Number of ambiguous calls
    pub fn ambiguous_count(&self) -> usize {
        self.ambiguous.len()
    }

    /// Bits per call-site entry
    pub fn call_site_bits(&self) -> u32 {
        self.bits
    }

    /// Finished location table
    pub fn finish(self) -> LocationTable {
        self.encoder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{Function, FunctionBuilder};

    #[test]
    fn test_prettify() {
        assert_eq!(prettify_function_name("foo.internalized"), "foo (internalized)");
        assert_eq!(
            prettify_function_name("__omp_offloading_10302_bd8a2c_foo_l13"),
            "omp target (foo:13)"
        );
        assert_eq!(
            prettify_function_name("__omp_offloading_10302_bd8a2c_my_kernel_l7_debug__"),
            "omp target (my_kernel:7)"
        );
        assert_eq!(prettify_function_name("plain"), "plain");
    }

    #[test]
    fn test_encoder_dedups_and_interns() {
        let mut enc = LocationEncoder::new();
        let loc = DebugLoc::new("a.c", "f", 3, 4);
        let first = enc.encode(&loc, ROOT_PARENT);
        assert_eq!(enc.encode(&loc, ROOT_PARENT), first);
        let other_parent = enc.encode(&loc, AMBIGUOUS_PARENT);
        assert_ne!(other_parent, first);

        let inlined = DebugLoc::new("a.c", "g", 9, 1).inlined_into(loc.clone());
        let idx = enc.encode(&inlined, ROOT_PARENT);
        let table = enc.finish();
        assert_eq!(table.records()[idx as usize].parent, first);
        assert_eq!(table.strings(), b"f\0a.c\0g\0");
    }

    fn call_chain(helper_calls: usize) -> Module {
        let mut module = Module::new("m");
        let helper_id = FuncId(1);
        let mut k = FunctionBuilder::kernel("k", "k.c");
        for line in 0..helper_calls {
            k.at(10 + line as u32, 3);
            k.call_void(helper_id, vec![]);
        }
        k.ret(None);
        module.add_function(k.finish());
        let mut h = FunctionBuilder::new("helper", "k.c");
        h.at(2, 1);
        h.ret(None);
        module.add_function(h.finish());
        module
    }

    #[test]
    fn test_unique_caller_becomes_parent() {
        let module = call_chain(1);
        let graph = CallGraph::build(&module);
        let mut map = SourceMap::build(&module, &graph, &[FuncId(0), FuncId(1)]);
        assert_eq!(map.ambiguous_count(), 0);
        let parent = map.function_parent(FuncId(1));
        assert!(parent >= 0);

        let loc = module.functions[1].blocks[0].instructions[0].loc.clone();
        let id = map.source_id(FuncId(1), loc.as_ref());
        let table = map.finish();
        let frames = table.resolve(id, 0);
        let names: Vec<&str> = frames.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, vec!["helper", "k"]);
    }

    #[test]
    fn test_multiple_callers_are_ambiguous() {
        let module = call_chain(2);
        let graph = CallGraph::build(&module);
        let mut map = SourceMap::build(&module, &graph, &[FuncId(0), FuncId(1)]);
        assert_eq!(map.function_parent(FuncId(1)), AMBIGUOUS_PARENT);
        assert_eq!(map.ambiguous_count(), 2);
        assert_eq!(map.call_site_bits(), 2);
        let second = CallSite {
            caller: FuncId(0),
            block: BlockId(0),
            index: 1,
        };
        assert_eq!(map.ambiguous_call(second), Some(1));

        let loc = module.functions[1].blocks[0].instructions[0].loc.clone();
        let id = map.source_id(FuncId(1), loc.as_ref());
        let table = map.finish();
        let word = crate::location::push_call_site(0, 1, table.call_site_bits());
        let frames = table.resolve(id, word);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].line, 11);
    }

    #[test]
    fn test_address_taken_is_ambiguous() {
        let mut module = Module::new("m");
        let mut k = FunctionBuilder::kernel("k", "k.c");
        k.call_indirect(Operand::Func(FuncId(1)), vec![]);
        k.ret(None);
        module.add_function(k.finish());
        let mut h = Function::new("cb");
        h.add_block("entry");
        module.add_function(h);
        let graph = CallGraph::build(&module);
        assert!(graph.is_address_taken(FuncId(1)));
        assert_eq!(graph.indirect_calls().len(), 1);
        let map = SourceMap::build(&module, &graph, &[FuncId(0), FuncId(1)]);
        assert_eq!(map.function_parent(FuncId(1)), AMBIGUOUS_PARENT);
        assert_eq!(map.ambiguous_count(), 1);
    }
}
