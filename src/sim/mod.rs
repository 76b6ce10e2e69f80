//! Kernel simulator
//!
//! Runs IR modules, instrumented or not, against a [`Device`] runtime and a
//! byte-addressed [`DeviceMemory`]. Grid launches execute one thread after the
//! other so that results are reproducible.
//!
//! ```text
//! sim/
//! ├── memory.rs       # heap regions, per-thread stacks, faults
//! └── interpreter.rs  # SSA interpreter, runtime entry dispatch
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let (mut sim, _report) = Simulator::instrumented(module, &options, config)?;
//! let buffer = sim.alloc_buffer(16)?;
//! sim.run_constructors()?;
//! let run = sim.run_kernel("fill", 4, &[buffer.pointer])?;
//! assert!(run.is_clean());
//! ```

pub mod interpreter;
pub mod memory;

pub use interpreter::{runtime_call, FUNCTION_BASE, MAX_CALL_DEPTH};
pub use memory::{DeviceMemory, HEAP_BASE, HEAP_GAP};

use crate::compiler::ir::{FuncId, Module};
use crate::compiler::{InstrumentOptions, InstrumentReport, Sanitizer};
use crate::config::SanitizerConfig;
use crate::error::{Error, Result};
use crate::location::LocationTable;
use crate::runtime::{Device, LaunchReport, LeakReport};
use interpreter::{Interpreter, Program};
use std::collections::HashMap;

/// Host implementation of an external device function
pub type ExternFn = fn(&mut DeviceMemory, &[u64]) -> Result<Option<u64>>;

/// Default instruction budget per thread
pub const DEFAULT_STEP_LIMIT: u64 = 10_000_000;
/// Size of the runtime-owned region behind the implicit argument pointers
pub const SYSTEM_ARGS_SIZE: u64 = 256;

/// Host buffer mapped into device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    /// Real address
    pub address: u64,
    /// Length in bytes
    pub length: u64,
    /// Value to hand to kernels: tracked for instrumented modules
    pub pointer: u64,
}

/// Result of one kernel launch
#[derive(Debug, Clone)]
pub struct KernelRun {
    /// Runtime view of the launch
    pub report: LaunchReport,
    /// Raw memory faults, per thread
    pub faults: Vec<(u32, Error)>,
    /// Instructions executed by all threads
    pub steps: u64,
}

impl KernelRun {
    /// Whether no thread trapped or faulted
    pub fn is_clean(&self) -> bool {
        self.report.is_clean() && self.faults.is_empty()
    }
}

/// Simulated device executing one module
pub struct Simulator {
    module: Module,
    device: Device,
    memory: DeviceMemory,
    globals: Vec<u64>,
    externs: HashMap<String, ExternFn>,
    system_args: u64,
    step_limit: u64,
    instrumented: bool,
}

impl Simulator {
    /// Load `module` as is
    pub fn new(module: Module, config: SanitizerConfig) -> Result<Self> {
        let device = Device::new(config.clone())?;
        let mut memory = DeviceMemory::new(config.local_segment, config.max_threads);
        let mut globals = Vec::with_capacity(module.globals.len());
        for global in &module.globals {
            let address = memory.map(global.size);
            let init = &global.init[..global.init.len().min(global.size as usize)];
            memory.write_bytes(address, init)?;
            globals.push(address);
        }
        let system_args = memory.map(SYSTEM_ARGS_SIZE);
        tracing::debug!(
            module = %module.name,
            globals = globals.len(),
            "loaded module into simulator"
        );
        Ok(Self {
            module,
            device,
            memory,
            globals,
            externs: HashMap::new(),
            system_args,
            step_limit: DEFAULT_STEP_LIMIT,
            instrumented: false,
        })
    }

    /// Instrument `module` and load the result
    pub fn instrumented(
        mut module: Module,
        options: &InstrumentOptions,
        config: SanitizerConfig,
    ) -> Result<(Self, InstrumentReport)> {
        let report = Sanitizer::new(options.clone()).instrument(&mut module)?;
        let mut sim = Self::new(module, config)?;
        sim.device.set_locations(report.locations.clone());
        sim.instrumented = true;
        Ok((sim, report))
    }

    /// Replace the per-thread instruction budget
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Make an external declaration callable
    pub fn register_extern(&mut self, name: &str, handler: ExternFn) {
        self.externs.insert(name.to_string(), handler);
    }

    /// Replace the location table used to render diagnostics
    pub fn set_locations(&mut self, locations: LocationTable) {
        self.device.set_locations(locations);
    }

    /// Loaded module
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Runtime of the simulated device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Simulated memory
    pub fn memory(&mut self) -> &mut DeviceMemory {
        &mut self.memory
    }

    /// Whether the loaded module went through instrumentation
    pub fn is_instrumented(&self) -> bool {
        self.instrumented
    }

    /// Real address of a module global
    pub fn global_address(&self, name: &str) -> Option<u64> {
        let id = self.module.find_global(name)?;
        self.globals.get(id.index()).copied()
    }

    /// Map a zeroed buffer; instrumented modules see it as a tracked allocation
    pub fn alloc_buffer(&mut self, length: u64) -> Result<Buffer> {
        let address = self.memory.map(length);
        let pointer = if self.instrumented {
            self.device.register_host(address, length, None)?
        } else {
            address
        };
        Ok(Buffer {
            address,
            length,
            pointer,
        })
    }

    /// Unmap a buffer and retire its allocation
    pub fn free_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        if self.instrumented {
            self.device.unregister_host(buffer.address)?;
        }
        self.memory.unmap(buffer.address);
        Ok(())
    }

    /// Copy bytes into a buffer at `offset`
    pub fn write_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.memory.write_bytes(buffer.address + offset, data)
    }

    /// Copy `length` bytes out of a buffer at `offset`
    pub fn read_buffer(&mut self, buffer: &Buffer, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.memory.read_bytes(buffer.address + offset, length)
    }

    /// Fill a buffer with little-endian `i32`s
    pub fn write_i32s(&mut self, buffer: &Buffer, values: &[i32]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write_buffer(buffer, 0, &bytes)
    }

    /// Read a buffer as little-endian `i32`s
    pub fn read_i32s(&mut self, buffer: &Buffer) -> Result<Vec<i32>> {
        let bytes = self.read_buffer(buffer, 0, buffer.length)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Run every module constructor on thread 0
    pub fn run_constructors(&mut self) -> Result<()> {
        for id in self.module.ctors.clone() {
            let run = self.launch(id, 1, &[])?;
            if !run.is_clean() {
                return Err(first_failure(run));
            }
        }
        Ok(())
    }

    /// Run every module destructor on thread 0 and return all leaks reported so far
    pub fn finish(&mut self) -> Result<Vec<LeakReport>> {
        for id in self.module.dtors.clone() {
            let run = self.launch(id, 1, &[])?;
            if !run.is_clean() {
                return Err(first_failure(run));
            }
        }
        Ok(self.device.leaks())
    }

    /// Launch kernel `name` on `threads` threads with the same arguments
    pub fn run_kernel(&mut self, name: &str, threads: u32, args: &[u64]) -> Result<KernelRun> {
        let id = self
            .module
            .find_function(name)
            .ok_or_else(|| Error::UnknownFunction {
                name: name.to_string(),
            })?;
        self.memory.write(self.system_args, 4, u64::from(threads))?;
        let run = self.launch(id, threads, args)?;
        tracing::info!(
            kernel = name,
            threads,
            steps = run.steps,
            traps = run.report.diagnostics.len(),
            faults = run.faults.len(),
            "kernel finished"
        );
        Ok(run)
    }

    fn launch(&mut self, id: FuncId, threads: u32, args: &[u64]) -> Result<KernelRun> {
        let program = Program {
            module: &self.module,
            globals: &self.globals,
            externs: &self.externs,
            system_args: self.system_args,
            step_limit: self.step_limit,
        };
        let memory = &mut self.memory;
        let mut faults = Vec::new();
        let mut aborted: Option<Error> = None;
        let mut steps = 0;

        let report = self.device.launch_sequential(threads, |ctx| {
            if aborted.is_some() {
                return Ok(());
            }
            let mut interpreter = Interpreter::new(&program, &mut *memory);
            let result = interpreter.call(ctx, id, args);
            steps += interpreter.steps();
            match result {
                Ok(_) => Ok(()),
                Err(Error::Trap(violation)) => Err(violation),
                Err(fault @ Error::Fault { .. }) => {
                    tracing::warn!(thread = ctx.thread_id(), "{}", fault);
                    faults.push((ctx.thread_id(), fault));
                    Ok(())
                }
                Err(error) => {
                    aborted = Some(error);
                    Ok(())
                }
            }
        })?;

        match aborted {
            Some(error) => Err(error),
            None => Ok(KernelRun {
                report,
                faults,
                steps,
            }),
        }
    }
}

fn first_failure(run: KernelRun) -> Error {
    if let Some(diagnostic) = run.report.diagnostics.into_iter().next() {
        return Error::Trap(diagnostic.violation);
    }
    run.faults
        .into_iter()
        .next()
        .map(|(_, error)| error)
        .unwrap_or_else(|| Error::simulation("launch failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{
        BinOp, CmpPred, Function, FunctionBuilder, GlobalVar, Operand,
    };
    use crate::runtime::Violation;

    fn config() -> SanitizerConfig {
        SanitizerConfig {
            max_threads: 8,
            workers: 1,
            ..SanitizerConfig::default()
        }
    }

    /// `out[tid] = tid * 2` for `tid < n`
    fn fill_module() -> Module {
        let mut module = Module::new("fill");
        let mut b = FunctionBuilder::kernel("fill", "fill.c");
        let out = b.param(true);
        let n = b.param(false);
        let body = b.block("body");
        let exit = b.block("exit");
        b.at(3, 7);
        let tid = b.thread_id();
        let inside = b.cmp(CmpPred::Slt, tid, n);
        b.branch(inside, body, exit);
        b.switch_to(body);
        let value = b.mul(tid, 2i64);
        let offset = b.mul(tid, 4i64);
        b.at(4, 12);
        let slot = b.gep(out, offset);
        b.store(slot, value, 4);
        b.jump(exit);
        b.switch_to(exit);
        b.ret(None);
        module.add_function(b.finish());
        module
    }

    #[test]
    fn test_uninstrumented_kernel_runs() {
        let mut sim = Simulator::new(fill_module(), config()).unwrap();
        let out = sim.alloc_buffer(16).unwrap();
        assert_eq!(out.pointer, out.address);
        let run = sim.run_kernel("fill", 4, &[out.pointer, 4]).unwrap();
        assert!(run.is_clean());
        assert_eq!(sim.read_i32s(&out).unwrap(), vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_instrumented_kernel_matches() {
        let (mut sim, report) =
            Simulator::instrumented(fill_module(), &InstrumentOptions::default(), config())
                .unwrap();
        assert_eq!(report.stats.accesses, 1);
        let out = sim.alloc_buffer(16).unwrap();
        assert_ne!(out.pointer, out.address);
        let run = sim.run_kernel("fill", 4, &[out.pointer, 4]).unwrap();
        assert!(run.is_clean());
        assert_eq!(sim.read_i32s(&out).unwrap(), vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_overflow_traps_only_offending_thread() {
        let (mut sim, _) =
            Simulator::instrumented(fill_module(), &InstrumentOptions::default(), config())
                .unwrap();
        let out = sim.alloc_buffer(16).unwrap();
        let run = sim.run_kernel("fill", 5, &[out.pointer, 5]).unwrap();
        assert_eq!(run.report.halted, vec![4]);
        assert!(run.faults.is_empty());
        let diag = &run.report.diagnostics[0];
        assert!(matches!(diag.violation, Violation::OutOfBounds { offset: 16, .. }));
        assert_eq!(diag.frames[0].line, 4);
        assert_eq!(sim.read_i32s(&out).unwrap(), vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_uninstrumented_overflow_faults() {
        let mut sim = Simulator::new(fill_module(), config()).unwrap();
        let out = sim.alloc_buffer(16).unwrap();
        let run = sim.run_kernel("fill", 5, &[out.pointer, 5]).unwrap();
        // The gap after the buffer is unmapped.
        assert_eq!(run.faults.len(), 1);
        assert_eq!(run.faults[0].0, 4);
    }

    #[test]
    fn test_phi_loop_and_globals() {
        let mut module = Module::new("sum");
        let total = module.add_global(GlobalVar {
            name: "total".to_string(),
            size: 8,
            init: 5u64.to_le_bytes().to_vec(),
            constant: false,
        });
        let mut b = FunctionBuilder::kernel("sum", "sum.c");
        let entry = b.current_block();
        let header = b.block("header");
        let exit = b.block("exit");
        b.jump(header);
        b.switch_to(header);
        let i = b.phi();
        let acc = b.phi();
        let next_i = b.add(i, 1i64);
        let next_acc = b.bin(BinOp::Add, acc, i);
        let more = b.cmp(CmpPred::Slt, next_i, 10i64);
        b.branch(more, header, exit);
        b.add_incoming(i, entry, 0i64);
        b.add_incoming(i, header, next_i);
        b.add_incoming(acc, entry, 0i64);
        b.add_incoming(acc, header, next_acc);
        b.switch_to(exit);
        let old = b.load(Operand::Global(total), 8);
        let sum = b.add(old, next_acc);
        b.store(Operand::Global(total), sum, 8);
        b.ret(None);
        module.add_function(b.finish());

        let mut sim = Simulator::new(module, config()).unwrap();
        let run = sim.run_kernel("sum", 1, &[]).unwrap();
        assert!(run.is_clean());
        let address = sim.global_address("total").unwrap();
        assert_eq!(sim.memory().read(address, 8).unwrap(), 5 + 45);
    }

    #[test]
    fn test_step_limit_aborts() {
        let mut module = Module::new("spin");
        let mut b = FunctionBuilder::kernel("spin", "spin.c");
        let header = b.block("header");
        b.jump(header);
        b.switch_to(header);
        b.jump(header);
        module.add_function(b.finish());

        let mut sim = Simulator::new(module, config()).unwrap().with_step_limit(100);
        let err = sim.run_kernel("spin", 1, &[]).unwrap_err();
        assert!(matches!(err, Error::Simulation(_)));
    }

    #[test]
    fn test_extern_calls() {
        fn answer(_: &mut DeviceMemory, args: &[u64]) -> Result<Option<u64>> {
            Ok(Some(args[0] + 40))
        }

        let mut module = Module::new("ext");
        let decl = module.add_function(Function::declaration("answer", &[false]));
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let out = b.param(true);
        let value = b.call(decl, vec![Operand::Const(2)]);
        b.store(out, value, 4);
        b.ret(None);
        module.add_function(b.finish());

        let mut sim = Simulator::new(module.clone(), config()).unwrap();
        let out = sim.alloc_buffer(4).unwrap();
        assert!(matches!(
            sim.run_kernel("k", 1, &[out.pointer]),
            Err(Error::UnknownFunction { .. })
        ));

        let mut sim = Simulator::new(module, config()).unwrap();
        sim.register_extern("answer", answer);
        let out = sim.alloc_buffer(4).unwrap();
        sim.run_kernel("k", 1, &[out.pointer]).unwrap();
        assert_eq!(sim.read_i32s(&out).unwrap(), vec![42]);
    }

    #[test]
    fn test_unknown_kernel() {
        let mut sim = Simulator::new(fill_module(), config()).unwrap();
        assert!(matches!(
            sim.run_kernel("missing", 1, &[]),
            Err(Error::UnknownFunction { .. })
        ));
    }
}
