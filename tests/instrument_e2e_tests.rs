//! End-to-end tests: instrument a module, run it on the simulator, and
//! compare with the uninstrumented module.

use gpusan::compiler::ir::{BinOp, BlockId, CmpPred, Function, FunctionBuilder, GlobalVar, Module, Operand};
use gpusan::{
    AllocationKind, Error, InstrumentOptions, SanitizerConfig, Simulator, Violation,
};

fn config() -> SanitizerConfig {
    SanitizerConfig {
        max_threads: 16,
        workers: 1,
        ..SanitizerConfig::default()
    }
}

/// `out[tid] = tid + 100` when `tid < n`
fn guarded_fill() -> Module {
    let mut module = Module::new("guarded");
    let mut b = FunctionBuilder::kernel("fill", "fill.c");
    let out = b.param(true);
    let n = b.param(false);
    let body = b.block("body");
    let exit = b.block("exit");
    b.at(10, 3);
    let tid = b.thread_id();
    let inside = b.cmp(CmpPred::Slt, tid, n);
    b.branch(inside, body, exit);
    b.switch_to(body);
    b.at(11, 12);
    let value = b.add(tid, 100i64);
    let offset = b.mul(tid, 4i64);
    let slot = b.gep(out, offset);
    b.store(slot, value, 4);
    b.jump(exit);
    b.switch_to(exit);
    b.at(12, 1);
    b.ret(None);
    module.add_function(b.finish());
    module
}

/// Bottom-tested loop: `for i in 0..n { out[i] = i }`
fn counted_fill() -> Module {
    let mut module = Module::new("counted");
    let mut b = FunctionBuilder::kernel("fill_all", "loop.c");
    let out = b.param(true);
    let n = b.param(false);
    let body = b.block("body");
    let exit = b.block("exit");
    b.at(20, 5);
    b.jump(body);
    b.switch_to(body);
    let i = b.phi();
    b.at(21, 9);
    let offset = b.bin(BinOp::Shl, i, 2i64);
    let slot = b.gep(out, offset);
    b.store(slot, i, 4);
    let next = b.add(i, 1i64);
    let more = b.cmp(CmpPred::Slt, next, n);
    b.branch(more, body, exit);
    b.add_incoming(i, BlockId(0), 0i64);
    b.add_incoming(i, body, next);
    b.switch_to(exit);
    b.ret(None);
    module.add_function(b.finish());
    module
}

/// Bottom-tested `i = from; do { out[i] = i } while (i + 1 != until)`, once
/// with both ends taken from arguments and once with constant ends `0..4`
fn not_equal_walks() -> Module {
    let mut module = Module::new("walks");
    for (name, constant) in [("walk_from", false), ("walk_fixed", true)] {
        let mut b = FunctionBuilder::kernel(name, "walk.c");
        let out = b.param(true);
        let from = b.param(false);
        let until = b.param(false);
        let body = b.block("body");
        let exit = b.block("exit");
        b.at(89, 5);
        b.jump(body);
        b.switch_to(body);
        let i = b.phi();
        b.at(90, 9);
        let offset = b.bin(BinOp::Shl, i, 2i64);
        let slot = b.gep(out, offset);
        b.store(slot, i, 4);
        let next = b.add(i, 1i64);
        let more = if constant {
            b.cmp(CmpPred::Ne, next, 4i64)
        } else {
            b.cmp(CmpPred::Ne, next, until)
        };
        b.branch(more, body, exit);
        if constant {
            b.add_incoming(i, BlockId(0), 0i64);
        } else {
            b.add_incoming(i, BlockId(0), from);
        }
        b.add_incoming(i, body, next);
        b.switch_to(exit);
        b.ret(None);
        module.add_function(b.finish());
    }
    module
}

/// `out[1] = out[0] * 2`
fn neighbours() -> Module {
    let mut module = Module::new("neighbours");
    let mut b = FunctionBuilder::kernel("double", "pair.c");
    let out = b.param(true);
    b.at(30, 7);
    let second = b.gep(out, 4i64);
    let first = b.load(out, 4);
    let doubled = b.mul(first, 2i64);
    b.at(31, 7);
    b.store(second, doubled, 4);
    b.ret(None);
    module.add_function(b.finish());
    module
}

fn run_plain(module: Module, threads: u32, len: u64, n: u64) -> Vec<i32> {
    let mut sim = Simulator::new(module, config()).unwrap();
    let out = sim.alloc_buffer(len).unwrap();
    let kernel = sim.module().functions[0].name.clone();
    let run = sim.run_kernel(&kernel, threads, &[out.pointer, n]).unwrap();
    assert!(run.is_clean());
    sim.read_i32s(&out).unwrap()
}

#[test]
fn test_off_by_one_store_reports_source_location() {
    let (mut sim, report) =
        Simulator::instrumented(guarded_fill(), &InstrumentOptions::default(), config()).unwrap();
    assert_eq!(report.stats.accesses, 1);

    let out = sim.alloc_buffer(16).unwrap();
    let run = sim.run_kernel("fill", 5, &[out.pointer, 5]).unwrap();

    assert_eq!(run.report.halted, vec![4]);
    assert_eq!(run.report.diagnostics.len(), 1);
    let diag = &run.report.diagnostics[0];
    assert_eq!(diag.thread, 4);
    match &diag.violation {
        Violation::OutOfBounds {
            kind,
            offset,
            size,
            length,
            site,
            ..
        } => {
            assert_eq!(*kind, AllocationKind::Global);
            assert_eq!(*offset, 16);
            assert_eq!(*size, 4);
            assert_eq!(*length, 16);
            assert!(site.access_id > 0);
        }
        other => panic!("expected out-of-bounds, got {:?}", other),
    }
    assert_eq!(diag.frames[0].file, "fill.c");
    assert_eq!(diag.frames[0].function, "fill");
    assert_eq!(diag.frames[0].line, 11);

    // The faulting store never happened; the in-bounds ones did.
    assert_eq!(sim.read_i32s(&out).unwrap(), vec![100, 101, 102, 103]);
    assert!(diag.to_string().contains("fill.c:11:12"));
}

#[test]
fn test_instrumented_results_match_uninstrumented() {
    let expected = run_plain(guarded_fill(), 6, 32, 6);
    for options in [InstrumentOptions::default(), InstrumentOptions::unoptimized()] {
        let (mut sim, _) = Simulator::instrumented(guarded_fill(), &options, config()).unwrap();
        let out = sim.alloc_buffer(32).unwrap();
        let run = sim.run_kernel("fill", 6, &[out.pointer, 6]).unwrap();
        assert!(run.is_clean(), "{:?}", run.report.diagnostics);
        assert_eq!(sim.read_i32s(&out).unwrap(), expected);
    }
}

#[test]
fn test_uninstrumented_overflow_goes_unnoticed_by_the_runtime() {
    let mut sim = Simulator::new(guarded_fill(), config()).unwrap();
    let out = sim.alloc_buffer(16).unwrap();
    let run = sim.run_kernel("fill", 5, &[out.pointer, 5]).unwrap();
    assert!(run.report.is_clean());
    assert_eq!(run.faults.len(), 1);
    assert!(matches!(run.faults[0].1, Error::Fault { .. }));
}

#[test]
fn test_hoisted_range_check_traps_before_the_loop() {
    let (mut sim, report) =
        Simulator::instrumented(counted_fill(), &InstrumentOptions::default(), config()).unwrap();
    assert_eq!(report.stats.hoisted_checks, 1);
    assert_eq!(report.stats.scalar_checks, 0);

    let out = sim.alloc_buffer(16).unwrap();
    let run = sim.run_kernel("fill_all", 1, &[out.pointer, 4]).unwrap();
    assert!(run.is_clean());
    assert_eq!(sim.read_i32s(&out).unwrap(), vec![0, 1, 2, 3]);

    let fresh = sim.alloc_buffer(16).unwrap();
    let run = sim.run_kernel("fill_all", 1, &[fresh.pointer, 5]).unwrap();
    assert_eq!(run.report.halted, vec![0]);
    assert!(matches!(
        run.report.diagnostics[0].violation,
        Violation::OutOfBounds { .. }
    ));
    // One check for the whole range: nothing was written.
    assert_eq!(sim.read_i32s(&fresh).unwrap(), vec![0, 0, 0, 0]);
}

#[test]
fn test_unhoisted_loop_traps_on_the_bad_iteration() {
    let options = InstrumentOptions {
        hoist_checks: false,
        ..InstrumentOptions::default()
    };
    let (mut sim, report) = Simulator::instrumented(counted_fill(), &options, config()).unwrap();
    assert_eq!(report.stats.hoisted_checks, 0);

    let out = sim.alloc_buffer(16).unwrap();
    let run = sim.run_kernel("fill_all", 1, &[out.pointer, 5]).unwrap();
    assert_eq!(run.report.halted, vec![0]);
    // Iterations before the overflow completed.
    assert_eq!(sim.read_i32s(&out).unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn test_not_equal_loop_starting_past_its_bound_is_checked() {
    let (mut sim, report) =
        Simulator::instrumented(not_equal_walks(), &InstrumentOptions::default(), config())
            .unwrap();
    // Only the walk with constant, ordered ends has a known trip count.
    assert_eq!(report.stats.hoisted_checks, 1);
    assert_eq!(report.stats.scalar_checks, 1);

    let fixed = sim.alloc_buffer(16).unwrap();
    let run = sim.run_kernel("walk_fixed", 1, &[fixed.pointer, 0, 0]).unwrap();
    assert!(run.is_clean());
    assert_eq!(sim.read_i32s(&fixed).unwrap(), vec![0, 1, 2, 3]);

    // `i + 1 != 1` never holds for i >= 2 until the counter wraps.
    let out = sim.alloc_buffer(16).unwrap();
    let run = sim.run_kernel("walk_from", 1, &[out.pointer, 2, 1]).unwrap();
    assert!(run.faults.is_empty());
    assert_eq!(run.report.halted, vec![0]);
    let diag = &run.report.diagnostics[0];
    assert!(matches!(
        diag.violation,
        Violation::OutOfBounds { offset: 16, .. }
    ));
    assert_eq!(diag.frames[0].line, 90);
    assert_eq!(sim.read_i32s(&out).unwrap(), vec![0, 0, 2, 3]);
}

#[test]
fn test_merged_checks_report_the_failing_lane() {
    let (mut sim, report) =
        Simulator::instrumented(neighbours(), &InstrumentOptions::default(), config()).unwrap();
    assert_eq!(report.stats.merged_checks, 1);
    assert_eq!(report.stats.merged_lanes, 2);

    let ok = sim.alloc_buffer(8).unwrap();
    sim.write_i32s(&ok, &[21, 0]).unwrap();
    assert!(sim.run_kernel("double", 1, &[ok.pointer]).unwrap().is_clean());
    assert_eq!(sim.read_i32s(&ok).unwrap(), vec![21, 42]);

    let short = sim.alloc_buffer(4).unwrap();
    let run = sim.run_kernel("double", 1, &[short.pointer]).unwrap();
    let site = run.report.diagnostics[0].violation.site().unwrap();
    assert_eq!(site.access_id, 1);
    assert_eq!(run.report.diagnostics[0].frames[0].line, 31);
}

#[test]
fn test_freed_buffer_is_use_after_free() {
    let (mut sim, _) =
        Simulator::instrumented(guarded_fill(), &InstrumentOptions::default(), config()).unwrap();
    let out = sim.alloc_buffer(16).unwrap();
    sim.free_buffer(&out).unwrap();
    let run = sim.run_kernel("fill", 2, &[out.pointer, 2]).unwrap();
    assert_eq!(run.report.halted, vec![0, 1]);
    assert!(run
        .report
        .diagnostics
        .iter()
        .all(|d| matches!(d.violation, Violation::UseAfterFree { .. })));
}

#[test]
fn test_stack_overflow_is_local_and_per_thread() {
    let mut module = Module::new("stack");
    let mut b = FunctionBuilder::kernel("scratch", "stack.c");
    let out = b.param(true);
    b.at(40, 5);
    let scratch = b.alloca(16);
    let tid = b.thread_id();
    let offset = b.mul(tid, 4i64);
    let slot = b.gep(scratch, offset);
    b.at(41, 5);
    b.store(slot, tid, 4);
    let back = b.load(slot, 4);
    let dst = b.gep(out, offset);
    b.store(dst, back, 4);
    b.ret(None);
    module.add_function(b.finish());

    let (mut sim, report) =
        Simulator::instrumented(module, &InstrumentOptions::default(), config()).unwrap();
    assert_eq!(report.stats.allocas, 1);
    let out = sim.alloc_buffer(64).unwrap();
    let run = sim.run_kernel("scratch", 5, &[out.pointer]).unwrap();
    assert_eq!(run.report.halted, vec![4]);
    assert!(matches!(
        run.report.diagnostics[0].violation,
        Violation::OutOfBounds {
            kind: AllocationKind::Local,
            offset: 16,
            ..
        }
    ));

    // Stack slots are released on return, so a second launch starts clean.
    let run = sim.run_kernel("scratch", 4, &[out.pointer]).unwrap();
    assert!(run.is_clean());
    assert_eq!(&sim.read_i32s(&out).unwrap()[..4], &[0, 1, 2, 3]);
}

#[test]
fn test_access_outside_lifetime_is_caught() {
    let mut module = Module::new("scope");
    let mut b = FunctionBuilder::kernel("scoped", "scope.c");
    let slot = b.alloca(8);
    b.lifetime_start(8, slot);
    b.store(slot, 1i64, 4);
    b.lifetime_end(8, slot);
    b.at(50, 3);
    b.store(slot, 2i64, 4);
    b.ret(None);
    module.add_function(b.finish());

    let (mut sim, _) =
        Simulator::instrumented(module, &InstrumentOptions::unoptimized(), config()).unwrap();
    let run = sim.run_kernel("scoped", 1, &[]).unwrap();
    assert_eq!(run.report.diagnostics.len(), 1);
    assert_eq!(run.report.diagnostics[0].frames[0].line, 50);
}

#[test]
fn test_globals_are_registered_checked_and_released() {
    let mut module = Module::new("globals");
    let counter = module.add_global(GlobalVar::zeroed("counter", 4));
    let mut b = FunctionBuilder::kernel("bump", "glob.c");
    let index = b.param(false);
    let offset = b.mul(index, 4i64);
    let slot = b.gep(Operand::Global(counter), offset);
    b.at(60, 2);
    let old = b.load(slot, 4);
    let new = b.add(old, 1i64);
    b.store(slot, new, 4);
    b.ret(None);
    module.add_function(b.finish());

    let (mut sim, report) =
        Simulator::instrumented(module, &InstrumentOptions::default(), config()).unwrap();
    assert_eq!(report.stats.tracked_globals, 1);
    sim.run_constructors().unwrap();

    assert!(sim.run_kernel("bump", 1, &[0]).unwrap().is_clean());
    let address = sim.global_address("counter").unwrap();
    assert_eq!(sim.memory().read(address, 4).unwrap(), 1);

    let run = sim.run_kernel("bump", 1, &[1]).unwrap();
    assert!(matches!(
        run.report.diagnostics[0].violation,
        Violation::OutOfBounds {
            kind: AllocationKind::Global,
            offset: 4,
            length: 4,
            ..
        }
    ));

    // The destructor retires the global; nothing leaks.
    assert!(sim.finish().unwrap().is_empty());
}

#[test]
fn test_leaked_buffers_are_reported_once() {
    let mut module = guarded_fill();
    module.add_global(GlobalVar::zeroed("unused", 8));
    let (mut sim, _) =
        Simulator::instrumented(module, &InstrumentOptions::default(), config()).unwrap();
    sim.run_constructors().unwrap();
    let kept = sim.alloc_buffer(16).unwrap();
    let released = sim.alloc_buffer(32).unwrap();
    sim.free_buffer(&released).unwrap();

    let leaks = sim.finish().unwrap();
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].start, kept.address);
    assert_eq!(leaks[0].length, 16);
    assert!(sim.device().leak_check().is_empty());
}

#[test]
fn test_ambiguous_helper_reports_dynamic_caller() {
    let mut module = Module::new("calls");
    let helper_id = gpusan::compiler::ir::FuncId(0);

    let mut h = FunctionBuilder::new("store_at", "helper.c");
    let ptr = h.param(true);
    let index = h.param(false);
    h.at(5, 9);
    let offset = h.mul(index, 4i64);
    let slot = h.gep(ptr, offset);
    h.store(slot, index, 4);
    h.ret(None);
    module.add_function(h.finish());

    for (name, line) in [("first", 70u32), ("second", 80u32)] {
        let mut b = FunctionBuilder::kernel(name, "main.c");
        let out = b.param(true);
        let index = b.param(false);
        b.at(line, 4);
        b.call_void(helper_id, vec![Operand::Reg(out), Operand::Reg(index)]);
        b.ret(None);
        module.add_function(b.finish());
    }

    let (mut sim, report) =
        Simulator::instrumented(module, &InstrumentOptions::default(), config()).unwrap();
    assert_eq!(report.stats.ambiguous_calls, 2);
    let out = sim.alloc_buffer(8).unwrap();

    assert!(sim.run_kernel("first", 1, &[out.pointer, 1]).unwrap().is_clean());

    for (name, line) in [("first", 70u64), ("second", 80u64)] {
        let run = sim.run_kernel(name, 1, &[out.pointer, 2]).unwrap();
        let frames = &run.report.diagnostics[0].frames;
        assert_eq!(frames.len(), 2, "{:?}", frames);
        assert_eq!(frames[0].function, "store_at");
        assert_eq!(frames[0].line, 5);
        assert_eq!(frames[1].function, name);
        assert_eq!(frames[1].line, line);
    }
}

#[test]
fn test_declaration_receives_real_addresses() {
    fn poke(memory: &mut gpusan::sim::DeviceMemory, args: &[u64]) -> gpusan::Result<Option<u64>> {
        memory.write(args[0], 4, 7)?;
        Ok(None)
    }

    let mut module = Module::new("ext");
    module.add_function(Function::declaration("poke", &[true]));
    let mut b = FunctionBuilder::kernel("k", "ext.c");
    let out = b.param(true);
    b.call_void(gpusan::compiler::ir::FuncId(0), vec![Operand::Reg(out)]);
    b.ret(None);
    module.add_function(b.finish());

    let (mut sim, report) =
        Simulator::instrumented(module, &InstrumentOptions::default(), config()).unwrap();
    assert_eq!(report.stats.unpacked_arguments, 1);
    sim.register_extern("poke", poke);
    let out = sim.alloc_buffer(4).unwrap();
    assert!(sim.run_kernel("k", 1, &[out.pointer]).unwrap().is_clean());
    assert_eq!(sim.read_i32s(&out).unwrap(), vec![7]);
}

#[test]
fn test_alloca_in_loop_is_rejected_before_simulation() {
    let mut module = Module::new("bad");
    let mut b = FunctionBuilder::kernel("k", "bad.c");
    let body = b.block("body");
    let exit = b.block("exit");
    b.jump(body);
    b.switch_to(body);
    b.alloca(4);
    b.branch(0i64, body, exit);
    b.switch_to(exit);
    b.ret(None);
    module.add_function(b.finish());

    let err = Simulator::instrumented(module, &InstrumentOptions::default(), config())
        .err()
        .unwrap();
    assert!(matches!(err, Error::UnsupportedAlloca { .. }));
}
