//! # GPUSan - Memory Safety for Accelerator Kernels
//!
//! GPUSan finds out-of-bounds accesses, use-after-free and leaks in code that
//! runs on thousands of device threads at once. It has two halves:
//!
//! - an **instrumentation pass** that rewrites device IR so every allocation
//!   is registered and every load and store goes through a runtime check, and
//! - a **device runtime** that hands out tracked pointers (slot, tag and
//!   offset packed into one machine word) and validates them.
//!
//! A simulator ties both together so instrumented kernels can be executed and
//! compared against their uninstrumented originals.
//!
//! ## Quick Start
//!
//! ```rust
//! use gpusan::compiler::ir::{CmpPred, FunctionBuilder, Module};
//! use gpusan::{InstrumentOptions, SanitizerConfig, Simulator};
//!
//! # fn main() -> gpusan::Result<()> {
//! // out[tid] = tid for every tid < n
//! let mut module = Module::new("demo");
//! let mut b = FunctionBuilder::kernel("fill", "demo.c");
//! let out = b.param(true);
//! let n = b.param(false);
//! let body = b.block("body");
//! let exit = b.block("exit");
//! let tid = b.thread_id();
//! let inside = b.cmp(CmpPred::Slt, tid, n);
//! b.branch(inside, body, exit);
//! b.switch_to(body);
//! let offset = b.mul(tid, 4i64);
//! b.at(7, 5);
//! let slot = b.gep(out, offset);
//! b.store(slot, tid, 4);
//! b.jump(exit);
//! b.switch_to(exit);
//! b.ret(None);
//! module.add_function(b.finish());
//!
//! let config = SanitizerConfig { max_threads: 8, workers: 1, ..Default::default() };
//! let (mut sim, _report) = Simulator::instrumented(module, &InstrumentOptions::default(), config)?;
//!
//! // Room for four values, but n says five.
//! let buffer = sim.alloc_buffer(16)?;
//! let run = sim.run_kernel("fill", 5, &[buffer.pointer, 5])?;
//!
//! assert_eq!(run.report.halted, vec![4]);
//! assert!(run.report.diagnostics[0].to_string().contains("out-of-bounds write"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Module → Sanitizer (compiler/) → instrumented Module + LocationTable
//!                                         │
//!                       Simulator (sim/) ─┴→ Device (runtime/) → Diagnostics
//! ```
//!
//! ### Main Components
//!
//! - [`Sanitizer`] - Instrumentation driver
//! - [`Device`] - Allocation tables, check engine and grid launches
//! - [`ThreadContext`] - The runtime entry points as seen by one thread
//! - [`LocationTable`] - Source locations referenced by diagnostics
//! - [`Simulator`] - Executes IR modules against a [`Device`]
//!
//! ## Error Handling
//!
//! Build-time and host-side failures are [`Error`]s. Memory-safety failures
//! inside a kernel are [`Violation`]s: they halt the offending thread, are
//! logged as [`Diagnostic`]s, and never take the other threads down.

// Module declarations
/// Version of the GPUSan crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compiler;
pub mod config;
pub mod error;
pub mod location;
pub mod runtime;
pub mod sim;

// Re-export main types
pub use compiler::{InstrumentOptions, InstrumentReport, InstrumentStats, Sanitizer, UnknownPolicy};
pub use config::{LocalSegment, SanitizerConfig};
pub use error::{Error, ErrorSeverity, Result};
pub use location::{LocationTable, SourceFrame};
pub use runtime::{
    AccessSite, AllocationKind, Device, Diagnostic, LaunchReport, LeakReport, PointerCodec,
    PointerLayout, ThreadContext, Violation,
};
pub use sim::{Buffer, KernelRun, Simulator};
