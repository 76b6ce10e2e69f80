//! # GPU Sanitizer Instrumentation
//!
//! This module rewrites device IR so that every memory access is validated
//! by the sanitizer runtime at execution time.
//!
//! ## Architecture
//!
//! ```text
//! Module → Verify → Analyse (dominators, loops, recurrences)
//!        → Classify pointers → Instrument → Verify → Module + LocationTable
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use gpusan::compiler::{InstrumentOptions, Sanitizer};
//!
//! let sanitizer = Sanitizer::new(InstrumentOptions::default());
//! let report = sanitizer.instrument(&mut module)?;
//! println!("{} accesses checked", report.stats.accesses);
//! ```

pub mod affine;
pub mod analysis;
pub mod debug;
pub mod instrument;
pub mod ir;
pub mod locations;
pub mod placement;
pub mod provenance;
pub mod verifier;

pub use analysis::{AffineAccess, HostAnalysis, IrAnalysis, LoopInfo, UnderlyingObject};
pub use debug::{dump_module, format_function, format_module, format_op};
pub use instrument::{
    is_instrumentable, program_counter, Instrumenter, REGISTER_GLOBALS, SHADOW_PREFIX,
    UNREGISTER_GLOBALS,
};
pub use ir::{FunctionBuilder, IrInstruction, IrOp, IrReg, Module, Operand, RuntimeEntry};
pub use locations::{CallGraph, LocationEncoder, SourceMap};
pub use provenance::{Provenance, ProvenanceClassifier};
pub use verifier::{Verifier, VerifyError, VerifyResult};

use crate::location::LocationTable;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// What to do with accesses whose provenance cannot be determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPolicy {
    /// Check through the dispatching runtime entry points
    #[default]
    Check,
    /// Only strip the tracking bits; the access goes unchecked
    Skip,
}

/// Instrumentation options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentOptions {
    /// Combine independent checks of one block into vector checks
    pub merge_checks: bool,
    /// Replace per-iteration checks of affine loop accesses with range checks
    pub hoist_checks: bool,
    /// Fetch allocation records once per object accessed repeatedly
    pub cache_allocation_info: bool,
    /// Handling of accesses of unknown provenance
    pub unknown_policy: UnknownPolicy,
    /// Track user globals through shadow pointers
    pub instrument_globals: bool,
    /// Verify the module before and after instrumentation
    pub verify: bool,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            merge_checks: true,
            hoist_checks: true,
            cache_allocation_info: true,
            unknown_policy: UnknownPolicy::Check,
            instrument_globals: true,
            verify: true,
        }
    }
}

impl InstrumentOptions {
    /// Every optimisation off: one scalar check per access
    pub fn unoptimized() -> Self {
        Self {
            merge_checks: false,
            hoist_checks: false,
            cache_allocation_info: false,
            ..Self::default()
        }
    }
}

/// Counters collected while instrumenting a module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentStats {
    /// Functions rewritten
    pub functions: usize,
    /// Loads and stores seen
    pub accesses: usize,
    /// Accesses left alone because they touch runtime-owned memory
    pub unchecked_accesses: usize,
    /// Accesses of unknown provenance only unpacked
    pub skipped_unknown: usize,
    /// Accesses checked one by one
    pub scalar_checks: usize,
    /// Vector check calls emitted
    pub merged_checks: usize,
    /// Accesses covered by vector checks
    pub merged_lanes: usize,
    /// Loop accesses checked once in the preheader
    pub hoisted_checks: usize,
    /// Objects whose allocation record is fetched once
    pub cached_objects: usize,
    /// Stack allocations registered
    pub allocas: usize,
    /// Address computations routed through the runtime
    pub geps: usize,
    /// User globals registered by the module constructor
    pub tracked_globals: usize,
    /// Call sites that save and restore the call-site word
    pub ambiguous_calls: usize,
    /// Pointer arguments unpacked for external functions
    pub unpacked_arguments: usize,
    /// Address computations moved closer to their operands
    pub moved_address_computations: usize,
}

/// Result of instrumenting a module
#[derive(Debug, Clone)]
pub struct InstrumentReport {
    /// Source locations referenced by the emitted runtime calls
    pub locations: LocationTable,
    /// Counters
    pub stats: InstrumentStats,
}

/// Instrumentation driver
pub struct Sanitizer {
    options: InstrumentOptions,
}

impl Sanitizer {
    /// Create a driver with the given options
    pub fn new(options: InstrumentOptions) -> Self {
        Self { options }
    }

    /// Options in effect
    pub fn options(&self) -> &InstrumentOptions {
        &self.options
    }

    /// Instrument `module` in place
    pub fn instrument(&self, module: &mut Module) -> Result<InstrumentReport> {
        if self.options.verify {
            Self::verify(module, "input")?;
        }
        let report = Instrumenter::new(&self.options).run(module)?;
        if self.options.verify {
            Self::verify(module, "instrumented")?;
        }
        Ok(report)
    }

    fn verify(module: &Module, stage: &str) -> Result<()> {
        let result = Verifier::new().verify(module);
        for warning in &result.warnings {
            tracing::warn!(stage, "{}", warning);
        }
        match result.errors.first() {
            None => Ok(()),
            Some(error) => {
                tracing::error!(stage, errors = result.errors.len(), "module failed verification");
                Err(Error::MalformedIr {
                    function: error.function().unwrap_or(&module.name).to_string(),
                    message: format!("{} ({})", error, stage),
                })
            }
        }
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(InstrumentOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_json() {
        let options: InstrumentOptions =
            serde_json::from_str(r#"{"merge_checks": false, "unknown_policy": "skip"}"#).unwrap();
        assert!(!options.merge_checks);
        assert!(options.hoist_checks);
        assert_eq!(options.unknown_policy, UnknownPolicy::Skip);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::kernel("k", "k.c");
        b.alloca(4);
        module.add_function(b.finish());
        let err = Sanitizer::default().instrument(&mut module).unwrap_err();
        assert!(matches!(err, Error::MalformedIr { ref function, .. } if function == "k"));
    }

    #[test]
    fn test_instrumented_module_verifies() {
        let mut module = Module::new("m");
        let mut b = FunctionBuilder::kernel("k", "k.c");
        let p = b.param(true);
        let slot = b.alloca(8);
        let x = b.load(p, 4);
        b.store(slot, x, 4);
        b.ret(None);
        module.add_function(b.finish());

        let report = Sanitizer::default().instrument(&mut module).unwrap();
        assert_eq!(report.stats.functions, 1);
        assert!(Verifier::new().verify(&module).valid);
    }
}
