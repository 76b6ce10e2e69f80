//! Violations and diagnostics
//!
//! A failing runtime check produces a [`Violation`]. The executing thread turns
//! it into a [`Diagnostic`] by resolving the source location, logs it, and
//! halts. Leaks are reported separately as [`LeakReport`]s and never halt.

use super::pointer::AllocationKind;
use crate::error::ErrorSeverity;
use crate::location::SourceFrame;
use std::fmt;
use thiserror::Error;

/// Static identity of the instruction that invoked a runtime entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessSite {
    /// Negative for reads, positive for writes, 0 for non-accesses
    pub access_id: i64,
    /// Index into the location table, -1 when unknown
    pub source_id: i64,
    /// Program counter of the instrumented instruction
    pub pc: u64,
}

impl AccessSite {
    /// Site of a memory access
    pub fn access(access_id: i64, source_id: i64, pc: u64) -> Self {
        Self {
            access_id,
            source_id,
            pc,
        }
    }

    /// Site of an allocation, free or address computation
    pub fn at(source_id: i64, pc: u64) -> Self {
        Self {
            access_id: 0,
            source_id,
            pc,
        }
    }

    /// Site used for host-side calls
    pub fn host() -> Self {
        Self {
            access_id: 0,
            source_id: -1,
            pc: 0,
        }
    }
}

impl fmt::Display for AccessSite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.access_id {
            id if id < 0 => write!(f, "read #{}", -id),
            id if id > 0 => write!(f, "write #{}", id),
            _ => write!(f, "access"),
        }
    }
}

/// Memory-safety violation detected by a runtime entry point
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Offset plus access size falls outside of the allocation
    #[error("out-of-bounds {site} of {size} bytes at offset {offset} into {kind} allocation #{allocation_id} (slot {slot}, {length} bytes)")]
    OutOfBounds {
        /// Table of the allocation
        kind: AllocationKind,
        /// Slot of the allocation
        slot: u32,
        /// Allocation site id
        allocation_id: u32,
        /// Offset carried by the pointer
        offset: i64,
        /// Access width
        size: u64,
        /// Current allocation length
        length: u64,
        /// Where the check was issued
        site: AccessSite,
    },

    /// Pointer outlived its allocation
    ///
    /// Raised when the pointer's tag differs from the slot's tag, or when the
    /// slot has been retired.
    #[error("use-after-free {site} of {kind} allocation #{allocation_id} (slot {slot}): pointer tag {pointer_tag}, allocation tag {record_tag}")]
    UseAfterFree {
        /// Table of the allocation
        kind: AllocationKind,
        /// Slot of the allocation
        slot: u32,
        /// Allocation site id of the current occupant
        allocation_id: u32,
        /// Tag carried by the pointer
        pointer_tag: u32,
        /// Tag stored in the slot
        record_tag: u32,
        /// Where the check was issued
        site: AccessSite,
    },

    /// Value never produced by `create` or `advance`
    #[error("garbage pointer 0x{word:016x} in {site} through the {kind} entry points")]
    GarbagePointer {
        /// Entry point kind that received the value
        kind: AllocationKind,
        /// The offending word
        word: u64,
        /// Where the check was issued
        site: AccessSite,
    },

    /// Allocation too large for the offset field
    #[error("{kind} allocation of {length} bytes exceeds the maximum of {max} bytes")]
    ExceedsAllocationLength {
        /// Table of the allocation
        kind: AllocationKind,
        /// Requested length
        length: u64,
        /// Largest representable length (exclusive)
        max: u64,
        /// Allocation site
        site: AccessSite,
    },

    /// Table has no slot left
    #[error("{kind} allocation slot {slot} exceeds the table capacity of {capacity}")]
    ExceedsAllocationSlots {
        /// Table of the allocation
        kind: AllocationKind,
        /// Slot that would have been used
        slot: u64,
        /// Table capacity
        capacity: u64,
        /// Allocation site
        site: AccessSite,
    },

    /// Thread already stopped on an earlier violation
    #[error("thread {thread} was halted by an earlier violation")]
    ThreadHalted {
        /// Halted thread
        thread: u32,
    },
}

impl Violation {
    /// Site of the failing call, if it has one
    pub fn site(&self) -> Option<AccessSite> {
        match self {
            Violation::OutOfBounds { site, .. }
            | Violation::UseAfterFree { site, .. }
            | Violation::GarbagePointer { site, .. }
            | Violation::ExceedsAllocationLength { site, .. }
            | Violation::ExceedsAllocationSlots { site, .. } => Some(*site),
            Violation::ThreadHalted { .. } => None,
        }
    }

    /// Severity, on the same scale as [`Error::classify`](crate::Error::classify)
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Fatal
    }

    /// Short category name used in logs
    pub fn category(&self) -> &'static str {
        match self {
            Violation::OutOfBounds { .. } => "out-of-bounds",
            Violation::UseAfterFree { .. } => "use-after-free",
            Violation::GarbagePointer { .. } => "garbage-pointer",
            Violation::ExceedsAllocationLength { .. } => "allocation-too-large",
            Violation::ExceedsAllocationSlots { .. } => "allocation-table-full",
            Violation::ThreadHalted { .. } => "thread-halted",
        }
    }
}

/// Global allocation alive at leak-check time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakReport {
    /// Slot of the allocation
    pub slot: u32,
    /// Allocation site id
    pub allocation_id: u32,
    /// Real start address
    pub start: u64,
    /// Length in bytes
    pub length: u64,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "memory leak: global allocation #{} (slot {}) of {} bytes at 0x{:x} was never freed",
            self.allocation_id, self.slot, self.length, self.start
        )
    }
}

/// A violation together with the thread and resolved source frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Thread that trapped
    pub thread: u32,
    /// What went wrong
    pub violation: Violation,
    /// Innermost frame first
    pub frames: Vec<SourceFrame>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "ERROR: gpusan: {}", self.violation)?;
        match self.violation.site() {
            Some(site) => write!(f, "    thread {}, pc 0x{:x}", self.thread, site.pc)?,
            None => write!(f, "    thread {}", self.thread)?,
        }
        if self.frames.is_empty() {
            write!(f, "\n    <no source location>")?;
        }
        for (depth, frame) in self.frames.iter().enumerate() {
            write!(f, "\n    #{} {}", depth, frame)?;
        }
        Ok(())
    }
}
