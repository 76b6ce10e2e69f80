//! Device-side allocation tracking
//!
//! Everything in here operates on machine words only: tracked pointers, real
//! addresses, sizes and ids. No knowledge of the instrumented program is
//! needed beyond the location table used to render diagnostics.
//!
//! ```text
//! runtime/
//! ├── pointer.rs  # AllocationKind, PointerLayout, PointerCodec
//! ├── table.rs    # LocalTable (per thread), GlobalTable (shared, atomic)
//! ├── tracker.rs  # CheckEngine: create/remove/check/range/unpack/leak
//! ├── trap.rs     # Violation, Diagnostic, LeakReport
//! └── device.rs   # Device, ThreadContext (the runtime ABI), grid launch
//! ```

pub mod device;
pub mod pointer;
pub mod table;
pub mod tracker;
pub mod trap;

pub use device::{CheckBatch, Device, LaunchReport, SharedState, ThreadContext, ThreadState};
pub use pointer::{AllocationKind, PointerCodec, PointerLayout, TrackedPointer};
pub use table::{AllocationRecord, GlobalTable, LocalTable, RecordLookup};
pub use tracker::{AllocationInfo, CheckEngine};
pub use trap::{AccessSite, Diagnostic, LeakReport, Violation};
