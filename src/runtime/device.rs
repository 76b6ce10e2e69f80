//! Device runtime and the per-thread ABI
//!
//! A [`Device`] owns the shared global table and one [`ThreadState`] per
//! thread of the largest grid it can run. Instrumented code talks to the
//! runtime through a [`ThreadContext`], which pairs the shared state with the
//! executing thread's private state. Every entry point of the runtime ABI is a
//! method on the context; the `Unknown` kind dispatches on the pointer's kind
//! bit (or, for allocations, on the address range).
//!
//! A failing entry point reports a [`Diagnostic`], halts its thread and makes
//! every later call on that thread return [`Violation::ThreadHalted`]. Other
//! threads keep running.

use super::pointer::{AllocationKind, PointerCodec};
use super::table::{GlobalTable, LocalTable, RecordLookup};
use super::tracker::{AllocationInfo, CheckEngine};
use super::trap::{AccessSite, Diagnostic, LeakReport, Violation};
use crate::config::SanitizerConfig;
use crate::error::{Error, Result};
use crate::location::{self, LocationTable};
use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;

/// State shared by every thread of a device
#[derive(Debug)]
pub struct SharedState {
    config: SanitizerConfig,
    engine: CheckEngine,
    globals: GlobalTable,
    locations: LocationTable,
    diagnostics: Mutex<Vec<Diagnostic>>,
    leaks: Mutex<Vec<LeakReport>>,
    host_buffers: DashMap<u64, u64>,
}

impl SharedState {
    /// Runtime configuration
    pub fn config(&self) -> &SanitizerConfig {
        &self.config
    }

    /// Shared global table
    pub fn globals(&self) -> &GlobalTable {
        &self.globals
    }

    /// Source-location table used to render diagnostics
    pub fn locations(&self) -> &LocationTable {
        &self.locations
    }

    fn record_leaks(&self) -> Vec<LeakReport> {
        let leaks = self.engine.leak_check(&self.globals);
        for leak in &leaks {
            tracing::warn!(slot = leak.slot, "{}", leak);
        }
        self.leaks.lock().extend(leaks.iter().copied());
        leaks
    }
}

/// Private state of one device thread
#[derive(Debug, Clone)]
pub struct ThreadState {
    id: u32,
    locals: LocalTable,
    call_site: u64,
    halted: Option<Violation>,
}

impl ThreadState {
    fn new(id: u32, config: &SanitizerConfig) -> Self {
        Self {
            id,
            locals: LocalTable::new(config.local_layout),
            call_site: 0,
            halted: None,
        }
    }

    fn reset(&mut self) {
        self.locals.reset();
        self.call_site = 0;
        self.halted = None;
    }

    /// Thread id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Violation that halted the thread, if any
    pub fn halted(&self) -> Option<&Violation> {
        self.halted.as_ref()
    }

    /// Thread-local allocation table
    pub fn locals(&self) -> &LocalTable {
        &self.locals
    }
}

/// Parallel arrays of a merged check
#[derive(Debug, Clone, Copy)]
pub struct CheckBatch<'a> {
    /// Tracked pointers
    pub ptrs: &'a [u64],
    /// Access widths
    pub sizes: &'a [u64],
    /// Access ids
    pub access_ids: &'a [i64],
    /// Source ids
    pub source_ids: &'a [i64],
    /// Program counter of the merged call
    pub pc: u64,
}

impl<'a> CheckBatch<'a> {
    /// Number of lanes; the shortest array wins
    pub fn len(&self) -> usize {
        self.ptrs
            .len()
            .min(self.sizes.len())
            .min(self.access_ids.len())
            .min(self.source_ids.len())
    }

    /// Whether the batch has no lanes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn site(&self, lane: usize) -> AccessSite {
        AccessSite::access(self.access_ids[lane], self.source_ids[lane], self.pc)
    }
}

/// Outcome of a grid launch
#[derive(Debug, Clone, Default)]
pub struct LaunchReport {
    /// Threads launched
    pub threads: u32,
    /// Diagnostics raised during the launch
    pub diagnostics: Vec<Diagnostic>,
    /// Threads that ended halted, ascending
    pub halted: Vec<u32>,
}

impl LaunchReport {
    /// Whether no thread trapped
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Runtime of one accelerator
#[derive(Debug)]
pub struct Device {
    shared: SharedState,
    threads: Vec<ThreadState>,
}

impl Device {
    /// Create a device with an empty location table
    pub fn new(config: SanitizerConfig) -> Result<Self> {
        Self::with_locations(config, LocationTable::default())
    }

    /// Create a device that renders diagnostics through `locations`
    pub fn with_locations(config: SanitizerConfig, locations: LocationTable) -> Result<Self> {
        config.validate()?;
        let threads = (0..config.max_threads)
            .map(|id| ThreadState::new(id, &config))
            .collect();
        let shared = SharedState {
            engine: CheckEngine::new(config.codec(), config.use_tags),
            globals: GlobalTable::new(config.global_layout),
            locations,
            diagnostics: Mutex::new(Vec::new()),
            leaks: Mutex::new(Vec::new()),
            host_buffers: DashMap::new(),
            config,
        };
        Ok(Self { shared, threads })
    }

    /// Replace the location table (after instrumenting another module)
    pub fn set_locations(&mut self, locations: LocationTable) {
        self.shared.locations = locations;
    }

    /// Runtime configuration
    pub fn config(&self) -> &SanitizerConfig {
        &self.shared.config
    }

    /// Check engine shared by all threads
    pub fn engine(&self) -> &CheckEngine {
        &self.shared.engine
    }

    /// Shared global table
    pub fn globals(&self) -> &GlobalTable {
        &self.shared.globals
    }

    /// Private state of one thread
    pub fn thread(&self, thread: u32) -> Option<&ThreadState> {
        self.threads.get(thread as usize)
    }

    /// Execution context of one thread
    pub fn context(&mut self, thread: u32) -> Result<ThreadContext<'_>> {
        let max = self.shared.config.max_threads;
        let state = self
            .threads
            .get_mut(thread as usize)
            .ok_or(Error::InvalidThread { thread, max })?;
        Ok(ThreadContext {
            shared: &self.shared,
            state,
        })
    }

    /// Run `kernel` once per thread on a worker pool
    ///
    /// Thread states are reset first, so every launch starts with empty local
    /// tables and cleared call-site words.
    pub fn launch<F>(&mut self, threads: u32, kernel: F) -> Result<LaunchReport>
    where
        F: Fn(&mut ThreadContext<'_>) -> std::result::Result<(), Violation> + Sync,
    {
        let before = self.prepare(threads)?;
        let workers = self.shared.config.workers.min(threads as usize).max(1);
        tracing::debug!(threads, workers, "launching grid");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::ThreadPool(format!("Failed to create thread pool: {}", e)))?;

        let shared = &self.shared;
        let states = &mut self.threads[..threads as usize];
        pool.install(|| {
            states.par_iter_mut().for_each(|state| {
                let mut ctx = ThreadContext { shared, state };
                // The context already reported and halted on failure.
                let _ = kernel(&mut ctx);
            })
        });
        Ok(self.report(threads, before))
    }

    /// Run `kernel` once per thread, in thread-id order, on the calling thread
    pub fn launch_sequential<F>(&mut self, threads: u32, mut kernel: F) -> Result<LaunchReport>
    where
        F: FnMut(&mut ThreadContext<'_>) -> std::result::Result<(), Violation>,
    {
        let before = self.prepare(threads)?;
        let shared = &self.shared;
        for state in &mut self.threads[..threads as usize] {
            let mut ctx = ThreadContext { shared, state };
            let _ = kernel(&mut ctx);
        }
        Ok(self.report(threads, before))
    }

    fn prepare(&mut self, threads: u32) -> Result<usize> {
        let max = self.shared.config.max_threads;
        if threads > max {
            return Err(Error::InvalidThread {
                thread: threads,
                max,
            });
        }
        for state in &mut self.threads[..threads as usize] {
            state.reset();
        }
        Ok(self.shared.diagnostics.lock().len())
    }

    fn report(&self, threads: u32, before: usize) -> LaunchReport {
        let diagnostics = self.shared.diagnostics.lock()[before..].to_vec();
        let halted = self.threads[..threads as usize]
            .iter()
            .filter(|t| t.halted.is_some())
            .map(|t| t.id)
            .collect();
        LaunchReport {
            threads,
            diagnostics,
            halted,
        }
    }

    /// Register a host-provided buffer as a global allocation
    pub fn register_host(&self, start: u64, length: u64, slot: Option<u32>) -> Result<u64> {
        let ptr = self.shared.engine.create_global(
            &self.shared.globals,
            start,
            length,
            0,
            slot,
            AccessSite::host(),
        )?;
        self.shared.host_buffers.insert(start, ptr);
        tracing::debug!(start, length, "registered host buffer");
        Ok(ptr)
    }

    /// Retire a host buffer registered at `start`; false if none was
    pub fn unregister_host(&self, start: u64) -> Result<bool> {
        match self.shared.host_buffers.remove(&start) {
            Some((_, ptr)) => {
                self.shared
                    .engine
                    .remove_global(&self.shared.globals, ptr, AccessSite::host())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tracked pointer of a registered host buffer
    pub fn host_pointer(&self, start: u64) -> Option<u64> {
        self.shared.host_buffers.get(&start).map(|entry| *entry)
    }

    /// Report live global allocations (each at most once)
    pub fn leak_check(&self) -> Vec<LeakReport> {
        self.shared.record_leaks()
    }

    /// Every diagnostic raised so far
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.shared.diagnostics.lock().clone()
    }

    /// Every leak reported so far
    pub fn leaks(&self) -> Vec<LeakReport> {
        self.shared.leaks.lock().clone()
    }
}

/// One thread's view of the device; all runtime entry points live here
#[derive(Debug)]
pub struct ThreadContext<'d> {
    shared: &'d SharedState,
    state: &'d mut ThreadState,
}

type Outcome<T> = std::result::Result<T, Violation>;

impl<'d> ThreadContext<'d> {
    /// Executing thread
    pub fn thread_id(&self) -> u32 {
        self.state.id
    }

    /// Whether an earlier violation stopped this thread
    pub fn is_halted(&self) -> bool {
        self.state.halted.is_some()
    }

    /// Current call-site word
    pub fn call_site(&self) -> u64 {
        self.state.call_site
    }

    /// Shared device state
    pub fn shared(&self) -> &SharedState {
        self.shared
    }

    /// Thread-local allocation table
    pub fn locals(&self) -> &LocalTable {
        &self.state.locals
    }

    fn guard(&self) -> Outcome<()> {
        match self.state.halted {
            Some(_) => Err(Violation::ThreadHalted {
                thread: self.state.id,
            }),
            None => Ok(()),
        }
    }

    fn finish<T>(&mut self, result: Outcome<T>) -> Outcome<T> {
        result.map_err(|violation| self.trap(violation))
    }

    fn trap(&mut self, violation: Violation) -> Violation {
        let frames = violation
            .site()
            .map(|site| {
                self.shared
                    .locations
                    .resolve(site.source_id, self.state.call_site)
            })
            .unwrap_or_default();
        let diagnostic = Diagnostic {
            thread: self.state.id,
            violation: violation.clone(),
            frames,
        };
        tracing::error!(
            thread = self.state.id,
            category = violation.category(),
            "{}",
            diagnostic
        );
        self.shared.diagnostics.lock().push(diagnostic);
        self.state.halted = Some(violation.clone());
        violation
    }

    fn resolve(kind: AllocationKind, word: u64) -> AllocationKind {
        match kind {
            AllocationKind::Unknown => PointerCodec::kind_of(word),
            kind => kind,
        }
    }

    fn table(&self, kind: AllocationKind) -> &dyn RecordLookup {
        match kind {
            AllocationKind::Global => &self.shared.globals,
            _ => &self.state.locals,
        }
    }

    /// `new`: register an allocation and return its tracked pointer
    ///
    /// `Unknown` picks the table from the address range; `System` memory is
    /// not tracked and the address comes back unchanged.
    pub fn allocate(
        &mut self,
        kind: AllocationKind,
        start: u64,
        length: u64,
        allocation_id: u32,
        site: AccessSite,
    ) -> Outcome<u64> {
        self.guard()?;
        let kind = match kind {
            AllocationKind::Unknown if self.shared.config.is_local_address(start) => {
                AllocationKind::Local
            }
            AllocationKind::Unknown => AllocationKind::Global,
            kind => kind,
        };
        let engine = self.shared.engine;
        let result = match kind {
            AllocationKind::Local => {
                engine.create_local(&mut self.state.locals, start, length, allocation_id, site)
            }
            AllocationKind::Global => engine.create_global(
                &self.shared.globals,
                start,
                length,
                allocation_id,
                None,
                site,
            ),
            AllocationKind::System | AllocationKind::Unknown => Ok(start),
        };
        self.finish(result)
    }

    /// `free`: retire one allocation
    pub fn free(&mut self, kind: AllocationKind, ptr: u64, site: AccessSite) -> Outcome<()> {
        self.guard()?;
        let engine = self.shared.engine;
        let result = match Self::resolve(kind, ptr) {
            AllocationKind::Local => engine.remove_local(&mut self.state.locals, ptr, site),
            AllocationKind::Global => engine.remove_global(&self.shared.globals, ptr, site),
            _ => Ok(()),
        };
        self.finish(result)
    }

    /// `free_n`: retire the `count` most recent local allocations
    pub fn free_n(&mut self, count: u32) -> Outcome<()> {
        self.guard()?;
        self.shared.engine.remove_n(&mut self.state.locals, count);
        Ok(())
    }

    /// `check`: validate an access and return the real address
    pub fn check(
        &mut self,
        kind: AllocationKind,
        ptr: u64,
        size: u64,
        site: AccessSite,
    ) -> Outcome<u64> {
        self.guard()?;
        let result = match Self::resolve(kind, ptr) {
            AllocationKind::System => Ok(ptr),
            kind => self.shared.engine.check(self.table(kind), ptr, size, site),
        };
        self.finish(result)
    }

    /// `check_void`: validate an access
    pub fn check_void(
        &mut self,
        kind: AllocationKind,
        ptr: u64,
        size: u64,
        site: AccessSite,
    ) -> Outcome<()> {
        self.check(kind, ptr, size, site).map(|_| ())
    }

    /// `check_with_base`: validate against a cached record and return the real address
    pub fn check_with_base(
        &mut self,
        kind: AllocationKind,
        ptr: u64,
        info: AllocationInfo,
        size: u64,
        site: AccessSite,
    ) -> Outcome<u64> {
        self.guard()?;
        let result = match Self::resolve(kind, ptr) {
            AllocationKind::System => Ok(ptr),
            kind => self
                .shared
                .engine
                .check_with_base(self.table(kind), ptr, info, size, site),
        };
        self.finish(result)
    }

    /// `check_with_base_void`: validate against a cached record
    pub fn check_with_base_void(
        &mut self,
        kind: AllocationKind,
        ptr: u64,
        info: AllocationInfo,
        size: u64,
        site: AccessSite,
    ) -> Outcome<()> {
        self.check_with_base(kind, ptr, info, size, site).map(|_| ())
    }

    /// `check_range`: validate a hoisted loop range
    pub fn check_range(
        &mut self,
        kind: AllocationKind,
        max: u64,
        min: u64,
        size: u64,
        site: AccessSite,
    ) -> Outcome<()> {
        self.guard()?;
        let result = match Self::resolve(kind, max) {
            AllocationKind::System => Ok(()),
            kind => self
                .shared
                .engine
                .check_range(self.table(kind), max, min, size, site),
        };
        self.finish(result)
    }

    /// `check_range_with_base`: validate a hoisted loop range against a cached record
    pub fn check_range_with_base(
        &mut self,
        kind: AllocationKind,
        max: u64,
        min: u64,
        info: AllocationInfo,
        size: u64,
        site: AccessSite,
    ) -> Outcome<()> {
        self.guard()?;
        let result = match Self::resolve(kind, max) {
            AllocationKind::System => Ok(()),
            kind => self.shared.engine.check_range_with_base(
                self.table(kind),
                max,
                min,
                info,
                size,
                site,
            ),
        };
        self.finish(result)
    }

    /// Merged `check` over parallel arrays; lanes are validated in order
    pub fn check_vec(&mut self, kind: AllocationKind, batch: &CheckBatch<'_>) -> Outcome<Vec<u64>> {
        (0..batch.len())
            .map(|lane| self.check(kind, batch.ptrs[lane], batch.sizes[lane], batch.site(lane)))
            .collect()
    }

    /// Merged `check_with_base`; `bases[i]` is the cached record of lane `i`
    pub fn check_with_base_vec(
        &mut self,
        kind: AllocationKind,
        batch: &CheckBatch<'_>,
        bases: &[AllocationInfo],
    ) -> Outcome<Vec<u64>> {
        (0..batch.len().min(bases.len()))
            .map(|lane| {
                self.check_with_base(
                    kind,
                    batch.ptrs[lane],
                    bases[lane],
                    batch.sizes[lane],
                    batch.site(lane),
                )
            })
            .collect()
    }

    /// `gep`: move a tracked pointer by `delta` bytes; raw addresses move like integers
    pub fn gep(&mut self, ptr: u64, delta: i64, _source_id: i64) -> Outcome<u64> {
        self.guard()?;
        if !PointerCodec::has_magic(ptr) {
            return Ok(ptr.wrapping_add(delta as u64));
        }
        Ok(self.shared.engine.advance(ptr, delta))
    }

    /// `unpack`: real address without bounds validation
    pub fn unpack(&mut self, kind: AllocationKind, ptr: u64, source_id: i64) -> Outcome<u64> {
        self.guard()?;
        let site = AccessSite::at(source_id, 0);
        let result = match Self::resolve(kind, ptr) {
            AllocationKind::System => Ok(ptr),
            kind => self.shared.engine.unpack(self.table(kind), ptr, site),
        };
        self.finish(result)
    }

    /// `lifetime_start`: make a local allocation accessible
    pub fn lifetime_start(&mut self, ptr: u64, length: u64, site: AccessSite) -> Outcome<()> {
        self.guard()?;
        let result =
            self.shared
                .engine
                .lifetime_start(&mut self.state.locals, ptr, length, site);
        self.finish(result)
    }

    /// `lifetime_end`: make a local allocation inaccessible
    pub fn lifetime_end(&mut self, ptr: u64, _length: u64, site: AccessSite) -> Outcome<()> {
        self.guard()?;
        let result = self
            .shared
            .engine
            .lifetime_end(&mut self.state.locals, ptr, site);
        self.finish(result)
    }

    /// Record of the allocation `ptr` points into, for `*_with_base` checks
    pub fn allocation_info(&mut self, kind: AllocationKind, ptr: u64) -> Outcome<AllocationInfo> {
        self.guard()?;
        let kind = Self::resolve(kind, ptr);
        Ok(self.shared.engine.allocation_info(self.table(kind), ptr))
    }

    /// Enter ambiguous call `index`; returns the word to restore afterwards
    pub fn push_call_site(&mut self, index: u32, bits: u32) -> Outcome<u64> {
        self.guard()?;
        let old = self.state.call_site;
        self.state.call_site = location::push_call_site(old, index, bits);
        Ok(old)
    }

    /// Leave an ambiguous call
    pub fn restore_call_site(&mut self, word: u64) -> Outcome<()> {
        self.guard()?;
        self.state.call_site = word;
        Ok(())
    }

    /// Kernel entry: no dynamic callers recorded
    pub fn reset_call_site(&mut self) -> Outcome<()> {
        self.guard()?;
        self.state.call_site = 0;
        Ok(())
    }

    /// `leak_check`: report live global allocations
    pub fn leak_check(&mut self) -> Outcome<Vec<LeakReport>> {
        self.guard()?;
        Ok(self.shared.record_leaks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new(SanitizerConfig {
            max_threads: 8,
            workers: 2,
            ..SanitizerConfig::default()
        })
        .unwrap()
    }

    fn site(id: i64) -> AccessSite {
        AccessSite::access(id, -1, 0x10)
    }

    #[test]
    fn test_unknown_dispatch() {
        let mut dev = device();
        let local_addr = dev.config().local_segment.thread_base(0);
        let mut ctx = dev.context(0).unwrap();

        let local = ctx
            .allocate(AllocationKind::Unknown, local_addr, 16, 1, site(0))
            .unwrap();
        let global = ctx
            .allocate(AllocationKind::Unknown, 0x1000, 16, 2, site(0))
            .unwrap();
        assert_eq!(PointerCodec::kind_of(local), AllocationKind::Local);
        assert_eq!(PointerCodec::kind_of(global), AllocationKind::Global);

        assert_eq!(
            ctx.check(AllocationKind::Unknown, local, 8, site(-1)),
            Ok(local_addr)
        );
        assert_eq!(
            ctx.check(AllocationKind::Unknown, global, 8, site(-2)),
            Ok(0x1000)
        );
    }

    #[test]
    fn test_violation_halts_thread() {
        let mut dev = device();
        {
            let mut ctx = dev.context(1).unwrap();
            let ptr = ctx
                .allocate(AllocationKind::Global, 0x1000, 4, 1, site(0))
                .unwrap();
            assert!(ctx.check(AllocationKind::Global, ptr, 8, site(1)).is_err());
            assert!(ctx.is_halted());
            assert_eq!(
                ctx.gep(ptr, 1, -1),
                Err(Violation::ThreadHalted { thread: 1 })
            );
        }
        assert_eq!(dev.diagnostics().len(), 1);
        assert!(dev.context(2).unwrap().free_n(0).is_ok());
    }

    #[test]
    fn test_vector_check_stops_at_first_failure() {
        let mut dev = device();
        let mut ctx = dev.context(0).unwrap();
        let ptr = ctx
            .allocate(AllocationKind::Global, 0x1000, 8, 1, site(0))
            .unwrap();
        let ptrs = [ptr, ptr, ptr];
        let sizes = [4, 16, 1];
        let access_ids = [-1, 1, -2];
        let source_ids = [-1, -1, -1];
        let batch = CheckBatch {
            ptrs: &ptrs,
            sizes: &sizes,
            access_ids: &access_ids,
            source_ids: &source_ids,
            pc: 7,
        };
        let err = ctx.check_vec(AllocationKind::Global, &batch).unwrap_err();
        assert_eq!(err.site().map(|s| s.access_id), Some(1));
    }

    #[test]
    fn test_call_site_push_restore() {
        let mut dev = device();
        let mut ctx = dev.context(0).unwrap();
        let outer = ctx.push_call_site(0, 2).unwrap();
        let inner = ctx.push_call_site(2, 2).unwrap();
        assert_eq!(ctx.call_site(), (1 << 2) | 3);
        ctx.restore_call_site(inner).unwrap();
        assert_eq!(ctx.call_site(), 1);
        ctx.restore_call_site(outer).unwrap();
        assert_eq!(ctx.call_site(), 0);
    }

    #[test]
    fn test_host_registration() {
        let dev = device();
        let ptr = dev.register_host(0x4000, 128, None).unwrap();
        assert_eq!(dev.host_pointer(0x4000), Some(ptr));
        assert_eq!(dev.leak_check().len(), 1);
        assert!(dev.unregister_host(0x4000).unwrap());
        assert!(!dev.unregister_host(0x4000).unwrap());
        assert!(dev.leak_check().is_empty());
    }

    #[test]
    fn test_parallel_launch_distinct_global_slots() {
        let mut dev = device();
        let slots = Mutex::new(Vec::new());
        let report = dev
            .launch(8, |ctx| {
                let start = 0x10_0000 + u64::from(ctx.thread_id()) * 64;
                let ptr = ctx.allocate(AllocationKind::Global, start, 64, 1, site(0))?;
                ctx.check_void(AllocationKind::Global, ptr, 64, site(1))?;
                slots.lock().push(ptr);
                Ok(())
            })
            .unwrap();
        assert!(report.is_clean());
        let mut slots = slots.into_inner();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 8);
    }

    #[test]
    fn test_launch_reports_halted_threads() {
        let mut dev = device();
        let report = dev
            .launch_sequential(4, |ctx| {
                let base = dev_local_base(ctx);
                let ptr = ctx.allocate(AllocationKind::Local, base, 8, 1, site(0))?;
                let size = if ctx.thread_id() == 2 { 9 } else { 8 };
                ctx.check_void(AllocationKind::Local, ptr, size, site(-1))?;
                ctx.free_n(1)
            })
            .unwrap();
        assert_eq!(report.halted, vec![2]);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].thread, 2);
    }

    fn dev_local_base(ctx: &ThreadContext<'_>) -> u64 {
        ctx.shared()
            .config()
            .local_segment
            .thread_base(ctx.thread_id())
    }

    #[test]
    fn test_launch_rejects_oversized_grid() {
        let mut dev = device();
        assert!(matches!(
            dev.launch_sequential(9, |_| Ok(())),
            Err(Error::InvalidThread { .. })
        ));
    }
}
