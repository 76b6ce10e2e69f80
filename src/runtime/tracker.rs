//! Check engine
//!
//! Pure operations over a pointer codec and the allocation tables. Nothing in
//! here knows about threads, halting, or source locations; failures are
//! returned as [`Violation`]s for the caller to report.

use super::pointer::{AllocationKind, PointerCodec, TrackedPointer};
use super::table::{AllocationRecord, GlobalTable, LocalTable, RecordLookup};
use super::trap::{AccessSite, LeakReport, Violation};

/// Allocation record cached by instrumented code for `*_with_base` checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationInfo {
    /// Real start address
    pub start: u64,
    /// Length at the time the info was fetched
    pub length: u64,
    /// Tag at the time the info was fetched
    pub tag: u32,
}

impl From<AllocationRecord> for AllocationInfo {
    fn from(record: AllocationRecord) -> Self {
        Self {
            start: record.start,
            length: record.length,
            tag: record.tag,
        }
    }
}

/// Validates tracked pointers against allocation tables
#[derive(Debug, Clone, Copy)]
pub struct CheckEngine {
    codec: PointerCodec,
    use_tags: bool,
}

impl CheckEngine {
    /// Create an engine over a codec
    pub fn new(codec: PointerCodec, use_tags: bool) -> Self {
        Self { codec, use_tags }
    }

    /// The codec pointers are packed with
    pub fn codec(&self) -> &PointerCodec {
        &self.codec
    }

    /// Whether generation tags are compared
    pub fn uses_tags(&self) -> bool {
        self.use_tags
    }

    /// Register a thread-local allocation
    pub fn create_local(
        &self,
        table: &mut LocalTable,
        start: u64,
        length: u64,
        id: u32,
        site: AccessSite,
    ) -> Result<u64, Violation> {
        self.check_length(AllocationKind::Local, length, site)?;
        let slot = table
            .claim()
            .map_err(|slot| Violation::ExceedsAllocationSlots {
                kind: AllocationKind::Local,
                slot,
                capacity: table.capacity(),
                site,
            })?;
        let tag = table.store(slot, start, length, id, self.use_tags);
        Ok(self
            .codec
            .encode(&TrackedPointer::new(AllocationKind::Local, slot, tag)))
    }

    /// Register a global allocation, optionally in a caller-chosen slot
    pub fn create_global(
        &self,
        table: &GlobalTable,
        start: u64,
        length: u64,
        id: u32,
        requested_slot: Option<u32>,
        site: AccessSite,
    ) -> Result<u64, Violation> {
        self.check_length(AllocationKind::Global, length, site)?;
        let slot = table
            .claim(requested_slot)
            .map_err(|slot| Violation::ExceedsAllocationSlots {
                kind: AllocationKind::Global,
                slot,
                capacity: table.capacity(),
                site,
            })?;
        let tag = table.store(slot, start, length, id, self.use_tags);
        Ok(self
            .codec
            .encode(&TrackedPointer::new(AllocationKind::Global, slot, tag)))
    }

    fn check_length(
        &self,
        kind: AllocationKind,
        length: u64,
        site: AccessSite,
    ) -> Result<(), Violation> {
        let max = self.codec.layout(kind).max_length();
        if length >= max {
            return Err(Violation::ExceedsAllocationLength {
                kind,
                length,
                max,
                site,
            });
        }
        Ok(())
    }

    /// Retire a thread-local allocation
    pub fn remove_local(
        &self,
        table: &mut LocalTable,
        word: u64,
        site: AccessSite,
    ) -> Result<(), Violation> {
        let ptr = self.decode(table, word, site)?;
        table.retire(ptr.slot);
        Ok(())
    }

    /// Retire a global allocation
    pub fn remove_global(
        &self,
        table: &GlobalTable,
        word: u64,
        site: AccessSite,
    ) -> Result<(), Violation> {
        let ptr = self.decode(table, word, site)?;
        table.retire(ptr.slot);
        Ok(())
    }

    /// Retire the `count` most recent thread-local allocations
    pub fn remove_n(&self, table: &mut LocalTable, count: u32) {
        table.retire_n(count);
    }

    /// Pointer arithmetic on the offset field
    pub fn advance(&self, word: u64, delta: i64) -> u64 {
        self.codec.advance(word, delta)
    }

    /// Decode a word that must point into `table`
    pub fn decode<T: RecordLookup + ?Sized>(
        &self,
        table: &T,
        word: u64,
        site: AccessSite,
    ) -> Result<TrackedPointer, Violation> {
        match self.codec.decode(word) {
            Some(ptr) if ptr.kind == table.kind() => Ok(ptr),
            _ => Err(Violation::GarbagePointer {
                kind: table.kind(),
                word,
                site,
            }),
        }
    }

    /// Validate an access and return the real address
    pub fn check<T: RecordLookup + ?Sized>(
        &self,
        table: &T,
        word: u64,
        size: u64,
        site: AccessSite,
    ) -> Result<u64, Violation> {
        let ptr = self.decode(table, word, site)?;
        let record = table.lookup(ptr.slot).unwrap_or_default();
        self.validate(table, &ptr, record.into(), size, site)?;
        Ok(record.start.wrapping_add(ptr.offset as u64))
    }

    /// Validate an access against a cached record and return the real address
    ///
    /// A cached local length of 0 means the lifetime had not started when the
    /// info was fetched, so the current length is re-read from the table.
    pub fn check_with_base<T: RecordLookup + ?Sized>(
        &self,
        table: &T,
        word: u64,
        info: AllocationInfo,
        size: u64,
        site: AccessSite,
    ) -> Result<u64, Violation> {
        let ptr = self.decode(table, word, site)?;
        let info = self.refresh(table, &ptr, info);
        self.validate(table, &ptr, info, size, site)?;
        Ok(info.start.wrapping_add(ptr.offset as u64))
    }

    /// Validate every address between `min` and `max` (inclusive) for `size`-byte accesses
    pub fn check_range<T: RecordLookup + ?Sized>(
        &self,
        table: &T,
        max: u64,
        min: u64,
        size: u64,
        site: AccessSite,
    ) -> Result<(), Violation> {
        let hi = self.decode(table, max, site)?;
        let record = table.lookup(hi.slot).unwrap_or_default();
        self.validate_range(table, hi, min, record.into(), size, site)
    }

    /// [`CheckEngine::check_range`] against a cached record
    pub fn check_range_with_base<T: RecordLookup + ?Sized>(
        &self,
        table: &T,
        max: u64,
        min: u64,
        info: AllocationInfo,
        size: u64,
        site: AccessSite,
    ) -> Result<(), Violation> {
        let hi = self.decode(table, max, site)?;
        let info = self.refresh(table, &hi, info);
        self.validate_range(table, hi, min, info, size, site)
    }

    fn validate_range<T: RecordLookup + ?Sized>(
        &self,
        table: &T,
        hi: TrackedPointer,
        min: u64,
        info: AllocationInfo,
        size: u64,
        site: AccessSite,
    ) -> Result<(), Violation> {
        let lo = self.decode(table, min, site)?;
        if lo.slot != hi.slot {
            return Err(Violation::GarbagePointer {
                kind: table.kind(),
                word: min,
                site,
            });
        }
        self.validate(table, &hi, info, size, site)?;
        // Only the lower bound matters for the smallest address.
        self.validate(table, &lo, info, 0, site)
    }

    /// Resolve to a real address without bounds validation
    ///
    /// Null stays null so optional pointer arguments can cross into
    /// uninstrumented code.
    pub fn unpack<T: RecordLookup + ?Sized>(
        &self,
        table: &T,
        word: u64,
        site: AccessSite,
    ) -> Result<u64, Violation> {
        if word == 0 {
            return Ok(0);
        }
        let ptr = self.decode(table, word, site)?;
        let record = table.lookup(ptr.slot).unwrap_or_default();
        Ok(record.start.wrapping_add(ptr.offset as u64))
    }

    /// Record of the allocation `word` points into
    ///
    /// Values that cannot be decoded yield an info that fails every check.
    pub fn allocation_info<T: RecordLookup + ?Sized>(&self, table: &T, word: u64) -> AllocationInfo {
        match self.codec.decode(word) {
            Some(ptr) if ptr.kind == table.kind() => table
                .lookup(ptr.slot)
                .map(AllocationInfo::from)
                .unwrap_or(AllocationInfo {
                    start: word,
                    length: 0,
                    tag: u32::MAX,
                }),
            _ => AllocationInfo {
                start: word,
                length: 0,
                tag: u32::MAX,
            },
        }
    }

    /// Start the lifetime of a thread-local allocation
    pub fn lifetime_start(
        &self,
        table: &mut LocalTable,
        word: u64,
        length: u64,
        site: AccessSite,
    ) -> Result<(), Violation> {
        let ptr = self.decode(table, word, site)?;
        table.set_length(ptr.slot, length);
        Ok(())
    }

    /// End the lifetime of a thread-local allocation
    pub fn lifetime_end(
        &self,
        table: &mut LocalTable,
        word: u64,
        site: AccessSite,
    ) -> Result<(), Violation> {
        let ptr = self.decode(table, word, site)?;
        table.set_length(ptr.slot, 0);
        Ok(())
    }

    /// Global allocations still alive, each reported once per occupancy
    pub fn leak_check(&self, table: &GlobalTable) -> Vec<LeakReport> {
        table
            .take_unreported()
            .into_iter()
            .map(|(slot, record)| LeakReport {
                slot,
                allocation_id: record.id,
                start: record.start,
                length: record.length,
            })
            .collect()
    }

    fn refresh<T: RecordLookup + ?Sized>(
        &self,
        table: &T,
        ptr: &TrackedPointer,
        mut info: AllocationInfo,
    ) -> AllocationInfo {
        if table.kind() == AllocationKind::Local && info.length == 0 {
            if let Some(record) = table.lookup(ptr.slot) {
                info.length = record.length;
            }
        }
        info
    }

    fn validate<T: RecordLookup + ?Sized>(
        &self,
        table: &T,
        ptr: &TrackedPointer,
        info: AllocationInfo,
        size: u64,
        site: AccessSite,
    ) -> Result<(), Violation> {
        let tag_mask = table.layout().tag_mask();
        let stale = self.use_tags && (ptr.tag ^ info.tag) & tag_mask != 0;
        if stale || info.length == 0 {
            return Err(Violation::UseAfterFree {
                kind: table.kind(),
                slot: ptr.slot,
                allocation_id: self.allocation_id(table, ptr.slot),
                pointer_tag: ptr.tag,
                record_tag: info.tag & tag_mask,
                site,
            });
        }
        let end = i128::from(ptr.offset) + i128::from(size);
        if ptr.offset < 0 || end > i128::from(info.length) {
            return Err(Violation::OutOfBounds {
                kind: table.kind(),
                slot: ptr.slot,
                allocation_id: self.allocation_id(table, ptr.slot),
                offset: ptr.offset,
                size,
                length: info.length,
                site,
            });
        }
        Ok(())
    }

    fn allocation_id<T: RecordLookup + ?Sized>(&self, table: &T, slot: u32) -> u32 {
        table.lookup(slot).map(|r| r.id).unwrap_or(0)
    }
}
