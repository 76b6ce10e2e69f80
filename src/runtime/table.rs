//! Allocation tables
//!
//! Every tracked pointer names a slot in one of two tables. The local table
//! belongs to exactly one thread and follows the call stack: slots are handed
//! out in increasing order and retired in bulk on function return. The global
//! table is shared by all threads; slot claims go through an atomic counter
//! and record fields are atomics that are published with release ordering.
//!
//! Slot 0 is never handed out by either table.

use super::pointer::{AllocationKind, PointerLayout};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// One allocation as seen by the check engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AllocationRecord {
    /// Real start address
    pub start: u64,
    /// Length in bytes; 0 marks a retired slot
    pub length: u64,
    /// Generation tag of the current occupant
    pub tag: u32,
    /// Allocation site id, for diagnostics
    pub id: u32,
}

impl AllocationRecord {
    /// Whether the slot currently holds a live allocation
    pub fn is_live(&self) -> bool {
        self.length != 0
    }
}

/// Read access to a table, shared by the check entry points
pub trait RecordLookup {
    /// Kind of the pointers this table resolves
    fn kind(&self) -> AllocationKind;

    /// Field widths of pointers into this table
    fn layout(&self) -> &PointerLayout;

    /// Record stored in `slot`, if the slot exists
    fn lookup(&self, slot: u32) -> Option<AllocationRecord>;
}

/// Per-thread stack-discipline table
#[derive(Debug, Clone)]
pub struct LocalTable {
    layout: PointerLayout,
    records: Vec<AllocationRecord>,
    counter: u32,
}

impl LocalTable {
    /// Create an empty table; records are materialized on first use
    pub fn new(layout: PointerLayout) -> Self {
        Self {
            layout,
            records: vec![AllocationRecord::default()],
            counter: 0,
        }
    }

    /// Most recently claimed slot (0 when empty)
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Number of slots the slot field can address
    pub fn capacity(&self) -> u64 {
        self.layout.slot_capacity()
    }

    /// Claim the next slot, or report the slot that would overflow
    pub fn claim(&mut self) -> Result<u32, u64> {
        let slot = u64::from(self.counter) + 1;
        if slot >= self.capacity() {
            return Err(slot);
        }
        self.counter = slot as u32;
        if self.records.len() <= slot as usize {
            self.records
                .resize(slot as usize + 1, AllocationRecord::default());
        }
        Ok(self.counter)
    }

    /// Fill a claimed slot and return the tag of the new occupant
    pub fn store(&mut self, slot: u32, start: u64, length: u64, id: u32, bump_tag: bool) -> u32 {
        let record = &mut self.records[slot as usize];
        if bump_tag {
            record.tag = record.tag.wrapping_add(1);
        }
        record.start = start;
        record.length = length;
        record.id = id;
        record.tag
    }

    /// Retire one slot; the counter only moves when it is the top slot
    pub fn retire(&mut self, slot: u32) {
        if let Some(record) = self.records.get_mut(slot as usize) {
            record.length = 0;
        }
        if slot == self.counter && slot != 0 {
            self.counter -= 1;
        }
    }

    /// Retire the `count` most recently claimed slots
    pub fn retire_n(&mut self, count: u32) {
        for _ in 0..count {
            if self.counter == 0 {
                break;
            }
            self.records[self.counter as usize].length = 0;
            self.counter -= 1;
        }
    }

    /// Overwrite the length of a slot (lifetime markers)
    pub fn set_length(&mut self, slot: u32, length: u64) -> bool {
        match self.records.get_mut(slot as usize) {
            Some(record) if slot != 0 => {
                record.length = length;
                true
            }
            _ => false,
        }
    }

    /// Forget every allocation, keeping tags so stale pointers stay stale
    pub fn reset(&mut self) {
        for record in &mut self.records {
            record.length = 0;
        }
        self.counter = 0;
    }

    /// Live records with their slots
    pub fn live(&self) -> impl Iterator<Item = (u32, &AllocationRecord)> {
        self.records
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, r)| r.is_live())
            .map(|(slot, r)| (slot as u32, r))
    }
}

impl RecordLookup for LocalTable {
    fn kind(&self) -> AllocationKind {
        AllocationKind::Local
    }

    fn layout(&self) -> &PointerLayout {
        &self.layout
    }

    fn lookup(&self, slot: u32) -> Option<AllocationRecord> {
        if slot == 0 {
            return None;
        }
        // Slots past the materialized prefix have never been claimed.
        Some(self.records.get(slot as usize).copied().unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct GlobalRecord {
    start: AtomicU64,
    length: AtomicU64,
    tag: AtomicU32,
    id: AtomicU32,
    leak_reported: AtomicBool,
}

/// Table shared by all threads of a device
#[derive(Debug)]
pub struct GlobalTable {
    layout: PointerLayout,
    records: Box<[GlobalRecord]>,
    counter: AtomicU64,
}

impl GlobalTable {
    /// Allocate every slot up front; global slot widths are bounded by config validation
    pub fn new(layout: PointerLayout) -> Self {
        let records = (0..layout.slot_capacity())
            .map(|_| GlobalRecord::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            layout,
            records,
            counter: AtomicU64::new(0),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> u64 {
        self.records.len() as u64
    }

    /// Slots claimed through the counter so far
    pub fn claimed(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Claim a slot: the requested one, or the next counter value
    pub fn claim(&self, requested: Option<u32>) -> Result<u32, u64> {
        let slot = match requested {
            Some(slot) => u64::from(slot),
            None => self.counter.fetch_add(1, Ordering::AcqRel) + 1,
        };
        if slot == 0 || slot >= self.capacity() {
            return Err(slot);
        }
        Ok(slot as u32)
    }

    /// Publish a record in a claimed slot and return its new tag
    pub fn store(&self, slot: u32, start: u64, length: u64, id: u32, bump_tag: bool) -> u32 {
        let record = &self.records[slot as usize];
        let tag = if bump_tag {
            record.tag.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
        } else {
            record.tag.load(Ordering::Acquire)
        };
        record.start.store(start, Ordering::Relaxed);
        record.id.store(id, Ordering::Relaxed);
        record.leak_reported.store(false, Ordering::Relaxed);
        record.length.store(length, Ordering::Release);
        tag
    }

    /// Retire a slot with a plain store
    pub fn retire(&self, slot: u32) {
        if let Some(record) = self.records.get(slot as usize) {
            record.length.store(0, Ordering::Relaxed);
        }
    }

    /// Overwrite the length of a live slot
    pub fn set_length(&self, slot: u32, length: u64) -> bool {
        match self.records.get(slot as usize) {
            Some(record) if slot != 0 => {
                record.length.store(length, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Live records that have not been reported as leaks yet
    ///
    /// Each record is returned at most once per occupancy.
    pub fn take_unreported(&self) -> Vec<(u32, AllocationRecord)> {
        let mut leaks = Vec::new();
        for slot in 1..self.records.len() {
            let record = &self.records[slot];
            if record.length.load(Ordering::Acquire) == 0 {
                continue;
            }
            if record.leak_reported.swap(true, Ordering::AcqRel) {
                continue;
            }
            if let Some(snapshot) = self.lookup(slot as u32) {
                leaks.push((slot as u32, snapshot));
            }
        }
        leaks
    }

    /// Live records with their slots
    pub fn live(&self) -> Vec<(u32, AllocationRecord)> {
        (1..self.records.len() as u32)
            .filter_map(|slot| self.lookup(slot).map(|r| (slot, r)))
            .filter(|(_, r)| r.is_live())
            .collect()
    }
}

impl RecordLookup for GlobalTable {
    fn kind(&self) -> AllocationKind {
        AllocationKind::Global
    }

    fn layout(&self) -> &PointerLayout {
        &self.layout
    }

    fn lookup(&self, slot: u32) -> Option<AllocationRecord> {
        if slot == 0 {
            return None;
        }
        let record = self.records.get(slot as usize)?;
        let length = record.length.load(Ordering::Acquire);
        Some(AllocationRecord {
            start: record.start.load(Ordering::Relaxed),
            length,
            tag: record.tag.load(Ordering::Relaxed),
            id: record.id.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn small() -> PointerLayout {
        PointerLayout {
            offset_bits: 16,
            tag_bits: 4,
            slot_bits: 3,
        }
    }

    #[test]
    fn test_local_stack_discipline() {
        let mut table = LocalTable::new(small());
        let a = table.claim().unwrap();
        table.store(a, 0x100, 16, 1, true);
        let b = table.claim().unwrap();
        table.store(b, 0x200, 32, 2, true);
        assert_eq!((a, b), (1, 2));

        table.retire(b);
        assert_eq!(table.counter(), 1);
        assert_eq!(table.claim().unwrap(), 2);
    }

    #[test]
    fn test_local_out_of_order_retire_leaves_gap() {
        let mut table = LocalTable::new(small());
        let a = table.claim().unwrap();
        table.store(a, 0x100, 16, 1, true);
        let b = table.claim().unwrap();
        table.store(b, 0x200, 16, 2, true);

        table.retire(a);
        assert_eq!(table.counter(), 2);
        assert!(!table.lookup(a).unwrap().is_live());
        assert!(table.lookup(b).unwrap().is_live());
    }

    #[test]
    fn test_local_retire_n() {
        let mut table = LocalTable::new(small());
        for id in 0..3 {
            let slot = table.claim().unwrap();
            table.store(slot, 0x100 * u64::from(slot), 8, id, true);
        }
        table.retire_n(2);
        assert_eq!(table.counter(), 1);
        assert_eq!(table.live().count(), 1);
        table.retire_n(10);
        assert_eq!(table.counter(), 0);
    }

    #[test]
    fn test_local_capacity() {
        let mut table = LocalTable::new(small());
        for _ in 1..8 {
            table.claim().unwrap();
        }
        assert_eq!(table.claim(), Err(8));
    }

    #[test]
    fn test_tag_bumps_on_reuse() {
        let mut table = LocalTable::new(small());
        let slot = table.claim().unwrap();
        let first = table.store(slot, 0x100, 8, 1, true);
        table.retire(slot);
        let again = table.claim().unwrap();
        assert_eq!(again, slot);
        let second = table.store(again, 0x100, 8, 1, true);
        assert_ne!(first, second);
    }

    #[test]
    fn test_global_claims_skip_zero() {
        let table = GlobalTable::new(small());
        assert_eq!(table.claim(None), Ok(1));
        assert_eq!(table.claim(None), Ok(2));
        assert_eq!(table.claim(Some(5)), Ok(5));
        assert_eq!(table.claim(Some(0)), Err(0));
        assert_eq!(table.claim(Some(8)), Err(8));
    }

    #[test]
    fn test_global_leaks_reported_once() {
        let table = GlobalTable::new(small());
        let slot = table.claim(None).unwrap();
        table.store(slot, 0x1000, 64, 9, true);
        assert_eq!(table.take_unreported().len(), 1);
        assert!(table.take_unreported().is_empty());
        table.retire(slot);
        assert!(table.live().is_empty());
    }

    #[test]
    fn test_global_concurrent_claims_are_distinct() {
        let table = Arc::new(GlobalTable::new(PointerLayout::GLOBAL));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| table.claim(None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut slots: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 800);
        assert_eq!(table.claimed(), 800);
    }
}
