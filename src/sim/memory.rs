//! Simulated device memory
//!
//! Two address spaces: a heap of independently mapped regions (buffers,
//! module globals, runtime-owned blocks) and one stack per thread inside the
//! configured local segment. Any byte outside of both faults.

use crate::config::LocalSegment;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};

/// First heap address
pub const HEAP_BASE: u64 = 0x1000_0000;
/// Unmapped bytes left after every heap region
pub const HEAP_GAP: u64 = 64;
const ALIGN: u64 = 16;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Default)]
struct Stack {
    bytes: Vec<u8>,
    top: u64,
}

/// Byte-addressed memory of one simulated device
#[derive(Debug)]
pub struct DeviceMemory {
    regions: BTreeMap<u64, Vec<u8>>,
    next_heap: u64,
    segment: LocalSegment,
    max_threads: u32,
    stacks: HashMap<u32, Stack>,
}

impl DeviceMemory {
    /// Empty memory whose stacks live in `segment`
    pub fn new(segment: LocalSegment, max_threads: u32) -> Self {
        Self {
            regions: BTreeMap::new(),
            next_heap: HEAP_BASE,
            segment,
            max_threads,
            stacks: HashMap::new(),
        }
    }

    /// Map a zeroed heap region and return its address
    pub fn map(&mut self, length: u64) -> u64 {
        let start = self.next_heap;
        self.regions.insert(start, vec![0; length as usize]);
        self.next_heap = align_up(start + length.max(1) + HEAP_GAP, ALIGN);
        start
    }

    /// Unmap the heap region starting at `start`
    pub fn unmap(&mut self, start: u64) -> bool {
        self.regions.remove(&start).is_some()
    }

    /// Bytes mapped on the heap
    pub fn heap_size(&self) -> u64 {
        self.regions.values().map(|r| r.len() as u64).sum()
    }

    /// Current top of a thread's stack
    pub fn stack_top(&self, thread: u32) -> u64 {
        let used = self.stacks.get(&thread).map(|s| s.top).unwrap_or(0);
        self.segment.thread_base(thread) + used
    }

    /// Reserve `size` bytes on a thread's stack
    pub fn stack_alloc(&mut self, thread: u32, size: u64) -> Result<u64> {
        let base = self.segment.thread_base(thread);
        let limit = self.segment.size_per_thread;
        let stack = self.stacks.entry(thread).or_default();
        let start = align_up(stack.top, ALIGN);
        let end = start + size.max(1);
        if end > limit {
            return Err(Error::Fault {
                address: base + start,
                size,
            });
        }
        if stack.bytes.len() < end as usize {
            stack.bytes.resize(end as usize, 0);
        }
        stack.top = end;
        Ok(base + start)
    }

    /// Pop a thread's stack back to `top` (a value of [`stack_top`](Self::stack_top))
    pub fn stack_release(&mut self, thread: u32, top: u64) {
        let base = self.segment.thread_base(thread);
        if let Some(stack) = self.stacks.get_mut(&thread) {
            stack.top = top.saturating_sub(base).min(stack.top);
        }
    }

    fn locate(&mut self, address: u64, size: u64) -> Result<&mut [u8]> {
        let fault = Error::Fault { address, size };
        if self.segment.contains(address, self.max_threads) {
            let offset = address - self.segment.base;
            let thread = (offset / self.segment.size_per_thread) as u32;
            let within = offset % self.segment.size_per_thread;
            let stack = self.stacks.get_mut(&thread).ok_or(fault.clone())?;
            let end = within.checked_add(size).ok_or(fault.clone())?;
            if end > stack.bytes.len() as u64 {
                return Err(fault);
            }
            return Ok(&mut stack.bytes[within as usize..end as usize]);
        }
        let (start, region) = self
            .regions
            .range_mut(..=address)
            .next_back()
            .ok_or(fault.clone())?;
        let within = address - *start;
        let end = within.checked_add(size).ok_or(fault.clone())?;
        if end > region.len() as u64 {
            return Err(fault);
        }
        Ok(&mut region[within as usize..end as usize])
    }

    /// Read `size` (1, 2, 4 or 8) bytes, zero-extended
    pub fn read(&mut self, address: u64, size: u32) -> Result<u64> {
        let bytes = self.locate(address, u64::from(size))?;
        let mut word = [0u8; 8];
        let n = bytes.len().min(8);
        word[..n].copy_from_slice(&bytes[..n]);
        Ok(u64::from_le_bytes(word))
    }

    /// Write the low `size` bytes of `value`
    pub fn write(&mut self, address: u64, size: u32, value: u64) -> Result<()> {
        let bytes = self.locate(address, u64::from(size))?;
        let word = value.to_le_bytes();
        let n = bytes.len().min(8);
        bytes[..n].copy_from_slice(&word[..n]);
        Ok(())
    }

    /// Copy out a byte range
    pub fn read_bytes(&mut self, address: u64, length: u64) -> Result<Vec<u8>> {
        Ok(self.locate(address, length)?.to_vec())
    }

    /// Copy in a byte range
    pub fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.locate(address, data.len() as u64)?.copy_from_slice(data);
        Ok(())
    }
}
