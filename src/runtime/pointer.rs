//! Tracked pointer encoding
//!
//! A tracked pointer replaces a real address with a 64-bit word that carries
//! the identity of the allocation it points into. Fields, from the least
//! significant bit:
//!
//! ```text
//! | offset (signed) | tag | slot | unused | magic (4) | kind (1) |
//! 0                                       59          63
//! ```
//!
//! The widths of `offset`, `tag` and `slot` are configurable per allocation
//! kind through [`PointerLayout`]. Offset arithmetic only ever touches the
//! offset field, so identity survives any amount of pointer arithmetic.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed bit pattern stored in every tracked pointer
pub const MAGIC: u64 = 0b1010;
/// Position of the magic field
pub const MAGIC_SHIFT: u32 = 59;
/// Position of the kind bit (1 = global)
pub const KIND_SHIFT: u32 = 63;
/// Bits available to `offset + tag + slot`
pub const PAYLOAD_BITS: u32 = 59;

const MAGIC_MASK: u64 = 0b1111;

/// Storage class of the memory a pointer refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    /// Stack-discipline memory owned by one thread
    Local,
    /// Heap, static and host-provided memory shared by every thread
    Global,
    /// Runtime-reserved memory (implicit arguments, dispatch packet)
    System,
    /// Provenance could not be determined at compile time
    Unknown,
}

impl AllocationKind {
    /// Symbol suffix of the kind-specific runtime entry points
    pub fn suffix(self) -> &'static str {
        match self {
            AllocationKind::Local => "_local",
            AllocationKind::Global => "_global",
            AllocationKind::System | AllocationKind::Unknown => "",
        }
    }

    /// Infer the kind from a runtime entry point name
    pub fn from_symbol(name: &str) -> Option<Self> {
        if name.ends_with("_global") {
            Some(AllocationKind::Global)
        } else if name.ends_with("_local") {
            Some(AllocationKind::Local)
        } else {
            None
        }
    }

    /// Whether pointers of this kind have a backing allocation table
    pub fn is_tracked(self) -> bool {
        matches!(self, AllocationKind::Local | AllocationKind::Global)
    }
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AllocationKind::Local => "local",
            AllocationKind::Global => "global",
            AllocationKind::System => "system",
            AllocationKind::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Field widths of a tracked pointer for one allocation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerLayout {
    /// Width of the signed byte offset
    pub offset_bits: u32,
    /// Width of the generation tag
    pub tag_bits: u32,
    /// Width of the table slot index
    pub slot_bits: u32,
}

impl PointerLayout {
    /// Default layout for thread-local memory: 1024 slots, 2 GiB allocations
    pub const LOCAL: PointerLayout = PointerLayout {
        offset_bits: 32,
        tag_bits: 8,
        slot_bits: 10,
    };

    /// Default layout for global memory: 65536 slots, 32 GiB allocations
    pub const GLOBAL: PointerLayout = PointerLayout {
        offset_bits: 36,
        tag_bits: 7,
        slot_bits: 16,
    };

    /// Check that the fields fit into the payload bits
    pub fn validate(&self, kind: AllocationKind) -> Result<()> {
        let total = self.offset_bits + self.tag_bits + self.slot_bits;
        if total > PAYLOAD_BITS {
            return Err(Error::config(format!(
                "{} layout uses {} bits, only {} are available",
                kind, total, PAYLOAD_BITS
            )));
        }
        if self.offset_bits < 2 {
            return Err(Error::config(format!(
                "{} layout needs at least 2 offset bits",
                kind
            )));
        }
        if self.slot_bits == 0 || self.tag_bits > 32 || self.slot_bits > 32 {
            return Err(Error::config(format!(
                "{} layout has unsupported slot/tag widths ({}/{})",
                kind, self.slot_bits, self.tag_bits
            )));
        }
        Ok(())
    }

    /// Mask selecting the offset field
    pub fn offset_mask(&self) -> u64 {
        mask(self.offset_bits)
    }

    /// Mask applied to tags before comparison
    pub fn tag_mask(&self) -> u32 {
        mask(self.tag_bits) as u32
    }

    /// Number of slots addressable by the slot field
    pub fn slot_capacity(&self) -> u64 {
        1u64 << self.slot_bits
    }

    /// Largest representable allocation length (exclusive)
    pub fn max_length(&self) -> u64 {
        1u64 << (self.offset_bits - 1)
    }

    fn tag_shift(&self) -> u32 {
        self.offset_bits
    }

    fn slot_shift(&self) -> u32 {
        self.offset_bits + self.tag_bits
    }
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Decoded view of a tracked pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedPointer {
    /// Table the slot belongs to (only `Local` or `Global`)
    pub kind: AllocationKind,
    /// Table slot
    pub slot: u32,
    /// Generation tag captured at creation
    pub tag: u32,
    /// Byte offset from the allocation start
    pub offset: i64,
}

impl TrackedPointer {
    /// Pointer to the start of a fresh allocation
    pub fn new(kind: AllocationKind, slot: u32, tag: u32) -> Self {
        Self {
            kind,
            slot,
            tag,
            offset: 0,
        }
    }
}

/// Packs and unpacks tracked pointers for both table kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerCodec {
    /// Layout for `Local` pointers
    pub local: PointerLayout,
    /// Layout for `Global` pointers
    pub global: PointerLayout,
}

impl Default for PointerCodec {
    fn default() -> Self {
        Self {
            local: PointerLayout::LOCAL,
            global: PointerLayout::GLOBAL,
        }
    }
}

impl PointerCodec {
    /// Layout used for pointers of `kind`; untracked kinds share the local one
    pub fn layout(&self, kind: AllocationKind) -> &PointerLayout {
        match kind {
            AllocationKind::Global => &self.global,
            _ => &self.local,
        }
    }

    /// Table kind recorded in the pointer's kind bit
    pub fn kind_of(word: u64) -> AllocationKind {
        if word >> KIND_SHIFT == 1 {
            AllocationKind::Global
        } else {
            AllocationKind::Local
        }
    }

    /// Whether the magic field holds the fixed pattern
    pub fn has_magic(word: u64) -> bool {
        (word >> MAGIC_SHIFT) & MAGIC_MASK == MAGIC
    }

    /// Pack a pointer into a machine word
    pub fn encode(&self, ptr: &TrackedPointer) -> u64 {
        let layout = self.layout(ptr.kind);
        let kind_bit = u64::from(ptr.kind == AllocationKind::Global);
        (kind_bit << KIND_SHIFT)
            | (MAGIC << MAGIC_SHIFT)
            | ((u64::from(ptr.slot) & mask(layout.slot_bits)) << layout.slot_shift())
            | ((u64::from(ptr.tag) & mask(layout.tag_bits)) << layout.tag_shift())
            | (ptr.offset as u64 & layout.offset_mask())
    }

    /// Unpack a machine word; `None` when the magic field is wrong
    pub fn decode(&self, word: u64) -> Option<TrackedPointer> {
        if !Self::has_magic(word) {
            return None;
        }
        let kind = Self::kind_of(word);
        let layout = self.layout(kind);
        Some(TrackedPointer {
            kind,
            slot: ((word >> layout.slot_shift()) & mask(layout.slot_bits)) as u32,
            tag: ((word >> layout.tag_shift()) & mask(layout.tag_bits)) as u32,
            offset: sign_extend(word & layout.offset_mask(), layout.offset_bits),
        })
    }

    /// Add `delta` to the offset field, leaving every other bit untouched
    pub fn advance(&self, word: u64, delta: i64) -> u64 {
        let offset_mask = self.layout(Self::kind_of(word)).offset_mask();
        let offset = (word & offset_mask).wrapping_add(delta as u64) & offset_mask;
        (word & !offset_mask) | offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let codec = PointerCodec::default();
        let ptr = TrackedPointer {
            kind: AllocationKind::Global,
            slot: 513,
            tag: 42,
            offset: 4096,
        };
        let word = codec.encode(&ptr);
        assert!(PointerCodec::has_magic(word));
        assert_eq!(PointerCodec::kind_of(word), AllocationKind::Global);
        assert_eq!(codec.decode(word), Some(ptr));
    }

    #[test]
    fn test_negative_offset() {
        let codec = PointerCodec::default();
        let word = codec.encode(&TrackedPointer::new(AllocationKind::Local, 3, 1));
        let moved = codec.advance(word, -8);
        let decoded = codec.decode(moved).unwrap();
        assert_eq!(decoded.offset, -8);
        assert_eq!(decoded.slot, 3);
        assert_eq!(decoded.tag, 1);
    }

    #[test]
    fn test_advance_wraps_inside_offset_field() {
        let codec = PointerCodec::default();
        let word = codec.encode(&TrackedPointer::new(AllocationKind::Local, 7, 5));
        let far = codec.advance(word, i64::MAX);
        let back = codec.advance(far, i64::MIN + 1);
        assert_eq!(codec.decode(back).unwrap().offset, 0);
        assert_eq!(codec.decode(far).unwrap().slot, 7);
    }

    #[test]
    fn test_tag_truncated_to_width() {
        let codec = PointerCodec::default();
        let word = codec.encode(&TrackedPointer::new(AllocationKind::Global, 1, 0x81));
        assert_eq!(codec.decode(word).unwrap().tag, 0x01);
    }

    #[test]
    fn test_raw_addresses_have_no_magic() {
        let codec = PointerCodec::default();
        assert!(codec.decode(0).is_none());
        assert!(codec.decode(0x0000_7fff_dead_beef).is_none());
    }

    #[test]
    fn test_layout_validation() {
        assert!(PointerLayout::LOCAL.validate(AllocationKind::Local).is_ok());
        assert!(PointerLayout::GLOBAL.validate(AllocationKind::Global).is_ok());
        let wide = PointerLayout {
            offset_bits: 40,
            tag_bits: 8,
            slot_bits: 16,
        };
        assert!(wide.validate(AllocationKind::Global).is_err());
    }

    #[test]
    fn test_kind_symbols() {
        assert_eq!(
            AllocationKind::from_symbol("__gpusan_new_global"),
            Some(AllocationKind::Global)
        );
        assert_eq!(
            AllocationKind::from_symbol("ompx_alloc_local"),
            Some(AllocationKind::Local)
        );
        assert_eq!(AllocationKind::from_symbol("malloc"), None);
        assert_eq!(AllocationKind::Unknown.suffix(), "");
    }
}
