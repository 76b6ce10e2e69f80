//! Runtime configuration
//!
//! A [`SanitizerConfig`] fixes everything the runtime needs to know before a
//! kernel starts: pointer layouts, whether tags are compared, how many threads
//! a grid may have and where thread-local memory lives. It can be built in
//! code or loaded from JSON; missing fields take their defaults.

use crate::error::{Error, Result};
use crate::runtime::{AllocationKind, PointerCodec, PointerLayout};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest global slot width; the global table is allocated eagerly
pub const MAX_GLOBAL_SLOT_BITS: u32 = 20;

/// Address window holding every thread's local memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSegment {
    /// First address of thread 0's window
    pub base: u64,
    /// Bytes per thread
    pub size_per_thread: u64,
}

impl Default for LocalSegment {
    fn default() -> Self {
        Self {
            base: 0x7000_0000_0000,
            size_per_thread: 1 << 20,
        }
    }
}

impl LocalSegment {
    /// First address of a thread's window
    pub fn thread_base(&self, thread: u32) -> u64 {
        self.base + u64::from(thread) * self.size_per_thread
    }

    /// Whether `address` falls into any thread's window
    pub fn contains(&self, address: u64, max_threads: u32) -> bool {
        let end = self.base + u64::from(max_threads) * self.size_per_thread;
        address >= self.base && address < end
    }
}

/// Runtime configuration of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    /// Compare generation tags on every check
    pub use_tags: bool,
    /// Pointer layout of thread-local allocations
    pub local_layout: PointerLayout,
    /// Pointer layout of global allocations
    pub global_layout: PointerLayout,
    /// Threads per launch
    pub max_threads: u32,
    /// Worker threads used by parallel launches
    pub workers: usize,
    /// Thread-local address window
    pub local_segment: LocalSegment,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            use_tags: true,
            local_layout: PointerLayout::LOCAL,
            global_layout: PointerLayout::GLOBAL,
            max_threads: 1024,
            workers: num_cpus::get(),
            local_segment: LocalSegment::default(),
        }
    }
}

impl SanitizerConfig {
    /// Check every field against the limits of the encoding
    ///
    /// Besides fitting the 59 payload bits, the global slot width may not
    /// exceed [`MAX_GLOBAL_SLOT_BITS`] (2^20 slots): the shared global table
    /// is allocated up front, one record per addressable slot. Layouts asking
    /// for more slots are rejected with an `InvalidConfig` naming the cap.
    pub fn validate(&self) -> Result<()> {
        self.local_layout.validate(AllocationKind::Local)?;
        self.global_layout.validate(AllocationKind::Global)?;
        if self.global_layout.slot_bits > MAX_GLOBAL_SLOT_BITS {
            return Err(Error::config(format!(
                "global slot width {} exceeds the {}-bit cap of the eagerly allocated global table",
                self.global_layout.slot_bits, MAX_GLOBAL_SLOT_BITS
            )));
        }
        if self.max_threads == 0 {
            return Err(Error::config("max_threads must be at least 1"));
        }
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.local_segment.size_per_thread == 0 {
            return Err(Error::config("local segment must not be empty"));
        }
        let span = u64::from(self.max_threads).checked_mul(self.local_segment.size_per_thread);
        let fits = span
            .and_then(|span| self.local_segment.base.checked_add(span))
            .map(|end| end < 1u64 << crate::runtime::pointer::MAGIC_SHIFT)
            .unwrap_or(false);
        if !fits {
            return Err(Error::config(
                "local segment overlaps the tracked pointer tag bits",
            ));
        }
        Ok(())
    }

    /// Codec for the configured layouts
    pub fn codec(&self) -> PointerCodec {
        PointerCodec {
            local: self.local_layout,
            global: self.global_layout,
        }
    }

    /// Whether `address` is thread-local memory
    pub fn is_local_address(&self, address: u64) -> bool {
        self.local_segment.contains(address, self.max_threads)
    }

    /// Parse and validate a JSON document
    pub fn from_json(text: &str) -> Result<Self> {
        let config: SanitizerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::ParseError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SanitizerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.use_tags);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SanitizerConfig::from_json(r#"{ "use_tags": false, "max_threads": 64 }"#)
            .unwrap();
        assert!(!config.use_tags);
        assert_eq!(config.max_threads, 64);
        assert_eq!(config.global_layout, PointerLayout::GLOBAL);
    }

    #[test]
    fn test_rejects_oversized_layout() {
        let text = r#"{ "global_layout": { "offset_bits": 40, "tag_bits": 8, "slot_bits": 16 } }"#;
        assert!(matches!(
            SanitizerConfig::from_json(text),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_rejects_huge_global_table() {
        let mut config = SanitizerConfig::default();
        config.global_layout.slot_bits = 24;
        config.global_layout.offset_bits = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_global_slot_cap_explains_itself() {
        let text = r#"{ "global_layout": { "offset_bits": 30, "tag_bits": 7, "slot_bits": 21 } }"#;
        match SanitizerConfig::from_json(text) {
            Err(Error::InvalidConfig { message }) => {
                assert!(message.contains("21"));
                assert!(message.contains(&format!("{}-bit cap", MAX_GLOBAL_SLOT_BITS)));
            }
            other => panic!("expected InvalidConfig, got {:?}", other),
        }

        let text = r#"{ "global_layout": { "offset_bits": 30, "tag_bits": 7, "slot_bits": 20 } }"#;
        assert!(SanitizerConfig::from_json(text).is_ok());
    }

    #[test]
    fn test_local_address_window() {
        let config = SanitizerConfig {
            max_threads: 2,
            ..SanitizerConfig::default()
        };
        let seg = config.local_segment;
        assert!(config.is_local_address(seg.thread_base(1)));
        assert!(!config.is_local_address(seg.thread_base(2)));
        assert!(!config.is_local_address(0x1000));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SanitizerConfig::default();
        let parsed = SanitizerConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
