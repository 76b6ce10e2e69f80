//! Source-location table shared by the instrumentation pass and the runtime
//!
//! The pass emits one [`LocationRecord`] per distinct
//! `(file, function, line, column, parent)` tuple, interns every name once in
//! a NUL-separated string pool, and lists the ambiguous call sites. The
//! runtime only ever reads the table: it walks parents from the failing
//! access outwards and, at an ambiguous parent, consults the thread's
//! call-site word to find the dynamic caller.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Parent marker of a location with no caller (kernel entry)
pub const ROOT_PARENT: i64 = -1;
/// Parent marker of a location whose caller is only known at run time
pub const AMBIGUOUS_PARENT: i64 = -2;
/// Source id of instructions without debug information
pub const UNKNOWN_SOURCE: i64 = -1;

/// One encoded location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Byte offset of the function name in the string pool
    pub function: u64,
    /// Byte offset of the file name in the string pool
    pub file: u64,
    /// Line number
    pub line: u64,
    /// Column number
    pub column: u64,
    /// Index of the calling location, [`ROOT_PARENT`] or [`AMBIGUOUS_PARENT`]
    pub parent: i64,
}

impl LocationRecord {
    /// Flattened form: function, file, line, column, parent
    pub fn to_words(&self) -> [u64; 5] {
        [
            self.function,
            self.file,
            self.line,
            self.column,
            self.parent as u64,
        ]
    }
}

/// Resolved, human readable frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceFrame {
    /// Function name (prettified)
    pub function: String,
    /// File name
    pub file: String,
    /// Line number
    pub line: u64,
    /// Column number
    pub column: u64,
}

impl fmt::Display for SourceFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}:{}:{}",
            self.function, self.file, self.line, self.column
        )
    }
}

/// Number of bits one ambiguous call index occupies in a call-site word
pub fn call_site_bits(ambiguous_calls: usize) -> u32 {
    usize::BITS - ambiguous_calls.leading_zeros()
}

/// Call-site word after entering ambiguous call `index`
pub fn push_call_site(word: u64, index: u32, bits: u32) -> u64 {
    if bits == 0 || bits >= u64::BITS {
        return word;
    }
    (word << bits) | (u64::from(index) + 1)
}

/// Encoded location table, string pool and ambiguous call mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationTable {
    records: Vec<LocationRecord>,
    strings: Vec<u8>,
    ambiguous_calls: Vec<i64>,
    call_site_bits: u32,
}

impl LocationTable {
    /// Assemble a table from its encoded parts
    pub fn new(records: Vec<LocationRecord>, strings: Vec<u8>, ambiguous_calls: Vec<i64>) -> Self {
        let call_site_bits = call_site_bits(ambiguous_calls.len());
        Self {
            records,
            strings,
            ambiguous_calls,
            call_site_bits,
        }
    }

    /// All records in index order
    pub fn records(&self) -> &[LocationRecord] {
        &self.records
    }

    /// NUL-separated string pool
    pub fn strings(&self) -> &[u8] {
        &self.strings
    }

    /// Location index of each ambiguous call site, by call index
    pub fn ambiguous_calls(&self) -> &[i64] {
        &self.ambiguous_calls
    }

    /// Bits per entry in a call-site word
    pub fn call_site_bits(&self) -> u32 {
        self.call_site_bits
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record flattened into five words each, as laid out in device memory
    pub fn to_words(&self) -> Vec<u64> {
        self.records.iter().flat_map(|r| r.to_words()).collect()
    }

    /// String starting at `offset` in the pool
    pub fn string_at(&self, offset: u64) -> &str {
        let start = (offset as usize).min(self.strings.len());
        let rest = &self.strings[start..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        std::str::from_utf8(&rest[..end]).unwrap_or("<invalid>")
    }

    /// Frame for a single record
    pub fn frame(&self, index: i64) -> Option<SourceFrame> {
        let record = self.records.get(usize::try_from(index).ok()?)?;
        Some(SourceFrame {
            function: self.string_at(record.function).to_string(),
            file: self.string_at(record.file).to_string(),
            line: record.line,
            column: record.column,
        })
    }

    /// Walk from `source_id` to the kernel entry, innermost frame first
    ///
    /// `call_site` is the executing thread's call-site word. Each ambiguous
    /// parent consumes its low `call_site_bits` bits; a zero entry means the
    /// dynamic caller is unknown and the walk stops.
    pub fn resolve(&self, source_id: i64, call_site: u64) -> Vec<SourceFrame> {
        let mut frames = Vec::new();
        let mut index = source_id;
        let mut word = call_site;
        let limit = self.records.len() + u64::BITS as usize;
        while frames.len() < limit {
            let record = match usize::try_from(index).ok().and_then(|i| self.records.get(i)) {
                Some(record) => *record,
                None => break,
            };
            if let Some(frame) = self.frame(index) {
                frames.push(frame);
            }
            index = match record.parent {
                AMBIGUOUS_PARENT => {
                    if self.call_site_bits == 0 {
                        break;
                    }
                    let call = word & ((1u64 << self.call_site_bits) - 1);
                    word >>= self.call_site_bits;
                    match call.checked_sub(1) {
                        Some(call) => match self.ambiguous_calls.get(call as usize) {
                            Some(&location) => location,
                            None => break,
                        },
                        None => break,
                    }
                }
                parent => parent,
            };
        }
        frames
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
