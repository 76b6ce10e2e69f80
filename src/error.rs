//! Error types for the GPUSan instrumentation pipeline and simulator

use crate::runtime::Violation;
use thiserror::Error;

/// GPUSan compile-time, configuration and simulation errors
///
/// Memory-safety failures detected while a kernel executes are not part of
/// this enum; they are [`Violation`]s raised by the runtime. They only show up
/// here when the simulator surfaces them to a caller that asked for a single
/// result.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Configuration errors
    /// Configuration value outside of its supported range
    ///
    /// **Triggered by:** pointer layouts wider than the payload bits, zero
    /// thread counts, overlapping local segments
    /// **Example:** `offset_bits + tag_bits + slot_bits = 64`
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error description
        message: String,
    },

    /// Configuration or metadata document could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    // Instrumentation errors
    /// Stack allocation whose execution count per activation is not exactly one
    ///
    /// **Triggered by:** an alloca inside a loop, or in a block that does not
    /// dominate every return
    /// **Prevention:** hoist fixed-size allocas into the entry block
    #[error("Unsupported stack allocation in {function} (block {block}): {reason}")]
    UnsupportedAlloca {
        /// Function containing the allocation
        function: String,
        /// Block containing the allocation
        block: u32,
        /// Why the allocation cannot be tracked
        reason: String,
    },

    /// Reference to a function that does not exist in the module
    #[error("Unknown function: {name}")]
    UnknownFunction {
        /// Function name or id
        name: String,
    },

    /// Reference to a block that does not exist in the function
    #[error("Unknown block {block} in function {function}")]
    UnknownBlock {
        /// Function name
        function: String,
        /// Block id
        block: u32,
    },

    /// IR failed structural verification
    #[error("Malformed IR in {function}: {message}")]
    MalformedIr {
        /// Function name
        function: String,
        /// First verifier complaint
        message: String,
    },

    // Runtime / simulation errors
    /// Thread id outside of the configured grid
    #[error("Thread {thread} is outside of the configured {max} threads")]
    InvalidThread {
        /// Requested thread id
        thread: u32,
        /// Configured maximum
        max: u32,
    },

    /// Raw memory access outside of every mapped segment
    ///
    /// **Triggered by:** uninstrumented code dereferencing a wild pointer, or
    /// instrumented code dereferencing a tracked pointer without unpacking it
    #[error("Memory fault: {size}-byte access at 0x{address:x}")]
    Fault {
        /// Faulting address
        address: u64,
        /// Access width
        size: u64,
    },

    /// A memory-safety violation stopped execution
    #[error("Sanitizer trap: {0}")]
    Trap(#[from] Violation),

    /// Simulator could not continue (bad arity, missing extern, step limit)
    #[error("Simulation error: {0}")]
    Simulation(String),

    /// Worker pool could not be built
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Fatal error that cannot be recovered from
    Fatal,
    /// Recoverable error that may be retried
    Recoverable,
    /// Warning that doesn't prevent execution
    Warning,
}

impl Error {
    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig {
            message: msg.into(),
        }
    }

    /// Create a simulation error with a message
    pub fn simulation(msg: impl Into<String>) -> Self {
        Error::Simulation(msg.into())
    }

    /// Create a verifier error for a function
    pub fn malformed(function: impl Into<String>, message: impl Into<String>) -> Self {
        Error::MalformedIr {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::Trap(_) => ErrorSeverity::Fatal,
            Error::Fault { .. } => ErrorSeverity::Fatal,
            Error::MalformedIr { .. } => ErrorSeverity::Fatal,

            Error::InvalidConfig { .. } => ErrorSeverity::Recoverable,
            Error::ParseError(_) => ErrorSeverity::Recoverable,
            Error::ThreadPool(_) => ErrorSeverity::Recoverable,

            Error::UnsupportedAlloca { .. } => ErrorSeverity::Warning,

            _ => ErrorSeverity::Recoverable,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

/// Result type for GPUSan operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(Error::config("x").classify(), ErrorSeverity::Recoverable);
        assert_eq!(
            Error::Fault {
                address: 0,
                size: 4
            }
            .classify(),
            ErrorSeverity::Fatal
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::ParseError(_)));
    }
}
