/// Error types for the magus library
use std::fmt;

/// Result type alias for magic database operations
pub type Result<T> = std::result::Result<T, MagicError>;

/// Main error type for magic database operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MagicError {
    /// Malformed magic source line, unknown type, bad directive
    Parse {
        /// Source file the line came from
        file: String,
        /// One-based line number
        line: u32,
        /// What went wrong
        message: String,
    },

    /// Compiled file does not start with the magic number
    BadMagicNumber {
        /// The first four bytes, read little-endian
        found: u32,
    },

    /// Compiled file carries a version outside the accepted range
    UnsupportedVersion {
        /// Version found in the header
        found: u32,
    },

    /// Compiled file is shorter than its header and record counts require
    Truncated {
        /// Bytes the header promised
        required: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// Other compiled-format corruption
    Format(String),

    /// `use` names a rule that no `name` rule defines, or a reference cycle
    Reference(String),

    /// Internal evaluator fault surfaced in debug mode
    Evaluation(String),

    /// I/O errors
    Io(String),
}

impl fmt::Display for MagicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MagicError::Parse {
                file,
                line,
                message,
            } => {
                write!(f, "{}:{}: {}", file, line, message)
            }
            MagicError::BadMagicNumber { found } => {
                write!(f, "Bad magic number: {:#010x}", found)
            }
            MagicError::UnsupportedVersion { found } => {
                write!(f, "Unsupported compiled format version: {}", found)
            }
            MagicError::Truncated { required, actual } => {
                write!(
                    f,
                    "Truncated compiled file: need {} bytes, got {}",
                    required, actual
                )
            }
            MagicError::Format(msg) => write!(f, "Format error: {}", msg),
            MagicError::Reference(msg) => write!(f, "Reference error: {}", msg),
            MagicError::Evaluation(msg) => write!(f, "Evaluation error: {}", msg),
            MagicError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for MagicError {}

impl From<std::io::Error> for MagicError {
    fn from(err: std::io::Error) -> Self {
        MagicError::Io(err.to_string())
    }
}

/// How serious a diagnostic is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The rule was kept
    Warning,
    /// The rule was dropped
    Error,
}

/// A single diagnostic collected while loading or evaluating
///
/// Loading never aborts on a bad rule. The offending line is dropped, a
/// diagnostic is recorded, and parsing continues with the next line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Warning or error
    pub severity: Severity,
    /// Source file (or a pseudo-name for in-memory input)
    pub file: String,
    /// One-based line number, 0 when not line-specific
    pub line: u32,
    /// Human-readable description
    pub message: String,
}

impl Diagnostic {
    /// Create a warning diagnostic
    pub fn warning(file: &str, line: u32, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }

    /// Create an error diagnostic
    pub fn error(file: &str, line: u32, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        if self.line == 0 {
            write!(f, "{}: {}: {}", self.file, tag, self.message)
        } else {
            write!(f, "{}:{}: {}: {}", self.file, self.line, tag, self.message)
        }
    }
}
