//! Magus - File Type Identification Engine
//!
//! Magus identifies the type of arbitrary byte streams by evaluating them
//! against a database of magic recognition rules. It is compatible with
//! the textual rule syntax documented in `magic(5)` and with the compiled
//! `magic.mgc` on-disk format (versions 18 through 20), producing human
//! descriptions, MIME types, file-name extensions, and Apple
//! creator/type tags.
//!
//! # Quick Start
//!
//! ```rust
//! use magus::{Magic, Options, Verdict};
//!
//! // A database can come from magic source text, a source file, or a
//! // compiled .mgc file
//! let magic = Magic::from_source_str(
//!     "0\tstring\t\\x89PNG\\r\\n\\x1a\\n\tPNG image data\n\
//!      !:mime\timage/png\n",
//!     "png-magic",
//! )?;
//!
//! let data = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
//! match magic.identify(&data, &Options::default()) {
//!     Verdict::Match(m) => {
//!         assert_eq!(m.description, "PNG image data");
//!         assert_eq!(m.mime.as_deref(), Some("image/png"));
//!     }
//!     Verdict::None => println!("unrecognized data"),
//! }
//! # Ok::<(), magus::MagicError>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │  magic source text        magic.mgc   │
//! │        │                      │       │
//! │     parser                 compiled   │
//! │        └──────┐    ┌──────────┘       │
//! │               ▼    ▼                  │
//! │             RuleSet                   │
//! │   (strength-ordered, classified,      │
//! │    name-indexed, immutable)           │
//! │               │                       │
//! │           softmagic ◄── byte buffer   │
//! │               │                       │
//! │            Verdict                    │
//! └───────────────────────────────────────┘
//! ```
//!
//! Rules live in an arena with continuation subtrees expressed through
//! indices. Identification walks set 0 twice, binary-phase rules first
//! and text-phase rules second, in descending strength order, and stops
//! at the first rule that produces output unless `keep_going` is set.
//!
//! # Concurrency
//!
//! A loaded [`Magic`] database is immutable and shareable: `identify` is
//! a pure function of the database and the input bytes, so any number of
//! identifications may run in parallel against one instance.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Module declarations
/// Binary/text classification and set bookkeeping
pub mod classifier;
/// Compiled database codec (.mgc reader/writer)
pub mod compiled;
/// Endianness-aware buffer reads
pub mod endian;
/// Error and diagnostic types
pub mod error;
/// Backslash escape decoding and encoding
pub mod escape;
/// The facade type
pub mod magic;
/// Magic source parser
pub mod parser;
/// Safe printf-style description rendering
pub mod printf;
/// Rule data model
pub mod rule;
/// The evaluator
pub mod softmagic;
/// Strength computation and set ordering
pub mod strength;
/// Typed comparison values
pub mod value;

// Re-exports for consumers

/// The primary entry point for loading and querying magic databases
pub use crate::magic::{Magic, MAX_SCAN_BYTES};

pub use crate::error::{Diagnostic, MagicError, Result, Severity};
pub use crate::rule::{Relation, RuleSet, TypeTag};
pub use crate::softmagic::{Match, Options, Verdict};
pub use crate::value::Value;

// Version information
/// Library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Newest compiled-format version understood
pub const MGC_VERSION: u32 = crate::compiled::VERSION_MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(MGC_VERSION, 20);
    }
}
