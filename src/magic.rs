//! The `Magic` facade
//!
//! Owns a loaded [`RuleSet`] plus the diagnostics its loading produced,
//! and exposes the whole engine surface: loading textual or compiled
//! databases, compiling, identification, listing, and checking.
//!
//! Loading is format-agnostic: [`Magic::load`] sniffs the compiled magic
//! number and falls back to the text parser, so callers can point it at
//! either a `magic` source or a `magic.mgc` file.

use crate::classifier;
use crate::compiled;
use crate::error::{Diagnostic, Result};
use crate::parser;
use crate::rule::{flags, RuleSet};
use crate::softmagic::{self, Options, Verdict};
use crate::strength;
use memmap2::Mmap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Identification examines at most this many leading bytes
pub const MAX_SCAN_BYTES: usize = 1 << 20;

/// A loaded magic database
///
/// Construction finishes all preparation (classification, strength
/// ordering, name indexing); afterwards the database is immutable and can
/// be shared freely across threads.
///
/// # Examples
///
/// ```
/// use magus::{Magic, Options};
///
/// let magic = Magic::from_source_str(
///     "0\tstring\tMZ\tMS-DOS executable\n!:mime\tapplication/x-dosexec\n",
///     "dos-magic",
/// )?;
///
/// match magic.identify(b"MZ\x90\x00", &Options::default()) {
///     magus::Verdict::Match(m) => {
///         assert_eq!(m.description, "MS-DOS executable");
///         assert_eq!(m.mime.as_deref(), Some("application/x-dosexec"));
///     }
///     magus::Verdict::None => panic!("expected a match"),
/// }
/// # Ok::<(), magus::MagicError>(())
/// ```
#[derive(Debug)]
pub struct Magic {
    set: RuleSet,
    diags: Vec<Diagnostic>,
}

impl Magic {
    /// Load a database, auto-detecting textual versus compiled form.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Magic> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let origin = path.display().to_string();
        if compiled::is_compiled(&data) {
            Magic::from_compiled_bytes(&data, &origin)
        } else {
            Magic::from_source_str(&String::from_utf8_lossy(&data), &origin)
        }
    }

    /// Load one textual magic source file.
    pub fn load_source<P: AsRef<Path>>(path: P) -> Result<Magic> {
        Magic::load_sources(&[path])
    }

    /// Load several textual source files into one database, in order.
    pub fn load_sources<P: AsRef<Path>>(paths: &[P]) -> Result<Magic> {
        let mut set = RuleSet::default();
        let mut diags = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path)?;
            parser::parse_into(&mut set, &text, &path.display().to_string(), &mut diags);
        }
        finalize(&mut set, &mut diags);
        Ok(Magic { set, diags })
    }

    /// Parse magic source from memory. `origin` names it in diagnostics.
    pub fn from_source_str(text: &str, origin: &str) -> Result<Magic> {
        let mut set = RuleSet::default();
        let mut diags = Vec::new();
        parser::parse_into(&mut set, text, origin, &mut diags);
        finalize(&mut set, &mut diags);
        Ok(Magic { set, diags })
    }

    /// Load a compiled database through a memory mapping.
    pub fn load_compiled<P: AsRef<Path>>(path: P) -> Result<Magic> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        Magic::from_compiled_bytes(&mmap, &path.display().to_string())
    }

    /// Parse compiled bytes from memory.
    pub fn from_compiled_bytes(data: &[u8], origin: &str) -> Result<Magic> {
        let mut diags = Vec::new();
        let mut set = compiled::from_bytes(data, origin, &mut diags)?;
        // The stored order is authoritative; only the phase flags and the
        // name index need rebuilding beyond what the codec restored
        classifier::classify(&mut set);
        Ok(Magic { set, diags })
    }

    /// Serialize to the compiled format (little-endian, version 20).
    pub fn to_compiled_bytes(&self) -> (Vec<u8>, Vec<Diagnostic>) {
        let mut diags = Vec::new();
        let bytes = compiled::to_bytes(&self.set, &mut diags);
        (bytes, diags)
    }

    /// Write the compiled form to `path`, returning any truncation
    /// warnings.
    pub fn compile<P: AsRef<Path>>(&self, path: P) -> Result<Vec<Diagnostic>> {
        let (bytes, diags) = self.to_compiled_bytes();
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(diags)
    }

    /// Identify a byte buffer.
    ///
    /// Never fails; unidentified input yields [`Verdict::None`]. Only the
    /// first [`MAX_SCAN_BYTES`] bytes are examined.
    pub fn identify(&self, data: &[u8], opts: &Options) -> Verdict {
        let window = &data[..data.len().min(MAX_SCAN_BYTES)];
        softmagic::identify(&self.set, window, opts)
    }

    /// Identify while collecting evaluator diagnostics (honored when
    /// `opts.debug` is set).
    pub fn identify_with_diags(
        &self,
        data: &[u8],
        opts: &Options,
        diags: &mut Vec<Diagnostic>,
    ) -> Verdict {
        let window = &data[..data.len().min(MAX_SCAN_BYTES)];
        softmagic::identify_collect(&self.set, window, opts, diags)
    }

    /// Render the rule listing, strongest first within each subsection.
    pub fn list(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (s, roots) in self.set.sets.iter().enumerate() {
            lines.push(format!("Set {}:", s));
            for (label, phase) in [
                ("Binary patterns:", flags::BINTEST),
                ("Text patterns:", flags::TEXTTEST),
            ] {
                lines.push(label.to_string());
                for &root in roots {
                    let rule = self.set.rule(root);
                    if rule.flags & phase == 0 {
                        continue;
                    }
                    lines.push(format!(
                        "Strength = {:>3}@{}: {} [{}]",
                        rule.strength,
                        rule.line,
                        crate::escape::encode(rule.desc.as_bytes()),
                        rule.mime.as_deref().unwrap_or(""),
                    ));
                }
            }
        }
        lines
    }

    /// Diagnostics collected while loading.
    pub fn check(&self) -> &[Diagnostic] {
        &self.diags
    }

    /// Total number of rules, continuations included.
    pub fn rule_count(&self) -> usize {
        self.set.len()
    }

    /// Borrow the underlying rule set.
    pub fn rules(&self) -> &RuleSet {
        &self.set
    }
}

/// Prepare a freshly parsed rule set for evaluation.
fn finalize(set: &mut RuleSet, diags: &mut Vec<Diagnostic>) {
    classifier::classify(set);
    strength::compute_all(set);
    strength::sort_sets(set);
    strength::warn_duplicates(set, diags);
    classifier::index_names(set, diags);
}
