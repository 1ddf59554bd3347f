//! Typed comparison values
//!
//! On disk a rule's value is a raw 128-byte blob interpreted through the
//! rule's type tag. In memory it is a tagged enum, so a numeric rule can
//! never be compared as a string and vice versa. The codec converts between
//! the two representations at the file boundary.

use regex::bytes::Regex;

/// Upper bound on string-family value lengths, matching the on-disk blob.
pub const MAX_VALUE_LEN: usize = 128;

/// A rule's comparison value
#[derive(Debug)]
pub enum Value {
    /// Integer value for the numeric and date type families
    Numeric {
        /// The value, truncated to `width` bytes
        bits: u64,
        /// Byte width of the owning type (1, 2, 4, or 8)
        width: u8,
    },

    /// Float value for the float/double families
    Float(f64),

    /// Raw bytes for string, pstring, search, bestring16, lestring16,
    /// octal, and the `name`/`use` identifiers. Never longer than
    /// [`MAX_VALUE_LEN`].
    Bytes(Vec<u8>),

    /// A compiled regular expression plus its source bytes
    Regex {
        /// The pattern exactly as written in the magic source, escapes
        /// decoded. Kept for listings and for the compiled format.
        pattern: Vec<u8>,
        /// Compiled form, case folding already applied
        compiled: Regex,
    },

    /// DER probe, optionally pinned to one outer tag name
    Der {
        /// Expected tag, e.g. `seq` or `int`; `None` probes structure only
        tag_hint: Option<String>,
    },

    /// A 16-byte GUID in its binary layout
    Guid([u8; 16]),

    /// No comparison value (`x` relation, `clear`, `default`, `indirect`)
    None,
}

impl Value {
    /// Byte length stored in the compiled record's `vallen` field.
    ///
    /// Only the string-family variants carry a length; numeric values
    /// occupy the union unconditionally and report 0 like the reference
    /// format does.
    pub fn vallen(&self) -> u8 {
        match self {
            Value::Bytes(b) => b.len() as u8,
            Value::Regex { pattern, .. } => pattern.len().min(MAX_VALUE_LEN) as u8,
            Value::Der {
                tag_hint: Some(tag),
            } => tag.len().min(MAX_VALUE_LEN) as u8,
            Value::Guid(_) => 16,
            _ => 0,
        }
    }

    /// The bytes that identify this value for duplicate detection and for
    /// the compiled blob.
    pub fn raw_bytes(&self) -> Vec<u8> {
        match self {
            Value::Numeric { bits, .. } => bits.to_le_bytes().to_vec(),
            Value::Float(f) => f.to_bits().to_le_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
            Value::Regex { pattern, .. } => pattern.clone(),
            Value::Der { tag_hint } => tag_hint
                .as_ref()
                .map(|t| t.as_bytes().to_vec())
                .unwrap_or_default(),
            Value::Guid(g) => g.to_vec(),
            Value::None => Vec::new(),
        }
    }
}

/// Parse the textual GUID form `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`.
///
/// The first three groups are stored little-endian, the last two as-is,
/// which is the binary layout GUIDs use on disk.
pub fn parse_guid(text: &str) -> Option<[u8; 16]> {
    let groups: Vec<&str> = text.split('-').collect();
    if groups.len() != 5 {
        return None;
    }
    let expected = [8usize, 4, 4, 4, 12];
    for (g, want) in groups.iter().zip(expected) {
        if g.len() != want || !g.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
    }

    let mut out = [0u8; 16];
    let d1 = u32::from_str_radix(groups[0], 16).ok()?;
    let d2 = u16::from_str_radix(groups[1], 16).ok()?;
    let d3 = u16::from_str_radix(groups[2], 16).ok()?;
    out[0..4].copy_from_slice(&d1.to_le_bytes());
    out[4..6].copy_from_slice(&d2.to_le_bytes());
    out[6..8].copy_from_slice(&d3.to_le_bytes());
    for i in 0..2 {
        out[8 + i] = u8::from_str_radix(&groups[3][i * 2..i * 2 + 2], 16).ok()?;
    }
    for i in 0..6 {
        out[10 + i] = u8::from_str_radix(&groups[4][i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// Render a binary GUID back to its canonical textual form.
pub fn format_guid(guid: &[u8; 16]) -> String {
    let d1 = u32::from_le_bytes([guid[0], guid[1], guid[2], guid[3]]);
    let d2 = u16::from_le_bytes([guid[4], guid[5]]);
    let d3 = u16::from_le_bytes([guid[6], guid[7]]);
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        d1,
        d2,
        d3,
        guid[8],
        guid[9],
        guid[10],
        guid[11],
        guid[12],
        guid[13],
        guid[14],
        guid[15]
    )
}
