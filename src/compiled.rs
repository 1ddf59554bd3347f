//! Compiled database codec
//!
//! A compiled database is a 16-byte header followed by fixed-width records
//! with stable field offsets, one record per rule in evaluation order.
//! Parent/child structure is implicit: a record at a higher `cont_level`
//! continues the nearest preceding record one level shallower, exactly as
//! in the textual form.
//!
//! # Layout
//!
//! ```text
//! [Header: magic u32, version u32, set-0 count u32, set-1 count u32]
//! [Padding up to one record slot]
//! [Set 0 records][Set 1 records]
//! ```
//!
//! Record layout (offsets in bytes, version 20; versions 18 and 19 shorten
//! `ext` from 120 to 64 bytes):
//!
//! | Offset | Size | Field |
//! |-------:|-----:|-------|
//! | 0      | 2    | flags |
//! | 2      | 1    | cont_level |
//! | 3      | 1    | factor |
//! | 4      | 1    | reln |
//! | 5      | 1    | vallen |
//! | 6      | 1    | type |
//! | 7      | 1    | in_type |
//! | 8      | 1    | in_op |
//! | 9      | 1    | mask_op |
//! | 10     | 1    | cond |
//! | 11     | 1    | factor_op |
//! | 12     | 4    | offset |
//! | 16     | 4    | in_offset |
//! | 20     | 4    | lineno |
//! | 24     | 8    | num_mask / str_range + str_flags |
//! | 32     | 128  | value |
//! | 160    | 64   | desc |
//! | 224    | 80   | mimetype |
//! | 304    | 8    | apple |
//! | 312    | 64/120 | ext |
//!
//! Integers are little-endian when the magic number reads directly and
//! big-endian when it reads byte-reversed. Writers always emit
//! little-endian version 20; readers accept versions 18 through 20 in
//! either byte order. String fields are NUL-padded.

use crate::error::{Diagnostic, MagicError, Result};
use crate::printf::Template;
use crate::rule::{
    flags, Indirect, IndirectRead, Op, OffsetExpr, Relation, Rule, RuleSet, StringMods, TypeTag,
    OP_INDIRECT, OP_INVERSE,
};
use crate::value::{Value, MAX_VALUE_LEN};
use regex::bytes::RegexBuilder;

/// The compiled-format magic number
pub const MAGICNO: u32 = 0xF11E041C;
/// Oldest version accepted by the reader
pub const VERSION_MIN: u32 = 18;
/// Newest version accepted by the reader
pub const VERSION_MAX: u32 = 20;
/// Version emitted by the writer
pub const VERSION_DEFAULT: u32 = 20;

const HEADER_LEN: usize = 16;
const VALUE_OFF: usize = 32;
const DESC_OFF: usize = 160;
const DESC_LEN: usize = 64;
const MIME_OFF: usize = 224;
const MIME_LEN: usize = 80;
const APPLE_OFF: usize = 304;
const APPLE_LEN: usize = 8;
const EXT_OFF: usize = 312;

/// `in_op` bit: an op is present at all
const IN_OP_PRESENT: u8 = 0x40;
/// `in_op` bit: the pointer read sign-extends
const IN_OP_SIGNED: u8 = 0x20;

/// Record size for a given version
pub fn record_size(version: u32) -> usize {
    if version >= 20 {
        432
    } else {
        376
    }
}

fn ext_len(version: u32) -> usize {
    if version >= 20 {
        120
    } else {
        64
    }
}

/// True when `data` starts with the compiled magic number in either byte
/// order.
pub fn is_compiled(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    let le = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    le == MAGICNO || le.swap_bytes() == MAGICNO
}

// Byte-order aware field accessors. `swapped` means the file was written
// on a machine of the other endianness.

fn get_u16(rec: &[u8], off: usize, swapped: bool) -> u16 {
    let v = u16::from_le_bytes([rec[off], rec[off + 1]]);
    if swapped {
        v.swap_bytes()
    } else {
        v
    }
}

fn get_u32(rec: &[u8], off: usize, swapped: bool) -> u32 {
    let v = u32::from_le_bytes([rec[off], rec[off + 1], rec[off + 2], rec[off + 3]]);
    if swapped {
        v.swap_bytes()
    } else {
        v
    }
}

fn get_u64(rec: &[u8], off: usize, swapped: bool) -> u64 {
    let v = u64::from_le_bytes(rec[off..off + 8].try_into().unwrap());
    if swapped {
        v.swap_bytes()
    } else {
        v
    }
}

fn put_u16(rec: &mut [u8], off: usize, v: u16) {
    rec[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(rec: &mut [u8], off: usize, v: u32) {
    rec[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(rec: &mut [u8], off: usize, v: u64) {
    rec[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn cstr(field: &[u8]) -> &[u8] {
    match memchr::memchr(0, field) {
        Some(nul) => &field[..nul],
        None => field,
    }
}

fn put_str(
    rec: &mut [u8],
    off: usize,
    len: usize,
    text: &str,
    what: &str,
    line: u32,
    diags: &mut Vec<Diagnostic>,
) {
    let bytes = text.as_bytes();
    if bytes.len() > len {
        diags.push(Diagnostic::warning(
            "(compile)",
            line,
            format!("{} truncated to {} bytes", what, len),
        ));
    }
    let n = bytes.len().min(len);
    rec[off..off + n].copy_from_slice(&bytes[..n]);
}

/// Serialize a rule set to compiled bytes. Always emits little-endian
/// version 20.
pub fn to_bytes(set: &RuleSet, diags: &mut Vec<Diagnostic>) -> Vec<u8> {
    let slot = record_size(VERSION_DEFAULT);
    let mut counts = [0u32; 2];
    let mut body: Vec<u8> = Vec::new();

    for (s, count) in counts.iter_mut().enumerate() {
        for &root in &set.sets[s] {
            *count += write_subtree(set, root, &mut body, diags);
        }
    }

    let mut out = vec![0u8; slot];
    put_u32(&mut out, 0, MAGICNO);
    put_u32(&mut out, 4, VERSION_DEFAULT);
    put_u32(&mut out, 8, counts[0]);
    put_u32(&mut out, 12, counts[1]);
    out.extend_from_slice(&body);
    out
}

fn write_subtree(set: &RuleSet, id: usize, body: &mut Vec<u8>, diags: &mut Vec<Diagnostic>) -> u32 {
    let mut written = 1;
    body.extend_from_slice(&encode_record(set.rule(id), diags));
    for &child in &set.rule(id).children {
        written += write_subtree(set, child, body, diags);
    }
    written
}

fn encode_record(rule: &Rule, diags: &mut Vec<Diagnostic>) -> Vec<u8> {
    let mut rec = vec![0u8; record_size(VERSION_DEFAULT)];

    put_u16(&mut rec, 0, rule.flags);
    rec[2] = rule.level;
    rec[4] = rule.reln.as_char();
    rec[5] = rule.value.vallen();
    rec[6] = rule.typ as u8;

    if let Some(ind) = &rule.offset.indirect {
        rec[7] = ind.read.read_type as u8;
        let mut in_op = 0u8;
        if let Some(op) = ind.op {
            in_op |= op as u8 | IN_OP_PRESENT;
        }
        if ind.read.signed {
            in_op |= IN_OP_SIGNED;
        }
        if ind.operand_indirect {
            in_op |= OP_INDIRECT;
        }
        rec[8] = in_op;
        put_u32(&mut rec, 16, ind.operand as u32);
    }

    if let Some((op, operand, inverse)) = rule.mask_op {
        rec[9] = op as u8 | if inverse { OP_INVERSE } else { 0 };
        put_u64(&mut rec, 24, operand);
    }

    if let Some((op, factor)) = rule.factor_op {
        rec[3] = factor;
        rec[11] = op;
    }

    put_u32(&mut rec, 12, rule.offset.base as u32);
    put_u32(&mut rec, 20, rule.line);

    if rule.typ.is_string_family() {
        put_u32(&mut rec, 24, rule.str_range);
        put_u32(
            &mut rec,
            28,
            rule.mods.to_bits(rule.typ == TypeTag::PString),
        );
    }

    match &rule.value {
        Value::Numeric { bits, .. } => put_u64(&mut rec, VALUE_OFF, *bits),
        Value::Float(f) => put_u64(&mut rec, VALUE_OFF, f.to_bits()),
        Value::Bytes(b) => rec[VALUE_OFF..VALUE_OFF + b.len()].copy_from_slice(b),
        Value::Regex { pattern, .. } => {
            let n = pattern.len().min(MAX_VALUE_LEN);
            rec[VALUE_OFF..VALUE_OFF + n].copy_from_slice(&pattern[..n]);
        }
        Value::Der { tag_hint } => {
            if let Some(tag) = tag_hint {
                let n = tag.len().min(MAX_VALUE_LEN);
                rec[VALUE_OFF..VALUE_OFF + n].copy_from_slice(&tag.as_bytes()[..n]);
            }
        }
        Value::Guid(g) => rec[VALUE_OFF..VALUE_OFF + 16].copy_from_slice(g),
        Value::None => {}
    }

    put_str(&mut rec, DESC_OFF, DESC_LEN, &rule.desc, "description", rule.line, diags);
    if let Some(mime) = &rule.mime {
        put_str(&mut rec, MIME_OFF, MIME_LEN, mime, "mime type", rule.line, diags);
    }
    if let Some(apple) = &rule.apple {
        put_str(&mut rec, APPLE_OFF, APPLE_LEN, apple, "apple tag", rule.line, diags);
    }
    if let Some(ext) = &rule.ext {
        put_str(
            &mut rec,
            EXT_OFF,
            ext_len(VERSION_DEFAULT),
            ext,
            "extension list",
            rule.line,
            diags,
        );
    }

    rec
}

/// Parse compiled bytes into a rule set.
///
/// `origin` names the input for diagnostics. Strengths are recomputed for
/// listings, but the stored evaluation order is preserved as-is.
pub fn from_bytes(data: &[u8], origin: &str, diags: &mut Vec<Diagnostic>) -> Result<RuleSet> {
    if data.len() < HEADER_LEN {
        return Err(MagicError::Truncated {
            required: HEADER_LEN,
            actual: data.len(),
        });
    }

    let raw_magic = get_u32(data, 0, false);
    let swapped = if raw_magic == MAGICNO {
        false
    } else if raw_magic.swap_bytes() == MAGICNO {
        true
    } else {
        return Err(MagicError::BadMagicNumber { found: raw_magic });
    };

    let version = get_u32(data, 4, swapped);
    if !(VERSION_MIN..=VERSION_MAX).contains(&version) {
        return Err(MagicError::UnsupportedVersion { found: version });
    }

    let counts = [get_u32(data, 8, swapped) as usize, get_u32(data, 12, swapped) as usize];
    let rec_len = record_size(version);
    let total = counts[0]
        .checked_add(counts[1])
        .and_then(|n| n.checked_mul(rec_len))
        .and_then(|n| n.checked_add(rec_len))
        .ok_or_else(|| MagicError::Format("record counts overflow".to_string()))?;
    if data.len() < total {
        return Err(MagicError::Truncated {
            required: total,
            actual: data.len(),
        });
    }

    let mut set = RuleSet::default();
    set.source_files.push(origin.to_string());

    let mut stack: Vec<usize> = Vec::new();
    let mut index = 0usize;
    for (s, &count) in counts.iter().enumerate() {
        stack.clear();
        for _ in 0..count {
            let start = rec_len + index * rec_len;
            index += 1;
            let rec = &data[start..start + rec_len];
            let rule = match decode_record(rec, version, swapped, origin, diags) {
                Some(rule) => rule,
                None => continue,
            };

            let level = rule.level as usize;
            if level > 0 && stack.len() < level {
                diags.push(Diagnostic::error(
                    origin,
                    rule.line,
                    format!("record at continuation level {} with no parent", level),
                ));
                continue;
            }

            let id = set.rules.len();
            set.rules.push(rule);
            if level == 0 {
                set.sets[s].push(id);
            } else {
                let parent = stack[level - 1];
                set.rules[parent].children.push(id);
            }
            stack.truncate(level);
            stack.push(id);
        }
    }

    crate::strength::compute_all(&mut set);
    crate::classifier::index_names(&mut set, diags);
    Ok(set)
}

fn decode_record(
    rec: &[u8],
    version: u32,
    swapped: bool,
    origin: &str,
    diags: &mut Vec<Diagnostic>,
) -> Option<Rule> {
    let lineno = get_u32(rec, 20, swapped);
    let type_code = rec[6];
    let Some(typ) = TypeTag::from_code(type_code) else {
        diags.push(Diagnostic::error(
            origin,
            lineno,
            format!("unknown type code {}", type_code),
        ));
        return None;
    };

    let Some(reln) = Relation::from_char(rec[4]) else {
        diags.push(Diagnostic::error(
            origin,
            lineno,
            format!("unknown relation {:#04x}", rec[4]),
        ));
        return None;
    };

    let rule_flags = get_u16(rec, 0, swapped);
    let vallen = rec[5] as usize;
    if vallen > MAX_VALUE_LEN {
        diags.push(Diagnostic::error(origin, lineno, "value length over 128"));
        return None;
    }

    let indirect = if rule_flags & flags::INDIR != 0 {
        let read_type = TypeTag::from_code(rec[7]).unwrap_or(TypeTag::Long);
        let in_op = rec[8];
        Some(Indirect {
            read: IndirectRead {
                read_type,
                signed: in_op & IN_OP_SIGNED != 0,
            },
            op: if in_op & IN_OP_PRESENT != 0 {
                Op::from_code(in_op)
            } else {
                None
            },
            operand_indirect: in_op & OP_INDIRECT != 0,
            operand: get_u32(rec, 16, swapped) as i32,
        })
    } else {
        None
    };

    let (mods, str_range, mask_op) = if typ.is_string_family() {
        let str_range = get_u32(rec, 24, swapped);
        let str_bits = get_u32(rec, 28, swapped);
        (StringMods::from_bits(str_bits), str_range, None)
    } else {
        let num_mask = get_u64(rec, 24, swapped);
        let op_byte = rec[9];
        let mask_op = if op_byte != 0 || num_mask != 0 {
            Op::from_code(op_byte).map(|op| (op, num_mask, op_byte & OP_INVERSE != 0))
        } else {
            None
        };
        (StringMods::default(), 0, mask_op)
    };

    let blob = &rec[VALUE_OFF..VALUE_OFF + MAX_VALUE_LEN];
    let value = match typ {
        TypeTag::Default | TypeTag::Clear | TypeTag::Indirect => Value::None,
        TypeTag::Guid => {
            let mut g = [0u8; 16];
            g.copy_from_slice(&blob[..16]);
            Value::Guid(g)
        }
        TypeTag::Der => {
            if vallen == 0 {
                Value::Der { tag_hint: None }
            } else {
                Value::Der {
                    tag_hint: Some(String::from_utf8_lossy(&blob[..vallen]).into_owned()),
                }
            }
        }
        TypeTag::Regex => {
            let pattern = blob[..vallen].to_vec();
            let text = String::from_utf8_lossy(&pattern).into_owned();
            let fold = mods.fold_lower || mods.fold_upper;
            match RegexBuilder::new(&text)
                .unicode(false)
                .multi_line(true)
                .case_insensitive(fold)
                .build()
            {
                Ok(compiled) => Value::Regex { pattern, compiled },
                Err(e) => {
                    diags.push(Diagnostic::error(
                        origin,
                        lineno,
                        format!("stored regex does not compile: {}", e),
                    ));
                    return None;
                }
            }
        }
        t if t.is_string_family() => Value::Bytes(blob[..vallen].to_vec()),
        TypeTag::Name | TypeTag::Use => Value::Bytes(blob[..vallen].to_vec()),
        t if t.is_float_family() => Value::Float(f64::from_bits(get_u64(rec, VALUE_OFF, swapped))),
        _ => {
            if reln == Relation::Any {
                Value::None
            } else {
                Value::Numeric {
                    bits: get_u64(rec, VALUE_OFF, swapped),
                    width: typ.width().unwrap_or(8) as u8,
                }
            }
        }
    };

    // Version 18 records carry the narrow ext field; the widened tail
    // reads as empty
    let ext_field = cstr(&rec[EXT_OFF..EXT_OFF + ext_len(version)]);

    let desc = String::from_utf8_lossy(cstr(&rec[DESC_OFF..DESC_OFF + DESC_LEN])).into_owned();
    let template = Template::parse(&desc);
    let mime = cstr(&rec[MIME_OFF..MIME_OFF + MIME_LEN]);
    let apple = cstr(&rec[APPLE_OFF..APPLE_OFF + APPLE_LEN]);

    let factor_op = if rec[11] != 0 {
        Some((rec[11], rec[3]))
    } else {
        None
    };

    Some(Rule {
        level: rec[2],
        offset: OffsetExpr {
            base: get_u32(rec, 12, swapped) as i32,
            indirect,
        },
        typ,
        flags: rule_flags,
        mods,
        str_range,
        mask_op,
        reln,
        value,
        desc,
        template,
        mime: if mime.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(mime).into_owned())
        },
        ext: if ext_field.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(ext_field).into_owned())
        },
        apple: if apple.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(apple).into_owned())
        },
        strength: 0,
        factor_op,
        children: Vec::new(),
        line: lineno,
        file_index: 0,
    })
}
