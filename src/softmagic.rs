//! The softmagic evaluator
//!
//! Walks a prepared [`RuleSet`] against a byte buffer. Set 0 is iterated
//! twice, binary-phase rules first and text-phase rules second, each phase
//! in strength order. A root match establishes a context; continuation
//! children refine it and contribute description fragments, MIME types,
//! and extensions.
//!
//! Evaluation is total: any internal fault (out-of-range offset, division
//! by zero in a mask, unresolvable reference) is a silent non-match for
//! that rule, reported through diagnostics only in debug mode. The whole
//! walk is bounded by explicit recursion budgets, so a hostile database
//! cannot hang an identification.

use crate::endian::{self, Endian};
use crate::error::Diagnostic;
use crate::printf::{Arg, DateKind};
use crate::rule::{flags, Relation, Rule, RuleId, RuleSet, StringMods, TypeTag};
use crate::value::{format_guid, Value};
use serde::Serialize;
use std::cmp::Ordering;

/// Recursion budget for `indirect` restarts
pub const MAX_INDIR_DEPTH: u32 = 15;
/// Recursion budget for `use` references
pub const MAX_USE_DEPTH: u32 = 15;
/// Deepest continuation level the evaluator will follow
pub const MAX_CONT_DEPTH: usize = 40;

/// Window scanned by `search` rules that carry no `/N` range
const SEARCH_DEFAULT_RANGE: usize = 100;
/// Byte cap for regex rules that carry no line limit
const REGEX_DEFAULT_WINDOW: usize = 8192;
/// Longest string subject rendered for an `x` relation
const STRING_PRINT_CAP: usize = 128;

/// Evaluation options
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Keep evaluating after the first hit and concatenate the outputs
    pub keep_going: bool,
    /// Record evaluator faults as diagnostics instead of dropping them
    pub debug: bool,
}

/// A successful identification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    /// Rendered description, fragments joined per continuation rules
    pub description: String,
    /// MIME type of the deepest rule that carried one
    pub mime: Option<String>,
    /// Extensions of the deepest rule that carried them, `/`-separated in
    /// the source
    pub extensions: Vec<String>,
    /// Apple creator/type tag
    pub apple: Option<String>,
}

/// Outcome of an identification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Verdict {
    /// At least one rule produced output
    Match(Match),
    /// Nothing matched; callers apply their own fallback
    None,
}

impl Verdict {
    /// True for [`Verdict::Match`]
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match(_))
    }
}

/// Evaluate `set` against `buf`.
///
/// Never fails: unidentified input yields [`Verdict::None`].
pub fn identify(set: &RuleSet, buf: &[u8], opts: &Options) -> Verdict {
    let mut diags = Vec::new();
    identify_collect(set, buf, opts, &mut diags)
}

/// Like [`identify`], collecting debug diagnostics into `diags`.
pub fn identify_collect(
    set: &RuleSet,
    buf: &[u8],
    opts: &Options,
    diags: &mut Vec<Diagnostic>,
) -> Verdict {
    match run_roots(set, buf, opts, 0, 0, diags) {
        Some(hit) => {
            let extensions = hit
                .ext
                .map(|e| e.split('/').map(str::to_string).collect())
                .unwrap_or_default();
            Verdict::Match(Match {
                description: hit.text,
                mime: hit.mime,
                extensions,
                apple: hit.apple,
            })
        }
        None => Verdict::None,
    }
}

struct Hit {
    text: String,
    mime: Option<String>,
    ext: Option<String>,
    apple: Option<String>,
}

/// Two-phase walk over set 0. Also the entry point for nested `indirect`
/// evaluation, which is why the recursion depths thread through.
fn run_roots(
    set: &RuleSet,
    buf: &[u8],
    opts: &Options,
    indir_depth: u32,
    use_depth: u32,
    diags: &mut Vec<Diagnostic>,
) -> Option<Hit> {
    let mut hit: Option<Hit> = None;

    for phase in [flags::BINTEST, flags::TEXTTEST] {
        // Roots are siblings at level 0: a `default` root only fires when
        // no earlier root matched within the same phase
        let mut level0_matched = false;

        for &root in set.roots(0) {
            if set.rule(root).flags & phase == 0 {
                continue;
            }

            let mut ctx = Ctx {
                set,
                buf,
                opts,
                out: String::new(),
                mime: None,
                ext: None,
                apple: None,
                last_end: 0,
                base: 0,
                flip: false,
                indir_depth,
                use_depth,
                matched: vec![level0_matched],
                faults: Vec::new(),
            };
            let matched = ctx.eval_rule(root, 0);
            level0_matched = ctx.level_matched(0);
            if opts.debug {
                diags.append(&mut ctx.faults);
            }

            let produced = matched
                && (!ctx.out.is_empty()
                    || ctx.mime.is_some()
                    || ctx.ext.is_some()
                    || ctx.apple.is_some());
            if !produced {
                continue;
            }

            match &mut hit {
                Some(hit) => {
                    if !ctx.out.is_empty() {
                        if !hit.text.is_empty() {
                            hit.text.push_str("\n- ");
                        }
                        hit.text.push_str(&ctx.out);
                    }
                    if hit.mime.is_none() {
                        hit.mime = ctx.mime.take();
                    }
                    if hit.ext.is_none() {
                        hit.ext = ctx.ext.take();
                    }
                    if hit.apple.is_none() {
                        hit.apple = ctx.apple.take();
                    }
                }
                None => {
                    hit = Some(Hit {
                        text: ctx.out,
                        mime: ctx.mime,
                        ext: ctx.ext,
                        apple: ctx.apple,
                    });
                    if !opts.keep_going {
                        return hit;
                    }
                }
            }
        }
    }

    hit
}

/// What one rule evaluation produced
struct Outcome<'a> {
    matched: bool,
    arg: Arg<'a>,
    /// Absolute offset one past the matched bytes
    end: usize,
}

struct Ctx<'a> {
    set: &'a RuleSet,
    buf: &'a [u8],
    opts: &'a Options,
    out: String,
    mime: Option<String>,
    ext: Option<String>,
    apple: Option<String>,
    /// One past the end of the last matched subject
    last_end: usize,
    /// Base added to non-relative offsets inside a `use` splice
    base: i64,
    /// Byte order flipped by a `use \^name` reference
    flip: bool,
    indir_depth: u32,
    use_depth: u32,
    /// Per-level "some sibling matched" flags for `default`/`clear`
    matched: Vec<bool>,
    /// Evaluator faults, surfaced only in debug mode
    faults: Vec<Diagnostic>,
}

impl<'a> Ctx<'a> {
    fn fault(&mut self, rule: &Rule, message: String) {
        if self.opts.debug {
            let file = self.set.file_of(rule).to_string();
            self.faults.push(Diagnostic::warning(&file, rule.line, message));
        }
    }
    fn eval_rule(&mut self, id: RuleId, depth: usize) -> bool {
        if depth > MAX_CONT_DEPTH {
            return false;
        }
        let set = self.set;
        let rule = set.rule(id);

        match rule.typ {
            // Named subtrees only run through `use`
            TypeTag::Name => false,
            TypeTag::Use => self.eval_use(rule, depth),
            TypeTag::Indirect => self.eval_indirect(rule),
            TypeTag::Clear => {
                self.set_matched(depth, false);
                self.append_desc(rule, &Arg::None);
                true
            }
            TypeTag::Default => {
                if self.level_matched(depth) {
                    return false;
                }
                self.set_matched(depth, true);
                self.append_desc(rule, &Arg::None);
                self.capture_side_channels(rule);
                self.eval_children(rule, depth);
                true
            }
            _ => {
                let Some(offset) = self.resolve_offset(rule) else {
                    return false;
                };
                let Some(outcome) = self.eval_subject(rule, offset) else {
                    return false;
                };
                if !outcome.matched {
                    return false;
                }

                self.set_matched(depth, true);
                self.last_end = outcome.end;
                self.append_desc(rule, &outcome.arg);
                self.capture_side_channels(rule);
                self.eval_children(rule, depth);
                true
            }
        }
    }

    fn eval_children(&mut self, rule: &Rule, depth: usize) {
        if rule.children.is_empty() {
            return;
        }
        self.set_matched(depth + 1, false);
        let children = &rule.children;
        for &child in children {
            self.eval_rule(child, depth + 1);
        }
    }

    fn level_matched(&self, depth: usize) -> bool {
        self.matched.get(depth).copied().unwrap_or(false)
    }

    fn set_matched(&mut self, depth: usize, value: bool) {
        if self.matched.len() <= depth {
            self.matched.resize(depth + 1, false);
        }
        self.matched[depth] = value;
    }

    fn append_desc(&mut self, rule: &Rule, arg: &Arg) {
        let text = rule.template.render(arg);
        if text.is_empty() {
            return;
        }
        if !self.out.is_empty() && rule.flags & flags::NOSPACE == 0 {
            self.out.push(' ');
        }
        self.out.push_str(&text);
    }

    fn capture_side_channels(&mut self, rule: &Rule) {
        // Deeper matches override shallower ones
        if rule.mime.is_some() {
            self.mime = rule.mime.clone();
        }
        if rule.ext.is_some() {
            self.ext = rule.ext.clone();
        }
        if rule.apple.is_some() {
            self.apple = rule.apple.clone();
        }
    }

    fn endian_of(&self, rule: &Rule) -> Endian {
        let e = rule.endian();
        if self.flip {
            e.flipped()
        } else {
            e
        }
    }

    // ---------------------------------------------------------------
    // Offset resolution
    // ---------------------------------------------------------------

    fn resolve_offset(&mut self, rule: &Rule) -> Option<usize> {
        let buf_len = self.buf.len() as i64;
        let base_val = rule.offset.base as i64;

        let mut off: i64 = if rule.flags & flags::OFFADD != 0 {
            self.last_end as i64 + base_val
        } else if rule.flags & flags::OFFNEGATIVE != 0 {
            buf_len + base_val
        } else {
            self.base + base_val
        };

        if let Some(ind) = &rule.offset.indirect {
            if off < 0 || off > buf_len {
                return None;
            }
            let endian = match ind.read.read_type.endian() {
                Endian::Native => Endian::Native,
                e if self.flip => e.flipped(),
                e => e,
            };
            let read_at = off as usize;
            let raw = match ind.read.read_type {
                TypeTag::BeId3 | TypeTag::LeId3 => endian::read_id3(self.buf, read_at, endian)?,
                t => {
                    let width = t.width()?;
                    endian::read_int(self.buf, read_at, width, endian, ind.read.signed)?
                }
            };
            let mut ptr = raw as i64;

            if let Some(op) = ind.op {
                let operand: i64 = if ind.operand_indirect {
                    let at = ptr.checked_add(ind.operand as i64)?;
                    if at < 0 {
                        return None;
                    }
                    endian::read_int(self.buf, at as usize, 4, endian, true)? as i64
                } else {
                    ind.operand as i64
                };
                ptr = op.apply_signed(ptr, operand)?;
            }

            if rule.flags & flags::INDIROFFADD != 0 {
                ptr = ptr.wrapping_add(self.last_end as i64);
            }
            off = ptr;
        }

        if off < 0 || off > buf_len {
            return None;
        }
        Some(off as usize)
    }

    // ---------------------------------------------------------------
    // Subject evaluation per type
    // ---------------------------------------------------------------

    fn eval_subject(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        use TypeTag::*;
        match rule.typ {
            String => self.eval_string(rule, offset),
            PString => self.eval_pstring(rule, offset),
            BeString16 | LeString16 => self.eval_string16(rule, offset),
            Search => self.eval_search(rule, offset),
            Regex => self.eval_regex(rule, offset),
            Octal => self.eval_octal(rule, offset),
            Der => self.eval_der(rule, offset),
            Guid => self.eval_guid(rule, offset),
            t if t.is_float_family() => self.eval_float(rule, offset),
            _ => self.eval_numeric(rule, offset),
        }
    }

    fn eval_numeric(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        let endian = self.endian_of(rule);
        let (raw, consumed): (u64, usize) = match rule.typ {
            TypeTag::BeVarint | TypeTag::LeVarint => {
                endian::read_varint(self.buf, offset, endian)?
            }
            TypeTag::BeId3 | TypeTag::LeId3 => (endian::read_id3(self.buf, offset, endian)?, 4),
            TypeTag::Offset => (offset as u64, 0),
            t => {
                let width = t.width()?;
                (endian::read_uint(self.buf, offset, width, endian)?, width)
            }
        };
        let width = rule.typ.width().unwrap_or(8);

        let mut subject = raw;
        if let Some((op, operand, inverse)) = rule.mask_op {
            subject = if rule.unsigned() {
                op.apply_unsigned(subject, operand)?
            } else {
                let a = endian::sign_extend(subject, width) as i64;
                op.apply_signed(a, operand as i64)? as u64
            };
            if inverse {
                subject = !subject;
            }
            subject = endian::truncate(subject, width);
        }

        let matched = self.compare_numeric(rule, subject, width)?;

        let arg = match date_kind(rule.typ) {
            Some(kind) => Arg::Date { raw: subject, kind },
            None => Arg::Int {
                value: if rule.unsigned() {
                    endian::truncate(subject, width)
                } else {
                    endian::sign_extend(subject, width)
                },
                signed: !rule.unsigned(),
            },
        };

        Some(Outcome {
            matched,
            arg,
            end: offset + consumed,
        })
    }

    fn compare_numeric(&self, rule: &Rule, subject: u64, width: usize) -> Option<bool> {
        if rule.reln == Relation::Any {
            return Some(true);
        }
        let want = match &rule.value {
            Value::Numeric { bits, .. } => *bits,
            _ => return Some(false),
        };
        let matched = match rule.reln {
            Relation::Equal | Relation::NotEqual | Relation::Less | Relation::Greater => {
                let ord = if rule.unsigned() {
                    endian::truncate(subject, width).cmp(&endian::truncate(want, width))
                } else {
                    (endian::sign_extend(subject, width) as i64)
                        .cmp(&(endian::sign_extend(want, width) as i64))
                };
                match rule.reln {
                    Relation::Equal => ord == Ordering::Equal,
                    Relation::NotEqual => ord != Ordering::Equal,
                    Relation::Less => ord == Ordering::Less,
                    Relation::Greater => ord == Ordering::Greater,
                    _ => unreachable!(),
                }
            }
            Relation::BitAllSet => subject & want == want,
            Relation::BitSomeClear => subject & want != want,
            Relation::BitNot => {
                endian::truncate(!subject, width) == endian::truncate(want, width)
            }
            Relation::Any => true,
        };
        Some(matched)
    }

    fn eval_float(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        let endian = self.endian_of(rule);
        let width = rule.typ.width()?;
        let subject = if width == 4 {
            endian::read_f32(self.buf, offset, endian)? as f64
        } else {
            endian::read_f64(self.buf, offset, endian)?
        };

        let matched = match rule.reln {
            Relation::Any => true,
            _ => {
                let want = match rule.value {
                    Value::Float(f) => f,
                    _ => return Some(Outcome { matched: false, arg: Arg::None, end: offset }),
                };
                match rule.reln {
                    Relation::Equal => subject == want,
                    Relation::NotEqual => subject != want,
                    Relation::Less => subject < want,
                    Relation::Greater => subject > want,
                    // Bit relations are meaningless on floats
                    _ => false,
                }
            }
        };

        Some(Outcome {
            matched,
            arg: Arg::Float(subject),
            end: offset + width,
        })
    }

    fn eval_string(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        let window = self.buf.get(offset..)?;

        if rule.reln == Relation::Any {
            let len = window
                .iter()
                .take(STRING_PRINT_CAP)
                .position(|&b| b == 0)
                .unwrap_or_else(|| window.len().min(STRING_PRINT_CAP));
            return Some(Outcome {
                matched: true,
                arg: Arg::Bytes(&window[..len]),
                end: offset + len,
            });
        }

        let want = match &rule.value {
            Value::Bytes(b) => b,
            _ => return None,
        };
        let (ord, consumed) = string_compare(want, window, &rule.mods)?;
        let matched = relation_on_ordering(rule.reln, ord);
        Some(Outcome {
            matched,
            arg: Arg::Bytes(&window[..consumed.min(window.len())]),
            end: offset + consumed,
        })
    }

    fn eval_pstring(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        let field_len = rule.mods.pstring_len.field_len();
        let raw_len = endian::read_uint(
            self.buf,
            offset,
            field_len,
            rule.mods.pstring_len.endian(),
        )? as usize;
        let len = if rule.mods.pstring_len_includes_self {
            raw_len.checked_sub(field_len)?
        } else {
            raw_len
        };

        let start = offset.checked_add(field_len)?;
        let end = start.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        let subject = &self.buf[start..end];

        let matched = match rule.reln {
            Relation::Any => true,
            _ => {
                let want = match &rule.value {
                    Value::Bytes(b) => b,
                    _ => return None,
                };
                // The stored length must agree exactly with the value
                if subject.len() != want.len() {
                    false
                } else {
                    match string_compare(want, subject, &rule.mods) {
                        Some((ord, _)) => relation_on_ordering(rule.reln, ord),
                        None => false,
                    }
                }
            }
        };

        Some(Outcome {
            matched,
            arg: Arg::Bytes(subject),
            end,
        })
    }

    fn eval_string16(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        let want = match &rule.value {
            Value::Bytes(b) => b,
            _ => return None,
        };
        let endian = rule.typ.endian();
        let mut narrowed = Vec::with_capacity(want.len());
        for i in 0..want.len() {
            let unit = endian::read_uint(self.buf, offset + i * 2, 2, endian)?;
            if unit > 0xff {
                return Some(Outcome {
                    matched: false,
                    arg: Arg::None,
                    end: offset,
                });
            }
            narrowed.push(unit as u8);
        }

        let matched = match string_compare(want, &narrowed, &rule.mods) {
            Some((ord, _)) => relation_on_ordering(rule.reln, ord),
            None => false,
        };
        let end = offset + want.len() * 2;
        Some(Outcome {
            matched,
            arg: Arg::Str(std::string::String::from_utf8_lossy(&narrowed).into_owned()),
            end,
        })
    }

    fn eval_search(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        let needle = match &rule.value {
            Value::Bytes(b) => b,
            _ => return None,
        };
        if needle.is_empty() {
            return None;
        }
        let range = if rule.str_range == 0 {
            SEARCH_DEFAULT_RANGE
        } else {
            rule.str_range as usize
        };

        let window = self.buf.get(offset..)?;
        let plain = !rule.mods.fold_lower
            && !rule.mods.fold_upper
            && !rule.mods.compact_ws
            && !rule.mods.opt_ws;

        let found: Option<(usize, usize)> = if plain {
            // Start positions live in [0, range); the needle may extend past
            let region_end = range.saturating_add(needle.len() - 1).min(window.len());
            memchr::memmem::find(&window[..region_end], needle)
                .filter(|&p| p < range)
                .map(|p| (p, needle.len()))
        } else {
            let mut hit = None;
            for p in 0..range.min(window.len()) {
                if let Some((Ordering::Equal, consumed)) =
                    string_compare(needle, &window[p..], &rule.mods)
                {
                    hit = Some((p, consumed));
                    break;
                }
            }
            hit
        };

        let matched = match rule.reln {
            Relation::NotEqual => found.is_none(),
            _ => found.is_some(),
        };
        let (pos, consumed) = found.unwrap_or((0, 0));
        Some(Outcome {
            matched,
            arg: Arg::Bytes(&window[pos..(pos + consumed).min(window.len())]),
            end: offset + pos + consumed,
        })
    }

    fn eval_regex(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        let compiled = match &rule.value {
            Value::Regex { compiled, .. } => compiled,
            _ => return None,
        };
        let window = self.buf.get(offset..)?;

        // A line limit cuts the region after the Nth newline; otherwise a
        // byte cap keeps pathological inputs cheap
        let region = if rule.str_range > 0 {
            let mut end = window.len();
            let mut lines = 0;
            for nl in memchr::memchr_iter(b'\n', window) {
                lines += 1;
                if lines >= rule.str_range {
                    end = nl + 1;
                    break;
                }
            }
            &window[..end]
        } else {
            &window[..window.len().min(REGEX_DEFAULT_WINDOW)]
        };

        match compiled.find(region) {
            Some(m) => {
                let end = if rule.mods.start_anchor {
                    offset + m.start()
                } else {
                    offset + m.end()
                };
                Some(Outcome {
                    matched: rule.reln != Relation::NotEqual,
                    arg: Arg::Bytes(&window[m.start()..m.end()]),
                    end,
                })
            }
            None => Some(Outcome {
                matched: rule.reln == Relation::NotEqual,
                arg: Arg::None,
                end: offset,
            }),
        }
    }

    fn eval_octal(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        let window = self.buf.get(offset..)?;
        let len = window
            .iter()
            .take(22)
            .position(|b| !(b'0'..=b'7').contains(b))
            .unwrap_or_else(|| window.len().min(22));
        if len == 0 {
            return None;
        }
        let mut subject: u64 = 0;
        for &b in &window[..len] {
            subject = subject.checked_mul(8)?.checked_add((b - b'0') as u64)?;
        }

        let matched = match rule.reln {
            Relation::Any => true,
            _ => {
                let want = octal_value(&rule.value)?;
                match rule.reln {
                    Relation::Equal => subject == want,
                    Relation::NotEqual => subject != want,
                    Relation::Less => subject < want,
                    Relation::Greater => subject > want,
                    Relation::BitAllSet => subject & want == want,
                    Relation::BitSomeClear => subject & want != want,
                    Relation::BitNot => !subject == want,
                    Relation::Any => true,
                }
            }
        };

        Some(Outcome {
            matched,
            arg: Arg::Int {
                value: subject,
                signed: false,
            },
            end: offset + len,
        })
    }

    fn eval_der(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        let (tag, header_len, content_len) = probe_der(self.buf, offset)?;
        let name = der_tag_name(tag);

        let matched = match &rule.value {
            Value::Der { tag_hint: None } => true,
            Value::Der {
                tag_hint: Some(hint),
            } => name == hint.as_str(),
            _ => false,
        };

        let end = offset
            .saturating_add(header_len)
            .saturating_add(content_len)
            .min(self.buf.len());
        Some(Outcome {
            matched,
            arg: Arg::Str(name.to_string()),
            end,
        })
    }

    fn eval_guid(&mut self, rule: &Rule, offset: usize) -> Option<Outcome<'a>> {
        let want = match &rule.value {
            Value::Guid(g) => g,
            _ => return None,
        };
        let bytes = self.buf.get(offset..offset + 16)?;
        let mut subject = [0u8; 16];
        subject.copy_from_slice(bytes);

        let matched = match rule.reln {
            Relation::Any => true,
            Relation::NotEqual => &subject != want,
            _ => &subject == want,
        };
        Some(Outcome {
            matched,
            arg: Arg::Str(format_guid(&subject)),
            end: offset + 16,
        })
    }

    // ---------------------------------------------------------------
    // Structural rules
    // ---------------------------------------------------------------

    fn eval_use(&mut self, rule: &Rule, depth: usize) -> bool {
        if self.use_depth >= MAX_USE_DEPTH {
            self.fault(rule, format!("`use` deeper than {}", MAX_USE_DEPTH));
            return false;
        }
        let Some(offset) = self.resolve_offset(rule) else {
            return false;
        };

        let name_bytes = match &rule.value {
            Value::Bytes(b) => b,
            _ => return false,
        };
        let name = std::string::String::from_utf8_lossy(name_bytes);
        let (flip, target_name) = match name.strip_prefix('^') {
            Some(stripped) => (true, stripped.to_string()),
            None => (false, name.into_owned()),
        };
        let set = self.set;
        let Some(target) = set.named(&target_name) else {
            self.fault(rule, format!("`use {}` is unresolved", target_name));
            return false;
        };

        let saved_out_len = self.out.len();
        let saved_base = self.base;
        let saved_flip = self.flip;
        let saved_mime = self.mime.clone();
        let saved_ext = self.ext.clone();
        let saved_apple = self.apple.clone();
        self.base = offset as i64;
        if flip {
            self.flip = !self.flip;
        }
        self.use_depth += 1;

        // Self before children, like any other match: a deeper capture in
        // the referenced subtree overrides the `use` line's own
        self.append_desc(rule, &Arg::None);
        self.capture_side_channels(rule);
        self.set_matched(depth + 1, false);
        let mut any = false;
        let children = &set.rule(target).children;
        for &child in children {
            if self.eval_rule(child, depth + 1) {
                any = true;
            }
        }

        self.use_depth -= 1;
        self.base = saved_base;
        self.flip = saved_flip;

        if any {
            self.set_matched(depth, true);
            true
        } else {
            // Nothing under the reference matched; drop the spliced text
            // and captures
            self.out.truncate(saved_out_len);
            self.mime = saved_mime;
            self.ext = saved_ext;
            self.apple = saved_apple;
            false
        }
    }

    fn eval_indirect(&mut self, rule: &Rule) -> bool {
        if self.indir_depth >= MAX_INDIR_DEPTH {
            self.fault(rule, format!("`indirect` deeper than {}", MAX_INDIR_DEPTH));
            return false;
        }
        let Some(offset) = self.resolve_offset(rule) else {
            return false;
        };
        if offset >= self.buf.len() {
            return false;
        }

        let mut nested_diags = Vec::new();
        let nested = run_roots(
            self.set,
            &self.buf[offset..],
            self.opts,
            self.indir_depth + 1,
            self.use_depth,
            &mut nested_diags,
        );

        match nested {
            Some(hit) => {
                self.append_desc(rule, &Arg::None);
                if !hit.text.is_empty() {
                    if !self.out.is_empty() && rule.flags & flags::NOSPACE == 0 {
                        self.out.push(' ');
                    }
                    self.out.push_str(&hit.text);
                }
                if hit.mime.is_some() {
                    self.mime = hit.mime;
                }
                if hit.ext.is_some() {
                    self.ext = hit.ext;
                }
                if hit.apple.is_some() {
                    self.apple = hit.apple;
                }
                true
            }
            None => false,
        }
    }
}

fn octal_value(value: &Value) -> Option<u64> {
    match value {
        Value::Bytes(digits) => {
            let mut v: u64 = 0;
            for &b in digits {
                if !(b'0'..=b'7').contains(&b) {
                    return None;
                }
                v = v.checked_mul(8)?.checked_add((b - b'0') as u64)?;
            }
            Some(v)
        }
        Value::Numeric { bits, .. } => Some(*bits),
        _ => None,
    }
}

fn relation_on_ordering(reln: Relation, ord: Ordering) -> bool {
    match reln {
        Relation::Equal => ord == Ordering::Equal,
        Relation::NotEqual => ord != Ordering::Equal,
        Relation::Less => ord == Ordering::Less,
        Relation::Greater => ord == Ordering::Greater,
        Relation::Any => true,
        _ => false,
    }
}

/// Compare a rule value against buffer bytes under the string modifiers.
///
/// Returns the ordering of the subject relative to the value and the
/// number of subject bytes consumed, or `None` when a structural
/// constraint (word boundary) fails.
fn string_compare(value: &[u8], window: &[u8], mods: &StringMods) -> Option<(Ordering, usize)> {
    let mut wi = 0;

    if mods.trim {
        while wi < window.len() && window[wi].is_ascii_whitespace() {
            wi += 1;
        }
    }

    for &vb in value {
        if mods.compact_ws && vb == b' ' {
            // One value blank eats a run of subject blanks
            if wi >= window.len() || window[wi] != b' ' {
                if mods.opt_ws {
                    continue;
                }
                let got = window.get(wi).copied().unwrap_or(0);
                return Some((got.cmp(&vb), wi));
            }
            while wi < window.len() && window[wi] == b' ' {
                wi += 1;
            }
            continue;
        }
        if mods.opt_ws && vb == b' ' {
            if wi < window.len() && window[wi] == b' ' {
                wi += 1;
            }
            continue;
        }

        let Some(&sb) = window.get(wi) else {
            // Subject ran out before the value did
            return Some((Ordering::Less, wi));
        };

        let fold = (mods.fold_lower && vb.is_ascii_lowercase())
            || (mods.fold_upper && vb.is_ascii_uppercase());
        let (a, b) = if fold {
            (sb.to_ascii_lowercase(), vb.to_ascii_lowercase())
        } else {
            (sb, vb)
        };
        if a != b {
            return Some((a.cmp(&b), wi));
        }
        wi += 1;
    }

    if mods.full_word {
        if let Some(&next) = window.get(wi) {
            if next.is_ascii_alphanumeric() {
                return None;
            }
        }
    }

    Some((Ordering::Equal, wi))
}

fn date_kind(typ: TypeTag) -> Option<DateKind> {
    use TypeTag::*;
    Some(match typ {
        Date | BeDate | LeDate | MeDate | LDate | BeLDate | LeLDate | MeLDate | QDate
        | BeQDate | LeQDate | QLDate | BeQLDate | LeQLDate => DateKind::Unix,
        QwDate | BeQwDate | LeQwDate => DateKind::Windows,
        MsDosDate | BeMsDosDate | LeMsDosDate => DateKind::DosDate,
        MsDosTime | BeMsDosTime | LeMsDosTime => DateKind::DosTime,
        _ => return None,
    })
}

/// Probe one DER element: tag byte plus a well-formed short or long form
/// length whose content fits the buffer. Returns the tag, header length,
/// and content length.
fn probe_der(buf: &[u8], offset: usize) -> Option<(u8, usize, usize)> {
    let tag = *buf.get(offset)?;
    // Multi-byte tag numbers are out of scope for the probe
    if tag & 0x1f == 0x1f {
        return None;
    }
    let first = *buf.get(offset + 1)?;
    let (header_len, content_len) = if first < 0x80 {
        (2usize, first as usize)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 {
            return None;
        }
        let mut len = 0usize;
        for i in 0..n {
            len = (len << 8) | *buf.get(offset + 2 + i)? as usize;
        }
        (2 + n, len)
    };
    if offset + header_len + content_len > buf.len() {
        return None;
    }
    Some((tag, header_len, content_len))
}

/// Universal tag names indexed by the low five tag bits, after the scheme
/// the reference databases use in `der` hints.
const DER_TAG_NAMES: [&str; 32] = [
    "eoc", "bool", "int", "bit_str", "octet_str", "null", "obj_id", "obj_desc", "ext", "real",
    "enum", "embed", "utf8_str", "rel_oid", "res1", "res2", "seq", "set", "num_str", "prt_str",
    "t61_str", "vid_str", "ia5_str", "utc_time", "gen_time", "gr_str", "vis_str", "gen_str",
    "univ_str", "char_str", "bmp_str", "high",
];

fn der_tag_name(tag: u8) -> &'static str {
    DER_TAG_NAMES[(tag & 0x1f) as usize]
}
