//! Magic source parser
//!
//! Turns textual magic rules into the in-memory [`RuleSet`] arena. One
//! source line becomes one [`Rule`]; leading `>` characters give the
//! continuation depth and a stack of "last rule seen at each depth" links
//! children to parents. `!:` directive lines attach side data to the most
//! recently parsed rule.
//!
//! Parsing is resilient. A malformed line is dropped with a diagnostic and
//! the walk continues, so one broken rule never takes down a database.

use crate::error::Diagnostic;
use crate::escape;
use crate::printf::Template;
use crate::rule::{
    flags, Indirect, IndirectRead, Op, OffsetExpr, PStringLen, Relation, Rule, RuleSet,
    StringMods, TypeTag,
};
use crate::value::{parse_guid, Value, MAX_VALUE_LEN};
use regex::bytes::RegexBuilder;

/// Deepest continuation level accepted from source
pub const MAX_CONT_LEVEL: usize = 40;

/// Parse one magic source file into `set`.
///
/// Errors are reported through `diags`; the offending lines are skipped.
pub fn parse_into(set: &mut RuleSet, text: &str, filename: &str, diags: &mut Vec<Diagnostic>) {
    let file_index = set.source_files.len();
    set.source_files.push(filename.to_string());

    // Last rule seen at each continuation depth
    let mut stack: Vec<usize> = Vec::new();
    let mut last_rule: Option<usize> = None;

    for (lineno, raw_line) in text.lines().enumerate() {
        let lineno = (lineno + 1) as u32;
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(directive) = line.strip_prefix("!:") {
            apply_directive(set, last_rule, directive, filename, lineno, diags);
            continue;
        }

        match parse_rule(line, file_index, lineno, diags, filename) {
            Ok(rule) => {
                let level = rule.level as usize;
                if level > 0 && stack.len() < level {
                    diags.push(Diagnostic::error(
                        filename,
                        lineno,
                        format!("continuation level {} with no parent", level),
                    ));
                    continue;
                }

                let id = set.rules.len();
                set.rules.push(rule);
                if level == 0 {
                    // Filename patterns would land in set 1; content rules
                    // all live in set 0
                    set.sets[0].push(id);
                } else {
                    let parent = stack[level - 1];
                    set.rules[parent].children.push(id);
                }
                stack.truncate(level);
                stack.push(id);
                last_rule = Some(id);
            }
            Err(message) => {
                diags.push(Diagnostic::error(filename, lineno, message));
            }
        }
    }
}

fn apply_directive(
    set: &mut RuleSet,
    last_rule: Option<usize>,
    directive: &str,
    filename: &str,
    lineno: u32,
    diags: &mut Vec<Diagnostic>,
) {
    let (keyword, arg) = match directive.split_once(char::is_whitespace) {
        Some((k, a)) => (k, a.trim()),
        None => (directive, ""),
    };

    let Some(id) = last_rule else {
        diags.push(Diagnostic::warning(
            filename,
            lineno,
            format!("`!:{}` with no preceding rule", keyword),
        ));
        return;
    };

    match keyword {
        "mime" => {
            if arg.is_empty() {
                diags.push(Diagnostic::error(filename, lineno, "`!:mime` without a type"));
            } else {
                set.rules[id].mime = Some(arg.to_string());
            }
        }
        "ext" => {
            if arg.is_empty() {
                diags.push(Diagnostic::error(filename, lineno, "`!:ext` without a list"));
            } else {
                set.rules[id].ext = Some(arg.to_string());
            }
        }
        "apple" => {
            if arg.len() != 8 {
                diags.push(Diagnostic::warning(
                    filename,
                    lineno,
                    format!("`!:apple` tag `{}` is not 8 characters", arg),
                ));
            }
            set.rules[id].apple = Some(arg.to_string());
        }
        "strength" => match parse_strength_arg(arg) {
            Some(factor) => set.rules[id].factor_op = Some(factor),
            None => diags.push(Diagnostic::error(
                filename,
                lineno,
                "`!:strength` needs an operator and/or a value in 0..=255",
            )),
        },
        "fbsd-version" => {
            // Accepted for compatibility; carries no behavior here
        }
        "name" => {
            if set.rules[id].typ == TypeTag::Name && !arg.is_empty() {
                set.rules[id].value = Value::Bytes(arg.as_bytes().to_vec());
            } else {
                diags.push(Diagnostic::warning(
                    filename,
                    lineno,
                    "`!:name` applies only to a `name` rule",
                ));
            }
        }
        other => {
            diags.push(Diagnostic::error(
                filename,
                lineno,
                format!("unknown directive `!:{}`", other),
            ));
        }
    }
}

/// `<op><N>` or bare `<N>`; a bare value sets the strength absolutely.
fn parse_strength_arg(arg: &str) -> Option<(u8, u8)> {
    let bytes = arg.as_bytes();
    let (op, rest) = match bytes.first()? {
        b'+' | b'-' | b'*' | b'/' => (bytes[0], &arg[1..]),
        _ => (b'=', arg),
    };
    let value: u32 = rest.trim().parse().ok()?;
    if value > 255 {
        return None;
    }
    Some((op, value as u8))
}

fn parse_rule(
    line: &str,
    file_index: usize,
    lineno: u32,
    diags: &mut Vec<Diagnostic>,
    filename: &str,
) -> Result<Rule, String> {
    let bytes = line.as_bytes();
    let mut pos = 0;

    // Continuation depth
    let mut level = 0usize;
    while pos < bytes.len() && bytes[pos] == b'>' {
        level += 1;
        pos += 1;
    }
    if level > MAX_CONT_LEVEL {
        return Err(format!("continuation deeper than {}", MAX_CONT_LEVEL));
    }

    let (offset_tok, next) = take_field(bytes, pos);
    if offset_tok.is_empty() {
        return Err("missing offset field".to_string());
    }
    pos = skip_ws(bytes, next);

    let (type_tok, next) = take_field(bytes, pos);
    if type_tok.is_empty() {
        return Err("missing type field".to_string());
    }
    pos = skip_ws(bytes, next);

    let (test_tok, next) = take_field(bytes, pos);
    if test_tok.is_empty() {
        return Err("missing test field".to_string());
    }
    pos = skip_ws(bytes, next);

    let message = &line[pos.min(line.len())..];

    let offset_str = std::str::from_utf8(offset_tok).map_err(|_| "offset field is not UTF-8")?;
    let type_str = std::str::from_utf8(type_tok).map_err(|_| "type field is not UTF-8")?;
    let (offset, mut rule_flags) = parse_offset(offset_str)?;
    let parsed_type = parse_type(type_str, diags, filename, lineno)?;
    if parsed_type.unsigned {
        rule_flags |= flags::UNSIGNED;
    }

    let test_str = std::str::from_utf8(test_tok).map_err(|_| "test field is not UTF-8")?;
    let (reln, value) = parse_test(&parsed_type, test_str)?;

    // A leading `\b` in the message glues the description to its parent
    let mut message = message;
    if let Some(stripped) = message.strip_prefix("\\b") {
        rule_flags |= flags::NOSPACE;
        message = stripped;
    }
    let decoded = escape::decode(message);
    for c in &decoded.unknown_escapes {
        diags.push(Diagnostic::warning(
            filename,
            lineno,
            format!("unknown escape `\\{}` in description", c),
        ));
    }
    let desc = String::from_utf8_lossy(&decoded.bytes).into_owned();
    let template = Template::parse(&desc);

    Ok(Rule {
        level: level as u8,
        offset,
        typ: parsed_type.tag,
        flags: rule_flags,
        mods: parsed_type.mods,
        str_range: parsed_type.str_range,
        mask_op: parsed_type.mask_op,
        reln,
        value,
        desc,
        template,
        mime: None,
        ext: None,
        apple: None,
        strength: 0,
        factor_op: None,
        children: Vec::new(),
        line: lineno,
        file_index,
    })
}

/// Take a whitespace-delimited field. A backslash escapes the next byte so
/// `\ ` survives inside string values, but a tab terminates the field
/// unconditionally.
fn take_field(bytes: &[u8], start: usize) -> (&[u8], usize) {
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' => break,
            b'\\' if i + 1 < bytes.len() && bytes[i + 1] != b'\t' => i += 2,
            _ => i += 1,
        }
    }
    (&bytes[start..i], i)
}

fn skip_ws(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
        pos += 1;
    }
    pos
}

/// Scan an unsigned C-style numeral: `0x` hex, leading-zero octal, else
/// decimal. Returns the value and bytes consumed.
fn scan_u64(bytes: &[u8]) -> Option<(u64, usize)> {
    let (radix, start) = if bytes.len() > 2 && bytes[0] == b'0' && (bytes[1] | 0x20) == b'x' {
        (16, 2)
    } else if bytes.len() > 1 && bytes[0] == b'0' && bytes[1].is_ascii_digit() {
        (8, 1)
    } else {
        (10, 0)
    };

    let mut end = start;
    while end < bytes.len() && (bytes[end] as char).is_digit(radix) {
        end += 1;
    }
    if end == start {
        return None;
    }
    let text = std::str::from_utf8(&bytes[start..end]).ok()?;
    let value = u64::from_str_radix(text, radix).ok()?;
    Some((value, end))
}

/// Scan a numeral with an optional sign.
fn scan_i64(bytes: &[u8]) -> Option<(i64, usize)> {
    let (negative, start) = match bytes.first()? {
        b'-' => (true, 1),
        b'+' => (false, 1),
        _ => (false, 0),
    };
    let (value, used) = scan_u64(&bytes[start..])?;
    let value = if negative {
        (value as i64).wrapping_neg()
    } else {
        value as i64
    };
    Some((value, start + used))
}

fn parse_offset(tok: &str) -> Result<(OffsetExpr, u16), String> {
    let bytes = tok.as_bytes();
    let mut rule_flags = 0u16;
    let mut pos = 0;

    if bytes.first() == Some(&b'&') {
        rule_flags |= flags::OFFADD;
        pos += 1;
    }

    if bytes.get(pos) == Some(&b'(') {
        rule_flags |= flags::INDIR;
        pos += 1;

        if bytes.get(pos) == Some(&b'&') {
            rule_flags |= flags::INDIROFFADD;
            pos += 1;
        }

        let (base, used) =
            scan_i64(&bytes[pos..]).ok_or_else(|| format!("bad indirect offset `{}`", tok))?;
        pos += used;

        let mut read = IndirectRead {
            read_type: TypeTag::Long,
            signed: false,
        };
        if matches!(bytes.get(pos), Some(b'.') | Some(b',')) {
            read.signed = bytes[pos] == b',';
            pos += 1;
            let c = *bytes
                .get(pos)
                .ok_or_else(|| format!("truncated indirect type in `{}`", tok))?;
            read.read_type = indirect_read_type(c)
                .ok_or_else(|| format!("bad indirect type `{}` in `{}`", c as char, tok))?;
            pos += 1;
        }

        let mut op = None;
        let mut operand = 0i32;
        let mut operand_indirect = false;
        if let Some(&c) = bytes.get(pos) {
            if let Some(parsed) = Op::from_char(c) {
                op = Some(parsed);
                pos += 1;
                if bytes.get(pos) == Some(&b'(') {
                    operand_indirect = true;
                    pos += 1;
                }
                let (v, used) = scan_i64(&bytes[pos..])
                    .ok_or_else(|| format!("bad indirect operand in `{}`", tok))?;
                operand = v as i32;
                pos += used;
                if operand_indirect {
                    if bytes.get(pos) != Some(&b')') {
                        return Err(format!("unterminated indirect operand in `{}`", tok));
                    }
                    pos += 1;
                }
            }
        }

        if bytes.get(pos) != Some(&b')') {
            return Err(format!("unterminated indirect offset `{}`", tok));
        }
        pos += 1;
        if pos != bytes.len() {
            return Err(format!("trailing bytes after indirect offset `{}`", tok));
        }

        return Ok((
            OffsetExpr {
                base: base as i32,
                indirect: Some(Indirect {
                    read,
                    op,
                    operand_indirect,
                    operand,
                }),
            },
            rule_flags,
        ));
    }

    let explicit_positive = bytes.get(pos) == Some(&b'+');
    let (base, used) =
        scan_i64(&bytes[pos..]).ok_or_else(|| format!("bad offset `{}`", tok))?;
    pos += used;
    if pos != bytes.len() {
        return Err(format!("trailing bytes after offset `{}`", tok));
    }

    if base < 0 && rule_flags & flags::OFFADD == 0 {
        rule_flags |= flags::OFFNEGATIVE;
    } else if explicit_positive {
        rule_flags |= flags::OFFPOSITIVE;
    }

    Ok((
        OffsetExpr {
            base: base as i32,
            indirect: None,
        },
        rule_flags,
    ))
}

/// The pointer-read type letters accepted inside `(offset.X)`.
/// Lowercase letters read little-endian, uppercase big-endian.
fn indirect_read_type(c: u8) -> Option<TypeTag> {
    Some(match c {
        b'b' | b'c' | b'B' | b'C' => TypeTag::Byte,
        b's' | b'h' => TypeTag::LeShort,
        b'S' | b'H' => TypeTag::BeShort,
        b'l' => TypeTag::LeLong,
        b'L' => TypeTag::BeLong,
        b'm' | b'M' => TypeTag::MeLong,
        b'i' => TypeTag::LeId3,
        b'I' => TypeTag::BeId3,
        b'q' | b'o' | b'e' | b'f' | b'g' => TypeTag::LeQuad,
        b'Q' | b'O' | b'E' | b'F' | b'G' => TypeTag::BeQuad,
        _ => return None,
    })
}

struct ParsedType {
    tag: TypeTag,
    unsigned: bool,
    mods: StringMods,
    str_range: u32,
    mask_op: Option<(Op, u64, bool)>,
}

fn parse_type(
    tok: &str,
    diags: &mut Vec<Diagnostic>,
    filename: &str,
    lineno: u32,
) -> Result<ParsedType, String> {
    let bytes = tok.as_bytes();
    let name_end = bytes
        .iter()
        .position(|b| !b.is_ascii_alphanumeric())
        .unwrap_or(bytes.len());
    let name = &tok[..name_end];

    let (tag, unsigned) = match TypeTag::from_name(name) {
        Some(tag) => (tag, false),
        None => match name.strip_prefix('u').and_then(TypeTag::from_name) {
            Some(tag) if !tag.is_string_family() && !tag.is_structural() => (tag, true),
            _ => return Err(format!("unknown type `{}`", name)),
        },
    };

    let mut parsed = ParsedType {
        tag,
        unsigned,
        mods: StringMods::default(),
        str_range: 0,
        mask_op: None,
    };

    let mut rest = &tok[name_end..];

    if tag.is_string_family() {
        while let Some(seg) = rest.strip_prefix('/') {
            let end = seg.find('/').unwrap_or(seg.len());
            parse_string_modifiers(&seg[..end], tag, &mut parsed, diags, filename, lineno)?;
            rest = &seg[end..];
        }
        if !rest.is_empty() {
            return Err(format!("trailing bytes `{}` after type", rest));
        }
        return Ok(parsed);
    }

    if rest.is_empty() {
        return Ok(parsed);
    }

    // Numeric mask: one op and one operand, e.g. `lelong&0x7fffffff`
    let op_char = rest.as_bytes()[0];
    let op = Op::from_char(op_char).ok_or_else(|| format!("bad type modifier `{}`", rest))?;
    rest = &rest[1..];
    let inverse = if let Some(stripped) = rest.strip_prefix('~') {
        rest = stripped;
        true
    } else {
        false
    };
    let (operand, used) =
        scan_i64(rest.as_bytes()).ok_or_else(|| format!("bad mask operand `{}`", rest))?;
    if used != rest.len() {
        return Err(format!("trailing bytes after mask `{}`", rest));
    }
    parsed.mask_op = Some((op, operand as u64, inverse));
    Ok(parsed)
}

fn parse_string_modifiers(
    seg: &str,
    tag: TypeTag,
    parsed: &mut ParsedType,
    diags: &mut Vec<Diagnostic>,
    filename: &str,
    lineno: u32,
) -> Result<(), String> {
    let mut chars = seg.bytes().peekable();
    while let Some(c) = chars.next() {
        match c {
            b'0'..=b'9' => {
                // Search window size or regex line limit
                let mut value = (c - b'0') as u64;
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    value = value * 10 + (d - b'0') as u64;
                    chars.next();
                }
                parsed.str_range = value.min(u32::MAX as u64) as u32;
            }
            b'W' => parsed.mods.compact_ws = true,
            b'w' => parsed.mods.opt_ws = true,
            b'c' => parsed.mods.fold_lower = true,
            b'C' => parsed.mods.fold_upper = true,
            b's' => parsed.mods.start_anchor = true,
            b't' => parsed.mods.force_text = true,
            b'T' => parsed.mods.trim = true,
            b'f' => parsed.mods.full_word = true,
            b'b' if tag != TypeTag::PString => parsed.mods.force_binary = true,
            b'B' if tag == TypeTag::PString => parsed.mods.pstring_len = PStringLen::One,
            b'H' if tag == TypeTag::PString => parsed.mods.pstring_len = PStringLen::TwoBe,
            b'h' if tag == TypeTag::PString => parsed.mods.pstring_len = PStringLen::TwoLe,
            b'L' if tag == TypeTag::PString => parsed.mods.pstring_len = PStringLen::FourBe,
            b'l' if tag == TypeTag::PString => parsed.mods.pstring_len = PStringLen::FourLe,
            b'J' if tag == TypeTag::PString => parsed.mods.pstring_len_includes_self = true,
            other => {
                diags.push(Diagnostic::warning(
                    filename,
                    lineno,
                    format!(
                        "ignoring modifier `{}` on type `{}`",
                        other as char,
                        tag.name()
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn parse_test(parsed: &ParsedType, test: &str) -> Result<(Relation, Value), String> {
    let tag = parsed.tag;

    // Structural types carry an identifier or nothing at all
    match tag {
        TypeTag::Name | TypeTag::Use => {
            let decoded = escape::decode(test);
            if decoded.bytes.is_empty() {
                return Err(format!("`{}` needs an identifier", tag.name()));
            }
            if decoded.bytes.len() > MAX_VALUE_LEN {
                return Err(format!("`{}` identifier too long", tag.name()));
            }
            return Ok((Relation::Equal, Value::Bytes(decoded.bytes)));
        }
        TypeTag::Default | TypeTag::Clear | TypeTag::Indirect => {
            return Ok((Relation::Any, Value::None));
        }
        TypeTag::Der => {
            if test == "x" {
                return Ok((Relation::Any, Value::Der { tag_hint: None }));
            }
            return Ok((
                Relation::Equal,
                Value::Der {
                    tag_hint: Some(test.to_string()),
                },
            ));
        }
        _ => {}
    }

    let bytes = test.as_bytes();

    if test == "x" {
        return Ok((Relation::Any, Value::None));
    }

    let relation_chars: &[u8] = if tag.is_string_family() {
        b"=<>!"
    } else {
        b"=!<>&^~"
    };

    let (reln, rest) = match bytes.first() {
        Some(&c) if relation_chars.contains(&c) => {
            let reln = Relation::from_char(c).unwrap();
            let mut rest = &test[1..];
            // Two-character spellings: `==`, `>=`, `<=`, `!=`
            if matches!(c, b'=' | b'>' | b'<' | b'!') && rest.as_bytes().first() == Some(&b'=') {
                rest = &rest[1..];
            }
            (reln, rest)
        }
        _ => (Relation::Equal, test),
    };
    if rest.is_empty() && !tag.is_string_family() {
        return Err(format!("relation `{}` without a value", reln.as_char() as char));
    }

    let value = match tag {
        TypeTag::Guid => {
            let guid =
                parse_guid(rest).ok_or_else(|| format!("bad guid value `{}`", rest))?;
            Value::Guid(guid)
        }
        t if t.is_float_family() => {
            let v: f64 = rest
                .parse()
                .map_err(|_| format!("bad float value `{}`", rest))?;
            Value::Float(v)
        }
        TypeTag::Regex => {
            if rest.len() > MAX_VALUE_LEN {
                return Err("regex pattern too long".to_string());
            }
            let fold = parsed.mods.fold_lower || parsed.mods.fold_upper;
            let compiled = RegexBuilder::new(rest)
                .unicode(false)
                .multi_line(true)
                .case_insensitive(fold)
                .build()
                .map_err(|e| format!("bad regex `{}`: {}", rest, e))?;
            Value::Regex {
                pattern: rest.as_bytes().to_vec(),
                compiled,
            }
        }
        t if t.is_string_family() => {
            // Octal included: its value is the literal digit string
            let decoded = escape::decode(rest);
            if decoded.bytes.len() > MAX_VALUE_LEN {
                return Err(format!(
                    "string value longer than {} bytes",
                    MAX_VALUE_LEN
                ));
            }
            Value::Bytes(decoded.bytes)
        }
        TypeTag::BeVarint | TypeTag::LeVarint => {
            let (v, used) = scan_i64(rest.as_bytes())
                .ok_or_else(|| format!("bad numeric value `{}`", rest))?;
            if used != rest.len() {
                return Err(format!("trailing bytes in value `{}`", rest));
            }
            Value::Numeric {
                bits: v as u64,
                width: 8,
            }
        }
        _ => {
            let width = tag.width().unwrap_or(8) as u8;
            let (v, used) = scan_i64(rest.as_bytes())
                .ok_or_else(|| format!("bad numeric value `{}`", rest))?;
            if used != rest.len() {
                return Err(format!("trailing bytes in value `{}`", rest));
            }
            Value::Numeric {
                bits: crate::endian::truncate(v as u64, width as usize),
                width,
            }
        }
    };

    Ok((reln, value))
}
