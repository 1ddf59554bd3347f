//! Safe printf-style description rendering
//!
//! A rule's description is a printf template. Instead of handing the format
//! string to anything printf-like, the template is pre-parsed into literal
//! and directive tokens when the rule is loaded; at match time each
//! directive is checked against the type of the matched value and a
//! mismatch renders the directive text literally. Bad templates can never
//! crash an identification.
//!
//! Width and precision are clamped so a hostile database cannot balloon the
//! output.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::fmt::Write;

/// Largest honored field width and precision
const MAX_PAD: usize = 1024;

/// What a date value means, for `%s` rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateKind {
    /// Seconds since the Unix epoch (date/ldate/qdate families)
    Unix,
    /// 16-bit MS-DOS packed date
    DosDate,
    /// 16-bit MS-DOS packed time
    DosTime,
    /// Windows FILETIME, 100ns ticks since 1601 (qwdate family)
    Windows,
}

/// The single typed argument a directive may consume
#[derive(Debug, Clone, PartialEq)]
pub enum Arg<'a> {
    /// Integer subject
    Int {
        /// Value bits, sign-extended when `signed`
        value: u64,
        /// Render `%d` as signed
        signed: bool,
    },
    /// Float subject
    Float(f64),
    /// String subject (matched bytes)
    Bytes(&'a [u8]),
    /// Pre-rendered string subject (guid, der tag names)
    Str(String),
    /// Date subject; numeric conversions see the raw value
    Date {
        /// Raw value as read from the buffer
        raw: u64,
        /// How `%s` formats it
        kind: DateKind,
    },
    /// No subject (`default`, `clear`, `use`)
    None,
}

/// One parsed template token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Verbatim text
    Literal(String),
    /// A format directive
    Directive(Directive),
}

/// A parsed `%` directive
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Directive {
    /// The directive source text, emitted on argument mismatch
    pub raw: String,
    /// `-`: left justify
    pub left: bool,
    /// `0`: pad with zeros
    pub zero: bool,
    /// `+`: always print a sign
    pub plus: bool,
    /// ` `: space before positive numbers
    pub space: bool,
    /// `#`: alternate form (`0x`, `0`)
    pub alt: bool,
    /// Minimum field width
    pub width: Option<usize>,
    /// Precision
    pub precision: Option<usize>,
    /// Conversion character
    pub conv: char,
}

/// A pre-parsed description template
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Template {
    tokens: Vec<Token>,
}

impl Template {
    /// Parse a description into tokens. Parsing never fails; a malformed
    /// directive becomes a literal token.
    pub fn parse(desc: &str) -> Template {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let bytes = desc.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'%' {
                literal.push(bytes[i] as char);
                i += 1;
                continue;
            }
            if i + 1 < bytes.len() && bytes[i + 1] == b'%' {
                literal.push('%');
                i += 2;
                continue;
            }

            match parse_directive(&desc[i..]) {
                Some((dir, used)) => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Directive(dir));
                    i += used;
                }
                None => {
                    // No conversion character; keep the `%` literally
                    literal.push('%');
                    i += 1;
                }
            }
        }

        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Template { tokens }
    }

    /// True when the template contains at least one directive
    pub fn has_directives(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| matches!(t, Token::Directive(_)))
    }

    /// Render the template. Every directive consumes the same subject
    /// argument; a type mismatch emits the directive text instead.
    pub fn render(&self, arg: &Arg) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Directive(dir) => match render_directive(dir, arg) {
                    Some(s) => out.push_str(&s),
                    None => out.push_str(&dir.raw),
                },
            }
        }
        out
    }
}

/// Parse one directive starting at the `%`. Returns the directive and the
/// number of bytes consumed.
fn parse_directive(src: &str) -> Option<(Directive, usize)> {
    let bytes = src.as_bytes();
    debug_assert_eq!(bytes[0], b'%');
    let mut i = 1;
    let mut dir = Directive::default();

    while i < bytes.len() {
        match bytes[i] {
            b'-' => dir.left = true,
            b'0' => dir.zero = true,
            b'+' => dir.plus = true,
            b' ' => dir.space = true,
            b'#' => dir.alt = true,
            _ => break,
        }
        i += 1;
    }

    let mut width: Option<usize> = None;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        width = Some(width.unwrap_or(0) * 10 + (bytes[i] - b'0') as usize);
        if width > Some(MAX_PAD * 10) {
            return None;
        }
        i += 1;
    }
    dir.width = width;

    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        let mut prec = 0usize;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            prec = prec * 10 + (bytes[i] - b'0') as usize;
            if prec > MAX_PAD * 10 {
                return None;
            }
            i += 1;
        }
        dir.precision = Some(prec);
    }

    // Length modifiers are accepted and ignored; the argument is already
    // the right width
    while i < bytes.len() && matches!(bytes[i], b'h' | b'l' | b'q' | b'j' | b'z' | b't') {
        i += 1;
    }

    if i >= bytes.len() {
        return None;
    }
    let conv = bytes[i] as char;
    if !matches!(
        conv,
        'd' | 'i' | 'u' | 'x' | 'X' | 'o' | 'c' | 's' | 'e' | 'E' | 'f' | 'F' | 'g' | 'G'
    ) {
        return None;
    }
    i += 1;

    dir.conv = conv;
    dir.raw = src[..i].to_string();
    Some((dir, i))
}

fn render_directive(dir: &Directive, arg: &Arg) -> Option<String> {
    match (dir.conv, arg) {
        ('d' | 'i' | 'u' | 'x' | 'X' | 'o' | 'c', Arg::Int { value, signed }) => {
            Some(render_int(dir, *value, *signed))
        }
        ('d' | 'i' | 'u' | 'x' | 'X' | 'o', Arg::Date { raw, .. }) => {
            Some(render_int(dir, *raw, false))
        }
        ('e' | 'E' | 'f' | 'F' | 'g' | 'G', Arg::Float(v)) => Some(render_float(dir, *v)),
        ('s', Arg::Bytes(b)) => Some(render_str(dir, &String::from_utf8_lossy(b))),
        ('s', Arg::Str(s)) => Some(render_str(dir, s)),
        ('s', Arg::Date { raw, kind }) => Some(render_str(dir, &format_date(*raw, *kind))),
        ('c', Arg::Bytes(b)) => {
            let c = *b.first()? as char;
            Some(render_str(dir, &c.to_string()))
        }
        _ => None,
    }
}

fn render_int(dir: &Directive, value: u64, signed: bool) -> String {
    if dir.conv == 'c' {
        return render_str(dir, &((value as u8) as char).to_string());
    }

    let negative = signed && matches!(dir.conv, 'd' | 'i') && (value as i64) < 0;
    let magnitude = if negative {
        (value as i64).unsigned_abs()
    } else {
        value
    };

    let mut digits = match dir.conv {
        'x' => format!("{:x}", magnitude),
        'X' => format!("{:X}", magnitude),
        'o' => format!("{:o}", magnitude),
        _ => format!("{}", magnitude),
    };

    if let Some(prec) = dir.precision {
        let prec = prec.min(MAX_PAD);
        while digits.len() < prec {
            digits.insert(0, '0');
        }
    }

    let mut prefix = String::new();
    if negative {
        prefix.push('-');
    } else if matches!(dir.conv, 'd' | 'i') {
        if dir.plus {
            prefix.push('+');
        } else if dir.space {
            prefix.push(' ');
        }
    }
    if dir.alt && magnitude != 0 {
        match dir.conv {
            'x' => prefix.push_str("0x"),
            'X' => prefix.push_str("0X"),
            'o' => prefix.push('0'),
            _ => {}
        }
    }

    pad_number(dir, prefix, digits)
}

fn render_float(dir: &Directive, value: f64) -> String {
    let prec = dir.precision.unwrap_or(6).min(MAX_PAD);
    let body = match dir.conv {
        'e' => format!("{:.*e}", prec, value),
        'E' => format!("{:.*E}", prec, value),
        'g' | 'G' => {
            // %g trims trailing zeros and picks the shorter notation
            let s = format!("{}", value);
            if dir.conv == 'G' {
                s.to_uppercase()
            } else {
                s
            }
        }
        _ => format!("{:.*}", prec, value),
    };
    let (prefix, digits) = if let Some(stripped) = body.strip_prefix('-') {
        ("-".to_string(), stripped.to_string())
    } else if dir.plus {
        ("+".to_string(), body)
    } else if dir.space {
        (" ".to_string(), body)
    } else {
        (String::new(), body)
    };
    pad_number(dir, prefix, digits)
}

fn render_str(dir: &Directive, s: &str) -> String {
    let mut s = s.to_string();
    if let Some(prec) = dir.precision {
        let prec = prec.min(MAX_PAD);
        if s.len() > prec {
            let mut cut = prec;
            while cut > 0 && !s.is_char_boundary(cut) {
                cut -= 1;
            }
            s.truncate(cut);
        }
    }
    let width = dir.width.unwrap_or(0).min(MAX_PAD);
    if s.len() >= width {
        return s;
    }
    let pad = " ".repeat(width - s.len());
    if dir.left {
        s.push_str(&pad);
        s
    } else {
        format!("{}{}", pad, s)
    }
}

fn pad_number(dir: &Directive, prefix: String, digits: String) -> String {
    let width = dir.width.unwrap_or(0).min(MAX_PAD);
    let len = prefix.len() + digits.len();
    if len >= width {
        return format!("{}{}", prefix, digits);
    }
    let pad = width - len;
    if dir.left {
        let mut out = format!("{}{}", prefix, digits);
        out.push_str(&" ".repeat(pad));
        out
    } else if dir.zero && dir.precision.is_none() {
        // Zero padding goes between the sign and the digits
        format!("{}{}{}", prefix, "0".repeat(pad), digits)
    } else {
        format!("{}{}{}", " ".repeat(pad), prefix, digits)
    }
}

/// Format a date subject for `%s`.
pub fn format_date(raw: u64, kind: DateKind) -> String {
    match kind {
        DateKind::Unix => match DateTime::<Utc>::from_timestamp(raw as i64, 0) {
            Some(dt) => dt.format("%a %b %e %H:%M:%S %Y").to_string(),
            None => raw.to_string(),
        },
        DateKind::Windows => {
            // 100ns ticks since 1601-01-01, 11644473600 seconds before the
            // Unix epoch
            let secs = (raw / 10_000_000) as i64 - 11_644_473_600;
            match DateTime::<Utc>::from_timestamp(secs, 0) {
                Some(dt) => dt.format("%a %b %e %H:%M:%S %Y").to_string(),
                None => raw.to_string(),
            }
        }
        DateKind::DosDate => {
            let year = 1980 + ((raw >> 9) & 0x7f) as i32;
            let month = ((raw >> 5) & 0x0f) as u32;
            let day = (raw & 0x1f) as u32;
            match NaiveDate::from_ymd_opt(year, month, day) {
                Some(d) => {
                    let mut s = String::new();
                    let _ = write!(s, "{}", d.format("%Y-%m-%d"));
                    s
                }
                None => raw.to_string(),
            }
        }
        DateKind::DosTime => {
            let hour = ((raw >> 11) & 0x1f) as u32;
            let min = ((raw >> 5) & 0x3f) as u32;
            let sec = ((raw & 0x1f) * 2) as u32;
            match NaiveTime::from_hms_opt(hour, min, sec) {
                Some(t) => {
                    let mut s = String::new();
                    let _ = write!(s, "{}", t.format("%H:%M:%S"));
                    s
                }
                None => raw.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Arg<'static> {
        Arg::Int {
            value: v as u64,
            signed: true,
        }
    }

    #[test]
    fn test_plain_literal() {
        let t = Template::parse("PNG image data");
        assert!(!t.has_directives());
        assert_eq!(t.render(&Arg::None), "PNG image data");
    }

    #[test]
    fn test_percent_escape() {
        let t = Template::parse("100%% pure");
        assert_eq!(t.render(&Arg::None), "100% pure");
    }

    #[test]
    fn test_decimal() {
        let t = Template::parse("entry %d");
        assert_eq!(t.render(&int(7)), "entry 7");
        assert_eq!(t.render(&int(-3)), "entry -3");
    }

    #[test]
    fn test_unsigned_and_hex() {
        let t = Template::parse("%u/%x/%X/%o");
        let arg = Arg::Int {
            value: 255,
            signed: false,
        };
        assert_eq!(t.render(&arg), "255/ff/FF/377");
    }

    #[test]
    fn test_width_and_zero_pad() {
        assert_eq!(Template::parse("%5d").render(&int(42)), "   42");
        assert_eq!(Template::parse("%-5d|").render(&int(42)), "42   |");
        assert_eq!(Template::parse("%05d").render(&int(-42)), "-0042");
        assert_eq!(Template::parse("%#x").render(&int(255)), "0xff");
    }

    #[test]
    fn test_precision_int() {
        assert_eq!(Template::parse("%.4d").render(&int(42)), "0042");
    }

    #[test]
    fn test_length_modifiers_ignored() {
        assert_eq!(Template::parse("%lld").render(&int(9)), "9");
        assert_eq!(Template::parse("%hu").render(&int(9)), "9");
    }

    #[test]
    fn test_string() {
        let t = Template::parse("version %s");
        assert_eq!(t.render(&Arg::Bytes(b"1.2")), "version 1.2");
        assert_eq!(
            Template::parse("%.3s").render(&Arg::Bytes(b"abcdef")),
            "abc"
        );
        assert_eq!(Template::parse("%6s").render(&Arg::Str("ab".into())), "    ab");
    }

    #[test]
    fn test_char() {
        let t = Template::parse("%c");
        assert_eq!(
            t.render(&Arg::Int {
                value: b'Z' as u64,
                signed: false
            }),
            "Z"
        );
    }

    #[test]
    fn test_float() {
        assert_eq!(Template::parse("%f").render(&Arg::Float(1.5)), "1.500000");
        assert_eq!(Template::parse("%.2f").render(&Arg::Float(1.567)), "1.57");
        assert_eq!(Template::parse("%g").render(&Arg::Float(1.5)), "1.5");
    }

    #[test]
    fn test_mismatch_emits_literal() {
        // %s on an integer subject renders the directive text
        let t = Template::parse("name %s");
        assert_eq!(t.render(&int(5)), "name %s");
        // %d on a string subject likewise
        let t = Template::parse("count %d");
        assert_eq!(t.render(&Arg::Bytes(b"x")), "count %d");
    }

    #[test]
    fn test_bad_directive_is_literal() {
        let t = Template::parse("100% sure");
        assert_eq!(t.render(&Arg::None), "100% sure");
        let t = Template::parse("trailing %");
        assert_eq!(t.render(&Arg::None), "trailing %");
    }

    #[test]
    fn test_date_unix() {
        // 2001-09-09 01:46:40 UTC
        let s = format_date(1_000_000_000, DateKind::Unix);
        assert!(s.contains("2001"), "{}", s);
        let t = Template::parse("modified %s");
        let arg = Arg::Date {
            raw: 1_000_000_000,
            kind: DateKind::Unix,
        };
        assert!(t.render(&arg).starts_with("modified "));
    }

    #[test]
    fn test_date_numeric_conversion() {
        let t = Template::parse("raw %d");
        let arg = Arg::Date {
            raw: 1234,
            kind: DateKind::Unix,
        };
        assert_eq!(t.render(&arg), "raw 1234");
    }

    #[test]
    fn test_dos_date_time() {
        // 2024-05-12: ((2024-1980) << 9) | (5 << 5) | 12
        let raw = ((44u64) << 9) | (5 << 5) | 12;
        assert_eq!(format_date(raw, DateKind::DosDate), "2024-05-12");
        // 13:30:10 -> (13 << 11) | (30 << 5) | 5
        let raw = (13u64 << 11) | (30 << 5) | 5;
        assert_eq!(format_date(raw, DateKind::DosTime), "13:30:10");
    }

    #[test]
    fn test_windows_filetime() {
        // Unix epoch expressed as FILETIME
        let raw = 11_644_473_600u64 * 10_000_000;
        let s = format_date(raw, DateKind::Windows);
        assert!(s.contains("1970"), "{}", s);
    }
}
