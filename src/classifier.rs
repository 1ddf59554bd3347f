//! Binary/text classification and set bookkeeping
//!
//! Identification runs in two phases over set 0: binary-flavored rules
//! first, then text-flavored ones. Each rule gets a BINTEST or TEXTTEST
//! flag from its type and modifiers; structural rules inherit the flag
//! from the nearest determinate ancestor.
//!
//! Named rules are indexed here so `use` references resolve in constant
//! time, and every unresolved reference is reported once at load.

use crate::error::Diagnostic;
use crate::rule::{flags, RuleSet, TypeTag};
use crate::value::Value;

/// True when value bytes pass as text: valid UTF-8 with no control byte
/// below 0x20 other than tab, newline, carriage return, and form feed.
pub(crate) fn looks_text(bytes: &[u8]) -> bool {
    if std::str::from_utf8(bytes).is_err() {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b >= 0x20 || matches!(b, b'\t' | b'\n' | b'\r' | 0x0c))
}

/// The phase flag a rule's own type demands, `None` for structural types
/// that inherit from an ancestor.
fn own_test_flag(set: &RuleSet, id: usize) -> Option<u16> {
    let rule = &set.rules[id];
    use TypeTag::*;
    match rule.typ {
        String | PString | BeString16 | LeString16 => {
            if rule.mods.force_text || rule.mods.trim {
                Some(flags::TEXTTEST)
            } else {
                Some(flags::BINTEST)
            }
        }
        Regex | Search => {
            if rule.mods.force_binary {
                Some(flags::BINTEST)
            } else if rule.mods.force_text || rule.mods.trim {
                Some(flags::TEXTTEST)
            } else {
                let text = match &rule.value {
                    Value::Bytes(b) => looks_text(b),
                    Value::Regex { pattern, .. } => looks_text(pattern),
                    _ => false,
                };
                Some(if text {
                    flags::TEXTTEST
                } else {
                    flags::BINTEST
                })
            }
        }
        Name | Use | Clear | Default | Indirect => None,
        // Numeric, date, float, guid, der, offset, varint, octal
        _ => Some(flags::BINTEST),
    }
}

fn classify_subtree(set: &mut RuleSet, id: usize, inherited: u16) {
    let flag = own_test_flag(set, id).unwrap_or(inherited);
    set.rules[id].flags |= flag;
    let children = set.rules[id].children.clone();
    for child in children {
        classify_subtree(set, child, flag);
    }
}

/// Assign BINTEST/TEXTTEST through both sets.
pub(crate) fn classify(set: &mut RuleSet) {
    for s in 0..set.sets.len() {
        let roots = set.sets[s].clone();
        for root in roots {
            // Roots with no determinate type default to the binary phase
            classify_subtree(set, root, flags::BINTEST);
        }
    }
}

/// Register `name` roots and verify every `use` resolves.
pub(crate) fn index_names(set: &mut RuleSet, diags: &mut Vec<Diagnostic>) {
    set.name_index.clear();

    for s in 0..set.sets.len() {
        for i in 0..set.sets[s].len() {
            let id = set.sets[s][i];
            if set.rules[id].typ != TypeTag::Name {
                continue;
            }
            let name = match &set.rules[id].value {
                Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                _ => continue,
            };
            if let Some(&prior) = set.name_index.get(&name) {
                let line = set.rules[id].line;
                let file = set.file_of(&set.rules[id]).to_string();
                let prior_line = set.rules[prior].line;
                diags.push(Diagnostic::warning(
                    &file,
                    line,
                    format!("`name {}` already defined at line {}", name, prior_line),
                ));
                continue;
            }
            set.name_index.insert(name, id);
        }
    }

    // Every `use` must point at a known name; a broken reference is kept
    // in the set but can never match
    for id in 0..set.rules.len() {
        if set.rules[id].typ != TypeTag::Use {
            continue;
        }
        let target = match &set.rules[id].value {
            Value::Bytes(b) => {
                let s = String::from_utf8_lossy(b);
                s.strip_prefix('^').unwrap_or(&s).to_string()
            }
            _ => continue,
        };
        if set.name_index.get(&target).is_none() {
            let line = set.rules[id].line;
            let file = set.file_of(&set.rules[id]).to_string();
            diags.push(Diagnostic::error(
                &file,
                line,
                format!("`use {}` has no matching `name` rule", target),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn load(text: &str) -> (RuleSet, Vec<Diagnostic>) {
        let mut set = RuleSet::default();
        let mut diags = Vec::new();
        parser::parse_into(&mut set, text, "test", &mut diags);
        classify(&mut set);
        index_names(&mut set, &mut diags);
        (set, diags)
    }

    fn root_flags(text: &str) -> u16 {
        let (set, _) = load(text);
        set.rule(set.sets[0][0]).flags
    }

    #[test]
    fn test_looks_text() {
        assert!(looks_text(b"BEGIN plain text"));
        assert!(looks_text(b"line\none\r\n\ttabbed"));
        assert!(!looks_text(&[0x00, b'a']));
        assert!(!looks_text(&[0x1b, b'[']));
        assert!(!looks_text(&[0xff, 0xfe]));
    }

    #[test]
    fn test_numeric_is_binary() {
        assert!(root_flags("0 belong 1 n") & flags::BINTEST != 0);
        assert!(root_flags("0 guid 3F2504E0-4F89-11D3-9A0C-0305E82C3301 g") & flags::BINTEST != 0);
        assert!(root_flags("0 octal 123 o") & flags::BINTEST != 0);
    }

    #[test]
    fn test_string_default_binary_t_forces_text() {
        assert!(root_flags("0 string abc s") & flags::BINTEST != 0);
        assert!(root_flags("0 string/t abc s") & flags::TEXTTEST != 0);
        assert!(root_flags("0 string/T abc s") & flags::TEXTTEST != 0);
    }

    #[test]
    fn test_search_classified_by_content() {
        assert!(root_flags("0 search/64 BEGIN s") & flags::TEXTTEST != 0);
        assert!(root_flags(r"0 search/64 \x00\x01 s") & flags::BINTEST != 0);
        assert!(root_flags("0 search/64/b BEGIN s") & flags::BINTEST != 0);
    }

    #[test]
    fn test_regex_classified_by_pattern() {
        assert!(root_flags("0 regex ^#!/bin/sh s") & flags::TEXTTEST != 0);
        assert!(root_flags("0 regex/b ^#!/bin/sh s") & flags::BINTEST != 0);
    }

    #[test]
    fn test_structural_inherits() {
        let (set, _) = load(
            "0 string/t ABC text root\n\
             >3 default x fallback\n",
        );
        let root = set.rule(set.sets[0][0]);
        let child = set.rule(root.children[0]);
        assert!(child.flags & flags::TEXTTEST != 0);

        // Root with no determinate ancestor falls back to binary
        let (set, _) = load("0 name helper x\n");
        assert!(set.rule(set.sets[0][0]).flags & flags::BINTEST != 0);
    }

    #[test]
    fn test_name_index_and_use_check() {
        let (set, diags) = load(
            "0 name zip-walk x\n\
             0 use zip-walk x\n\
             0 use \\^zip-walk x\n\
             0 use missing x\n",
        );
        assert!(set.named("zip-walk").is_some());
        assert!(set.named("missing").is_none());
        // Only the dangling reference is reported
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("missing"));
    }

    #[test]
    fn test_duplicate_name_warns() {
        let (set, diags) = load(
            "0 name walk x\n\
             0 name walk x\n",
        );
        assert_eq!(diags.len(), 1);
        assert!(set.named("walk").is_some());
    }
}
