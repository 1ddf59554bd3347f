//! Rule strength computation and set ordering
//!
//! Every rule gets a precomputed priority so more-specific tests run
//! first. The figure starts from a base, adds a per-type weight, adjusts
//! for the relation, and finally applies any manual `!:strength`
//! directive. Root sets are then sorted by descending strength with source
//! position breaking ties.

use crate::error::Diagnostic;
use crate::rule::{Relation, RuleSet, TypeTag};
use crate::value::Value;
use rustc_hash::FxHashMap;

/// Weight unit
const MULT: u32 = 10;
/// Every rule starts here
const BASE: u32 = 2 * MULT;

/// Compute the strength of every rule in the arena.
pub(crate) fn compute_all(set: &mut RuleSet) {
    for i in 0..set.rules.len() {
        let strength = compute_one(set, i);
        set.rules[i].strength = strength;
    }
}

fn compute_one(set: &RuleSet, id: usize) -> u32 {
    let rule = &set.rules[id];

    // `default` always sorts last no matter what
    if rule.typ == TypeTag::Default {
        return 0;
    }

    let mut val = BASE;

    use TypeTag::*;
    match rule.typ {
        Byte => val += MULT,
        Short | BeShort | LeShort | MsDosDate | LeMsDosDate | BeMsDosDate | MsDosTime
        | LeMsDosTime | BeMsDosTime => val += 2 * MULT,
        Long | BeLong | LeLong | MeLong | Date | BeDate | LeDate | MeDate | LDate | BeLDate
        | LeLDate | MeLDate | Float | BeFloat | LeFloat | BeId3 | LeId3 => val += 4 * MULT,
        Quad | BeQuad | LeQuad | QDate | BeQDate | LeQDate | QLDate | BeQLDate | LeQLDate
        | QwDate | BeQwDate | LeQwDate | Double | BeDouble | LeDouble | Offset | BeVarint
        | LeVarint => val += 8 * MULT,
        String | PString | Octal => val += vallen(rule) * MULT,
        BeString16 | LeString16 => val += vallen(rule) * MULT / 2,
        Search => {
            let n = vallen(rule).max(1);
            val += n * (MULT / n).max(1);
        }
        Regex => {
            let n = regex_nonmagic(match &rule.value {
                Value::Regex { pattern, .. } => pattern,
                _ => &[],
            });
            val += n * (MULT / n).max(1);
        }
        Guid => val += 16 * MULT,
        Der => val += MULT,
        Indirect | Name | Use | Clear => {}
        Default | Invalid => {}
    }

    match rule.reln {
        Relation::Equal => val += MULT,
        Relation::Greater | Relation::Less => val = val.saturating_sub(2 * MULT),
        Relation::BitAllSet | Relation::BitSomeClear | Relation::BitNot => {
            val = val.saturating_sub(MULT)
        }
        Relation::Any | Relation::NotEqual => val = 0,
    }

    // A manual `!:strength` can lift even an `x`/`!` rule back up; only
    // `default` is pinned at 0, by the early return above
    if let Some((op, factor)) = rule.factor_op {
        let f = factor as u32;
        val = match op {
            b'+' => val.saturating_add(f),
            b'-' => val.saturating_sub(f),
            b'*' => val.saturating_mul(f),
            b'/' => {
                if f == 0 {
                    val
                } else {
                    val / f
                }
            }
            // Bare value: absolute set
            _ => f,
        };
    }

    val.max(1)
}

fn vallen(rule: &crate::rule::Rule) -> u32 {
    match &rule.value {
        Value::Bytes(b) => b.len() as u32,
        _ => 0,
    }
}

/// Count the non-metacharacters of a regex pattern. Escaped characters
/// always count, bracket and brace groups count as nothing, and the
/// result is at least 1.
fn regex_nonmagic(pattern: &[u8]) -> u32 {
    let mut count = 0u32;
    let mut i = 0;
    while i < pattern.len() {
        match pattern[i] {
            b'\\' => {
                i += 1;
                if i < pattern.len() {
                    count += 1;
                    i += 1;
                }
            }
            b'?' | b'*' | b'.' | b'+' | b'^' | b'$' => i += 1,
            b'[' => {
                while i < pattern.len() && pattern[i] != b']' {
                    i += 1;
                }
                i += 1;
            }
            b'{' => {
                while i < pattern.len() && pattern[i] != b'}' {
                    i += 1;
                }
                i += 1;
            }
            _ => {
                count += 1;
                i += 1;
            }
        }
    }
    count.max(1)
}

/// Order each root set by descending strength; ties keep source order
/// (file, then line).
pub(crate) fn sort_sets(set: &mut RuleSet) {
    for s in 0..set.sets.len() {
        let mut roots = std::mem::take(&mut set.sets[s]);
        roots.sort_by(|&a, &b| {
            let ra = &set.rules[a];
            let rb = &set.rules[b];
            rb.strength
                .cmp(&ra.strength)
                .then(ra.file_index.cmp(&rb.file_index))
                .then(ra.line.cmp(&rb.line))
        });
        set.sets[s] = roots;
    }
}

/// Warn about rules with identical type, offset, relation, value, and
/// description. `der` probes legitimately repeat, so they are exempt.
pub(crate) fn warn_duplicates(set: &RuleSet, diags: &mut Vec<Diagnostic>) {
    let mut seen: FxHashMap<(u8, i32, u8, Vec<u8>, String), usize> = FxHashMap::default();
    for s in 0..set.sets.len() {
        for &id in &set.sets[s] {
            let rule = &set.rules[id];
            if rule.typ == TypeTag::Der {
                continue;
            }
            let key = rule.dedup_key();
            match seen.get(&key) {
                Some(&first) => {
                    let original = &set.rules[first];
                    diags.push(Diagnostic::warning(
                        set.file_of(rule),
                        rule.line,
                        format!(
                            "duplicate of {}:{}: `{}`",
                            set.file_of(original),
                            original.line,
                            rule.desc
                        ),
                    ));
                }
                None => {
                    seen.insert(key, id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Diagnostic;
    use crate::parser;

    fn load(text: &str) -> RuleSet {
        let mut set = RuleSet::default();
        let mut diags = Vec::new();
        parser::parse_into(&mut set, text, "test", &mut diags);
        compute_all(&mut set);
        sort_sets(&mut set);
        set
    }

    fn strength_of(text: &str) -> u32 {
        let set = load(text);
        set.rule(set.sets[0][0]).strength
    }

    #[test]
    fn test_type_weights() {
        // base 20 + weight + 10 for `=`
        assert_eq!(strength_of("0 byte 1 b"), 20 + 10 + 10);
        assert_eq!(strength_of("0 beshort 1 s"), 20 + 20 + 10);
        assert_eq!(strength_of("0 lelong 1 l"), 20 + 40 + 10);
        assert_eq!(strength_of("0 bequad 1 q"), 20 + 80 + 10);
        assert_eq!(strength_of("0 double 1.0 d"), 20 + 80 + 10);
        assert_eq!(strength_of("0 guid 3F2504E0-4F89-11D3-9A0C-0305E82C3301 g"), 20 + 160 + 10);
        assert_eq!(strength_of("0 der seq d"), 20 + 10 + 10);
        // An `x`-relation der probe drops to the clamp floor
        assert_eq!(strength_of("0 der x d"), 1);
    }

    #[test]
    fn test_string_weight_scales_with_length() {
        assert_eq!(strength_of("0 string abcd s"), 20 + 4 * 10 + 10);
        assert_eq!(strength_of("0 bestring16 abcd s"), 20 + 4 * 10 / 2 + 10);
    }

    #[test]
    fn test_search_weight() {
        // 4-byte needle: 4 * max(10/4, 1) = 8
        assert_eq!(strength_of("0 search/64 abcd s"), 20 + 8 + 10);
        // 20-byte needle: 20 * max(10/20 -> 1) = 20
        assert_eq!(
            strength_of("0 search/64 abcdefghijklmnopqrst s"),
            20 + 20 + 10
        );
    }

    #[test]
    fn test_regex_nonmagic() {
        assert_eq!(regex_nonmagic(b"abc"), 3);
        assert_eq!(regex_nonmagic(b"a.c*"), 2);
        assert_eq!(regex_nonmagic(b"\\.\\*"), 2);
        assert_eq!(regex_nonmagic(b"[abc]x"), 1);
        assert_eq!(regex_nonmagic(b"a{1,3}b"), 2);
        assert_eq!(regex_nonmagic(b"^$"), 1);
    }

    #[test]
    fn test_relation_adjustments() {
        assert_eq!(strength_of("0 byte >1 gt"), 20 + 10 - 20);
        assert_eq!(strength_of("0 byte &1 and"), 20 + 10 - 10);
        // `x` and `!` zero out at the relation step, then clamp to 1
        assert_eq!(strength_of("0 byte x any"), 1);
        assert_eq!(strength_of("0 byte !1 ne"), 1);
    }

    #[test]
    fn test_any_relation_honors_manual_strength() {
        // The relation step zeroes `x`/`!`, but a manual directive still
        // applies afterwards
        assert_eq!(strength_of("0 byte x any\n!:strength 50\n"), 50);
        assert_eq!(strength_of("0 byte x any\n!:strength +5\n"), 5);
        assert_eq!(strength_of("0 byte !1 ne\n!:strength *7\n"), 1);
        assert_eq!(strength_of("0 lelong x raw\n!:strength 200\n"), 200);
    }

    #[test]
    fn test_default_is_zero() {
        assert_eq!(strength_of("0 default x other"), 0);
        // Even a manual boost leaves `default` at 0
        assert_eq!(strength_of("0 default x other\n!:strength +50\n"), 0);
    }

    #[test]
    fn test_factor_ops() {
        assert_eq!(strength_of("0 byte 1 b\n!:strength +5\n"), 45);
        assert_eq!(strength_of("0 byte 1 b\n!:strength -5\n"), 35);
        assert_eq!(strength_of("0 byte 1 b\n!:strength *2\n"), 80);
        assert_eq!(strength_of("0 byte 1 b\n!:strength /4\n"), 10);
        // Bare value sets absolutely
        assert_eq!(strength_of("0 byte 1 b\n!:strength 3\n"), 3);
    }

    #[test]
    fn test_clamp_to_one() {
        // 20 + 10 - 20 = 10, then -200 saturates, then clamps to 1
        assert_eq!(strength_of("0 byte >1 b\n!:strength -200\n"), 1);
    }

    #[test]
    fn test_sort_descending_with_stable_ties() {
        let set = load(
            "0 byte 1 weak\n\
             0 lelong 1 strong\n\
             0 byte 2 weak-two\n",
        );
        let strengths: Vec<u32> = set.sets[0]
            .iter()
            .map(|&id| set.rule(id).strength)
            .collect();
        assert_eq!(strengths, vec![70, 40, 40]);
        // The two byte rules keep their source order
        assert_eq!(set.rule(set.sets[0][1]).desc, "weak");
        assert_eq!(set.rule(set.sets[0][2]).desc, "weak-two");
    }

    #[test]
    fn test_duplicate_warning() {
        let set = load(
            "0 byte 1 same\n\
             0 byte 1 same\n\
             0 der x probe\n\
             0 der x probe\n",
        );
        let mut diags: Vec<Diagnostic> = Vec::new();
        warn_duplicates(&set, &mut diags);
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("duplicate"));
    }
}
