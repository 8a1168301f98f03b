//! Local syntax pre-check for JavaScript patterns.
//!
//! A fast reject before paying for a sandbox round trip. It only reports
//! errors the JavaScript engine is certain to raise, so a pattern that passes
//! may still fail to compile in the sandbox. Python patterns are never
//! pre-checked.

use crate::request::Runtime;

const VALID_FLAGS: &str = "dgimsuvy";
const NOTHING_TO_REPEAT: &str = "Nothing to repeat";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Last {
    /// Start of pattern, group, or alternative.
    Nothing,
    /// `^` or `$`.
    Assertion,
    Atom,
    Quantifier,
    LazyQuantifier,
}

/// Returns a compile-error message if the pattern certainly fails to compile.
pub fn precheck(runtime: Runtime, pattern: &str, flags: &str) -> Option<String> {
    match runtime {
        Runtime::Javascript => check_javascript(pattern, flags),
        Runtime::Python => None,
    }
}

fn check_javascript(pattern: &str, flags: &str) -> Option<String> {
    if let Some(message) = check_flags(flags) {
        return Some(message);
    }

    let unicode = flags.contains('u') || flags.contains('v');
    let sets = flags.contains('v');

    check_pattern(pattern, unicode, sets)
        .map(|reason| format!("Invalid regular expression: /{}/{}: {}", pattern, flags, reason))
}

fn check_flags(flags: &str) -> Option<String> {
    let mut seen = String::new();
    for flag in flags.chars() {
        if !VALID_FLAGS.contains(flag) || seen.contains(flag) {
            return Some(invalid_flags(flags));
        }
        seen.push(flag);
    }
    if seen.contains('u') && seen.contains('v') {
        return Some(invalid_flags(flags));
    }
    None
}

fn invalid_flags(flags: &str) -> String {
    format!("Invalid flags supplied to RegExp constructor '{}'", flags)
}

fn check_pattern(pattern: &str, unicode: bool, sets: bool) -> Option<&'static str> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut depth = 0usize;
    let mut last = Last::Nothing;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                if i + 1 >= chars.len() {
                    return Some("\\ at end of pattern");
                }
                i += 2;
                last = Last::Atom;
                continue;
            }
            '[' => {
                i = match skip_class(&chars, i + 1, sets) {
                    Some(next) => next,
                    None => return Some("Unterminated character class"),
                };
                last = Last::Atom;
                continue;
            }
            '(' => {
                i += 1;
                if chars.get(i) == Some(&'?') {
                    i = match skip_group_prefix(&chars, i + 1) {
                        Some(next) => next,
                        None => return Some("Invalid group"),
                    };
                }
                depth += 1;
                last = Last::Nothing;
                continue;
            }
            ')' => {
                if depth == 0 {
                    return Some("Unmatched ')'");
                }
                depth -= 1;
                last = Last::Atom;
            }
            '|' => last = Last::Nothing,
            '^' | '$' => last = Last::Assertion,
            '*' | '+' => {
                if !repeatable(last) {
                    return Some(NOTHING_TO_REPEAT);
                }
                last = Last::Quantifier;
            }
            '?' => {
                last = match last {
                    Last::Quantifier => Last::LazyQuantifier,
                    Last::Atom => Last::Quantifier,
                    _ => return Some(NOTHING_TO_REPEAT),
                };
            }
            '{' => match braced_quantifier_end(&chars, i) {
                Some(end) => {
                    if !repeatable(last) {
                        return Some(NOTHING_TO_REPEAT);
                    }
                    last = Last::Quantifier;
                    i = end;
                }
                None if unicode => return Some("Incomplete quantifier"),
                None => last = Last::Atom,
            },
            '}' | ']' if unicode => return Some("Lone quantifier brackets"),
            _ => last = Last::Atom,
        }
        i += 1;
    }

    if depth > 0 {
        return Some("Unterminated group");
    }
    None
}

fn repeatable(last: Last) -> bool {
    last == Last::Atom
}

/// Returns the index just past the closing `]`.
fn skip_class(chars: &[char], mut i: usize, sets: bool) -> Option<usize> {
    let mut depth = 1usize;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '[' if sets => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Validates the part of a group after `(?` and returns the index of the
/// first character of the group body.
fn skip_group_prefix(chars: &[char], i: usize) -> Option<usize> {
    match chars.get(i) {
        Some(':') | Some('=') | Some('!') => Some(i + 1),
        Some('<') => match chars.get(i + 1) {
            Some('=') | Some('!') => Some(i + 2),
            _ => {
                let close = chars[i + 1..].iter().position(|&c| c == '>')?;
                let name = &chars[i + 1..i + 1 + close];
                let valid = name.first().is_some_and(|c| c.is_alphabetic() || *c == '_' || *c == '$')
                    && name.iter().all(|c| c.is_alphanumeric() || *c == '_' || *c == '$');
                valid.then_some(i + 2 + close)
            }
        },
        Some(_) => skip_modifiers(chars, i),
        None => None,
    }
}

/// Validates an `ims-ims:` modifier prefix and returns the index just past
/// the `:`. Each flag may appear once across both sides.
fn skip_modifiers(chars: &[char], mut i: usize) -> Option<usize> {
    let mut seen = Vec::new();
    let mut removing = false;
    loop {
        match *chars.get(i)? {
            c @ ('i' | 'm' | 's') if !seen.contains(&c) => seen.push(c),
            '-' if !removing => removing = true,
            ':' if !seen.is_empty() => return Some(i + 1),
            _ => return None,
        }
        i += 1;
    }
}

/// If `{` at `start` opens a `{n}`, `{n,}` or `{n,m}` quantifier, returns the
/// index of its closing `}`.
fn braced_quantifier_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    let digits_start = i;
    while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
    }
    if i == digits_start {
        return None;
    }
    if chars.get(i) == Some(&',') {
        i += 1;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
    }
    (chars.get(i) == Some(&'}')).then_some(i)
}
