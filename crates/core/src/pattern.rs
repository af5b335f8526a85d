//! Search-pattern safety and query translation.
//!
//! Nothing reaches the regex engine or a fallback process without passing
//! through here. Dangerous patterns are rejected outright: the caller gets
//! an empty result, never an executed pattern. The translation table maps
//! user input to the query form the store executes: term, prefix, phrase,
//! or (validated) regex.

use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

pub const MAX_PATTERN_LENGTH: usize = 1000;
pub const MAX_REGEX_NESTING_DEPTH: usize = 10;
pub const MAX_REGEX_ALTERNATIONS: usize = 20;
pub const MAX_BACKREFERENCES: usize = 3;

/// Shell metacharacters that disqualify a pattern from ever reaching a
/// process-based fallback. Checked on every query, not only degraded ones.
const SHELL_METACHARACTERS: &[char] = &[';', '|', '`', '&', '<', '>', '\n', '\r', '\0'];

/// Substrings that mark a pattern as hostile regardless of backend.
const SUSPICIOUS_SUBSTRINGS: &[&str] = &["../", "..\\", "/etc/", "\\\\", "$("];

/// The query form a validated pattern translates to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    /// Empty input: match everything.
    All,
    Term(String),
    Prefix(String),
    Phrase(String),
    Regex(String),
    /// Unsafe or malformed input: execute nothing, return empty.
    Rejected,
}

fn nested_quantifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^)]*[*+{][^)]*\)[*+{]").unwrap())
}

fn wide_alternation_group_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^)]*(\|[^)]*){4,}").unwrap())
}

fn consecutive_quantifiers_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\.\*|\.\+|\.\{|\+\*|\+\+|\+\{|\*\*|\*\+|\*\{){2,}").unwrap()
    })
}

fn backreference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\[1-9]").unwrap())
}

/// True when the pattern carries shell metacharacters or traversal bait.
pub fn is_malicious(pattern: &str) -> bool {
    if pattern.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) {
        return true;
    }
    SUSPICIOUS_SUBSTRINGS.iter().any(|s| pattern.contains(s))
}

/// Structural complexity gate against catastrophic backtracking. Returns
/// false for anything that must not reach a regex engine.
pub fn validate_regex_complexity(pattern: &str) -> bool {
    if pattern.len() > MAX_PATTERN_LENGTH {
        warn!(component = "pattern", action = "reject_length", len = pattern.len());
        return false;
    }

    // Balanced parentheses and nesting depth in one pass.
    let mut depth = 0usize;
    let mut max_depth = 0usize;
    for c in pattern.chars() {
        match c {
            '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            ')' => {
                if depth == 0 {
                    warn!(component = "pattern", action = "reject_unbalanced");
                    return false;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        warn!(component = "pattern", action = "reject_unbalanced");
        return false;
    }
    if max_depth > MAX_REGEX_NESTING_DEPTH {
        warn!(component = "pattern", action = "reject_nesting", depth = max_depth);
        return false;
    }

    if nested_quantifier_re().is_match(pattern) {
        warn!(component = "pattern", action = "reject_nested_quantifier");
        return false;
    }

    let alternations = pattern.matches('|').count();
    if alternations > MAX_REGEX_ALTERNATIONS {
        warn!(component = "pattern", action = "reject_alternations", count = alternations);
        return false;
    }

    if wide_alternation_group_re().is_match(pattern) {
        warn!(component = "pattern", action = "reject_wide_group");
        return false;
    }

    if consecutive_quantifiers_re().is_match(pattern) {
        warn!(component = "pattern", action = "reject_consecutive_quantifiers");
        return false;
    }

    let backrefs = backreference_re().find_iter(pattern).count();
    if backrefs > MAX_BACKREFERENCES {
        warn!(component = "pattern", action = "reject_backreferences", count = backrefs);
        return false;
    }

    true
}

/// Translate user input into the executable query form.
///
/// | input | result |
/// |---|---|
/// | plain term, no wildcards | Term |
/// | `term*` | Prefix |
/// | `%term%` (pattern) | Phrase |
/// | `term%` (pattern) | Prefix |
/// | `*`/`?` patterns | Regex |
pub fn translate(pattern: &str, is_pattern: bool) -> QueryKind {
    if pattern.len() > MAX_PATTERN_LENGTH {
        return QueryKind::Rejected;
    }
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return QueryKind::All;
    }
    if is_malicious(trimmed) {
        warn!(component = "pattern", action = "reject_malicious");
        return QueryKind::Rejected;
    }

    let has_like = trimmed.contains('%') || trimmed.contains('_');
    let has_glob = trimmed.contains('*') || trimmed.contains('?');

    if !is_pattern && !has_like && !has_glob {
        return QueryKind::Term(trimmed.to_string());
    }

    // Prefix shorthand: "foo*" with no other wildcard.
    if trimmed.ends_with('*')
        && !trimmed.starts_with('*')
        && !trimmed[..trimmed.len() - 1].contains('*')
        && !trimmed.contains('?')
    {
        return QueryKind::Prefix(trimmed[..trimmed.len() - 1].to_string());
    }

    if is_pattern && has_like {
        if trimmed.starts_with('%') && trimmed.ends_with('%') && trimmed.len() > 2 {
            return QueryKind::Phrase(trimmed[1..trimmed.len() - 1].to_string());
        }
        if trimmed.ends_with('%') && !trimmed.starts_with('%') {
            return QueryKind::Prefix(trimmed[..trimmed.len() - 1].to_string());
        }
        let regex = like_to_regex(trimmed);
        return if validate_regex_complexity(&regex) {
            QueryKind::Regex(regex)
        } else {
            QueryKind::Rejected
        };
    }

    if is_pattern && has_glob {
        let regex = glob_to_regex(trimmed);
        return if validate_regex_complexity(&regex) {
            QueryKind::Regex(regex)
        } else {
            QueryKind::Rejected
        };
    }

    QueryKind::Term(trimmed.to_string())
}

/// Validate an explicit regex supplied by the caller.
pub fn translate_regex(pattern: &str) -> QueryKind {
    if pattern.trim().is_empty() {
        return QueryKind::All;
    }
    if is_malicious(pattern) || !validate_regex_complexity(pattern) {
        return QueryKind::Rejected;
    }
    QueryKind::Regex(pattern.to_string())
}

/// SQL LIKE → regex: `%` any run, `_` any single character.
pub fn like_to_regex(pattern: &str) -> String {
    let escaped = escape_regex_specials(pattern);
    escaped.replace('%', ".*").replace('_', ".")
}

/// Glob → regex: `*` any run, `?` any single character.
pub fn glob_to_regex(pattern: &str) -> String {
    let escaped = escape_regex_specials(pattern);
    escaped.replace('*', ".*").replace('?', ".")
}

/// Escape regex metacharacters while leaving the wildcard characters for
/// the converters above to rewrite.
fn escape_regex_specials(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '.' | '^' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | '+' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
