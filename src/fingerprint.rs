//! SQL fingerprinting
//!
//! Maps a SQL statement to the shape of the query: literals, comments and
//! formatting differences disappear, so `WHERE id = 1` and `WHERE id = 2`
//! count as the same query.
//!
//! Rules applied by [`SqlFingerprinter`]:
//! - `-- ...`, `# ...` and `/* ... */` comments are dropped
//! - single-quoted strings, numbers and `$N` placeholders become `?`
//! - double-quoted and backtick-quoted identifiers are kept verbatim
//! - everything else is lowercased, whitespace runs collapse to one space
//! - `in (?, ?, ?)` collapses to `in(?+)`, multi-row `values (..), (..)` to
//!   `values(?+)`
//! - a trailing `;` is removed

use regex::Regex;
use std::sync::LazyLock;

static IN_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bin\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").unwrap());

static VALUES_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bvalues?\s*\([^()]*\)(?:\s*,\s*\([^()]*\))*").unwrap()
});

/// Canonicalizes SQL text to a shape fingerprint
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, sql: &str) -> String;
}

impl<F> Fingerprinter for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn fingerprint(&self, sql: &str) -> String {
        self(sql)
    }
}

/// Default fingerprinter
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlFingerprinter;

impl SqlFingerprinter {
    pub fn new() -> Self {
        Self
    }
}

impl Fingerprinter for SqlFingerprinter {
    fn fingerprint(&self, sql: &str) -> String {
        let scanned = scan(sql);
        let collapsed = IN_LIST.replace_all(&scanned, "in(?+)");
        let collapsed = VALUES_LIST.replace_all(&collapsed, "values(?+)");
        collapsed.trim_end_matches(';').trim_end().to_string()
    }
}

/// Token-level pass: comments, literals, case and whitespace
fn scan(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(sql.len());
    let mut space = false;
    let mut i = 0;

    while i < len {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            space = true;
            i += 1;
            continue;
        }

        // Comments
        if (c == '-' && next == Some('-')) || c == '#' {
            while i < len && chars[i] != '\n' {
                i += 1;
            }
            space = true;
            continue;
        }
        if c == '/' && next == Some('*') {
            i += 2;
            while i < len && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(len);
            space = true;
            continue;
        }

        if space && !out.is_empty() {
            out.push(' ');
        }
        space = false;

        let starts_number = c.is_ascii_digit()
            || (c == '.' && next.is_some_and(|n| n.is_ascii_digit()) && !ends_with_ident(&out));

        match c {
            '\'' => {
                i = skip_string(&chars, i);
                out.push('?');
            }
            '"' | '`' => {
                let end = skip_quoted_identifier(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            '$' if next.is_some_and(|n| n.is_ascii_digit()) => {
                i += 1;
                while i < len && chars[i].is_ascii_digit() {
                    i += 1;
                }
                out.push('?');
            }
            _ if starts_number => {
                i = skip_number(&chars, i);
                out.push('?');
            }
            _ if is_ident_char(c) => {
                while i < len && is_ident_char(chars[i]) {
                    out.extend(chars[i].to_lowercase());
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn ends_with_ident(out: &str) -> bool {
    out.chars().last().is_some_and(is_ident_char)
}

/// Index just past a single-quoted string starting at `start`
fn skip_string(chars: &[char], start: usize) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '\'' if chars.get(i + 1) == Some(&'\'') => i += 2,
            '\'' => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

/// Index just past a `"..."` or `` `...` `` identifier starting at `start`
fn skip_quoted_identifier(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// Index just past a numeric literal (decimal, hex, fraction, exponent)
fn skip_number(chars: &[char], start: usize) -> usize {
    let len = chars.len();
    let mut i = start;

    if chars[i] == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
        i += 2;
        while i < len && chars[i].is_ascii_hexdigit() {
            i += 1;
        }
        return i;
    }

    while i < len && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    if i < len && matches!(chars[i], 'e' | 'E') {
        let mut j = i + 1;
        if j < len && matches!(chars[j], '+' | '-') {
            j += 1;
        }
        if j < len && chars[j].is_ascii_digit() {
            i = j;
            while i < len && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    // A number glued to letters (e.g. `1abc`) is an identifier fragment
    while i < len && is_ident_char(chars[i]) {
        i += 1;
    }
    i
}
