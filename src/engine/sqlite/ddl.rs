//! Facts `SQLite` only keeps in the stored `CREATE` text of `sqlite_master`:
//! CHECK constraints, view bodies, trigger timing and events, partial index
//! predicates and the `WITHOUT ROWID` flag.
//!
//! The scanner skips string literals, quoted identifiers and comments, and
//! tracks parenthesis depth; it does not parse SQL beyond that.

use std::sync::LazyLock;

use regex::Regex;

use crate::engine::model::CheckConstraint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Word(&'a str),
    /// Quoted identifier, quotes removed
    Quoted(&'a str),
    Open,
    Close,
    Comma,
    Other,
}

/// Token stream with byte offsets
fn tokenize(sql: &str) -> Vec<(usize, usize, Token<'_>)> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        match bytes[i] {
            b'\'' => {
                i = skip_quoted(bytes, i, b'\'');
                tokens.push((start, i, Token::Other));
            }
            quote @ (b'"' | b'`') => {
                i = skip_quoted(bytes, i, quote);
                tokens.push((start, i, Token::Quoted(quoted_inner(sql, start, i, quote))));
            }
            b'[' => {
                i = sql[i..].find(']').map_or(bytes.len(), |p| i + p + 1);
                tokens.push((start, i, Token::Quoted(quoted_inner(sql, start, i, b']'))));
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = sql[i..].find('\n').map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = sql[i + 2..].find("*/").map_or(bytes.len(), |p| i + 2 + p + 2);
            }
            b'(' => {
                i += 1;
                tokens.push((start, i, Token::Open));
            }
            b')' => {
                i += 1;
                tokens.push((start, i, Token::Close));
            }
            b',' => {
                i += 1;
                tokens.push((start, i, Token::Comma));
            }
            b if b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80 => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$' || bytes[i] >= 0x80) {
                    i += 1;
                }
                tokens.push((start, i, Token::Word(&sql[start..i])));
            }
            b if b.is_ascii_whitespace() => i += 1,
            _ => {
                i += 1;
                tokens.push((start, i, Token::Other));
            }
        }
    }
    tokens
}

/// Identifier between the quote at `start` and the closing quote ending at
/// `end`; an unterminated quote runs to the end of the text
fn quoted_inner(sql: &str, start: usize, end: usize, close: u8) -> &str {
    let closed = end > start + 1 && sql.as_bytes().get(end - 1) == Some(&close);
    &sql[start + 1..if closed { end - 1 } else { end }]
}

/// Index just past the closing quote; doubled quotes are escapes
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// CHECK constraints of a `CREATE TABLE` statement, column-level and
/// table-level, in declaration order. `CONSTRAINT name` before a CHECK names it.
#[must_use]
pub fn check_constraints(create_sql: &str) -> Vec<CheckConstraint> {
    let tokens = tokenize(create_sql);
    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut pending_name: Option<String> = None;
    let mut i = 0;

    while i < tokens.len() {
        let (_, _, token) = tokens[i];
        match token {
            Token::Open => depth += 1,
            Token::Close => depth = depth.saturating_sub(1),
            Token::Comma if depth == 1 => pending_name = None,
            Token::Word(w) if w.eq_ignore_ascii_case("CONSTRAINT") => {
                pending_name = match tokens.get(i + 1).map(|t| t.2) {
                    Some(Token::Word(name) | Token::Quoted(name)) => Some(name.to_string()),
                    _ => None,
                };
            }
            Token::Word(w) if w.eq_ignore_ascii_case("CHECK") => {
                if let Some((expression, next)) = parenthesized(create_sql, &tokens, i + 1) {
                    found.push(CheckConstraint { name: pending_name.take(), expression });
                    i = next;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Text inside the balanced parentheses opening at `tokens[at]`, and the
/// token index after the closing one
fn parenthesized(sql: &str, tokens: &[(usize, usize, Token<'_>)], at: usize) -> Option<(String, usize)> {
    let (_, open_end, Token::Open) = *tokens.get(at)? else {
        return None;
    };
    let mut depth = 0usize;
    for (offset, (start, _, token)) in tokens[at..].iter().enumerate() {
        match token {
            Token::Open => depth += 1,
            Token::Close => {
                depth -= 1;
                if depth == 0 {
                    return Some((sql[open_end..*start].trim().to_string(), at + offset + 1));
                }
            }
            _ => {}
        }
    }
    None
}

static VIEW_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)^\s*CREATE\s+(?:TEMP\s+|TEMPORARY\s+)?VIEW\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:"(?:[^"]|"")*"|`[^`]*`|\[[^\]]*\]|[^\s(]+)(?:\s*\([^)]*\))?\s+AS\s+(.*)$"#,
    )
    .expect("valid regex")
});

/// The `SELECT` of a `CREATE VIEW`, or the whole text when it cannot be found
#[must_use]
pub fn view_body(create_sql: &str) -> String {
    VIEW_BODY
        .captures(create_sql)
        .and_then(|c| c.get(1))
        .map_or_else(|| create_sql.trim().to_string(), |m| m.as_str().trim().to_string())
}

/// `(timing, events)` of a `CREATE TRIGGER`; timing defaults to `BEFORE`
#[must_use]
pub fn trigger_header(create_sql: &str) -> (String, Vec<String>) {
    let tokens = tokenize(create_sql);
    let words: Vec<String> = tokens
        .iter()
        .map_while(|(_, _, t)| match t {
            Token::Word(w) if w.eq_ignore_ascii_case("ON") => None,
            Token::Word(w) => Some(w.to_ascii_uppercase()),
            _ => Some(String::new()),
        })
        .collect();

    let mut timing = "BEFORE".to_string();
    let mut events = Vec::new();
    for (i, word) in words.iter().enumerate() {
        match word.as_str() {
            "BEFORE" | "AFTER" => timing.clone_from(word),
            "INSTEAD" if words.get(i + 1).is_some_and(|w| w == "OF") => timing = "INSTEAD OF".to_string(),
            "INSERT" | "UPDATE" | "DELETE" => events.push(word.clone()),
            _ => {}
        }
    }
    (timing, events)
}

/// Predicate of a partial `CREATE INDEX ... WHERE ...`
#[must_use]
pub fn index_predicate(create_sql: &str) -> Option<String> {
    let tokens = tokenize(create_sql);
    let mut depth = 0usize;
    for (_, end, token) in &tokens {
        match token {
            Token::Open => depth += 1,
            Token::Close => depth = depth.saturating_sub(1),
            Token::Word(w) if depth == 0 && w.eq_ignore_ascii_case("WHERE") => {
                let predicate = create_sql[*end..].trim().trim_end_matches(';').trim();
                return (!predicate.is_empty()).then(|| predicate.to_string());
            }
            _ => {}
        }
    }
    None
}

/// Whether a `CREATE TABLE` ends with `WITHOUT ROWID`
#[must_use]
pub fn without_rowid(create_sql: &str) -> bool {
    let tokens = tokenize(create_sql);
    let mut depth = 0usize;
    let mut seen_body = false;
    let mut previous_without = false;
    for (_, _, token) in &tokens {
        match token {
            Token::Open => {
                depth += 1;
                seen_body = true;
            }
            Token::Close => depth = depth.saturating_sub(1),
            Token::Word(w) if seen_body && depth == 0 => {
                if previous_without && w.eq_ignore_ascii_case("ROWID") {
                    return true;
                }
                previous_without = w.eq_ignore_ascii_case("WITHOUT");
                continue;
            }
            _ => {}
        }
        previous_without = false;
    }
    false
}
