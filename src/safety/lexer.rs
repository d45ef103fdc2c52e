//! Length-preserving SQL masking.
//!
//! Comments become spaces and string-literal contents become `_`, byte for
//! byte, so every offset in the masked text is also an offset into the
//! original. Quote characters and quoted identifiers are kept verbatim.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommentKind {
    Line,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommentSpan {
    pub kind: CommentKind,
    /// Byte range in the original text, delimiters included
    pub range: Range<usize>,
}

impl CommentSpan {
    /// Text between the comment delimiters
    pub(crate) fn body<'a>(&self, sql: &'a str) -> &'a str {
        let text = &sql[self.range.clone()];
        match self.kind {
            CommentKind::Line => text.get(2..).unwrap_or(""),
            CommentKind::Block => {
                let inner = text.get(2..).unwrap_or("");
                inner.strip_suffix("*/").unwrap_or(inner)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Lexed {
    /// Same byte length as the input
    pub masked: String,
    pub comments: Vec<CommentSpan>,
    /// Non-empty statements separated by top-level semicolons
    pub statements: Vec<Range<usize>>,
}

impl Lexed {
    pub(crate) fn statement(&self, index: usize) -> &str {
        self.statements.get(index).map_or("", |r| &self.masked[r.clone()])
    }
}

fn push_masked(out: &mut String, ch: char, fill: char) {
    if ch == '\n' {
        out.push('\n');
    } else {
        for _ in 0..ch.len_utf8() {
            out.push(fill);
        }
    }
}

/// Mask comments and literals of `sql`
pub(crate) fn lex(sql: &str) -> Lexed {
    let mut masked = String::with_capacity(sql.len());
    let mut comments = Vec::new();
    let mut boundaries = Vec::new();
    let mut chars = sql.char_indices().peekable();
    let mut prev: Option<char> = None;

    while let Some((start, ch)) = chars.next() {
        match ch {
            '-' if matches!(chars.peek(), Some((_, '-'))) => {
                chars.next();
                masked.push_str("  ");
                let mut end = sql.len();
                while let Some(&(idx, c)) = chars.peek() {
                    if c == '\n' {
                        end = idx;
                        break;
                    }
                    chars.next();
                    push_masked(&mut masked, c, ' ');
                }
                comments.push(CommentSpan { kind: CommentKind::Line, range: start..end });
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                masked.push_str("  ");
                let mut depth = 1usize;
                let mut end = sql.len();
                while let Some((idx, c)) = chars.next() {
                    if c == '*' && matches!(chars.peek(), Some((_, '/'))) {
                        chars.next();
                        masked.push_str("  ");
                        depth -= 1;
                        if depth == 0 {
                            end = idx + 2;
                            break;
                        }
                    } else if c == '/' && matches!(chars.peek(), Some((_, '*'))) {
                        chars.next();
                        masked.push_str("  ");
                        depth += 1;
                    } else {
                        push_masked(&mut masked, c, ' ');
                    }
                }
                comments.push(CommentSpan { kind: CommentKind::Block, range: start..end });
            }
            '\'' => {
                masked.push('\'');
                while let Some((_, c)) = chars.next() {
                    if c == '\'' {
                        if matches!(chars.peek(), Some((_, '\''))) {
                            chars.next();
                            masked.push_str("__");
                            continue;
                        }
                        masked.push('\'');
                        break;
                    }
                    push_masked(&mut masked, c, '_');
                }
            }
            '"' | '`' => {
                masked.push(ch);
                for (_, c) in chars.by_ref() {
                    masked.push(c);
                    if c == ch {
                        break;
                    }
                }
            }
            '$' if !prev.is_some_and(|p| p.is_alphanumeric() || p == '_') => {
                let rest = &sql[start + 1..];
                let tag_len = rest
                    .find(|c: char| !(c.is_ascii_alphabetic() || c == '_'))
                    .unwrap_or(rest.len());
                if rest[tag_len..].starts_with('$') {
                    let delimiter = &sql[start..start + tag_len + 2];
                    let body_start = start + delimiter.len();
                    let body_end = sql[body_start..]
                        .find(delimiter)
                        .map_or(sql.len(), |offset| body_start + offset);
                    let close_end = (body_end + delimiter.len()).min(sql.len());

                    masked.push_str(delimiter);
                    for c in sql[body_start..body_end].chars() {
                        push_masked(&mut masked, c, '_');
                    }
                    masked.push_str(&sql[body_end..close_end]);

                    while chars.peek().is_some_and(|&(idx, _)| idx < close_end) {
                        chars.next();
                    }
                } else {
                    masked.push('$');
                }
            }
            ';' => {
                boundaries.push(start);
                masked.push(';');
            }
            _ => masked.push(ch),
        }
        prev = Some(ch);
    }

    let mut statements = Vec::new();
    let mut begin = 0;
    for end in boundaries.into_iter().chain(std::iter::once(masked.len())) {
        if masked[begin..end].trim().is_empty() {
            begin = end + 1;
            continue;
        }
        statements.push(begin..end);
        begin = end + 1;
    }

    Lexed { masked, comments, statements }
}

/// Byte offset to character offset
pub(crate) fn char_offset(sql: &str, byte: usize) -> usize {
    sql.get(..byte).map_or(byte, |prefix| prefix.chars().count())
}

/// Upper-cased words that sit at parenthesis depth 0, with their byte offsets
pub(crate) fn top_level_words(text: &str) -> Vec<(usize, String)> {
    let mut words = Vec::new();
    let mut depth = 0i32;
    let mut current: Option<usize> = None;

    for (idx, ch) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
        if ch.is_alphanumeric() || ch == '_' {
            if current.is_none() {
                current = Some(idx);
            }
            continue;
        }
        if let Some(begin) = current.take() {
            if depth == 0 {
                words.push((begin, text[begin..idx].to_ascii_uppercase()));
            }
        }
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }

    words
}

/// End of the clause starting at `start`: the first top-level clause keyword,
/// an unbalanced closing parenthesis, or the end of the text.
pub(crate) fn clause_end(text: &str, start: usize, terminators: &[&str]) -> usize {
    let tail = &text[start..];
    let mut depth = 0i32;
    let mut word_start: Option<usize> = None;

    for (idx, ch) in tail.char_indices() {
        if ch.is_alphanumeric() || ch == '_' {
            if word_start.is_none() {
                word_start = Some(idx);
                if depth == 0 {
                    let word_end = tail[idx..]
                        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                        .map_or(tail.len(), |e| idx + e);
                    let word = &tail[idx..word_end];
                    if terminators.iter().any(|t| t.eq_ignore_ascii_case(word)) {
                        return start + idx;
                    }
                }
            }
            continue;
        }
        word_start = None;
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return start + idx;
                }
            }
            ';' if depth == 0 => return start + idx,
            _ => {}
        }
    }

    text.len()
}

/// True when `pos` sits inside parentheses that do not open a subquery,
/// e.g. the `FROM` of `EXTRACT(YEAR FROM ts)`.
pub(crate) fn inside_function_call(text: &str, pos: usize) -> bool {
    let mut depth = 0i32;
    for (idx, ch) in text[..pos].char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' if depth == 0 => {
                let after = text[idx + 1..].trim_start();
                let head: String = after
                    .chars()
                    .take_while(|c| c.is_ascii_alphabetic())
                    .collect::<String>()
                    .to_ascii_uppercase();
                return !matches!(head.as_str(), "SELECT" | "WITH" | "VALUES");
            }
            '(' => depth -= 1,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masking_preserves_length() {
        let sql = "SELECT 'héllo -- not a comment' /* block */ FROM t -- trailing";
        let lexed = lex(sql);
        assert_eq!(lexed.masked.len(), sql.len());
        assert!(!lexed.masked.contains("héllo"));
        assert!(!lexed.masked.contains("block"));
        assert!(lexed.masked.contains("FROM t"));
    }

    #[test]
    fn test_line_comment() {
        let sql = "SELECT * FROM users -- comment\nWHERE id = 1";
        let lexed = lex(sql);
        assert_eq!(lexed.comments.len(), 1);
        assert_eq!(lexed.comments[0].kind, CommentKind::Line);
        assert_eq!(lexed.comments[0].body(sql), " comment");
        assert!(lexed.masked.contains("\nWHERE id = 1"));
    }

    #[test]
    fn test_block_comment_nested() {
        let sql = "SELECT /* outer /* inner */ still */ 1";
        let lexed = lex(sql);
        assert_eq!(lexed.comments.len(), 1);
        assert_eq!(lexed.comments[0].body(sql), " outer /* inner */ still ");
        assert_eq!(lexed.masked.trim_end(), format!("SELECT{}1", " ".repeat(31)).trim_end());
    }

    #[test]
    fn test_escaped_quote_inside_literal() {
        let sql = "SELECT 'it''s; fine' FROM t";
        let lexed = lex(sql);
        assert_eq!(lexed.statements.len(), 1);
        assert!(lexed.masked.starts_with("SELECT '"));
        assert!(lexed.masked.ends_with("' FROM t"));
    }

    #[test]
    fn test_quoted_identifiers_kept() {
        let lexed = lex(r#"SELECT "weird;name", `other` FROM t"#);
        assert!(lexed.masked.contains(r#""weird;name""#));
        assert!(lexed.masked.contains("`other`"));
        assert_eq!(lexed.statements.len(), 1);
    }

    #[test]
    fn test_dollar_quoted_body_masked() {
        let sql = "CREATE FUNCTION f() RETURNS int AS $body$ SELECT 1; DROP TABLE x; $body$ LANGUAGE sql";
        let lexed = lex(sql);
        assert_eq!(lexed.masked.len(), sql.len());
        assert!(!lexed.masked.contains("DROP"));
        assert_eq!(lexed.statements.len(), 1);
    }

    #[test]
    fn test_positional_parameter_not_dollar_quote() {
        let lexed = lex("SELECT * FROM t WHERE a = $1 AND b = $2");
        assert!(lexed.masked.contains("$1"));
        assert!(lexed.masked.contains("$2"));
    }

    #[test]
    fn test_statement_split() {
        let lexed = lex("SELECT 1; ; SELECT 2;  ");
        assert_eq!(lexed.statements.len(), 2);
        assert_eq!(lexed.statement(0).trim(), "SELECT 1");
        assert_eq!(lexed.statement(1).trim(), "SELECT 2");
        assert_eq!(lexed.statement(7), "");
    }

    #[test]
    fn test_top_level_words() {
        let words: Vec<String> = top_level_words("with a as (select 1) select * from a")
            .into_iter()
            .map(|(_, w)| w)
            .collect();
        assert_eq!(words, vec!["WITH", "A", "AS", "SELECT", "FROM", "A"]);
    }

    #[test]
    fn test_clause_end() {
        let text = "SELECT * FROM a, (SELECT x FROM b WHERE y) c WHERE z";
        let from = text.find("FROM").unwrap() + 4;
        let end = clause_end(text, from, &["WHERE"]);
        assert_eq!(&text[from..end], " a, (SELECT x FROM b WHERE y) c ");
    }

    #[test]
    fn test_inside_function_call() {
        let text = "SELECT EXTRACT(YEAR FROM ts) FROM (SELECT ts FROM events) e";
        let first_from = text.find("FROM").unwrap();
        assert!(inside_function_call(text, first_from));
        let inner_from = text.rfind("FROM events").unwrap();
        assert!(!inside_function_call(text, inner_from));
        let outer_from = text.find(") FROM").unwrap() + 2;
        assert!(!inside_function_call(text, outer_from));
    }

    #[test]
    fn test_char_offset() {
        assert_eq!(char_offset("héllo", 3), 2);
        assert_eq!(char_offset("abc", 10), 10);
    }
}
