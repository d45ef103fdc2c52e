//! Query Safety Analyzer
//!
//! A pure, deterministic function from SQL text to a [`QueryVerdict`]. It
//! never touches a database and never fails: malformed input still yields a
//! verdict.
//!
//! # Algorithm
//! 1. Mask comments and string literals (offsets are preserved)
//! 2. Classify the first statement by its leading keyword
//! 3. Scan for dangerous operations (critical, blocking)
//! 4. Check unguarded DELETE/UPDATE
//! 5. Collect heuristic findings (projection, limits, cross products,
//!    injection signatures, expensive predicates)
//! 6. Score complexity and extract referenced tables
//!
//! # Limitations
//! Matching is lexical, not a parser. It works on masked text, so keywords
//! inside string literals and comments no longer trigger findings, but it
//! can still miss statements assembled dynamically (string concatenation
//! the analyzer never sees) and can flag unusual but harmless formatting.
//! `#` comments are not recognized. Backslash escapes inside literals are not
//! recognized either; only doubled quotes (`''`) are.

mod complexity;
mod lexer;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub use complexity::{Complexity, ComplexityFactors};
use lexer::{char_offset, clause_end, inside_function_call, lex, top_level_words, CommentKind, Lexed};

/// `OR` predicates in one statement before `EXCESSIVE_OR` is reported
pub const EXCESSIVE_OR_THRESHOLD: usize = 5;
/// Transforming function calls inside a filter before `FUNCTION_IN_WHERE`
pub const FUNCTION_IN_WHERE_THRESHOLD: usize = 2;

/// Statement kind, from the leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Transaction,
    Other,
}

impl QueryType {
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete | Self::Ddl)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Stable finding codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingCode {
    EmptyQuery,
    DropTable,
    DropDatabase,
    TruncateTable,
    StackedQueries,
    MultipleStatements,
    DeleteWithoutWhere,
    UpdateWithoutWhere,
    SelectStar,
    MissingLimit,
    CartesianProduct,
    PotentialInjection,
    LeadingWildcard,
    NotInSubquery,
    ExcessiveOr,
    FunctionInWhere,
}

impl FindingCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmptyQuery => "EMPTY_QUERY",
            Self::DropTable => "DROP_TABLE",
            Self::DropDatabase => "DROP_DATABASE",
            Self::TruncateTable => "TRUNCATE_TABLE",
            Self::StackedQueries => "STACKED_QUERIES",
            Self::MultipleStatements => "MULTIPLE_STATEMENTS",
            Self::DeleteWithoutWhere => "DELETE_WITHOUT_WHERE",
            Self::UpdateWithoutWhere => "UPDATE_WITHOUT_WHERE",
            Self::SelectStar => "SELECT_STAR",
            Self::MissingLimit => "MISSING_LIMIT",
            Self::CartesianProduct => "CARTESIAN_PRODUCT",
            Self::PotentialInjection => "POTENTIAL_INJECTION",
            Self::LeadingWildcard => "LEADING_WILDCARD",
            Self::NotInSubquery => "NOT_IN_SUBQUERY",
            Self::ExcessiveOr => "EXCESSIVE_OR",
            Self::FunctionInWhere => "FUNCTION_IN_WHERE",
        }
    }
}

impl std::fmt::Display for FindingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation about the query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub code: FindingCode,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Character offset into the analyzed text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMeta {
    pub query_type: QueryType,
    pub is_mutation: bool,
    pub tables: Vec<String>,
    pub complexity: Complexity,
    pub complexity_score: u32,
    pub statement_count: usize,
    pub requires_confirmation: bool,
}

/// Result of [`analyze`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryVerdict {
    pub is_valid: bool,
    pub findings: Vec<Finding>,
    pub meta: QueryMeta,
}

impl QueryVerdict {
    /// True if any finding carries `code`
    #[must_use]
    pub fn has(&self, code: FindingCode) -> bool {
        self.findings.iter().any(|f| f.code == code)
    }

    pub fn findings_with(&self, severity: Severity) -> impl Iterator<Item = &Finding> + '_ {
        self.findings.iter().filter(move |f| f.severity == severity)
    }
}

struct Collector<'a> {
    sql: &'a str,
    findings: Vec<Finding>,
}

impl<'a> Collector<'a> {
    fn push(
        &mut self,
        code: FindingCode,
        severity: Severity,
        message: impl Into<String>,
        suggestion: Option<&str>,
        byte_offset: Option<usize>,
    ) {
        self.findings.push(Finding {
            code,
            message: message.into(),
            severity,
            suggestion: suggestion.map(str::to_string),
            offset: byte_offset.map(|b| char_offset(self.sql, b)),
        });
    }
}

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($re).expect("valid regex"));
    };
}

pattern!(DROP_TABLE, r"(?i)\bDROP\s+TABLE\b");
pattern!(DROP_DATABASE, r"(?i)\bDROP\s+(?:DATABASE|SCHEMA)\b");
pattern!(TRUNCATE, r#"(?i)^[\s(]*(TRUNCATE)\s+(?:TABLE\s+)?(?:ONLY\s+)?["`A-Za-z_]"#);
pattern!(WHERE, r"(?i)\bWHERE\b");
pattern!(SELECT_STAR, r"(?i)\bSELECT\s+(?:DISTINCT\s+|ALL\s+)?\*|,\s*\*\s*(?:,|\bFROM\b)");
pattern!(LIMIT_CLAUSE, r"(?i)\bLIMIT\b|\bFETCH\s+(?:FIRST|NEXT)\b|\bTOP\s*\(?\s*\d");
pattern!(FROM, r"(?i)\bFROM\b");
pattern!(AGGREGATE_ONLY, r"(?i)^\s*SELECT\s+(?:COUNT|SUM|AVG|MIN|MAX)\s*\([^)]*\)\s*(?:AS\s+\w+\s*)?FROM\b");
pattern!(GROUP_BY, r"(?i)\bGROUP\s+BY\b");
pattern!(TAUTOLOGY, r"(?i)\bOR\s+([^\s=()<>!]+)\s*=\s*([^\s=()<>!;]+)");
pattern!(OR_TRUE, r"(?i)\bOR\s+TRUE\b");
pattern!(UNION_SELECT, r"(?i)\bUNION\s+(?:ALL\s+)?SELECT\b");
pattern!(UNION_NULLS, r"(?i)\bUNION\s+(?:ALL\s+)?SELECT\s+NULL\s*(?:,\s*NULL\s*)*(?:\bFROM\b|$|;)");
pattern!(
    SYSTEM_CATALOG,
    r"(?i)\b(?:information_schema|pg_catalog|pg_shadow|pg_authid|pg_user|mysql\s*\.\s*user|sqlite_master|sqlite_schema)\b"
);
pattern!(TIME_DELAY, r"(?i)\b(?:SLEEP|PG_SLEEP|BENCHMARK)\s*\(|\bWAITFOR\s+DELAY\b");
pattern!(LIKE_LITERAL, r"(?i)\bI?LIKE\s+'");
pattern!(NOT_IN_SUBQUERY, r"(?i)\bNOT\s+IN\s*\(\s*SELECT\b");
pattern!(OR_WORD, r"(?i)\bOR\b");
pattern!(
    TRANSFORM_CALL,
    r"(?i)\b(?:UPPER|LOWER|TRIM|LTRIM|RTRIM|SUBSTR|SUBSTRING|LEFT|RIGHT|LENGTH|CAST|CONVERT|COALESCE|IFNULL|DATE|YEAR|MONTH|DAY|DATE_FORMAT|DATE_TRUNC|TO_CHAR|STRFTIME|CONCAT|REPLACE)\s*\("
);
pattern!(
    TABLE_REFERENCE,
    r#"(?i)\b(?:FROM|JOIN|INTO|UPDATE|TRUNCATE(?:\s+TABLE)?|(?:DROP|ALTER|CREATE)\s+TABLE(?:\s+IF\s+(?:NOT\s+)?EXISTS)?)\s+((?:"[^"]+"|`[^`]+`|[A-Za-z_][\w$]*)(?:\s*\.\s*(?:"[^"]+"|`[^`]+`|[A-Za-z_][\w$]*))*)"#
);
pattern!(
    IDENTIFIER,
    r#"^\s*((?:"[^"]+"|`[^`]+`|[A-Za-z_][\w$]*)(?:\s*\.\s*(?:"[^"]+"|`[^`]+`|[A-Za-z_][\w$]*))*)"#
);
pattern!(CTE_NAME, r"(?i)(?:\bWITH\s+(?:RECURSIVE\s+)?|,\s*)([A-Za-z_]\w*)\s*(?:\([^)]*\)\s*)?AS\s+(?:NOT\s+)?(?:MATERIALIZED\s+)?\(");

const FROM_TERMINATORS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "HAVING", "UNION", "INTERSECT", "EXCEPT", "JOIN", "INNER",
    "LEFT", "RIGHT", "FULL", "CROSS", "NATURAL", "ON", "USING", "WINDOW", "FETCH", "OFFSET",
    "RETURNING", "SET", "VALUES", "FOR",
];

const WHERE_TERMINATORS: &[&str] =
    &["GROUP", "ORDER", "LIMIT", "HAVING", "UNION", "INTERSECT", "EXCEPT", "WINDOW", "FETCH", "OFFSET", "RETURNING", "FOR"];

const NON_TABLE_WORDS: &[&str] = &["SELECT", "LATERAL", "ONLY", "UNNEST", "VALUES", "WITH", "DUAL"];

/// Analyze one piece of SQL text
#[must_use]
pub fn analyze(sql: &str) -> QueryVerdict {
    let lexed = lex(sql);
    let mut out = Collector { sql, findings: Vec::new() };

    if lexed.statements.is_empty() {
        out.push(
            FindingCode::EmptyQuery,
            Severity::Error,
            "Query is empty or contains only comments",
            Some("Provide a SQL statement"),
            None,
        );
        return finish(out, QueryType::Other, Vec::new(), ComplexityFactors::default(), 0);
    }

    let first = lexed.statement(0);
    let query_type = classify(first);

    check_dangerous(&lexed, &mut out);
    check_unguarded_mutation(first, lexed.statements[0].start, query_type, &mut out);
    check_projection_and_limits(first, query_type, &mut out);
    check_cartesian_product(first, lexed.statements[0].start, query_type, &mut out);
    check_injection(&lexed, &mut out);
    check_expensive_patterns(&lexed, &mut out);

    let factors = complexity::measure(&lexed.masked);
    let tables = extract_tables(sql, &lexed.masked);
    let statement_count = lexed.statements.len();
    finish(out, query_type, tables, factors, statement_count)
}

fn finish(
    out: Collector<'_>,
    query_type: QueryType,
    tables: Vec<String>,
    factors: ComplexityFactors,
    statement_count: usize,
) -> QueryVerdict {
    let blocking = out
        .findings
        .iter()
        .any(|f| matches!(f.severity, Severity::Critical | Severity::Error));
    let is_mutation = query_type.is_mutation();
    let score = factors.score();

    QueryVerdict {
        is_valid: !blocking,
        findings: out.findings,
        meta: QueryMeta {
            query_type,
            is_mutation,
            tables,
            complexity: complexity::tier(score),
            complexity_score: score,
            statement_count,
            requires_confirmation: is_mutation || blocking,
        },
    }
}

/// Classify a (masked) statement by its leading keyword
fn classify(statement: &str) -> QueryType {
    let words = top_level_words(statement.trim_start_matches(|c: char| c.is_whitespace() || c == '('));
    let Some((_, head)) = words.first() else {
        return QueryType::Other;
    };

    match head.as_str() {
        "SELECT" | "VALUES" | "TABLE" => QueryType::Select,
        "WITH" => {
            let main = words
                .iter()
                .skip(1)
                .find_map(|(_, w)| match w.as_str() {
                    "SELECT" | "VALUES" | "TABLE" => Some(QueryType::Select),
                    "INSERT" | "MERGE" => Some(QueryType::Insert),
                    "UPDATE" => Some(QueryType::Update),
                    "DELETE" => Some(QueryType::Delete),
                    _ => None,
                })
                .unwrap_or(QueryType::Other);
            if main.is_mutation() {
                return main;
            }
            // A data-modifying CTE makes the whole statement a mutation
            CTE_NAME
                .find_iter(statement)
                .map(|m| classify(&statement[m.end()..]))
                .find(|kind| kind.is_mutation())
                .unwrap_or(main)
        }
        "INSERT" | "REPLACE" | "MERGE" | "UPSERT" => QueryType::Insert,
        "UPDATE" => QueryType::Update,
        "DELETE" => QueryType::Delete,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" | "COMMENT" | "GRANT" | "REVOKE" => {
            QueryType::Ddl
        }
        "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" | "END" => {
            QueryType::Transaction
        }
        _ => QueryType::Other,
    }
}

fn check_dangerous(lexed: &Lexed, out: &mut Collector<'_>) {
    let masked = lexed.masked.as_str();

    for m in DROP_TABLE.find_iter(masked) {
        out.push(
            FindingCode::DropTable,
            Severity::Critical,
            "DROP TABLE permanently removes a table and its data",
            Some("Run destructive DDL manually after taking a backup"),
            Some(m.start()),
        );
    }
    for m in DROP_DATABASE.find_iter(masked) {
        out.push(
            FindingCode::DropDatabase,
            Severity::Critical,
            "DROP DATABASE/SCHEMA permanently removes every object it contains",
            Some("Run destructive DDL manually after taking a backup"),
            Some(m.start()),
        );
    }
    // Statement position only; TRUNCATE(x, d) is a numeric function in MySQL
    for range in &lexed.statements {
        let Some(keyword) = TRUNCATE.captures(&masked[range.clone()]).and_then(|c| c.get(1)) else {
            continue;
        };
        out.push(
            FindingCode::TruncateTable,
            Severity::Critical,
            "TRUNCATE removes every row without a WHERE clause or per-row triggers",
            Some("Use DELETE with an explicit WHERE clause"),
            Some(range.start + keyword.start()),
        );
    }

    if lexed.statements.len() > 1 {
        let stacked_mutation = lexed.statements[1..]
            .iter()
            .find(|range| classify(&masked[(*range).clone()]).is_mutation());

        match stacked_mutation {
            Some(range) => out.push(
                FindingCode::StackedQueries,
                Severity::Critical,
                format!(
                    "Query contains {} statements and a later one modifies data",
                    lexed.statements.len()
                ),
                Some("Submit exactly one statement per call"),
                Some(range.start + (masked[range.clone()].len() - masked[range.clone()].trim_start().len())),
            ),
            None => out.push(
                FindingCode::MultipleStatements,
                Severity::Warning,
                format!("Query contains {} statements", lexed.statements.len()),
                Some("Submit exactly one statement per call"),
                None,
            ),
        }
    }
}

fn check_unguarded_mutation(
    statement: &str,
    base: usize,
    query_type: QueryType,
    out: &mut Collector<'_>,
) {
    if WHERE.is_match(statement) {
        return;
    }
    let offset = Some(base + (statement.len() - statement.trim_start().len()));

    match query_type {
        QueryType::Delete => out.push(
            FindingCode::DeleteWithoutWhere,
            Severity::Critical,
            "DELETE without a WHERE clause removes every row in the table",
            Some("Add a WHERE clause that selects the rows to delete"),
            offset,
        ),
        QueryType::Update => out.push(
            FindingCode::UpdateWithoutWhere,
            Severity::Warning,
            "UPDATE without a WHERE clause modifies every row in the table",
            Some("Add a WHERE clause that selects the rows to update"),
            offset,
        ),
        _ => {}
    }
}

fn check_projection_and_limits(statement: &str, query_type: QueryType, out: &mut Collector<'_>) {
    if query_type != QueryType::Select {
        return;
    }

    if let Some(m) = SELECT_STAR.find(statement) {
        out.push(
            FindingCode::SelectStar,
            Severity::Warning,
            "SELECT * returns every column, including ones the caller may not need",
            Some("List the required columns explicitly"),
            Some(m.start()),
        );
    }

    let reads_table = FROM.find_iter(statement).any(|m| !inside_function_call(statement, m.start()));
    let aggregate_only = AGGREGATE_ONLY.is_match(statement) && !GROUP_BY.is_match(statement);
    if reads_table && !aggregate_only && !LIMIT_CLAUSE.is_match(statement) {
        out.push(
            FindingCode::MissingLimit,
            Severity::Warning,
            "Read statement has no row-limiting clause",
            Some("Add LIMIT (or FETCH FIRST n ROWS ONLY) to bound the result"),
            None,
        );
    }
}

fn check_cartesian_product(
    statement: &str,
    base: usize,
    query_type: QueryType,
    out: &mut Collector<'_>,
) {
    if !matches!(query_type, QueryType::Select | QueryType::Update | QueryType::Delete)
        || WHERE.is_match(statement)
    {
        return;
    }

    for m in FROM.find_iter(statement) {
        if inside_function_call(statement, m.start()) {
            continue;
        }
        let end = clause_end(statement, m.end(), FROM_TERMINATORS);
        if has_top_level_comma(&statement[m.end()..end]) {
            out.push(
                FindingCode::CartesianProduct,
                Severity::Warning,
                "Several tables are listed in FROM without a join condition",
                Some("Join the tables explicitly with JOIN ... ON"),
                Some(base + m.start()),
            );
            return;
        }
    }
}

fn has_top_level_comma(text: &str) -> bool {
    let mut depth = 0i32;
    for ch in text.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

fn check_injection(lexed: &Lexed, out: &mut Collector<'_>) {
    let sql = out.sql;
    let masked = lexed.masked.as_str();

    for caps in TAUTOLOGY.captures_iter(masked) {
        let (Some(whole), Some(left), Some(right)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let left_text = &sql[left.range()];
        let right_text = &sql[right.range()];
        if left_text.eq_ignore_ascii_case(right_text) {
            out.push(
                FindingCode::PotentialInjection,
                Severity::Warning,
                format!("Always-true predicate '{}' looks like an injection tautology", &sql[whole.range()]),
                Some("Bind user input as parameters instead of concatenating it"),
                Some(whole.start()),
            );
        }
    }
    for m in OR_TRUE.find_iter(masked) {
        out.push(
            FindingCode::PotentialInjection,
            Severity::Warning,
            "Always-true predicate 'OR TRUE' looks like an injection tautology",
            Some("Bind user input as parameters instead of concatenating it"),
            Some(m.start()),
        );
    }

    for comment in &lexed.comments {
        let before = sql[..comment.range.start].trim_end();
        let after = &sql[comment.range.end..];
        let truncates = match comment.kind {
            CommentKind::Line => {
                before.ends_with('\'')
                    || (comment.body(sql).trim().is_empty() && after.trim().is_empty())
            }
            CommentKind::Block => {
                let glued_left = sql[..comment.range.start].chars().next_back().is_some_and(char::is_alphanumeric);
                let glued_right = after.chars().next().is_some_and(char::is_alphanumeric);
                glued_left && glued_right
            }
        };
        if truncates {
            out.push(
                FindingCode::PotentialInjection,
                Severity::Warning,
                "Comment placement suggests statement truncation or keyword obfuscation",
                Some("Remove the comment and bind user input as parameters"),
                Some(comment.range.start),
            );
        }
    }

    if let Some(m) = UNION_SELECT.find(masked) {
        let suspicious = !lexed.comments.is_empty()
            || UNION_NULLS.is_match(masked)
            || SYSTEM_CATALOG.is_match(masked);
        if suspicious {
            out.push(
                FindingCode::PotentialInjection,
                Severity::Warning,
                "UNION SELECT combined with comments, NULL padding or system catalogs resembles data exfiltration",
                Some("Bind user input as parameters instead of concatenating it"),
                Some(m.start()),
            );
        }
    }

    if let Some(m) = TIME_DELAY.find(masked) {
        out.push(
            FindingCode::PotentialInjection,
            Severity::Warning,
            "Deliberate delay function resembles time-based blind injection",
            None,
            Some(m.start()),
        );
    }
}

fn check_expensive_patterns(lexed: &Lexed, out: &mut Collector<'_>) {
    let sql = out.sql;
    let masked = lexed.masked.as_str();

    for m in LIKE_LITERAL.find_iter(masked) {
        if sql[m.end()..].starts_with('%') {
            out.push(
                FindingCode::LeadingWildcard,
                Severity::Info,
                "Pattern starts with a wildcard, so an ordinary index cannot be used",
                Some("Anchor the pattern or use a full-text / trigram index"),
                Some(m.start()),
            );
        }
    }

    if let Some(m) = NOT_IN_SUBQUERY.find(masked) {
        out.push(
            FindingCode::NotInSubquery,
            Severity::Warning,
            "NOT IN (SELECT ...) is slow and returns no rows if the subquery yields a NULL",
            Some("Rewrite as NOT EXISTS or an anti-join"),
            Some(m.start()),
        );
    }

    for range in &lexed.statements {
        let statement = &masked[range.clone()];
        let ors = OR_WORD.find_iter(statement).count();
        if ors >= EXCESSIVE_OR_THRESHOLD {
            out.push(
                FindingCode::ExcessiveOr,
                Severity::Info,
                format!("{ors} OR predicates in one statement"),
                Some("Use IN (...) or a join against a value list"),
                None,
            );
        }

        let transforms: usize = WHERE
            .find_iter(statement)
            .map(|w| {
                let end = clause_end(statement, w.end(), WHERE_TERMINATORS);
                TRANSFORM_CALL.find_iter(&statement[w.end()..end]).count()
            })
            .sum();
        if transforms >= FUNCTION_IN_WHERE_THRESHOLD {
            out.push(
                FindingCode::FunctionInWhere,
                Severity::Info,
                format!("{transforms} value-transforming function calls inside filters"),
                Some("Compare against raw columns or add expression indexes"),
                None,
            );
        }
    }
}

fn strip_identifier_quotes(raw: &str) -> String {
    raw.split('.')
        .map(|part| part.trim().trim_matches(|c| c == '"' || c == '`'))
        .collect::<Vec<_>>()
        .join(".")
}

/// Table names referenced in FROM/JOIN/INTO/UPDATE/TRUNCATE/TABLE positions,
/// first-seen order, duplicates and CTE names removed.
fn extract_tables(sql: &str, masked: &str) -> Vec<String> {
    let ctes: Vec<String> = CTE_NAME
        .captures_iter(masked)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_ascii_lowercase()))
        .collect();

    let mut tables: Vec<String> = Vec::new();
    let mut add = |raw: &str| {
        let name = strip_identifier_quotes(raw);
        let upper = name.to_ascii_uppercase();
        if name.is_empty()
            || NON_TABLE_WORDS.contains(&upper.as_str())
            || ctes.contains(&name.to_ascii_lowercase())
            || tables.contains(&name)
        {
            return;
        }
        tables.push(name);
    };

    for caps in TABLE_REFERENCE.captures_iter(masked) {
        let (Some(whole), Some(ident)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if inside_function_call(masked, whole.start()) {
            continue;
        }
        add(&sql[ident.range()]);

        let keyword = whole.as_str().trim_start();
        if keyword.len() >= 4 && keyword[..4].eq_ignore_ascii_case("FROM") {
            let end = clause_end(masked, ident.end(), FROM_TERMINATORS);
            let mut depth = 0i32;
            let mut segment_start = ident.end();
            for (idx, ch) in masked[ident.end()..end].char_indices() {
                let pos = ident.end() + idx;
                match ch {
                    '(' => depth += 1,
                    ')' => depth -= 1,
                    ',' if depth == 0 => segment_start = pos + 1,
                    _ => continue,
                }
                if ch == ',' && depth == 0 {
                    if let Some(next) = IDENTIFIER.captures(&masked[segment_start..end]).and_then(|c| c.get(1)) {
                        add(&sql[segment_start + next.start()..segment_start + next.end()]);
                    }
                }
            }
        }
    }

    tables
}
