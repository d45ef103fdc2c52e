//! Query Safety Analyzer Properties
//!
//! Whole-verdict properties checked over a corpus of statements, plus the
//! headline classifications agents depend on.

use dblens::safety::QueryType;
use dblens::{analyze, FindingCode, QueryVerdict, Severity};
use pretty_assertions::assert_eq;

const CORPUS: &[&str] = &[
    "",
    "   -- only a comment",
    "SELECT 1",
    "SELECT id, email FROM users WHERE id = $1 LIMIT 1",
    "SELECT * FROM users",
    "SELECT COUNT(*) FROM orders",
    "SELECT u.id FROM users u, orders o",
    "SELECT id FROM users WHERE name LIKE '%son' LIMIT 5",
    "SELECT id FROM users WHERE id NOT IN (SELECT user_id FROM bans) LIMIT 5",
    "SELECT id FROM t WHERE a = 1 OR a = 2 OR a = 3 OR a = 4 OR a = 5 OR a = 6 LIMIT 1",
    "SELECT id FROM t WHERE UPPER(a) = 'X' AND LOWER(b) = 'y' LIMIT 1",
    "SELECT name FROM users WHERE id = 1 UNION SELECT password FROM admins --",
    "SELECT * FROM users WHERE name = '' OR 'a'='a'",
    "SELECT pg_sleep(5)",
    "WITH recent AS (SELECT * FROM orders) SELECT * FROM recent LIMIT 10",
    "INSERT INTO users (email) VALUES ('x@example.com')",
    "UPDATE users SET active = 0",
    "UPDATE users SET active = 0 WHERE id = 3",
    "DELETE FROM sessions",
    "DELETE FROM sessions WHERE expires_at < now()",
    "DROP TABLE users",
    "DROP DATABASE shop",
    "TRUNCATE orders",
    "SELECT 1; DROP TABLE users",
    "SELECT 1; SELECT 2",
    "BEGIN",
    "SELECT 'DROP TABLE users; DELETE FROM x' AS note",
    "SELECT \"délai\" FROM \"données\" WHERE \"clé\" = 'été'",
];

fn blocking(verdict: &QueryVerdict) -> bool {
    verdict
        .findings
        .iter()
        .any(|f| matches!(f.severity, Severity::Critical | Severity::Error))
}

// ============================================================================
// Verdict Invariants
// ============================================================================

#[test]
fn test_valid_exactly_when_nothing_blocks() {
    for sql in CORPUS {
        let verdict = analyze(sql);
        assert_eq!(verdict.is_valid, !blocking(&verdict), "{sql}");
    }
}

#[test]
fn test_confirmation_for_mutations_and_invalid_queries() {
    for sql in CORPUS {
        let verdict = analyze(sql);
        assert_eq!(
            verdict.meta.requires_confirmation,
            verdict.meta.is_mutation || !verdict.is_valid,
            "{sql}"
        );
        assert_eq!(verdict.meta.is_mutation, verdict.meta.query_type.is_mutation(), "{sql}");
    }
}

#[test]
fn test_offsets_stay_inside_the_text() {
    for sql in CORPUS {
        let chars = sql.chars().count();
        for finding in analyze(sql).findings {
            if let Some(offset) = finding.offset {
                assert!(offset < chars.max(1), "{sql}: {} at {offset}", finding.code);
            }
        }
    }
}

#[test]
fn test_analysis_is_deterministic() {
    for sql in CORPUS {
        assert_eq!(analyze(sql), analyze(sql), "{sql}");
    }
}

#[test]
fn test_every_finding_has_a_message() {
    for sql in CORPUS {
        for finding in analyze(sql).findings {
            assert!(!finding.message.is_empty(), "{sql}: {}", finding.code);
        }
    }
}

// ============================================================================
// Classification
// ============================================================================

#[test]
fn test_delete_without_where() {
    let verdict = analyze("DELETE FROM sessions");
    assert!(!verdict.is_valid);
    assert_eq!(verdict.meta.query_type, QueryType::Delete);
    let critical: Vec<FindingCode> = verdict.findings_with(Severity::Critical).map(|f| f.code).collect();
    assert_eq!(critical, vec![FindingCode::DeleteWithoutWhere]);
}

#[test]
fn test_update_without_where_is_allowed_with_warning() {
    let verdict = analyze("UPDATE users SET active = 0");
    assert!(verdict.is_valid);
    assert!(verdict.meta.requires_confirmation);
    let warnings: Vec<FindingCode> = verdict.findings_with(Severity::Warning).map(|f| f.code).collect();
    assert_eq!(warnings, vec![FindingCode::UpdateWithoutWhere]);
}

#[test]
fn test_unbounded_select_star() {
    let verdict = analyze("SELECT * FROM users");
    assert!(verdict.is_valid);
    assert!(!verdict.meta.requires_confirmation);
    let codes: Vec<FindingCode> = verdict.findings.iter().map(|f| f.code).collect();
    assert_eq!(codes, vec![FindingCode::SelectStar, FindingCode::MissingLimit]);
    assert_eq!(verdict.meta.tables, vec!["users"]);
}

#[test]
fn test_union_with_comment_is_flagged() {
    let verdict = analyze("SELECT name FROM users WHERE id = 1 UNION SELECT password FROM admins --");
    assert!(verdict.has(FindingCode::PotentialInjection));
    assert_eq!(verdict.meta.tables, vec!["users", "admins"]);
}

#[test]
fn test_stacked_destructive_statement() {
    let verdict = analyze("SELECT 1; DROP TABLE users");
    assert!(!verdict.is_valid);
    assert_eq!(verdict.meta.statement_count, 2);
    assert!(verdict.has(FindingCode::StackedQueries));
    assert!(verdict.has(FindingCode::DropTable));
    // Classification follows the first statement
    assert_eq!(verdict.meta.query_type, QueryType::Select);
}

#[test]
fn test_literals_are_inert() {
    let verdict = analyze("SELECT 'DROP TABLE users; DELETE FROM x' AS note");
    assert!(verdict.is_valid);
    assert!(verdict.findings.is_empty());
    assert_eq!(verdict.meta.statement_count, 1);
}

#[test]
fn test_clean_point_lookup() {
    let verdict = analyze("SELECT id, email FROM users WHERE id = $1 LIMIT 1");
    assert!(verdict.is_valid);
    assert!(verdict.findings.is_empty());
    assert_eq!(verdict.meta.complexity, dblens::safety::Complexity::Low);
}
