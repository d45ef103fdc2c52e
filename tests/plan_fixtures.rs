//! Plan Normalization Fixtures
//!
//! One query shape (orders joined to users, ordered by date) as each engine
//! reports it. The three native formats must land on the same canonical
//! tree shape, and each engine's recommendation preset must read it the
//! same way.

#![cfg(all(feature = "postgres", feature = "mysql", feature = "sqlite"))]

use dblens::engine::mysql::plan::{parse_json_plan, parse_tree_plan};
use dblens::engine::postgres::plan::parse_plan;
use dblens::engine::sqlite::plan::{build_plan, PlanRow};
use dblens::plan::{JoinStrategy, PlanNode, PlanNodeKind, RecommendationCode};
use dblens::{DatabaseType, ExplainReport};
use pretty_assertions::assert_eq;

fn kinds(node: &PlanNode) -> Vec<PlanNodeKind> {
    let mut out = Vec::new();
    node.walk(&mut |n: &PlanNode, _depth: usize| out.push(n.kind));
    out
}

fn summary(report: &ExplainReport) -> Vec<(RecommendationCode, usize)> {
    report.recommendations.iter().map(|r| (r.code, r.depth)).collect()
}

const NESTED_LOOP: PlanNodeKind = PlanNodeKind::Join { strategy: JoinStrategy::NestedLoop };

fn postgres_fixture() -> serde_json::Value {
    serde_json::json!([{
        "Plan": {
            "Node Type": "Sort",
            "Total Cost": 5210.0,
            "Plan Rows": 20000,
            "Sort Key": ["o.created_at DESC"],
            "Plans": [{
                "Node Type": "Nested Loop",
                "Join Type": "Inner",
                "Plan Rows": 20000,
                "Plans": [
                    { "Node Type": "Seq Scan", "Relation Name": "orders", "Alias": "o", "Plan Rows": 20000 },
                    {
                        "Node Type": "Index Scan",
                        "Relation Name": "users",
                        "Index Name": "users_pkey",
                        "Index Cond": "(id = o.user_id)",
                        "Plan Rows": 1
                    }
                ]
            }]
        },
        "Planning Time": 0.2
    }])
}

const MYSQL_ANALYZE_TREE: &str = "\
-> Sort: o.created_at DESC  (actual time=3.1..3.2 rows=150 loops=1)
    -> Nested loop inner join  (cost=3000 rows=150) (actual time=0.1..2.9 rows=150 loops=1)
        -> Table scan on o  (cost=2005 rows=20000) (actual time=0.05..1.2 rows=150 loops=1)
        -> Single-row index lookup on u using PRIMARY (id=o.user_id)  (cost=0.25 rows=1) (actual time=0.001..0.001 rows=1 loops=150)
";

const MYSQL_JSON: &str = r#"{
  "query_block": {
    "select_id": 1,
    "cost_info": { "query_cost": "9005.00" },
    "ordering_operation": {
      "using_filesort": true,
      "nested_loop": [
        { "table": { "table_name": "o", "access_type": "ALL", "rows_examined_per_scan": 20000, "rows_produced_per_join": 20000 } },
        { "table": { "table_name": "u", "access_type": "eq_ref", "key": "PRIMARY", "rows_examined_per_scan": 1, "rows_produced_per_join": 20000 } }
      ]
    }
  }
}"#;

fn sqlite_rows() -> Vec<PlanRow> {
    vec![
        PlanRow::new(2, 0, "SCAN o"),
        PlanRow::new(4, 0, "SEARCH u USING INTEGER PRIMARY KEY (rowid=?)"),
        PlanRow::new(7, 0, "USE TEMP B-TREE FOR ORDER BY"),
    ]
}

// ============================================================================
// Shape
// ============================================================================

#[test]
fn test_postgres_shape() {
    let plan = parse_plan(&postgres_fixture()).unwrap();
    assert_eq!(
        kinds(&plan.root),
        vec![PlanNodeKind::Sort, NESTED_LOOP, PlanNodeKind::FullScan, PlanNodeKind::IndexScan]
    );
    assert_eq!(plan.total_cost, Some(5210.0));
    assert_eq!(plan.planning_time_ms, Some(0.2));
    assert_eq!(plan.root.children[0].children[1].condition.as_deref(), Some("(id = o.user_id)"));
}

#[test]
fn test_mysql_formats_agree() {
    let from_json = parse_json_plan(MYSQL_JSON).unwrap();
    let from_tree = parse_tree_plan(MYSQL_ANALYZE_TREE).unwrap();

    let expected = vec![PlanNodeKind::Sort, NESTED_LOOP, PlanNodeKind::FullScan, PlanNodeKind::IndexScan];
    assert_eq!(kinds(&from_json.root), expected);
    assert_eq!(kinds(&from_tree.root), expected);

    let scan = |root: &PlanNode| root.children[0].children[0].relation.clone();
    assert_eq!(scan(&from_json.root), scan(&from_tree.root));
    assert_eq!(from_tree.execution_time_ms, Some(3.2));
    assert_eq!(from_json.execution_time_ms, None);
}

#[test]
fn test_sqlite_shape() {
    let plan = build_plan(&sqlite_rows()).unwrap();
    assert_eq!(
        kinds(&plan.root),
        vec![
            PlanNodeKind::Other,
            NESTED_LOOP,
            PlanNodeKind::FullScan,
            PlanNodeKind::IndexScan,
            PlanNodeKind::Sort,
        ]
    );
    let search = &plan.root.children[0].children[1];
    assert_eq!(search.index.as_deref(), Some("PRIMARY KEY"));
    assert_eq!(search.condition.as_deref(), Some("rowid=?"));
}

#[test]
fn test_every_engine_finds_one_join_and_one_full_scan() {
    let plans = [
        parse_plan(&postgres_fixture()).unwrap(),
        parse_json_plan(MYSQL_JSON).unwrap(),
        parse_tree_plan(MYSQL_ANALYZE_TREE).unwrap(),
        build_plan(&sqlite_rows()).unwrap(),
    ];
    for plan in &plans {
        let kinds = kinds(&plan.root);
        assert_eq!(kinds.iter().filter(|k| matches!(k, PlanNodeKind::Join { .. })).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == PlanNodeKind::FullScan).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == PlanNodeKind::Sort).count(), 1);
    }
}

// ============================================================================
// Recommendations
// ============================================================================

#[test]
fn test_postgres_recommendations() {
    let report = ExplainReport::build(DatabaseType::Postgres, false, parse_plan(&postgres_fixture()).unwrap());
    assert_eq!(
        summary(&report),
        vec![
            (RecommendationCode::IndexForOrdering, 0),
            (RecommendationCode::ReviewJoinStrategy, 1),
            (RecommendationCode::AddIndex, 2),
        ]
    );
    assert_eq!(report.recommendations[2].relation.as_deref(), Some("orders"));
    assert!(report.recommendations[0].message.contains("o.created_at DESC"));
}

#[test]
fn test_mysql_analyze_reports_stale_statistics() {
    let report = ExplainReport::build(DatabaseType::MySQL, true, parse_tree_plan(MYSQL_ANALYZE_TREE).unwrap());

    // 20000 estimated vs 150 actual; the scan itself is small once measured
    assert_eq!(
        summary(&report),
        vec![(RecommendationCode::IndexForOrdering, 0), (RecommendationCode::StaleStatistics, 2)]
    );
    assert!(report.recommendations[1].message.contains("ANALYZE TABLE o"));
}

#[test]
fn test_never_executed_branch_is_not_stale() {
    let tree = "\
-> Nested loop inner join  (cost=30 rows=4) (actual time=0.05..0.05 rows=0 loops=1)
    -> Filter: (a.flag = 1)  (cost=2.25 rows=4) (actual time=0.04..0.04 rows=0 loops=1)
        -> Index range scan on a using idx_flag  (cost=2.25 rows=4) (actual time=0.03..0.03 rows=0 loops=1)
    -> Index lookup on b using idx_b (b_id=a.id)  (cost=5 rows=5000) (never executed)
";
    let report = ExplainReport::build(DatabaseType::MySQL, true, parse_tree_plan(tree).unwrap());
    assert!(report
        .recommendations
        .iter()
        .all(|r| r.relation.as_deref() != Some("b")));
    assert!(!report.recommendations.iter().any(|r| r.code == RecommendationCode::StaleStatistics));
}

#[test]
fn test_mysql_estimated_plan_recommendations() {
    let report = ExplainReport::build(DatabaseType::MySQL, false, parse_json_plan(MYSQL_JSON).unwrap());
    let codes: Vec<RecommendationCode> = report.recommendations.iter().map(|r| r.code).collect();
    assert!(codes.contains(&RecommendationCode::AddIndex));
    assert!(codes.contains(&RecommendationCode::IndexForOrdering));
    assert!(!codes.contains(&RecommendationCode::StaleStatistics));
}

#[test]
fn test_sqlite_recommendations_follow_tree_order() {
    let report = ExplainReport::build(DatabaseType::SQLite, false, build_plan(&sqlite_rows()).unwrap());
    assert_eq!(
        summary(&report),
        vec![(RecommendationCode::AddIndex, 2), (RecommendationCode::IndexForOrdering, 1)]
    );
    assert_eq!(report.recommendations[0].relation.as_deref(), Some("o"));
}

#[test]
fn test_presets_differ_only_where_configured() {
    let plan = build_plan(&sqlite_rows()).unwrap();
    // Without row estimates only the sqlite preset flags the scan
    let postgres = ExplainReport::build(DatabaseType::Postgres, false, plan.clone());
    let sqlite = ExplainReport::build(DatabaseType::SQLite, false, plan);
    assert_eq!(summary(&postgres), vec![(RecommendationCode::IndexForOrdering, 1)]);
    assert_eq!(sqlite.recommendations.len(), 2);
}
