//! Recommendation Engine
//!
//! A single pre-order pass over a [`PlanNode`] tree. Every node is checked
//! against each rule in turn (scan, join, sort/temporary, estimate
//! divergence), so recommendations come out in traversal order. Repeated
//! patterns in nested nodes produce one recommendation each; nothing is
//! deduplicated.

use serde::{Deserialize, Serialize};

use super::{JoinStrategy, PlanNode, PlanNodeKind, PlanVisitor};
use crate::engine::DatabaseType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationCode {
    AddIndex,
    ReviewJoinStrategy,
    IndexForOrdering,
    StaleStatistics,
}

/// Advisory finding attached to one plan node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub code: RecommendationCode,
    pub message: String,
    /// Operation label of the node that triggered it
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    /// Depth of the node in the plan tree (root = 0)
    pub depth: usize,
}

/// Per-engine thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationConfig {
    /// Full scans reading more rows than this get `ADD_INDEX`
    pub scan_row_threshold: f64,
    /// Join strategy considered expensive at scale
    pub costly_join: JoinStrategy,
    pub join_row_threshold: f64,
    /// Estimated vs actual ratio above which statistics are considered stale
    pub divergence_factor: f64,
    /// Report full scans that carry no row estimate at all
    pub flag_unestimated_scans: bool,
    /// Command suggested for refreshing planner statistics
    pub refresh_statistics: &'static str,
}

impl RecommendationConfig {
    #[must_use]
    pub const fn postgres() -> Self {
        Self {
            scan_row_threshold: 1_000.0,
            costly_join: JoinStrategy::NestedLoop,
            join_row_threshold: 10_000.0,
            divergence_factor: 10.0,
            flag_unestimated_scans: false,
            refresh_statistics: "ANALYZE",
        }
    }

    #[must_use]
    pub const fn mysql() -> Self {
        Self { refresh_statistics: "ANALYZE TABLE", ..Self::postgres() }
    }

    /// `EXPLAIN QUERY PLAN` reports no row estimates, so every full scan is flagged
    #[must_use]
    pub const fn sqlite() -> Self {
        Self { flag_unestimated_scans: true, ..Self::postgres() }
    }

    #[must_use]
    pub const fn for_engine(engine: DatabaseType) -> Self {
        match engine {
            DatabaseType::Postgres => Self::postgres(),
            DatabaseType::MySQL => Self::mysql(),
            DatabaseType::SQLite => Self::sqlite(),
        }
    }
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self::postgres()
    }
}

struct Recommender<'a> {
    config: &'a RecommendationConfig,
    found: Vec<Recommendation>,
}

impl Recommender<'_> {
    fn push(&mut self, node: &PlanNode, depth: usize, code: RecommendationCode, message: String) {
        self.found.push(Recommendation {
            code,
            message,
            operation: node.operation.clone(),
            relation: node.relation.clone(),
            depth,
        });
    }

    fn check_scan(&mut self, node: &PlanNode, depth: usize) {
        if node.kind != PlanNodeKind::FullScan {
            return;
        }
        let relation = node.relation.as_deref().unwrap_or("the scanned relation");

        match node.observed_rows() {
            Some(rows) if rows > self.config.scan_row_threshold => {
                let filter = node
                    .condition
                    .as_deref()
                    .map(|c| format!(" filtered by {c}"))
                    .unwrap_or_default();
                self.push(
                    node,
                    depth,
                    RecommendationCode::AddIndex,
                    format!(
                        "Full scan of {relation} reads ~{rows:.0} rows{filter}; add an index on the filtered or joined columns"
                    ),
                );
            }
            None if self.config.flag_unestimated_scans => self.push(
                node,
                depth,
                RecommendationCode::AddIndex,
                format!("Full scan of {relation}; add an index on the filtered or joined columns"),
            ),
            _ => {}
        }
    }

    fn check_join(&mut self, node: &PlanNode, depth: usize) {
        let PlanNodeKind::Join { strategy } = node.kind else {
            return;
        };
        if strategy != self.config.costly_join {
            return;
        }

        let rows = node
            .observed_rows()
            .into_iter()
            .chain(node.children.iter().filter_map(PlanNode::observed_rows))
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))));

        if let Some(rows) = rows.filter(|r| *r > self.config.join_row_threshold) {
            self.push(
                node,
                depth,
                RecommendationCode::ReviewJoinStrategy,
                format!(
                    "{} over ~{rows:.0} rows; index the join columns or consider an alternative join strategy",
                    strategy.as_str()
                ),
            );
        }
    }

    fn check_ordering(&mut self, node: &PlanNode, depth: usize) {
        let what = match node.kind {
            PlanNodeKind::Sort => "ordering",
            PlanNodeKind::Temporary => "grouping",
            _ => return,
        };
        let keys = if node.sort_keys.is_empty() {
            String::new()
        } else {
            format!(" ({})", node.sort_keys.join(", "))
        };
        self.push(
            node,
            depth,
            RecommendationCode::IndexForOrdering,
            format!("{} requires an explicit {what} step; add an index matching the {what} columns{keys}", node.operation),
        );
    }

    fn check_divergence(&mut self, node: &PlanNode, depth: usize) {
        // Never-executed nodes report zero rows that say nothing about the estimate
        if node.loops == Some(0) {
            return;
        }
        let (Some(estimated), Some(actual)) = (node.estimated_rows, node.actual_rows) else {
            return;
        };
        let high = estimated.max(actual);
        let low = estimated.min(actual).max(1.0);
        if high / low > self.config.divergence_factor {
            let target = node.relation.as_deref().map(|r| format!(" {r}")).unwrap_or_default();
            self.push(
                node,
                depth,
                RecommendationCode::StaleStatistics,
                format!(
                    "Planner estimated {estimated:.0} rows but {actual:.0} were produced; statistics are stale, run {}{target}",
                    self.config.refresh_statistics
                ),
            );
        }
    }
}

impl PlanVisitor for Recommender<'_> {
    fn visit(&mut self, node: &PlanNode, depth: usize) {
        self.check_scan(node, depth);
        self.check_join(node, depth);
        self.check_ordering(node, depth);
        self.check_divergence(node, depth);
    }
}

/// Apply every rule to every node of `root`, in pre-order
#[must_use]
pub fn recommend(root: &PlanNode, config: &RecommendationConfig) -> Vec<Recommendation> {
    let mut recommender = Recommender { config, found: Vec::new() };
    root.walk(&mut recommender);
    recommender.found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(relation: &str, rows: Option<f64>) -> PlanNode {
        let mut node = PlanNode::new(PlanNodeKind::FullScan, "Seq Scan").with_relation(relation);
        node.estimated_rows = rows;
        node
    }

    fn codes(found: &[Recommendation]) -> Vec<RecommendationCode> {
        found.iter().map(|r| r.code).collect()
    }

    #[test]
    fn test_large_scan_needs_index() {
        let found = recommend(&scan("orders", Some(50_000.0)), &RecommendationConfig::postgres());
        assert_eq!(codes(&found), vec![RecommendationCode::AddIndex]);
        assert_eq!(found[0].relation.as_deref(), Some("orders"));
        assert!(found[0].message.contains("orders"));
    }

    #[test]
    fn test_small_scan_is_fine() {
        assert!(recommend(&scan("tiny", Some(20.0)), &RecommendationConfig::postgres()).is_empty());
        assert!(recommend(&scan("unknown", None), &RecommendationConfig::postgres()).is_empty());
    }

    #[test]
    fn test_unestimated_scan_flagged_for_sqlite() {
        let found = recommend(&scan("users", None), &RecommendationConfig::sqlite());
        assert_eq!(codes(&found), vec![RecommendationCode::AddIndex]);
    }

    #[test]
    fn test_costly_join_over_many_rows() {
        let mut join = PlanNode::new(PlanNodeKind::Join { strategy: JoinStrategy::NestedLoop }, "Nested Loop")
            .with_children(vec![scan("a", Some(200.0)), scan("b", Some(20_000.0))]);
        join.estimated_rows = Some(500.0);

        let found = recommend(&join, &RecommendationConfig::postgres());
        assert_eq!(
            codes(&found),
            vec![RecommendationCode::ReviewJoinStrategy, RecommendationCode::AddIndex]
        );
        assert_eq!(found[0].depth, 0);
        assert_eq!(found[1].relation.as_deref(), Some("b"));
    }

    #[test]
    fn test_hash_join_not_flagged() {
        let mut join = PlanNode::new(PlanNodeKind::Join { strategy: JoinStrategy::Hash }, "Hash Join");
        join.estimated_rows = Some(1_000_000.0);
        assert!(recommend(&join, &RecommendationConfig::postgres()).is_empty());
    }

    #[test]
    fn test_sort_and_temporary() {
        let mut sort = PlanNode::new(PlanNodeKind::Sort, "Sort")
            .with_children(vec![PlanNode::new(PlanNodeKind::Temporary, "USE TEMP B-TREE FOR GROUP BY")]);
        sort.sort_keys = vec!["created_at DESC".to_string()];

        let found = recommend(&sort, &RecommendationConfig::sqlite());
        assert_eq!(
            codes(&found),
            vec![RecommendationCode::IndexForOrdering, RecommendationCode::IndexForOrdering]
        );
        assert!(found[0].message.contains("created_at DESC"));
        assert!(found[1].message.contains("grouping"));
    }

    #[test]
    fn test_divergence_means_stale_statistics() {
        let mut node = PlanNode::new(PlanNodeKind::IndexScan, "Index Scan").with_relation("events");
        node.estimated_rows = Some(10.0);
        node.actual_rows = Some(5_000.0);

        let found = recommend(&node, &RecommendationConfig::mysql());
        assert_eq!(codes(&found), vec![RecommendationCode::StaleStatistics]);
        assert!(found[0].message.contains("ANALYZE TABLE events"));

        node.actual_rows = Some(50.0);
        assert!(recommend(&node, &RecommendationConfig::mysql()).is_empty());
    }

    #[test]
    fn test_never_executed_node_has_no_divergence() {
        let mut node = PlanNode::new(PlanNodeKind::IndexScan, "Index lookup").with_relation("b");
        node.estimated_rows = Some(5_000.0);
        node.actual_rows = Some(0.0);
        node.loops = Some(0);
        assert!(recommend(&node, &RecommendationConfig::mysql()).is_empty());

        node.loops = Some(1);
        assert_eq!(
            codes(&recommend(&node, &RecommendationConfig::mysql())),
            vec![RecommendationCode::StaleStatistics]
        );
    }

    #[test]
    fn test_zero_estimate_divergence() {
        let mut node = PlanNode::new(PlanNodeKind::IndexScan, "Index Scan");
        node.estimated_rows = Some(0.0);
        node.actual_rows = Some(11.0);
        let found = recommend(&node, &RecommendationConfig::postgres());
        assert_eq!(codes(&found), vec![RecommendationCode::StaleStatistics]);
    }

    #[test]
    fn test_repeated_patterns_not_deduplicated() {
        let root = PlanNode::new(PlanNodeKind::Other, "Append").with_children(vec![
            scan("logs_2023", Some(9_000.0)),
            scan("logs_2024", Some(9_000.0)),
        ]);
        let found = recommend(&root, &RecommendationConfig::postgres());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].relation.as_deref(), Some("logs_2023"));
        assert_eq!(found[1].relation.as_deref(), Some("logs_2024"));
    }

    #[test]
    fn test_rule_order_within_node() {
        let mut node = scan("big", Some(2_000.0));
        node.actual_rows = Some(200_000.0);
        let found = recommend(&node, &RecommendationConfig::postgres());
        assert_eq!(
            codes(&found),
            vec![RecommendationCode::AddIndex, RecommendationCode::StaleStatistics]
        );
    }
}
