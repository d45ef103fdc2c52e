//! `EXPLAIN QUERY PLAN` rows → [`PlanNode`] tree.
//!
//! `SQLite` reports one row per operation as `(id, parent, notused, detail)`.
//! The tree is assembled from the parent links, children kept in the order
//! the rows were reported. Sibling table accesses are wrapped in a synthetic
//! nested-loop join, the only join algorithm `SQLite` executes.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{DbLensError, Result};
use crate::plan::{JoinStrategy, Plan, PlanNode, PlanNodeKind};

/// One row of `EXPLAIN QUERY PLAN`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRow {
    pub id: i64,
    pub parent: i64,
    pub detail: String,
}

impl PlanRow {
    #[must_use]
    pub fn new(id: i64, parent: i64, detail: impl Into<String>) -> Self {
        Self { id, parent, detail: detail.into() }
    }
}

static ACCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(SCAN|SEARCH)\s+(?:TABLE\s+)?(\S+)(?:\s+AS\s+(\S+))?(?:\s+USING\s+(.*)|\s+.*)?$")
        .expect("valid regex")
});

static USING_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(AUTOMATIC\s+)?(?:PARTIAL\s+)?(COVERING\s+)?INDEX(?:\s+([^\s(]\S*))?(?:\s+\((.*)\))?")
        .expect("valid regex")
});

static USING_PRIMARY_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:INTEGER\s+)?PRIMARY\s+KEY(?:\s+\((.*)\))?").expect("valid regex")
});

static BLOOM_FILTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^BLOOM\s+FILTER\s+ON\s+(\S+)(?:\s+\((.*)\))?").expect("valid regex")
});

/// Table access node from a `SCAN`/`SEARCH` detail line
fn classify_access(detail: &str, caps: &regex::Captures<'_>) -> PlanNode {
    let verb = caps.get(1).map_or("", |m| m.as_str()).to_ascii_uppercase();
    let relation = caps.get(2).map_or("", |m| m.as_str());
    let using = caps.get(4).map(|m| m.as_str().trim());

    if relation.eq_ignore_ascii_case("CONSTANT") {
        return PlanNode::new(PlanNodeKind::Other, detail);
    }
    if relation.starts_with('(') {
        return PlanNode::new(PlanNodeKind::Subquery, detail).with_relation(relation);
    }

    let mut node = match using {
        None => PlanNode::new(PlanNodeKind::FullScan, detail),
        Some(using) => {
            if let Some(index) = USING_INDEX.captures(using) {
                let automatic = index.get(1).is_some();
                let covering = index.get(2).is_some();
                let kind = if automatic {
                    // Built at run time by scanning the whole table
                    PlanNodeKind::FullScan
                } else if covering {
                    PlanNodeKind::IndexOnlyScan
                } else {
                    PlanNodeKind::IndexScan
                };
                let mut node = PlanNode::new(kind, detail);
                node.index = index.get(3).map(|m| m.as_str().to_string());
                node.condition = index.get(4).map(|m| m.as_str().to_string());
                node
            } else if let Some(pk) = USING_PRIMARY_KEY.captures(using) {
                let mut node = PlanNode::new(PlanNodeKind::IndexScan, detail).with_index("PRIMARY KEY");
                node.condition = pk.get(1).map(|m| m.as_str().to_string());
                node
            } else if verb == "SEARCH" {
                PlanNode::new(PlanNodeKind::IndexScan, detail)
            } else {
                PlanNode::new(PlanNodeKind::FullScan, detail)
            }
        }
    };
    node.relation = Some(relation.to_string());
    node
}

/// Map one detail line to a node without children
#[must_use]
pub fn classify(detail: &str) -> PlanNode {
    let detail = detail.trim();
    let upper = detail.to_ascii_uppercase();

    if let Some(caps) = ACCESS.captures(detail) {
        return classify_access(detail, &caps);
    }
    if let Some(caps) = BLOOM_FILTER.captures(detail) {
        let mut node = PlanNode::new(PlanNodeKind::Filter, detail)
            .with_relation(caps.get(1).map_or("", |m| m.as_str()));
        node.condition = caps.get(2).map(|m| m.as_str().to_string());
        return node;
    }
    if let Some(purpose) = upper.strip_prefix("USE TEMP B-TREE FOR ") {
        let kind = if purpose.contains("ORDER BY") { PlanNodeKind::Sort } else { PlanNodeKind::Temporary };
        return PlanNode::new(kind, detail);
    }
    if upper.starts_with("COMPOUND")
        || upper.starts_with("LEFT-MOST SUBQUERY")
        || upper.starts_with("MERGE (")
        || upper.starts_with("UNION")
        || upper.starts_with("EXCEPT")
        || upper.starts_with("INTERSECT")
    {
        return PlanNode::new(PlanNodeKind::SetOperation, detail);
    }
    if let Some(name) = upper.strip_prefix("MATERIALIZE ") {
        let name = &detail[detail.len() - name.len()..];
        return PlanNode::new(PlanNodeKind::Materialize, detail).with_relation(name.trim());
    }
    if let Some(name) = upper.strip_prefix("CO-ROUTINE ") {
        let name = &detail[detail.len() - name.len()..];
        return PlanNode::new(PlanNodeKind::Subquery, detail).with_relation(name.trim());
    }
    if upper.contains("SUBQUERY") {
        return PlanNode::new(PlanNodeKind::Subquery, detail);
    }
    PlanNode::new(PlanNodeKind::Other, detail)
}

/// Wrap two or more sibling table accesses in a nested-loop join placed where
/// the first access was; every other sibling keeps its position
fn group_loops(children: Vec<PlanNode>) -> Vec<PlanNode> {
    let accesses = children.iter().filter(|c| c.kind.is_scan()).count();
    if accesses < 2 {
        return children;
    }

    let mut out = Vec::with_capacity(children.len() - accesses + 1);
    let mut loop_slot = None;
    let mut loop_children = Vec::with_capacity(accesses);
    for child in children {
        if child.kind.is_scan() {
            if loop_slot.is_none() {
                loop_slot = Some(out.len());
                out.push(PlanNode::new(PlanNodeKind::Other, ""));
            }
            loop_children.push(child);
        } else {
            out.push(child);
        }
    }
    if let Some(slot) = loop_slot {
        out[slot] = PlanNode::new(
            PlanNodeKind::Join { strategy: JoinStrategy::NestedLoop },
            JoinStrategy::NestedLoop.as_str().to_uppercase(),
        )
        .with_children(loop_children);
    }
    out
}

struct TreeBuilder<'a> {
    rows: BTreeMap<i64, &'a PlanRow>,
    children: BTreeMap<i64, Vec<i64>>,
    visited: HashSet<i64>,
}

impl TreeBuilder<'_> {
    fn build(&mut self, id: i64) -> Option<PlanNode> {
        if !self.visited.insert(id) {
            return None;
        }
        let row = self.rows.get(&id)?;
        let node = classify(&row.detail);
        Some(node.with_children(self.build_children(id)))
    }

    fn build_children(&mut self, parent: i64) -> Vec<PlanNode> {
        let ids = self.children.get(&parent).cloned().unwrap_or_default();
        let built = ids.into_iter().filter_map(|id| self.build(id)).collect();
        group_loops(built)
    }
}

/// Assemble the plan tree from `EXPLAIN QUERY PLAN` rows
///
/// # Errors
/// `QueryExecution` when the engine returned no rows
pub fn build_plan(rows: &[PlanRow]) -> Result<Plan> {
    if rows.is_empty() {
        return Err(DbLensError::query("EXPLAIN QUERY PLAN returned no rows"));
    }

    let ids: HashSet<i64> = rows.iter().map(|r| r.id).collect();
    let mut builder = TreeBuilder {
        rows: rows.iter().map(|r| (r.id, r)).collect(),
        children: BTreeMap::new(),
        visited: HashSet::new(),
    };
    for row in rows {
        // Rows whose parent is missing (or themselves) hang off the root
        let parent = if row.parent != row.id && ids.contains(&row.parent) { row.parent } else { 0 };
        builder.children.entry(parent).or_default().push(row.id);
    }

    let mut top = builder.build_children(0);
    // Anything unreachable through parent links still appears, in row order
    let orphans: Vec<i64> = rows.iter().map(|r| r.id).filter(|id| !builder.visited.contains(id)).collect();
    for id in orphans {
        if let Some(node) = builder.build(id) {
            top.push(node);
        }
    }

    let root = if top.len() == 1 {
        top.remove(0)
    } else {
        PlanNode::new(PlanNodeKind::Other, "QUERY PLAN").with_children(top)
    };
    Ok(Plan::new(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operations(node: &PlanNode) -> Vec<String> {
        let mut out = Vec::new();
        node.walk(&mut |n: &PlanNode, depth: usize| out.push(format!("{depth}:{}", n.operation)));
        out
    }

    #[test]
    fn test_single_scan() {
        let plan = build_plan(&[PlanRow::new(2, 0, "SCAN users")]).unwrap();
        assert_eq!(plan.root.kind, PlanNodeKind::FullScan);
        assert_eq!(plan.root.relation.as_deref(), Some("users"));
        assert!(plan.total_cost.is_none());
    }

    #[test]
    fn test_join_grouped_under_nested_loop() {
        let rows = [
            PlanRow::new(3, 0, "SCAN o"),
            PlanRow::new(5, 0, "SEARCH u USING INTEGER PRIMARY KEY (rowid=?)"),
            PlanRow::new(9, 0, "USE TEMP B-TREE FOR ORDER BY"),
        ];
        let plan = build_plan(&rows).unwrap();

        assert_eq!(
            operations(&plan.root),
            vec![
                "0:QUERY PLAN",
                "1:NESTED LOOP",
                "2:SCAN o",
                "2:SEARCH u USING INTEGER PRIMARY KEY (rowid=?)",
                "1:USE TEMP B-TREE FOR ORDER BY",
            ]
        );
        let join = &plan.root.children[0];
        assert_eq!(join.kind, PlanNodeKind::Join { strategy: JoinStrategy::NestedLoop });
        assert_eq!(join.children[1].index.as_deref(), Some("PRIMARY KEY"));
        assert_eq!(join.children[1].condition.as_deref(), Some("rowid=?"));
        assert_eq!(plan.root.children[1].kind, PlanNodeKind::Sort);
    }

    #[test]
    fn test_nested_subquery_keeps_row_order() {
        let rows = [
            PlanRow::new(2, 0, "SCAN t"),
            PlanRow::new(6, 0, "CORRELATED SCALAR SUBQUERY 1"),
            PlanRow::new(10, 6, "SEARCH s USING COVERING INDEX s_t (t_id=?)"),
            PlanRow::new(14, 6, "USE TEMP B-TREE FOR GROUP BY"),
        ];
        let plan = build_plan(&rows).unwrap();

        assert_eq!(
            operations(&plan.root),
            vec![
                "0:QUERY PLAN",
                "1:SCAN t",
                "1:CORRELATED SCALAR SUBQUERY 1",
                "2:SEARCH s USING COVERING INDEX s_t (t_id=?)",
                "2:USE TEMP B-TREE FOR GROUP BY",
            ]
        );
        let search = &plan.root.children[1].children[0];
        assert_eq!(search.kind, PlanNodeKind::IndexOnlyScan);
        assert_eq!(search.index.as_deref(), Some("s_t"));
        assert_eq!(plan.root.children[1].children[1].kind, PlanNodeKind::Temporary);
    }

    #[test]
    fn test_compound_query() {
        let rows = [
            PlanRow::new(1, 0, "COMPOUND QUERY"),
            PlanRow::new(2, 1, "LEFT-MOST SUBQUERY"),
            PlanRow::new(5, 2, "SCAN a"),
            PlanRow::new(9, 1, "UNION ALL"),
            PlanRow::new(12, 9, "SCAN b"),
        ];
        let plan = build_plan(&rows).unwrap();
        assert_eq!(plan.root.kind, PlanNodeKind::SetOperation);
        assert_eq!(plan.root.children.len(), 2);
        assert_eq!(plan.root.node_count(), 5);
    }

    #[test]
    fn test_legacy_and_automatic_formats() {
        let node = classify("SCAN TABLE users AS u USING INDEX users_email");
        assert_eq!(node.kind, PlanNodeKind::IndexScan);
        assert_eq!(node.relation.as_deref(), Some("users"));
        assert_eq!(node.index.as_deref(), Some("users_email"));

        let auto = classify("SEARCH b USING AUTOMATIC COVERING INDEX (a_id=?)");
        assert_eq!(auto.kind, PlanNodeKind::FullScan);
        assert!(auto.index.is_none());
        assert_eq!(auto.condition.as_deref(), Some("a_id=?"));

        assert_eq!(classify("SCAN CONSTANT ROW").kind, PlanNodeKind::Other);
        assert_eq!(classify("SCAN docs VIRTUAL TABLE INDEX 0:").kind, PlanNodeKind::FullScan);
        assert_eq!(classify("MATERIALIZE recent").relation.as_deref(), Some("recent"));
        assert_eq!(classify("BLOOM FILTER ON b (x=?)").kind, PlanNodeKind::Filter);
    }

    #[test]
    fn test_orphans_and_self_loops_are_kept() {
        let rows = [
            PlanRow::new(2, 0, "SCAN a"),
            PlanRow::new(4, 4, "SCAN b"),
            PlanRow::new(7, 99, "USE TEMP B-TREE FOR DISTINCT"),
        ];
        let plan = build_plan(&rows).unwrap();
        assert_eq!(plan.root.node_count(), 5);
        assert_eq!(plan.root.children[0].kind, PlanNodeKind::Join { strategy: JoinStrategy::NestedLoop });
        assert_eq!(plan.root.children[1].kind, PlanNodeKind::Temporary);
    }

    #[test]
    fn test_empty_plan_is_error() {
        assert!(build_plan(&[]).is_err());
    }
}
