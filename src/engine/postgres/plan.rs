//! `EXPLAIN (FORMAT JSON)` → canonical plan tree
//!
//! Postgres already reports a tree: every node carries its children under
//! `"Plans"` in execution order, so the mapping is a straight recursive fold.

use serde::Deserialize;

use crate::error::{DbLensError, Result};
use crate::plan::{JoinStrategy, Plan, PlanNode, PlanNodeKind};

#[derive(Debug, Deserialize)]
struct ExplainDocument {
    #[serde(rename = "Plan")]
    plan: RawNode,
    #[serde(rename = "Planning Time")]
    planning_time: Option<f64>,
    #[serde(rename = "Execution Time")]
    execution_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(rename = "Node Type")]
    node_type: String,
    #[serde(rename = "Join Type")]
    join_type: Option<String>,
    #[serde(rename = "Relation Name")]
    relation: Option<String>,
    #[serde(rename = "Schema")]
    schema: Option<String>,
    #[serde(rename = "Alias")]
    alias: Option<String>,
    #[serde(rename = "CTE Name")]
    cte_name: Option<String>,
    #[serde(rename = "Index Name")]
    index: Option<String>,
    #[serde(rename = "Plan Rows")]
    plan_rows: Option<f64>,
    #[serde(rename = "Actual Rows")]
    actual_rows: Option<f64>,
    #[serde(rename = "Total Cost")]
    total_cost: Option<f64>,
    #[serde(rename = "Actual Total Time")]
    actual_total_time: Option<f64>,
    #[serde(rename = "Actual Loops")]
    loops: Option<u64>,
    #[serde(rename = "Filter")]
    filter: Option<String>,
    #[serde(rename = "Index Cond")]
    index_cond: Option<String>,
    #[serde(rename = "Hash Cond")]
    hash_cond: Option<String>,
    #[serde(rename = "Merge Cond")]
    merge_cond: Option<String>,
    #[serde(rename = "Join Filter")]
    join_filter: Option<String>,
    #[serde(rename = "Sort Key", default)]
    sort_key: Vec<String>,
    #[serde(rename = "Group Key", default)]
    group_key: Vec<String>,
    #[serde(rename = "Plans", default)]
    plans: Vec<RawNode>,
}

fn classify(node_type: &str) -> PlanNodeKind {
    match node_type {
        "Seq Scan" | "Parallel Seq Scan" => PlanNodeKind::FullScan,
        "Index Scan" | "Bitmap Heap Scan" | "Bitmap Index Scan" | "Tid Scan" | "Tid Range Scan" => {
            PlanNodeKind::IndexScan
        }
        "Index Only Scan" => PlanNodeKind::IndexOnlyScan,
        "Nested Loop" => PlanNodeKind::Join { strategy: JoinStrategy::NestedLoop },
        "Hash Join" => PlanNodeKind::Join { strategy: JoinStrategy::Hash },
        "Merge Join" => PlanNodeKind::Join { strategy: JoinStrategy::Merge },
        "Sort" | "Incremental Sort" => PlanNodeKind::Sort,
        "Aggregate" | "HashAggregate" | "GroupAggregate" | "Group" | "WindowAgg" | "Unique" => {
            PlanNodeKind::Aggregate
        }
        "Limit" => PlanNodeKind::Limit,
        "Append" | "Merge Append" | "SetOp" | "HashSetOp" | "Recursive Union" => {
            PlanNodeKind::SetOperation
        }
        "Subquery Scan" | "CTE Scan" | "Function Scan" | "Values Scan" | "WorkTable Scan" => {
            PlanNodeKind::Subquery
        }
        "Materialize" | "Memoize" | "Hash" => PlanNodeKind::Materialize,
        "Result" | "ProjectSet" => PlanNodeKind::Filter,
        _ => PlanNodeKind::Other,
    }
}

fn convert(raw: RawNode) -> PlanNode {
    let kind = classify(&raw.node_type);

    let mut operation = raw.node_type;
    if let Some(join_type) = raw.join_type.filter(|j| j != "Inner") {
        operation = format!("{operation} ({join_type})");
    }

    let relation = match (raw.schema, raw.relation) {
        (Some(schema), Some(rel)) => Some(format!("{schema}.{rel}")),
        (None, Some(rel)) => Some(rel),
        (_, None) => raw.cte_name.or(raw.alias.filter(|_| kind == PlanNodeKind::Subquery)),
    };

    let condition = [raw.index_cond, raw.hash_cond, raw.merge_cond, raw.join_filter, raw.filter]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    let sort_keys = if raw.sort_key.is_empty() { raw.group_key } else { raw.sort_key };

    PlanNode {
        kind,
        operation,
        relation,
        index: raw.index,
        estimated_rows: raw.plan_rows,
        actual_rows: raw.actual_rows,
        estimated_cost: raw.total_cost,
        actual_time_ms: raw.actual_total_time,
        loops: raw.loops,
        condition: if condition.is_empty() { None } else { Some(condition.join(" AND ")) },
        sort_keys,
        children: raw.plans.into_iter().map(convert).collect(),
    }
}

/// Parse the JSON document returned by `EXPLAIN (FORMAT JSON ...)`
///
/// # Errors
/// `QueryExecution` when the document does not have the expected shape
pub fn parse_plan(document: &serde_json::Value) -> Result<Plan> {
    let entries: Vec<ExplainDocument> = serde_json::from_value(document.clone())
        .map_err(|e| DbLensError::query(format!("Unexpected EXPLAIN output: {e}")))?;
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| DbLensError::query("EXPLAIN returned an empty plan"))?;

    let mut plan = Plan::new(convert(entry.plan));
    plan.planning_time_ms = entry.planning_time;
    plan.execution_time_ms = entry.execution_time;
    Ok(plan)
}
