//! `MySQL`/`MariaDB` plans → canonical plan tree
//!
//! Two inputs are understood:
//! - `EXPLAIN FORMAT=JSON` (both servers) and `ANALYZE FORMAT=JSON`
//!   (`MariaDB`, adds `r_*` actuals). Joins appear as a flat `nested_loop`
//!   array, which is folded into a left-deep tree of join nodes.
//! - `EXPLAIN ANALYZE` (`MySQL` 8.0.18+), an indented text tree with
//!   `(cost=.. rows=..) (actual time=.. rows=.. loops=..)` annotations.

use serde_json::Value;

use crate::error::{DbLensError, Result};
use crate::plan::{JoinStrategy, Plan, PlanNode, PlanNodeKind};

// ---------------------------------------------------------------------------
// JSON format
// ---------------------------------------------------------------------------

/// Costs are strings in `MySQL` ("1.25") and numbers in `MariaDB`
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn wrap(kind: PlanNodeKind, operation: &str, child: Option<PlanNode>) -> PlanNode {
    PlanNode::new(kind, operation).with_children(child.into_iter().collect())
}

fn access_label(access: &str) -> &str {
    match access {
        "ALL" => "Full table scan",
        "index" => "Full index scan",
        "range" => "Index range scan",
        "ref" | "ref_or_null" => "Index lookup",
        "eq_ref" => "Unique index lookup",
        "const" | "system" => "Constant lookup",
        "fulltext" => "Full-text index search",
        "index_merge" => "Index merge",
        "unique_subquery" | "index_subquery" => "Subquery index lookup",
        other => other,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn convert_table(table: &Value) -> PlanNode {
    let name = text(table, "table_name");
    let access = text(table, "access_type").unwrap_or_default();
    let derived = name.is_some_and(|n| n.starts_with("<derived") || n.starts_with("<subquery"));
    let temporary = name.is_some_and(|n| n.starts_with("<union") || n.starts_with("<temporary"));

    let kind = if derived {
        PlanNodeKind::Subquery
    } else if temporary {
        PlanNodeKind::Temporary
    } else {
        match access {
            "" => PlanNodeKind::Other,
            "ALL" => PlanNodeKind::FullScan,
            _ if flag(table, "using_index") => PlanNodeKind::IndexOnlyScan,
            _ => PlanNodeKind::IndexScan,
        }
    };

    let mut node = PlanNode::new(kind, access_label(access));
    node.relation = name.map(str::to_string);
    node.index = text(table, "key").map(str::to_string);
    node.estimated_rows =
        number(table.get("rows_examined_per_scan")).or_else(|| number(table.get("rows")));
    node.actual_rows = number(table.get("r_rows"));
    node.loops = number(table.get("r_loops")).map(|l| l as u64);
    node.actual_time_ms = number(table.get("r_total_time_ms"));
    node.estimated_cost = table
        .get("cost_info")
        .and_then(|c| number(c.get("prefix_cost")).or_else(|| number(c.get("read_cost"))))
        .or_else(|| number(table.get("cost")));
    node.condition = text(table, "attached_condition").map(str::to_string);

    if let Some(block) = table.get("materialized_from_subquery").and_then(|m| m.get("query_block")) {
        node.children.extend(convert_block(block));
    }
    for key in ["attached_subqueries", "optimized_away_subqueries"] {
        for sub in table.get(key).and_then(Value::as_array).into_iter().flatten() {
            if let Some(block) = sub.get("query_block") {
                node.children.push(wrap(PlanNodeKind::Subquery, "Subquery", convert_block(block)));
            }
        }
    }
    node
}

fn join_strategy(table: &Value, block_join: Option<&Value>) -> JoinStrategy {
    // MariaDB: block-nl-join.join_type BNL / BNLH / BKA / BKAH
    if let Some(join_type) = block_join.and_then(|b| text(b, "join_type")) {
        return if join_type.ends_with('H') { JoinStrategy::Hash } else { JoinStrategy::NestedLoop };
    }
    match text(table, "using_join_buffer") {
        Some(buffer) if buffer.to_ascii_lowercase().contains("hash") => JoinStrategy::Hash,
        _ => JoinStrategy::NestedLoop,
    }
}

/// Fold `[t1, t2, t3]` into `join(join(t1, t2), t3)`
fn convert_nested_loop(entries: &[Value]) -> Option<PlanNode> {
    let mut tree: Option<PlanNode> = None;

    for entry in entries {
        let (node, strategy, produced) = if let Some(table) = entry.get("table") {
            let produced = number(table.get("rows_produced_per_join"));
            (convert_table(table), join_strategy(table, None), produced)
        } else if let Some(block_join) = entry.get("block-nl-join") {
            let Some(table) = block_join.get("table") else { continue };
            let mut node = convert_table(table);
            if node.condition.is_none() {
                node.condition = text(block_join, "attached_condition").map(str::to_string);
            }
            (node, join_strategy(table, Some(block_join)), None)
        } else {
            let Some(node) = convert_block(entry) else { continue };
            (node, JoinStrategy::NestedLoop, None)
        };

        tree = Some(match tree {
            None => node,
            Some(left) => {
                let mut join = PlanNode::new(PlanNodeKind::Join { strategy }, strategy.as_str());
                join.estimated_rows = produced;
                join.estimated_cost = node.estimated_cost;
                join.actual_rows = node.actual_rows;
                join.with_children(vec![left, node])
            }
        });
    }
    tree
}

fn convert_block(block: &Value) -> Option<PlanNode> {
    // MySQL wrappers
    if let Some(op) = block.get("ordering_operation") {
        let mut child = convert_block(op);
        if flag(op, "using_temporary_table") {
            child = Some(wrap(PlanNodeKind::Temporary, "Temporary table", child));
        }
        return if flag(op, "using_filesort") {
            Some(wrap(PlanNodeKind::Sort, "Sort", child))
        } else {
            child
        };
    }
    if let Some(op) = block.get("grouping_operation") {
        let mut child = convert_block(op);
        if flag(op, "using_filesort") {
            child = Some(wrap(PlanNodeKind::Sort, "Sort", child));
        }
        if flag(op, "using_temporary_table") {
            child = Some(wrap(PlanNodeKind::Temporary, "Temporary table", child));
        }
        return Some(wrap(PlanNodeKind::Aggregate, "Group", child));
    }
    if let Some(op) = block.get("duplicates_removal") {
        return Some(wrap(PlanNodeKind::Aggregate, "Duplicates removal", convert_block(op)));
    }
    if let Some(op) = block.get("windowing") {
        return Some(wrap(PlanNodeKind::Aggregate, "Window", convert_block(op)));
    }

    // MariaDB wrappers
    if let Some(op) = block.get("read_sorted_file") {
        return convert_block(op);
    }
    if let Some(op) = block.get("filesort") {
        let mut sort = wrap(PlanNodeKind::Sort, "Sort", convert_block(op));
        sort.sort_keys = text(op, "sort_key")
            .map(|keys| keys.split(", ").map(str::to_string).collect())
            .unwrap_or_default();
        sort.actual_rows = number(op.get("r_output_rows"));
        return Some(sort);
    }
    if let Some(op) = block.get("temporary_table") {
        return Some(wrap(PlanNodeKind::Temporary, "Temporary table", convert_block(op)));
    }

    if let Some(union) = block.get("union_result") {
        let mut node = convert_table(union);
        node.kind = PlanNodeKind::SetOperation;
        node.operation = "Union".to_string();
        for spec in union.get("query_specifications").and_then(Value::as_array).into_iter().flatten() {
            if let Some(child) = spec.get("query_block").and_then(convert_block) {
                node.children.push(child);
            }
        }
        return Some(node);
    }

    let mut node = if let Some(entries) = block.get("nested_loop").and_then(Value::as_array) {
        convert_nested_loop(entries)?
    } else if let Some(table) = block.get("table") {
        convert_table(table)
    } else if let Some(message) = text(block, "message") {
        PlanNode::new(PlanNodeKind::Other, message)
    } else {
        return None;
    };

    // MariaDB lists subqueries next to the outer block
    for sub in block.get("subqueries").and_then(Value::as_array).into_iter().flatten() {
        if let Some(inner) = sub.get("query_block") {
            node.children.push(wrap(PlanNodeKind::Subquery, "Subquery", convert_block(inner)));
        }
    }
    Some(node)
}

/// Parse an `EXPLAIN FORMAT=JSON` / `ANALYZE FORMAT=JSON` document
///
/// # Errors
/// `QueryExecution` when the text is not a plan document
pub fn parse_json_plan(document: &str) -> Result<Plan> {
    let value: Value = serde_json::from_str(document)
        .map_err(|e| DbLensError::query(format!("Unexpected EXPLAIN output: {e}")))?;
    let block = value
        .get("query_block")
        .ok_or_else(|| DbLensError::query("EXPLAIN output has no query_block"))?;

    let total_cost = block
        .get("cost_info")
        .and_then(|c| number(c.get("query_cost")))
        .or_else(|| number(block.get("cost")));

    let mut root =
        convert_block(block).unwrap_or_else(|| PlanNode::new(PlanNodeKind::Other, "Query block"));
    if root.estimated_cost.is_none() {
        root.estimated_cost = total_cost;
    }

    let mut plan = Plan::new(root);
    plan.total_cost = total_cost.or(plan.total_cost);
    plan.execution_time_ms = number(block.get("r_total_time_ms"));
    Ok(plan)
}

// ---------------------------------------------------------------------------
// EXPLAIN ANALYZE tree format
// ---------------------------------------------------------------------------

fn get_indent(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Contents of the parenthesised group starting with `prefix`
fn extract_group<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let start = s.find(prefix)? + prefix.len();
    let end = s[start..].find(')')? + start;
    Some(&s[start..end])
}

fn field<'a>(group: &'a str, key: &str) -> Option<&'a str> {
    group.split_whitespace().find_map(|part| part.strip_prefix(key))
}

/// `0.04..2.8` → 2.8
fn upper_bound(range: &str) -> Option<f64> {
    range.rsplit("..").next()?.parse().ok()
}

/// Word following `marker`, e.g. the table after " on "
fn word_after<'a>(s: &'a str, marker: &str) -> Option<&'a str> {
    let start = s.find(marker)? + marker.len();
    s[start..].split_whitespace().next()
}

/// Text inside the last top-level parentheses of a label
fn trailing_parens(s: &str) -> Option<&str> {
    let s = s.trim_end();
    if !s.ends_with(')') {
        return None;
    }
    let mut depth = 0i32;
    for (i, ch) in s.char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[i + 1..s.len() - 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn classify_label(label: &str) -> PlanNode {
    let lower = label.to_ascii_lowercase();
    let relation = word_after(label, " on ").map(str::to_string);
    let index = word_after(label, " using ").map(str::to_string);

    let scan = |kind: PlanNodeKind, operation: &str| {
        let mut node = PlanNode::new(kind, operation);
        node.relation.clone_from(&relation);
        node.index.clone_from(&index);
        node
    };

    if lower.starts_with("table scan on ") {
        let temporary = relation.as_deref().is_some_and(|r| r.starts_with('<'));
        let kind = if temporary { PlanNodeKind::Temporary } else { PlanNodeKind::FullScan };
        return scan(kind, "Table scan");
    }
    if lower.contains("index scan on ")
        || lower.contains("index lookup on ")
        || lower.contains("index range scan on ")
        || lower.contains("index skip scan on ")
        || lower.contains("index search on ")
    {
        let kind = if lower.starts_with("covering") {
            PlanNodeKind::IndexOnlyScan
        } else {
            PlanNodeKind::IndexScan
        };
        let operation = label.split(" on ").next().unwrap_or(label).to_string();
        let mut node = scan(kind, &operation);
        node.condition = label
            .split(" using ")
            .nth(1)
            .and_then(trailing_parens)
            .map(str::to_string);
        return node;
    }
    if lower.contains("hash join")
        || lower.contains("hash semijoin")
        || lower.contains("hash antijoin")
    {
        let mut node = PlanNode::new(PlanNodeKind::Join { strategy: JoinStrategy::Hash }, label);
        if let Some(condition) = trailing_parens(label) {
            node.operation = label[..label.len() - condition.len() - 2].trim().to_string();
            node.condition = Some(condition.to_string());
        }
        return node;
    }
    if lower.starts_with("nested loop") {
        return PlanNode::new(PlanNodeKind::Join { strategy: JoinStrategy::NestedLoop }, label);
    }
    if let Some(keys) = label.strip_prefix("Sort: ") {
        let mut node = PlanNode::new(PlanNodeKind::Sort, "Sort");
        node.sort_keys = keys
            .split(", ")
            .map(str::trim)
            .filter(|k| !k.is_empty() && !k.starts_with("limit input to"))
            .map(str::to_string)
            .collect();
        return node;
    }
    if lower.starts_with("sort") {
        return PlanNode::new(PlanNodeKind::Sort, label);
    }
    if let Some(condition) = label.strip_prefix("Filter: ") {
        let mut node = PlanNode::new(PlanNodeKind::Filter, "Filter");
        node.condition = Some(condition.to_string());
        return node;
    }
    if lower.starts_with("limit") {
        return PlanNode::new(PlanNodeKind::Limit, label);
    }
    if lower.starts_with("aggregate")
        || lower.starts_with("group aggregate")
        || lower.starts_with("group (no aggregates)")
        || lower.starts_with("window")
        || lower.starts_with("remove duplicates")
    {
        return PlanNode::new(PlanNodeKind::Aggregate, label);
    }
    if lower.starts_with("union") || lower.starts_with("append") || lower.starts_with("intersect")
        || lower.starts_with("except")
    {
        return PlanNode::new(PlanNodeKind::SetOperation, label);
    }
    if lower.starts_with("materialize") || lower == "hash" {
        return PlanNode::new(PlanNodeKind::Materialize, label);
    }
    if lower.starts_with("temporary table") {
        return PlanNode::new(PlanNodeKind::Temporary, label);
    }
    if lower.starts_with("select #") {
        return PlanNode::new(PlanNodeKind::Subquery, label);
    }
    PlanNode::new(PlanNodeKind::Other, label)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_tree_header(content: &str) -> PlanNode {
    let split = [" (cost=", " (actual time=", " (never executed)"]
        .iter()
        .filter_map(|marker| content.find(marker))
        .min()
        .unwrap_or(content.len());
    let (label, metrics) = content.split_at(split);

    let mut node = classify_label(label.trim());

    if let Some(cost) = extract_group(metrics, "(cost=") {
        node.estimated_cost = cost.split_whitespace().next().and_then(upper_bound);
        node.estimated_rows = field(cost, "rows=").and_then(|r| r.parse().ok());
    }
    if let Some(actual) = extract_group(metrics, "(actual time=") {
        node.actual_time_ms = actual.split_whitespace().next().and_then(upper_bound);
        node.actual_rows = field(actual, "rows=").and_then(|r| r.parse().ok());
        node.loops = field(actual, "loops=").and_then(|l| l.parse::<f64>().ok()).map(|l| l as u64);
    } else if metrics.contains("(never executed)") {
        node.actual_rows = Some(0.0);
        node.loops = Some(0);
    }
    node
}

fn parse_tree_node(lines: &[&str], start: usize) -> (Option<PlanNode>, usize) {
    let Some(first) = lines.get(start) else {
        return (None, start);
    };
    let node_indent = get_indent(first);
    let mut node = parse_tree_header(first.trim().trim_start_matches("-> "));

    let mut idx = start + 1;
    while idx < lines.len() {
        let line = lines[idx];
        if get_indent(line) <= node_indent {
            break;
        }
        if line.trim_start().starts_with("-> ") {
            let (child, next_idx) = parse_tree_node(lines, idx);
            node.children.extend(child);
            idx = next_idx;
        } else {
            // Wrapped continuation of the header
            idx += 1;
        }
    }
    (Some(node), idx)
}

/// Parse `EXPLAIN ANALYZE` tree output
///
/// # Errors
/// `QueryExecution` when the output contains no plan lines
pub fn parse_tree_plan(output: &str) -> Result<Plan> {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let (root, _) = parse_tree_node(&lines, 0);
    let root = root.ok_or_else(|| DbLensError::query("EXPLAIN ANALYZE returned an empty plan"))?;

    let mut plan = Plan::new(root);
    plan.execution_time_ms = plan.root.actual_time_ms;
    Ok(plan)
}
