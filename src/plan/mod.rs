//! Canonical Execution Plans
//!
//! Every adapter translates its engine's native EXPLAIN output (tree-shaped
//! JSON, nested tabular JSON or flat parent-linked rows) into the [`PlanNode`]
//! tree defined here. The tree is built bottom-up from the engine's own output
//! and owns its children, so it cannot contain cycles.
//!
//! Consumers walk the tree through [`PlanVisitor`]; the recommendation engine
//! in [`recommend`] is one such visitor.

pub mod recommend;

use serde::{Deserialize, Serialize};

use crate::engine::DatabaseType;

pub use recommend::{recommend, Recommendation, RecommendationCode, RecommendationConfig};

/// Physical join algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    NestedLoop,
    Hash,
    Merge,
}

impl JoinStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NestedLoop => "nested loop",
            Self::Hash => "hash join",
            Self::Merge => "merge join",
        }
    }
}

/// Engine-independent operation category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanNodeKind {
    /// Sequential / full table scan
    FullScan,
    IndexScan,
    /// Index lookup that never visits the table
    IndexOnlyScan,
    Join {
        strategy: JoinStrategy,
    },
    Sort,
    Aggregate,
    /// Temporary structure (B-tree, temp table) built to satisfy grouping or distinct
    Temporary,
    Filter,
    Limit,
    SetOperation,
    Subquery,
    Materialize,
    Other,
}

impl PlanNodeKind {
    #[must_use]
    pub const fn is_scan(self) -> bool {
        matches!(self, Self::FullScan | Self::IndexScan | Self::IndexOnlyScan)
    }
}

/// One operation of an execution plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    #[serde(flatten)]
    pub kind: PlanNodeKind,

    /// Engine's own label for the operation ("Seq Scan", "SCAN users", ...)
    pub operation: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_rows: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_time_ms: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub loops: Option<u64>,

    /// Filter, join or index condition text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort_keys: Vec<String>,

    /// Children in the order the engine reported them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    #[must_use]
    pub fn new(kind: PlanNodeKind, operation: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            relation: None,
            index: None,
            estimated_rows: None,
            actual_rows: None,
            estimated_cost: None,
            actual_time_ms: None,
            loops: None,
            condition: None,
            sort_keys: Vec::new(),
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    #[must_use]
    pub fn with_children(mut self, children: Vec<Self>) -> Self {
        self.children = children;
        self
    }

    /// Row figure used by threshold rules: actual when measured, else estimated
    #[must_use]
    pub fn observed_rows(&self) -> Option<f64> {
        self.actual_rows.or(self.estimated_rows)
    }

    /// Pre-order traversal
    pub fn walk<V: PlanVisitor + ?Sized>(&self, visitor: &mut V) {
        self.walk_at(0, visitor);
    }

    fn walk_at<V: PlanVisitor + ?Sized>(&self, depth: usize, visitor: &mut V) {
        visitor.visit(self, depth);
        for child in &self.children {
            child.walk_at(depth + 1, visitor);
        }
    }

    /// Total number of nodes in this subtree
    #[must_use]
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Self::node_count).sum::<usize>()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(Self::depth).max().unwrap_or(0)
    }
}

/// Callback for [`PlanNode::walk`]
pub trait PlanVisitor {
    fn visit(&mut self, node: &PlanNode, depth: usize);
}

impl<F: FnMut(&PlanNode, usize)> PlanVisitor for F {
    fn visit(&mut self, node: &PlanNode, depth: usize) {
        self(node, depth);
    }
}

/// Normalized plan with whole-statement figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub root: PlanNode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub planning_time_ms: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
}

impl Plan {
    #[must_use]
    pub fn new(root: PlanNode) -> Self {
        let total_cost = root.estimated_cost;
        Self { root, total_cost, planning_time_ms: None, execution_time_ms: None }
    }
}

/// Result of `explain`: the normalized plan plus advisory recommendations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainReport {
    pub engine: DatabaseType,
    /// True when the statement was executed and actual figures are present
    pub analyzed: bool,
    pub plan: Plan,
    pub recommendations: Vec<Recommendation>,
}

impl ExplainReport {
    /// Run the engine's recommendation preset over `plan`
    #[must_use]
    pub fn build(engine: DatabaseType, analyzed: bool, plan: Plan) -> Self {
        let recommendations = recommend(&plan.root, &RecommendationConfig::for_engine(engine));
        Self { engine, analyzed, plan, recommendations }
    }
}
