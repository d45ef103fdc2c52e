//! Structural complexity scoring.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Coarse complexity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Highest score still classified as low
pub const LOW_MAX: u32 = 3;
/// Highest score still classified as medium
pub const MEDIUM_MAX: u32 = 8;

/// Constructs counted for the score
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityFactors {
    pub joins: u32,
    pub subqueries: u32,
    pub ctes: u32,
    pub set_operations: u32,
    pub grouping: bool,
    pub ordering: bool,
    pub distinct: bool,
    pub window_functions: u32,
}

impl ComplexityFactors {
    /// Weighted sum of the factors
    #[must_use]
    pub fn score(&self) -> u32 {
        self.joins * 2
            + self.subqueries * 3
            + self.ctes * 2
            + self.set_operations * 2
            + u32::from(self.grouping)
            + u32::from(self.ordering)
            + u32::from(self.distinct)
            + self.window_functions * 3
    }
}

#[must_use]
pub const fn tier(score: u32) -> Complexity {
    if score <= LOW_MAX {
        Complexity::Low
    } else if score <= MEDIUM_MAX {
        Complexity::Medium
    } else {
        Complexity::High
    }
}

static JOIN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bJOIN\b").expect("valid regex"));
static SUBQUERY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\(\s*SELECT\b").expect("valid regex"));
static CTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bAS\s+(?:NOT\s+)?(?:MATERIALIZED\s+)?\(\s*(?:SELECT|WITH|VALUES|INSERT|UPDATE|DELETE)\b")
        .expect("valid regex")
});
static SET_OPERATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:UNION|INTERSECT|EXCEPT)\b").expect("valid regex"));
static GROUPING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bGROUP\s+BY\b").expect("valid regex"));
static ORDERING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bORDER\s+BY\b").expect("valid regex"));
static DISTINCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bDISTINCT\b").expect("valid regex"));
static WINDOW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bOVER\s*(?:\(|[A-Za-z_])").expect("valid regex"));

/// Count the scored constructs in masked SQL
pub(crate) fn measure(masked: &str) -> ComplexityFactors {
    let starts_with_cte = masked.trim_start().get(..4).is_some_and(|w| w.eq_ignore_ascii_case("WITH"));
    let count = |re: &Regex| u32::try_from(re.find_iter(masked).count()).unwrap_or(u32::MAX);

    ComplexityFactors {
        joins: count(&JOIN),
        subqueries: count(&SUBQUERY),
        ctes: if starts_with_cte { count(&CTE) } else { 0 },
        set_operations: count(&SET_OPERATION),
        grouping: GROUPING.is_match(masked),
        ordering: ORDERING.is_match(masked),
        distinct: DISTINCT.is_match(masked),
        window_functions: count(&WINDOW),
    }
}
