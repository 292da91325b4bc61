use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::intent::IntentCategory;
use super::output::ChartHints;
use super::sql::{SqlValue, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggregateFunction {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Min => "MIN",
        }
    }

    fn alias_prefix(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Max => "max",
            AggregateFunction::Min => "min",
        }
    }
}

/// Aggregate over a column, or over all rows when `column` is `None`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measure {
    pub function: AggregateFunction,
    pub column: Option<String>,
    pub alias: String,
}

impl Measure {
    pub fn new(function: AggregateFunction, column: Option<String>) -> Self {
        let alias = match &column {
            Some(c) => format!("{}_{}", function.alias_prefix(), c),
            None => format!("{}_all", function.alias_prefix()),
        };
        Self {
            function,
            column,
            alias,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGranularity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGranularity::Hour => "hour",
            TimeGranularity::Day => "day",
            TimeGranularity::Week => "week",
            TimeGranularity::Month => "month",
            TimeGranularity::Year => "year",
        }
    }
}

/// Grouping key; a granularity turns it into a truncated time bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub column: String,
    pub granularity: Option<TimeGranularity>,
}

impl Dimension {
    pub fn column(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            granularity: None,
        }
    }

    pub fn time_bucket(column: impl Into<String>, granularity: TimeGranularity) -> Self {
        Self {
            column: column.into(),
            granularity: Some(granularity),
        }
    }

    /// Name of the output column
    pub fn output_name(&self) -> String {
        match self.granularity {
            Some(g) => format!("{}_{}", self.column, g.as_str()),
            None => self.column.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "like")]
    Like,
}

impl FilterOperator {
    pub fn sql(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Ne => "<>",
            FilterOperator::Gt => ">",
            FilterOperator::Ge => ">=",
            FilterOperator::Lt => "<",
            FilterOperator::Le => "<=",
            FilterOperator::Like => "LIKE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "=" | "==" | "eq" => Some(FilterOperator::Eq),
            "!=" | "<>" | "ne" => Some(FilterOperator::Ne),
            ">" | "gt" => Some(FilterOperator::Gt),
            ">=" | "ge" => Some(FilterOperator::Ge),
            "<" | "lt" => Some(FilterOperator::Lt),
            "<=" | "le" => Some(FilterOperator::Le),
            "like" | "contains" => Some(FilterOperator::Like),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub operator: FilterOperator,
    pub value: SqlValue,
}

impl Filter {
    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }
}

/// Half-open interval `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub granularity: TimeGranularity,
    /// Relative expression the range came from, e.g. "昨天"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative: Option<String>,
}

impl TimeRange {
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Measure alias or dimension output name
    pub key: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Table,
    Column,
}

/// A name from the question that has no counterpart in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedEntity {
    pub kind: EntityKind,
    pub name: String,
    /// Where the name appeared: "table", "dimension", "measure", "time range"
    pub role: String,
}

impl UnresolvedEntity {
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Table,
            name: name.into(),
            role: "table".to_string(),
        }
    }

    pub fn column(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Column,
            name: name.into(),
            role: role.into(),
        }
    }
}

impl fmt::Display for UnresolvedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntityKind::Table => write!(f, "table '{}'", self.name),
            EntityKind::Column => write!(f, "column '{}' ({})", self.name, self.role),
        }
    }
}

/// Structured form of an analytical question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub intent: IntentCategory,
    pub table: Option<TableRef>,
    pub measures: Vec<Measure>,
    pub dimensions: Vec<Dimension>,
    pub filters: Vec<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    pub order_by: Vec<OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    pub unresolved_entities: Vec<UnresolvedEntity>,
}

impl QuerySpec {
    pub fn is_resolved(&self) -> bool {
        self.unresolved_entities.is_empty() && self.table.is_some()
    }

    /// Hints for the chart formatter derived from the spec shape
    pub fn chart_hints(&self) -> ChartHints {
        let temporal = self.dimensions.first().is_some_and(|d| {
            d.granularity.is_some() || self.time_column.as_deref() == Some(d.column.as_str())
        });
        ChartHints {
            dimensions: self.dimensions.iter().map(Dimension::output_name).collect(),
            measures: self.measures.iter().map(|m| m.alias.clone()).collect(),
            temporal_dimension: temporal,
            part_of_whole: self.intent == IntentCategory::Distribution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_aliases() {
        assert_eq!(Measure::new(AggregateFunction::Count, None).alias, "count_all");
        assert_eq!(
            Measure::new(AggregateFunction::Count, Some("order_id".into())).alias,
            "count_order_id"
        );
        assert_eq!(
            Measure::new(AggregateFunction::Sum, Some("amount".into())).alias,
            "sum_amount"
        );
    }

    #[test]
    fn test_dimension_output_name() {
        assert_eq!(Dimension::column("province").output_name(), "province");
        assert_eq!(
            Dimension::time_bucket("created_at", TimeGranularity::Month).output_name(),
            "created_at_month"
        );
    }

    #[test]
    fn test_filter_operator_parse() {
        assert_eq!(FilterOperator::parse(">="), Some(FilterOperator::Ge));
        assert_eq!(FilterOperator::parse("contains"), Some(FilterOperator::Like));
        assert_eq!(FilterOperator::parse("~"), None);
    }
}
