use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Target SQL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Hive,
    #[serde(rename = "sparksql")]
    SparkSql,
    Presto,
}

impl SqlDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlDialect::Hive => "hive",
            SqlDialect::SparkSql => "sparksql",
            SqlDialect::Presto => "presto",
        }
    }
}

impl FromStr for SqlDialect {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hive" | "hiveql" => Ok(SqlDialect::Hive),
            "spark" | "sparksql" | "spark_sql" => Ok(SqlDialect::SparkSql),
            "presto" | "trino" => Ok(SqlDialect::Presto),
            _ => Err(PipelineError::Config(format!("Unknown SQL dialect '{}'", s))),
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type tag of a bound value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Integer,
    Float,
    Text,
    Boolean,
    Date,
    Timestamp,
}

/// Value bound to a `?` placeholder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SqlValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            SqlValue::Integer(_) => ValueType::Integer,
            SqlValue::Float(_) => ValueType::Float,
            SqlValue::Text(_) => ValueType::Text,
            SqlValue::Boolean(_) => ValueType::Boolean,
            SqlValue::Date(_) => ValueType::Date,
            SqlValue::Timestamp(_) => ValueType::Timestamp,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Integer(v) => write!(f, "{}", v),
            SqlValue::Float(v) => write!(f, "{}", v),
            SqlValue::Text(v) => f.write_str(v),
            SqlValue::Boolean(v) => write!(f, "{}", v),
            SqlValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            SqlValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// Rough cost class of a generated statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityClass {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityClass {
    /// Score is `2 * joins + aggregations`, where a GROUP BY counts as one aggregation.
    pub fn from_score(score: usize) -> Self {
        match score {
            0..=1 => ComplexityClass::Simple,
            2..=3 => ComplexityClass::Moderate,
            _ => ComplexityClass::Complex,
        }
    }

    /// Resource multiplier applied by the task builder
    pub fn resource_factor(&self) -> u64 {
        match self {
            ComplexityClass::Simple => 1,
            ComplexityClass::Moderate => 2,
            ComplexityClass::Complex => 4,
        }
    }
}

/// A parameterised statement ready for dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlStatement {
    pub dialect: SqlDialect,
    pub text: String,
    pub params: Vec<SqlValue>,
    pub complexity: ComplexityClass,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_parsing() {
        assert_eq!("SparkSQL".parse::<SqlDialect>().unwrap(), SqlDialect::SparkSql);
        assert_eq!("trino".parse::<SqlDialect>().unwrap(), SqlDialect::Presto);
        assert!("mysql".parse::<SqlDialect>().is_err());
    }

    #[test]
    fn test_complexity_thresholds() {
        assert_eq!(ComplexityClass::from_score(0), ComplexityClass::Simple);
        assert_eq!(ComplexityClass::from_score(1), ComplexityClass::Simple);
        assert_eq!(ComplexityClass::from_score(2), ComplexityClass::Moderate);
        assert_eq!(ComplexityClass::from_score(3), ComplexityClass::Moderate);
        assert_eq!(ComplexityClass::from_score(6), ComplexityClass::Complex);
    }

    #[test]
    fn test_value_serializes_with_type_tag() {
        let json = serde_json::to_value(SqlValue::Integer(3)).unwrap();
        assert_eq!(json["type"], "integer");
        assert_eq!(json["value"], 3);
    }
}
