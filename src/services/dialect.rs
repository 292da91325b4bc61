// SQL dialect rules
//
// Per-dialect identifier quoting, time truncation, timestamp parameters and
// row limiting for the statements the generator emits.

use crate::models::{SqlDialect, TableRef, TimeGranularity};

/// SQL features that differ across dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlFeature {
    /// LIMIT n
    LimitClause,
    /// FETCH FIRST n ROWS ONLY
    FetchFirst,
    /// Backtick-quoted identifiers
    BacktickIdentifiers,
    /// Double-quoted identifiers
    DoubleQuotedIdentifiers,
    /// database.table references
    QualifiedTables,
    /// Backslash escapes inside string literals
    BackslashEscapes,
}

const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "count", "current_date", "date",
    "day", "default", "desc", "distinct", "else", "end", "from", "function", "group",
    "having", "hour", "in", "interval", "is", "join", "like", "limit", "month", "not",
    "null", "on", "or", "order", "over", "partition", "range", "rows", "select", "table",
    "then", "time", "timestamp", "union", "user", "values", "when", "where", "window",
    "year",
];

/// Rules the generator consults for one dialect
pub trait DialectRules: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    fn quote_char(&self) -> char;

    /// Check if a specific SQL feature is supported in this dialect
    fn supports_feature(&self, feature: SqlFeature) -> bool;

    /// Timestamp comparison operand for a `?` placeholder
    fn timestamp_param(&self) -> &'static str;

    /// Expression truncating a time column to a bucket
    fn truncate_time(&self, column: &str, granularity: TimeGranularity) -> String;

    fn limit_clause(&self, n: u64) -> String {
        if self.supports_feature(SqlFeature::LimitClause) {
            format!("LIMIT {}", n)
        } else {
            format!("FETCH FIRST {} ROWS ONLY", n)
        }
    }

    /// Quote only identifiers that need it
    fn quote_identifier(&self, ident: &str) -> String {
        let plain = ident
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
            && ident
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if plain && !RESERVED.contains(&ident) {
            return ident.to_string();
        }
        let q = self.quote_char();
        let escaped = ident.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    fn qualify_table(&self, table: &TableRef) -> String {
        match &table.database {
            Some(db) if self.supports_feature(SqlFeature::QualifiedTables) => format!(
                "{}.{}",
                self.quote_identifier(db),
                self.quote_identifier(&table.name)
            ),
            _ => self.quote_identifier(&table.name),
        }
    }
}

pub struct HiveRules;

impl DialectRules for HiveRules {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Hive
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn supports_feature(&self, feature: SqlFeature) -> bool {
        match feature {
            SqlFeature::LimitClause => true,
            SqlFeature::FetchFirst => false,
            SqlFeature::BacktickIdentifiers => true,
            SqlFeature::DoubleQuotedIdentifiers => false,
            SqlFeature::QualifiedTables => true,
            SqlFeature::BackslashEscapes => true,
        }
    }

    fn timestamp_param(&self) -> &'static str {
        "CAST(? AS TIMESTAMP)"
    }

    fn truncate_time(&self, column: &str, granularity: TimeGranularity) -> String {
        match granularity {
            TimeGranularity::Hour => format!(
                "from_unixtime(unix_timestamp({}), 'yyyy-MM-dd HH:00:00')",
                column
            ),
            TimeGranularity::Day => format!("to_date({})", column),
            // 1900-01-01 was a Monday
            TimeGranularity::Week => format!(
                "date_sub(to_date({c}), pmod(datediff(to_date({c}), '1900-01-01'), 7))",
                c = column
            ),
            TimeGranularity::Month => format!("trunc({}, 'MM')", column),
            TimeGranularity::Year => format!("trunc({}, 'YYYY')", column),
        }
    }
}

pub struct SparkSqlRules;

impl DialectRules for SparkSqlRules {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::SparkSql
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn supports_feature(&self, feature: SqlFeature) -> bool {
        match feature {
            SqlFeature::LimitClause => true,
            SqlFeature::FetchFirst => false,
            SqlFeature::BacktickIdentifiers => true,
            SqlFeature::DoubleQuotedIdentifiers => false,
            SqlFeature::QualifiedTables => true,
            SqlFeature::BackslashEscapes => true,
        }
    }

    fn timestamp_param(&self) -> &'static str {
        "to_timestamp(?)"
    }

    fn truncate_time(&self, column: &str, granularity: TimeGranularity) -> String {
        let unit = match granularity {
            TimeGranularity::Hour => "HOUR",
            TimeGranularity::Day => "DAY",
            TimeGranularity::Week => "WEEK",
            TimeGranularity::Month => "MONTH",
            TimeGranularity::Year => "YEAR",
        };
        format!("date_trunc('{}', {})", unit, column)
    }
}

pub struct PrestoRules;

impl DialectRules for PrestoRules {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Presto
    }

    fn quote_char(&self) -> char {
        '"'
    }

    fn supports_feature(&self, feature: SqlFeature) -> bool {
        match feature {
            SqlFeature::LimitClause => false,
            SqlFeature::FetchFirst => true,
            SqlFeature::BacktickIdentifiers => false,
            SqlFeature::DoubleQuotedIdentifiers => true,
            SqlFeature::QualifiedTables => false,
            SqlFeature::BackslashEscapes => false,
        }
    }

    fn timestamp_param(&self) -> &'static str {
        "CAST(? AS TIMESTAMP)"
    }

    fn truncate_time(&self, column: &str, granularity: TimeGranularity) -> String {
        format!("date_trunc('{}', {})", granularity.as_str(), column)
    }
}

static HIVE: HiveRules = HiveRules;
static SPARK: SparkSqlRules = SparkSqlRules;
static PRESTO: PrestoRules = PrestoRules;

pub fn rules_for(dialect: SqlDialect) -> &'static dyn DialectRules {
    match dialect {
        SqlDialect::Hive => &HIVE,
        SqlDialect::SparkSql => &SPARK,
        SqlDialect::Presto => &PRESTO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting_only_when_needed() {
        let hive = rules_for(SqlDialect::Hive);
        assert_eq!(hive.quote_identifier("province"), "province");
        assert_eq!(hive.quote_identifier("date"), "`date`");
        assert_eq!(hive.quote_identifier("Order Total"), "`Order Total`");
        assert_eq!(hive.quote_identifier("a`b"), "`a``b`");

        let presto = rules_for(SqlDialect::Presto);
        assert_eq!(presto.quote_identifier("user"), "\"user\"");
    }

    #[test]
    fn test_table_qualification() {
        let table = TableRef {
            name: "users".to_string(),
            database: Some("dw".to_string()),
        };
        assert_eq!(rules_for(SqlDialect::Hive).qualify_table(&table), "dw.users");
        assert_eq!(rules_for(SqlDialect::SparkSql).qualify_table(&table), "dw.users");
        assert_eq!(rules_for(SqlDialect::Presto).qualify_table(&table), "users");
    }

    #[test]
    fn test_limit_clause() {
        assert_eq!(rules_for(SqlDialect::Hive).limit_clause(5), "LIMIT 5");
        assert_eq!(
            rules_for(SqlDialect::Presto).limit_clause(5),
            "FETCH FIRST 5 ROWS ONLY"
        );
    }

    #[test]
    fn test_time_truncation() {
        assert_eq!(
            rules_for(SqlDialect::Hive).truncate_time("created_at", TimeGranularity::Day),
            "to_date(created_at)"
        );
        assert_eq!(
            rules_for(SqlDialect::SparkSql).truncate_time("created_at", TimeGranularity::Month),
            "date_trunc('MONTH', created_at)"
        );
        assert_eq!(
            rules_for(SqlDialect::Presto).truncate_time("created_at", TimeGranularity::Week),
            "date_trunc('week', created_at)"
        );
    }

    #[test]
    fn test_feature_flags_are_consistent() {
        for dialect in [SqlDialect::Hive, SqlDialect::SparkSql, SqlDialect::Presto] {
            let rules = rules_for(dialect);
            assert_eq!(rules.dialect(), dialect);
            assert_ne!(
                rules.supports_feature(SqlFeature::LimitClause),
                rules.supports_feature(SqlFeature::FetchFirst)
            );
            assert_ne!(
                rules.supports_feature(SqlFeature::BacktickIdentifiers),
                rules.supports_feature(SqlFeature::DoubleQuotedIdentifiers)
            );
        }
    }
}
