// SQL generation from a resolved QuerySpec
//
// Clause order is fixed: SELECT (measures, then dimensions) -> FROM -> WHERE
// (filters in QuerySpec order, then the time range) -> GROUP BY -> ORDER BY -> LIMIT.
// Every literal goes into `params`; the text only ever carries `?`.

use tracing::debug;

use crate::error::PipelineError;
use crate::models::{
    ComplexityClass, Dimension, Measure, QuerySpec, SqlDialect, SqlStatement, SqlValue,
    UnresolvedEntity,
};
use crate::services::dialect::{rules_for, DialectRules};
use crate::validation::SqlValidator;

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlGenerator;

impl SqlGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(
        &self,
        spec: &QuerySpec,
        dialect: SqlDialect,
    ) -> Result<SqlStatement, PipelineError> {
        if !spec.unresolved_entities.is_empty() {
            return Err(PipelineError::SchemaResolution(
                spec.unresolved_entities.clone(),
            ));
        }
        let table = spec.table.as_ref().ok_or_else(|| {
            PipelineError::SchemaResolution(vec![UnresolvedEntity::table("(none)")])
        })?;
        if spec.measures.is_empty() && spec.dimensions.is_empty() {
            return Err(PipelineError::Analysis(
                "Nothing to select: no measure and no dimension".to_string(),
            ));
        }

        let rules = rules_for(dialect);
        let mut params = Vec::new();
        let mut clauses = Vec::with_capacity(6);

        // SELECT
        let mut select_items: Vec<String> = spec
            .measures
            .iter()
            .map(|m| measure_expr(rules, m))
            .collect();
        for dim in &spec.dimensions {
            let expr = dimension_expr(rules, dim);
            if dim.granularity.is_some() {
                select_items.push(format!(
                    "{} AS {}",
                    expr,
                    rules.quote_identifier(&dim.output_name())
                ));
            } else {
                select_items.push(expr);
            }
        }
        clauses.push(format!("SELECT {}", select_items.join(", ")));

        // FROM
        clauses.push(format!("FROM {}", rules.qualify_table(table)));

        // WHERE
        let mut predicates = Vec::new();
        for filter in &spec.filters {
            predicates.push(format!(
                "{} {} ?",
                rules.quote_identifier(&filter.column),
                filter.operator.sql()
            ));
            params.push(filter.value.clone());
        }
        if let Some(range) = &spec.time_range {
            let column = spec.time_column.as_deref().ok_or_else(|| {
                PipelineError::SchemaResolution(vec![UnresolvedEntity::column(
                    "(time column)",
                    "time range",
                )])
            })?;
            let column = rules.quote_identifier(column);
            predicates.push(format!("{} >= {}", column, rules.timestamp_param()));
            predicates.push(format!("{} < {}", column, rules.timestamp_param()));
            params.push(SqlValue::Timestamp(range.start));
            params.push(SqlValue::Timestamp(range.end));
        }
        if !predicates.is_empty() {
            clauses.push(format!("WHERE {}", predicates.join(" AND ")));
        }

        // GROUP BY repeats the expressions; Hive rejects select aliases here
        let grouped = !spec.dimensions.is_empty();
        if grouped {
            let keys: Vec<String> = spec
                .dimensions
                .iter()
                .map(|d| dimension_expr(rules, d))
                .collect();
            clauses.push(format!("GROUP BY {}", keys.join(", ")));
        }

        // ORDER BY output names
        if !spec.order_by.is_empty() {
            let outputs = output_names(spec);
            let mut keys = Vec::with_capacity(spec.order_by.len());
            for order in &spec.order_by {
                if !outputs.contains(&order.key) {
                    return Err(PipelineError::SchemaResolution(vec![
                        UnresolvedEntity::column(order.key.clone(), "order by"),
                    ]));
                }
                keys.push(format!(
                    "{} {}",
                    rules.quote_identifier(&order.key),
                    if order.descending { "DESC" } else { "ASC" }
                ));
            }
            clauses.push(format!("ORDER BY {}", keys.join(", ")));
        }

        if let Some(limit) = spec.limit {
            clauses.push(rules.limit_clause(limit));
        }

        // No joins are generated, so the score is the aggregation count
        let joins = 0;
        let score = 2 * joins + spec.measures.len() + usize::from(grouped);

        let statement = SqlStatement {
            dialect,
            text: clauses.join(" "),
            params,
            complexity: ComplexityClass::from_score(score),
        };

        SqlValidator::validate_select_only(&statement)?;

        debug!(
            "Generated {} SQL ({:?}): {}",
            dialect, statement.complexity, statement.text
        );
        Ok(statement)
    }
}

fn measure_expr(rules: &dyn DialectRules, measure: &Measure) -> String {
    let argument = match &measure.column {
        Some(column) => rules.quote_identifier(column),
        None => "*".to_string(),
    };
    format!(
        "{}({}) AS {}",
        measure.function.sql_name(),
        argument,
        rules.quote_identifier(&measure.alias)
    )
}

fn dimension_expr(rules: &dyn DialectRules, dim: &Dimension) -> String {
    let column = rules.quote_identifier(&dim.column);
    match dim.granularity {
        Some(granularity) => rules.truncate_time(&column, granularity),
        None => column,
    }
}

fn output_names(spec: &QuerySpec) -> Vec<String> {
    spec.measures
        .iter()
        .map(|m| m.alias.clone())
        .chain(spec.dimensions.iter().map(Dimension::output_name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AggregateFunction, Filter, FilterOperator, IntentCategory, OrderBy, SchemaCatalog,
        TableRef, TimeGranularity, TimeRange,
    };
    use crate::services::intent_recognizer::IntentRecognizer;
    use crate::services::query_analyzer::{AnalysisContext, QueryAnalyzer};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn ctx() -> AnalysisContext {
        AnalysisContext::new(
            NaiveDate::from_ymd_opt(2024, 3, 15)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
        )
    }

    fn translate(text: &str, dialect: SqlDialect) -> Result<SqlStatement, PipelineError> {
        let intent = IntentRecognizer::default().recognize(text);
        let spec = QueryAnalyzer::new(Arc::new(SchemaCatalog::builtin())).analyze(
            text,
            &intent,
            &ctx(),
        )?;
        SqlGenerator::new().generate(&spec, dialect)
    }

    fn base_spec() -> QuerySpec {
        QuerySpec {
            intent: IntentCategory::Aggregation,
            table: Some(TableRef {
                name: "orders".to_string(),
                database: Some("dw".to_string()),
            }),
            measures: vec![Measure::new(AggregateFunction::Sum, Some("amount".into()))],
            dimensions: vec![],
            filters: vec![],
            time_column: Some("created_at".to_string()),
            time_range: None,
            order_by: vec![],
            limit: None,
            unresolved_entities: vec![],
        }
    }

    fn count_keyword(sql: &str, keyword: &str) -> usize {
        sql.split_whitespace().filter(|w| *w == keyword).count()
    }

    #[test]
    fn test_yesterday_registrations_in_hive() {
        let stmt = translate("统计昨天用户注册数", SqlDialect::Hive).unwrap();
        assert_eq!(
            stmt.text,
            "SELECT COUNT(*) AS count_all FROM users \
             WHERE registered_at >= CAST(? AS TIMESTAMP) AND registered_at < CAST(? AS TIMESTAMP)"
        );
        let day = |d| {
            NaiveDate::from_ymd_opt(2024, 3, d)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        };
        assert_eq!(
            stmt.params,
            vec![SqlValue::Timestamp(day(14)), SqlValue::Timestamp(day(15))]
        );
        assert_eq!(stmt.complexity, ComplexityClass::Simple);
    }

    #[test]
    fn test_group_by_province() {
        let stmt = translate("按省份分组统计订单数", SqlDialect::Hive).unwrap();
        assert_eq!(
            stmt.text,
            "SELECT COUNT(order_id) AS count_order_id, province FROM orders GROUP BY province"
        );
        assert!(stmt.params.is_empty());
        assert_eq!(stmt.complexity, ComplexityClass::Moderate);
    }

    #[test]
    fn test_filter_values_are_bound_not_interpolated() {
        let mut spec = base_spec();
        spec.filters = vec![
            Filter {
                column: "province".into(),
                operator: FilterOperator::Eq,
                value: SqlValue::Text("浙江' OR '1'='1".into()),
            },
            Filter {
                column: "quantity".into(),
                operator: FilterOperator::Ge,
                value: SqlValue::Integer(3),
            },
        ];
        let stmt = SqlGenerator::new().generate(&spec, SqlDialect::SparkSql).unwrap();
        assert_eq!(
            stmt.text,
            "SELECT SUM(amount) AS sum_amount FROM dw.orders WHERE province = ? AND quantity >= ?"
        );
        assert!(!stmt.text.contains("浙江"));
        assert_eq!(stmt.params.len(), 2);
        assert_eq!(stmt.params[1], SqlValue::Integer(3));
    }

    #[test]
    fn test_dialect_differences() {
        let mut spec = base_spec();
        spec.dimensions = vec![Dimension::time_bucket("created_at", TimeGranularity::Month)];
        spec.order_by = vec![OrderBy {
            key: "created_at_month".into(),
            descending: false,
        }];
        spec.limit = Some(12);

        let spark = SqlGenerator::new().generate(&spec, SqlDialect::SparkSql).unwrap();
        assert_eq!(
            spark.text,
            "SELECT SUM(amount) AS sum_amount, date_trunc('MONTH', created_at) AS created_at_month \
             FROM dw.orders GROUP BY date_trunc('MONTH', created_at) \
             ORDER BY created_at_month ASC LIMIT 12"
        );

        let hive = SqlGenerator::new().generate(&spec, SqlDialect::Hive).unwrap();
        assert!(hive.text.contains("trunc(created_at, 'MM') AS created_at_month"));
        assert!(hive.text.ends_with("LIMIT 12"));

        let presto = SqlGenerator::new().generate(&spec, SqlDialect::Presto).unwrap();
        assert!(presto.text.contains("FROM orders "));
        assert!(presto.text.ends_with("FETCH FIRST 12 ROWS ONLY"));
    }

    #[test]
    fn test_reserved_names_are_quoted() {
        let mut spec = base_spec();
        spec.dimensions = vec![Dimension::column("date")];
        let hive = SqlGenerator::new().generate(&spec, SqlDialect::Hive).unwrap();
        assert!(hive.text.ends_with("GROUP BY `date`"));
        let presto = SqlGenerator::new().generate(&spec, SqlDialect::Presto).unwrap();
        assert!(presto.text.ends_with("GROUP BY \"date\""));
    }

    #[test]
    fn test_unresolved_entities_fail_generation() {
        let err = translate("统计昨天货运单数", SqlDialect::Hive).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_RESOLUTION_ERROR");

        let mut spec = base_spec();
        spec.table = None;
        assert!(matches!(
            SqlGenerator::new().generate(&spec, SqlDialect::Hive),
            Err(PipelineError::SchemaResolution(_))
        ));
    }

    #[test]
    fn test_order_key_must_be_selected() {
        let mut spec = base_spec();
        spec.order_by = vec![OrderBy {
            key: "avg_price".into(),
            descending: true,
        }];
        assert!(matches!(
            SqlGenerator::new().generate(&spec, SqlDialect::Hive),
            Err(PipelineError::SchemaResolution(_))
        ));
    }

    #[test]
    fn test_single_select_and_group_by_iff_dimensions() {
        let mut specs = Vec::new();
        let mut spec = base_spec();
        specs.push(spec.clone());
        spec.dimensions = vec![Dimension::column("city")];
        specs.push(spec.clone());
        spec.measures.push(Measure::new(AggregateFunction::Count, None));
        spec.time_range = Some(TimeRange {
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            granularity: TimeGranularity::Month,
            relative: None,
        });
        specs.push(spec);

        for dialect in [SqlDialect::Hive, SqlDialect::SparkSql, SqlDialect::Presto] {
            for spec in &specs {
                let stmt = SqlGenerator::new().generate(spec, dialect).unwrap();
                assert_eq!(count_keyword(&stmt.text, "SELECT"), 1);
                assert_eq!(count_keyword(&stmt.text, "FROM"), 1);
                assert_eq!(stmt.text.contains("GROUP BY"), !spec.dimensions.is_empty());
            }
        }
    }

    #[test]
    fn test_translation_is_idempotent() {
        for text in [
            "统计昨天用户注册数",
            "按省份分组统计订单数",
            "最近30天订单金额的趋势",
            "销售额排名前10的城市",
        ] {
            let first = translate(text, SqlDialect::Hive).unwrap();
            let second = translate(text, SqlDialect::Hive).unwrap();
            assert_eq!(first, second, "{}", text);
        }
    }
}
