// Normalises engine output into the canonical ExecutionResult
use chrono::Utc;
use serde_json::{Number, Value};
use uuid::Uuid;

use crate::models::{
    ColumnType, CostEstimate, ExecutionFailure, ExecutionMode, ExecutionResult, FailureKind,
    ResultColumn, TaskState,
};
use crate::services::engine::RawEngineOutput;

/// Task facts copied onto every result
#[derive(Debug, Clone)]
pub struct ResultContext {
    pub task_id: Uuid,
    pub engine: String,
    pub mode: ExecutionMode,
    pub elapsed_ms: u64,
    pub states: Vec<TaskState>,
    /// Rows beyond this are dropped and the result marked truncated
    pub row_limit: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResultProcessor;

impl ResultProcessor {
    pub fn new() -> Self {
        Self
    }

    pub fn process(&self, raw: RawEngineOutput, ctx: ResultContext) -> ExecutionResult {
        let columns: Vec<ResultColumn> = raw
            .columns
            .into_iter()
            .map(|c| ResultColumn {
                column_type: ColumnType::parse(&c.type_name),
                name: c.name,
            })
            .collect();

        let mut rows = raw.rows;
        let truncated = match ctx.row_limit {
            Some(limit) if rows.len() > limit => {
                rows.truncate(limit);
                true
            }
            _ => false,
        };

        let rows: Vec<Vec<Value>> = rows
            .into_iter()
            .map(|row| normalize_row(row, &columns))
            .collect();

        ExecutionResult {
            task_id: ctx.task_id,
            engine: ctx.engine,
            mode: ctx.mode,
            success: true,
            row_count: rows.len(),
            columns,
            rows,
            truncated,
            elapsed_ms: ctx.elapsed_ms,
            failure: None,
            cost: None,
            states: ctx.states,
            executed_at: Utc::now(),
        }
    }

    /// Cost estimates come back as a one-row result with the figures in columns
    pub fn cost_estimate(&self, cost: CostEstimate, ctx: ResultContext) -> ExecutionResult {
        let columns = vec![
            ResultColumn {
                name: "estimated_rows".to_string(),
                column_type: ColumnType::Integer,
            },
            ResultColumn {
                name: "estimated_bytes_scanned".to_string(),
                column_type: ColumnType::Integer,
            },
            ResultColumn {
                name: "estimated_duration_class".to_string(),
                column_type: ColumnType::Text,
            },
        ];
        let row = vec![
            cost.estimated_rows.map(Value::from).unwrap_or(Value::Null),
            cost.estimated_bytes_scanned
                .map(Value::from)
                .unwrap_or(Value::Null),
            Value::from(cost.estimated_duration_class.as_str()),
        ];

        ExecutionResult {
            task_id: ctx.task_id,
            engine: ctx.engine,
            mode: ctx.mode,
            success: true,
            columns,
            rows: vec![row],
            row_count: 1,
            truncated: false,
            elapsed_ms: ctx.elapsed_ms,
            failure: None,
            cost: Some(cost),
            states: ctx.states,
            executed_at: Utc::now(),
        }
    }

    pub fn failure(
        &self,
        kind: FailureKind,
        message: impl Into<String>,
        ctx: ResultContext,
    ) -> ExecutionResult {
        ExecutionResult {
            task_id: ctx.task_id,
            engine: ctx.engine,
            mode: ctx.mode,
            success: false,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
            elapsed_ms: ctx.elapsed_ms,
            failure: Some(ExecutionFailure {
                kind,
                message: message.into(),
            }),
            cost: None,
            states: ctx.states,
            executed_at: Utc::now(),
        }
    }
}

/// Pad or cut to the schema width and coerce each value to its column type
fn normalize_row(mut row: Vec<Value>, columns: &[ResultColumn]) -> Vec<Value> {
    if !columns.is_empty() {
        row.resize(columns.len(), Value::Null);
    }
    row.into_iter()
        .enumerate()
        .map(|(i, value)| match columns.get(i) {
            Some(column) => coerce(value, &column.column_type),
            None => value,
        })
        .collect()
}

fn coerce(value: Value, column_type: &ColumnType) -> Value {
    let Value::String(text) = &value else {
        return value;
    };
    let trimmed = text.trim();
    match column_type {
        ColumnType::Integer => trimmed
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(value),
        ColumnType::Float | ColumnType::Decimal => trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(value),
        ColumnType::Boolean => match trimmed.to_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value,
        },
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DurationClass;
    use crate::services::engine::RawColumn;
    use serde_json::json;

    fn ctx(row_limit: Option<usize>) -> ResultContext {
        ResultContext {
            task_id: Uuid::new_v4(),
            engine: "hive".to_string(),
            mode: ExecutionMode::Execute,
            elapsed_ms: 42,
            states: vec![TaskState::Executing, TaskState::Completed],
            row_limit,
        }
    }

    fn raw() -> RawEngineOutput {
        RawEngineOutput {
            columns: vec![
                RawColumn {
                    name: "province".into(),
                    type_name: "STRING_TYPE".into(),
                },
                RawColumn {
                    name: "sum_amount".into(),
                    type_name: "DECIMAL_TYPE".into(),
                },
                RawColumn {
                    name: "count_all".into(),
                    type_name: "BIGINT_TYPE".into(),
                },
            ],
            rows: vec![
                vec![json!("浙江"), json!("1024.50"), json!("12")],
                vec![json!("江苏"), json!(99.5), json!(7)],
                vec![json!("上海")],
            ],
        }
    }

    #[test]
    fn test_values_are_coerced_to_column_types() {
        let result = ResultProcessor::new().process(raw(), ctx(None));
        assert!(result.success);
        assert_eq!(result.columns[1].column_type, ColumnType::Decimal);
        assert_eq!(result.rows[0], vec![json!("浙江"), json!(1024.5), json!(12)]);
        assert_eq!(result.rows[1], vec![json!("江苏"), json!(99.5), json!(7)]);
        assert_eq!(result.rows[2], vec![json!("上海"), Value::Null, Value::Null]);
        assert_eq!(result.row_count, 3);
        assert_eq!(result.elapsed_ms, 42);
    }

    #[test]
    fn test_row_limit_truncates_and_keeps_order() {
        let result = ResultProcessor::new().process(raw(), ctx(Some(2)));
        assert!(result.truncated);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0][0], json!("浙江"));
        assert_eq!(result.rows[1][0], json!("江苏"));
    }

    #[test]
    fn test_cost_estimate_shape() {
        let cost = CostEstimate {
            estimated_rows: Some(100),
            estimated_bytes_scanned: None,
            estimated_duration_class: DurationClass::Seconds,
        };
        let result = ResultProcessor::new().cost_estimate(cost.clone(), ctx(None));
        assert_eq!(result.cost, Some(cost));
        assert_eq!(result.rows, vec![vec![json!(100), Value::Null, json!("seconds")]]);
    }

    #[test]
    fn test_failure_carries_kind() {
        let result = ResultProcessor::new().failure(FailureKind::Timeout, "too slow", ctx(None));
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
        assert!(result.rows.is_empty());
    }
}
