// Output formatters
//
// Each formatter is a pure function of (ExecutionResult, FormatOptions),
// registered by format tag.
//
// Chart kind rule, first match wins:
//   two or more measures                         -> comparison
//   one dimension, one measure, temporal         -> line
//   one dimension, one measure, part of a whole  -> pie
//   one dimension, one measure                   -> bar
//   anything else                                -> table

use comfy_table::presets::ASCII_FULL_CONDENSED;
use comfy_table::{Cell, ContentArrangement, Table};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::error::PipelineError;
use crate::models::{
    ChartHints, ChartKind, ExecutionResult, FormatOptions, FormatTag, FormattedOutput,
};

pub trait Formatter: Send + Sync {
    fn tag(&self) -> FormatTag;

    fn format(&self, result: &ExecutionResult, options: &FormatOptions) -> Result<String, PipelineError>;
}

pub struct FormatterRegistry {
    formatters: HashMap<FormatTag, Box<dyn Formatter>>,
}

impl FormatterRegistry {
    pub fn new() -> Self {
        Self {
            formatters: HashMap::new(),
        }
    }

    pub fn register(&mut self, formatter: Box<dyn Formatter>) {
        self.formatters.insert(formatter.tag(), formatter);
    }

    pub fn format(
        &self,
        result: &ExecutionResult,
        tag: FormatTag,
        options: &FormatOptions,
    ) -> Result<FormattedOutput, PipelineError> {
        let formatter = self
            .formatters
            .get(&tag)
            .ok_or_else(|| PipelineError::Format(format!("No formatter registered for '{}'", tag)))?;
        Ok(FormattedOutput {
            format: tag,
            content: formatter.format(result, options)?,
        })
    }
}

impl Default for FormatterRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(TableFormatter));
        registry.register(Box::new(JsonFormatter));
        registry.register(Box::new(CsvFormatter));
        registry.register(Box::new(ChartFormatter));
        registry
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cut a cell to `max_width` terminal columns, marking the cut with "..."
fn truncate_cell(text: &str, max_width: usize) -> String {
    if text.width() <= max_width {
        return text.to_string();
    }
    let budget = max_width.saturating_sub(3);
    let mut out = String::new();
    let mut width = 0;
    for c in text.chars() {
        let w = c.width().unwrap_or(0);
        if width + w > budget {
            break;
        }
        out.push(c);
        width += w;
    }
    out.push_str("...");
    out
}

fn visible_rows<'r>(result: &'r ExecutionResult, options: &FormatOptions) -> &'r [Vec<Value>] {
    let shown = options.max_rows.unwrap_or(result.rows.len()).min(result.rows.len());
    &result.rows[..shown]
}

/// Plain-text grid for terminals
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn tag(&self) -> FormatTag {
        FormatTag::Table
    }

    fn format(&self, result: &ExecutionResult, options: &FormatOptions) -> Result<String, PipelineError> {
        let mut out = String::new();
        if let Some(title) = &options.title {
            out.push_str(title);
            out.push('\n');
        }
        if let Some(failure) = &result.failure {
            out.push_str(&format!("Execution failed [{}]: {}\n", failure.kind, failure.message));
            return Ok(out);
        }

        let max = options.max_column_width.max(4);
        let rows = visible_rows(result, options);

        let mut table = Table::new();
        table
            .load_preset(ASCII_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Disabled)
            .set_header(result.columns.iter().map(|c| Cell::new(truncate_cell(&c.name, max))));
        for row in rows {
            table.add_row(row.iter().map(|v| Cell::new(truncate_cell(&cell_text(v), max))));
        }
        out.push_str(&table.to_string());
        out.push('\n');

        let hidden = result.rows.len() - rows.len();
        if hidden > 0 {
            out.push_str(&format!("... {} more rows\n", hidden));
        }
        out.push_str(&format!(
            "({} {} in {} ms{})\n",
            result.row_count,
            if result.row_count == 1 { "row" } else { "rows" },
            result.elapsed_ms,
            if result.truncated { ", preview" } else { "" }
        ));
        Ok(out)
    }
}

/// Rows as JSON objects keyed by column name, plus result metadata
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn tag(&self) -> FormatTag {
        FormatTag::Json
    }

    fn format(&self, result: &ExecutionResult, options: &FormatOptions) -> Result<String, PipelineError> {
        let rows: Vec<Value> = visible_rows(result, options)
            .iter()
            .map(|row| {
                let mut object = Map::new();
                for (column, value) in result.columns.iter().zip(row.iter()) {
                    object.insert(column.name.clone(), value.clone());
                }
                Value::Object(object)
            })
            .collect();

        let mut document = json!({
            "task_id": result.task_id,
            "engine": result.engine,
            "mode": result.mode.as_str(),
            "success": result.success,
            "columns": result.columns,
            "rows": rows,
            "row_count": result.row_count,
            "truncated": result.truncated,
            "elapsed_ms": result.elapsed_ms,
        });
        if let Some(failure) = &result.failure {
            document["failure"] = json!(failure);
        }
        if let Some(cost) = &result.cost {
            document["cost"] = json!(cost);
        }

        let rendered = if options.pretty {
            serde_json::to_string_pretty(&document)
        } else {
            serde_json::to_string(&document)
        };
        rendered.map_err(|e| PipelineError::Format(format!("Failed to serialize result: {}", e)))
    }
}

/// RFC 4180 CSV with a header row; NULL becomes an empty field
pub struct CsvFormatter;

impl Formatter for CsvFormatter {
    fn tag(&self) -> FormatTag {
        FormatTag::Csv
    }

    fn format(&self, result: &ExecutionResult, options: &FormatOptions) -> Result<String, PipelineError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let csv_error = |e: csv::Error| PipelineError::Format(format!("CSV error: {}", e));

        writer
            .write_record(result.columns.iter().map(|c| c.name.as_str()))
            .map_err(csv_error)?;
        for row in visible_rows(result, options) {
            let record: Vec<String> = row
                .iter()
                .map(|v| match v {
                    Value::Null => String::new(),
                    other => cell_text(other),
                })
                .collect();
            writer.write_record(&record).map_err(csv_error)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| PipelineError::Format(format!("CSV error: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| PipelineError::Format(format!("CSV is not UTF-8: {}", e)))
    }
}

/// Chart description for a renderer; no drawing happens here
pub struct ChartFormatter;

pub fn choose_chart(hints: &ChartHints) -> ChartKind {
    let dims = hints.dimensions.len();
    let measures = hints.measures.len();
    if measures >= 2 {
        ChartKind::Comparison
    } else if dims == 1 && measures == 1 && hints.temporal_dimension {
        ChartKind::Line
    } else if dims == 1 && measures == 1 && hints.part_of_whole {
        ChartKind::Pie
    } else if dims == 1 && measures == 1 {
        ChartKind::Bar
    } else {
        ChartKind::Table
    }
}

/// Hints from the result schema when the caller supplied none
fn infer_hints(result: &ExecutionResult) -> ChartHints {
    let mut hints = ChartHints::default();
    for column in &result.columns {
        if column.column_type.is_numeric() {
            hints.measures.push(column.name.clone());
        } else {
            if hints.dimensions.is_empty() && column.column_type.is_temporal() {
                hints.temporal_dimension = true;
            }
            hints.dimensions.push(column.name.clone());
        }
    }
    hints
}

fn column_values(result: &ExecutionResult, rows: &[Vec<Value>], name: &str) -> Vec<Value> {
    match result.columns.iter().position(|c| c.name == name) {
        Some(i) => rows
            .iter()
            .map(|row| row.get(i).cloned().unwrap_or(Value::Null))
            .collect(),
        None => Vec::new(),
    }
}

impl Formatter for ChartFormatter {
    fn tag(&self) -> FormatTag {
        FormatTag::Chart
    }

    fn format(&self, result: &ExecutionResult, options: &FormatOptions) -> Result<String, PipelineError> {
        let hints = options.chart.clone().unwrap_or_else(|| infer_hints(result));
        let kind = choose_chart(&hints);
        let rows = visible_rows(result, options);

        let mut spec = json!({
            "chart": kind,
            "title": options.title,
        });
        match kind {
            ChartKind::Table => {
                spec["columns"] = json!(result.columns);
                spec["rows"] = json!(rows);
            }
            _ => {
                // Comparison charts without a dimension plot one point per measure
                let x_name = hints.dimensions.first().cloned();
                let x_values = match &x_name {
                    Some(name) => column_values(result, rows, name),
                    None => Vec::new(),
                };
                let series: Vec<Value> = hints
                    .measures
                    .iter()
                    .map(|m| json!({ "name": m, "values": column_values(result, rows, m) }))
                    .collect();
                spec["x_axis"] = json!({ "name": x_name, "values": x_values });
                spec["series"] = json!(series);
            }
        }

        let rendered = if options.pretty {
            serde_json::to_string_pretty(&spec)
        } else {
            serde_json::to_string(&spec)
        };
        rendered.map_err(|e| PipelineError::Format(format!("Failed to serialize chart: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ColumnType, ExecutionFailure, ExecutionMode, FailureKind, ResultColumn,
    };
    use chrono::Utc;
    use uuid::Uuid;

    fn result(columns: &[(&str, ColumnType)], rows: Vec<Vec<Value>>) -> ExecutionResult {
        ExecutionResult {
            task_id: Uuid::new_v4(),
            engine: "spark".into(),
            mode: ExecutionMode::Execute,
            success: true,
            columns: columns
                .iter()
                .map(|(name, t)| ResultColumn {
                    name: name.to_string(),
                    column_type: t.clone(),
                })
                .collect(),
            row_count: rows.len(),
            rows,
            truncated: false,
            elapsed_ms: 12,
            failure: None,
            cost: None,
            states: vec![],
            executed_at: Utc::now(),
        }
    }

    fn provinces() -> ExecutionResult {
        result(
            &[("count_order_id", ColumnType::Integer), ("province", ColumnType::Text)],
            vec![
                vec![json!(12), json!("浙江")],
                vec![json!(7), json!("江苏")],
                vec![json!(3), Value::Null],
            ],
        )
    }

    #[test]
    fn test_table_output() {
        let out = FormatterRegistry::default()
            .format(&provinces(), FormatTag::Table, &FormatOptions::default())
            .unwrap();
        assert_eq!(out.format, FormatTag::Table);
        let lines: Vec<&str> = out.content.lines().collect();
        assert!(lines[0].starts_with("+-"));
        assert!(lines[1].contains("| count_order_id | province |"));
        assert!(out.content.contains("| 12             | 浙江     |"));
        assert!(out.content.contains("| 3              | NULL     |"));
        assert_eq!(lines.last().copied(), Some("(3 rows in 12 ms)"));
    }

    #[test]
    fn test_table_aligns_wide_characters() {
        let r = result(
            &[("city", ColumnType::Text), ("note", ColumnType::Text)],
            vec![
                vec![json!("杭州"), json!("好，很好")],
                vec![json!("서울"), json!("ＡＢＣ")],
                vec![json!("とうきょう"), json!("ok")],
            ],
        );
        let out = TableFormatter.format(&r, &FormatOptions::default()).unwrap();
        let grid: Vec<&str> = out.lines().filter(|l| l.starts_with('+') || l.starts_with('|')).collect();
        assert!(grid.len() >= 5);
        let width = grid[0].width();
        for line in &grid {
            assert_eq!(line.width(), width, "misaligned line: {}", line);
        }
    }

    #[test]
    fn test_table_cells_are_cut_to_width() {
        let long = "x".repeat(80);
        let r = result(&[("note", ColumnType::Text)], vec![vec![json!(long)]]);
        let out = TableFormatter.format(&r, &FormatOptions::default()).unwrap();
        let cell = format!("{}...", "x".repeat(47));
        assert!(out.contains(&cell));
        assert!(!out.contains(&"x".repeat(48)));
    }

    #[test]
    fn test_table_reports_failure() {
        let mut r = provinces();
        r.success = false;
        r.failure = Some(ExecutionFailure {
            kind: FailureKind::Timeout,
            message: "too slow".into(),
        });
        let out = TableFormatter.format(&r, &FormatOptions::default()).unwrap();
        assert_eq!(out, "Execution failed [TIMEOUT]: too slow\n");
    }

    #[test]
    fn test_json_rows_are_keyed_by_column() {
        let options = FormatOptions {
            pretty: false,
            ..Default::default()
        };
        let out = JsonFormatter.format(&provinces(), &options).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["rows"][0], json!({"count_order_id": 12, "province": "浙江"}));
        assert_eq!(parsed["row_count"], 3);
        assert_eq!(parsed["mode"], "execute");
        assert!(parsed.get("failure").is_none());
    }

    #[test]
    fn test_csv_output() {
        let r = result(
            &[("city", ColumnType::Text), ("sum_amount", ColumnType::Decimal)],
            vec![
                vec![json!("Hangzhou, ZJ"), json!(10.5)],
                vec![json!("say \"hi\""), Value::Null],
            ],
        );
        let out = CsvFormatter.format(&r, &FormatOptions::default()).unwrap();
        assert_eq!(
            out,
            "city,sum_amount\n\"Hangzhou, ZJ\",10.5\n\"say \"\"hi\"\"\",\n"
        );
    }

    #[test]
    fn test_chart_kind_rule() {
        let hints = |dims: usize, measures: usize, temporal: bool, whole: bool| ChartHints {
            dimensions: (0..dims).map(|i| format!("d{}", i)).collect(),
            measures: (0..measures).map(|i| format!("m{}", i)).collect(),
            temporal_dimension: temporal,
            part_of_whole: whole,
        };
        assert_eq!(choose_chart(&hints(1, 1, true, false)), ChartKind::Line);
        assert_eq!(choose_chart(&hints(1, 1, false, false)), ChartKind::Bar);
        assert_eq!(choose_chart(&hints(1, 1, false, true)), ChartKind::Pie);
        assert_eq!(choose_chart(&hints(1, 2, true, false)), ChartKind::Comparison);
        assert_eq!(choose_chart(&hints(0, 2, false, false)), ChartKind::Comparison);
        assert_eq!(choose_chart(&hints(0, 1, false, false)), ChartKind::Table);
        assert_eq!(choose_chart(&hints(2, 1, false, false)), ChartKind::Table);
    }

    #[test]
    fn test_chart_spec_from_inferred_hints() {
        let out = ChartFormatter
            .format(
                &provinces(),
                &FormatOptions {
                    pretty: false,
                    ..Default::default()
                },
            )
            .unwrap();
        let spec: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(spec["chart"], "bar");
        assert_eq!(spec["x_axis"]["name"], "province");
        assert_eq!(spec["x_axis"]["values"], json!(["浙江", "江苏", null]));
        assert_eq!(spec["series"][0]["values"], json!([12, 7, 3]));
    }

    #[test]
    fn test_max_rows_limits_output() {
        let options = FormatOptions {
            max_rows: Some(1),
            ..Default::default()
        };
        let out = TableFormatter.format(&provinces(), &options).unwrap();
        assert!(out.contains("... 2 more rows"));
    }
}
