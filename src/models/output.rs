use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    Table,
    Json,
    Csv,
    Chart,
}

impl FormatTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatTag::Table => "table",
            FormatTag::Json => "json",
            FormatTag::Csv => "csv",
            FormatTag::Chart => "chart",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape information the chart formatter chooses a chart kind from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartHints {
    pub dimensions: Vec<String>,
    pub measures: Vec<String>,
    pub temporal_dimension: bool,
    pub part_of_whole: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Line,
    Bar,
    Pie,
    Comparison,
    Table,
}

#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Table cells are cut to this many characters
    pub max_column_width: usize,
    pub max_rows: Option<usize>,
    pub pretty: bool,
    pub chart: Option<ChartHints>,
    pub title: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            max_column_width: 50,
            max_rows: None,
            pretty: true,
            chart: None,
            title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormattedOutput {
    pub format: FormatTag,
    pub content: String,
}
