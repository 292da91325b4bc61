use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::catalog::ColumnType;
use super::task::ExecutionMode;

/// Failure classes reported for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ResourceExhausted,
    SyntaxRejected,
    ConnectionLost,
    Cancelled,
    Unknown,
}

impl FailureKind {
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            FailureKind::SyntaxRejected => "SYNTAX_REJECTED",
            FailureKind::ConnectionLost => "CONNECTION_LOST",
            FailureKind::Cancelled => "CANCELLED",
            FailureKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Phases a task passes through inside the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Connecting,
    Connected,
    Executing,
    Preview,
    CostEstimate,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationClass {
    Seconds,
    Minutes,
    Hours,
    Unknown,
}

impl DurationClass {
    const GIB: u64 = 1024 * 1024 * 1024;

    /// Classify by bytes scanned, falling back to row count
    pub fn classify(rows: Option<u64>, bytes: Option<u64>) -> Self {
        match (bytes, rows) {
            (Some(b), _) if b < Self::GIB => DurationClass::Seconds,
            (Some(b), _) if b < 100 * Self::GIB => DurationClass::Minutes,
            (Some(_), _) => DurationClass::Hours,
            (None, Some(r)) if r < 10_000_000 => DurationClass::Seconds,
            (None, Some(r)) if r < 1_000_000_000 => DurationClass::Minutes,
            (None, Some(_)) => DurationClass::Hours,
            (None, None) => DurationClass::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DurationClass::Seconds => "seconds",
            DurationClass::Minutes => "minutes",
            DurationClass::Hours => "hours",
            DurationClass::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub estimated_rows: Option<u64>,
    pub estimated_bytes_scanned: Option<u64>,
    pub estimated_duration_class: DurationClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// Outcome of one dispatched task, successful or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: Uuid,
    pub engine: String,
    pub mode: ExecutionMode,
    pub success: bool,
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    /// Rows were cut to the preview bound
    pub truncated: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExecutionFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostEstimate>,
    pub states: Vec<TaskState>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Slice of rows for one page, pages numbered from 1
    pub fn page(&self, page: usize, page_size: usize) -> &[Vec<Value>] {
        if page == 0 || page_size == 0 {
            return &[];
        }
        let start = (page - 1).saturating_mul(page_size).min(self.rows.len());
        let end = start.saturating_add(page_size).min(self.rows.len());
        &self.rows[start..end]
    }

    pub fn page_count(&self, page_size: usize) -> usize {
        if page_size == 0 {
            return 0;
        }
        self.rows.len().div_ceil(page_size)
    }
}
