use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::sql::SqlStatement;

/// What the dispatcher should do with a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    Execute,
    Preview { max_rows: u64 },
    EstimateCost,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Execute => "execute",
            ExecutionMode::Preview { .. } => "preview",
            ExecutionMode::EstimateCost => "estimate_cost",
        }
    }

    /// True when the full statement will not be run
    pub fn is_dry_run(&self) -> bool {
        !matches!(self, ExecutionMode::Execute)
    }
}

/// Mode requested by a caller before defaults are applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestedMode {
    #[default]
    Execute,
    Preview,
    EstimateCost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    pub parallelism: u32,
    pub memory_mb: u64,
}

/// Caller overrides for a single task; unset fields take configured defaults
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub mode: RequestedMode,
    pub preview_rows: Option<u64>,
    pub timeout: Option<Duration>,
    pub parallelism: Option<u32>,
    pub memory_mb: Option<u64>,
}

/// Unit of work handed to the dispatcher
#[derive(Debug, Clone, Serialize)]
pub struct TaskDescriptor {
    pub id: Uuid,
    pub sql: SqlStatement,
    pub engine: String,
    pub resources: ResourceHints,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub mode: ExecutionMode,
    pub created_at: DateTime<Utc>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}
