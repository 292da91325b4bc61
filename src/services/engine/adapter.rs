// Engine client trait for Spark/Hive execution
use crate::models::{ResourceHints, SqlDialect, SqlValue};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by an engine client. The dispatcher maps these onto failure kinds.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Engine timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Statement rejected: {0}")]
    Rejected(String),

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Statement cancelled: {0}")]
    Cancelled(String),

    #[error("Unexpected engine response: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawColumn {
    pub name: String,
    pub type_name: String,
}

/// Rows as the engine returned them, positional against `columns`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawEngineOutput {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<Vec<Value>>,
}

/// Planner statistics from an EXPLAIN; the statement itself is not run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnginePlan {
    pub estimated_rows: Option<u64>,
    pub estimated_bytes: Option<u64>,
    pub plan_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub engine: String,
    pub connected: bool,
    /// Engine-reported session state, e.g. "idle" or "busy"
    pub state: String,
}

/// Client for one execution engine, driven over a single connection.
/// Calls are serialised by the dispatcher, hence `&mut self`.
#[async_trait::async_trait]
pub trait EngineClient: Send + Sync {
    /// Registered engine name, e.g. "spark"
    fn name(&self) -> &str;

    fn dialect(&self) -> SqlDialect;

    async fn connect(&mut self) -> Result<(), EngineError>;

    async fn disconnect(&mut self) -> Result<(), EngineError>;

    /// Resource hints for the statements that follow. Engines that size a
    /// session up front apply them at the next connect.
    fn set_resources(&mut self, _hints: ResourceHints) {}

    /// Run a parameterised statement and collect its rows
    async fn run(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        timeout: Duration,
    ) -> Result<RawEngineOutput, EngineError>;

    /// Ask the planner for cost statistics without running the statement
    async fn explain(&mut self, sql: &str, params: &[SqlValue]) -> Result<EnginePlan, EngineError>;

    /// Best-effort cancellation of the in-flight statement
    async fn cancel(&mut self, task_id: &str) -> Result<(), EngineError>;

    async fn status(&self) -> EngineStatus;
}
