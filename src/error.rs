use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::UnresolvedEntity;

/// Errors raised while turning a question into a dispatchable task.
/// Engine failures are not errors here; they come back inside an `ExecutionResult`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Schema resolution error: unresolved {}", join_entities(.0))]
    SchemaResolution(Vec<UnresolvedEntity>),

    #[error("Unknown engine '{name}'. Registered engines: {}", .registered.join(", "))]
    UnknownEngine { name: String, registered: Vec<String> },

    #[error("Malformed prompt response: {0}")]
    PromptResponseMalformed(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("LLM service error: {0}")]
    LlmService(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_entities(entities: &[UnresolvedEntity]) -> String {
    entities
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Analysis(_) => "ANALYSIS_ERROR",
            PipelineError::SchemaResolution(_) => "SCHEMA_RESOLUTION_ERROR",
            PipelineError::UnknownEngine { .. } => "UNKNOWN_ENGINE",
            PipelineError::PromptResponseMalformed(_) => "PROMPT_RESPONSE_MALFORMED",
            PipelineError::InvalidSql(_) => "INVALID_SQL",
            PipelineError::Connection(_) => "CONNECTION_ERROR",
            PipelineError::LlmService(_) => "LLM_SERVICE_ERROR",
            PipelineError::Config(_) => "CONFIG_ERROR",
            PipelineError::Format(_) => "FORMAT_ERROR",
            PipelineError::Io(_) => "IO_ERROR",
            PipelineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        let detail = ErrorDetail::new(self.code(), self.to_string());
        match self {
            PipelineError::Analysis(_) => {
                detail.with_details("Try naming the table and the metric, e.g. 统计昨天用户注册数")
            }
            PipelineError::SchemaResolution(_) => {
                detail.with_details("Check the catalog for the table and column names in use")
            }
            PipelineError::LlmService(msg) if msg.contains("not configured") => {
                detail.with_details("Set LLM_GATEWAY_URL to resolve ambiguous questions")
            }
            _ => detail,
        }
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_resolution_message_lists_entities() {
        let err = PipelineError::SchemaResolution(vec![
            UnresolvedEntity::table("货运单"),
            UnresolvedEntity::column("省份", "dimension"),
        ]);
        assert_eq!(err.code(), "SCHEMA_RESOLUTION_ERROR");
        let message = err.to_string();
        assert!(message.contains("table '货运单'"));
        assert!(message.contains("column '省份' (dimension)"));
    }

    #[test]
    fn test_unknown_engine_lists_registered() {
        let err = PipelineError::UnknownEngine {
            name: "flink".to_string(),
            registered: vec!["hive".to_string(), "spark".to_string()],
        };
        assert!(err.to_string().contains("hive, spark"));
        assert_eq!(err.detail().code, "UNKNOWN_ENGINE");
    }
}
