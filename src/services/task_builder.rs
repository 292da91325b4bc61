// Task descriptor assembly. Nothing here talks to an engine.
use chrono::Utc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::error::PipelineError;
use crate::models::{
    ExecutionMode, RequestedMode, ResourceHints, SqlStatement, TaskDescriptor, TaskOptions,
};

pub struct TaskBuilder {
    defaults: TaskConfig,
    engines: Vec<String>,
    default_engine: String,
}

impl TaskBuilder {
    pub fn new(defaults: TaskConfig, engines: Vec<String>, default_engine: impl Into<String>) -> Self {
        Self {
            defaults,
            engines,
            default_engine: default_engine.into(),
        }
    }

    pub fn engines(&self) -> &[String] {
        &self.engines
    }

    pub fn default_engine(&self) -> &str {
        &self.default_engine
    }

    pub fn build(
        &self,
        sql: SqlStatement,
        engine_preference: Option<&str>,
        options: &TaskOptions,
    ) -> Result<TaskDescriptor, PipelineError> {
        let requested = engine_preference.unwrap_or(&self.default_engine);
        let engine = self
            .engines
            .iter()
            .find(|name| name.eq_ignore_ascii_case(requested))
            .cloned()
            .ok_or_else(|| PipelineError::UnknownEngine {
                name: requested.to_string(),
                registered: self.engines.clone(),
            })?;

        let mode = match options.mode {
            RequestedMode::Execute => ExecutionMode::Execute,
            RequestedMode::Preview => ExecutionMode::Preview {
                max_rows: options.preview_rows.unwrap_or(self.defaults.preview_rows).max(1),
            },
            RequestedMode::EstimateCost => ExecutionMode::EstimateCost,
        };

        let timeout = options
            .timeout
            .unwrap_or(Duration::from_secs(self.defaults.timeout_secs));

        let resources = self.resources_for(&sql, options);

        let task = TaskDescriptor {
            id: Uuid::new_v4(),
            sql,
            engine,
            resources,
            timeout,
            mode,
            created_at: Utc::now(),
        };

        debug!(
            "Built task {} for engine '{}' ({}, {:?}, timeout {}s)",
            task.id,
            task.engine,
            task.mode.as_str(),
            task.resources,
            task.timeout.as_secs()
        );
        Ok(task)
    }

    /// Configured defaults scaled by statement complexity; explicit overrides win as given
    fn resources_for(&self, sql: &SqlStatement, options: &TaskOptions) -> ResourceHints {
        let factor = sql.complexity.resource_factor();
        let parallelism = options.parallelism.unwrap_or_else(|| {
            let scaled = u64::from(self.defaults.parallelism.max(1)) * factor;
            scaled.min(u64::from(self.defaults.max_parallelism)) as u32
        });
        let memory_mb = options.memory_mb.unwrap_or_else(|| {
            (self.defaults.memory_mb * factor).min(self.defaults.max_memory_mb)
        });
        ResourceHints {
            parallelism,
            memory_mb,
        }
    }
}
