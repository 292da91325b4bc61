// Scripted test doubles for engines and the completion service
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::PipelineError;
use crate::models::{ResourceHints, SqlDialect, SqlValue};
use crate::services::engine::{
    EngineClient, EngineError, EnginePlan, EngineStatus, RawColumn, RawEngineOutput,
};
use crate::services::llm_service::CompletionClient;

/// One scripted answer to a `run` or `explain` call
pub enum ScriptedReply {
    Rows(RawEngineOutput),
    Plan(EnginePlan),
    Error(EngineError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineCall {
    pub method: &'static str,
    pub sql: Option<String>,
}

/// Call log shared between a test and the engine it handed away
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<EngineCall>>>);

impl CallLog {
    fn record(&self, method: &'static str, sql: Option<&str>) {
        self.0.lock().unwrap().push(EngineCall {
            method,
            sql: sql.map(str::to_string),
        });
    }

    pub fn count(&self, method: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|c| c.method == method).count()
    }

    pub fn last_sql(&self) -> Option<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|c| c.sql.clone())
    }
}

pub struct ScriptedEngine {
    name: String,
    dialect: SqlDialect,
    replies: VecDeque<ScriptedReply>,
    delay: Option<Duration>,
    fail_connect: bool,
    connected: bool,
    calls: CallLog,
    resources: Arc<Mutex<Option<ResourceHints>>>,
}

impl ScriptedEngine {
    pub fn new(name: &str) -> Self {
        let dialect = if name == "hive" {
            SqlDialect::Hive
        } else {
            SqlDialect::SparkSql
        };
        Self {
            name: name.to_string(),
            dialect,
            replies: VecDeque::new(),
            delay: None,
            fail_connect: false,
            connected: false,
            calls: CallLog::default(),
            resources: Arc::new(Mutex::new(None)),
        }
    }

    pub fn reply(mut self, reply: ScriptedReply) -> Self {
        self.replies.push_back(reply);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn resources(&self) -> Arc<Mutex<Option<ResourceHints>>> {
        self.resources.clone()
    }

    pub fn rows(columns: &[(&str, &str)], rows: Vec<Vec<Value>>) -> RawEngineOutput {
        RawEngineOutput {
            columns: columns
                .iter()
                .map(|(name, type_name)| RawColumn {
                    name: name.to_string(),
                    type_name: type_name.to_string(),
                })
                .collect(),
            rows,
        }
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl EngineClient for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    async fn connect(&mut self) -> Result<(), EngineError> {
        self.calls.record("connect", None);
        if self.fail_connect {
            return Err(EngineError::Connection("connection refused".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        self.calls.record("disconnect", None);
        self.connected = false;
        Ok(())
    }

    fn set_resources(&mut self, hints: ResourceHints) {
        *self.resources.lock().unwrap() = Some(hints);
    }

    async fn run(
        &mut self,
        sql: &str,
        _params: &[SqlValue],
        timeout: Duration,
    ) -> Result<RawEngineOutput, EngineError> {
        self.calls.record("run", Some(sql));
        if tokio::time::timeout(timeout, self.pause()).await.is_err() {
            return Err(EngineError::Timeout(format!(
                "statement did not finish within {} seconds",
                timeout.as_secs()
            )));
        }
        match self.replies.pop_front() {
            Some(ScriptedReply::Rows(output)) => Ok(output),
            Some(ScriptedReply::Error(e)) => Err(e),
            Some(ScriptedReply::Plan(_)) => {
                Err(EngineError::Protocol("scripted plan for a run call".to_string()))
            }
            None => Ok(RawEngineOutput::default()),
        }
    }

    async fn explain(&mut self, sql: &str, _params: &[SqlValue]) -> Result<EnginePlan, EngineError> {
        self.calls.record("explain", Some(sql));
        self.pause().await;
        match self.replies.pop_front() {
            Some(ScriptedReply::Plan(plan)) => Ok(plan),
            Some(ScriptedReply::Error(e)) => Err(e),
            Some(ScriptedReply::Rows(_)) => {
                Err(EngineError::Protocol("scripted rows for an explain call".to_string()))
            }
            None => Ok(EnginePlan::default()),
        }
    }

    async fn cancel(&mut self, _task_id: &str) -> Result<(), EngineError> {
        self.calls.record("cancel", None);
        Ok(())
    }

    async fn status(&self) -> EngineStatus {
        EngineStatus {
            engine: self.name.clone(),
            connected: self.connected,
            state: if self.connected { "idle" } else { "closed" }.to_string(),
        }
    }
}

/// Completion client answering from a fixed script and recording prompts
pub struct ScriptedCompletion {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, PipelineError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PipelineError::LlmService("script exhausted".to_string()))
    }
}
