// Spark SQL over the Apache Livy REST API
// One interactive session of kind "sql" per client; statements are polled to completion.
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SparkConfig;
use crate::models::{ResourceHints, SqlDialect, SqlValue};

use super::adapter::{EngineClient, EngineError, EnginePlan, EngineStatus, RawColumn, RawEngineOutput};
use super::{bind, mask_credentials};

static SIZE_IN_BYTES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"sizeInBytes=([0-9.]+(?:E[+-]?[0-9]+)?)\s*(B|KiB|MiB|GiB|TiB|PiB|EiB)?")
        .expect("valid regex")
});
static ROW_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"rowCount=([0-9.]+(?:E[+-]?[0-9]+)?)").expect("valid regex"));

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    kind: &'a str,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<&'a str>,
    executor_memory: String,
    executor_cores: u32,
    num_executors: u32,
    conf: Value,
}

#[derive(Debug, Deserialize)]
struct LivySession {
    id: u64,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct LivyStatement {
    id: u64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    output: Option<LivyOutput>,
}

#[derive(Debug, Deserialize)]
struct LivyOutput {
    status: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    ename: Option<String>,
    #[serde(default)]
    evalue: Option<String>,
}

pub struct SparkLivyEngine {
    base_url: String,
    client: Client,
    config: SparkConfig,
    resources: Option<ResourceHints>,
    session_id: Option<u64>,
    current_statement: Option<u64>,
}

impl SparkLivyEngine {
    pub fn new(config: SparkConfig) -> Result<Self, EngineError> {
        let url = Url::parse(&config.livy_url)
            .map_err(|e| EngineError::Connection(format!("Invalid Livy URL: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(EngineError::Connection(
                "Livy URL must use http:// or https://".to_string(),
            ));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| EngineError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.livy_url.trim_end_matches('/').to_string(),
            client,
            config,
            resources: None,
            session_id: None,
            current_statement: None,
        })
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(10))
    }

    fn session(&self) -> Result<u64, EngineError> {
        self.session_id.ok_or(EngineError::NotConnected)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, EngineError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("HTTP request failed: {}", e)))?;
        read_json(response).await
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, EngineError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("HTTP request failed: {}", e)))?;
        read_json(response).await
    }

    async fn delete_session(&self, id: u64) -> Result<(), EngineError> {
        let response = self
            .client
            .delete(format!("{}/sessions/{}", self.base_url, id))
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("Failed to close session: {}", e)))?;
        if !response.status().is_success() {
            warn!("Closing Livy session {} returned {}", id, response.status());
        }
        Ok(())
    }

    async fn wait_for_idle(&self, id: u64) -> Result<(), EngineError> {
        loop {
            let session: LivySession = self.get_json(&format!("/sessions/{}", id)).await?;
            match session.state.as_str() {
                "idle" => return Ok(()),
                "dead" | "error" | "killed" | "shutting_down" | "success" => {
                    return Err(EngineError::Connection(format!(
                        "Livy session {} ended in state '{}'",
                        id, session.state
                    )))
                }
                _ => tokio::time::sleep(self.poll_interval()).await,
            }
        }
    }

    /// Submit a statement and poll it until Livy reports an outcome
    async fn run_statement(&mut self, code: &str) -> Result<Value, EngineError> {
        let session = self.session()?;
        let submitted: LivyStatement = self
            .post_json(
                &format!("/sessions/{}/statements", session),
                &json!({ "code": code, "kind": "sql" }),
            )
            .await?;
        self.current_statement = Some(submitted.id);
        debug!("Livy statement {} submitted to session {}", submitted.id, session);

        let path = format!("/sessions/{}/statements/{}", session, submitted.id);
        let finished = loop {
            let statement: LivyStatement = self.get_json(&path).await?;
            match statement.state.as_str() {
                "available" => break statement,
                "error" => break statement,
                "cancelled" | "cancelling" => {
                    self.current_statement = None;
                    return Err(EngineError::Cancelled(format!(
                        "Livy statement {} was cancelled",
                        statement.id
                    )));
                }
                _ => tokio::time::sleep(self.poll_interval()).await,
            }
        };
        self.current_statement = None;

        let output = finished
            .output
            .ok_or_else(|| EngineError::Protocol("Statement finished without output".to_string()))?;
        if output.status != "ok" {
            return Err(classify_livy_error(
                output.ename.as_deref().unwrap_or("Error"),
                output.evalue.as_deref().unwrap_or(""),
            ));
        }

        output
            .data
            .and_then(|mut data| data.get_mut("application/json").map(Value::take))
            .ok_or_else(|| EngineError::Protocol("Statement output has no JSON payload".to_string()))
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, EngineError> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(EngineError::Connection(format!(
            "Livy request failed ({}): {}",
            status, body
        )));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| EngineError::Protocol(format!("Failed to parse Livy response: {}", e)))
}

fn classify_livy_error(ename: &str, evalue: &str) -> EngineError {
    let message = format!("{}: {}", ename, evalue);
    if ename.contains("OutOfMemory") || evalue.contains("OutOfMemoryError") {
        EngineError::ResourceExhausted(message)
    } else if ename.contains("ParseException") || ename.contains("AnalysisException") {
        EngineError::Rejected(message)
    } else {
        EngineError::Protocol(message)
    }
}

/// Convert `{schema: {fields: [...]}, data: [[...]]}` into raw output
fn parse_result_payload(payload: Value) -> Result<RawEngineOutput, EngineError> {
    let columns = payload
        .pointer("/schema/fields")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::Protocol("Result payload has no schema".to_string()))?
        .iter()
        .map(|field| RawColumn {
            name: field
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            type_name: match field.get("type") {
                Some(Value::String(t)) => t.clone(),
                Some(other) => other
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("string")
                    .to_string(),
                None => "string".to_string(),
            },
        })
        .collect();

    let rows = match payload.get("data") {
        Some(Value::Array(rows)) => rows
            .iter()
            .map(|row| match row {
                Value::Array(values) => values.clone(),
                other => vec![other.clone()],
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(RawEngineOutput { columns, rows })
}

fn unit_multiplier(unit: &str) -> f64 {
    match unit {
        "KiB" => 1024f64,
        "MiB" => 1024f64.powi(2),
        "GiB" => 1024f64.powi(3),
        "TiB" => 1024f64.powi(4),
        "PiB" => 1024f64.powi(5),
        "EiB" => 1024f64.powi(6),
        _ => 1.0,
    }
}

/// Largest statistics of an `EXPLAIN COST` plan. The root operator reports
/// its output (one row for a global aggregate); the scan below it reports
/// what the query actually reads.
pub(crate) fn parse_explain_cost(plan: &str) -> EnginePlan {
    let estimated_bytes = SIZE_IN_BYTES
        .captures_iter(plan)
        .filter_map(|caps| {
            let value: f64 = caps.get(1)?.as_str().parse().ok()?;
            let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("B");
            Some((value * unit_multiplier(unit)).round() as u64)
        })
        .max();
    let estimated_rows = ROW_COUNT
        .captures_iter(plan)
        .filter_map(|caps| {
            let value: f64 = caps.get(1)?.as_str().parse().ok()?;
            Some(value.round() as u64)
        })
        .max();
    EnginePlan {
        estimated_rows,
        estimated_bytes,
        plan_text: plan.to_string(),
    }
}

#[async_trait::async_trait]
impl EngineClient for SparkLivyEngine {
    fn name(&self) -> &str {
        "spark"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::SparkSql
    }

    async fn connect(&mut self) -> Result<(), EngineError> {
        if self.session_id.is_some() {
            return Ok(());
        }
        info!("Opening Livy session at {}", mask_credentials(&self.base_url));

        let conf = match self.resources {
            Some(hints) => json!({
                "spark.default.parallelism": hints.parallelism.to_string(),
                "spark.sql.shuffle.partitions": hints.parallelism.to_string(),
            }),
            None => json!({}),
        };
        let request = CreateSessionRequest {
            kind: "sql",
            name: format!("{}-{}", self.config.app_name, uuid::Uuid::new_v4().simple()),
            queue: self.config.queue.as_deref(),
            executor_memory: self.config.executor_memory.clone(),
            executor_cores: self.config.executor_cores,
            num_executors: self.config.num_executors,
            conf,
        };
        let session: LivySession = self.post_json("/sessions", &request).await?;

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let failure = match tokio::time::timeout(connect_timeout, self.wait_for_idle(session.id)).await {
            Ok(Ok(())) => {
                info!("Livy session {} is idle", session.id);
                self.session_id = Some(session.id);
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => EngineError::Connection(format!(
                "Livy session {} not ready after {} seconds",
                session.id, self.config.connect_timeout_secs
            )),
        };

        // The session exists on the server even though it never became usable
        if let Err(e) = self.delete_session(session.id).await {
            warn!("Failed to clean up Livy session {}: {}", session.id, e);
        }
        Err(failure)
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        let Some(id) = self.session_id.take() else {
            return Ok(());
        };
        self.current_statement = None;
        self.delete_session(id).await?;
        info!("Closed Livy session {}", id);
        Ok(())
    }

    fn set_resources(&mut self, hints: ResourceHints) {
        self.resources = Some(hints);
    }

    async fn run(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        timeout: Duration,
    ) -> Result<RawEngineOutput, EngineError> {
        let code = bind::render(sql, params, SqlDialect::SparkSql)?;
        let payload = tokio::time::timeout(timeout, self.run_statement(&code))
            .await
            .map_err(|_| {
                EngineError::Timeout(format!("Query timeout after {} seconds", timeout.as_secs()))
            })??;
        parse_result_payload(payload)
    }

    async fn explain(&mut self, sql: &str, params: &[SqlValue]) -> Result<EnginePlan, EngineError> {
        let code = format!("EXPLAIN COST {}", bind::render(sql, params, SqlDialect::SparkSql)?);
        let payload = self.run_statement(&code).await?;
        let output = parse_result_payload(payload)?;
        let plan = output
            .rows
            .iter()
            .flat_map(|row| row.iter())
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(parse_explain_cost(&plan))
    }

    async fn cancel(&mut self, task_id: &str) -> Result<(), EngineError> {
        let (Some(session), Some(statement)) = (self.session_id, self.current_statement.take())
        else {
            return Ok(());
        };
        info!("Cancelling Livy statement {} for task {}", statement, task_id);
        let response = self
            .client
            .post(format!(
                "{}/sessions/{}/statements/{}/cancel",
                self.base_url, session, statement
            ))
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("Cancel request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(EngineError::Protocol(format!(
                "Cancel returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn status(&self) -> EngineStatus {
        let state = match self.session_id {
            Some(id) => match self.get_json::<LivySession>(&format!("/sessions/{}", id)).await {
                Ok(session) => session.state,
                Err(e) => format!("unreachable: {}", e),
            },
            None => "not_started".to_string(),
        };
        EngineStatus {
            engine: "spark".to_string(),
            connected: self.session_id.is_some(),
            state,
        }
    }
}
