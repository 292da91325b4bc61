// Hive over a HiveServer2 REST gateway (Kyuubi REST API v1)
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::HiveConfig;
use crate::models::{ResourceHints, SqlDialect, SqlValue};

use super::adapter::{EngineClient, EngineError, EnginePlan, EngineStatus, RawColumn, RawEngineOutput};
use super::{bind, mask_credentials};

static PLAN_STATISTICS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Statistics:\s*Num rows:\s*([0-9]+)\s*Data size:\s*([0-9]+)").expect("valid regex")
});

#[derive(Debug, Deserialize)]
struct Handle {
    identifier: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatementRequest<'a> {
    statement: &'a str,
    run_async: bool,
    query_timeout: u64,
    conf_overlay: Value,
}

#[derive(Debug, Deserialize)]
struct OperationEvent {
    #[serde(default)]
    state: String,
    #[serde(default)]
    exception: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColumnDesc {
    column_name: String,
    #[serde(default)]
    column_type: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResultSetMetadata {
    #[serde(default)]
    columns: Vec<ColumnDesc>,
}

#[derive(Debug, Deserialize)]
struct Field {
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Debug, Deserialize)]
struct RowSet {
    #[serde(default)]
    rows: Vec<Row>,
}

pub struct HiveRestEngine {
    base_url: String,
    client: Client,
    config: HiveConfig,
    resources: Option<ResourceHints>,
    session: Option<String>,
    current_operation: Option<String>,
}

impl HiveRestEngine {
    pub fn new(config: HiveConfig) -> Result<Self, EngineError> {
        let url = Url::parse(&config.gateway_url)
            .map_err(|e| EngineError::Connection(format!("Invalid HiveServer2 gateway URL: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(EngineError::Connection(
                "HiveServer2 gateway URL must use http:// or https://".to_string(),
            ));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: format!("{}/api/v1", config.gateway_url.trim_end_matches('/')),
            client,
            config,
            resources: None,
            session: None,
            current_operation: None,
        })
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(10))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.user {
            Some(user) => request.basic_auth(user, self.config.password.as_deref()),
            None => request,
        }
    }

    async fn send<T: for<'de> Deserialize<'de>>(&self, request: RequestBuilder) -> Result<T, EngineError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("HTTP request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EngineError::Connection(format!(
                "HiveServer2 request failed ({}): {}",
                status, body
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| EngineError::Protocol(format!("Failed to parse gateway response: {}", e)))
    }

    async fn operation_action(&self, operation: &str, action: &str) -> Result<(), EngineError> {
        let response = self
            .authorized(
                self.client
                    .put(format!("{}/operations/{}", self.base_url, operation))
                    .json(&json!({ "action": action })),
            )
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("HTTP request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(EngineError::Protocol(format!(
                "{} on operation {} returned HTTP {}",
                action,
                operation,
                response.status()
            )));
        }
        Ok(())
    }

    fn conf_overlay(&self) -> Value {
        match self.resources {
            Some(hints) => json!({
                "mapreduce.job.reduces": hints.parallelism.to_string(),
                "hive.tez.container.size": hints.memory_mb.to_string(),
            }),
            None => json!({}),
        }
    }

    /// Submit and wait for the operation to finish; returns its handle
    async fn execute_statement(&mut self, statement: &str, timeout: Duration) -> Result<String, EngineError> {
        let session = self.session.clone().ok_or(EngineError::NotConnected)?;
        let request = StatementRequest {
            statement,
            run_async: true,
            query_timeout: timeout.as_secs(),
            conf_overlay: self.conf_overlay(),
        };
        let handle: Handle = self
            .send(
                self.client
                    .post(format!("{}/sessions/{}/operations/statement", self.base_url, session))
                    .json(&request),
            )
            .await?;
        let operation = handle.identifier;
        self.current_operation = Some(operation.clone());
        debug!("HiveServer2 operation {} submitted", operation);

        loop {
            let event: OperationEvent = self
                .send(
                    self.client
                        .get(format!("{}/operations/{}/event", self.base_url, operation)),
                )
                .await?;
            match event.state.as_str() {
                "FINISHED_STATE" => break,
                "ERROR_STATE" => {
                    self.current_operation = None;
                    let message = event.exception.unwrap_or_else(|| "unknown error".to_string());
                    return Err(classify_hive_error(&message));
                }
                "TIMEDOUT_STATE" => {
                    self.current_operation = None;
                    return Err(EngineError::Timeout(format!(
                        "Operation {} timed out on the server",
                        operation
                    )));
                }
                "CANCELED_STATE" | "CLOSED_STATE" => {
                    self.current_operation = None;
                    return Err(EngineError::Cancelled(format!(
                        "Operation {} was cancelled",
                        operation
                    )));
                }
                _ => tokio::time::sleep(self.poll_interval()).await,
            }
        }
        self.current_operation = None;
        Ok(operation)
    }

    async fn fetch_results(&self, operation: &str) -> Result<RawEngineOutput, EngineError> {
        let metadata: ResultSetMetadata = self
            .send(
                self.client
                    .get(format!("{}/operations/{}/resultsetmetadata", self.base_url, operation)),
            )
            .await?;
        let columns = metadata
            .columns
            .into_iter()
            .map(|c| RawColumn {
                name: c.column_name,
                type_name: match c.column_type {
                    Some(Value::String(t)) => t,
                    Some(other) => other.to_string(),
                    None => "STRING_TYPE".to_string(),
                },
            })
            .collect();

        let fetch_size = self.config.fetch_size.max(1);
        let mut rows = Vec::new();
        loop {
            let batch: RowSet = self
                .send(self.client.get(format!(
                    "{}/operations/{}/rowset?maxrows={}&fetchorientation=FETCH_NEXT",
                    self.base_url, operation, fetch_size
                )))
                .await?;
            let fetched = batch.rows.len() as u64;
            rows.extend(
                batch
                    .rows
                    .into_iter()
                    .map(|row| row.fields.into_iter().map(|f| f.value).collect::<Vec<_>>()),
            );
            if fetched < fetch_size {
                break;
            }
        }

        Ok(RawEngineOutput { columns, rows })
    }

    async fn close_operation(&self, operation: &str) {
        if let Err(e) = self.operation_action(operation, "CLOSE").await {
            warn!("Failed to close operation {}: {}", operation, e);
        }
    }
}

fn classify_hive_error(message: &str) -> EngineError {
    if message.contains("ParseException") || message.contains("SemanticException") {
        EngineError::Rejected(message.to_string())
    } else if message.contains("OutOfMemoryError")
        || message.contains("GC overhead limit")
        || message.contains("Container killed")
    {
        EngineError::ResourceExhausted(message.to_string())
    } else if message.contains("TTransportException") {
        EngineError::Connection(message.to_string())
    } else {
        EngineError::Protocol(message.to_string())
    }
}

/// Root operator statistics of a Hive EXPLAIN
pub(crate) fn parse_explain(plan: &str) -> EnginePlan {
    let stats = PLAN_STATISTICS.captures(plan);
    let number = |i: usize| {
        stats
            .as_ref()
            .and_then(|caps| caps.get(i))
            .and_then(|m| m.as_str().parse::<u64>().ok())
    };
    EnginePlan {
        estimated_rows: number(1),
        estimated_bytes: number(2),
        plan_text: plan.to_string(),
    }
}

#[async_trait::async_trait]
impl EngineClient for HiveRestEngine {
    fn name(&self) -> &str {
        "hive"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Hive
    }

    async fn connect(&mut self) -> Result<(), EngineError> {
        if self.session.is_some() {
            return Ok(());
        }
        info!("Opening HiveServer2 session at {}", mask_credentials(&self.base_url));

        let body = json!({
            "configs": { "use:database": self.config.database },
        });
        let handle: Handle = self
            .send(self.client.post(format!("{}/sessions", self.base_url)).json(&body))
            .await?;
        info!("HiveServer2 session {} opened", handle.identifier);
        self.session = Some(handle.identifier);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.current_operation = None;
        let response = self
            .authorized(
                self.client
                    .delete(format!("{}/sessions/{}", self.base_url, session)),
            )
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("Failed to close session: {}", e)))?;
        if !response.status().is_success() {
            warn!("Closing HiveServer2 session {} returned {}", session, response.status());
        }
        info!("Closed HiveServer2 session {}", session);
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
        let statement = bind::render(sql, params, SqlDialect::Hive)?;
        let work = async {
            let operation = self.execute_statement(&statement, timeout).await?;
            let output = self.fetch_results(&operation).await;
            self.close_operation(&operation).await;
            output
        };
        tokio::time::timeout(timeout, work).await.map_err(|_| {
            EngineError::Timeout(format!("Query timeout after {} seconds", timeout.as_secs()))
        })?
    }

    async fn explain(&mut self, sql: &str, params: &[SqlValue]) -> Result<EnginePlan, EngineError> {
        let statement = format!("EXPLAIN {}", bind::render(sql, params, SqlDialect::Hive)?);
        let operation = self
            .execute_statement(&statement, Duration::from_secs(300))
            .await?;
        let output = self.fetch_results(&operation).await;
        self.close_operation(&operation).await;
        let plan = output?
            .rows
            .iter()
            .flat_map(|row| row.iter())
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(parse_explain(&plan))
    }

    async fn cancel(&mut self, task_id: &str) -> Result<(), EngineError> {
        let Some(operation) = self.current_operation.take() else {
            return Ok(());
        };
        info!("Cancelling HiveServer2 operation {} for task {}", operation, task_id);
        let cancelled = self.operation_action(&operation, "CANCEL").await;
        self.close_operation(&operation).await;
        cancelled
    }

    async fn status(&self) -> EngineStatus {
        let state = match (&self.session, &self.current_operation) {
            (None, _) => "closed",
            (Some(_), Some(_)) => "busy",
            (Some(_), None) => "idle",
        };
        EngineStatus {
            engine: "hive".to_string(),
            connected: self.session.is_some(),
            state: state.to_string(),
        }
    }
}
