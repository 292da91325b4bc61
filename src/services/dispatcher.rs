// Engine dispatcher
//
// Routes task descriptors to registered engines. Each engine holds one
// connection, opened lazily and reused; executions against the same engine are
// serialised on that connection. Connection state and the running task are
// published outside the connection lock so status queries never wait on a
// task. Failures never escape as errors: they come back as failed
// ExecutionResults carrying a FailureKind.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::models::{
    CostEstimate, DurationClass, ExecutionMode, ExecutionResult, FailureKind, SqlDialect,
    TaskDescriptor, TaskState,
};
use crate::services::engine::{
    create_engine, EngineClient, EngineError, EngineKind, EnginePlan, EngineStatus,
    RawEngineOutput,
};
use crate::services::result_processor::{ResultContext, ResultProcessor};
use crate::validation::SqlValidator;

/// Cancellation signal shared between a caller and an in-flight task
#[derive(Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy)]
struct EngineView {
    state: ConnectionState,
    running: Option<Uuid>,
}

struct EngineHandle {
    name: String,
    dialect: SqlDialect,
    view: watch::Sender<EngineView>,
    client: Mutex<Box<dyn EngineClient>>,
}

impl EngineHandle {
    fn state(&self) -> ConnectionState {
        self.view.borrow().state
    }

    fn set_state(&self, state: ConnectionState) {
        self.view.send_modify(|view| view.state = state);
    }
}

/// Clears the running task id when the execution ends or is dropped
struct RunningTask<'a> {
    view: &'a watch::Sender<EngineView>,
}

impl<'a> RunningTask<'a> {
    fn start(view: &'a watch::Sender<EngineView>, task_id: Uuid) -> Self {
        view.send_modify(|v| v.running = Some(task_id));
        Self { view }
    }
}

impl Drop for RunningTask<'_> {
    fn drop(&mut self) {
        self.view.send_modify(|v| v.running = None);
    }
}

enum Outcome {
    Rows {
        output: RawEngineOutput,
        row_limit: Option<usize>,
    },
    Plan(EnginePlan),
}

enum Interruption {
    Cancelled,
    TimedOut,
}

pub struct EngineDispatcher {
    engines: BTreeMap<String, EngineHandle>,
    processor: ResultProcessor,
}

impl EngineDispatcher {
    pub fn new() -> Self {
        Self {
            engines: BTreeMap::new(),
            processor: ResultProcessor::new(),
        }
    }

    /// Dispatcher with every shipped engine registered from configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self, PipelineError> {
        let mut dispatcher = Self::new();
        for kind in EngineKind::ALL {
            dispatcher.register(create_engine(kind, config)?);
        }
        Ok(dispatcher)
    }

    /// Register an engine under its own name, replacing any previous one
    pub fn register(&mut self, client: Box<dyn EngineClient>) {
        let name = client.name().to_lowercase();
        let (view, _) = watch::channel(EngineView {
            state: ConnectionState::Idle,
            running: None,
        });
        let handle = EngineHandle {
            name: name.clone(),
            dialect: client.dialect(),
            view,
            client: Mutex::new(client),
        };
        info!("Registered engine '{}' ({})", name, handle.dialect);
        self.engines.insert(name, handle);
    }

    pub fn with_engine(mut self, client: Box<dyn EngineClient>) -> Self {
        self.register(client);
        self
    }

    pub fn engine_names(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    pub fn dialect_of(&self, engine: &str) -> Option<SqlDialect> {
        self.engines.get(&engine.to_lowercase()).map(|h| h.dialect)
    }

    fn handle(&self, engine: &str) -> Result<&EngineHandle, PipelineError> {
        self.engines
            .get(&engine.to_lowercase())
            .ok_or_else(|| PipelineError::UnknownEngine {
                name: engine.to_string(),
                registered: self.engine_names(),
            })
    }

    pub async fn connect(&self, engine: &str) -> Result<(), PipelineError> {
        let handle = self.handle(engine)?;
        let mut client = handle.client.lock().await;
        Self::ensure_connected(handle, &mut **client)
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::Connection(e.to_string()))
    }

    pub async fn disconnect(&self, engine: &str) -> Result<(), PipelineError> {
        let handle = self.handle(engine)?;
        let mut client = handle.client.lock().await;
        if handle.state() == ConnectionState::Idle {
            return Ok(());
        }
        let result = client.disconnect().await;
        handle.set_state(ConnectionState::Idle);
        result.map_err(|e| PipelineError::Connection(e.to_string()))
    }

    pub async fn disconnect_all(&self) {
        for name in self.engines.keys() {
            if let Err(e) = self.disconnect(name).await {
                warn!("Failed to disconnect engine '{}': {}", name, e);
            }
        }
    }

    pub fn connection_state(&self, engine: &str) -> Option<ConnectionState> {
        self.engines
            .get(&engine.to_lowercase())
            .map(EngineHandle::state)
    }

    /// Id of the task currently holding the engine's connection
    pub fn running_task(&self, engine: &str) -> Option<Uuid> {
        self.engines
            .get(&engine.to_lowercase())
            .and_then(|handle| handle.view.borrow().running)
    }

    /// Engine-reported status when the connection is free. While a task owns
    /// the connection the answer comes from the published view instead.
    pub async fn status(&self, engine: &str) -> Option<EngineStatus> {
        let handle = self.engines.get(&engine.to_lowercase())?;
        if let Ok(client) = handle.client.try_lock() {
            return Some(client.status().await);
        }
        let view = *handle.view.borrow();
        Some(EngineStatus {
            engine: handle.name.clone(),
            connected: view.state == ConnectionState::Connected,
            state: match view.running {
                Some(task_id) => format!("busy (task {})", task_id),
                None => "busy".to_string(),
            },
        })
    }

    async fn ensure_connected(
        handle: &EngineHandle,
        client: &mut dyn EngineClient,
    ) -> Result<bool, EngineError> {
        if handle.state() == ConnectionState::Connected {
            return Ok(false);
        }
        handle.set_state(ConnectionState::Connecting);
        match client.connect().await {
            Ok(()) => {
                handle.set_state(ConnectionState::Connected);
                Ok(true)
            }
            Err(e) => {
                handle.set_state(ConnectionState::Idle);
                Err(e)
            }
        }
    }

    pub async fn execute(&self, task: TaskDescriptor) -> ExecutionResult {
        self.execute_with_cancel(task, &CancellationToken::new()).await
    }

    /// Run a task, honouring its timeout and the caller's cancellation.
    /// On either interruption the engine is asked to cancel the remote job.
    pub async fn execute_with_cancel(
        &self,
        task: TaskDescriptor,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let trail = StdMutex::new(vec![TaskState::Idle]);
        let submitted = AtomicBool::new(false);

        info!(
            "Dispatching task {} to '{}' ({})",
            task.id,
            task.engine,
            task.mode.as_str()
        );

        let handle = match self.handle(&task.engine) {
            Ok(handle) => handle,
            Err(e) => {
                return self.fail(&task, started, &trail, FailureKind::Unknown, e.to_string());
            }
        };

        let work = self.run_task(handle, &task, &trail, &submitted);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interruption::Cancelled),
            result = tokio::time::timeout(task.timeout, work) => {
                result.map_err(|_| Interruption::TimedOut)
            }
        };

        match outcome {
            Ok(Ok(Outcome::Rows { output, row_limit })) => {
                push_state(&trail, TaskState::Completed);
                let ctx = self.context(&task, started, &trail, row_limit);
                let result = self.processor.process(output, ctx);
                info!(
                    "Task {} completed: {} rows in {} ms",
                    task.id, result.row_count, result.elapsed_ms
                );
                result
            }
            Ok(Ok(Outcome::Plan(plan))) => {
                push_state(&trail, TaskState::Completed);
                let cost = CostEstimate {
                    estimated_rows: plan.estimated_rows,
                    estimated_bytes_scanned: plan.estimated_bytes,
                    estimated_duration_class: DurationClass::classify(
                        plan.estimated_rows,
                        plan.estimated_bytes,
                    ),
                };
                debug!("Task {} plan:\n{}", task.id, plan.plan_text);
                let ctx = self.context(&task, started, &trail, None);
                self.processor.cost_estimate(cost, ctx)
            }
            Ok(Err(e)) => {
                let kind = classify(&e);
                match kind {
                    FailureKind::ConnectionLost => handle.set_state(ConnectionState::Idle),
                    // The engine gave up waiting; the remote job may still be running
                    FailureKind::Timeout | FailureKind::Cancelled => {
                        self.abandon(handle, &task, submitted.load(Ordering::SeqCst))
                            .await;
                    }
                    _ => {}
                }
                self.fail(&task, started, &trail, kind, e.to_string())
            }
            Err(interruption) => {
                self.abandon(handle, &task, submitted.load(Ordering::SeqCst))
                    .await;
                let (kind, message) = match interruption {
                    Interruption::Cancelled => {
                        (FailureKind::Cancelled, "Task cancelled by caller".to_string())
                    }
                    Interruption::TimedOut => (
                        FailureKind::Timeout,
                        format!("Task timed out after {} seconds", task.timeout.as_secs()),
                    ),
                };
                self.fail(&task, started, &trail, kind, message)
            }
        }
    }

    async fn run_task(
        &self,
        handle: &EngineHandle,
        task: &TaskDescriptor,
        trail: &StdMutex<Vec<TaskState>>,
        submitted: &AtomicBool,
    ) -> Result<Outcome, EngineError> {
        let mut client = handle.client.lock().await;
        let _running = RunningTask::start(&handle.view, task.id);
        client.set_resources(task.resources);

        if handle.state() != ConnectionState::Connected {
            push_state(trail, TaskState::Connecting);
        }
        Self::ensure_connected(handle, &mut **client).await?;
        push_state(trail, TaskState::Connected);

        match task.mode {
            ExecutionMode::Execute => {
                push_state(trail, TaskState::Executing);
                submitted.store(true, Ordering::SeqCst);
                let output = client
                    .run(&task.sql.text, &task.sql.params, task.timeout)
                    .await?;
                Ok(Outcome::Rows {
                    output,
                    row_limit: None,
                })
            }
            ExecutionMode::Preview { max_rows } => {
                push_state(trail, TaskState::Preview);
                let bounded = SqlValidator::bound_rows(&task.sql, max_rows)
                    .map_err(|e| EngineError::Rejected(e.to_string()))?;
                debug!("Preview SQL: {}", bounded.text);
                submitted.store(true, Ordering::SeqCst);
                let output = client
                    .run(&bounded.text, &bounded.params, task.timeout)
                    .await?;
                Ok(Outcome::Rows {
                    output,
                    row_limit: Some(usize::try_from(max_rows).unwrap_or(usize::MAX)),
                })
            }
            ExecutionMode::EstimateCost => {
                push_state(trail, TaskState::CostEstimate);
                submitted.store(true, Ordering::SeqCst);
                let plan = client.explain(&task.sql.text, &task.sql.params).await?;
                Ok(Outcome::Plan(plan))
            }
        }
    }

    /// Best-effort remote cancel after the local work was dropped
    async fn abandon(&self, handle: &EngineHandle, task: &TaskDescriptor, submitted: bool) {
        let mut client = handle.client.lock().await;
        if handle.state() == ConnectionState::Connecting {
            handle.set_state(ConnectionState::Idle);
        }
        if !submitted {
            return;
        }
        if let Err(e) = client.cancel(&task.id.to_string()).await {
            warn!("Remote cancel for task {} failed: {}", task.id, e);
        }
    }

    fn context(
        &self,
        task: &TaskDescriptor,
        started: Instant,
        trail: &StdMutex<Vec<TaskState>>,
        row_limit: Option<usize>,
    ) -> ResultContext {
        ResultContext {
            task_id: task.id,
            engine: task.engine.clone(),
            mode: task.mode,
            elapsed_ms: started.elapsed().as_millis() as u64,
            states: trail.lock().map(|s| s.clone()).unwrap_or_default(),
            row_limit,
        }
    }

    fn fail(
        &self,
        task: &TaskDescriptor,
        started: Instant,
        trail: &StdMutex<Vec<TaskState>>,
        kind: FailureKind,
        message: String,
    ) -> ExecutionResult {
        push_state(trail, TaskState::Failed);
        error!("Task {} failed [{}]: {}", task.id, kind, message);
        let ctx = self.context(task, started, trail, None);
        self.processor.failure(kind, message, ctx)
    }
}

impl Default for EngineDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn push_state(trail: &StdMutex<Vec<TaskState>>, state: TaskState) {
    if let Ok(mut states) = trail.lock() {
        states.push(state);
    }
}

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out"];
const RESOURCE_PATTERNS: &[&str] = &[
    "outofmemory",
    "gc overhead",
    "container killed",
    "exceeding memory",
    "no space left",
    "quota exceeded",
];
const SYNTAX_PATTERNS: &[&str] = &[
    "parseexception",
    "semanticexception",
    "analysisexception",
    "syntax error",
];
const CONNECTION_PATTERNS: &[&str] = &[
    "ttransportexception",
    "connection reset",
    "connection refused",
    "broken pipe",
    "session not found",
];

/// Map an engine error onto a failure kind by variant, then by message
pub fn classify(err: &EngineError) -> FailureKind {
    match err {
        EngineError::Timeout(_) => FailureKind::Timeout,
        EngineError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
        EngineError::Rejected(_) => FailureKind::SyntaxRejected,
        EngineError::Connection(_) | EngineError::NotConnected => FailureKind::ConnectionLost,
        EngineError::Cancelled(_) => FailureKind::Cancelled,
        EngineError::Protocol(message) => classify_message(message),
    }
}

fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    let any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));
    if any(RESOURCE_PATTERNS) {
        FailureKind::ResourceExhausted
    } else if any(SYNTAX_PATTERNS) {
        FailureKind::SyntaxRejected
    } else if any(CONNECTION_PATTERNS) {
        FailureKind::ConnectionLost
    } else if any(TIMEOUT_PATTERNS) {
        FailureKind::Timeout
    } else {
        FailureKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComplexityClass, ResourceHints, SqlStatement};
    use crate::services::testing::{ScriptedEngine, ScriptedReply};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn task(engine: &str, mode: ExecutionMode, timeout: Duration) -> TaskDescriptor {
        TaskDescriptor {
            id: Uuid::new_v4(),
            sql: SqlStatement {
                dialect: SqlDialect::SparkSql,
                text: "SELECT city, COUNT(*) AS count_all FROM users GROUP BY city".into(),
                params: vec![],
                complexity: ComplexityClass::Moderate,
            },
            engine: engine.to_string(),
            resources: ResourceHints {
                parallelism: 4,
                memory_mb: 4096,
            },
            timeout,
            mode,
            created_at: Utc::now(),
        }
    }

    fn rows(n: usize) -> RawEngineOutput {
        ScriptedEngine::rows(
            &[("city", "string"), ("count_all", "bigint")],
            (0..n).map(|i| vec![json!(format!("c{}", i)), json!(i)]).collect(),
        )
    }

    #[tokio::test]
    async fn test_execute_connects_lazily_and_reuses_connection() {
        let engine = ScriptedEngine::new("spark")
            .reply(ScriptedReply::Rows(rows(3)))
            .reply(ScriptedReply::Rows(rows(2)));
        let calls = engine.calls();
        let dispatcher = EngineDispatcher::new().with_engine(Box::new(engine));
        assert_eq!(
            dispatcher.connection_state("spark"),
            Some(ConnectionState::Idle)
        );

        let first = dispatcher
            .execute(task("spark", ExecutionMode::Execute, Duration::from_secs(5)))
            .await;
        assert!(first.success);
        assert_eq!(first.row_count, 3);
        assert_eq!(
            first.states,
            vec![
                TaskState::Idle,
                TaskState::Connecting,
                TaskState::Connected,
                TaskState::Executing,
                TaskState::Completed
            ]
        );

        let second = dispatcher
            .execute(task("spark", ExecutionMode::Execute, Duration::from_secs(5)))
            .await;
        assert!(second.success);
        assert!(!second.states.contains(&TaskState::Connecting));

        assert_eq!(calls.count("connect"), 1);
        assert_eq!(calls.count("run"), 2);
        assert_eq!(
            dispatcher.connection_state("spark"),
            Some(ConnectionState::Connected)
        );

        dispatcher.disconnect_all().await;
        assert_eq!(calls.count("disconnect"), 1);
        assert_eq!(
            dispatcher.connection_state("spark"),
            Some(ConnectionState::Idle)
        );
    }

    #[tokio::test]
    async fn test_preview_is_bounded() {
        // The engine ignores LIMIT and returns everything
        let engine = ScriptedEngine::new("spark").reply(ScriptedReply::Rows(rows(50)));
        let calls = engine.calls();
        let dispatcher = EngineDispatcher::new().with_engine(Box::new(engine));

        let result = dispatcher
            .execute(task(
                "spark",
                ExecutionMode::Preview { max_rows: 5 },
                Duration::from_secs(5),
            ))
            .await;
        assert!(result.success);
        assert!(result.row_count <= 5);
        assert!(result.truncated);
        assert!(result.states.contains(&TaskState::Preview));
        assert!(calls.last_sql().unwrap().ends_with("LIMIT 5"));
    }

    #[tokio::test]
    async fn test_estimate_cost_never_runs() {
        let engine = ScriptedEngine::new("hive").reply(ScriptedReply::Plan(EnginePlan {
            estimated_rows: Some(12_000),
            estimated_bytes: Some(4_800_000),
            plan_text: "plan".into(),
        }));
        let calls = engine.calls();
        let dispatcher = EngineDispatcher::new().with_engine(Box::new(engine));

        let result = dispatcher
            .execute(task("hive", ExecutionMode::EstimateCost, Duration::from_secs(5)))
            .await;
        assert!(result.success);
        let cost = result.cost.unwrap();
        assert_eq!(cost.estimated_rows, Some(12_000));
        assert_eq!(cost.estimated_duration_class, DurationClass::Seconds);
        assert_eq!(calls.count("explain"), 1);
        assert_eq!(calls.count("run"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_cost_timeout_is_classified_and_not_retried() {
        let engine = ScriptedEngine::new("hive")
            .with_delay(Duration::from_secs(60))
            .reply(ScriptedReply::Plan(EnginePlan::default()));
        let calls = engine.calls();
        let dispatcher = EngineDispatcher::new().with_engine(Box::new(engine));

        let result = dispatcher
            .execute(task("hive", ExecutionMode::EstimateCost, Duration::from_secs(30)))
            .await;
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(calls.count("explain"), 1);
        assert_eq!(calls.count("run"), 0);
        assert_eq!(calls.count("cancel"), 1);
        assert_eq!(result.states.last(), Some(&TaskState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_side_timeout_cancels_remote_job() {
        // The engine enforces the same deadline as the dispatcher
        let engine = ScriptedEngine::new("spark")
            .with_delay(Duration::from_secs(60))
            .reply(ScriptedReply::Rows(rows(1)));
        let calls = engine.calls();
        let dispatcher = EngineDispatcher::new().with_engine(Box::new(engine));
        dispatcher.connect("spark").await.unwrap();

        let result = dispatcher
            .execute(task("spark", ExecutionMode::Execute, Duration::from_secs(30)))
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(calls.count("run"), 1);
        assert_eq!(calls.count("cancel"), 1);
        assert_eq!(dispatcher.running_task("spark"), None);
    }

    #[tokio::test]
    async fn test_rejected_statement_is_not_cancelled() {
        let engine = ScriptedEngine::new("spark").reply(ScriptedReply::Error(
            EngineError::Rejected("ParseException line 1:7".into()),
        ));
        let calls = engine.calls();
        let dispatcher = EngineDispatcher::new().with_engine(Box::new(engine));
        let result = dispatcher
            .execute(task("spark", ExecutionMode::Execute, Duration::from_secs(5)))
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::SyntaxRejected));
        assert_eq!(calls.count("cancel"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_answers_while_task_runs() {
        let engine = ScriptedEngine::new("spark")
            .with_delay(Duration::from_secs(60))
            .reply(ScriptedReply::Rows(rows(1)));
        let dispatcher = Arc::new(EngineDispatcher::new().with_engine(Box::new(engine)));
        let long = task("spark", ExecutionMode::Execute, Duration::from_secs(3600));
        let task_id = long.id;

        let runner = dispatcher.clone();
        let running = tokio::spawn(async move { runner.execute(long).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(dispatcher.running_task("spark"), Some(task_id));
        assert_eq!(
            dispatcher.connection_state("spark"),
            Some(ConnectionState::Connected)
        );
        let status = tokio::time::timeout(Duration::from_millis(10), dispatcher.status("spark"))
            .await
            .expect("status waited for the running task")
            .unwrap();
        assert!(status.connected);
        assert_eq!(status.state, format!("busy (task {})", task_id));

        let result = running.await.unwrap();
        assert!(result.success);
        assert_eq!(dispatcher.running_task("spark"), None);
        let idle = dispatcher.status("spark").await.unwrap();
        assert_eq!(idle.state, "idle");
    }

    #[tokio::test]
    async fn test_engine_errors_are_classified() {
        let cases = vec![
            (
                EngineError::Rejected("ParseException line 1:7".into()),
                FailureKind::SyntaxRejected,
            ),
            (
                EngineError::ResourceExhausted("Java heap space".into()),
                FailureKind::ResourceExhausted,
            ),
            (
                EngineError::Protocol("java.lang.OutOfMemoryError: GC overhead limit exceeded".into()),
                FailureKind::ResourceExhausted,
            ),
            (
                EngineError::Protocol("something odd".into()),
                FailureKind::Unknown,
            ),
        ];
        for (error, expected) in cases {
            let engine = ScriptedEngine::new("spark").reply(ScriptedReply::Error(error));
            let dispatcher = EngineDispatcher::new().with_engine(Box::new(engine));
            let result = dispatcher
                .execute(task("spark", ExecutionMode::Execute, Duration::from_secs(5)))
                .await;
            assert_eq!(result.failure_kind(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_connection_loss_resets_state() {
        let engine = ScriptedEngine::new("spark").reply(ScriptedReply::Error(
            EngineError::Connection("connection reset by peer".into()),
        ));
        let dispatcher = EngineDispatcher::new().with_engine(Box::new(engine));
        let result = dispatcher
            .execute(task("spark", ExecutionMode::Execute, Duration::from_secs(5)))
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::ConnectionLost));
        assert_eq!(
            dispatcher.connection_state("spark"),
            Some(ConnectionState::Idle)
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let engine = ScriptedEngine::new("hive").failing_connect();
        let calls = engine.calls();
        let dispatcher = EngineDispatcher::new().with_engine(Box::new(engine));
        let result = dispatcher
            .execute(task("hive", ExecutionMode::Execute, Duration::from_secs(5)))
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::ConnectionLost));
        assert_eq!(calls.count("run"), 0);
        assert!(dispatcher.connect("hive").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation() {
        let engine = ScriptedEngine::new("spark")
            .with_delay(Duration::from_secs(600))
            .reply(ScriptedReply::Rows(rows(1)));
        let calls = engine.calls();
        let dispatcher = EngineDispatcher::new().with_engine(Box::new(engine));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = dispatcher
            .execute_with_cancel(
                task("spark", ExecutionMode::Execute, Duration::from_secs(3600)),
                &token,
            )
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Cancelled));
        assert!(token.is_cancelled());
        assert_eq!(calls.count("cancel"), 1);
    }

    #[tokio::test]
    async fn test_unregistered_engine_fails_without_panicking() {
        let dispatcher = EngineDispatcher::new().with_engine(Box::new(ScriptedEngine::new("spark")));
        let result = dispatcher
            .execute(task("presto", ExecutionMode::Execute, Duration::from_secs(5)))
            .await;
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::Unknown));
        assert_eq!(dispatcher.dialect_of("SPARK"), Some(SqlDialect::SparkSql));
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(
            classify_message("org.apache.thrift.transport.TTransportException"),
            FailureKind::ConnectionLost
        );
        assert_eq!(
            classify_message("SemanticException [Error 10001]: Table not found"),
            FailureKind::SyntaxRejected
        );
        assert_eq!(classify_message("read timed out"), FailureKind::Timeout);
    }
}
