// End-to-end pipeline: question -> SQL -> task -> engine -> result
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Config, TaskConfig};
use crate::error::PipelineError;
use crate::models::{
    ExecutionResult, FailureKind, FormatOptions, FormatTag, FormattedOutput, Intent, QuerySpec,
    SchemaCatalog, SqlStatement, TaskOptions,
};
use crate::services::dispatcher::{CancellationToken, EngineDispatcher};
use crate::services::formatters::FormatterRegistry;
use crate::services::intent_recognizer::IntentRecognizer;
use crate::services::llm_service::{LlmResolver, LlmService, PromptTemplates};
use crate::services::query_analyzer::{AnalysisContext, QueryAnalyzer};
use crate::services::sql_generator::SqlGenerator;
use crate::services::task_builder::TaskBuilder;

/// Caller-side retry policy. Only timeouts and lost connections are retried;
/// resubmitting a rejected or resource-starved statement unchanged cannot succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn is_retryable(kind: FailureKind) -> bool {
        matches!(kind, FailureKind::Timeout | FailureKind::ConnectionLost)
    }

    pub fn should_retry(&self, kind: FailureKind, attempt: u32) -> bool {
        attempt < self.max_attempts && Self::is_retryable(kind)
    }

    /// Delay after the given attempt (1-based), doubling each time up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Per-run settings shared by single and batch runs
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub engine: Option<String>,
    pub options: TaskOptions,
    pub context: AnalysisContext,
    pub retry: RetryPolicy,
}

impl RunRequest {
    pub fn new(context: AnalysisContext) -> Self {
        Self {
            engine: None,
            options: TaskOptions::default(),
            context,
            retry: RetryPolicy::none(),
        }
    }
}

/// Everything produced before dispatch
#[derive(Debug, Clone)]
pub struct Translation {
    pub intent: Intent,
    pub spec: QuerySpec,
    pub sql: SqlStatement,
    pub engine: String,
    /// The completion service supplied the intent or the query shape
    pub used_llm: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub translation: Translation,
    pub result: ExecutionResult,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub query: String,
    pub outcome: Result<RunOutput, PipelineError>,
}

pub struct Agent {
    recognizer: IntentRecognizer,
    analyzer: QueryAnalyzer,
    generator: SqlGenerator,
    builder: TaskBuilder,
    dispatcher: EngineDispatcher,
    resolver: Option<LlmResolver>,
    formatters: FormatterRegistry,
}

impl Agent {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        task: TaskConfig,
        default_engine: &str,
        dispatcher: EngineDispatcher,
    ) -> Self {
        let builder = TaskBuilder::new(task, dispatcher.engine_names(), default_engine);
        Self {
            recognizer: IntentRecognizer::default(),
            analyzer: QueryAnalyzer::new(catalog),
            generator: SqlGenerator::new(),
            builder,
            dispatcher,
            resolver: None,
            formatters: FormatterRegistry::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: LlmResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let catalog = match config.catalog.path.as_deref() {
            Some(path) => SchemaCatalog::from_json_file(Path::new(path))?,
            None => SchemaCatalog::builtin(),
        };
        let catalog = Arc::new(catalog);
        let dispatcher = EngineDispatcher::from_config(&config.engine)?;
        let agent = Self::new(
            catalog.clone(),
            config.task.clone(),
            &config.engine.default,
            dispatcher,
        );

        if !config.llm_enabled() {
            info!("LLM fallback disabled");
            return Ok(agent);
        }
        let client = Arc::new(LlmService::new(&config.llm)?);
        info!("LLM fallback enabled (model {})", config.llm.model);
        Ok(agent.with_resolver(LlmResolver::new(
            client,
            PromptTemplates::default(),
            &catalog,
        )))
    }

    pub fn dispatcher(&self) -> &EngineDispatcher {
        &self.dispatcher
    }

    pub fn default_engine(&self) -> &str {
        self.builder.default_engine()
    }

    /// Recognise, analyse and generate. Nothing is sent to an engine.
    pub async fn translate(
        &self,
        text: &str,
        engine: Option<&str>,
        ctx: &AnalysisContext,
    ) -> Result<Translation, PipelineError> {
        let requested = engine.unwrap_or(self.builder.default_engine());
        let dialect = self
            .dispatcher
            .dialect_of(requested)
            .ok_or_else(|| PipelineError::UnknownEngine {
                name: requested.to_string(),
                registered: self.dispatcher.engine_names(),
            })?;

        let mut used_llm = false;
        let mut intent = self.recognizer.recognize(text);
        if !intent.is_confident() {
            if let Some(resolver) = &self.resolver {
                match resolver.resolve_intent(text).await {
                    Ok(resolved) => {
                        info!(
                            "LLM resolved intent {} ({:.2})",
                            resolved.category, resolved.confidence
                        );
                        intent = resolved;
                        used_llm = true;
                    }
                    Err(PipelineError::LlmService(msg)) => {
                        warn!("LLM intent fallback unavailable: {}", msg);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let analysed = self.analyzer.analyze(text, &intent, ctx);
        let spec = match (&self.resolver, analysed) {
            (Some(resolver), Ok(spec)) if !spec.is_resolved() => {
                match self.resolve_draft(resolver, text, &intent, ctx).await? {
                    Some(drafted) => {
                        used_llm = true;
                        drafted
                    }
                    None => spec,
                }
            }
            (Some(resolver), Err(PipelineError::Analysis(msg))) => {
                match self.resolve_draft(resolver, text, &intent, ctx).await? {
                    Some(drafted) => {
                        used_llm = true;
                        drafted
                    }
                    None => return Err(PipelineError::Analysis(msg)),
                }
            }
            (_, analysed) => analysed?,
        };

        let sql = self.generator.generate(&spec, dialect)?;
        info!("Translated '{}' for {}: {}", text, requested, sql.text);
        Ok(Translation {
            intent,
            spec,
            sql,
            engine: requested.to_lowercase(),
            used_llm,
        })
    }

    /// `None` when the completion service is unreachable; malformed answers are errors
    async fn resolve_draft(
        &self,
        resolver: &LlmResolver,
        text: &str,
        intent: &Intent,
        ctx: &AnalysisContext,
    ) -> Result<Option<QuerySpec>, PipelineError> {
        warn!("Falling back to the LLM for '{}'", text);
        match resolver.resolve_query(text, intent, ctx.now).await {
            Ok(draft) => self.analyzer.analyze_draft(&draft, intent, ctx).map(Some),
            Err(PipelineError::LlmService(msg)) => {
                warn!("LLM query fallback unavailable: {}", msg);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn run(&self, text: &str, request: &RunRequest) -> Result<RunOutput, PipelineError> {
        self.run_with_cancel(text, request, &CancellationToken::new())
            .await
    }

    /// Engine failures come back inside `RunOutput::result`; errors are pipeline-stage failures only.
    pub async fn run_with_cancel(
        &self,
        text: &str,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, PipelineError> {
        let translation = self
            .translate(text, request.engine.as_deref(), &request.context)
            .await?;

        let mut attempt = 1;
        loop {
            // Each attempt is a fresh task with its own id
            let task = self.builder.build(
                translation.sql.clone(),
                Some(translation.engine.as_str()),
                &request.options,
            )?;
            let result = self.dispatcher.execute_with_cancel(task, cancel).await;

            let retry = result
                .failure_kind()
                .is_some_and(|kind| request.retry.should_retry(kind, attempt));
            if !retry || cancel.is_cancelled() {
                return Ok(RunOutput {
                    translation,
                    result,
                    attempts: attempt,
                });
            }

            let delay = request.retry.backoff(attempt);
            warn!(
                "Attempt {}/{} failed ({}), retrying in {:?}",
                attempt,
                request.retry.max_attempts,
                result.failure_kind().unwrap_or(FailureKind::Unknown),
                delay
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(RunOutput {
                        translation,
                        result,
                        attempts: attempt,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Run queries one after another; a failing query never stops the batch
    pub async fn run_batch(
        &self,
        queries: &[String],
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(queries.len());
        for (i, query) in queries.iter().enumerate() {
            info!("Batch query {}/{}: {}", i + 1, queries.len(), query);
            let outcome = self.run_with_cancel(query, request, cancel).await;
            if let Err(e) = &outcome {
                warn!("Batch query {} failed: {}", i + 1, e);
            }
            outcomes.push(BatchOutcome {
                query: query.clone(),
                outcome,
            });
        }
        outcomes
    }

    pub fn format(
        &self,
        output: &RunOutput,
        tag: FormatTag,
        options: &FormatOptions,
    ) -> Result<FormattedOutput, PipelineError> {
        let mut options = options.clone();
        if options.chart.is_none() && !output.result.mode.is_dry_run() {
            options.chart = Some(output.translation.spec.chart_hints());
        }
        self.formatters.format(&output.result, tag, &options)
    }

    pub async fn shutdown(&self) {
        self.dispatcher.disconnect_all().await;
    }
}
