use chrono::NaiveDateTime;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::PipelineError;
use crate::models::{Intent, IntentCategory, SchemaCatalog};
use crate::services::query_analyzer::QueryDraft;

/// Opaque text-completion service
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, PipelineError>;
}

/// HTTP client for the LLM gateway
pub struct LlmService {
    gateway_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    max_tokens: u32,
    http_client: HttpClient,
}

impl LlmService {
    pub fn new(config: &LlmConfig) -> Result<Self, PipelineError> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::LlmService(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            gateway_url: config.gateway_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            http_client,
        })
    }

    /// Call LLM API and return the completion text
    async fn call_llm_api(&self, prompt: &str) -> Result<String, PipelineError> {
        if self.gateway_url.is_empty() {
            return Err(PipelineError::LlmService(
                "LLM gateway is not configured".to_string(),
            ));
        }

        let mut request = self.http_client.post(&self.gateway_url).json(&json!({
            "prompt": prompt,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "model": self.model,
        }));

        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::LlmService(format!("Failed to call LLM service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::LlmService(format!(
                "LLM service returned error {}: {}",
                status, error_text
            )));
        }

        let result: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::LlmService(format!("Failed to parse LLM response: {}", e)))?;

        let text = result["text"]
            .as_str()
            .or_else(|| result["content"].as_str())
            .or_else(|| result["response"].as_str())
            .ok_or_else(|| {
                PipelineError::LlmService("LLM response does not contain any text".to_string())
            })?;

        Ok(text.to_string())
    }
}

#[async_trait::async_trait]
impl CompletionClient for LlmService {
    async fn complete(&self, prompt: &str) -> Result<String, PipelineError> {
        self.call_llm_api(prompt).await
    }
}

/// Remove markdown code fences around a JSON answer
pub fn strip_code_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

const INTENT_PROMPT: &str = r#"You classify analytics questions about a data warehouse.

Categories:
{categories}

Question: {question}

Answer with JSON only, no explanation:
{"category": "<one category name>", "confidence": <number between 0 and 1>}"#;

const QUERY_PROMPT: &str = r#"You turn analytics questions into a structured query over the schema below.

{catalog}

Current time: {now}
Intent: {intent}
Question: {question}

Answer with JSON only, no explanation. Use table and column names from the schema.
{
  "table": "<table>",
  "measures": [{"function": "count|sum|avg|max|min", "column": "<column or omit for COUNT(*)>"}],
  "dimensions": [{"column": "<column>", "granularity": "hour|day|week|month|year or omit"}],
  "filters": [{"column": "<column>", "operator": "=|!=|>|>=|<|<=|like", "value": <value>}],
  "time_range": {"column": "<time column>", "relative": "<e.g. 昨天 or last 7 days>", "start": "YYYY-MM-DD", "end": "YYYY-MM-DD"},
  "order_by": [{"key": "<measure alias or dimension>", "descending": true}],
  "limit": <number or omit>
}"#;

/// Prompt templates, loaded once and read-only afterwards
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    intent: String,
    query: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self::new(INTENT_PROMPT, QUERY_PROMPT)
    }
}

impl PromptTemplates {
    pub fn new(intent: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            query: query.into(),
        }
    }

    pub fn render_intent(&self, question: &str) -> String {
        let categories = IntentCategory::PRIORITY
            .iter()
            .map(|c| format!("- {}: {}", c.as_str(), c.description()))
            .collect::<Vec<_>>()
            .join("\n");
        self.intent
            .replace("{categories}", &categories)
            .replace("{question}", question)
    }

    pub fn render_query(
        &self,
        question: &str,
        catalog: &str,
        intent: &Intent,
        now: NaiveDateTime,
    ) -> String {
        self.query
            .replace("{catalog}", catalog)
            .replace("{now}", &now.format("%Y-%m-%d %H:%M:%S").to_string())
            .replace("{intent}", intent.category.as_str())
            .replace("{question}", question)
    }
}

/// Prepare catalog context for the LLM
pub fn prepare_catalog_context(catalog: &SchemaCatalog) -> String {
    let mut context = String::from("Tables:\n");
    for table in &catalog.tables {
        match &table.database {
            Some(db) => context.push_str(&format!("  - {}.{}", db, table.name)),
            None => context.push_str(&format!("  - {}", table.name)),
        }
        if !table.aliases.is_empty() {
            context.push_str(&format!(" (also: {})", table.aliases.join(", ")));
        }
        context.push('\n');
        if let Some(description) = &table.description {
            context.push_str(&format!("    {}\n", description));
        }
        context.push_str("    Columns:\n");
        for column in &table.columns {
            context.push_str(&format!("      * {} ({})", column.name, column.data_type));
            if table.key_column.as_deref() == Some(column.name.as_str()) {
                context.push_str(" [KEY]");
            }
            if table.time_column.as_deref() == Some(column.name.as_str()) {
                context.push_str(" [TIME]");
            }
            if !column.aliases.is_empty() {
                context.push_str(&format!(" aka {}", column.aliases.join("/")));
            }
            context.push('\n');
        }
    }
    context
}

/// Resolves ambiguous questions through a completion service.
/// Every answer is validated before it reaches the deterministic stages.
pub struct LlmResolver {
    client: Arc<dyn CompletionClient>,
    templates: PromptTemplates,
    catalog_context: String,
}

impl LlmResolver {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        templates: PromptTemplates,
        catalog: &SchemaCatalog,
    ) -> Self {
        Self {
            client,
            templates,
            catalog_context: prepare_catalog_context(catalog),
        }
    }

    pub async fn resolve_intent(&self, question: &str) -> Result<Intent, PipelineError> {
        let prompt = self.templates.render_intent(question);
        let answer = self.client.complete(&prompt).await?;
        debug!("LLM intent answer: {}", answer);
        parse_intent(strip_code_fences(&answer), question)
    }

    pub async fn resolve_query(
        &self,
        question: &str,
        intent: &Intent,
        now: NaiveDateTime,
    ) -> Result<QueryDraft, PipelineError> {
        let prompt = self
            .templates
            .render_query(question, &self.catalog_context, intent, now);
        let answer = self.client.complete(&prompt).await?;
        debug!("LLM query answer: {}", answer);
        serde_json::from_str::<QueryDraft>(strip_code_fences(&answer)).map_err(|e| {
            warn!("Rejected LLM query draft: {}", e);
            PipelineError::PromptResponseMalformed(format!("Query draft is not valid JSON: {}", e))
        })
    }
}

fn parse_intent(answer: &str, question: &str) -> Result<Intent, PipelineError> {
    let value: Value = serde_json::from_str(answer).map_err(|e| {
        PipelineError::PromptResponseMalformed(format!("Intent answer is not valid JSON: {}", e))
    })?;

    let category = value
        .get("category")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            PipelineError::PromptResponseMalformed("Intent answer has no category".to_string())
        })?;
    let category = category.parse::<IntentCategory>().map_err(|_| {
        PipelineError::PromptResponseMalformed(format!("Unknown intent category '{}'", category))
    })?;

    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            PipelineError::PromptResponseMalformed("Intent answer has no confidence".to_string())
        })?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(PipelineError::PromptResponseMalformed(format!(
            "Confidence {} is outside [0, 1]",
            confidence
        )));
    }

    Ok(Intent::new(category, confidence, question))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::ScriptedCompletion;
    use chrono::NaiveDate;

    fn resolver(answers: &[&str]) -> (LlmResolver, Arc<ScriptedCompletion>) {
        let client = Arc::new(ScriptedCompletion::new(answers));
        let resolver = LlmResolver::new(
            client.clone(),
            PromptTemplates::default(),
            &SchemaCatalog::builtin(),
        );
        (resolver, client)
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_catalog_context_lists_tables_and_columns() {
        let context = prepare_catalog_context(&SchemaCatalog::builtin());
        assert!(context.contains("  - users (also: 用户"));
        assert!(context.contains("* registered_at (timestamp) [TIME]"));
        assert!(context.contains("* order_id (integer) [KEY]"));
    }

    #[tokio::test]
    async fn test_resolve_intent() {
        let (resolver, client) = resolver(&["```json\n{\"category\": \"trend\", \"confidence\": 0.82}\n```"]);
        let intent = resolver.resolve_intent("看看最近的走势").await.unwrap();
        assert_eq!(intent.category, IntentCategory::Trend);
        assert_eq!(intent.raw_text, "看看最近的走势");
        assert!(client.prompts()[0].contains("Question: 看看最近的走势"));
    }

    #[tokio::test]
    async fn test_malformed_intent_answers_are_rejected() {
        for answer in [
            "I think it is a trend",
            r#"{"category": "forecast", "confidence": 0.9}"#,
            r#"{"category": "trend", "confidence": 7}"#,
            r#"{"category": "trend"}"#,
        ] {
            let (resolver, _) = resolver(&[answer]);
            let err = resolver.resolve_intent("q").await.unwrap_err();
            assert_eq!(err.code(), "PROMPT_RESPONSE_MALFORMED", "{}", answer);
        }
    }

    #[tokio::test]
    async fn test_resolve_query_draft() {
        let (resolver, client) = resolver(&[
            r#"{"table": "orders", "measures": [{"function": "sum", "column": "amount"}], "limit": 3}"#,
            "{not json",
        ]);
        let intent = Intent::new(IntentCategory::Ranking, 0.9, "q");
        let now = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();

        let draft = resolver.resolve_query("q", &intent, now).await.unwrap();
        assert_eq!(draft.table.as_deref(), Some("orders"));
        assert_eq!(draft.limit, Some(3));
        assert!(client.prompts()[0].contains("Current time: 2024-03-15 10:00:00"));

        let err = resolver.resolve_query("q", &intent, now).await.unwrap_err();
        assert_eq!(err.code(), "PROMPT_RESPONSE_MALFORMED");
    }

    #[tokio::test]
    async fn test_unconfigured_gateway() {
        let config = crate::config::Config::load(None).unwrap();
        let mut llm = config.llm.clone();
        llm.gateway_url = String::new();
        let service = LlmService::new(&llm).unwrap();
        let err = service.complete("hello").await.unwrap_err();
        assert_eq!(err.code(), "LLM_SERVICE_ERROR");
    }
}
