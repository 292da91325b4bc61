// Command line surface: one question per positional argument
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::error::PipelineError;
use crate::models::{FormatOptions, FormatTag, RequestedMode, TaskOptions};
use crate::services::{AnalysisContext, Agent, CancellationToken, RetryPolicy, RunOutput, RunRequest};

/// Ask analytics questions in natural language and run them on Spark or Hive.
#[derive(Debug, Parser)]
#[clap(name = "bigdata-agent", version)]
pub struct Args {
    /// Questions to answer, e.g. "统计昨天用户注册数".
    ///
    /// Several questions run one after another as a batch.
    #[clap(required = true, trailing_var_arg = true)]
    pub query: Vec<String>,

    /// Output format.
    #[clap(long, value_enum, default_value_t = FormatTag::Table)]
    pub format: FormatTag,

    /// Execution engine (spark or hive). Defaults to the configured engine.
    #[clap(long)]
    pub engine: Option<String>,

    /// Run with a bounded row count instead of the full statement.
    #[clap(long)]
    pub preview: bool,

    /// Row bound for --preview.
    #[clap(long, requires = "preview")]
    pub preview_rows: Option<u64>,

    /// Ask the engine for a plan estimate without running the statement.
    #[clap(long, conflicts_with = "preview")]
    pub estimate_cost: bool,

    /// Reference time for relative expressions such as 昨天 or "last month".
    ///
    /// RFC 3339, "YYYY-MM-DD HH:MM:SS" or "YYYY-MM-DD". Defaults to now.
    #[clap(long, value_parser = parse_now)]
    pub now: Option<NaiveDateTime>,

    /// Task timeout in seconds.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// Retries for timeouts and lost connections.
    #[clap(long, default_value_t = 0)]
    pub retries: u32,

    /// Write the formatted output to this file instead of stdout.
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Configuration file (JSON).
    #[clap(long, env = "BIGDATA_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the generated SQL to stderr.
    #[clap(long)]
    pub show_sql: bool,
}

fn parse_now(value: &str) -> Result<NaiveDateTime, String> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.naive_local());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(ts);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| format!("'{}' is not a valid reference time", value))
}

impl Args {
    pub fn run_request(&self) -> RunRequest {
        let context = self
            .now
            .map(AnalysisContext::new)
            .unwrap_or_else(AnalysisContext::current);
        let mode = if self.estimate_cost {
            RequestedMode::EstimateCost
        } else if self.preview {
            RequestedMode::Preview
        } else {
            RequestedMode::Execute
        };
        RunRequest {
            engine: self.engine.clone(),
            options: TaskOptions {
                mode,
                preview_rows: self.preview_rows,
                timeout: self.timeout.map(Duration::from_secs),
                ..Default::default()
            },
            context,
            retry: RetryPolicy::with_retries(self.retries),
        }
    }
}

fn report<E: Write>(err: &mut E, error: &PipelineError) {
    let detail = error.detail();
    let _ = writeln!(err, "error[{}]: {}", detail.code, detail.message);
    if let Some(hint) = detail.details {
        let _ = writeln!(err, "  hint: {}", hint);
    }
}

fn show_sql<E: Write>(err: &mut E, output: &RunOutput) {
    let sql = &output.translation.sql;
    let _ = writeln!(err, "-- {} ({})", output.translation.engine, sql.dialect);
    let _ = writeln!(err, "{}", sql.text);
    if !sql.params.is_empty() {
        let params: Vec<String> = sql.params.iter().map(|p| p.to_string()).collect();
        let _ = writeln!(err, "-- params: {}", params.join(", "));
    }
}

/// Run every question and print the results. Returns the process exit code:
/// 0 when all succeeded, 1 when any stage or execution failed.
pub async fn run<W: Write, E: Write>(
    args: &Args,
    agent: &Agent,
    cancel: &CancellationToken,
    out: &mut W,
    err: &mut E,
) -> i32 {
    let request = args.run_request();
    let batch = args.query.len() > 1;
    let outcomes = agent.run_batch(&args.query, &request, cancel).await;

    let mut failed = false;
    let mut rendered = Vec::new();
    for outcome in outcomes {
        let output = match outcome.outcome {
            Ok(output) => output,
            Err(e) => {
                if batch {
                    let _ = writeln!(err, "query: {}", outcome.query);
                }
                report(err, &e);
                failed = true;
                continue;
            }
        };

        if args.show_sql {
            show_sql(err, &output);
        }
        if let Some(failure) = &output.result.failure {
            if batch {
                let _ = writeln!(err, "query: {}", outcome.query);
            }
            let _ = writeln!(err, "error[{}]: {}", failure.kind.code(), failure.message);
            failed = true;
            continue;
        }

        let options = FormatOptions {
            title: batch.then(|| outcome.query.clone()),
            ..Default::default()
        };
        match agent.format(&output, args.format, &options) {
            Ok(formatted) => rendered.push(formatted.content),
            Err(e) => {
                report(err, &e);
                failed = true;
            }
        }
    }

    let mut payload = rendered.join("\n");
    if !payload.is_empty() && !payload.ends_with('\n') {
        payload.push('\n');
    }
    match &args.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, payload.as_bytes()) {
                report(err, &PipelineError::Io(e));
                return 1;
            }
            info!("Wrote {} bytes to {}", payload.len(), path.display());
        }
        None => {
            if out.write_all(payload.as_bytes()).is_err() {
                return 1;
            }
        }
    }

    if failed {
        1
    } else {
        0
    }
}
