use anyhow::Context;
use clap::Parser;
use std::io::Write;
use tracing::{error, info};

use bigdata_agent::cli::{self, Args};
use bigdata_agent::config::Config;
use bigdata_agent::services::{Agent, CancellationToken};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    // Initialize logging; stdout carries results only
    let ansi = match config.logging.style.as_str() {
        "never" => false,
        "always" => true,
        _ => std::io::IsTerminal::is_terminal(&std::io::stderr()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .init();

    let agent = Agent::from_config(&config).context("failed to initialise the pipeline")?;
    info!("Default engine: {}", agent.default_engine());

    // Ctrl-C abandons the running task and asks the engine to cancel it
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr();
    let code = cli::run(&args, &agent, &cancel, &mut stdout, &mut stderr).await;

    let _ = stdout.flush();
    agent.shutdown().await;
    std::process::exit(code);
}
