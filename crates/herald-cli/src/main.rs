mod bootstrap_helpers;
mod cli_args;
mod herald_config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;

use cli_args::{Cli, CliCommand};
use herald_config::load_herald_config;
use herald_runtime::{validate_gateway_config, ChatGatewayRuntime};

#[tokio::main]
async fn main() {
    bootstrap_helpers::init_tracing();
    if let Err(error) = run().await {
        tracing::error!("herald failed: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_herald_config(cli.config.as_deref())?;

    match cli.command {
        CliCommand::CheckConfig => {
            let runtime_config = config.to_runtime_config();
            validate_gateway_config(&runtime_config).context("configuration rejected")?;
            println!(
                "config ok: prefix='{}' seeded_commands=[{}] state_dir={} sandbox_timeout_ms={} sandbox_memory_limit_bytes={}",
                runtime_config.command_prefix,
                runtime_config.seeded_commands.join(", "),
                runtime_config.state_dir.display(),
                runtime_config.sandbox.limits.timeout_ms,
                runtime_config.sandbox.limits.memory_limit_bytes
            );
            Ok(())
        }
        CliCommand::Serve { state_dir, events } => {
            let mut runtime_config = config.to_runtime_config();
            if let Some(state_dir) = state_dir {
                runtime_config.state_dir = state_dir;
            }
            // Startup is fail-fast: storage, seed-list, and sandbox problems
            // all abort here, before the first event is read.
            let runtime = ChatGatewayRuntime::start(runtime_config).await?;

            let stdout = tokio::io::stdout();
            let summary = if events == "-" {
                Arc::clone(&runtime)
                    .run_event_stream(BufReader::new(tokio::io::stdin()), stdout)
                    .await?
            } else {
                let file = tokio::fs::File::open(&events)
                    .await
                    .with_context(|| format!("failed to open event source {events}"))?;
                Arc::clone(&runtime)
                    .run_event_stream(BufReader::new(file), stdout)
                    .await?
            };
            tracing::info!(
                received = summary.received,
                malformed = summary.malformed,
                replied = summary.replied,
                "event stream finished"
            );
            runtime.shutdown().await;
            Ok(())
        }
    }
}
