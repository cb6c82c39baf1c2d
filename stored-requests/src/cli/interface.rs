use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::{
    config::Config,
    context::FetchContext,
    fetcher::{FetchError, StoredMap},
    metrics::TracingMetrics,
    pipeline::{Pipeline, StoredRequests},
};

#[derive(Debug, Parser)]
#[clap(about = "Resolve stored requests and serve cache events")]
pub struct StoredRequestsCli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve IDs through the configured pipeline and print the result as JSON.
    Fetch(FetchCommand),
    /// Run the event producers and the push API until Ctrl-C.
    Serve(ServeCommand),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Section {
    StoredRequests,
    StoredVideo,
    StoredResponses,
    Accounts,
}

#[derive(Debug, Args)]
struct FetchCommand {
    #[arg(long)]
    config: PathBuf,
    /// The pipeline serving requests and imps.
    #[arg(long, value_enum, default_value = "stored-requests")]
    section: Section,
    #[arg(long = "request-id")]
    request_ids: Vec<String>,
    #[arg(long = "imp-id")]
    imp_ids: Vec<String>,
    #[arg(long = "response-id")]
    response_ids: Vec<String>,
    #[arg(long = "account-id")]
    account_ids: Vec<String>,
}

#[derive(Debug, Args)]
struct ServeCommand {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
}

async fn build(config: &Path) -> Result<StoredRequests> {
    let config = Config::from_yaml_file(config)
        .with_context(|| format!("❌ Failed to load {}", config.display()))?;
    StoredRequests::new(&config, Arc::new(TracingMetrics))
        .await
        .context("❌ Failed to set up stored data")
}

#[derive(Debug, Serialize)]
struct FetchOutput {
    requests: StoredMap,
    imps: StoredMap,
    responses: StoredMap,
    accounts: StoredMap,
    errors: Vec<String>,
}

fn error_messages(errors: &[FetchError]) -> Vec<String> {
    errors.iter().map(|err| err.kind().to_string()).collect()
}

async fn fetch(cmd: FetchCommand) -> Result<()> {
    let stored = build(&cmd.config).await?;
    let pipeline: &Pipeline = match cmd.section {
        Section::StoredRequests => &stored.requests,
        Section::StoredVideo => &stored.video,
        Section::StoredResponses => &stored.responses,
        Section::Accounts => &stored.accounts,
    };
    let ctx = FetchContext::background();

    let mut errors = Vec::new();
    let requests =
        pipeline.fetcher().fetch_requests(&ctx, &cmd.request_ids, &cmd.imp_ids).await;
    errors.extend(error_messages(&requests.errors));

    let mut responses = StoredMap::new();
    if !cmd.response_ids.is_empty() {
        let res = stored.responses.fetcher().fetch_responses(&ctx, &cmd.response_ids).await;
        errors.extend(error_messages(&res.errors));
        responses = res.data;
    }
    let mut accounts = StoredMap::new();
    if !cmd.account_ids.is_empty() {
        let res = stored.accounts.fetcher().fetch_accounts(&ctx, &cmd.account_ids).await;
        errors.extend(error_messages(&res.errors));
        accounts = res.data;
    }

    let output = FetchOutput {
        requests: requests.requests,
        imps: requests.imps,
        responses,
        accounts,
        errors,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    stored.shutdown().await;
    Ok(())
}

async fn serve(cmd: ServeCommand) -> Result<()> {
    let stored = build(&cmd.config).await?;
    let listener = tokio::net::TcpListener::bind(cmd.bind)
        .await
        .with_context(|| format!("❌ Failed to bind {}", cmd.bind))?;
    println!("✅ Serving stored data events on {}", cmd.bind);

    axum::serve(listener, stored.router())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Cannot listen for Ctrl-C");
            }
        })
        .await
        .context("❌ Server failed")?;
    stored.shutdown().await;
    Ok(())
}

pub async fn run_cli(args: StoredRequestsCli) -> Result<()> {
    match args.cmd {
        Command::Fetch(cmd) => fetch(cmd).await,
        Command::Serve(cmd) => serve(cmd).await,
    }
    .map_err(|e| {
        eprintln!("❌ CLI Error: {:#}", e);

        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("   ↳ Caused by: {}", cause);
            source = cause.source();
        }

        e
    })
}
