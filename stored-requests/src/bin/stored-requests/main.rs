use anyhow::Result;
use clap::Parser;
use stored_requests::{
    cli::interface::{StoredRequestsCli, run_cli},
    logging::init_logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = StoredRequestsCli::parse();
    run_cli(cli).await
}
