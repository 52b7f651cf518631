//! Operator CLI for the provider master-data pipeline.
//!
//! Applies change batches read from JSON Lines files, evaluates rules,
//! scores table quality and lets data stewards update violations. Each
//! command prints a JSON report unless `--quiet` is given.
//!
//! Ctrl-C during `process` stops scheduling new partitions; the batch is left
//! incomplete and resumes on the next run with the same batch id.

use clap::Parser;
use goldrec::{Cli, execute};
use goldrec_core::{Result, init_logging};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_format.into())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing running partitions");
            on_signal.cancel();
        }
    });

    let report = execute(&cli, &cancel).await.map_err(|e| {
        error!(kind = e.kind(), "Command failed: {}", e);
        e
    })?;

    if !cli.global.quiet && cli.global.output.is_none() {
        println!("{}", report);
    }
    Ok(())
}
