use anyhow::{anyhow, Result};
use clap::Parser;

use crate::Opts;
use stash_server::config::Config;
use stash_server::{analysis, transfer, StateInner};

/// Finish analyses interrupted by a restart.
///
/// Attachments that were uploaded but never left temporary storage
/// are analyzed again. Those that fail are removed.
#[derive(Debug, Parser)]
pub struct Reconcile {}

pub async fn run(config: Config, opts: Opts) -> Result<()> {
    opts.command
        .as_reconcile()
        .ok_or_else(|| anyhow!("Wrong sub-command"))?;

    let state = StateInner::new(config).await;
    let workers = transfer::spawn_deletion_workers(&state);

    let report = analysis::reconcile(&state).await?;
    state.drain_deletions().await;

    for worker in workers {
        worker.abort();
    }

    eprintln!(
        "✅ Analyzed {}, removed {}",
        report.analyzed, report.removed
    );

    Ok(())
}
