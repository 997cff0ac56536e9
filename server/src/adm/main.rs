mod command;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use enum_as_inner::EnumAsInner;

use command::pool::{self, CreatePool, DeletePool, ListPools};
use command::reconcile::{self, Reconcile};
use stash_server::config;

/// Stash server administration utilities.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
pub struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// The sub-command.
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, EnumAsInner)]
pub enum Command {
    CreatePool(CreatePool),
    ListPools(ListPools),
    DeletePool(DeletePool),
    Reconcile(Reconcile),
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = config::load_config(opts.config.as_deref())?;

    match opts.command {
        Command::CreatePool(_) => pool::run_create(config, opts).await?,
        Command::ListPools(_) => pool::run_list(config, opts).await?,
        Command::DeletePool(_) => pool::run_delete(config, opts).await?,
        Command::Reconcile(_) => reconcile::run(config, opts).await?,
    }

    Ok(())
}
