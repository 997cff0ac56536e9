use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::join;
use tokio::task::spawn;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use stash_server::{config, gc, StateInner};

/// Content-addressed attachment storage engine.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Mode to run.
    #[clap(long, default_value = "monolithic")]
    mode: ServerMode,

    /// Whether to enable tokio-console.
    ///
    /// The console server will listen on its default port.
    #[clap(long)]
    tokio_console: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServerMode {
    /// Run all components.
    Monolithic,

    /// Run the analysis and deletion workers.
    Workers,

    /// Run the garbage collector periodically.
    GarbageCollector,

    /// Run the database migrations then exit.
    DbMigrations,

    /// Run garbage collection then exit.
    GarbageCollectorOnce,

    /// Check the configuration then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    init_logging(opts.tokio_console);
    dump_version();

    let config = config::load_config(opts.config.as_deref())?;

    match opts.mode {
        ServerMode::Monolithic => {
            stash_server::run_migrations(config.clone()).await?;

            let state = StateInner::new(config).await;
            let (workers, _) = join!(
                stash_server::run_workers(state.clone()),
                gc::run_garbage_collection(state.clone()),
            );

            workers?;
        }
        ServerMode::Workers => {
            let state = StateInner::new(config).await;
            stash_server::run_workers(state).await?;
        }
        ServerMode::GarbageCollector => {
            let state = StateInner::new(config).await;
            gc::run_garbage_collection(state).await;
        }
        ServerMode::DbMigrations => {
            stash_server::run_migrations(config).await?;
        }
        ServerMode::GarbageCollectorOnce => {
            let state = StateInner::new(config).await;
            let report = gc::run_garbage_collection_once(&state).await?;

            eprintln!(
                "Marked {}, removed {} fragments, swept {}",
                report.marked, report.fragments_removed, report.swept
            );
        }
        ServerMode::CheckConfig => {
            // load_config already validated everything
        }
    }

    Ok(())
}

fn init_logging(tokio_console: bool) {
    let env_filter = EnvFilter::from_default_env();
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);

    let error_layer = ErrorLayer::default();

    let console_layer = if tokio_console {
        let (layer, server) = console_subscriber::ConsoleLayer::new();
        spawn(server.serve());
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(error_layer)
        .with(console_layer)
        .init();

    if tokio_console {
        eprintln!("Note: tokio-console is enabled");
    }
}

fn dump_version() {
    #[cfg(debug_assertions)]
    eprintln!("Stash Server {} (debug)", env!("CARGO_PKG_VERSION"));

    #[cfg(not(debug_assertions))]
    eprintln!("Stash Server {} (release)", env!("CARGO_PKG_VERSION"));
}
