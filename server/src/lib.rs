#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod analysis;
pub mod attachment;
pub mod boost;
pub mod cache;
pub mod config;
pub mod database;
pub mod dedup;
pub mod error;
pub mod gc;
pub mod pool;
pub mod queue;
pub mod storage;
pub mod transfer;
pub mod upload;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sea_orm::{query::Statement, ConnectionTrait, Database, DatabaseConnection};
use tokio::sync::OnceCell;
use tokio::time;

use analysis::AnalyzeTask;
use cache::MetadataCache;
use config::Config;
use database::migration::{Migrator, MigratorTrait};
use error::{ServerError, ServerResult};
use queue::TaskQueue;
use storage::DestinationRegistry;
use transfer::DeletionTask;

pub type State = Arc<StateInner>;

/// Global server state.
#[derive(Debug)]
pub struct StateInner {
    /// The Stash Server configuration.
    config: Config,

    /// Handle to the database.
    database: OnceCell<DatabaseConnection>,

    /// The storage destinations.
    destinations: OnceCell<DestinationRegistry>,

    /// Cache of attachment and fragment records.
    cache: MetadataCache,

    /// Attachments waiting to be analyzed.
    analysis_queue: TaskQueue<AnalyzeTask>,

    /// Objects waiting to be deleted.
    deletion_queue: TaskQueue<DeletionTask>,
}

/// The account performing an operation.
///
/// Authentication happens elsewhere. The engine only needs to know
/// who the caller is and how much they may upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    /// Opaque account ID.
    pub account_id: u64,

    /// Maximum size of a single upload, if limited.
    pub max_upload_size: Option<u64>,
}

impl StateInner {
    pub async fn new(config: Config) -> State {
        let cache = MetadataCache::new(config.cache.capacity, config.cache.ttl);
        let analysis_queue = TaskQueue::new("analysis", config.workers.queue_capacity);
        let deletion_queue = TaskQueue::new("deletion", config.workers.queue_capacity);

        Arc::new(Self {
            config,
            database: OnceCell::new(),
            destinations: OnceCell::new(),
            cache,
            analysis_queue,
            deletion_queue,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a handle to the database.
    pub async fn database(&self) -> ServerResult<&DatabaseConnection> {
        self.database
            .get_or_try_init(|| async {
                Database::connect(&self.config.database.url)
                    .await
                    .map_err(ServerError::database_error)
            })
            .await
    }

    /// Returns the storage destinations.
    pub async fn destinations(&self) -> ServerResult<&DestinationRegistry> {
        self.destinations
            .get_or_try_init(|| async { DestinationRegistry::new(&self.config.destinations).await })
            .await
    }

    /// Returns the metadata cache.
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Waits until every queued deletion has been carried out.
    ///
    /// Deletion workers must be running.
    pub async fn drain_deletions(&self) {
        self.deletion_queue.wait_idle().await;
    }

    /// Sends periodic heartbeat queries to the database.
    async fn run_db_heartbeat(&self) -> ServerResult<()> {
        let db = self.database().await?;
        let stmt =
            Statement::from_string(db.get_database_backend(), "SELECT 'heartbeat';".to_string());

        loop {
            let _ = db.execute(stmt.clone()).await;
            time::sleep(Duration::from_secs(60)).await;
        }
    }
}

impl Actor {
    pub fn new(account_id: u64) -> Self {
        Self {
            account_id,
            max_upload_size: None,
        }
    }

    /// Returns the account ID as stored in the database.
    pub(crate) fn db_id(&self) -> ServerResult<i64> {
        i64::try_from(self.account_id).map_err(ServerError::request_error)
    }

    /// Checks a file size against the upload quota.
    pub(crate) fn check_quota(&self, size: u64) -> ServerResult<()> {
        if let Some(limit) = self.max_upload_size {
            if size > limit {
                return Err(ServerError::QuotaExceeded { size, limit });
            }
        }

        Ok(())
    }
}

/// Runs the background workers.
///
/// This consumes the analysis and deletion queues, replays unfinished
/// analyses once on startup, and never returns unless the workers die.
pub async fn run_workers(state: State) -> Result<()> {
    eprintln!("Starting workers...");

    // Fail early on broken configurations
    state.database().await?;
    state.destinations().await?;

    let mut handles = analysis::spawn_analysis_workers(&state);
    handles.extend(transfer::spawn_deletion_workers(&state));

    tokio::spawn({
        let state = state.clone();
        async move {
            match analysis::reconcile(&state).await {
                Ok(report) => tracing::info!(
                    "Reconciliation finished: {} analyzed, {} removed",
                    report.analyzed,
                    report.removed
                ),
                Err(e) => tracing::warn!("Reconciliation failed: {}", e),
            }
        }
    });

    let (workers, _) = tokio::join!(futures::future::join_all(handles), async {
        if state.config.database.heartbeat {
            let _ = state.run_db_heartbeat().await;
        }
    });

    for result in workers {
        result?;
    }

    Ok(())
}

/// Runs database migrations.
pub async fn run_migrations(config: Config) -> Result<()> {
    eprintln!("Running migrations...");

    let state = StateInner::new(config).await;
    let db = state.database().await?;
    Migrator::up(db, None).await?;

    Ok(())
}
