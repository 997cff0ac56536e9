//! Garbage collection.
//!
//! Garbage collection is two-phase. The mark phase sets `cleaned_at`
//! on attachments that have outlived their pool's lifecycle and on
//! uploads that never left the temporary destination. The sweep phase deletes the bytes of
//! marked attachments, then their records.
//!
//! Marked owners that are still referenced are skipped by the sweep.
//! Marked links are swept first, so an owner whose links were all
//! marked is released in the same pass.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use sea_orm::entity::prelude::*;
use sea_orm::query::{QueryOrder, QuerySelect};
use sea_orm::sea_query::{Expr, Query};
use tokio::sync::Semaphore;
use tokio::time;
use tracing::instrument;

use crate::attachment::delete_record;
use crate::config::TEMPORARY_DESTINATION;
use crate::database::entity::attachment::{self, AttachmentModel, Entity as Attachment};
use crate::database::entity::boost::{self, Entity as Boost};
use crate::database::entity::fragment::{self, Entity as Fragment};
use crate::database::entity::pool::{self, Entity as Pool};
use crate::error::ServerError;
use crate::storage::chunk_object_name;
use crate::transfer::{self, DeletionTask};
use crate::{State, StateInner};

/// Maximum number of concurrent object deletions.
const DELETE_CONCURRENCY: usize = 20;

/// What a garbage collection run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Attachments marked for cleanup.
    pub marked: u64,

    /// Unfinished fragments removed.
    pub fragments_removed: u64,

    /// Attachments removed.
    pub swept: u64,
}

/// Runs garbage collection periodically.
pub async fn run_garbage_collection(state: State) {
    let config = state.config.garbage_collection.clone();

    if config.interval == Duration::ZERO {
        // disabled
        return;
    }

    let mark_loop = async {
        loop {
            // We don't stop even if it errors
            if let Err(e) = mark(&state).await {
                tracing::warn!("Marking failed: {}", e);
            }

            time::sleep(config.interval).await;
        }
    };

    let sweep_loop = async {
        loop {
            time::sleep(config.sweep_interval).await;

            if let Err(e) = sweep(&state).await {
                tracing::warn!("Sweeping failed: {}", e);
            }
        }
    };

    tokio::join!(mark_loop, sweep_loop);
}

/// Runs garbage collection once.
#[instrument(skip_all)]
pub async fn run_garbage_collection_once(state: &StateInner) -> Result<GcReport> {
    tracing::info!("Running garbage collection...");

    let mut report = mark(state).await?;
    report.swept = sweep(state).await?;

    Ok(report)
}

/// Runs both mark passes.
pub async fn mark(state: &StateInner) -> Result<GcReport> {
    let mut report = GcReport {
        marked: mark_pool_lifecycle(state).await?,
        ..Default::default()
    };

    let (marked, fragments_removed) = mark_stale_uploads(state).await?;
    report.marked += marked;
    report.fragments_removed = fragments_removed;

    Ok(report)
}

/// Marks attachments that outlived the lifecycle of their pool.
///
/// Boosted attachments are exempt.
#[instrument(skip_all)]
async fn mark_pool_lifecycle(state: &StateInner) -> Result<u64> {
    let db = state.database().await?;
    let now = Utc::now();

    let pools = Pool::find()
        .filter(pool::Column::ExistLifecycle.is_not_null())
        .filter(pool::Column::ExistLifecycle.gt(0))
        .all(db)
        .await?;

    tracing::info!(
        "Found {} pools subject to lifecycle garbage collection",
        pools.len()
    );

    let mut marked = 0;

    for pool in pools {
        let lifecycle = pool.exist_lifecycle.unwrap_or_default();
        let cutoff = now
            .checked_sub_signed(ChronoDuration::seconds(lifecycle.into()))
            .ok_or_else(|| {
                anyhow!(
                    "Somehow subtracting the lifecycle of pool {} underflowed",
                    pool.alias
                )
            })?;

        let boosted = Query::select()
            .column(boost::Column::AttachmentId)
            .from(Boost)
            .to_owned();

        let expired = Attachment::find()
            .filter(attachment::Column::PoolId.eq(pool.id))
            .filter(attachment::Column::CreatedAt.lt(cutoff))
            .filter(attachment::Column::CleanedAt.is_null())
            .filter(attachment::Column::Id.not_in_subquery(boosted))
            .all(db)
            .await?;

        let count = mark_attachments(state, &expired).await?;
        if count > 0 {
            tracing::info!("Marked {} attachments in pool {}", count, pool.alias);
        }

        marked += count;
    }

    Ok(marked)
}

/// Marks uploads still sitting in the temporary destination after the
/// staging TTL, and removes fragments that were never completed.
///
/// This covers uploads that never received their bytes as well as
/// uploads that were received but never made it through analysis.
#[instrument(skip_all)]
async fn mark_stale_uploads(state: &StateInner) -> Result<(u64, u64)> {
    let db = state.database().await?;
    let ttl = ChronoDuration::from_std(state.config.garbage_collection.staging_ttl)?;
    let cutoff = Utc::now()
        .checked_sub_signed(ttl)
        .ok_or_else(|| anyhow!("Somehow subtracting the staging TTL underflowed"))?;

    let stale = Attachment::find()
        .filter(attachment::Column::Destination.eq(TEMPORARY_DESTINATION as i32))
        .filter(attachment::Column::CreatedAt.lt(cutoff))
        .filter(attachment::Column::CleanedAt.is_null())
        .all(db)
        .await?;

    let marked = mark_attachments(state, &stale).await?;

    let fragments = Fragment::find()
        .filter(fragment::Column::CreatedAt.lt(cutoff))
        .filter(fragment::Column::IsMerging.eq(false))
        .all(db)
        .await?;

    let mut removed = 0;
    for fragment in fragments {
        let chunks = fragment
            .ordered_chunk_ids()
            .into_iter()
            .map(|chunk_id| DeletionTask {
                destination: TEMPORARY_DESTINATION,
                name: chunk_object_name(&fragment.uuid, &chunk_id),
            })
            .collect();

        if delete_objects(state, chunks).await > 0 {
            tracing::warn!("Keeping fragment {} until its chunks are gone", fragment.rid);
            continue;
        }

        Fragment::delete_by_id(fragment.id).exec(db).await?;
        state.cache.invalidate_fragment(&fragment.rid).await;
        removed += 1;
    }

    tracing::info!(
        "Marked {} stale uploads, removed {} stale fragments",
        marked,
        removed
    );

    Ok((marked, removed))
}

async fn mark_attachments(state: &StateInner, attachments: &[AttachmentModel]) -> Result<u64> {
    if attachments.is_empty() {
        return Ok(0);
    }

    let db = state.database().await?;

    let update = Attachment::update_many()
        .col_expr(attachment::Column::CleanedAt, Expr::value(Utc::now()))
        .filter(attachment::Column::Id.is_in(attachments.iter().map(|a| a.id)))
        .filter(attachment::Column::CleanedAt.is_null())
        .exec(db)
        .await?;

    for attachment in attachments {
        state.cache.invalidate_attachment(&attachment.rid).await;
    }

    Ok(update.rows_affected)
}

/// Removes marked attachments that nothing refers to.
#[instrument(skip_all)]
pub async fn sweep(state: &StateInner) -> Result<u64> {
    let db = state.database().await?;
    let mut swept = 0;

    // Links never own bytes
    let links = Attachment::find()
        .filter(attachment::Column::CleanedAt.is_not_null())
        .filter(attachment::Column::RefId.is_not_null())
        .order_by_asc(attachment::Column::Id)
        .all(db)
        .await?;

    for link in links {
        match delete_record(state, &link).await {
            Ok(garbage) => {
                delete_objects(state, garbage).await;
                swept += 1;
            }
            Err(e) => tracing::warn!("Failed to sweep {}: {}", link.rid, e),
        }
    }

    let owners = Attachment::find()
        .filter(attachment::Column::CleanedAt.is_not_null())
        .filter(attachment::Column::RefId.is_null())
        .filter(attachment::Column::RefCount.eq(0))
        .order_by_asc(attachment::Column::Id)
        .all(db)
        .await?;

    for owner in owners {
        let copies = Boost::find()
            .filter(boost::Column::AttachmentId.eq(owner.id))
            .select_only()
            .column(boost::Column::Destination)
            .into_tuple::<i32>()
            .all(db)
            .await?;

        let mut objects = vec![DeletionTask {
            destination: owner.destination as usize,
            name: owner.uuid.clone(),
        }];
        objects.extend(copies.into_iter().map(|destination| DeletionTask {
            destination: destination as usize,
            name: owner.uuid.clone(),
        }));

        // Keep the record around for the next sweep if the bytes can't be deleted
        if delete_objects(state, objects).await > 0 {
            continue;
        }

        match delete_record(state, &owner).await {
            Ok(_) => swept += 1,
            Err(ServerError::AttachmentStillReferenced { ref_count }) => {
                tracing::warn!(
                    "Marked attachment {} gained {} references",
                    owner.rid,
                    ref_count
                );
            }
            Err(e) => tracing::warn!("Failed to sweep {}: {}", owner.rid, e),
        }
    }

    tracing::info!("Swept {} attachments", swept);

    Ok(swept)
}

/// Deletes objects concurrently, returning the number of failures.
async fn delete_objects(state: &StateInner, objects: Vec<DeletionTask>) -> usize {
    let delete_limit = Arc::new(Semaphore::new(DELETE_CONCURRENCY));

    let futures: Vec<_> = objects
        .into_iter()
        .map(|task| {
            let delete_limit = delete_limit.clone();
            async move {
                let permit = delete_limit.acquire().await?;
                let name = task.name.clone();
                transfer::delete_object(state, task).await?;
                drop(permit);
                Result::<_, anyhow::Error>::Ok(name)
            }
        })
        .collect();

    // Deletions can result in spurious failures, tolerate them
    join_all(futures)
        .await
        .into_iter()
        .filter(|r| {
            if let Err(e) = r {
                tracing::warn!("Deletion failed: {}", e);
            }

            r.is_err()
        })
        .count()
}
