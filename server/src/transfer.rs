//! Moving bytes between destinations.
//!
//! This is the only place that decides which destination a client is
//! sent to and how objects travel from temporary to permanent storage.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::seq::SliceRandom;
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{self, AsyncRead};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::TEMPORARY_DESTINATION;
use crate::database::entity::attachment::{self, AttachmentModel, Entity as Attachment};
use crate::database::entity::boost::BoostModel;
use crate::database::StashDatabase;
use crate::error::{ServerError, ServerResult};
use crate::storage::{AccessUrl, DestinationRegistry};
use crate::{State, StateInner};

/// An object waiting to be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionTask {
    /// Index of the destination.
    pub destination: usize,

    /// Name of the object.
    pub name: String,
}

/// Where a client can fetch an attachment from.
#[derive(Debug, Clone)]
pub struct OpenedAttachment {
    /// The attachment.
    pub attachment: AttachmentModel,

    /// Index of the destination serving the bytes.
    pub destination: usize,

    /// The location.
    pub url: AccessUrl,
}

/// A readable local copy of an object.
///
/// Spooled copies are deleted when dropped.
#[derive(Debug)]
pub enum LocalCopy {
    /// The object itself, on a local destination.
    Direct(PathBuf),

    /// A temporary download of a remote object.
    Spooled(TempPath),
}

impl LocalCopy {
    pub fn path(&self) -> &Path {
        match self {
            Self::Direct(path) => path,
            Self::Spooled(path) => path,
        }
    }
}

/// Uploads an object to a destination.
pub async fn put_object(
    state: &StateInner,
    destination: usize,
    name: String,
    stream: &mut (dyn AsyncRead + Unpin + Send),
) -> ServerResult<()> {
    let destinations = state.destinations().await?;
    let backend = &destinations.get(destination)?.backend;

    backend.upload_file(name, stream).await
}

/// Copies an object from one destination to another.
#[instrument(skip(state))]
pub async fn copy_object(state: &StateInner, from: usize, to: usize, name: &str) -> ServerResult<()> {
    let destinations = state.destinations().await?;
    let source = &destinations.get(from)?.backend;
    let target = &destinations.get(to)?.backend;

    let mut stream = source.download_file(name.to_owned()).await?;
    target.upload_file(name.to_owned(), &mut stream).await?;

    tracing::debug!("Copied {} from destination {} to {}", name, from, to);

    Ok(())
}

/// Moves an attachment from temporary to permanent storage.
///
/// The temporary copy is queued for deletion once the new location
/// has been committed.
#[instrument(skip_all, fields(rid = %attachment.rid))]
pub async fn promote(state: &StateInner, attachment: AttachmentModel) -> ServerResult<AttachmentModel> {
    if !attachment.is_temporary() {
        return Err(ServerError::NotInTemporaryStorage);
    }

    let permanent = state.config.permanent_destination;
    copy_object(state, TEMPORARY_DESTINATION, permanent, &attachment.uuid).await?;

    let db = state.database().await?;
    let promoted = Attachment::update(attachment::ActiveModel {
        id: Set(attachment.id),
        destination: Set(permanent as i32),
        updated_at: Set(Utc::now()),
        ..Default::default()
    })
    .exec(db)
    .await
    .map_err(ServerError::database_error)?;

    state.cache.put_attachment(&promoted).await;

    enqueue_deletion(state, TEMPORARY_DESTINATION, attachment.uuid.clone()).await?;

    Ok(promoted)
}

/// Queues an object for deletion.
pub async fn enqueue_deletion(state: &StateInner, destination: usize, name: String) -> ServerResult<()> {
    state
        .deletion_queue
        .publish(DeletionTask { destination, name })
        .await
}

/// Deletes an object right away.
pub async fn delete_object(state: &StateInner, task: DeletionTask) -> ServerResult<()> {
    let destinations = state.destinations().await?;
    let backend = &destinations.get(task.destination)?.backend;

    backend.delete_file(task.name).await
}

/// Spawns the workers consuming the deletion queue.
pub fn spawn_deletion_workers(state: &State) -> Vec<JoinHandle<()>> {
    let count = state.config.workers.deletion;
    let handler_state = state.clone();

    state.deletion_queue.spawn_workers(count, move |task: DeletionTask| {
        let state = handler_state.clone();
        async move {
            tracing::debug!("Deleting {} from destination {}", task.name, task.destination);
            delete_object(&state, task).await
        }
    })
}

/// Makes an object readable from the local filesystem.
pub async fn materialize(state: &StateInner, destination: usize, name: &str) -> ServerResult<LocalCopy> {
    let destinations = state.destinations().await?;
    let backend = &destinations.get(destination)?.backend;

    if let Some(path) = backend.local_path(name) {
        return Ok(LocalCopy::Direct(path));
    }

    let temp = tempfile::NamedTempFile::new()
        .map_err(ServerError::storage_error)?
        .into_temp_path();

    let mut stream = backend.download_file(name.to_owned()).await?;
    let mut file = File::create(&temp)
        .await
        .map_err(ServerError::storage_error)?;
    io::copy(&mut stream, &mut file)
        .await
        .map_err(ServerError::storage_error)?;

    Ok(LocalCopy::Spooled(temp))
}

/// Returns where a client should fetch an attachment from.
///
/// Active boosts are preferred: one in the requested region if there
/// is any, otherwise a random one. Without boosts, the attachment's own
/// destination is used.
pub async fn open_attachment(
    state: &StateInner,
    rid: &str,
    region: Option<&str>,
) -> ServerResult<OpenedAttachment> {
    let attachment = crate::attachment::get_attachment(state, rid).await?;

    let db = state.database().await?;
    let boosts = db.find_active_boosts(attachment.id).await?;

    let destinations = state.destinations().await?;
    let destination = select_destination(destinations, &attachment, &boosts, region);
    let url = destinations
        .get(destination)?
        .backend
        .access_url(attachment.uuid.clone())
        .await?;

    Ok(OpenedAttachment {
        attachment,
        destination,
        url,
    })
}

fn select_destination(
    destinations: &DestinationRegistry,
    attachment: &AttachmentModel,
    boosts: &[BoostModel],
    region: Option<&str>,
) -> usize {
    let usable: Vec<usize> = boosts
        .iter()
        .map(|boost| boost.destination as usize)
        .filter(|index| destinations.get(*index).is_ok())
        .collect();

    if let Some(region) = region {
        let regional = usable.iter().find(|index| {
            destinations
                .get(**index)
                .map(|d| d.config.region() == Some(region))
                .unwrap_or(false)
        });

        if let Some(index) = regional {
            return *index;
        }
    }

    if let Some(index) = usable.choose(&mut rand::thread_rng()) {
        return *index;
    }

    attachment.destination as usize
}
