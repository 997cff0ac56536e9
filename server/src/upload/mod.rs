//! Upload assembly.
//!
//! Files arrive either in one piece ([`create_attachment_direct`]) or as
//! chunks of a fragment ([`create_fragment`] and [`upload_chunk`]). Either
//! way, the bytes land in the temporary destination, an attachment is
//! created with `is_uploaded = true`, and the attachment is queued for
//! analysis.
//!
//! ## Merging
//!
//! After every chunk upload, all chunks of the fragment are checked for
//! existence. Once all are present, the fragment is merged: the chunks
//! are concatenated in ordinal order into a single object, and the
//! fragment is replaced by an attachment in one transaction. Chunk files
//! are only removed after that.
//!
//! Two uploads can both observe the fragment as complete. The merge
//! claims the fragment by flipping its `is_merging` flag from false to
//! true, and only the caller that flipped it proceeds.

#[cfg(test)]
mod tests;

use std::io;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use sea_orm::TransactionTrait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::instrument;
use uuid::Uuid;

use crate::analysis::AnalyzeTask;
use crate::config::TEMPORARY_DESTINATION;
use crate::database::entity::attachment::{
    self, AttachmentModel, AttachmentType, Entity as Attachment,
};
use crate::database::entity::fragment::{self, ChunkMap, Entity as Fragment, FragmentModel};
use crate::database::entity::pool::PoolModel;
use crate::database::entity::{Json, Metadata};
use crate::database::StashDatabase;
use crate::error::{ServerError, ServerResult};
use crate::storage::{chunk_object_name, read_object};
use crate::{transfer, Actor, StateInner};
use stash::hash::Hash;
use stash::rid::{new_chunk_id, new_rid, validate_rid};
use stash::stream::StreamHasher;
use stash::util::Finally;

/// MIME type used when none can be inferred.
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// A file to be uploaded.
#[derive(Debug, Clone, Default)]
pub struct NewAttachment {
    /// Alias of the pool to upload to.
    pub pool: String,

    /// The file name.
    pub name: String,

    /// Alternative text.
    pub alt: String,

    /// Usage tag.
    pub usage: String,

    /// The MIME type. Inferred from the file name if not given.
    pub mime_type: Option<String>,

    /// Metadata supplied by the uploader.
    pub usermeta: Metadata,

    /// Whether the attachment may be listed publicly.
    pub is_indexable: bool,
}

/// A file to be uploaded in chunks.
#[derive(Debug, Clone, Default)]
pub struct NewFragment {
    /// The file.
    pub file: NewAttachment,

    /// The total size in bytes.
    pub size: u64,

    /// Client-supplied fingerprint of the file.
    ///
    /// Creating a fragment with the fingerprint of an unfinished
    /// fragment of the same account resumes that one.
    pub fingerprint: Option<String>,
}

/// The result of uploading a chunk.
#[derive(Debug, Clone)]
pub enum ChunkUploadResult {
    /// Some chunks are still missing.
    Partial {
        fragment: FragmentModel,
        missing: Vec<String>,
    },

    /// All chunks are present, but another upload is merging them.
    Merging(FragmentModel),

    /// The fragment was merged into an attachment.
    Merged(AttachmentModel),
}

/// The progress of a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentState {
    /// No chunks have been uploaded.
    Placeholder,

    /// Some chunks are missing.
    Partial { missing: Vec<String> },

    /// All chunks are present.
    Complete,

    /// The fragment is being merged.
    Merging,
}

impl NewAttachment {
    pub fn new(pool: &str, name: &str) -> Self {
        Self {
            pool: pool.to_owned(),
            name: name.to_owned(),
            ..Default::default()
        }
    }
}

/// Uploads a complete file in one go.
///
/// The content hash is computed while the bytes are written. If writing
/// fails, the attachment is removed again.
#[instrument(skip(state, stream, request), fields(name = %request.name))]
pub async fn create_attachment_direct(
    state: &StateInner,
    actor: &Actor,
    request: NewAttachment,
    size: u64,
    stream: &mut (dyn AsyncRead + Unpin + Send),
) -> ServerResult<AttachmentModel> {
    let pool = check_upload(state, actor, &request, size).await?;
    let db = state.database().await?;
    let now = Utc::now();

    let attachment = attachment::ActiveModel {
        rid: Set(new_rid()),
        uuid: Set(Uuid::new_v4().to_string()),
        name: Set(request.name.clone()),
        alt: Set(request.alt.clone()),
        usage: Set(request.usage.clone()),
        mime_type: Set(infer_mime_type(request.mime_type.as_deref(), &request.name)),
        detected_mime_type: Set(None),
        size: Set(size as i64),
        hash: Set(None),
        destination: Set(TEMPORARY_DESTINATION as i32),
        ref_count: Set(0),
        kind: Set(AttachmentType::Normal),
        metadata: Set(Json(Metadata::new())),
        usermeta: Set(Json(request.usermeta.clone())),
        is_uploaded: Set(false),
        is_analyzed: Set(false),
        is_self_ref: Set(false),
        is_indexable: Set(request.is_indexable),
        ref_id: Set(None),
        thumbnail_id: Set(None),
        compressed_id: Set(None),
        pool_id: Set(Some(pool.id)),
        account_id: Set(actor.db_id()?),
        created_at: Set(now),
        updated_at: Set(now),
        cleaned_at: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(ServerError::database_error)?;

    // Remove the record if we bail out before the bytes are in place
    let cleanup = Finally::new({
        let db = db.clone();
        let id = attachment.id;
        async move {
            tracing::warn!("Upload failed, removing attachment {}", id);
            if let Err(e) = Attachment::delete_by_id(id).exec(&db).await {
                tracing::warn!("Failed to remove attachment {}: {}", id, e);
            }
        }
    });

    let (mut hasher, receipt) = StreamHasher::new(stream, Sha256::new());
    transfer::put_object(
        state,
        TEMPORARY_DESTINATION,
        attachment.uuid.clone(),
        &mut hasher,
    )
    .await?;

    let receipt = receipt
        .get()
        .ok_or_else(|| ServerError::StorageError(anyhow::anyhow!("The upload stream did not finish")))?;

    if receipt.size != size {
        transfer::enqueue_deletion(state, TEMPORARY_DESTINATION, attachment.uuid.clone()).await?;

        return Err(ServerError::RequestError(anyhow::anyhow!(
            "Expected {} bytes, received {}",
            size,
            receipt.size
        )));
    }

    let hash = Hash::from_sha256_digest(receipt.digest.as_slice())?;

    let attachment = Attachment::update(attachment::ActiveModel {
        id: Set(attachment.id),
        hash: Set(Some(hash.to_typed_base16())),
        is_uploaded: Set(true),
        updated_at: Set(Utc::now()),
        ..Default::default()
    })
    .exec(db)
    .await
    .map_err(ServerError::database_error)?;

    cleanup.cancel();

    state.cache.put_attachment(&attachment).await;
    enqueue_analysis(state, &attachment).await?;

    tracing::info!("Received {} ({} bytes)", attachment.rid, size);

    Ok(attachment)
}

/// Starts a chunked upload.
#[instrument(skip(state, request), fields(name = %request.file.name, size = request.size))]
pub async fn create_fragment(
    state: &StateInner,
    actor: &Actor,
    request: NewFragment,
) -> ServerResult<FragmentModel> {
    if request.size == 0 {
        return Err(ServerError::RequestError(anyhow::anyhow!(
            "Chunked uploads must not be empty"
        )));
    }

    let pool = check_upload(state, actor, &request.file, request.size).await?;
    let db = state.database().await?;
    let account_id = actor.db_id()?;

    if let Some(fingerprint) = &request.fingerprint {
        if let Some(existing) = db.find_fragment_by_fingerprint(account_id, fingerprint).await? {
            if existing.size as u64 == request.size && existing.pool_id == Some(pool.id) {
                tracing::debug!("Resuming fragment {}", existing.rid);
                return Ok(existing);
            }
        }
    }

    let chunks = allocate_chunks(request.size, state.config.chunk_size);

    let fragment = fragment::ActiveModel {
        rid: Set(new_rid()),
        uuid: Set(Uuid::new_v4().to_string()),
        name: Set(request.file.name.clone()),
        alt: Set(request.file.alt.clone()),
        usage: Set(request.file.usage.clone()),
        mime_type: Set(infer_mime_type(
            request.file.mime_type.as_deref(),
            &request.file.name,
        )),
        size: Set(request.size as i64),
        fingerprint: Set(request.fingerprint.clone()),
        chunks: Set(Json(chunks)),
        usermeta: Set(Json(request.file.usermeta.clone())),
        is_indexable: Set(request.file.is_indexable),
        is_merging: Set(false),
        pool_id: Set(Some(pool.id)),
        account_id: Set(account_id),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(ServerError::database_error)?;

    state.cache.put_fragment(&fragment).await;

    Ok(fragment)
}

/// Retrieves a fragment by its public identifier.
pub async fn get_fragment(state: &StateInner, rid: &str) -> ServerResult<FragmentModel> {
    validate_rid(rid)?;

    if let Some(fragment) = state.cache.get_fragment(rid).await {
        return Ok(fragment);
    }

    let db = state.database().await?;
    let fragment = db.find_fragment_by_rid(rid).await?;
    state.cache.put_fragment(&fragment).await;

    Ok(fragment)
}

/// Returns the IDs of chunks that haven't been uploaded, in ordinal order.
pub async fn missing_chunks(state: &StateInner, fragment: &FragmentModel) -> ServerResult<Vec<String>> {
    let destinations = state.destinations().await?;
    let backend = &destinations.temporary().backend;

    let mut missing = Vec::new();
    for chunk_id in fragment.ordered_chunk_ids() {
        if !backend
            .file_exists(chunk_object_name(&fragment.uuid, &chunk_id))
            .await?
        {
            missing.push(chunk_id);
        }
    }

    Ok(missing)
}

/// Returns the progress of a fragment.
pub async fn fragment_state(state: &StateInner, fragment: &FragmentModel) -> ServerResult<FragmentState> {
    let db = state.database().await?;

    // The cached copy may predate a merge claim
    let fragment = db.find_fragment_by_rid(&fragment.rid).await?;
    if fragment.is_merging {
        return Ok(FragmentState::Merging);
    }

    let missing = missing_chunks(state, &fragment).await?;

    if missing.is_empty() {
        Ok(FragmentState::Complete)
    } else if missing.len() == fragment.chunks.0.len() {
        Ok(FragmentState::Placeholder)
    } else {
        Ok(FragmentState::Partial { missing })
    }
}

/// Uploads a chunk of a fragment.
///
/// If this was the last missing chunk, the fragment is merged.
#[instrument(skip(state, data), fields(len = data.len()))]
pub async fn upload_chunk(
    state: &StateInner,
    actor: &Actor,
    rid: &str,
    chunk_id: &str,
    data: Bytes,
) -> ServerResult<ChunkUploadResult> {
    let fragment = get_fragment(state, rid).await?;

    if fragment.account_id != actor.db_id()? {
        return Err(ServerError::NotOwner);
    }

    if !fragment.chunks.0.contains_key(chunk_id) {
        return Err(ServerError::UnknownChunk {
            chunk_id: chunk_id.to_owned(),
        });
    }

    let limit = state.config.chunk_size;
    if data.len() as u64 > limit {
        return Err(ServerError::ChunkTooLarge {
            size: data.len() as u64,
            limit,
        });
    }

    if data.is_empty() {
        return Err(ServerError::RequestError(anyhow::anyhow!("The chunk is empty")));
    }

    let destinations = state.destinations().await?;
    let backend = &destinations.temporary().backend;
    let name = chunk_object_name(&fragment.uuid, chunk_id);

    let mut reader = data.as_ref();
    if !backend.upload_file_exclusive(name, &mut reader).await? {
        return Err(ServerError::ChunkAlreadyUploaded {
            chunk_id: chunk_id.to_owned(),
        });
    }

    let missing = missing_chunks(state, &fragment).await?;
    if !missing.is_empty() {
        return Ok(ChunkUploadResult::Partial { fragment, missing });
    }

    match merge_fragment(state, &fragment).await {
        Ok(attachment) => Ok(ChunkUploadResult::Merged(attachment)),
        Err(ServerError::FragmentMerging) => Ok(ChunkUploadResult::Merging(fragment)),
        Err(e) => Err(e),
    }
}

/// Merges a complete fragment into an attachment.
///
/// Refuses to run if any chunk is missing or if the fragment is already
/// being merged. A failed merge leaves the fragment and its chunks in
/// place so it can be retried.
#[instrument(skip_all, fields(rid = %fragment.rid))]
pub async fn merge_fragment(state: &StateInner, fragment: &FragmentModel) -> ServerResult<AttachmentModel> {
    let db = state.database().await?;

    if !db.claim_fragment_merge(fragment.id).await? {
        return Err(ServerError::FragmentMerging);
    }

    let release = Finally::new({
        let db = db.clone();
        let fragment_id = fragment.id;
        async move {
            if let Err(e) = db.release_fragment_merge(fragment_id).await {
                tracing::warn!("Failed to release merge claim of fragment {}: {}", fragment_id, e);
            }
        }
    });

    let missing = missing_chunks(state, fragment).await?;
    if !missing.is_empty() {
        return Err(ServerError::FragmentIncomplete {
            missing: missing.len(),
        });
    }

    let ordered = fragment.ordered_chunk_ids();
    let destinations = state.destinations().await?;
    let backend = destinations.temporary().backend.clone();

    let chunk_stream = stream::iter(ordered.clone()).then({
        let backend = backend.clone();
        let uuid = fragment.uuid.clone();
        move |chunk_id| {
            let backend = backend.clone();
            let name = chunk_object_name(&uuid, &chunk_id);
            async move {
                read_object(backend.as_ref(), name)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
            }
        }
    });
    let reader = StreamReader::new(Box::pin(chunk_stream));
    let (mut hasher, receipt) = StreamHasher::new(reader, Sha256::new());

    backend.upload_file(fragment.uuid.clone(), &mut hasher).await?;

    let receipt = receipt
        .get()
        .ok_or_else(|| ServerError::StorageError(anyhow::anyhow!("The chunk stream did not finish")))?;

    if receipt.size as i64 != fragment.size {
        return Err(ServerError::RequestError(anyhow::anyhow!(
            "The chunks add up to {} bytes, expected {}",
            receipt.size,
            fragment.size
        )));
    }

    let hash = Hash::from_sha256_digest(receipt.digest.as_slice())?;
    let now = Utc::now();

    let txn = db.begin().await.map_err(ServerError::database_error)?;

    let attachment = attachment::ActiveModel {
        rid: Set(fragment.rid.clone()),
        uuid: Set(fragment.uuid.clone()),
        name: Set(fragment.name.clone()),
        alt: Set(fragment.alt.clone()),
        usage: Set(fragment.usage.clone()),
        mime_type: Set(fragment.mime_type.clone()),
        detected_mime_type: Set(None),
        size: Set(fragment.size),
        hash: Set(Some(hash.to_typed_base16())),
        destination: Set(TEMPORARY_DESTINATION as i32),
        ref_count: Set(0),
        kind: Set(AttachmentType::Normal),
        metadata: Set(Json(Metadata::new())),
        usermeta: Set(fragment.usermeta.clone()),
        is_uploaded: Set(true),
        is_analyzed: Set(false),
        is_self_ref: Set(false),
        is_indexable: Set(fragment.is_indexable),
        ref_id: Set(None),
        thumbnail_id: Set(None),
        compressed_id: Set(None),
        pool_id: Set(fragment.pool_id),
        account_id: Set(fragment.account_id),
        created_at: Set(now),
        updated_at: Set(now),
        cleaned_at: Set(None),
        ..Default::default()
    }
    .insert(&txn)
    .await
    .map_err(ServerError::database_error)?;

    Fragment::delete_by_id(fragment.id)
        .exec(&txn)
        .await
        .map_err(ServerError::database_error)?;

    txn.commit().await.map_err(ServerError::database_error)?;

    // The fragment row is gone, nothing to release
    release.cancel();

    state.cache.invalidate_fragment(&fragment.rid).await;
    state.cache.put_attachment(&attachment).await;

    for chunk_id in ordered.iter() {
        if let Err(e) = backend
            .delete_file(chunk_object_name(&fragment.uuid, chunk_id))
            .await
        {
            tracing::warn!("Failed to remove chunk {} of {}: {}", chunk_id, fragment.rid, e);
        }
    }

    enqueue_analysis(state, &attachment).await?;

    tracing::info!(
        "Merged {} chunks into {} ({} bytes)",
        ordered.len(),
        attachment.rid,
        attachment.size
    );

    Ok(attachment)
}

/// Splits a file into chunks with random IDs.
pub fn allocate_chunks(size: u64, chunk_size: u64) -> ChunkMap {
    let count = (size + chunk_size - 1) / chunk_size;
    let mut chunks = ChunkMap::new();

    for ordinal in 0..count {
        let mut chunk_id = new_chunk_id();
        while chunks.contains_key(&chunk_id) {
            chunk_id = new_chunk_id();
        }

        chunks.insert(chunk_id, ordinal as i32);
    }

    chunks
}

/// Returns the declared MIME type, or one guessed from the file name.
pub fn infer_mime_type(declared: Option<&str>, name: &str) -> String {
    match declared {
        Some(mime) if !mime.is_empty() => mime.to_owned(),
        _ => mime_guess::from_path(name)
            .first()
            .map(|mime| mime.essence_str().to_owned())
            .unwrap_or_else(|| FALLBACK_MIME_TYPE.to_owned()),
    }
}

/// Validates an upload against the pool and the account.
async fn check_upload(
    state: &StateInner,
    actor: &Actor,
    request: &NewAttachment,
    size: u64,
) -> ServerResult<PoolModel> {
    let pool = crate::pool::resolve_pool(state, &request.pool).await?;

    actor.check_quota(size)?;
    pool.check_file_size(size)?;
    crate::attachment::check_usage(state, &request.usage)?;

    Ok(pool)
}

async fn enqueue_analysis(state: &StateInner, attachment: &AttachmentModel) -> ServerResult<()> {
    state
        .analysis_queue
        .publish(AnalyzeTask {
            attachment_id: attachment.id,
        })
        .await
}
