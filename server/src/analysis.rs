//! Content analysis.
//!
//! Uploaded attachments wait in temporary storage until a worker has
//! analyzed them. Analysis extracts type-specific metadata, then either
//! links the attachment to an existing owner of the same content or
//! promotes it to permanent storage. Either way, the temporary copy is
//! deleted afterwards.
//!
//! Metadata extraction is best-effort. A file that can't be decoded
//! is still stored, just with less metadata.

use std::io::{BufReader, Cursor};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::query::QueryOrder;
use sea_orm::ActiveValue::Set;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt};
use tokio::process::Command;
use tokio::task::{self, JoinHandle};
use tokio::time;
use tracing::instrument;

use crate::config::{AnalysisConfig, TEMPORARY_DESTINATION};
use crate::database::entity::attachment::{self, AttachmentModel, Entity as Attachment};
use crate::database::entity::{Json, Metadata};
use crate::database::StashDatabase;
use crate::dedup::{self, LinkOutcome};
use crate::error::{ServerError, ServerResult};
use crate::{transfer, State, StateInner};
use stash::hash::Hash;
use stash::stream::StreamHasher;
use stash::util::Finally;

/// Number of leading bytes inspected to detect the file type.
const SNIFF_LENGTH: u64 = 64;

/// How often to retry taking a content claim held by another worker.
const CONTENT_CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// EXIF fields that are kept.
///
/// Everything else is dropped, and location data never makes it
/// into the allow-list.
const EXIF_ALLOW_LIST: &[&str] = &[
    "Make",
    "Model",
    "LensMake",
    "LensModel",
    "Software",
    "Orientation",
    "DateTimeOriginal",
    "ExposureTime",
    "FNumber",
    "ExposureProgram",
    "ExposureBiasValue",
    "PhotographicSensitivity",
    "FocalLength",
    "FocalLengthIn35mmFilm",
    "Flash",
    "WhiteBalance",
    "MeteringMode",
];

/// An attachment waiting to be analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzeTask {
    pub attachment_id: i64,
}

/// The result of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Attachments that were analyzed successfully.
    pub analyzed: usize,

    /// Attachments that failed analysis and were removed.
    pub removed: usize,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,

    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    display_aspect_ratio: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
    codec_name: Option<String>,
    color_range: Option<String>,
    color_space: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

/// Spawns the workers consuming the analysis queue.
pub fn spawn_analysis_workers(state: &State) -> Vec<JoinHandle<()>> {
    let count = state.config.workers.analyze;
    let handler_state = state.clone();

    state.analysis_queue.spawn_workers(count, move |task: AnalyzeTask| {
        let state = handler_state.clone();
        async move {
            analyze_attachment(&state, task.attachment_id).await?;
            Ok(())
        }
    })
}

/// Analyzes an uploaded attachment, then links or promotes it.
///
/// Returns the attachment as it ends up. Attachments marked for
/// cleanup are not analyzed.
#[instrument(skip(state))]
pub async fn analyze_attachment(state: &StateInner, attachment_id: i64) -> ServerResult<AttachmentModel> {
    let db = state.database().await?;
    let mut attachment = db.find_attachment(attachment_id).await?;

    if !attachment.is_uploaded || !attachment.is_temporary() || attachment.cleaned_at.is_some() {
        return Err(ServerError::NotEligibleForAnalysis);
    }

    let temporary_uuid = attachment.uuid.clone();
    let copy = transfer::materialize(state, TEMPORARY_DESTINATION, &temporary_uuid).await?;

    let hash = match &attachment.hash {
        Some(typed) => Hash::from_typed(typed)?,
        None => hash_file(copy.path()).await?,
    };
    attachment.hash = Some(hash.to_typed_base16());

    let detected = sniff_mime_type(copy.path()).await?;
    let effective = detected
        .clone()
        .unwrap_or_else(|| attachment.mime_type.clone());

    let mut metadata = attachment.metadata.0.clone();
    match extract_metadata(&state.config.analysis, copy.path(), &effective).await {
        Ok(extracted) => metadata.extend(extracted),
        Err(e) => tracing::warn!("Could not extract metadata from {}: {}", attachment.rid, e),
    }

    drop(copy);

    attachment.detected_mime_type = detected;
    attachment.metadata = Json(metadata);
    attachment.is_analyzed = true;

    // One owner per hash: hold the claim from the owner lookup until
    // the attachment is linked or promoted
    acquire_content_claim(state, &hash, attachment.id).await?;

    let release = Finally::new({
        let db = db.clone();
        let hash = hash.clone();
        async move {
            if let Err(e) = db.release_content(&hash, attachment_id).await {
                tracing::warn!("Failed to release content claim of {}: {}", attachment_id, e);
            }
        }
    });

    let settled = link_or_promote(state, attachment, temporary_uuid).await;

    release.cancel();
    db.release_content(&hash, attachment_id).await?;

    settled
}

/// Waits until the attachment holds the content claim for the hash.
async fn acquire_content_claim(state: &StateInner, hash: &Hash, attachment_id: i64) -> ServerResult<()> {
    let db = state.database().await?;
    let mut waited = false;

    while !db.claim_content(hash, attachment_id).await? {
        if !waited {
            tracing::debug!("Waiting for the content claim of {}", attachment_id);
            waited = true;
        }

        time::sleep(CONTENT_CLAIM_POLL_INTERVAL).await;
    }

    Ok(())
}

async fn link_or_promote(
    state: &StateInner,
    attachment: AttachmentModel,
    temporary_uuid: String,
) -> ServerResult<AttachmentModel> {
    let db = state.database().await?;

    // Somebody else may have settled it while we waited for the claim
    let current = db.find_attachment(attachment.id).await?;
    if !current.is_temporary() || current.cleaned_at.is_some() {
        return Err(ServerError::NotEligibleForAnalysis);
    }

    match dedup::try_link(state, attachment).await? {
        LinkOutcome::Linked { attachment, .. } => {
            transfer::enqueue_deletion(state, TEMPORARY_DESTINATION, temporary_uuid).await?;
            Ok(attachment)
        }
        LinkOutcome::NotLinked(attachment) => {
            let analyzed = Attachment::update(attachment::ActiveModel {
                id: Set(attachment.id),
                hash: Set(attachment.hash.clone()),
                detected_mime_type: Set(attachment.detected_mime_type.clone()),
                metadata: Set(attachment.metadata.clone()),
                is_analyzed: Set(true),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .exec(db)
            .await
            .map_err(ServerError::database_error)?;

            state.cache.put_attachment(&analyzed).await;

            transfer::promote(state, analyzed).await
        }
    }
}

/// Replays attachments that were uploaded but never left temporary storage.
///
/// This picks up the work lost when the server went down with a
/// non-empty analysis queue. Attachments that fail again are removed.
#[instrument(skip_all)]
pub async fn reconcile(state: &StateInner) -> ServerResult<ReconcileReport> {
    let db = state.database().await?;

    let pending = Attachment::find()
        .filter(attachment::Column::IsUploaded.eq(true))
        .filter(attachment::Column::Destination.eq(TEMPORARY_DESTINATION as i32))
        .filter(attachment::Column::CleanedAt.is_null())
        .order_by_asc(attachment::Column::Id)
        .all(db)
        .await
        .map_err(ServerError::database_error)?;

    let mut report = ReconcileReport::default();

    for attachment in pending {
        match analyze_attachment(state, attachment.id).await {
            Ok(_) => report.analyzed += 1,
            Err(e) => {
                tracing::warn!(
                    "Analysis of {} failed during reconciliation, removing: {}",
                    attachment.rid,
                    e
                );

                let current = match db.find_attachment(attachment.id).await {
                    Ok(current) => current,
                    Err(ServerError::NoSuchAttachment) => continue,
                    Err(e) => {
                        tracing::warn!("Could not reload {}: {}", attachment.rid, e);
                        continue;
                    }
                };

                if let Err(e) = crate::attachment::remove_attachment(state, &current).await {
                    tracing::warn!("Could not remove {}, skipping: {}", current.rid, e);
                    continue;
                }

                report.removed += 1;
            }
        }
    }

    Ok(report)
}

async fn hash_file(path: &Path) -> ServerResult<Hash> {
    let file = File::open(path).await.map_err(ServerError::storage_error)?;
    let (mut hasher, receipt) = StreamHasher::new(file, Sha256::new());

    io::copy(&mut hasher, &mut io::sink())
        .await
        .map_err(ServerError::storage_error)?;

    let receipt = receipt
        .get()
        .ok_or_else(|| ServerError::StorageError(anyhow::anyhow!("The file was not read to the end")))?;

    Ok(Hash::from_sha256_digest(receipt.digest.as_slice())?)
}

/// Detects the MIME type from the leading bytes.
async fn sniff_mime_type(path: &Path) -> ServerResult<Option<String>> {
    let file = File::open(path).await.map_err(ServerError::storage_error)?;

    let mut head = Vec::new();
    file.take(SNIFF_LENGTH)
        .read_to_end(&mut head)
        .await
        .map_err(ServerError::storage_error)?;

    Ok(sniff_bytes(&head).map(str::to_owned))
}

fn sniff_bytes(head: &[u8]) -> Option<&'static str> {
    use image::ImageFormat;

    let format = image::guess_format(head).ok()?;
    let mime = match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Tiff => "image/tiff",
        _ => return None,
    };

    Some(mime)
}

async fn extract_metadata(config: &AnalysisConfig, path: &Path, mime: &str) -> ServerResult<Metadata> {
    if mime.starts_with("image/") {
        let path = path.to_owned();
        task::spawn_blocking(move || image_metadata(&path))
            .await
            .map_err(ServerError::analysis_error)?
    } else if mime.starts_with("video/") {
        probe_video(config, path).await
    } else {
        Ok(Metadata::new())
    }
}

fn image_metadata(path: &Path) -> ServerResult<Metadata> {
    let (width, height) = image::io::Reader::open(path)
        .map_err(ServerError::analysis_error)?
        .with_guessed_format()
        .map_err(ServerError::analysis_error)?
        .into_dimensions()
        .map_err(ServerError::analysis_error)?;

    let mut metadata = dimensions(width, height);

    let exif = std::fs::read(path)
        .ok()
        .and_then(|bytes| read_exif(&bytes));
    if let Some(exif) = exif {
        metadata.insert("exif".to_string(), Value::Object(exif));
    }

    Ok(metadata)
}

fn dimensions(width: u32, height: u32) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("width".to_string(), width.into());
    metadata.insert("height".to_string(), height.into());

    if height > 0 {
        metadata.insert("ratio".to_string(), (width as f64 / height as f64).into());
    }

    metadata
}

fn read_exif(bytes: &[u8]) -> Option<Metadata> {
    let exif = exif::Reader::new()
        .read_from_container(&mut BufReader::new(Cursor::new(bytes)))
        .ok()?;

    let fields = exif
        .fields()
        .filter(|field| field.ifd_num == exif::In::PRIMARY)
        .map(|field| {
            (
                field.tag.to_string(),
                field.display_value().with_unit(&exif).to_string(),
            )
        });

    let sanitized = sanitize_exif(fields);
    (!sanitized.is_empty()).then_some(sanitized)
}

/// Keeps allow-listed EXIF fields and drops all location data.
fn sanitize_exif(fields: impl Iterator<Item = (String, String)>) -> Metadata {
    fields
        .filter(|(tag, _)| !tag.starts_with("GPS"))
        .filter(|(tag, _)| EXIF_ALLOW_LIST.contains(&tag.as_str()))
        .map(|(tag, value)| (tag, Value::String(value)))
        .collect()
}

async fn probe_video(config: &AnalysisConfig, path: &Path) -> ServerResult<Metadata> {
    let mut command = Command::new(&config.ffprobe);
    command
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "-select_streams",
            "v:0",
        ])
        .arg(path)
        .kill_on_drop(true);

    let output = time::timeout(config.probe_timeout, command.output())
        .await
        .map_err(|_| {
            ServerError::AnalysisError(anyhow::anyhow!(
                "ffprobe did not finish within {:?}",
                config.probe_timeout
            ))
        })?
        .map_err(ServerError::analysis_error)?;

    if !output.status.success() {
        return Err(ServerError::AnalysisError(anyhow::anyhow!(
            "ffprobe exited with {}",
            output.status
        )));
    }

    parse_probe(&output.stdout)
}

fn parse_probe(output: &[u8]) -> ServerResult<Metadata> {
    let probe: ProbeOutput = serde_json::from_slice(output).map_err(ServerError::analysis_error)?;

    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| ServerError::AnalysisError(anyhow::anyhow!("No video stream found")))?;

    let mut metadata = match (stream.width, stream.height) {
        (Some(width), Some(height)) => dimensions(width, height),
        _ => Metadata::new(),
    };

    if let Some(ratio) = stream.display_aspect_ratio {
        metadata.insert("ratio".to_string(), Value::String(ratio));
    }

    let format = probe.format.as_ref();

    let duration = stream
        .duration
        .or_else(|| format.and_then(|f| f.duration.clone()))
        .and_then(|d| d.parse::<f64>().ok());
    if let Some(duration) = duration {
        metadata.insert("duration".to_string(), duration.into());
    }

    let bit_rate = stream
        .bit_rate
        .or_else(|| format.and_then(|f| f.bit_rate.clone()))
        .and_then(|b| b.parse::<u64>().ok());
    if let Some(bit_rate) = bit_rate {
        metadata.insert("bit_rate".to_string(), bit_rate.into());
    }

    let strings = [
        ("codec_name", stream.codec_name),
        ("color_range", stream.color_range),
        ("color_space", stream.color_space),
    ];
    for (key, value) in strings {
        if let Some(value) = value {
            metadata.insert(key.to_string(), Value::String(value));
        }
    }

    Ok(metadata)
}
