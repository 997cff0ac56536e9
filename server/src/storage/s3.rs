//! S3 remote files.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    config::{Credentials, Region},
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::BytesMut;
use derivative::Derivative;
use futures::future::join_all;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{AccessUrl, ObjectStream, StorageBackend};
use crate::error::{ServerError, ServerResult};
use stash::stream::read_chunk_async;
use stash::util::Finally;

/// Validity of presigned URLs.
const PRESIGN_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// The size of each part in a multipart upload.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Status S3 answers a conditional write with when the key is taken.
const PRECONDITION_FAILED: u16 = 412;

/// The S3 remote file storage backend.
#[derive(Debug)]
pub struct S3Backend {
    client: Client,
    config: S3StorageConfig,
}

/// S3 remote file storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// The AWS region.
    ///
    /// This doubles as the region tag used to pick boost copies.
    pub region: String,

    /// The name of the bucket.
    bucket: String,

    /// Key prefix all objects are stored under.
    #[serde(rename = "path")]
    prefix: Option<String>,

    /// Custom S3 endpoint.
    ///
    /// Set this if you are using an S3-compatible object storage (e.g., Minio).
    endpoint: Option<String>,

    /// S3 credentials.
    ///
    /// If not specified, it's read from the `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY` environment variables.
    credentials: Option<S3CredentialsConfig>,

    /// Human-readable label.
    pub label: Option<String>,

    /// Whether the destination accepts boost copies.
    #[serde(rename = "is-boost")]
    #[serde(default)]
    pub is_boost: bool,

    /// Whether to hand out presigned URLs instead of public ones.
    #[serde(rename = "enable-signed")]
    #[serde(default)]
    enable_signed: bool,

    /// Public URL prefix the bucket is served under (e.g., a CDN).
    #[serde(rename = "access-base-url")]
    access_base_url: Option<String>,
}

/// S3 credential configuration.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
pub struct S3CredentialsConfig {
    /// Access key ID.
    access_key_id: String,

    /// Secret access key.
    #[derivative(Debug = "ignore")]
    secret_access_key: String,
}

impl S3Backend {
    pub async fn new(config: S3StorageConfig) -> ServerResult<Self> {
        let s3_config = Self::config_builder(&config)
            .await?
            .region(Region::new(config.region.to_owned()))
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            config,
        })
    }

    async fn config_builder(config: &S3StorageConfig) -> ServerResult<S3ConfigBuilder> {
        let shared_config = aws_config::load_from_env().await;
        let mut builder = S3ConfigBuilder::from(&shared_config);

        if let Some(credentials) = &config.credentials {
            builder = builder.credentials_provider(Credentials::new(
                &credentials.access_key_id,
                &credentials.secret_access_key,
                None,
                None,
                "s3",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(builder)
    }

    fn get_key(&self, name: &str) -> String {
        object_key(&self.config, name)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn upload_file(
        &self,
        name: String,
        mut stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()> {
        let key = self.get_key(&name);

        let first_part = read_chunk_async(&mut stream, BytesMut::with_capacity(PART_SIZE))
            .await
            .map_err(ServerError::storage_error)?;

        if first_part.len() < PART_SIZE {
            let put_object = self
                .client
                .put_object()
                .bucket(&self.config.bucket)
                .key(&key)
                .body(first_part.into())
                .send()
                .await
                .map_err(ServerError::storage_error)?;

            tracing::debug!("put_object -> {:#?}", put_object);

            return Ok(());
        }

        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        let upload_id = multipart
            .upload_id()
            .ok_or_else(|| ServerError::StorageError(anyhow::anyhow!("S3 returned no upload ID")))?
            .to_owned();

        let abort = Finally::new({
            let client = self.client.clone();
            let bucket = self.config.bucket.clone();
            let key = key.clone();
            let upload_id = upload_id.clone();

            async move {
                tracing::warn!("Upload of {} was interrupted, aborting multipart upload", key);

                let r = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await;

                if let Err(e) = r {
                    tracing::warn!("Failed to abort multipart upload: {}", e);
                }
            }
        });

        let mut parts = Vec::new();
        let mut next_part = Some(first_part);
        let mut part_number = 1;

        loop {
            let part = match next_part.take() {
                Some(part) => part,
                None => read_chunk_async(&mut stream, BytesMut::with_capacity(PART_SIZE))
                    .await
                    .map_err(ServerError::storage_error)?,
            };

            if part.is_empty() {
                break;
            }

            let upload = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(part.into())
                .send();

            parts.push(tokio::task::spawn(upload));
            part_number += 1;
        }

        let mut completed_parts = Vec::with_capacity(parts.len());
        for (idx, joined) in join_all(parts).await.into_iter().enumerate() {
            let part = joined
                .map_err(ServerError::storage_error)?
                .map_err(ServerError::storage_error)?;

            completed_parts.push(
                CompletedPart::builder()
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .part_number(idx as i32 + 1)
                    .build(),
            );
        }

        let completion = self
            .client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        tracing::debug!("complete_multipart_upload -> {:#?}", completion);

        abort.cancel();

        Ok(())
    }

    async fn upload_file_exclusive(
        &self,
        name: String,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<bool> {
        // Only used for chunks, which are bounded by the chunk size
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .await
            .map_err(ServerError::storage_error)?;

        let put_object = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(self.get_key(&name))
            .if_none_match("*")
            .body(ByteStream::from(buf))
            .send()
            .await;

        match put_object {
            Ok(output) => {
                tracing::debug!("put_object -> {:#?}", output);
                Ok(true)
            }
            Err(e) => {
                let status = e.raw_response().map(|r| r.status().as_u16());
                if status == Some(PRECONDITION_FAILED) {
                    return Ok(false);
                }

                Err(ServerError::storage_error(e))
            }
        }
    }

    async fn delete_file(&self, name: String) -> ServerResult<()> {
        let deletion = self
            .client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(self.get_key(&name))
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        tracing::debug!("delete_file -> {:#?}", deletion);

        Ok(())
    }

    async fn download_file(&self, name: String) -> ServerResult<ObjectStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(self.get_key(&name))
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Box::new(output.body.into_async_read()))
    }

    async fn file_exists(&self, name: String) -> ServerResult<bool> {
        let head = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(self.get_key(&name))
            .send()
            .await;

        match head {
            Ok(_) => Ok(true),
            Err(e) => {
                if let Some(service_error) = e.as_service_error() {
                    if service_error.is_not_found() {
                        return Ok(false);
                    }
                }

                Err(ServerError::storage_error(e))
            }
        }
    }

    async fn access_url(&self, name: String) -> ServerResult<AccessUrl> {
        if self.config.enable_signed {
            let presign_config =
                PresigningConfig::expires_in(PRESIGN_EXPIRY).map_err(ServerError::storage_error)?;

            let presigned = self
                .client
                .get_object()
                .bucket(&self.config.bucket)
                .key(self.get_key(&name))
                .presigned(presign_config)
                .await
                .map_err(ServerError::storage_error)?;

            return Ok(AccessUrl::Presigned(presigned.uri().to_string()));
        }

        Ok(AccessUrl::Redirect(public_url(&self.config, &self.get_key(&name))))
    }
}

fn object_key(config: &S3StorageConfig, name: &str) -> String {
    match &config.prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix.trim_end_matches('/'), name),
        _ => name.to_owned(),
    }
}

/// Returns the unsigned URL of an object.
fn public_url(config: &S3StorageConfig, key: &str) -> String {
    if let Some(base) = &config.access_base_url {
        format!("{}/{}", base.trim_end_matches('/'), key)
    } else if let Some(endpoint) = &config.endpoint {
        format!("{}/{}/{}", endpoint.trim_end_matches('/'), config.bucket, key)
    } else {
        format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            config.bucket, config.region, key
        )
    }
}
