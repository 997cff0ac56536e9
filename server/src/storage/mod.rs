//! Object storage destinations.
//!
//! Every attachment's bytes live in exactly one destination at a time,
//! identified by its index in the configuration. Boosted attachments
//! have additional copies in boost destinations.

mod local;
mod s3;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{DestinationConfig, TEMPORARY_DESTINATION};
use crate::error::{ServerError, ServerResult};

pub use self::local::{LocalBackend, LocalStorageConfig};
pub use self::s3::{S3Backend, S3CredentialsConfig, S3StorageConfig};

/// A stream of the contents of an object.
pub type ObjectStream = Box<dyn AsyncRead + Unpin + Send>;

/// A location clients can fetch an object from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessUrl {
    /// A path on the local filesystem.
    Path(PathBuf),

    /// A public URL.
    Redirect(String),

    /// A time-limited signed URL.
    Presigned(String),
}

/// A storage backend.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Uploads a file.
    ///
    /// The file only becomes visible under its name once it is
    /// completely written.
    async fn upload_file(
        &self,
        name: String,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()>;

    /// Uploads a file unless one with the same name exists.
    ///
    /// Returns false without touching the existing file if the name is
    /// taken. Of several concurrent uploads to the same name, exactly
    /// one succeeds.
    async fn upload_file_exclusive(
        &self,
        name: String,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<bool>;

    /// Deletes a file.
    ///
    /// Deleting a file that does not exist is not an error.
    async fn delete_file(&self, name: String) -> ServerResult<()>;

    /// Downloads a file as a stream.
    async fn download_file(&self, name: String) -> ServerResult<ObjectStream>;

    /// Returns whether a file exists.
    async fn file_exists(&self, name: String) -> ServerResult<bool>;

    /// Returns a location clients can fetch a file from.
    async fn access_url(&self, name: String) -> ServerResult<AccessUrl>;

    /// Returns the path of a file if it's directly accessible on the local filesystem.
    fn local_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

/// A configured destination.
#[derive(Debug, Clone)]
pub struct Destination {
    /// Position in the configuration.
    pub index: usize,

    /// The configuration.
    pub config: DestinationConfig,

    /// The backend.
    pub backend: Arc<dyn StorageBackend>,
}

/// All configured destinations.
#[derive(Debug)]
pub struct DestinationRegistry {
    destinations: Vec<Destination>,
    regions: HashMap<String, usize>,
}

impl DestinationRegistry {
    /// Connects to all configured destinations.
    pub async fn new(configs: &[DestinationConfig]) -> ServerResult<Self> {
        let mut destinations = Vec::with_capacity(configs.len());

        for (index, config) in configs.iter().enumerate() {
            let backend: Arc<dyn StorageBackend> = match config {
                DestinationConfig::Local(local_config) => {
                    Arc::new(LocalBackend::new(local_config.clone()).await?)
                }
                DestinationConfig::S3(s3_config) => {
                    Arc::new(S3Backend::new(s3_config.clone()).await?)
                }
            };

            destinations.push(Destination {
                index,
                config: config.clone(),
                backend,
            });
        }

        Ok(Self::from_destinations(destinations))
    }

    fn from_destinations(destinations: Vec<Destination>) -> Self {
        let mut regions = HashMap::new();
        for destination in destinations.iter() {
            if let Some(region) = destination.config.region() {
                regions.entry(region.to_owned()).or_insert(destination.index);
            }
        }

        Self {
            destinations,
            regions,
        }
    }

    /// Returns a destination by index.
    pub fn get(&self, index: usize) -> ServerResult<&Destination> {
        self.destinations
            .get(index)
            .ok_or(ServerError::InvalidDestination { index })
    }

    /// Returns the first destination tagged with a region.
    pub fn by_region(&self, region: &str) -> Option<&Destination> {
        self.regions
            .get(region)
            .and_then(|index| self.destinations.get(*index))
    }

    /// Returns the temporary destination.
    pub fn temporary(&self) -> &Destination {
        // Configurations with fewer than two destinations are rejected on load
        &self.destinations[TEMPORARY_DESTINATION]
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

/// Returns the object name of a chunk of a fragment.
pub fn chunk_object_name(uuid: &str, chunk_id: &str) -> String {
    format!("{}.part{}", uuid, chunk_id)
}

/// Reads an entire object into memory.
pub async fn read_object(backend: &dyn StorageBackend, name: String) -> ServerResult<Bytes> {
    let mut stream = backend.download_file(name).await?;

    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .await
        .map_err(ServerError::storage_error)?;

    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn local(dir: &TempDir, name: &str, extra: &str) -> DestinationConfig {
        let path = dir.path().join(name);
        let s = format!(
            "type = \"local\"\npath = {:?}\n{}",
            path.to_str().unwrap(),
            extra
        );
        toml::from_str(&s).unwrap()
    }

    #[tokio::test]
    async fn test_registry() {
        let dir = tempfile::tempdir().unwrap();
        let configs = vec![
            local(&dir, "temporary", ""),
            local(&dir, "permanent", "region = \"eu\""),
            local(&dir, "boost-us", "region = \"us\"\nis-boost = true"),
            local(&dir, "boost-us-2", "region = \"us\"\nis-boost = true"),
        ];

        let registry = DestinationRegistry::new(&configs).await.unwrap();
        assert_eq!(4, registry.len());
        assert_eq!(0, registry.temporary().index);
        assert_eq!(1, registry.by_region("eu").unwrap().index);
        assert_eq!(2, registry.by_region("us").unwrap().index);
        assert!(registry.by_region("ap").is_none());
        assert!(registry.get(2).unwrap().config.is_boost());

        assert!(matches!(
            registry.get(9),
            Err(ServerError::InvalidDestination { index: 9 })
        ));
    }

    #[test]
    fn test_chunk_object_name() {
        assert_eq!("abc.partXYZ", chunk_object_name("abc", "XYZ"));
    }
}
